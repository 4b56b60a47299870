//! HTTP surface of the pipeline.
//!
//! Each stage is driven by one endpoint; the wire format keeps the
//! original field names (`videoId`, `framesCount`, ...) so existing
//! clients keep working.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tower_http::cors::CorsLayer;
use tracing::warn;
use url::Url;

use crate::error::StageError;
use crate::stages::Pipeline;
use crate::workspace::FINAL_MEDIA_FILE;

#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<Pipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }
}

/// Errors a handler can surface, each carrying its HTTP status.
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    BadGateway(String),
    GatewayTimeout(String),
    Internal(String),
}

impl From<StageError> for AppError {
    fn from(err: StageError) -> Self {
        let message = err.to_string();
        match err {
            StageError::NoFrames { .. } => Self::BadRequest(message),
            StageError::NotFound(_) => Self::NotFound(message),
            StageError::InvalidState { .. } | StageError::NotReady { .. } => {
                Self::Conflict(message)
            }
            StageError::Collaborator(_) | StageError::RateLimited { .. } => {
                Self::BadGateway(message)
            }
            StageError::Timeout { .. } => Self::GatewayTimeout(message),
            StageError::AllocationFailed(_) => Self::Internal(message),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    status: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            Self::NotFound(message) => (StatusCode::NOT_FOUND, message),
            Self::Conflict(message) => (StatusCode::CONFLICT, message),
            Self::BadGateway(message) => (StatusCode::BAD_GATEWAY, message),
            Self::GatewayTimeout(message) => (StatusCode::GATEWAY_TIMEOUT, message),
            Self::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };

        (
            status,
            Json(ErrorBody {
                status: "error",
                message,
            }),
        )
            .into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/download", post(start_download).get(fetch_artifact))
        .route("/extract-frames", post(extract_frames))
        .route("/stylize-frame", post(stylize_frames))
        .route("/reassemble", post(reassemble))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "celshift",
    })
}

#[derive(Deserialize)]
struct DownloadRequest {
    url: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DownloadResponse {
    status: &'static str,
    message: &'static str,
    video_id: String,
    file_path: String,
}

async fn start_download(
    State(state): State<AppState>,
    Json(body): Json<DownloadRequest>,
) -> Result<Json<DownloadResponse>, AppError> {
    let raw = body
        .url
        .filter(|url| !url.trim().is_empty())
        .ok_or_else(|| AppError::BadRequest("Video URL is required".to_string()))?;

    let source_url = parse_source_url(&raw)?;

    let summary = state.pipeline.download(source_url).await?;
    Ok(Json(DownloadResponse {
        status: "success",
        message: "Video downloaded successfully",
        video_id: summary.video_id,
        file_path: summary.file_path.display().to_string(),
    }))
}

fn parse_source_url(raw: &str) -> Result<Url, AppError> {
    let url = Url::parse(raw)
        .map_err(|err| AppError::BadRequest(format!("Invalid video URL: {err}")))?;

    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(AppError::BadRequest(format!(
            "Unsupported URL scheme: {other}"
        ))),
    }
}

#[derive(Deserialize)]
struct JobRequest {
    #[serde(rename = "videoId")]
    video_id: Option<String>,
}

fn require_video_id(body: JobRequest) -> Result<String, AppError> {
    body.video_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| AppError::BadRequest("videoId is required".to_string()))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExtractResponse {
    status: &'static str,
    message: &'static str,
    video_id: String,
    frames_count: u64,
    frames_dir: String,
}

async fn extract_frames(
    State(state): State<AppState>,
    Json(body): Json<JobRequest>,
) -> Result<Json<ExtractResponse>, AppError> {
    let video_id = require_video_id(body)?;
    let summary = state.pipeline.extract(&video_id).await?;

    Ok(Json(ExtractResponse {
        status: "success",
        message: "Frames extracted successfully",
        video_id,
        frames_count: summary.frames_count,
        frames_dir: summary.frames_dir.display().to_string(),
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StylizeResponse {
    status: &'static str,
    message: &'static str,
    video_id: String,
    frames_count: u64,
    styled_frames_dir: String,
}

async fn stylize_frames(
    State(state): State<AppState>,
    Json(body): Json<JobRequest>,
) -> Result<Json<StylizeResponse>, AppError> {
    let video_id = require_video_id(body)?;
    let summary = state.pipeline.stylize(&video_id).await?;

    Ok(Json(StylizeResponse {
        status: "success",
        message: "Frames stylized successfully",
        video_id,
        frames_count: summary.frames_count,
        styled_frames_dir: summary.styled_frames_dir.display().to_string(),
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReassembleResponse {
    status: &'static str,
    message: &'static str,
    video_id: String,
    final_path: String,
    download_url: String,
}

async fn reassemble(
    State(state): State<AppState>,
    Json(body): Json<JobRequest>,
) -> Result<Json<ReassembleResponse>, AppError> {
    let video_id = require_video_id(body)?;
    let summary = state.pipeline.reassemble(&video_id).await?;

    Ok(Json(ReassembleResponse {
        status: "success",
        message: "Video reassembled successfully",
        video_id: video_id.clone(),
        final_path: summary.final_path.display().to_string(),
        download_url: format!("/download?videoId={video_id}"),
    }))
}

#[derive(Deserialize)]
struct ArtifactQuery {
    #[serde(rename = "videoId")]
    video_id: Option<String>,
}

/// Streams the final video. Only available once the job is `completed`.
async fn fetch_artifact(
    State(state): State<AppState>,
    Query(query): Query<ArtifactQuery>,
) -> Result<Response, AppError> {
    let video_id = query
        .video_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| AppError::BadRequest("videoId query parameter is required".to_string()))?;

    let path = state.pipeline.artifact(&video_id).await?;

    let file = tokio::fs::File::open(&path).await.map_err(|err| {
        warn!(video_id = %video_id, path = %path.display(), error = %err, "Final video missing on disk");
        AppError::Internal(format!("final video is not readable: {err}"))
    })?;

    let body = Body::from_stream(ReaderStream::new(file));
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/mp4")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{FINAL_MEDIA_FILE}\""),
        )
        .body(body)
        .map_err(|err| AppError::Internal(format!("failed to build response: {err}")))?;

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{FrameTranscoder, MediaFetcher, PassthroughTransform};
    use crate::config::AppConfig;
    use crate::workspace::WorkspaceManager;
    use async_trait::async_trait;
    use axum::body::to_bytes;
    use axum::http::Request;
    use serde_json::{json, Value};
    use std::path::Path;
    use tower::ServiceExt;

    struct StubFetcher;

    #[async_trait]
    impl MediaFetcher for StubFetcher {
        async fn fetch(&self, _source_url: &Url, dest: &Path) -> anyhow::Result<()> {
            tokio::fs::write(dest, b"synthetic source video").await?;
            Ok(())
        }
    }

    struct FailingFetcher;

    #[async_trait]
    impl MediaFetcher for FailingFetcher {
        async fn fetch(&self, _source_url: &Url, _dest: &Path) -> anyhow::Result<()> {
            anyhow::bail!("yt-dlp exited with status 1: video unavailable")
        }
    }

    struct StubTranscoder {
        frames: u64,
    }

    #[async_trait]
    impl FrameTranscoder for StubTranscoder {
        async fn extract_frames(&self, _media: &Path, pattern: &Path) -> anyhow::Result<u64> {
            let dir = pattern.parent().expect("pattern parent");
            for index in 1..=self.frames {
                let name = format!("frame-{index:04}.png");
                tokio::fs::write(dir.join(name), format!("png-payload-{index}")).await?;
            }
            Ok(self.frames)
        }

        async fn reassemble(
            &self,
            _pattern: &Path,
            _frame_rate: u32,
            output: &Path,
        ) -> anyhow::Result<()> {
            tokio::fs::write(output, b"final video bytes").await?;
            Ok(())
        }

        async fn probe_frame_rate(&self, _media: &Path) -> u32 {
            24
        }
    }

    struct TestApp {
        _temp: tempfile::TempDir,
        router: Router,
    }

    fn app_with(fetcher: Arc<dyn MediaFetcher>, frames: u64) -> TestApp {
        let temp = tempfile::tempdir().expect("tempdir");
        let workspaces = WorkspaceManager::new(temp.path().join("work"));
        std::fs::create_dir_all(workspaces.root()).expect("create work root");

        let mut config = AppConfig::default();
        config.stages.timeout_secs = 5;
        config.stylize.retry_backoff_ms = 1;

        let pipeline = Arc::new(Pipeline::new(
            workspaces,
            fetcher,
            Arc::new(StubTranscoder { frames }),
            Arc::new(PassthroughTransform::new()),
            &config,
        ));
        TestApp {
            _temp: temp,
            router: router(AppState::new(pipeline)),
        }
    }

    fn app_with_fetcher(fetcher: Arc<dyn MediaFetcher>) -> TestApp {
        app_with(fetcher, 4)
    }

    fn test_app() -> TestApp {
        app_with_fetcher(Arc::new(StubFetcher))
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    async fn drive_to(app: &TestApp, uri: &str) -> String {
        let response = app
            .router
            .clone()
            .oneshot(post_json(
                "/download",
                json!({"url": "https://videos.example/watch?v=abc"}),
            ))
            .await
            .expect("download");
        assert_eq!(response.status(), StatusCode::OK);
        let id = body_json(response).await["videoId"]
            .as_str()
            .expect("videoId")
            .to_string();
        if uri == "/download" {
            return id;
        }

        for stage_uri in ["/extract-frames", "/stylize-frame", "/reassemble"] {
            let response = app
                .router
                .clone()
                .oneshot(post_json(stage_uri, json!({"videoId": id})))
                .await
                .expect("stage request");
            assert_eq!(response.status(), StatusCode::OK, "stage {stage_uri}");
            if stage_uri == uri {
                break;
            }
        }
        id
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let app = test_app();
        let response = app
            .router
            .clone()
            .oneshot(Request::get("/").body(Body::empty()).expect("request"))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn download_without_url_is_bad_request() {
        let app = test_app();
        let response = app
            .router
            .clone()
            .oneshot(post_json("/download", json!({})))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["status"], "error");
        assert!(body["message"].as_str().expect("message").contains("URL"));
    }

    #[tokio::test]
    async fn download_rejects_non_http_schemes() {
        let app = test_app();
        let response = app
            .router
            .clone()
            .oneshot(post_json("/download", json!({"url": "ftp://host/video"})))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn failed_download_maps_to_bad_gateway() {
        let app = app_with_fetcher(Arc::new(FailingFetcher));
        let response = app
            .router
            .clone()
            .oneshot(post_json(
                "/download",
                json!({"url": "https://videos.example/watch?v=gone"}),
            ))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(response).await;
        assert_eq!(body["status"], "error");
        assert!(body["message"]
            .as_str()
            .expect("message")
            .contains("video unavailable"));
    }

    #[tokio::test]
    async fn unknown_video_id_is_not_found() {
        let app = test_app();
        let response = app
            .router
            .clone()
            .oneshot(post_json("/extract-frames", json!({"videoId": "missing"})))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stage_body_without_video_id_is_bad_request() {
        let app = test_app();
        let response = app
            .router
            .clone()
            .oneshot(post_json("/extract-frames", json!({})))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn out_of_order_stage_is_conflict() {
        let app = test_app();
        let id = drive_to(&app, "/download").await;

        let response = app
            .router
            .clone()
            .oneshot(post_json("/stylize-frame", json!({"videoId": id})))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = body_json(response).await;
        let message = body["message"].as_str().expect("message");
        // The job must still sit right after the download, not further along.
        assert!(message.contains("current state is downloaded"), "{message}");
        assert!(message.contains("frames_extracted"), "{message}");
    }

    #[tokio::test]
    async fn stylize_with_no_frames_is_bad_request() {
        let app = app_with(Arc::new(StubFetcher), 0);
        let id = drive_to(&app, "/extract-frames").await;

        let response = app
            .router
            .clone()
            .oneshot(post_json("/stylize-frame", json!({"videoId": id})))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["message"]
            .as_str()
            .expect("message")
            .contains("no frames found"));
    }

    #[tokio::test]
    async fn artifact_before_completion_is_conflict() {
        let app = test_app();
        let id = drive_to(&app, "/extract-frames").await;

        let response = app
            .router
            .clone()
            .oneshot(
                Request::get(format!("/download?videoId={id}"))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn artifact_without_video_id_is_bad_request() {
        let app = test_app();
        let response = app
            .router
            .clone()
            .oneshot(
                Request::get("/download")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn full_pipeline_over_http_streams_the_final_video() {
        let app = test_app();
        let id = drive_to(&app, "/reassemble").await;

        let response = app
            .router
            .clone()
            .oneshot(
                Request::get(format!("/download?videoId={id}"))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .expect("content type"),
            "video/mp4"
        );

        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        assert_eq!(bytes.as_ref(), b"final video bytes");
    }

    #[tokio::test]
    async fn stage_responses_carry_original_field_names() {
        let app = test_app();
        let id = drive_to(&app, "/download").await;

        let response = app
            .router
            .clone()
            .oneshot(post_json("/extract-frames", json!({"videoId": id})))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "success");
        assert_eq!(body["framesCount"], 4);
        assert!(body["framesDir"].as_str().expect("framesDir").contains("frames"));

        let response = app
            .router
            .clone()
            .oneshot(post_json("/stylize-frame", json!({"videoId": id})))
            .await
            .expect("response");
        let body = body_json(response).await;
        assert_eq!(body["framesCount"], 4);
        assert!(body["styledFramesDir"]
            .as_str()
            .expect("styledFramesDir")
            .contains("styled-frames"));

        let response = app
            .router
            .clone()
            .oneshot(post_json("/reassemble", json!({"videoId": id})))
            .await
            .expect("response");
        let body = body_json(response).await;
        assert_eq!(
            body["downloadUrl"],
            Value::String(format!("/download?videoId={id}"))
        );
        assert!(body["finalPath"]
            .as_str()
            .expect("finalPath")
            .ends_with("styled-final.mp4"));
    }
}
