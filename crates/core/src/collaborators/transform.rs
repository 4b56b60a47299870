use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use url::Url;

/// Result of one transform attempt on one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformOutcome {
    Styled(Vec<u8>),
    /// Transient rate-limit signal; the caller backs off and retries this
    /// frame without aborting its siblings.
    RateLimited { retry_after: Option<Duration> },
}

/// Stylizes a single frame. Implementations are mutually exclusive
/// renditions of the same contract, selected by `[stylize].backend`.
#[async_trait]
pub trait FrameTransform: Send + Sync {
    async fn transform(&self, frame: &[u8]) -> Result<TransformOutcome>;
}

/// Echoes the frame bytes unchanged. The default backend, and the stub
/// used when wiring the pipeline without a transform service.
#[derive(Debug, Default)]
pub struct PassthroughTransform;

impl PassthroughTransform {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FrameTransform for PassthroughTransform {
    async fn transform(&self, frame: &[u8]) -> Result<TransformOutcome> {
        Ok(TransformOutcome::Styled(frame.to_vec()))
    }
}

const TRANSFORM_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const TRANSFORM_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const ERROR_BODY_SNIPPET_LEN: usize = 200;

/// Posts the PNG bytes to an external image-transform service and returns
/// the stylized bytes. HTTP 429 maps to [`TransformOutcome::RateLimited`],
/// honoring a `Retry-After` header when present.
pub struct HttpTransform {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpTransform {
    pub fn new(endpoint: Url) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(TRANSFORM_CONNECT_TIMEOUT)
            .timeout(TRANSFORM_REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client for frame transform")?;

        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl FrameTransform for HttpTransform {
    async fn transform(&self, frame: &[u8]) -> Result<TransformOutcome> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .header(reqwest::header::CONTENT_TYPE, "image/png")
            .body(frame.to_vec())
            .send()
            .await
            .context("transform request failed")?;

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|raw| raw.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Ok(TransformOutcome::RateLimited { retry_after });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(ERROR_BODY_SNIPPET_LEN).collect();
            bail!(
                "transform service returned HTTP {}: {}",
                status.as_u16(),
                snippet
            );
        }

        let bytes = response
            .bytes()
            .await
            .context("failed to read transform response body")?;

        if bytes.is_empty() {
            bail!("transform service returned an empty body");
        }

        Ok(TransformOutcome::Styled(bytes.to_vec()))
    }
}
