use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::collaborators::{FrameTranscoder, FrameTransform, MediaFetcher, TransformOutcome};
use crate::config::{AppConfig, StylizeConfig};
use crate::error::StageError;
use crate::job::{JobRecord, Stage, StageOutputs};
use crate::session::SessionStore;
use crate::workspace::WorkspaceManager;

/// Fan-out policy for the per-frame stylize work.
#[derive(Debug, Clone, Copy)]
pub struct StylizePolicy {
    pub workers: usize,
    pub max_attempts: usize,
    pub base_backoff: Duration,
}

impl From<&StylizeConfig> for StylizePolicy {
    fn from(cfg: &StylizeConfig) -> Self {
        Self {
            workers: cfg.effective_workers(),
            max_attempts: cfg.effective_max_attempts(),
            base_backoff: Duration::from_millis(cfg.retry_backoff_ms),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadSummary {
    pub video_id: String,
    pub file_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ExtractSummary {
    pub frames_count: u64,
    pub frames_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct StylizeSummary {
    pub frames_count: u64,
    pub styled_frames_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ReassembleSummary {
    pub final_path: PathBuf,
}

/// Drives jobs through the four stages. Holds the session registry, the
/// workspace manager, and the external collaborators behind their seams.
///
/// Every stage follows the same template: look the job up, take its lock
/// for the whole operation, verify the state machine allows the stage,
/// invoke the collaborator under the stage deadline, and commit the
/// outcome. Failure records `last_error` and never advances state.
pub struct Pipeline {
    sessions: SessionStore,
    workspaces: WorkspaceManager,
    fetcher: Arc<dyn MediaFetcher>,
    transcoder: Arc<dyn FrameTranscoder>,
    transform: Arc<dyn FrameTransform>,
    stage_timeout: Duration,
    stylize_policy: StylizePolicy,
}

impl Pipeline {
    pub fn new(
        workspaces: WorkspaceManager,
        fetcher: Arc<dyn MediaFetcher>,
        transcoder: Arc<dyn FrameTranscoder>,
        transform: Arc<dyn FrameTransform>,
        config: &AppConfig,
    ) -> Self {
        Self {
            sessions: SessionStore::new(),
            workspaces,
            fetcher,
            transcoder,
            transform,
            stage_timeout: Duration::from_secs(config.stages.timeout_secs),
            stylize_policy: StylizePolicy::from(&config.stylize),
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// Begins a job: allocates a workspace, registers the record, and runs
    /// the fetch collaborator. On fetch failure the record stays in
    /// `created` with `last_error` set so the failure is inspectable until
    /// the sweeper reclaims it.
    pub async fn download(&self, source_url: Url) -> Result<DownloadSummary, StageError> {
        let id = Uuid::new_v4().to_string();
        let workspace = self.workspaces.allocate(&id)?;
        let entry = self.sessions.insert(JobRecord::new(id.clone(), workspace));

        let mut job = entry.lock().await;
        job.ensure_stage(Stage::Download)?;

        let dest = job.workspace.source_media_path();
        info!(job_id = %id, "Starting download stage");

        let fetch = self.fetcher.fetch(&source_url, &dest);
        match self.with_deadline(fetch).await {
            Ok(()) => {
                self.ensure_still_registered(&id)?;
                job.commit_success(
                    Stage::Download,
                    StageOutputs {
                        source_media_path: Some(dest.clone()),
                        ..Default::default()
                    },
                );
                info!(job_id = %id, path = %dest.display(), "Download stage completed");
                Ok(DownloadSummary {
                    video_id: id,
                    file_path: dest,
                })
            }
            Err(err) => {
                job.commit_failure(Stage::Download, &err);
                error!(job_id = %id, error = %err, "Download stage failed");
                Err(err)
            }
        }
    }

    /// Extracts every frame of the downloaded media. Requires `downloaded`.
    pub async fn extract(&self, id: &str) -> Result<ExtractSummary, StageError> {
        let entry = self.lookup(id)?;
        let mut job = entry.lock().await;
        job.ensure_stage(Stage::Extract)?;

        let media = job.workspace.source_media_path();
        let pattern = job.workspace.frame_pattern();
        let frames_dir = job.workspace.frames_dir.clone();
        info!(job_id = %id, "Starting extract stage");

        let extract = self.transcoder.extract_frames(&media, &pattern);
        match self.with_deadline(extract).await {
            Ok(frames_count) => {
                self.ensure_still_registered(id)?;
                job.commit_success(
                    Stage::Extract,
                    StageOutputs {
                        raw_frames_dir: Some(frames_dir.clone()),
                        frame_count: Some(frames_count),
                        ..Default::default()
                    },
                );
                info!(job_id = %id, frames_count, "Extract stage completed");
                Ok(ExtractSummary {
                    frames_count,
                    frames_dir,
                })
            }
            Err(err) => {
                job.commit_failure(Stage::Extract, &err);
                error!(job_id = %id, error = %err, "Extract stage failed");
                Err(err)
            }
        }
    }

    /// Stylizes every extracted frame through the transform collaborator.
    /// Requires `frames_extracted`. The transition fires only after every
    /// frame reached a terminal outcome; any frame that exhausts its
    /// retries fails the whole stage, leaving partial outputs on disk for
    /// inspection (a retried stage overwrites them).
    pub async fn stylize(&self, id: &str) -> Result<StylizeSummary, StageError> {
        let entry = self.lookup(id)?;
        let mut job = entry.lock().await;
        job.ensure_stage(Stage::Stylize)?;

        let frames_dir = job.workspace.frames_dir.clone();
        let styled_dir = job.workspace.styled_frames_dir.clone();
        info!(job_id = %id, "Starting stylize stage");

        // The frame list is fixed here, before any transform is dispatched.
        let frames = match list_frame_files(&frames_dir) {
            Ok(frames) => frames,
            Err(err) => {
                let err = StageError::Collaborator(format!("{err:#}"));
                job.commit_failure(Stage::Stylize, &err);
                error!(job_id = %id, error = %err, "Stylize stage failed");
                return Err(err);
            }
        };
        if frames.is_empty() {
            return Err(StageError::NoFrames {
                job_id: id.to_string(),
            });
        }

        let fan_out = stylize_all_frames(
            self.transform.clone(),
            frames,
            frames_dir,
            styled_dir.clone(),
            self.stylize_policy,
        );
        match self.with_deadline(fan_out).await {
            Ok(frames_count) => {
                self.ensure_still_registered(id)?;
                job.commit_success(
                    Stage::Stylize,
                    StageOutputs {
                        styled_frames_dir: Some(styled_dir.clone()),
                        frame_count: Some(frames_count),
                        ..Default::default()
                    },
                );
                info!(job_id = %id, frames_count, "Stylize stage completed");
                Ok(StylizeSummary {
                    frames_count,
                    styled_frames_dir: styled_dir,
                })
            }
            Err(err) => {
                job.commit_failure(Stage::Stylize, &err);
                error!(job_id = %id, error = %err, "Stylize stage failed");
                Err(err)
            }
        }
    }

    /// Reassembles stylized frames into the final video at the source's
    /// frame rate (fallback 24). Requires `frames_stylized`.
    pub async fn reassemble(&self, id: &str) -> Result<ReassembleSummary, StageError> {
        let entry = self.lookup(id)?;
        let mut job = entry.lock().await;
        job.ensure_stage(Stage::Reassemble)?;

        let media = job.workspace.source_media_path();
        let pattern = job.workspace.styled_frame_pattern();
        let output = job.workspace.final_media_path();
        info!(job_id = %id, "Starting reassemble stage");

        // The probe shares the stage deadline with the encode: a hung
        // ffprobe must not hold the per-job lock past the timeout.
        let encode = async {
            let frame_rate = self.transcoder.probe_frame_rate(&media).await;
            self.transcoder
                .reassemble(&pattern, frame_rate, &output)
                .await?;
            Ok(frame_rate)
        };
        match self.with_deadline(encode).await {
            Ok(frame_rate) => {
                self.ensure_still_registered(id)?;
                job.commit_success(
                    Stage::Reassemble,
                    StageOutputs {
                        final_media_path: Some(output.clone()),
                        ..Default::default()
                    },
                );
                info!(job_id = %id, frame_rate, path = %output.display(), "Reassemble stage completed");
                Ok(ReassembleSummary { final_path: output })
            }
            Err(err) => {
                job.commit_failure(Stage::Reassemble, &err);
                error!(job_id = %id, error = %err, "Reassemble stage failed");
                Err(err)
            }
        }
    }

    /// Path of the final artifact, for streaming. Requires `completed`.
    pub async fn artifact(&self, id: &str) -> Result<PathBuf, StageError> {
        let entry = self.lookup(id)?;
        let job = entry.lock().await;
        job.ensure_completed().cloned()
    }

    /// Evicts the session entry and reclaims the workspace. Idempotent.
    pub fn dispose(&self, id: &str) {
        self.sessions.remove(id);
        self.workspaces.dispose(id);
    }

    /// One sweep pass: reclaims workspaces older than `max_age` and evicts
    /// their session entries. Returns the swept ids.
    pub fn sweep_once(&self, max_age: Duration) -> Vec<String> {
        let swept = self.workspaces.sweep_older_than(max_age);
        for id in &swept {
            self.sessions.remove(id);
        }
        swept
    }

    fn lookup(&self, id: &str) -> Result<Arc<tokio::sync::Mutex<JobRecord>>, StageError> {
        self.sessions
            .get(id)
            .ok_or_else(|| StageError::NotFound(id.to_string()))
    }

    /// A sweep may dispose a job while its stage is in flight; the commit
    /// must then surface `NotFound` instead of resurrecting the record.
    fn ensure_still_registered(&self, id: &str) -> Result<(), StageError> {
        if self.sessions.contains(id) {
            Ok(())
        } else {
            Err(StageError::NotFound(id.to_string()))
        }
    }

    async fn with_deadline<T>(
        &self,
        operation: impl Future<Output = anyhow::Result<T>>,
    ) -> Result<T, StageError> {
        match tokio::time::timeout(self.stage_timeout, operation).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(StageError::Collaborator(format!("{err:#}"))),
            Err(_) => Err(StageError::Timeout {
                secs: self.stage_timeout.as_secs(),
            }),
        }
    }
}

/// Periodically sweeps stale workspaces and evicts their sessions.
/// Runs until the process exits.
pub async fn run_sweeper(pipeline: Arc<Pipeline>, interval: Duration, max_age: Duration) {
    // `tokio::time::interval` panics on a zero period; a misconfigured
    // interval must not kill the cleanup task.
    let interval = interval.max(Duration::from_secs(1));
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so a restart doesn't race
    // jobs created moments before.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let swept = pipeline.sweep_once(max_age);
        if !swept.is_empty() {
            info!(count = swept.len(), "Sweeper reclaimed stale jobs");
        }
    }
}

/// Runs the bounded per-frame fan-out over a frame list the caller fixed
/// before any transform call is issued; each frame retries independently
/// and the function only returns once every frame reached a terminal
/// outcome.
async fn stylize_all_frames(
    transform: Arc<dyn FrameTransform>,
    frames: Vec<String>,
    frames_dir: PathBuf,
    styled_dir: PathBuf,
    policy: StylizePolicy,
) -> anyhow::Result<u64> {
    let total = frames.len() as u64;
    let semaphore = Arc::new(Semaphore::new(policy.workers));
    let mut tasks = JoinSet::new();

    for name in frames {
        let transform = transform.clone();
        let semaphore = semaphore.clone();
        let input = frames_dir.join(&name);
        let output = styled_dir.join(&name);

        tasks.spawn(async move {
            let result = match semaphore.acquire_owned().await {
                Ok(_permit) => {
                    stylize_one_frame(transform.as_ref(), &input, &output, policy).await
                }
                Err(err) => Err(anyhow!("stylize scheduler closed: {err}")),
            };
            (name, result)
        });
    }

    let mut failed = 0u64;
    let mut first_failure: Option<(String, anyhow::Error)> = None;

    while let Some(joined) = tasks.join_next().await {
        let (name, result) = joined.context("stylize worker panicked")?;
        if let Err(err) = result {
            warn!(frame = %name, error = %format!("{err:#}"), "Frame stylization failed");
            failed += 1;
            if first_failure.is_none() {
                first_failure = Some((name, err));
            }
        }
    }

    if let Some((name, err)) = first_failure {
        return Err(anyhow!(
            "{failed} of {total} frames failed to stylize; first failure ({name}): {err:#}"
        ));
    }

    Ok(total)
}

/// One frame's terminal outcome: bounded attempts with exponential or
/// server-directed backoff between them.
async fn stylize_one_frame(
    transform: &dyn FrameTransform,
    input: &std::path::Path,
    output: &std::path::Path,
    policy: StylizePolicy,
) -> anyhow::Result<()> {
    let frame = tokio::fs::read(input)
        .await
        .with_context(|| format!("failed to read frame: {}", input.display()))?;

    let mut last_failure: Option<anyhow::Error> = None;

    for attempt in 1..=policy.max_attempts {
        match transform.transform(&frame).await {
            Ok(TransformOutcome::Styled(bytes)) => {
                tokio::fs::write(output, bytes)
                    .await
                    .with_context(|| format!("failed to write styled frame: {}", output.display()))?;
                return Ok(());
            }
            Ok(TransformOutcome::RateLimited { retry_after }) => {
                last_failure = Some(anyhow!(
                    "rate-limited by transform service ({} attempts)",
                    policy.max_attempts
                ));
                if attempt < policy.max_attempts {
                    let wait = retry_after.unwrap_or_else(|| backoff_for_attempt(policy, attempt));
                    tokio::time::sleep(wait).await;
                }
            }
            Err(err) => {
                last_failure = Some(err);
                if attempt < policy.max_attempts {
                    tokio::time::sleep(backoff_for_attempt(policy, attempt)).await;
                }
            }
        }
    }

    Err(last_failure.unwrap_or_else(|| anyhow!("transform produced no outcome")))
}

fn backoff_for_attempt(policy: StylizePolicy, attempt: usize) -> Duration {
    let exponent = attempt.saturating_sub(1).min(8) as u32;
    policy.base_backoff.saturating_mul(1u32 << exponent)
}

/// The stable, sorted list of frame files a stylize pass will process.
fn list_frame_files(dir: &std::path::Path) -> anyhow::Result<Vec<String>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read frames directory: {}", dir.display()))?;

    let mut frames: Vec<String> = entries
        .flatten()
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.starts_with("frame-") && name.ends_with(".png"))
        .collect();
    frames.sort();

    Ok(frames)
}
