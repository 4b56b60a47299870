use std::fmt;

use crate::job::JobState;

/// Everything that can go wrong while driving a job through the pipeline.
///
/// Client-sequencing errors (`NotFound`, `InvalidState`, `NotReady`) are
/// reported without touching the job record. `Collaborator` and `Timeout`
/// are recorded into the record's `last_error` and leave the job retryable
/// at the same stage. `RateLimited` is handled inside the stylize fan-out
/// and only surfaces after retries are exhausted, converted to
/// `Collaborator`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageError {
    /// Unknown job id.
    NotFound(String),
    /// Stage requested out of sequence.
    InvalidState {
        job_id: String,
        current: JobState,
        required: JobState,
    },
    /// Final artifact requested before completion.
    NotReady { job_id: String, current: JobState },
    /// Stylize requested but the frames directory holds no frames.
    NoFrames { job_id: String },
    /// Workspace creation failed.
    AllocationFailed(String),
    /// External tool or service failed, with captured diagnostic text.
    Collaborator(String),
    /// Transient rate-limit signal from the transform service.
    RateLimited { retry_after_ms: Option<u64> },
    /// Collaborator exceeded the stage deadline.
    Timeout { secs: u64 },
}

impl StageError {
    pub fn collaborator(message: impl Into<String>) -> Self {
        Self::Collaborator(message.into())
    }

    /// True for errors caused by client sequencing, which must never
    /// mutate the job record.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_)
                | Self::InvalidState { .. }
                | Self::NotReady { .. }
                | Self::NoFrames { .. }
        )
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "video not found: {id}"),
            Self::InvalidState {
                job_id,
                current,
                required,
            } => write!(
                f,
                "cannot run this stage for {job_id}: current state is {current}, requires {required}"
            ),
            Self::NotReady { job_id, current } => write!(
                f,
                "final video for {job_id} is not ready yet (current state: {current})"
            ),
            Self::NoFrames { job_id } => {
                write!(f, "no frames found to stylize for {job_id}")
            }
            Self::AllocationFailed(message) => {
                write!(f, "failed to allocate workspace: {message}")
            }
            Self::Collaborator(message) => write!(f, "{message}"),
            Self::RateLimited { retry_after_ms } => match retry_after_ms {
                Some(ms) => write!(f, "transform service rate-limited (retry after {ms}ms)"),
                None => write!(f, "transform service rate-limited"),
            },
            Self::Timeout { secs } => write!(f, "stage exceeded the {secs}s deadline"),
        }
    }
}

impl std::error::Error for StageError {}
