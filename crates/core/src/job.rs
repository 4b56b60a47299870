use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StageError;
use crate::workspace::Workspace;

/// Pipeline position of a job. Strict total order, no cross edges;
/// `Completed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Created,
    Downloaded,
    FramesExtracted,
    FramesStylized,
    Completed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Downloaded => "downloaded",
            Self::FramesExtracted => "frames_extracted",
            Self::FramesStylized => "frames_stylized",
            Self::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// One of the four pipeline steps. Each stage may only run when the job
/// sits exactly at its required predecessor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Download,
    Extract,
    Stylize,
    Reassemble,
}

impl Stage {
    pub fn required_state(self) -> JobState {
        match self {
            Self::Download => JobState::Created,
            Self::Extract => JobState::Downloaded,
            Self::Stylize => JobState::FramesExtracted,
            Self::Reassemble => JobState::FramesStylized,
        }
    }

    pub fn completed_state(self) -> JobState {
        match self {
            Self::Download => JobState::Downloaded,
            Self::Extract => JobState::FramesExtracted,
            Self::Stylize => JobState::FramesStylized,
            Self::Reassemble => JobState::Completed,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Extract => "extract",
            Self::Stylize => "stylize",
            Self::Reassemble => "reassemble",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outputs a stage commits into the record alongside the state advance.
/// Path fields are set at most once; a retried stage recomputes into the
/// same deterministic workspace path.
#[derive(Debug, Default, Clone)]
pub struct StageOutputs {
    pub source_media_path: Option<PathBuf>,
    pub raw_frames_dir: Option<PathBuf>,
    pub styled_frames_dir: Option<PathBuf>,
    pub final_media_path: Option<PathBuf>,
    pub frame_count: Option<u64>,
}

/// One end-to-end pipeline run. Mutated exclusively through
/// [`ensure_stage`](Self::ensure_stage) / [`commit_success`](Self::commit_success) /
/// [`commit_failure`](Self::commit_failure) while the per-job lock is held.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: String,
    pub state: JobState,
    pub workspace: Workspace,
    pub source_media_path: Option<PathBuf>,
    pub raw_frames_dir: Option<PathBuf>,
    pub styled_frames_dir: Option<PathBuf>,
    pub final_media_path: Option<PathBuf>,
    pub frame_count: Option<u64>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(id: String, workspace: Workspace) -> Self {
        let now = Utc::now();
        Self {
            id,
            state: JobState::Created,
            workspace,
            source_media_path: None,
            raw_frames_dir: None,
            styled_frames_dir: None,
            final_media_path: None,
            frame_count: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Checks that `stage` may run right now. Never mutates the record.
    pub fn ensure_stage(&self, stage: Stage) -> Result<(), StageError> {
        let required = stage.required_state();
        if self.state == required {
            Ok(())
        } else {
            Err(StageError::InvalidState {
                job_id: self.id.clone(),
                current: self.state,
                required,
            })
        }
    }

    /// Checks that the final artifact may be served.
    pub fn ensure_completed(&self) -> Result<&PathBuf, StageError> {
        if self.state != JobState::Completed {
            return Err(StageError::NotReady {
                job_id: self.id.clone(),
                current: self.state,
            });
        }
        self.final_media_path.as_ref().ok_or_else(|| {
            StageError::collaborator(format!(
                "job {} is completed but has no final media path",
                self.id
            ))
        })
    }

    /// Advances the state machine exactly one step, records stage outputs,
    /// and clears `last_error`. Path fields are monotonic: once set they
    /// are never rewritten.
    pub fn commit_success(&mut self, stage: Stage, outputs: StageOutputs) {
        debug_assert_eq!(self.state, stage.required_state());

        if self.source_media_path.is_none() {
            self.source_media_path = outputs.source_media_path;
        }
        if self.raw_frames_dir.is_none() {
            self.raw_frames_dir = outputs.raw_frames_dir;
        }
        if self.styled_frames_dir.is_none() {
            self.styled_frames_dir = outputs.styled_frames_dir;
        }
        if self.final_media_path.is_none() {
            self.final_media_path = outputs.final_media_path;
        }
        if let Some(count) = outputs.frame_count {
            self.frame_count = Some(count);
        }

        self.state = stage.completed_state();
        self.last_error = None;
        self.updated_at = Utc::now();
    }

    /// Records a failed attempt. The state never ratchets forward on
    /// failure; the previous error summary is overwritten, not accumulated.
    pub fn commit_failure(&mut self, stage: Stage, error: &StageError) {
        debug_assert!(!error.is_client_error());
        self.last_error = Some(format!("{stage}: {error}"));
        self.updated_at = Utc::now();
    }
}
