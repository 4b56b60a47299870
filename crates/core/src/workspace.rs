use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{info, warn};

use crate::error::StageError;

const SOURCE_MEDIA_FILE: &str = "original_video.mp4";
pub const FINAL_MEDIA_FILE: &str = "styled-final.mp4";
const FRAMES_DIR: &str = "frames";
const STYLED_FRAMES_DIR: &str = "styled-frames";
pub const FRAME_PATTERN: &str = "frame-%04d.png";

/// The exclusively-owned directory tree holding all files for one job.
/// Every path a stage reads or writes is derived from here, never from
/// caller-supplied input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub dir: PathBuf,
    pub frames_dir: PathBuf,
    pub styled_frames_dir: PathBuf,
}

impl Workspace {
    pub fn under_root(root: &Path, id: &str) -> Self {
        let dir = root.join(id);
        Self {
            frames_dir: dir.join(FRAMES_DIR),
            styled_frames_dir: dir.join(STYLED_FRAMES_DIR),
            dir,
        }
    }

    pub fn source_media_path(&self) -> PathBuf {
        self.dir.join(SOURCE_MEDIA_FILE)
    }

    pub fn final_media_path(&self) -> PathBuf {
        self.dir.join(FINAL_MEDIA_FILE)
    }

    /// ffmpeg-style sequence pattern for extracted frames.
    pub fn frame_pattern(&self) -> PathBuf {
        self.frames_dir.join(FRAME_PATTERN)
    }

    /// ffmpeg-style sequence pattern for stylized frames.
    pub fn styled_frame_pattern(&self) -> PathBuf {
        self.styled_frames_dir.join(FRAME_PATTERN)
    }
}

/// Allocates and reclaims per-job workspace trees under one root.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the workspace tree (root + frame subdirectories) for a job.
    pub fn allocate(&self, id: &str) -> Result<Workspace, StageError> {
        let workspace = Workspace::under_root(&self.root, id);

        for dir in [
            &workspace.dir,
            &workspace.frames_dir,
            &workspace.styled_frames_dir,
        ] {
            fs::create_dir_all(dir).map_err(|err| {
                StageError::AllocationFailed(format!("{}: {err}", dir.display()))
            })?;
        }

        Ok(workspace)
    }

    /// Recursively removes a job's workspace. Safe to call on an id that
    /// was never allocated or is already disposed.
    pub fn dispose(&self, id: &str) {
        let dir = self.root.join(id);
        if !dir.exists() {
            return;
        }

        match fs::remove_dir_all(&dir) {
            Ok(()) => info!(job_id = %id, dir = %dir.display(), "Workspace disposed"),
            Err(err) => {
                warn!(job_id = %id, dir = %dir.display(), error = %err, "Failed to dispose workspace")
            }
        }
    }

    /// Removes workspaces whose last modification is older than `max_age`
    /// and returns the ids that were swept. Tolerates entries vanishing
    /// underneath it (an in-flight dispose is an accepted race).
    pub fn sweep_older_than(&self, max_age: Duration) -> Vec<String> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(root = %self.root.display(), error = %err, "Failed to read workspace root for sweep");
                return Vec::new();
            }
        };

        let now = SystemTime::now();
        let mut swept = Vec::new();

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }

            let Some(id) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };

            let modified = match entry.metadata().and_then(|meta| meta.modified()) {
                Ok(modified) => modified,
                Err(err) => {
                    warn!(dir = %path.display(), error = %err, "Failed to stat workspace during sweep");
                    continue;
                }
            };

            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
            if age <= max_age {
                continue;
            }

            match fs::remove_dir_all(&path) {
                Ok(()) => {
                    info!(job_id = %id, age_secs = age.as_secs(), "Swept stale workspace");
                    swept.push(id.to_string());
                }
                Err(err) => {
                    warn!(job_id = %id, error = %err, "Failed to sweep stale workspace")
                }
            }
        }

        swept
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (tempfile::TempDir, WorkspaceManager) {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = WorkspaceManager::new(temp.path().join("work"));
        fs::create_dir_all(manager.root()).expect("create work root");
        (temp, manager)
    }

    #[test]
    fn allocate_creates_full_tree() {
        let (_temp, manager) = manager();
        let workspace = manager.allocate("job-a").expect("allocate");

        assert!(workspace.dir.is_dir());
        assert!(workspace.frames_dir.is_dir());
        assert!(workspace.styled_frames_dir.is_dir());
        assert_eq!(
            workspace.source_media_path(),
            workspace.dir.join("original_video.mp4")
        );
        assert!(workspace
            .frame_pattern()
            .to_string_lossy()
            .ends_with("frame-%04d.png"));
    }

    #[test]
    fn workspaces_are_disjoint_per_job() {
        let (_temp, manager) = manager();
        let a = manager.allocate("job-a").expect("allocate a");
        let b = manager.allocate("job-b").expect("allocate b");

        assert_ne!(a.dir, b.dir);
        assert!(!a.dir.starts_with(&b.dir));
        assert!(!b.dir.starts_with(&a.dir));
    }

    #[test]
    fn dispose_removes_tree_and_is_idempotent() {
        let (_temp, manager) = manager();
        let workspace = manager.allocate("job-a").expect("allocate");
        fs::write(workspace.frames_dir.join("frame-0001.png"), b"png").expect("write frame");

        manager.dispose("job-a");
        assert!(!workspace.dir.exists());

        // Second dispose is a no-op, not an error.
        manager.dispose("job-a");
        manager.dispose("never-allocated");
    }

    #[test]
    fn sweep_removes_only_stale_workspaces() {
        let (_temp, manager) = manager();
        manager.allocate("fresh").expect("allocate fresh");
        manager.allocate("stale").expect("allocate stale");

        // Everything was just created, so a zero-tolerance sweep with a large
        // threshold removes nothing.
        let swept = manager.sweep_older_than(Duration::from_secs(3600));
        assert!(swept.is_empty());

        // A max_age of zero makes both eligible.
        std::thread::sleep(Duration::from_millis(20));
        let mut swept = manager.sweep_older_than(Duration::ZERO);
        swept.sort();
        assert_eq!(swept, vec!["fresh".to_string(), "stale".to_string()]);
        assert!(!manager.root().join("stale").exists());
    }
}
