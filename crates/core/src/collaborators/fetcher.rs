use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;
use url::Url;

/// Fetches the raw source media for a job into its workspace.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(&self, source_url: &Url, dest: &Path) -> Result<()>;
}

const STDERR_TAIL_LINES: usize = 20;

/// Downloads via the `yt-dlp` binary. Arguments follow the established
/// invocation: single mp4, no playlists, sanitized filenames.
#[derive(Debug, Default)]
pub struct YtDlpFetcher;

impl YtDlpFetcher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaFetcher for YtDlpFetcher {
    async fn fetch(&self, source_url: &Url, dest: &Path) -> Result<()> {
        let mut child = Command::new("yt-dlp")
            .arg(source_url.as_str())
            .arg("-o")
            .arg(dest)
            .args([
                "--format",
                "mp4",
                "--restrict-filenames",
                "--no-playlist",
                "--no-overwrites",
            ])
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to launch yt-dlp — is it installed?")?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("yt-dlp stderr not available"))?;

        let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
        let mut lines = BufReader::new(stderr).lines();
        while let Some(line) = lines.next_line().await.unwrap_or(None) {
            debug!(target: "ytdlp_stderr", "{}", line);
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }

        let status = child.wait().await.context("failed to wait for yt-dlp")?;
        if !status.success() {
            bail!(
                "yt-dlp exited with status {}: {}",
                status,
                tail.into_iter().collect::<Vec<_>>().join(" | ")
            );
        }

        if !dest.exists() {
            bail!(
                "yt-dlp reported success but produced no file at {}",
                dest.display()
            );
        }

        Ok(())
    }
}
