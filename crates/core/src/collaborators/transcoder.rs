use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

/// Used when the source's frame rate cannot be probed.
pub const DEFAULT_FRAME_RATE: u32 = 24;

const STDERR_TAIL_LINES: usize = 20;

/// Splits media into frame files and reassembles frame files into media.
#[async_trait]
pub trait FrameTranscoder: Send + Sync {
    /// Extracts every frame of `media` into files matching `pattern`
    /// (an ffmpeg `%04d` sequence pattern). Returns the frame count.
    async fn extract_frames(&self, media: &Path, pattern: &Path) -> Result<u64>;

    /// Encodes the frame sequence matching `pattern` into `output` at the
    /// given frame rate.
    async fn reassemble(&self, pattern: &Path, frame_rate: u32, output: &Path) -> Result<()>;

    /// Probes the frame rate of `media`, falling back to
    /// [`DEFAULT_FRAME_RATE`] when it cannot be determined.
    async fn probe_frame_rate(&self, media: &Path) -> u32;
}

/// Backs the transcoder contract with the `ffmpeg`/`ffprobe` binaries.
#[derive(Debug, Default)]
pub struct FfmpegTranscoder;

impl FfmpegTranscoder {
    pub fn new() -> Self {
        Self
    }

    async fn run_ffmpeg(&self, args: Vec<String>) -> Result<()> {
        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to launch ffmpeg — is it installed?")?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("ffmpeg stderr not available"))?;

        let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
        let mut lines = BufReader::new(stderr).lines();
        while let Some(line) = lines.next_line().await.unwrap_or(None) {
            debug!(target: "ffmpeg_stderr", "{}", line);
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }

        let status = child.wait().await.context("failed to wait for ffmpeg")?;
        if !status.success() {
            bail!(
                "ffmpeg exited with status {}: {}",
                status,
                tail.into_iter().collect::<Vec<_>>().join(" | ")
            );
        }

        Ok(())
    }
}

#[async_trait]
impl FrameTranscoder for FfmpegTranscoder {
    async fn extract_frames(&self, media: &Path, pattern: &Path) -> Result<u64> {
        if !media.exists() {
            bail!("input media does not exist: {}", media.display());
        }

        self.run_ffmpeg(vec![
            "-y".to_string(),
            "-i".to_string(),
            media.display().to_string(),
            "-vsync".to_string(),
            "0".to_string(),
            "-q:v".to_string(),
            "2".to_string(),
            pattern.display().to_string(),
        ])
        .await?;

        let frames_dir = pattern
            .parent()
            .ok_or_else(|| anyhow!("frame pattern has no parent directory"))?;
        count_frame_files(frames_dir)
    }

    async fn reassemble(&self, pattern: &Path, frame_rate: u32, output: &Path) -> Result<()> {
        self.run_ffmpeg(vec![
            "-y".to_string(),
            "-framerate".to_string(),
            frame_rate.to_string(),
            "-i".to_string(),
            pattern.display().to_string(),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
            "-crf".to_string(),
            "23".to_string(),
            "-preset".to_string(),
            "medium".to_string(),
            output.display().to_string(),
        ])
        .await?;

        if !output.exists() {
            bail!(
                "ffmpeg reported success but produced no file at {}",
                output.display()
            );
        }

        Ok(())
    }

    async fn probe_frame_rate(&self, media: &Path) -> u32 {
        match run_ffprobe_frame_rate(media).await {
            Ok(rate) => rate,
            Err(err) => {
                warn!(
                    media = %media.display(),
                    error = %err,
                    fallback = DEFAULT_FRAME_RATE,
                    "Failed to probe frame rate; using fallback"
                );
                DEFAULT_FRAME_RATE
            }
        }
    }
}

/// Counts `frame-*.png` files produced by an extraction pass.
pub fn count_frame_files(dir: &Path) -> Result<u64> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read frames directory: {}", dir.display()))?;

    let count = entries
        .flatten()
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with("frame-") && name.ends_with(".png"))
        })
        .count() as u64;

    Ok(count)
}

#[derive(Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Deserialize)]
struct FfprobeStream {
    r_frame_rate: Option<String>,
}

async fn run_ffprobe_frame_rate(media: &Path) -> Result<u32> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=r_frame_rate",
            "-of",
            "json",
        ])
        .arg(media)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("failed to execute ffprobe — is FFmpeg installed?")?;

    if !output.status.success() {
        bail!(
            "ffprobe exited with status {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let probe: FfprobeOutput =
        serde_json::from_slice(&output.stdout).context("failed to parse ffprobe JSON output")?;

    probe
        .streams
        .first()
        .and_then(|stream| stream.r_frame_rate.as_deref())
        .and_then(parse_frame_rate)
        .ok_or_else(|| anyhow!("no parseable r_frame_rate in ffprobe output"))
}

/// Parses an ffprobe rate such as `"30/1"` or `"24"` into a rounded fps.
fn parse_frame_rate(raw: &str) -> Option<u32> {
    let value = if let Some((num, den)) = raw.split_once('/') {
        let num: f64 = num.trim().parse().ok()?;
        let den: f64 = den.trim().parse().ok()?;
        if den <= 0.0 {
            return None;
        }
        num / den
    } else {
        raw.trim().parse().ok()?
    };

    if value.is_finite() && value > 0.0 {
        Some(value.round() as u32)
    } else {
        None
    }
}
