//! External collaborators the pipeline delegates heavy work to.
//!
//! Each collaborator is a narrow async trait with a
//! `(input) -> (success, output | error)` contract; the stage coordinators
//! never reach around these seams. Which implementation backs a trait is
//! wiring, decided at startup from config.

mod fetcher;
mod transcoder;
mod transform;

pub use fetcher::{MediaFetcher, YtDlpFetcher};
pub use transcoder::{FfmpegTranscoder, FrameTranscoder, DEFAULT_FRAME_RATE};
pub use transform::{FrameTransform, HttpTransform, PassthroughTransform, TransformOutcome};
