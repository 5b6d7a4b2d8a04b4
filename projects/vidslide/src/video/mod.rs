pub mod ffmpeg_reader;
pub mod opencv_reader;
pub mod probe;

use anyhow::{anyhow, Result};
use opencv::core::Mat;
use serde::{Deserialize, Serialize};
use std::path::Path;

use ffmpeg_reader::FfmpegReader;
use opencv_reader::OpencvReader;

/// Stream facts captured once per video. Never rewritten after ingestion.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct VideoMetadata {
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    pub total_frames: usize,
    pub codec: String,
}

impl VideoMetadata {
    pub fn duration_secs(&self) -> f64 {
        if self.fps > 0.0 {
            self.total_frames as f64 / self.fps
        } else {
            0.0
        }
    }
}

/// Sequential frame source.
///
/// `position()` is the index of the frame most recently returned. After a
/// seek, the next `read_frame` returns the frame at (or, for key-frame
/// readers, the key frame before) the seek target.
pub trait VideoReader: Send {
    fn metadata(&self) -> &VideoMetadata;
    fn position(&self) -> usize;
    fn seek_to_frame(&mut self, frame_num: usize) -> Result<()>;
    /// Decodes the next frame. `Ok(None)` at end of stream.
    fn read_frame(&mut self) -> Result<Option<Mat>>;
    /// Moves `step` frames past the current position and decodes the frame
    /// landed on. `Ok(None)` when the stream ends first.
    fn advance(&mut self, step: usize) -> Result<Option<Mat>>;
    fn backend(&self) -> &'static str;
}

/// How a reader should be opened.
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    pub use_gpu: bool,
    /// Decode key frames only. Positions become approximate.
    pub keyframes_only: bool,
    /// Codec reported by the probe, used to skip pointless GPU attempts.
    pub codec_hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Strategy {
    FfmpegKeyframes { hardware: bool },
    Opencv { hardware: bool },
}

/// Codecs with common hardware decode support.
const HW_CODECS: &[&str] = &[
    "h264", "avc1", "hevc", "h265", "hvc1", "hev1", "vp8", "vp9", "av1", "mpeg2video",
    "mpeg4", "vc1",
];

fn codec_has_hw_support(codec: &str) -> bool {
    let codec = codec.trim().to_lowercase();
    HW_CODECS.iter().any(|c| *c == codec)
}

fn strategies(options: &OpenOptions) -> Vec<Strategy> {
    let gpu = options.use_gpu
        && options
            .codec_hint
            .as_deref()
            .map(codec_has_hw_support)
            .unwrap_or(true);

    let mut plan = Vec::new();
    if options.keyframes_only {
        if gpu {
            plan.push(Strategy::FfmpegKeyframes { hardware: true });
        }
        plan.push(Strategy::FfmpegKeyframes { hardware: false });
    }
    if gpu {
        plan.push(Strategy::Opencv { hardware: true });
    }
    plan.push(Strategy::Opencv { hardware: false });
    plan
}

fn open_with(path: &Path, strategy: Strategy) -> Result<Box<dyn VideoReader>> {
    let mut reader: Box<dyn VideoReader> = match strategy {
        Strategy::FfmpegKeyframes { hardware } => Box::new(FfmpegReader::open(path, hardware)?),
        Strategy::Opencv { hardware } => Box::new(OpencvReader::open(path, hardware)?),
    };

    // A decoder that opens but cannot produce the first frame is useless to us.
    if reader.read_frame()?.is_none() {
        return Err(anyhow!("{} produced no frames", reader.backend()));
    }
    reader.seek_to_frame(0)?;
    Ok(reader)
}

/// Opens a reader by trying each decode strategy in order. Any failure,
/// including a GPU path that opens but cannot decode, falls through to the
/// next strategy. The last error is returned if nothing works.
pub fn open_reader(path: &Path, options: &OpenOptions) -> Result<Box<dyn VideoReader>> {
    if !path.exists() {
        return Err(anyhow::Error::new(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("video file not found: {}", path.display()),
        )));
    }

    let mut last_err = None;
    for strategy in strategies(options) {
        match open_with(path, strategy) {
            Ok(reader) => {
                tracing::info!(
                    "Reader: opened {} with {:?} ({})",
                    path.display(),
                    strategy,
                    reader.backend()
                );
                return Ok(reader);
            }
            Err(e) => {
                tracing::warn!("Reader: {:?} failed for {}: {:#}", strategy, path.display(), e);
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("no decode strategy for {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_order_with_gpu() {
        let options = OpenOptions {
            use_gpu: true,
            keyframes_only: true,
            codec_hint: Some("h264".into()),
        };
        assert_eq!(
            strategies(&options),
            vec![
                Strategy::FfmpegKeyframes { hardware: true },
                Strategy::FfmpegKeyframes { hardware: false },
                Strategy::Opencv { hardware: true },
                Strategy::Opencv { hardware: false },
            ]
        );
    }

    #[test]
    fn test_gpu_skipped_for_unsupported_codec() {
        let options = OpenOptions {
            use_gpu: true,
            keyframes_only: false,
            codec_hint: Some("mjpeg".into()),
        };
        assert_eq!(
            strategies(&options),
            vec![Strategy::Opencv { hardware: false }]
        );
    }

    #[test]
    fn test_gpu_opt_out() {
        let options = OpenOptions {
            use_gpu: false,
            keyframes_only: false,
            codec_hint: None,
        };
        assert_eq!(
            strategies(&options),
            vec![Strategy::Opencv { hardware: false }]
        );
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let err = match open_reader(Path::new("/definitely/not/here.mp4"), &OpenOptions::default()) {
            Ok(_) => panic!("expected failure"),
            Err(e) => e,
        };
        let io = err.downcast_ref::<std::io::Error>().unwrap();
        assert_eq!(io.kind(), std::io::ErrorKind::NotFound);
    }
}
