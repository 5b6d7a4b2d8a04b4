use super::{VideoMetadata, VideoReader};
use anyhow::{anyhow, Context, Result};
use opencv::{
    core::{Mat, Vector},
    prelude::*,
    videoio::{
        VideoCapture, CAP_ANY, CAP_PROP_FOURCC, CAP_PROP_FPS, CAP_PROP_FRAME_COUNT,
        CAP_PROP_FRAME_HEIGHT, CAP_PROP_FRAME_WIDTH, CAP_PROP_HW_ACCELERATION,
        CAP_PROP_POS_FRAMES, VIDEO_ACCELERATION_ANY, VIDEO_ACCELERATION_NONE,
    },
};
use std::path::Path;

/// Sequential reader on top of `cv::VideoCapture`.
pub struct OpencvReader {
    capture: VideoCapture,
    metadata: VideoMetadata,
    /// Index of the next frame the capture will grab.
    next: usize,
    position: usize,
    hardware: bool,
}

impl OpencvReader {
    pub fn open(path: &Path, hardware: bool) -> Result<Self> {
        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow!("Non UTF-8 video path: {}", path.display()))?;

        let accel = if hardware {
            VIDEO_ACCELERATION_ANY
        } else {
            VIDEO_ACCELERATION_NONE
        };
        let params = Vector::<i32>::from_slice(&[CAP_PROP_HW_ACCELERATION, accel]);
        let capture = VideoCapture::from_file_with_params(path_str, CAP_ANY, &params)
            .with_context(|| format!("Failed to open video at: '{}'", path_str))?;
        if !capture.is_opened()? {
            return Err(anyhow!("Failed to open video file: {}", path_str));
        }

        if hardware {
            let active = capture.get(CAP_PROP_HW_ACCELERATION)? as i32;
            if active == VIDEO_ACCELERATION_NONE {
                // OpenCV silently falls back to software; let the caller try the next strategy.
                return Err(anyhow!("Hardware decoding not available for {}", path_str));
            }
            tracing::info!("OpencvReader: hardware decoding active (type={})", active);
        }

        let mut fps = capture.get(CAP_PROP_FPS)?;
        if fps <= 0.0 {
            tracing::warn!("OpencvReader: Failed to get FPS from metadata, falling back to 30.0");
            fps = 30.0;
        }
        let raw_count = capture.get(CAP_PROP_FRAME_COUNT)?.max(0.0) as usize;
        let metadata = VideoMetadata {
            fps,
            width: capture.get(CAP_PROP_FRAME_WIDTH)?.max(0.0) as u32,
            height: capture.get(CAP_PROP_FRAME_HEIGHT)?.max(0.0) as u32,
            total_frames: raw_count,
            codec: fourcc_to_string(capture.get(CAP_PROP_FOURCC)? as u32),
        };

        tracing::info!(
            "OpencvReader: opened {}, duration={:.2}s, fps={:.2}, stream_frames={}, codec={}",
            path_str,
            metadata.duration_secs(),
            fps,
            raw_count,
            metadata.codec
        );

        Ok(Self {
            capture,
            metadata,
            next: 0,
            position: 0,
            hardware,
        })
    }

    fn retrieve(&mut self) -> Result<Option<Mat>> {
        let mut frame = Mat::default();
        if !self.capture.retrieve(&mut frame, 0)? || frame.empty() {
            return Ok(None);
        }
        Ok(Some(frame))
    }
}

/// Decodes a FOURCC property into its four-letter code, lowercased.
pub(crate) fn fourcc_to_string(code: u32) -> String {
    code.to_le_bytes()
        .iter()
        .filter(|b| b.is_ascii_graphic())
        .map(|b| (*b as char).to_ascii_lowercase())
        .collect()
}

impl VideoReader for OpencvReader {
    fn metadata(&self) -> &VideoMetadata {
        &self.metadata
    }

    fn position(&self) -> usize {
        self.position
    }

    fn seek_to_frame(&mut self, frame_num: usize) -> Result<()> {
        self.capture.set(CAP_PROP_POS_FRAMES, frame_num as f64)?;
        self.next = frame_num;
        self.position = frame_num;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<Mat>> {
        if !self.capture.grab()? {
            return Ok(None);
        }
        self.position = self.next;
        self.next += 1;
        self.retrieve()
    }

    fn advance(&mut self, step: usize) -> Result<Option<Mat>> {
        // grab() skips the colour conversion, so only the landing frame pays for it.
        for _ in 0..step.max(1) {
            if !self.capture.grab()? {
                return Ok(None);
            }
            self.next += 1;
        }
        self.position = self.next.saturating_sub(1);
        self.retrieve()
    }

    fn backend(&self) -> &'static str {
        if self.hardware {
            "opencv-hw"
        } else {
            "opencv"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_decoding() {
        let avc1 = u32::from_le_bytes(*b"avc1");
        assert_eq!(fourcc_to_string(avc1), "avc1");
        let h264 = u32::from_le_bytes(*b"H264");
        assert_eq!(fourcc_to_string(h264), "h264");
        assert_eq!(fourcc_to_string(0), "");
    }
}
