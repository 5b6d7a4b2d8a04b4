use super::opencv_reader::fourcc_to_string;
use super::VideoMetadata;
use crate::config::{MIN_VIDEO_FRAMES, THUMBNAIL_QUALITY, THUMBNAIL_WIDTH};
use crate::error::InvalidVideo;
use crate::extract::writer::write_jpeg;
use anyhow::{anyhow, Context, Result};
use opencv::{
    core::{Mat, Size},
    imgproc,
    prelude::*,
    videoio::{
        VideoCapture, CAP_ANY, CAP_PROP_FOURCC, CAP_PROP_FPS, CAP_PROP_FRAME_COUNT,
        CAP_PROP_FRAME_HEIGHT, CAP_PROP_FRAME_WIDTH, CAP_PROP_POS_FRAMES,
    },
};
use std::path::Path;

/// Metadata and preview access used by the batch layer.
pub trait MetadataProbe: Send + Sync {
    fn probe(&self, path: &Path) -> Result<VideoMetadata>;
    fn thumbnail(&self, video: &Path, out: &Path) -> Result<()>;
}

/// FFmpeg container probe first, OpenCV as a fallback.
pub struct DefaultProbe;

impl MetadataProbe for DefaultProbe {
    fn probe(&self, path: &Path) -> Result<VideoMetadata> {
        if !path.is_file() {
            return Err(anyhow::Error::new(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("video file not found: {}", path.display()),
            )));
        }
        let meta = match probe_with_ffmpeg(path) {
            Ok(meta) => meta,
            Err(e) => {
                tracing::debug!("Probe: ffmpeg failed for {}: {:#}, trying opencv", path.display(), e);
                probe_with_opencv(path)?
            }
        };
        validate(&meta)?;
        Ok(meta)
    }

    fn thumbnail(&self, video: &Path, out: &Path) -> Result<()> {
        generate_thumbnail(video, out)
    }
}

pub fn probe_with_ffmpeg(path: &Path) -> Result<VideoMetadata> {
    ffmpeg_next::init().context("Failed to initialize FFmpeg")?;
    let input = ffmpeg_next::format::input(&path)?;
    let stream = input
        .streams()
        .best(ffmpeg_next::media::Type::Video)
        .ok_or_else(|| anyhow!("No video stream found in {}", path.display()))?;

    let rate = stream.avg_frame_rate();
    let fps = if rate.denominator() > 0 {
        rate.numerator() as f64 / rate.denominator() as f64
    } else {
        0.0
    };
    let duration_secs = input.duration().max(0) as f64 / ffmpeg_next::ffi::AV_TIME_BASE as f64;
    let total_frames = match stream.frames() {
        n if n > 0 => n as usize,
        _ => (duration_secs * fps).round() as usize,
    };

    let params = ffmpeg_next::codec::context::Context::from_parameters(stream.parameters())?;
    let codec = params.id().name().to_string();
    let video = params.decoder().video()?;

    Ok(VideoMetadata {
        fps,
        width: video.width(),
        height: video.height(),
        total_frames,
        codec,
    })
}

pub fn probe_with_opencv(path: &Path) -> Result<VideoMetadata> {
    let capture = open_capture(path)?;
    Ok(VideoMetadata {
        fps: capture.get(CAP_PROP_FPS)?,
        width: capture.get(CAP_PROP_FRAME_WIDTH)?.max(0.0) as u32,
        height: capture.get(CAP_PROP_FRAME_HEIGHT)?.max(0.0) as u32,
        total_frames: capture.get(CAP_PROP_FRAME_COUNT)?.max(0.0) as usize,
        codec: fourcc_to_string(capture.get(CAP_PROP_FOURCC)? as u32),
    })
}

/// Rejects streams the extractor cannot meaningfully sample.
pub fn validate(meta: &VideoMetadata) -> Result<()> {
    if meta.fps <= 0.0 {
        return Err(InvalidVideo("frame rate is unknown".into()).into());
    }
    if meta.total_frames < MIN_VIDEO_FRAMES {
        return Err(InvalidVideo(format!(
            "only {} frames (need at least {})",
            meta.total_frames, MIN_VIDEO_FRAMES
        ))
        .into());
    }
    Ok(())
}

fn open_capture(path: &Path) -> Result<VideoCapture> {
    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow!("Non UTF-8 video path: {}", path.display()))?;
    let capture = VideoCapture::from_file(path_str, CAP_ANY)?;
    if !capture.is_opened()? {
        return Err(anyhow!("Failed to open video file: {}", path_str));
    }
    Ok(capture)
}

/// Writes a small JPEG preview taken one second in, or from the first frame
/// of very short clips.
pub fn generate_thumbnail(video: &Path, out: &Path) -> Result<()> {
    let mut capture = open_capture(video)?;
    let fps = capture.get(CAP_PROP_FPS)?;
    let target = if fps > 0.0 { fps.round() } else { 0.0 };

    let mut frame = Mat::default();
    capture.set(CAP_PROP_POS_FRAMES, target)?;
    if !capture.read(&mut frame)? || frame.empty() {
        capture.set(CAP_PROP_POS_FRAMES, 0.0)?;
        if !capture.read(&mut frame)? || frame.empty() {
            return Err(anyhow!("No frame available for thumbnail of {}", video.display()));
        }
    }

    let size = frame.size()?;
    let preview = if size.width > THUMBNAIL_WIDTH {
        let height = (size.height as f64 * THUMBNAIL_WIDTH as f64 / size.width as f64).round() as i32;
        let mut small = Mat::default();
        imgproc::resize(
            &frame,
            &mut small,
            Size::new(THUMBNAIL_WIDTH, height.max(1)),
            0.0,
            0.0,
            imgproc::INTER_AREA,
        )?;
        small
    } else {
        frame
    };

    write_jpeg(out, &preview, THUMBNAIL_QUALITY)
}
