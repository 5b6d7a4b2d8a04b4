use super::{VideoMetadata, VideoReader};
use anyhow::{anyhow, Context, Result};
use opencv::{core, prelude::*};
use std::path::Path;

use ffmpeg_next::util::frame::Video as Frame;
use ffmpeg_next::{codec, ffi, format, media, software::scaling};

/// Hardware device context, unreferenced on drop.
struct HwDevice {
    ptr: *mut ffi::AVBufferRef,
}

impl HwDevice {
    /// Returns `None` if the device cannot be created on this machine.
    fn new(device_type: ffi::AVHWDeviceType) -> Option<Self> {
        let mut ptr: *mut ffi::AVBufferRef = std::ptr::null_mut();
        let ret = unsafe {
            ffi::av_hwdevice_ctx_create(
                &mut ptr,
                device_type,
                std::ptr::null(),
                std::ptr::null_mut(),
                0,
            )
        };
        if ret < 0 || ptr.is_null() {
            None
        } else {
            Some(Self { ptr })
        }
    }

    /// Extra reference for a decoder to own.
    fn new_ref(&self) -> *mut ffi::AVBufferRef {
        unsafe { ffi::av_buffer_ref(self.ptr) }
    }
}

impl Drop for HwDevice {
    fn drop(&mut self) {
        unsafe {
            ffi::av_buffer_unref(&mut self.ptr);
        }
    }
}

/// Device types worth trying on this platform, best first.
fn hw_device_candidates() -> &'static [ffi::AVHWDeviceType] {
    use ffi::AVHWDeviceType::*;
    if cfg!(target_os = "macos") {
        &[AV_HWDEVICE_TYPE_VIDEOTOOLBOX]
    } else if cfg!(target_os = "windows") {
        &[
            AV_HWDEVICE_TYPE_D3D11VA,
            AV_HWDEVICE_TYPE_CUDA,
            AV_HWDEVICE_TYPE_DXVA2,
            AV_HWDEVICE_TYPE_QSV,
        ]
    } else {
        &[
            AV_HWDEVICE_TYPE_CUDA,
            AV_HWDEVICE_TYPE_VAAPI,
            AV_HWDEVICE_TYPE_QSV,
        ]
    }
}

/// Key-frame reader backed by FFmpeg via ffmpeg-next.
///
/// The decoder is told to discard every non-key frame, so `advance` lands on
/// the first key frame at or after the requested position. Used for the
/// long-step modes where exact positions do not matter.
pub struct FfmpegReader {
    input_ctx: format::context::Input,
    decoder: codec::decoder::Video,
    stream_index: usize,
    /// Built on the first frame, once the source format is known.
    scaler: Option<scaling::Context>,
    metadata: VideoMetadata,
    /// Seconds per stream timestamp unit.
    time_base: f64,
    start_pts: i64,
    position: usize,
    _hw_device: Option<HwDevice>,
    /// Pixel format of frames still in device memory.
    hw_pix_fmt: Option<ffi::AVPixelFormat>,
    packet: codec::packet::Packet,
    /// EOF has been sent to the decoder.
    drained: bool,
}

// SAFETY: an FfmpegReader is owned by exactly one extraction worker thread.
// The raw pointers inside ffmpeg-next types are never shared across threads.
unsafe impl Send for FfmpegReader {}

impl FfmpegReader {
    pub fn open(path: &Path, hardware: bool) -> Result<Self> {
        ffmpeg_next::init().context("FFmpeg init failed")?;

        let input_ctx = format::input(&path)
            .with_context(|| format!("Failed to open video file {}", path.display()))?;

        let video_stream = input_ctx
            .streams()
            .best(media::Type::Video)
            .ok_or_else(|| anyhow!("No video stream found in {}", path.display()))?;

        let stream_index = video_stream.index();

        let rational_fps = video_stream.avg_frame_rate();
        let fps = if rational_fps.denominator() > 0 && rational_fps.numerator() > 0 {
            rational_fps.numerator() as f64 / rational_fps.denominator() as f64
        } else {
            tracing::warn!("FfmpegReader: no frame rate in {}, assuming 30", path.display());
            30.0
        };

        let tb = video_stream.time_base();
        let time_base = if tb.denominator() > 0 {
            tb.numerator() as f64 / tb.denominator() as f64
        } else {
            1.0 / fps
        };
        let start_pts = match video_stream.start_time() {
            ffi::AV_NOPTS_VALUE => 0,
            pts => pts,
        };

        let stream_frames = video_stream.frames().max(0) as usize;
        let duration_secs = input_ctx.duration().max(0) as f64 / ffi::AV_TIME_BASE as f64;
        let total_frames = if stream_frames == 0 {
            (duration_secs * fps).round() as usize
        } else {
            stream_frames
        };

        let mut decoder_ctx =
            codec::context::Context::from_parameters(video_stream.parameters())
                .context("Failed to create decoder context")?;

        let (hw_device, hw_pix_fmt) = if hardware {
            match Self::attach_hw_device(&mut decoder_ctx) {
                Some((ctx, fmt)) => (Some(ctx), Some(fmt)),
                None => return Err(anyhow!("No usable hardware decoder for {}", path.display())),
            }
        } else {
            (None, None)
        };

        let mut decoder = decoder_ctx
            .decoder()
            .video()
            .context("Failed to open video decoder")?;

        unsafe {
            (*decoder.as_mut_ptr()).skip_frame = codec::discard::Discard::NonKey.into();
        }

        let metadata = VideoMetadata {
            fps,
            width: decoder.width(),
            height: decoder.height(),
            total_frames,
            codec: decoder.id().name().to_string(),
        };

        tracing::info!(
            "FfmpegReader: opened {}, duration={:.2}s, fps={:.2}, frames={}, codec={}, {} key-frame decoding ({}x{})",
            path.display(),
            duration_secs,
            fps,
            total_frames,
            metadata.codec,
            if hw_pix_fmt.is_some() { "hardware" } else { "software" },
            metadata.width,
            metadata.height
        );

        Ok(Self {
            input_ctx,
            decoder,
            stream_index,
            scaler: None,
            metadata,
            time_base,
            start_pts,
            position: 0,
            _hw_device: hw_device,
            hw_pix_fmt,
            packet: codec::packet::Packet::empty(),
            drained: false,
        })
    }

    /// Probes the codec's hardware configs against the platform's device
    /// candidates and attaches the first device that can be created.
    fn attach_hw_device(
        decoder_ctx: &mut codec::context::Context,
    ) -> Option<(HwDevice, ffi::AVPixelFormat)> {
        unsafe {
            // from_parameters leaves the codec pointer unset.
            let codec_id = (*decoder_ctx.as_ptr()).codec_id;
            let codec_ptr = ffi::avcodec_find_decoder(codec_id);
            if codec_ptr.is_null() {
                tracing::debug!("FfmpegReader: no decoder for codec_id {:?}", codec_id);
                return None;
            }

            let mut supported = Vec::new();
            let mut idx = 0i32;
            loop {
                let config = ffi::avcodec_get_hw_config(codec_ptr, idx);
                if config.is_null() {
                    break;
                }
                let c = &*config;
                if (c.methods as u32 & ffi::AV_CODEC_HW_CONFIG_METHOD_HW_DEVICE_CTX as u32) != 0 {
                    supported.push((c.device_type, c.pix_fmt));
                }
                idx += 1;
            }

            for device_type in hw_device_candidates() {
                let Some(&(_, pix_fmt)) = supported.iter().find(|(t, _)| t == device_type) else {
                    continue;
                };
                match HwDevice::new(*device_type) {
                    Some(hw_ctx) => {
                        tracing::debug!("FfmpegReader: {:?} device created", device_type);
                        (*decoder_ctx.as_mut_ptr()).hw_device = hw_ctx.new_ref();
                        return Some((hw_ctx, pix_fmt));
                    }
                    None => {
                        tracing::debug!("FfmpegReader: {:?} device unavailable", device_type);
                    }
                }
            }
            None
        }
    }

    /// Pulls the next decoded frame. `Ok(None)` once the stream is drained.
    fn decode_next(&mut self) -> Result<Option<Frame>> {
        let mut frame = Frame::empty();
        loop {
            match self.decoder.receive_frame(&mut frame) {
                Ok(()) => return Ok(Some(frame)),
                Err(ffmpeg_next::Error::Other { errno: ffi::EAGAIN }) => {
                    if self.drained {
                        return Ok(None);
                    }
                }
                Err(ffmpeg_next::Error::Eof) => return Ok(None),
                Err(e) => return Err(e).context("Decoder error"),
            }

            let mut sent = false;
            while self.packet.read(&mut self.input_ctx).is_ok() {
                if self.packet.stream() == self.stream_index {
                    self.decoder
                        .send_packet(&self.packet)
                        .context("Failed to send packet to decoder")?;
                    sent = true;
                    break;
                }
            }

            if !sent {
                self.decoder
                    .send_eof()
                    .context("Failed to send EOF to decoder")?;
                self.drained = true;
            }
        }
    }

    fn frame_index(&self, frame: &Frame) -> Option<usize> {
        let pts = frame.timestamp().or_else(|| frame.pts())?;
        let secs = (pts - self.start_pts) as f64 * self.time_base;
        Some((secs * self.metadata.fps).round().max(0.0) as usize)
    }

    fn scaler_for(
        &mut self,
        src_format: format::Pixel,
        width: u32,
        height: u32,
    ) -> Result<&mut scaling::Context> {
        let scaler = match self.scaler.take() {
            Some(scaler) => scaler,
            None => scaling::Context::get(
                src_format,
                width,
                height,
                format::Pixel::BGR24,
                width,
                height,
                scaling::Flags::BILINEAR,
            )
            .context("Failed to create scaler")?,
        };
        Ok(self.scaler.insert(scaler))
    }

    /// Transfers GPU frames to system memory and converts to BGR24.
    fn to_bgr_mat(&mut self, frame: Frame) -> Result<core::Mat> {
        let sw_frame = if self.on_gpu(&frame) {
            download_frame(&frame)?
        } else {
            frame
        };

        let (w, h) = (sw_frame.width(), sw_frame.height());
        let scaler = self.scaler_for(sw_frame.format(), w, h)?;
        let mut bgr = Frame::empty();
        scaler.run(&sw_frame, &mut bgr).context("Scaler failed")?;
        frame_to_mat(&bgr)
    }

    fn on_gpu(&self, frame: &Frame) -> bool {
        match self.hw_pix_fmt {
            Some(hw_fmt) => {
                let frame_fmt = unsafe { (*frame.as_ptr()).format };
                frame_fmt == hw_fmt as i32
            }
            None => false,
        }
    }
}

fn download_frame(
    hw_frame: &Frame,
) -> Result<Frame> {
    let mut sw_frame = Frame::empty();
    let ret = unsafe { ffi::av_hwframe_transfer_data(sw_frame.as_mut_ptr(), hw_frame.as_ptr(), 0) };
    if ret < 0 {
        return Err(anyhow!(
            "Hardware frame download failed ({})",
            ret
        ));
    }
    Ok(sw_frame)
}

/// Deep-copies a BGR24 ffmpeg frame into an owned OpenCV Mat.
fn frame_to_mat(frame: &Frame) -> Result<core::Mat> {
    let width = frame.width() as i32;
    let height = frame.height() as i32;
    let data = frame.data(0);
    let stride = frame.stride(0);
    let row_bytes = width as usize * 3;

    let mut mat = core::Mat::new_rows_cols_with_default(
        height,
        width,
        core::CV_8UC3,
        core::Scalar::all(0.0),
    )?;

    for y in 0..height as usize {
        let src_offset = y * stride;
        let src_row = &data[src_offset..src_offset + row_bytes];
        let dst_ptr = mat.ptr_mut(y as i32)?;
        unsafe {
            std::ptr::copy_nonoverlapping(src_row.as_ptr(), dst_ptr, row_bytes);
        }
    }

    Ok(mat)
}

impl VideoReader for FfmpegReader {
    fn metadata(&self) -> &VideoMetadata {
        &self.metadata
    }

    fn position(&self) -> usize {
        self.position
    }

    fn seek_to_frame(&mut self, frame_num: usize) -> Result<()> {
        let time_secs = frame_num as f64 / self.metadata.fps;
        let timestamp = (time_secs * ffi::AV_TIME_BASE as f64) as i64;
        self.input_ctx
            .seek(timestamp, ..timestamp)
            .with_context(|| format!("Seek to frame {} failed", frame_num))?;
        self.decoder.flush();
        self.drained = false;
        self.scaler = None;
        self.position = frame_num;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<core::Mat>> {
        let Some(frame) = self.decode_next()? else {
            return Ok(None);
        };
        if let Some(idx) = self.frame_index(&frame) {
            self.position = idx;
        }
        self.to_bgr_mat(frame).map(Some)
    }

    fn advance(&mut self, step: usize) -> Result<Option<core::Mat>> {
        let target = self.position + step.max(1);
        loop {
            let Some(frame) = self.decode_next()? else {
                return Ok(None);
            };
            // Frames without timestamps count as one step each.
            let idx = self.frame_index(&frame).unwrap_or(self.position + 1);
            if idx < target {
                self.position = self.position.max(idx);
                continue;
            }
            self.position = idx;
            return self.to_bgr_mat(frame).map(Some);
        }
    }

    fn backend(&self) -> &'static str {
        if self.hw_pix_fmt.is_some() {
            "ffmpeg-keyframes-hw"
        } else {
            "ffmpeg-keyframes"
        }
    }
}
