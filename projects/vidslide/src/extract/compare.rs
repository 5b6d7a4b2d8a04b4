// Region-of-interest preparation and frame difference metrics.

use crate::config::{ROI_X_FRACTION, ROI_Y_FRACTION};
use anyhow::{bail, Result};
use opencv::prelude::*;
use opencv::{core, imgproc};

/// Normalized crop box, fractions of frame width/height.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegionBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl RegionBox {
    pub const FULL: RegionBox = RegionBox {
        x: 0.0,
        y: 0.0,
        w: 1.0,
        h: 1.0,
    };

    /// Bottom-right region that excludes title bars and presenter overlays.
    pub fn lecture_content() -> Self {
        RegionBox {
            x: ROI_X_FRACTION,
            y: ROI_Y_FRACTION,
            w: 1.0 - ROI_X_FRACTION,
            h: 1.0 - ROI_Y_FRACTION,
        }
    }

    fn to_rect(self, size: core::Size) -> Result<core::Rect> {
        let width = size.width as f32;
        let height = size.height as f32;

        let x = ((self.x * width) as i32).clamp(0, size.width);
        let y = ((self.y * height) as i32).clamp(0, size.height);
        let w = ((self.w * width).round() as i32).clamp(0, size.width - x);
        let h = ((self.h * height).round() as i32).clamp(0, size.height - y);

        if w <= 0 || h <= 0 {
            bail!("Invalid crop dimensions: {}x{} (box: {:?})", w, h, self);
        }
        Ok(core::Rect::new(x, y, w, h))
    }
}

/// Turns full frames into small grayscale comparison buffers.
pub struct RegionComparator {
    region: RegionBox,
    /// Target buffer width; `None` keeps the ROI at native resolution.
    compare_width: Option<i32>,
    scratch_small: core::Mat,
}

impl RegionComparator {
    pub fn new(use_roi: bool, downscale: bool, compare_width: i32) -> Self {
        Self {
            region: if use_roi {
                RegionBox::lecture_content()
            } else {
                RegionBox::FULL
            },
            compare_width: downscale.then_some(compare_width),
            scratch_small: core::Mat::default(),
        }
    }

    /// Crop, optional INTER_AREA downscale, grayscale.
    pub fn prepare(&mut self, frame: &core::Mat) -> Result<core::Mat> {
        let rect = self.region.to_rect(frame.size()?)?;
        let cropped = core::Mat::roi(frame, rect)?;
        let mut roi = core::Mat::default();
        cropped.copy_to(&mut roi)?;

        let src = match self.compare_width {
            Some(target) if rect.width > target => {
                let scale = target as f64 / rect.width as f64;
                imgproc::resize(
                    &roi,
                    &mut self.scratch_small,
                    core::Size::new(0, 0),
                    scale,
                    scale,
                    imgproc::INTER_AREA,
                )?;
                &self.scratch_small
            }
            _ => &roi,
        };

        if src.channels() == 1 {
            return Ok(src.try_clone()?);
        }
        let mut gray = core::Mat::default();
        imgproc::cvt_color_def(src, &mut gray, imgproc::COLOR_BGR2GRAY)?;
        Ok(gray)
    }

    /// Drops the resize scratch buffer so it cannot grow without bound.
    pub fn reclaim(&mut self) {
        self.scratch_small = core::Mat::default();
    }
}

/// Mean absolute per-pixel difference of two equally sized gray buffers.
pub fn mean_abs_diff(a: &core::Mat, b: &core::Mat) -> Result<f64> {
    let mut diff = core::Mat::default();
    core::absdiff(a, b, &mut diff)?;
    Ok(core::mean(&diff, &core::no_array())?[0])
}

/// Difference restricted to pixels that are background in both masks.
///
/// Returns `None` when that shared background covers less than
/// `min_fraction` of the buffer, i.e. the view is too occluded to judge.
pub fn masked_mean_abs_diff(
    a: &core::Mat,
    b: &core::Mat,
    mask_a: &core::Mat,
    mask_b: &core::Mat,
    min_fraction: f64,
) -> Result<Option<f64>> {
    let mut shared = core::Mat::default();
    core::bitwise_and(mask_a, mask_b, &mut shared, &core::no_array())?;

    let total = (shared.rows() * shared.cols()).max(1) as f64;
    let visible = core::count_non_zero(&shared)? as f64;
    if visible / total < min_fraction {
        return Ok(None);
    }

    let mut diff = core::Mat::default();
    core::absdiff(a, b, &mut diff)?;
    Ok(Some(core::mean(&diff, &shared)?[0]))
}
