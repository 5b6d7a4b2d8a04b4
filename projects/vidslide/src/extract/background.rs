use crate::config::{
    BG_BACKGROUND_RATIO, BG_HISTORY, BG_LEARNING_RATE, BG_VAR_THRESHOLD, FOREGROUND_DILATE_PX,
};
use anyhow::Result;
use opencv::prelude::*;
use opencv::{core, imgproc, video};

/// Adaptive background model over comparison buffers.
///
/// Masks use 255 for background and 0 for foreground (people, hands,
/// anything that moved recently).
pub struct BackgroundModel {
    subtractor: core::Ptr<video::BackgroundSubtractorMOG2>,
    kernel: core::Mat,
}

impl BackgroundModel {
    pub fn new() -> Result<Self> {
        let mut subtractor =
            video::create_background_subtractor_mog2(BG_HISTORY, BG_VAR_THRESHOLD, false)?;
        subtractor.set_background_ratio(BG_BACKGROUND_RATIO)?;
        let kernel = imgproc::get_structuring_element(
            imgproc::MORPH_ELLIPSE,
            core::Size::new(FOREGROUND_DILATE_PX, FOREGROUND_DILATE_PX),
            core::Point::new(-1, -1),
        )?;
        Ok(Self { subtractor, kernel })
    }

    /// Feeds a sample without producing a mask.
    pub fn learn(&mut self, gray: &core::Mat) -> Result<()> {
        let mut fg = core::Mat::default();
        self.subtractor.apply(gray, &mut fg, BG_LEARNING_RATE)?;
        Ok(())
    }

    /// Restarts the model from a single frame that is taken as all background.
    pub fn reset_to(&mut self, gray: &core::Mat) -> Result<core::Mat> {
        let mut fg = core::Mat::default();
        self.subtractor.apply(gray, &mut fg, 1.0)?;
        Ok(core::Mat::new_rows_cols_with_default(
            gray.rows(),
            gray.cols(),
            core::CV_8UC1,
            core::Scalar::all(255.0),
        )?)
    }

    /// Updates the model with `gray` and returns its background mask.
    pub fn background_mask(&mut self, gray: &core::Mat) -> Result<core::Mat> {
        let mut fg = core::Mat::default();
        self.subtractor.apply(gray, &mut fg, BG_LEARNING_RATE)?;

        let mut fg_bin = core::Mat::default();
        imgproc::threshold(&fg, &mut fg_bin, 0.0, 255.0, imgproc::THRESH_BINARY)?;

        let mut grown = core::Mat::default();
        imgproc::dilate(
            &fg_bin,
            &mut grown,
            &self.kernel,
            core::Point::new(-1, -1),
            1,
            core::BORDER_CONSTANT,
            imgproc::morphology_default_border_value()?,
        )?;

        let mut bg = core::Mat::default();
        core::bitwise_not(&grown, &mut bg, &core::no_array())?;
        Ok(bg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray(v: f64) -> core::Mat {
        core::Mat::new_rows_cols_with_default(60, 80, core::CV_8UC1, core::Scalar::all(v)).unwrap()
    }

    fn bg_fraction(mask: &core::Mat) -> f64 {
        core::count_non_zero(mask).unwrap() as f64 / (mask.rows() * mask.cols()) as f64
    }

    #[test]
    fn test_static_scene_is_background() {
        let mut model = BackgroundModel::new().unwrap();
        let mask = model.reset_to(&gray(80.0)).unwrap();
        assert_eq!(bg_fraction(&mask), 1.0);
        for _ in 0..5 {
            let mask = model.background_mask(&gray(80.0)).unwrap();
            assert!(bg_fraction(&mask) > 0.99);
        }
    }

    #[test]
    fn test_intruder_is_foreground() {
        let mut model = BackgroundModel::new().unwrap();
        model.reset_to(&gray(80.0)).unwrap();
        for _ in 0..10 {
            model.learn(&gray(80.0)).unwrap();
        }
        let mut frame = gray(80.0);
        imgproc::rectangle(
            &mut frame,
            core::Rect::new(30, 10, 15, 40),
            core::Scalar::all(240.0),
            imgproc::FILLED,
            imgproc::LINE_8,
            0,
        )
        .unwrap();
        let mask = model.background_mask(&frame).unwrap();
        let fraction = bg_fraction(&mask);
        assert!(fraction < 0.95 && fraction > 0.3, "fraction = {}", fraction);
    }
}
