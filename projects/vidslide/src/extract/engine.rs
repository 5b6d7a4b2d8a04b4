// Scene-change extraction: step through the video, compare a region of
// interest against the last accepted image, and save what changed.

use super::background::BackgroundModel;
use super::compare::{masked_mean_abs_diff, mean_abs_diff, RegionComparator};
use super::writer::ImageWriter;
use super::{
    CancelToken, ExtractJob, ExtractOutcome, ExtractReport, Extractor, Progress, ProgressSink,
};
use crate::config::{
    ContentMode, ExtractParams, JPEG_QUALITY, MIN_BACKGROUND_FRACTION, RECLAIM_EVERY_N_FRAMES,
    STABLE_EPSILON, WRITER_QUEUE_DEPTH, WRITER_THREADS,
};
use crate::error::{ExtractFailure, InvalidVideo};
use crate::video::{open_reader, OpenOptions, VideoReader};
use anyhow::{anyhow, Context, Result};
use opencv::prelude::*;
use opencv::{core, imgcodecs};
use std::collections::VecDeque;
use std::path::Path;
use std::time::{Duration, Instant};

pub fn image_file_name(index: usize) -> String {
    format!("slide_{:04}.jpg", index)
}

/// Parses the index back out of an image file name.
pub fn image_index(file_name: &str) -> Option<usize> {
    file_name
        .strip_prefix("slide_")?
        .strip_suffix(".jpg")?
        .parse()
        .ok()
}

/// Production extractor: opens the video through the decode strategy chain
/// and runs the scene-change loop on the calling thread.
pub struct SceneExtractor;

impl Extractor for SceneExtractor {
    fn extract(
        &self,
        job: &ExtractJob,
        progress: &dyn ProgressSink,
        cancel: &dyn CancelToken,
    ) -> ExtractOutcome {
        match open_reader(&job.video_path, &open_options(job)) {
            Ok(mut reader) => run_extraction(reader.as_mut(), job, progress, cancel),
            Err(e) => {
                tracing::error!("Extractor: cannot open {}: {:#}", job.video_path.display(), e);
                ExtractOutcome::Failed {
                    failure: ExtractFailure::classify(&e),
                    saved_count: job.saved_base(),
                    last_frame: job.resume.as_ref().map(|r| r.start_frame).unwrap_or(0),
                }
            }
        }
    }
}

fn open_options(job: &ExtractJob) -> OpenOptions {
    OpenOptions {
        use_gpu: job.params.use_gpu,
        keyframes_only: job.params.wants_keyframes(),
        codec_hint: job.codec.clone(),
    }
}

/// Runs one extraction over an already opened reader. Waits for every
/// queued image write before returning.
pub fn run_extraction(
    reader: &mut dyn VideoReader,
    job: &ExtractJob,
    progress: &dyn ProgressSink,
    cancel: &dyn CancelToken,
) -> ExtractOutcome {
    let started = Instant::now();
    let offset = job.saved_base();

    if let Err(e) = std::fs::create_dir_all(&job.output_dir) {
        let err = anyhow::Error::new(e)
            .context(format!("Failed to create {}", job.output_dir.display()));
        return ExtractOutcome::Failed {
            failure: ExtractFailure::classify(&err),
            saved_count: offset,
            last_frame: 0,
        };
    }

    let writer = ImageWriter::new(WRITER_THREADS, WRITER_QUEUE_DEPTH, JPEG_QUALITY);
    let (result, saved_count, last_frame, saved_frames) =
        match Extraction::new(reader, job, &writer, progress, cancel) {
            Ok(mut run) => {
                let result = run.run();
                let saved_frames = std::mem::take(&mut run.saved_frames);
                (result, run.saved_total(), run.position, saved_frames)
            }
            Err(e) => (Err(e), offset, 0, Vec::new()),
        };
    let flushed = writer.finish();
    let elapsed = started.elapsed();

    match (result, flushed) {
        (Ok(Finish::Completed), Ok(())) => {
            tracing::info!(
                "Extractor: done, {} images in {:.1}s ({})",
                saved_count,
                elapsed.as_secs_f64(),
                job.video_path.display()
            );
            progress.report(&Progress {
                saved_count,
                percent: 100,
                message: format!(
                    "Done: {} images in {}s",
                    saved_count,
                    elapsed.as_secs()
                ),
                eta_seconds: Some(0.0),
                elapsed_seconds: round1(elapsed.as_secs_f64()),
                current_frame: last_frame,
            });
            ExtractOutcome::Done(ExtractReport {
                saved_count,
                elapsed,
                saved_frames,
                last_frame,
            })
        }
        (Ok(Finish::Cancelled), flushed) => {
            if let Err(e) = flushed {
                tracing::warn!("Extractor: write failed while cancelling: {:#}", e);
            }
            tracing::info!("Extractor: cancelled at frame {}, {} images", last_frame, saved_count);
            ExtractOutcome::Cancelled {
                saved_count,
                last_frame,
            }
        }
        (Err(e), _) | (Ok(Finish::Completed), Err(e)) => {
            tracing::error!("Extractor: failed on {}: {:#}", job.video_path.display(), e);
            ExtractOutcome::Failed {
                failure: ExtractFailure::classify(&e),
                saved_count,
                last_frame,
            }
        }
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Finish {
    Completed,
    Cancelled,
}

enum Settled {
    Frame(core::Mat, core::Mat),
    Cancelled,
    EndOfStream,
}

/// Comparison state of an accepted image.
struct Reference {
    gray: core::Mat,
    /// Background mask (255 = background), only with a background model.
    mask: Option<core::Mat>,
}

impl Reference {
    fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            gray: self.gray.try_clone()?,
            mask: self.mask.as_ref().map(|m| m.try_clone()).transpose()?,
        })
    }

    /// Difference to a candidate. `None` when the shared background is too
    /// small to judge.
    fn score(&self, gray: &core::Mat, mask: Option<&core::Mat>) -> Result<Option<f64>> {
        match (self.mask.as_ref(), mask) {
            (Some(own), Some(other)) => {
                masked_mean_abs_diff(gray, &self.gray, other, own, MIN_BACKGROUND_FRACTION)
            }
            _ => mean_abs_diff(gray, &self.gray).map(Some),
        }
    }

    /// Copies background that was hidden in the reference but is visible in
    /// `gray` into the reference.
    fn absorb(&mut self, gray: &core::Mat, mask: &core::Mat) -> Result<()> {
        let Some(own) = self.mask.as_mut() else {
            return Ok(());
        };
        let mut hidden = core::Mat::default();
        core::bitwise_not(own, &mut hidden, &core::no_array())?;
        let mut revealed = core::Mat::default();
        core::bitwise_and(&hidden, mask, &mut revealed, &core::no_array())?;
        if core::count_non_zero(&revealed)? == 0 {
            return Ok(());
        }
        gray.copy_to_masked(&mut self.gray, &revealed)?;
        let mut merged = core::Mat::default();
        core::bitwise_or(own, mask, &mut merged, &core::no_array())?;
        *own = merged;
        Ok(())
    }
}

struct Extraction<'a> {
    reader: &'a mut dyn VideoReader,
    job: &'a ExtractJob,
    params: &'a ExtractParams,
    writer: &'a ImageWriter,
    progress: &'a dyn ProgressSink,
    cancel: &'a dyn CancelToken,
    comparator: RegionComparator,
    model: Option<BackgroundModel>,
    history: VecDeque<Reference>,
    throttle: Duration,
    saved: usize,
    saved_frames: Vec<usize>,
    position: usize,
    total_frames: usize,
    fps: f64,
    started: Instant,
    reclaim_bucket: usize,
    percent: u8,
    eta: Option<f64>,
}

impl<'a> Extraction<'a> {
    fn new(
        reader: &'a mut dyn VideoReader,
        job: &'a ExtractJob,
        writer: &'a ImageWriter,
        progress: &'a dyn ProgressSink,
        cancel: &'a dyn CancelToken,
    ) -> Result<Self> {
        let params = &job.params;
        let model = if params.mode.uses_background_model() {
            Some(BackgroundModel::new()?)
        } else {
            None
        };
        Ok(Self {
            reader,
            job,
            params,
            writer,
            progress,
            cancel,
            comparator: RegionComparator::new(
                params.use_roi,
                params.fast_compare,
                params.speed.compare_width(),
            ),
            model,
            history: VecDeque::with_capacity(params.max_history + 1),
            throttle: params.speed.throttle(),
            saved: 0,
            saved_frames: Vec::new(),
            position: 0,
            total_frames: 1,
            fps: 30.0,
            started: Instant::now(),
            reclaim_bucket: 0,
            percent: 0,
            eta: None,
        })
    }

    fn saved_total(&self) -> usize {
        self.job.saved_base() + self.saved
    }

    fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn run(&mut self) -> Result<Finish> {
        let meta = self.reader.metadata().clone();
        self.fps = if meta.fps > 0.0 { meta.fps } else { 30.0 };
        self.total_frames = meta.total_frames.max(1);
        let step = self.params.frame_step(self.fps);
        let threshold = self.params.threshold;

        tracing::info!(
            "Extractor: {} via {}, mode={:?} speed={:?} step={} threshold={:.1}",
            self.job.video_path.display(),
            self.reader.backend(),
            self.params.mode,
            self.params.speed,
            step,
            threshold
        );

        let board = self.params.mode == ContentMode::Board;
        if board && self.train_background(step)? == Finish::Cancelled {
            return Ok(Finish::Cancelled);
        }

        let start = self.job.resume.as_ref().map(|r| r.start_frame).unwrap_or(0);
        let resuming = self.job.resume.is_some();
        if start > 0 || board {
            self.reader.seek_to_frame(start)?;
        }

        let first = self
            .reader
            .read_frame()?
            .ok_or_else(|| InvalidVideo("cannot read the first frame".into()))?;
        self.position = self.reader.position();

        let mut reference = self.first_reference(&first)?;
        if self.params.enable_history {
            self.history.push_back(reference.try_clone()?);
        }

        if resuming {
            self.update_timing();
            self.emit("Resuming from checkpoint".to_string());
        } else {
            self.save(first)?;
        }

        loop {
            if self.cancelled() {
                return Ok(Finish::Cancelled);
            }
            std::thread::sleep(self.throttle);

            let Some(frame) = self.reader.advance(step)? else {
                break;
            };
            self.position = self.reader.position();
            self.maybe_reclaim();

            if self.cancelled() {
                return Ok(Finish::Cancelled);
            }
            self.update_timing();
            self.emit(format!("Extracted {} images", self.saved_total()));

            let gray = self.comparator.prepare(&frame)?;
            if self.params.mode.waits_for_stabilization() {
                if mean_abs_diff(&gray, &reference.gray)? <= threshold {
                    continue;
                }
                match self.stabilize(gray)? {
                    Settled::Frame(frame, gray) => {
                        if self.cancelled() {
                            return Ok(Finish::Cancelled);
                        }
                        self.consider(&mut reference, frame, gray, None)?;
                    }
                    Settled::Cancelled => return Ok(Finish::Cancelled),
                    Settled::EndOfStream => break,
                }
            } else {
                self.judge_masked(&mut reference, frame, gray)?;
            }
        }

        if board && !self.cancelled() {
            self.recheck_final_frame(&mut reference)?;
        }

        Ok(Finish::Completed)
    }

    fn first_reference(&mut self, first: &core::Mat) -> Result<Reference> {
        let mut gray = self.comparator.prepare(first)?;
        let mask = match (self.model.as_mut(), self.params.mode) {
            (None, _) => None,
            // A pre-trained model already knows what the background is.
            (Some(model), ContentMode::Board) => Some(model.background_mask(&gray)?),
            (Some(model), _) => Some(model.reset_to(&gray)?),
        };

        let reference_image = self
            .job
            .resume
            .as_ref()
            .and_then(|r| r.reference_image.as_deref());
        if let Some(path) = reference_image {
            let expected = gray.size()?;
            match self.load_reference(path) {
                Ok(saved) if saved.size().ok() == Some(expected) => gray = saved,
                Ok(_) => tracing::warn!(
                    "Extractor: reference {} has a different size, using resume frame",
                    path.display()
                ),
                Err(e) => tracing::warn!(
                    "Extractor: cannot load reference {}: {:#}, using resume frame",
                    path.display(),
                    e
                ),
            }
        }

        Ok(Reference { gray, mask })
    }

    fn load_reference(&mut self, path: &Path) -> Result<core::Mat> {
        let bytes =
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let buf = core::Vector::<u8>::from_slice(&bytes);
        let image = imgcodecs::imdecode(&buf, imgcodecs::IMREAD_COLOR)?;
        if image.empty() {
            return Err(anyhow!("Undecodable image {}", path.display()));
        }
        self.comparator.prepare(&image)
    }

    /// One full pass over the video so the board model knows the background
    /// before the extracting pass starts.
    fn train_background(&mut self, step: usize) -> Result<Finish> {
        tracing::info!("Extractor: training background model");
        self.reader.seek_to_frame(0)?;
        let mut next = self.reader.read_frame()?;
        while let Some(frame) = next {
            if self.cancelled() {
                return Ok(Finish::Cancelled);
            }
            let gray = self.comparator.prepare(&frame)?;
            if let Some(model) = self.model.as_mut() {
                model.learn(&gray)?;
            }
            self.position = self.reader.position();
            let trained = (self.position * 100 / self.total_frames).min(100);
            self.emit(format!("Learning background {}%", trained));
            self.maybe_reclaim();
            std::thread::sleep(self.throttle);
            next = self.reader.advance(step)?;
        }
        self.reclaim_bucket = 0;
        Ok(Finish::Completed)
    }

    /// Samples forward in sub-steps until consecutive samples stop changing.
    fn stabilize(&mut self, start: core::Mat) -> Result<Settled> {
        let sub_step = self.params.stable_step(self.fps);
        let need = self.params.speed.stable_checks();
        let mut last = start;
        let mut stable = 0;

        loop {
            if self.cancelled() {
                return Ok(Settled::Cancelled);
            }
            std::thread::sleep(self.throttle);

            let Some(frame) = self.reader.advance(sub_step)? else {
                return Ok(Settled::EndOfStream);
            };
            self.position = self.reader.position();
            let gray = self.comparator.prepare(&frame)?;

            if mean_abs_diff(&gray, &last)? < STABLE_EPSILON {
                stable += 1;
            } else {
                stable = 0;
            }
            if stable >= need {
                return Ok(Settled::Frame(frame, gray));
            }
            last = gray;
        }
    }

    fn background_mask(&mut self, gray: &core::Mat) -> Result<core::Mat> {
        self.model
            .as_mut()
            .ok_or_else(|| anyhow!("background model missing"))?
            .background_mask(gray)
    }

    /// Immediate-mode decision for one sample.
    fn judge_masked(
        &mut self,
        reference: &mut Reference,
        frame: core::Mat,
        gray: core::Mat,
    ) -> Result<()> {
        let mask = self.background_mask(&gray)?;
        match reference.score(&gray, Some(&mask))? {
            None => {
                tracing::trace!("Extractor: frame {} mostly occluded, skipped", self.position);
                Ok(())
            }
            Some(score) if score > self.params.threshold => {
                self.consider(reference, frame, gray, Some(mask))
            }
            Some(_) => reference.absorb(&gray, &mask),
        }
    }

    /// Saves the candidate unless it matches the reference or a recent image.
    /// The reference follows the candidate either way.
    fn consider(
        &mut self,
        reference: &mut Reference,
        frame: core::Mat,
        gray: core::Mat,
        mask: Option<core::Mat>,
    ) -> Result<()> {
        let threshold = self.params.threshold;
        let candidate = Reference { gray, mask };

        let changed = matches!(
            reference.score(&candidate.gray, candidate.mask.as_ref())?,
            Some(diff) if diff > threshold
        );
        let duplicate = self.params.enable_history && self.matches_history(&candidate)?;

        if changed && !duplicate {
            self.save(frame)?;
            if self.params.enable_history {
                self.history.push_back(candidate.try_clone()?);
                while self.history.len() > self.params.max_history.max(1) {
                    self.history.pop_front();
                }
            }
        } else if changed {
            tracing::debug!("Extractor: frame {} repeats a recent image", self.position);
        }
        *reference = candidate;
        Ok(())
    }

    fn matches_history(&self, candidate: &Reference) -> Result<bool> {
        for past in &self.history {
            if let Some(diff) = past.score(&candidate.gray, candidate.mask.as_ref())? {
                if diff <= self.params.threshold {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn recheck_final_frame(&mut self, reference: &mut Reference) -> Result<()> {
        let last = self.total_frames.saturating_sub(1);
        if self.position >= last {
            return Ok(());
        }
        self.reader.seek_to_frame(last)?;
        let Some(frame) = self.reader.read_frame()? else {
            return Ok(());
        };
        // Key-frame readers may land on a frame the main loop already judged.
        if self.reader.position() <= self.position {
            return Ok(());
        }
        self.position = self.reader.position();
        let gray = self.comparator.prepare(&frame)?;
        self.judge_masked(reference, frame, gray)
    }

    fn save(&mut self, frame: core::Mat) -> Result<()> {
        let path = self
            .job
            .output_dir
            .join(image_file_name(self.job.next_index() + self.saved));
        self.writer.submit(path, frame)?;
        self.saved += 1;
        self.saved_frames.push(self.position);
        tracing::debug!(
            "Extractor: saved image {} at frame {}",
            self.saved_total(),
            self.position
        );
        self.emit(format!("Extracted {} images", self.saved_total()));
        Ok(())
    }

    fn update_timing(&mut self) {
        let pct = (self.position as f64 / self.total_frames as f64 * 100.0).min(99.0) as u8;
        let elapsed = self.started.elapsed().as_secs_f64();
        self.percent = pct;
        self.eta = (pct > 2).then(|| round1(elapsed / pct as f64 * (100 - pct) as f64));
    }

    fn emit(&self, message: String) {
        self.progress.report(&Progress {
            saved_count: self.saved_total(),
            percent: self.percent,
            message,
            eta_seconds: self.eta,
            elapsed_seconds: round1(self.started.elapsed().as_secs_f64()),
            current_frame: self.position,
        });
    }

    fn maybe_reclaim(&mut self) {
        let bucket = self.position / RECLAIM_EVERY_N_FRAMES;
        if bucket > self.reclaim_bucket {
            self.reclaim_bucket = bucket;
            self.comparator.reclaim();
            self.history.shrink_to_fit();
        }
    }
}
