pub mod background;
pub mod compare;
pub mod engine;
pub mod writer;

use crate::config::ExtractParams;
use crate::error::ExtractFailure;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub use engine::SceneExtractor;

/// Where a resumed extraction picks up.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumePoint {
    /// Frame to seek to. Its image is a comparison reference, never saved.
    pub start_frame: usize,
    /// Index of the next image file to write. Can run ahead of
    /// `saved_base` when earlier images were trashed.
    pub next_index: usize,
    /// Images already in the output directory.
    pub saved_base: usize,
    /// Last image written before the interruption. Used as the comparison
    /// baseline when present.
    pub reference_image: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ExtractJob {
    pub video_path: PathBuf,
    pub output_dir: PathBuf,
    pub params: ExtractParams,
    pub resume: Option<ResumePoint>,
    /// Codec reported by the metadata probe, used to pick a hardware decoder.
    pub codec: Option<String>,
}

impl ExtractJob {
    pub fn new(video_path: PathBuf, output_dir: PathBuf, params: ExtractParams) -> Self {
        Self {
            video_path,
            output_dir,
            params,
            resume: None,
            codec: None,
        }
    }

    pub fn with_codec(mut self, codec: impl Into<String>) -> Self {
        self.codec = Some(codec.into());
        self
    }

    pub fn saved_base(&self) -> usize {
        self.resume.as_ref().map(|r| r.saved_base).unwrap_or(0)
    }

    pub fn next_index(&self) -> usize {
        self.resume.as_ref().map(|r| r.next_index).unwrap_or(0)
    }
}

/// A progress report. `saved_count` includes images from before a resume.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Progress {
    pub saved_count: usize,
    pub percent: u8,
    pub message: String,
    /// Seconds, `None` until enough of the video has been seen.
    pub eta_seconds: Option<f64>,
    pub elapsed_seconds: f64,
    pub current_frame: usize,
}

pub trait ProgressSink {
    fn report(&self, progress: &Progress);
}

impl<F> ProgressSink for F
where
    F: Fn(&Progress),
{
    fn report(&self, progress: &Progress) {
        self(progress)
    }
}

pub trait CancelToken {
    fn is_cancelled(&self) -> bool;
}

impl<F> CancelToken for F
where
    F: Fn() -> bool,
{
    fn is_cancelled(&self) -> bool {
        self()
    }
}

/// Shared cancellation flag, cloned into whoever needs to stop a task.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

impl CancelToken for CancelFlag {
    fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractReport {
    /// Total images in the output, including those from before a resume.
    pub saved_count: usize,
    pub elapsed: Duration,
    /// Frame indices of the images written in this run.
    pub saved_frames: Vec<usize>,
    pub last_frame: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExtractOutcome {
    Done(ExtractReport),
    Cancelled {
        saved_count: usize,
        last_frame: usize,
    },
    Failed {
        failure: ExtractFailure,
        saved_count: usize,
        last_frame: usize,
    },
}

/// Runs one extraction to completion on the calling thread.
pub trait Extractor: Send + Sync {
    fn extract(
        &self,
        job: &ExtractJob,
        progress: &dyn ProgressSink,
        cancel: &dyn CancelToken,
    ) -> ExtractOutcome;
}
