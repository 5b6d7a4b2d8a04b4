//! Extraction parameters and the tuned constants behind them.
//!
//! The numeric constants below were tuned by hand against recorded lectures.
//! Change them only together with the scenario tests in `extract::engine`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Left edge of the default region of interest, as a fraction of frame width.
pub const ROI_X_FRACTION: f32 = 0.208;
/// Top edge of the default region of interest, as a fraction of frame height.
pub const ROI_Y_FRACTION: f32 = 0.185;

/// Width of the comparison buffer in eco/fast mode.
pub const COMPARE_WIDTH: i32 = 480;
/// Width of the comparison buffer in turbo mode.
pub const COMPARE_WIDTH_TURBO: i32 = 320;

/// Two consecutive stabilization samples closer than this are "settled".
pub const STABLE_EPSILON: f64 = 1.0;
/// Sub-step between stabilization samples, in seconds.
pub const STABLE_STEP_SECS: f64 = 0.5;
pub const STABLE_STEP_SECS_TURBO: f64 = 0.3;
/// Consecutive settled samples required before a candidate is accepted.
pub const STABLE_CHECKS: usize = 2;
pub const STABLE_CHECKS_TURBO: usize = 1;

/// Frames with less visible background than this are treated as occluded.
pub const MIN_BACKGROUND_FRACTION: f64 = 0.10;
/// Background model memory, in sampled frames (not video frames).
pub const BG_HISTORY: i32 = 20;
/// Fixed per-sample learning rate, so early samples do not adapt faster.
pub const BG_LEARNING_RATE: f64 = 1.0 / BG_HISTORY as f64;
/// A pixel value must carry this much model weight before it counts as
/// background. At the learning rate above, something standing still is
/// absorbed after roughly 14 samples.
pub const BG_BACKGROUND_RATIO: f64 = 0.5;
pub const BG_VAR_THRESHOLD: f64 = 16.0;
/// Foreground blobs are grown by this kernel so edges of a person don't leak
/// into the background comparison.
pub const FOREGROUND_DILATE_PX: i32 = 15;

/// Scratch buffers are dropped every this many decoded frames.
pub const RECLAIM_EVERY_N_FRAMES: usize = 500;

pub const JPEG_QUALITY: i32 = 95;
pub const THUMBNAIL_QUALITY: i32 = 80;
pub const THUMBNAIL_WIDTH: i32 = 320;

pub const WRITER_THREADS: usize = 2;
pub const WRITER_QUEUE_DEPTH: usize = 8;

/// Key-frame decoding is only used when the step is at least this long.
pub const KEYFRAME_MIN_STEP_SECS: f64 = 4.0;

/// Videos shorter than this are rejected at ingestion.
pub const MIN_VIDEO_FRAMES: usize = 10;

/// Admission floor: tasks are failed instead of started below this.
pub const DISK_FLOOR_MB: u64 = 500;
/// Per-listener event buffer; older events are dropped for slow listeners.
pub const EVENT_BUFFER: usize = 200;
/// Minimum spacing of checkpoint writes driven by progress reports.
pub const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(10);
/// Dispatcher pause between admissions.
pub const DISPATCH_YIELD: Duration = Duration::from_millis(100);
/// Dispatcher poll interval while only running tasks remain.
pub const DISPATCH_IDLE_POLL: Duration = Duration::from_millis(500);

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SpeedMode {
    /// Background friendly: 8ms throttle per iteration.
    Eco,
    #[default]
    Fast,
    /// Fast plus doubled slide step, 320px compare and a shorter settle check.
    Turbo,
}

impl SpeedMode {
    pub fn throttle(self) -> Duration {
        match self {
            SpeedMode::Eco => Duration::from_millis(8),
            SpeedMode::Fast | SpeedMode::Turbo => Duration::from_millis(1),
        }
    }

    pub fn is_turbo(self) -> bool {
        self == SpeedMode::Turbo
    }

    pub fn compare_width(self) -> i32 {
        if self.is_turbo() {
            COMPARE_WIDTH_TURBO
        } else {
            COMPARE_WIDTH
        }
    }

    pub fn stable_step_secs(self) -> f64 {
        if self.is_turbo() {
            STABLE_STEP_SECS_TURBO
        } else {
            STABLE_STEP_SECS
        }
    }

    pub fn stable_checks(self) -> usize {
        if self.is_turbo() {
            STABLE_CHECKS_TURBO
        } else {
            STABLE_CHECKS
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ContentMode {
    /// Screen/slide recordings: no persistent foreground, wait for transitions to settle.
    #[default]
    Slides,
    /// Slides with a presenter in frame.
    Mixed,
    /// Blackboard/whiteboard recordings with a lecturer walking in front.
    Board,
}

impl ContentMode {
    /// Main-loop step, in seconds of video.
    pub fn step_secs(self, speed: SpeedMode) -> f64 {
        match (self, speed.is_turbo()) {
            (ContentMode::Slides, false) => 1.0,
            (ContentMode::Slides, true) => 2.0,
            (ContentMode::Mixed, _) => 3.0,
            (ContentMode::Board, false) => 5.0,
            (ContentMode::Board, true) => 10.0,
        }
    }

    pub fn uses_background_model(self) -> bool {
        !matches!(self, ContentMode::Slides)
    }

    pub fn waits_for_stabilization(self) -> bool {
        matches!(self, ContentMode::Slides)
    }
}

/// Batch-wide extraction parameters.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ExtractParams {
    pub threshold: f64,
    pub mode: ContentMode,
    pub speed: SpeedMode,
    pub enable_history: bool,
    pub max_history: usize,
    pub use_roi: bool,
    /// Downscale the ROI before comparing.
    pub fast_compare: bool,
    pub use_gpu: bool,
    /// Decode key frames only when the step is long enough.
    pub keyframe_seek: bool,
}

impl Default for ExtractParams {
    fn default() -> Self {
        Self {
            threshold: 5.0,
            mode: ContentMode::Slides,
            speed: SpeedMode::Fast,
            enable_history: true,
            max_history: 5,
            use_roi: true,
            fast_compare: true,
            use_gpu: true,
            keyframe_seek: true,
        }
    }
}

impl ExtractParams {
    /// Frames advanced per main-loop iteration.
    pub fn frame_step(&self, fps: f64) -> usize {
        ((fps * self.mode.step_secs(self.speed)).round() as usize).max(1)
    }

    /// Frames advanced per stabilization sub-sample.
    pub fn stable_step(&self, fps: f64) -> usize {
        ((fps * self.speed.stable_step_secs()).round() as usize).max(1)
    }

    /// Key frames are only worth it for the long-step, non-stabilizing modes.
    pub fn wants_keyframes(&self) -> bool {
        self.keyframe_seek
            && !self.mode.waits_for_stabilization()
            && self.mode.step_secs(self.speed) >= KEYFRAME_MIN_STEP_SECS
    }
}

/// Default worker count from the machine's CPU and memory budget.
pub fn default_max_workers() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);

    let mut system = sysinfo::System::new();
    system.refresh_memory();
    let total_bytes = system.total_memory();
    if total_bytes == 0 {
        tracing::warn!("Could not read total memory, defaulting to 2 workers");
        return 2;
    }
    let mem_gb = total_bytes / (1024 * 1024 * 1024);

    let cpu_budget = (cpus / 4 + 1).max(1);
    let mem_budget = ((mem_gb / 4) as usize).max(1);
    cpu_budget.min(mem_budget).clamp(1, 3)
}
