// Terminal progress rendering for the CLI.

use crate::batch::checkpoint::BatchSnapshot;
use crate::batch::{BatchEvent, RunStatus, TaskState};
use crate::extract::Progress;
use anyhow::Result;
use futures::{Stream, StreamExt};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;

const TASK_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {prefix} {msg}";
const OVERALL_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.green/white}] {pos:>3}% batch {msg}";

fn style(template: &str) -> Result<ProgressStyle> {
    Ok(ProgressStyle::default_bar()
        .template(template)?
        .progress_chars("#>-"))
}

/// Progress bar for a single extraction.
pub struct ExtractBar {
    pb: ProgressBar,
}

impl ExtractBar {
    pub fn new(name: &str) -> Result<Self> {
        let pb = ProgressBar::new(100);
        pb.set_style(style(TASK_TEMPLATE)?);
        pb.set_prefix(name.to_string());
        Ok(Self { pb })
    }

    pub fn report(&self, progress: &Progress) {
        self.pb.set_position(progress.percent as u64);
        match progress.eta_seconds {
            Some(eta) => self
                .pb
                .set_message(format!("{} (eta {:.0}s)", progress.message, eta)),
            None => self.pb.set_message(progress.message.clone()),
        }
    }

    pub fn finish(&self, message: String) {
        self.pb.finish_with_message(message);
    }
}

/// What the batch ended with, as reported by its last event.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub completed_count: usize,
    pub failed_count: usize,
    pub total_images: usize,
    pub elapsed_seconds: f64,
}

/// One bar per running task plus an overall bar, driven by batch events.
pub struct BatchConsole {
    multi: MultiProgress,
    overall: ProgressBar,
    bars: HashMap<String, ProgressBar>,
    names: HashMap<String, String>,
}

impl BatchConsole {
    pub fn new() -> Result<Self> {
        let multi = MultiProgress::new();
        let overall = multi.add(ProgressBar::new(100));
        overall.set_style(style(OVERALL_TEMPLATE)?);
        Ok(Self {
            multi,
            overall,
            bars: HashMap::new(),
            names: HashMap::new(),
        })
    }

    fn bar(&mut self, task_id: &str) -> &ProgressBar {
        let name = self.names.get(task_id).cloned().unwrap_or_else(|| task_id.to_string());
        let multi = &self.multi;
        self.bars.entry(task_id.to_string()).or_insert_with(|| {
            let pb = multi.add(ProgressBar::new(100));
            if let Ok(style) = style(TASK_TEMPLATE) {
                pb.set_style(style);
            }
            pb.set_prefix(name);
            pb
        })
    }

    fn load(&mut self, snapshot: &BatchSnapshot) {
        for task in &snapshot.state.tasks {
            self.names.insert(task.id.clone(), task.display_name.clone());
        }
        self.overall.set_position(snapshot.global_progress as u64);
    }

    fn finish_bar(&mut self, task_id: &str, message: String) {
        if let Some(pb) = self.bars.remove(task_id) {
            pb.finish_with_message(message);
        }
    }

    /// Applies one event. Returns the run summary once the batch is done.
    pub fn apply(&mut self, event: &BatchEvent) -> Option<RunSummary> {
        match event {
            BatchEvent::Snapshot { state } => self.load(state),
            BatchEvent::TaskAdded { task } => {
                self.names.insert(task.id.clone(), task.display_name.clone());
            }
            BatchEvent::TaskRenamed {
                task_id,
                display_name,
            } => {
                self.names.insert(task_id.clone(), display_name.clone());
                if let Some(pb) = self.bars.get(task_id) {
                    pb.set_prefix(display_name.clone());
                }
            }
            BatchEvent::TaskState {
                task_id,
                state,
                message,
                global_progress,
                ..
            } => {
                self.overall.set_position(*global_progress as u64);
                match *state {
                    TaskState::RUNNING => self.bar(task_id).set_message(message.clone()),
                    TaskState::Completed | TaskState::ERROR => {
                        self.finish_bar(task_id, message.clone())
                    }
                    _ => {}
                }
            }
            BatchEvent::TaskProgress {
                task_id,
                percent,
                message,
                eta_seconds,
                global_progress,
                ..
            } => {
                self.overall.set_position(*global_progress as u64);
                let pb = self.bar(task_id);
                pb.set_position(*percent as u64);
                match eta_seconds {
                    Some(eta) => pb.set_message(format!("{} (eta {:.0}s)", message, eta)),
                    None => pb.set_message(message.clone()),
                }
            }
            BatchEvent::TaskArchived { task_id } => {
                self.finish_bar(task_id, "archived".to_string())
            }
            BatchEvent::BatchStatus { status, pausing } => {
                let label = match (status, pausing) {
                    (RunStatus::Processing, true) => "pausing",
                    (RunStatus::Processing, false) => "processing",
                    (RunStatus::Idle, _) => "idle",
                };
                self.overall.set_message(label);
            }
            BatchEvent::DiskWarning { free_mb } => {
                let _ = self
                    .multi
                    .println(format!("warning: only {} MB free, task skipped", free_mb));
            }
            BatchEvent::BatchDone {
                completed_count,
                failed_count,
                total_images,
                elapsed_seconds,
            } => {
                self.overall.finish_with_message(format!(
                    "{} done, {} failed, {} images",
                    completed_count, failed_count, total_images
                ));
                return Some(RunSummary {
                    completed_count: *completed_count,
                    failed_count: *failed_count,
                    total_images: *total_images,
                    elapsed_seconds: *elapsed_seconds,
                });
            }
            BatchEvent::PackagingDone { name, format, .. } => {
                let _ = self.multi.println(format!("packaged {} ({})", name, format));
            }
            BatchEvent::PackagingError { message, .. } => {
                let _ = self.multi.println(format!("packaging failed: {}", message));
            }
            BatchEvent::TaskDeleted { .. } | BatchEvent::Closed => {}
        }
        None
    }

    /// Renders events until the batch reports it is done or closes.
    pub async fn follow<S>(mut self, events: S) -> Option<RunSummary>
    where
        S: Stream<Item = BatchEvent>,
    {
        futures::pin_mut!(events);
        while let Some(event) = events.next().await {
            if let Some(summary) = self.apply(&event) {
                return Some(summary);
            }
        }
        None
    }
}
