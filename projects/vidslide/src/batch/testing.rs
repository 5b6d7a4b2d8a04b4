// Fakes for exercising the scheduler without real videos.

use super::admission::SpaceProbe;
use super::events::BatchEvent;
use super::scheduler::{Batch, BatchServices, IngestEntry};
use super::task::TaskRecord;
use crate::config::ExtractParams;
use crate::error::{ExtractFailure, FailureKind, InvalidVideo};
use crate::extract::engine::image_file_name;
use crate::extract::{
    CancelToken, ExtractJob, ExtractOutcome, ExtractReport, Extractor, Progress, ProgressSink,
    ResumePoint,
};
use crate::video::probe::MetadataProbe;
use crate::video::VideoMetadata;
use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

const FRAMES_PER_STEP: usize = 10;
const STEP_DELAY: Duration = Duration::from_millis(5);

#[derive(Default)]
struct FakeState {
    running: AtomicUsize,
    max_seen: AtomicUsize,
    resumes: Mutex<Vec<ResumePoint>>,
}

/// Writes one image per step, `steps` steps per video.
#[derive(Clone)]
pub struct FakeExtractor {
    steps: usize,
    fail_on: Option<String>,
    state: Arc<FakeState>,
}

impl FakeExtractor {
    pub fn new(steps: usize) -> Self {
        Self {
            steps,
            fail_on: None,
            state: Arc::default(),
        }
    }

    /// Fails after the first step for videos whose file name contains `pattern`.
    pub fn failing_on(mut self, pattern: &str) -> Self {
        self.fail_on = Some(pattern.to_string());
        self
    }

    pub fn max_concurrent(&self) -> usize {
        self.state.max_seen.load(Ordering::SeqCst)
    }

    pub fn last_resume(&self) -> Option<ResumePoint> {
        self.state.resumes.lock().unwrap().last().cloned()
    }

    fn should_fail(&self, video: &Path) -> bool {
        let name = video.file_name().and_then(|s| s.to_str()).unwrap_or("");
        self.fail_on.as_deref().is_some_and(|p| name.contains(p))
    }

    fn run(
        &self,
        job: &ExtractJob,
        progress: &dyn ProgressSink,
        cancel: &dyn CancelToken,
    ) -> ExtractOutcome {
        let started = Instant::now();
        let offset = job.saved_base();
        let next_index = job.next_index();
        let first_step = job
            .resume
            .as_ref()
            .map(|r| r.start_frame / FRAMES_PER_STEP)
            .unwrap_or(0);
        fs::create_dir_all(&job.output_dir).unwrap();

        let mut written = 0;
        let mut last_frame = first_step * FRAMES_PER_STEP;
        for step in first_step..self.steps {
            if cancel.is_cancelled() {
                return ExtractOutcome::Cancelled {
                    saved_count: offset + written,
                    last_frame,
                };
            }
            if step > first_step && self.should_fail(&job.video_path) {
                return ExtractOutcome::Failed {
                    failure: ExtractFailure::new(FailureKind::Decode, "corrupt packet"),
                    saved_count: offset + written,
                    last_frame,
                };
            }
            std::thread::sleep(STEP_DELAY);
            fs::write(job.output_dir.join(image_file_name(next_index + written)), b"jpg").unwrap();
            written += 1;
            last_frame = (step + 1) * FRAMES_PER_STEP;
            progress.report(&Progress {
                saved_count: offset + written,
                percent: ((step + 1) * 100 / self.steps).min(99) as u8,
                message: format!("Processing: {} images", offset + written),
                eta_seconds: None,
                elapsed_seconds: started.elapsed().as_secs_f64(),
                current_frame: last_frame,
            });
        }
        ExtractOutcome::Done(ExtractReport {
            saved_count: offset + written,
            elapsed: started.elapsed(),
            saved_frames: Vec::new(),
            last_frame,
        })
    }
}

impl Extractor for FakeExtractor {
    fn extract(
        &self,
        job: &ExtractJob,
        progress: &dyn ProgressSink,
        cancel: &dyn CancelToken,
    ) -> ExtractOutcome {
        let now = self.state.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_seen.fetch_max(now, Ordering::SeqCst);
        if let Some(resume) = &job.resume {
            self.state.resumes.lock().unwrap().push(resume.clone());
        }
        let outcome = self.run(job, progress, cancel);
        self.state.running.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

/// Accepts any path except ones containing "broken".
pub struct FakeProbe;

impl MetadataProbe for FakeProbe {
    fn probe(&self, path: &Path) -> Result<VideoMetadata> {
        if path.to_string_lossy().contains("broken") {
            return Err(InvalidVideo("no video stream".into()).into());
        }
        Ok(VideoMetadata {
            fps: 30.0,
            width: 1280,
            height: 720,
            total_frames: 900,
            codec: "h264".into(),
        })
    }

    fn thumbnail(&self, _video: &Path, out: &Path) -> Result<()> {
        fs::write(out, b"thumb")?;
        Ok(())
    }
}

pub struct FakeSpace(pub Option<u64>);

impl SpaceProbe for FakeSpace {
    fn free_bytes(&self, _path: &Path) -> Option<u64> {
        self.0
    }
}

pub fn task_with_frames(id: &str, total_frames: usize) -> TaskRecord {
    TaskRecord::new(
        id.into(),
        PathBuf::from(format!("{}.mp4", id)),
        id.into(),
        VideoMetadata {
            fps: 30.0,
            total_frames,
            ..Default::default()
        },
        PathBuf::from("out").join(id),
    )
}

/// Collects events published after it was created.
pub struct EventLog {
    rx: broadcast::Receiver<BatchEvent>,
}

impl EventLog {
    pub fn finish(mut self) -> Vec<BatchEvent> {
        let mut events = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(event) => events.push(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        events
    }
}

/// A batch in its own temp directory, removed on drop.
pub struct TestEnv {
    pub root: PathBuf,
    pub services: BatchServices,
    pub batch: Arc<Batch>,
}

impl TestEnv {
    pub fn new(tag: &str, extractor: FakeExtractor) -> Self {
        Self::with_space(tag, extractor, None)
    }

    pub fn with_space(tag: &str, extractor: FakeExtractor, free_bytes: Option<u64>) -> Self {
        Self::with_extractor(tag, Arc::new(extractor), free_bytes)
    }

    pub fn with_extractor(
        tag: &str,
        extractor: Arc<dyn Extractor>,
        free_bytes: Option<u64>,
    ) -> Self {
        let root = std::env::temp_dir().join(format!(
            "vidslide-batch-{}-{}",
            tag,
            uuid::Uuid::new_v4().simple()
        ));
        fs::create_dir_all(&root).unwrap();
        let services = BatchServices {
            extractor,
            probe: Arc::new(FakeProbe),
            space: Arc::new(FakeSpace(free_bytes)),
        };
        let batch = Batch::create(&root, ExtractParams::default(), 2, services.clone()).unwrap();
        Self {
            root,
            services,
            batch,
        }
    }

    pub fn ingest_named(&self, name: &str) -> TaskRecord {
        self.batch
            .ingest(IngestEntry::new(self.root.join("videos").join(name)))
            .unwrap()
    }

    pub fn ingest_many(&self, n: usize) -> Vec<TaskRecord> {
        (0..n)
            .map(|i| self.ingest_named(&format!("lecture_{:02}.mp4", i)))
            .collect()
    }

    pub fn record_events(&self) -> EventLog {
        EventLog {
            rx: self.batch.subscribe(),
        }
    }

    pub async fn wait_idle(&self) {
        tokio::time::timeout(Duration::from_secs(20), self.batch.wait_idle())
            .await
            .expect("batch did not go idle");
    }

    pub async fn wait_for_saved(&self, id: &str, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while self.batch.task(id).map(|t| t.saved_count).unwrap_or(0) < count {
            assert!(Instant::now() < deadline, "task {} never saved {} images", id, count);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
}

impl Drop for TestEnv {
    fn drop(&mut self) {
        self.batch.close();
        fs::remove_dir_all(&self.root).ok();
    }
}
