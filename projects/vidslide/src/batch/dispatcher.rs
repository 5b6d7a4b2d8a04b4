// Admits waiting tasks into worker slots until the queue drains or a pause
// is requested, then waits for the workers it started.

use super::admission::{check_disk, Admission};
use super::scheduler::{Batch, Claim};
use crate::config::{DISPATCH_IDLE_POLL, DISPATCH_YIELD};
use crate::error::{ExtractFailure, FailureKind};
use crate::extract::{ExtractOutcome, Progress};
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinSet;

pub(crate) async fn run(batch: Arc<Batch>) {
    tracing::info!("Dispatcher {}: started", batch.id());
    let mut workers = JoinSet::new();

    loop {
        if batch.pause_requested() {
            tracing::info!("Dispatcher {}: pause requested, no new tasks", batch.id());
            break;
        }

        let Some(id) = batch.next_waiting() else {
            if workers.is_empty() {
                break;
            }
            tokio::select! {
                _ = workers.join_next() => {}
                _ = tokio::time::sleep(DISPATCH_IDLE_POLL) => {}
            }
            continue;
        };

        if let Admission::LowDisk(free_mb) = check_disk(batch.services().space.as_ref(), batch.dir()) {
            batch.reject_for_space(&id, free_mb);
            continue;
        }

        let slots = batch.slots();
        let permit = tokio::select! {
            permit = slots.acquire() => permit,
            Some(_) = workers.join_next() => continue,
            _ = tokio::time::sleep(DISPATCH_IDLE_POLL) => continue,
        };
        let Some(permit) = permit else {
            // Worker limit changed; pick up the new slots.
            continue;
        };
        if batch.pause_requested() {
            break;
        }
        // Permits from retired slots may still be held by running workers.
        if batch.running_count() >= batch.max_workers() {
            drop(permit);
            tokio::select! {
                _ = workers.join_next() => {}
                _ = tokio::time::sleep(DISPATCH_IDLE_POLL) => {}
            }
            continue;
        }

        // The head of the queue may have moved while we waited for a slot.
        let Some(id) = batch.next_waiting() else {
            continue;
        };
        let Some(claim) = batch.claim(&id) else {
            continue;
        };
        workers.spawn(run_worker(batch.clone(), claim, permit));
        tokio::time::sleep(DISPATCH_YIELD).await;
    }

    while let Some(result) = workers.join_next().await {
        if let Err(e) = result {
            tracing::error!("Dispatcher {}: worker join failed: {}", batch.id(), e);
        }
    }
    batch.finish_run();
    tracing::info!("Dispatcher {}: stopped", batch.id());
}

/// Runs one extraction on the blocking pool. A panic inside the extractor
/// fails only this task.
async fn run_worker(batch: Arc<Batch>, claim: Claim, permit: OwnedSemaphorePermit) {
    let Claim {
        id,
        mut job,
        cancel,
        needs_probe,
    } = claim;

    let blocking = {
        let batch = batch.clone();
        let id = id.clone();
        tokio::task::spawn_blocking(move || {
            let services = batch.services().clone();
            if needs_probe {
                match services.probe.probe(&job.video_path) {
                    Ok(meta) => {
                        job.codec = Some(meta.codec.clone());
                        batch.record_metadata(&id, meta);
                    }
                    Err(e) => tracing::warn!("Worker {}: late probe failed: {:#}", id, e),
                }
            }
            let on_progress = |progress: &Progress| batch.record_progress(&id, progress);
            services.extractor.extract(&job, &on_progress, &cancel)
        })
    };

    let outcome = match blocking.await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!("Worker {}: crashed: {}", id, e);
            let saved_count = batch.task(&id).map(|t| t.saved_count).unwrap_or(0);
            let last_frame = batch.task(&id).map(|t| t.last_frame).unwrap_or(0);
            ExtractOutcome::Failed {
                failure: ExtractFailure::new(FailureKind::Other, format!("worker crashed: {}", e)),
                saved_count,
                last_frame,
            }
        }
    };
    batch.complete(&id, outcome);
    drop(permit);
}
