use crate::batch::{Batch, BatchRegistry, BatchServices, IngestEntry, RestoreMode, TaskState};
use crate::cli::{BatchCommand, ExtractArgs};
use crate::config::{default_max_workers, ExtractParams};
use crate::console::{BatchConsole, ExtractBar};
use crate::error::BatchError;
use crate::extract::{CancelFlag, ExtractJob, ExtractOutcome, Extractor, Progress, SceneExtractor};
use crate::naming::auto_increment_name;
use crate::package::DirectoryPackager;
use crate::run_context::list_videos;
use crate::video::probe::{DefaultProbe, MetadataProbe};
use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub async fn run_extract(args: ExtractArgs) -> Result<()> {
    let name = args
        .video
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("video")
        .to_string();
    let mut job = ExtractJob::new(args.video, args.output_dir, ExtractParams::from(args.params));
    match DefaultProbe.probe(&job.video_path) {
        Ok(meta) => job = job.with_codec(meta.codec),
        Err(e) => tracing::debug!("Extractor: probe failed, no codec hint: {:#}", e),
    }
    let cancel = CancelFlag::new();
    let bar = Arc::new(ExtractBar::new(&name)?);

    let worker = {
        let cancel = cancel.clone();
        let bar = bar.clone();
        tokio::task::spawn_blocking(move || {
            let on_progress = |progress: &Progress| bar.report(progress);
            SceneExtractor.extract(&job, &on_progress, &cancel)
        })
    };
    tokio::pin!(worker);

    let outcome = tokio::select! {
        outcome = &mut worker => outcome?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Extractor: interrupt received, stopping");
            cancel.cancel();
            worker.await?
        }
    };

    match outcome {
        ExtractOutcome::Done(report) => {
            bar.finish(format!("{} slides", report.saved_count));
            tracing::info!(
                "Extractor: {} slides in {:.1}s",
                report.saved_count,
                report.elapsed.as_secs_f64()
            );
            Ok(())
        }
        ExtractOutcome::Cancelled { saved_count, .. } => {
            bar.finish(format!("cancelled after {} slides", saved_count));
            Ok(())
        }
        ExtractOutcome::Failed { failure, .. } => {
            bar.finish("failed".to_string());
            bail!(failure)
        }
    }
}

pub async fn run_batch(command: BatchCommand) -> Result<()> {
    match command {
        BatchCommand::Run {
            inputs,
            root,
            workers,
            name,
            params,
        } => {
            let registry = BatchRegistry::new(&root, BatchServices::system());
            let workers = workers.unwrap_or_else(default_max_workers);
            let batch = registry.create(ExtractParams::from(params), workers)?;
            let ids = ingest_inputs(&batch, &inputs, name.as_deref());
            if ids.is_empty() {
                bail!("No usable videos found");
            }
            batch.enqueue(&ids)?;
            follow(&batch).await
        }
        BatchCommand::Resume {
            id,
            root,
            retry_failed,
        } => {
            let batch = recovered(&root, &id)?;
            if retry_failed {
                let failed: Vec<String> = batch
                    .tasks()
                    .into_iter()
                    .filter(|t| t.state == TaskState::ERROR)
                    .map(|t| t.id)
                    .collect();
                for task_id in &failed {
                    batch.retry(task_id, true)?;
                }
                tracing::info!("Batch {}: requeued {} failed tasks", id, failed.len());
            }
            follow(&batch).await
        }
        BatchCommand::Restore {
            id,
            task,
            root,
            mode,
        } => {
            let batch = recovered(&root, &id)?;
            let restored = batch.restore(&task, mode)?;
            println!("{} restored as {}", restored.display_name, restored.state);
            if mode != RestoreMode::Completed {
                follow(&batch).await?;
            }
            Ok(())
        }
        BatchCommand::Package {
            id,
            task,
            root,
            format,
        } => {
            let batch = recovered(&root, &id)?;
            let name = batch.package(&task, &format, &DirectoryPackager)?;
            println!("{}", name);
            Ok(())
        }
        BatchCommand::Status { root } => {
            print_status(&root);
            Ok(())
        }
    }
}

/// Expands folders into their videos and ingests everything. Rejected
/// videos are logged and skipped.
fn ingest_inputs(batch: &Batch, inputs: &[PathBuf], base_name: Option<&str>) -> Vec<String> {
    let videos: Vec<PathBuf> = inputs
        .iter()
        .flat_map(|input| {
            if input.is_dir() {
                list_videos(input)
            } else {
                vec![input.clone()]
            }
        })
        .collect();
    let names = base_name
        .map(|base| auto_increment_name(base, videos.len()))
        .unwrap_or_default();

    let mut ids = Vec::new();
    for (i, path) in videos.into_iter().enumerate() {
        let entry = IngestEntry {
            path,
            display_name: names.get(i).cloned(),
        };
        match batch.ingest(entry) {
            Ok(task) => ids.push(task.id),
            Err(e) => tracing::warn!("Batch {}: {}", batch.id(), e),
        }
    }
    ids
}

fn recovered(root: &Path, id: &str) -> Result<Arc<Batch>> {
    let registry = BatchRegistry::new(root, BatchServices::system());
    registry.recover();
    registry
        .get(id)
        .ok_or_else(|| BatchError::BatchNotFound(id.to_string()))
        .with_context(|| format!("No batch {} under {}", id, root.display()))
}

/// Starts the batch and renders it until done. Ctrl-C stops after the
/// running tasks; a second Ctrl-C cancels them.
async fn follow(batch: &Arc<Batch>) -> Result<()> {
    let console = BatchConsole::new()?;
    let events = batch.listen();
    batch.start()?;

    let render = console.follow(events);
    tokio::pin!(render);
    let summary = tokio::select! {
        summary = &mut render => summary,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Batch {}: interrupt received, finishing running tasks", batch.id());
            if let Err(e) = batch.pause_after_current() {
                tracing::debug!("Batch {}: {}", batch.id(), e);
            }
            tokio::select! {
                summary = &mut render => summary,
                _ = tokio::signal::ctrl_c() => {
                    batch.close();
                    batch.wait_idle().await;
                    None
                }
            }
        }
    };

    match summary {
        Some(summary) => {
            tracing::info!(
                "Batch {}: {} done, {} failed, {} images in {:.1}s",
                batch.id(),
                summary.completed_count,
                summary.failed_count,
                summary.total_images,
                summary.elapsed_seconds
            );
            if summary.failed_count > 0 {
                tracing::warn!(
                    "Batch {}: rerun failed tasks with `vidslide batch resume {} --retry-failed`",
                    batch.id(),
                    batch.id()
                );
            }
        }
        None => tracing::warn!("Batch {}: stopped before finishing", batch.id()),
    }
    Ok(())
}

pub fn print_status(root: &Path) {
    let registry = BatchRegistry::new(root, BatchServices::system());
    registry.recover();
    let batches = registry.list();
    if batches.is_empty() {
        println!("No batches under {}", root.display());
        return;
    }
    for summary in batches {
        println!(
            "{}  {}  {:>3} tasks  {:>3} done  {:>3} failed  {:>5.1}%  {}",
            summary.id,
            summary.created_at.format("%Y-%m-%d %H:%M"),
            summary.task_count,
            summary.completed_count,
            summary.failed_count,
            summary.global_progress,
            summary.dir.display()
        );
        let Some(batch) = registry.get(&summary.id) else {
            continue;
        };
        for task in batch.tasks() {
            let detail = task.error.as_deref().unwrap_or(&task.message);
            println!(
                "    {}  {:<10} {:>3}%  {:>4} images  {}  {}",
                task.id,
                task.state.label(),
                task.progress,
                task.saved_count,
                task.display_name,
                detail
            );
        }
        for archived in batch.archived() {
            println!(
                "    {}  archived ({:?})  {}",
                archived.task.id, archived.reason, archived.task.display_name
            );
        }
    }
}
