// Background JPEG writer: a bounded channel feeding a couple of encoder threads
// so the decode loop never waits on disk.

use anyhow::{anyhow, Context, Result};
use crossbeam::channel::{self, Sender};
use opencv::{core, imgcodecs, prelude::*};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Encodes and writes a JPEG. Goes through `imencode` + `fs::write` so
/// non-ASCII paths work on every platform.
pub fn write_jpeg(path: &Path, image: &core::Mat, quality: i32) -> Result<()> {
    let mut buf = core::Vector::<u8>::new();
    let params = core::Vector::<i32>::from_slice(&[imgcodecs::IMWRITE_JPEG_QUALITY, quality]);
    if !imgcodecs::imencode(".jpg", image, &mut buf, &params)? {
        return Err(anyhow!("JPEG encoding failed for {}", path.display()));
    }
    std::fs::write(path, buf.as_slice())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

struct WriteJob {
    path: PathBuf,
    image: core::Mat,
}

pub struct ImageWriter {
    tx: Option<Sender<WriteJob>>,
    handles: Vec<JoinHandle<()>>,
    errors: Arc<Mutex<Vec<anyhow::Error>>>,
    quality: i32,
}

impl ImageWriter {
    pub fn new(threads: usize, queue_depth: usize, quality: i32) -> Self {
        let (tx, rx) = channel::bounded::<WriteJob>(queue_depth.max(1));
        let errors = Arc::new(Mutex::new(Vec::new()));

        let handles = (0..threads.max(1))
            .map(|i| {
                let rx = rx.clone();
                let errors = errors.clone();
                thread::Builder::new()
                    .name(format!("jpeg-writer-{}", i))
                    .spawn(move || {
                        for job in rx {
                            if let Err(e) = write_jpeg(&job.path, &job.image, quality) {
                                tracing::error!("Writer: {:#}", e);
                                if let Ok(mut errs) = errors.lock() {
                                    errs.push(e);
                                }
                            }
                        }
                    })
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(e) => {
                    tracing::error!("Writer: failed to spawn encoder thread: {}", e);
                    None
                }
            })
            .collect();

        Self {
            tx: Some(tx),
            handles,
            errors,
            quality,
        }
    }

    /// Queues an image. Blocks while the queue is full.
    pub fn submit(&self, path: PathBuf, image: core::Mat) -> Result<()> {
        if self.handles.is_empty() {
            return write_jpeg(&path, &image, self.quality);
        }
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| anyhow!("Writer already finished"))?;
        tx.send(WriteJob { path, image })
            .map_err(|_| anyhow!("Writer threads are gone"))
    }

    /// Waits for every queued write. Returns the first write error, if any.
    pub fn finish(mut self) -> Result<()> {
        self.join_all();
        let mut errors = self
            .errors
            .lock()
            .map_err(|_| anyhow!("Writer error list poisoned"))?;
        let first = errors.drain(..).next();
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn join_all(&mut self) {
        drop(self.tx.take());
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::error!("Writer: encoder thread panicked");
            }
        }
    }
}

impl Drop for ImageWriter {
    fn drop(&mut self) {
        self.join_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("vidslide-writer-{}-{}", tag, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_writer_flushes_all_images() {
        let dir = temp_dir("flush");
        let writer = ImageWriter::new(2, 2, 90);
        for i in 0..6 {
            let img = core::Mat::new_rows_cols_with_default(
                24,
                32,
                core::CV_8UC3,
                core::Scalar::all((i * 40) as f64),
            )
            .unwrap();
            writer.submit(dir.join(format!("slide_{:04}.jpg", i)), img).unwrap();
        }
        writer.finish().unwrap();

        let count = std::fs::read_dir(&dir).unwrap().count();
        assert_eq!(count, 6);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_writer_reports_failures() {
        let dir = temp_dir("fail");
        let writer = ImageWriter::new(1, 1, 90);
        let img = core::Mat::new_rows_cols_with_default(8, 8, core::CV_8UC3, core::Scalar::all(0.0))
            .unwrap();
        writer
            .submit(dir.join("missing-subdir").join("slide_0000.jpg"), img)
            .unwrap();
        assert!(writer.finish().is_err());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_unicode_path() {
        let dir = temp_dir("unicode");
        let img = core::Mat::new_rows_cols_with_default(8, 8, core::CV_8UC3, core::Scalar::all(128.0))
            .unwrap();
        let path = dir.join("第3讲_幻灯片.jpg");
        write_jpeg(&path, &img, 95).unwrap();
        assert!(path.exists());
        std::fs::remove_dir_all(&dir).ok();
    }
}
