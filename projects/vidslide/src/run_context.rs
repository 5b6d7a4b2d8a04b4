use crate::extract::engine::image_index;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "avi", "mkv", "mov", "flv", "wmv", "webm", "m4v", "ts", "mpg", "mpeg", "3gp",
];

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// On-disk layout of one task's output directory.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskPaths {
    pub root: PathBuf,
}

impl TaskPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn images(&self) -> PathBuf {
        self.root.join("images")
    }

    pub fn packages(&self) -> PathBuf {
        self.root.join("packages")
    }

    /// Soft-deleted images.
    pub fn trash(&self) -> PathBuf {
        self.root.join(".trash")
    }

    pub fn thumbnail(&self) -> PathBuf {
        self.root.join("thumbnail.jpg")
    }

    pub fn create(&self) -> Result<()> {
        for dir in [self.images(), self.packages()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    /// Deletes all extracted images, trashed ones included, keeping an empty
    /// images directory. A fresh run numbers from zero again, so nothing from
    /// the old run may survive to collide with it.
    pub fn clear_images(&self) -> Result<()> {
        for dir in [self.images(), self.trash()] {
            if dir.exists() {
                fs::remove_dir_all(&dir)
                    .with_context(|| format!("Failed to clear {}", dir.display()))?;
            }
        }
        let images = self.images();
        fs::create_dir_all(&images)
            .with_context(|| format!("Failed to create {}", images.display()))?;
        Ok(())
    }

    /// Index for the next image file. Counts trashed images too so a restored
    /// image never collides with a new one.
    pub fn next_image_index(&self) -> usize {
        [self.images(), self.trash()]
            .iter()
            .flat_map(|dir| list_images(dir))
            .filter_map(|name| image_index(&name))
            .map(|i| i + 1)
            .max()
            .unwrap_or(0)
    }

    /// Most recent extracted image, used as the comparison baseline on resume.
    pub fn latest_image(&self) -> Option<PathBuf> {
        list_images(&self.images())
            .into_iter()
            .filter(|name| image_index(name).is_some())
            .max_by_key(|name| image_index(name))
            .map(|name| self.images().join(name))
    }
}

fn has_extension(path: &Path, allowed: &[&str]) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| allowed.contains(&s.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Video files under `folder`, sorted by path.
pub fn list_videos(folder: &Path) -> Vec<PathBuf> {
    WalkDir::new(folder)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| has_extension(e.path(), VIDEO_EXTENSIONS))
        .map(|e| e.path().to_path_buf())
        .collect()
}

/// Image file names directly inside `dir`, sorted. Empty if `dir` is missing.
pub fn list_images(dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter(|e| has_extension(&e.path(), IMAGE_EXTENSIONS))
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .collect();
    names.sort();
    names
}

pub fn count_images(dir: &Path) -> usize {
    list_images(dir).len()
}

/// Strips any directory components from a user-supplied file name.
pub fn safe_file_name(name: &str) -> Option<&str> {
    Path::new(name)
        .file_name()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
}
