// Export of a task's extracted images.

use crate::naming::sanitize_dirname;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PackageError {
    #[error("unsupported package format: {0}")]
    UnsupportedFormat(String),
    #[error("format {format} needs {dependency}, which is not available")]
    MissingDependency {
        format: String,
        dependency: &'static str,
    },
    #[error("permission denied writing {0}")]
    PermissionDenied(PathBuf),
    #[error("disk full writing {0}")]
    DiskFull(PathBuf),
    #[error("no images to package")]
    NoImages,
    #[error(transparent)]
    Io(io::Error),
}

impl PackageError {
    fn from_io(err: io::Error, path: &Path) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => PackageError::PermissionDenied(path.to_path_buf()),
            io::ErrorKind::StorageFull => PackageError::DiskFull(path.to_path_buf()),
            _ => PackageError::Io(err),
        }
    }
}

/// Turns an ordered image list into one deliverable inside `out_dir`.
pub trait Packager: Send + Sync {
    /// Returns the file (or directory) name created inside `out_dir`.
    fn package(
        &self,
        images: &[PathBuf],
        out_dir: &Path,
        format: &str,
        name: &str,
    ) -> Result<String, PackageError>;
}

/// Copies the images into `<out_dir>/<name>/`, renumbered in order.
///
/// Document formats are recognised but need an external writer.
pub struct DirectoryPackager;

impl DirectoryPackager {
    pub const FORMAT: &'static str = "images";
}

impl Packager for DirectoryPackager {
    fn package(
        &self,
        images: &[PathBuf],
        out_dir: &Path,
        format: &str,
        name: &str,
    ) -> Result<String, PackageError> {
        match format {
            Self::FORMAT => {}
            "pdf" => {
                return Err(PackageError::MissingDependency {
                    format: format.to_string(),
                    dependency: "a PDF writer",
                })
            }
            "pptx" => {
                return Err(PackageError::MissingDependency {
                    format: format.to_string(),
                    dependency: "a PPTX writer",
                })
            }
            "zip" => {
                return Err(PackageError::MissingDependency {
                    format: format.to_string(),
                    dependency: "a ZIP writer",
                })
            }
            other => return Err(PackageError::UnsupportedFormat(other.to_string())),
        }
        if images.is_empty() {
            return Err(PackageError::NoImages);
        }

        let dir_name = sanitize_dirname(name, "");
        let target = out_dir.join(&dir_name);
        if target.exists() {
            fs::remove_dir_all(&target).map_err(|e| PackageError::from_io(e, &target))?;
        }
        fs::create_dir_all(&target).map_err(|e| PackageError::from_io(e, &target))?;

        for (i, image) in images.iter().enumerate() {
            let ext = image
                .extension()
                .and_then(|s| s.to_str())
                .unwrap_or("jpg");
            let dest = target.join(format!("{:03}.{}", i + 1, ext));
            fs::copy(image, &dest).map_err(|e| PackageError::from_io(e, &dest))?;
        }
        tracing::info!(
            "Packager: wrote {} images to {}",
            images.len(),
            target.display()
        );
        Ok(dir_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("vidslide-pkg-{}-{}", tag, uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_directory_package_keeps_order() {
        let dir = temp_dir("order");
        let images: Vec<PathBuf> = ["slide_0000.jpg", "slide_0001.jpg", "slide_0002.jpg"]
            .iter()
            .map(|n| {
                let p = dir.join(n);
                fs::write(&p, n.as_bytes()).unwrap();
                p
            })
            .collect();
        let out = dir.join("packages");

        let name = DirectoryPackager
            .package(&images, &out, "images", "第3讲: 矩阵")
            .unwrap();
        assert_eq!(name, "第3讲_ 矩阵");
        let copied = fs::read(out.join(&name).join("002.jpg")).unwrap();
        assert_eq!(copied, b"slide_0001.jpg");
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_format_errors_are_classified() {
        let out = std::env::temp_dir();
        let images = vec![PathBuf::from("a.jpg")];
        assert!(matches!(
            DirectoryPackager.package(&images, &out, "pdf", "x"),
            Err(PackageError::MissingDependency { .. })
        ));
        assert!(matches!(
            DirectoryPackager.package(&images, &out, "gif", "x"),
            Err(PackageError::UnsupportedFormat(f)) if f == "gif"
        ));
        assert!(matches!(
            DirectoryPackager.package(&[], &out, "images", "x"),
            Err(PackageError::NoImages)
        ));
    }
}
