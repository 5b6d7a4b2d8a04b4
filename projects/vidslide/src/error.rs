use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Coarse failure classes surfaced to the user with a remediation hint.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    OutOfMemory,
    PermissionDenied,
    Decode,
    InvalidInput,
    Other,
}

impl FailureKind {
    pub fn hint(self) -> &'static str {
        match self {
            FailureKind::OutOfMemory => {
                "Not enough memory. Close other programs or lower the worker count and retry."
            }
            FailureKind::PermissionDenied => {
                "Permission denied. Check that the file is not locked by another program."
            }
            FailureKind::Decode => "The video could not be decoded. Try transcoding it with FFmpeg.",
            FailureKind::InvalidInput => "The video is too short or its metadata is unreadable.",
            FailureKind::Other => "Unexpected error. Please report it with the log output.",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::OutOfMemory => "out of memory",
            FailureKind::PermissionDenied => "permission denied",
            FailureKind::Decode => "decode error",
            FailureKind::InvalidInput => "invalid input",
            FailureKind::Other => "error",
        };
        f.write_str(label)
    }
}

/// An extraction failure, classified, with the underlying message preserved.
#[derive(Error, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[error("{kind}: {message} ({hint})", hint = .kind.hint())]
pub struct ExtractFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ExtractFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Classifies an error by walking its source chain.
    pub fn classify(err: &anyhow::Error) -> Self {
        Self::new(classify_chain(err), format!("{:#}", err))
    }
}

fn classify_chain(err: &anyhow::Error) -> FailureKind {
    for cause in err.chain() {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            match io.kind() {
                std::io::ErrorKind::PermissionDenied => return FailureKind::PermissionDenied,
                std::io::ErrorKind::OutOfMemory => return FailureKind::OutOfMemory,
                _ => {}
            }
        }
        if let Some(cv) = cause.downcast_ref::<opencv::Error>() {
            if cv.code == opencv::core::StsNoMem {
                return FailureKind::OutOfMemory;
            }
            return FailureKind::Decode;
        }
        if cause.downcast_ref::<ffmpeg_next::Error>().is_some() {
            return FailureKind::Decode;
        }
        if cause.downcast_ref::<InvalidVideo>().is_some() {
            return FailureKind::InvalidInput;
        }
    }

    let text = format!("{:#}", err).to_lowercase();
    if text.contains("memory") {
        FailureKind::OutOfMemory
    } else if text.contains("permission") || text.contains("access") {
        FailureKind::PermissionDenied
    } else {
        FailureKind::Other
    }
}

/// Raised when a file opens but is unusable as a video source.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("invalid video: {0}")]
pub struct InvalidVideo(pub String);

/// Errors from batch operations. These never stop the dispatcher.
#[derive(Error, Debug)]
pub enum BatchError {
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("batch not found: {0}")]
    BatchNotFound(String),
    #[error("archived task not found: {0}")]
    ArchiveNotFound(String),
    #[error("task {id} cannot {action} while {state}")]
    WrongState {
        id: String,
        action: &'static str,
        state: String,
    },
    #[error("batch is {0}")]
    BatchBusy(&'static str),
    #[error("no tasks waiting in the queue")]
    NothingQueued,
    #[error("video rejected: {0}")]
    Rejected(String),
    #[error("invalid name: {0}")]
    InvalidName(String),
    #[error(transparent)]
    Package(#[from] crate::package::PackageError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
