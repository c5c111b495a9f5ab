use std::path::PathBuf;

use thiserror::Error;

/// Library-level failures. Per-voxel problems never surface here, they are
/// recorded as [`crate::ErrorCode`] bits in the error tracker instead.
#[derive(Debug, Error)]
pub enum QmriError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{0}")]
    Format(String),

    #[error("image grid mismatch: expected {expected:?}, got {got:?}")]
    GridMismatch {
        expected: (usize, usize, usize),
        got: (usize, usize, usize),
    },

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl QmriError {
    pub fn config(msg: impl Into<String>) -> Self {
        QmriError::Config(msg.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        QmriError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn format(msg: impl Into<String>) -> Self {
        QmriError::Format(msg.into())
    }
}
