//! Error type shared by every pipeline stage

use std::path::PathBuf;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can abort a segmentation run
///
/// There is no recovery or retry: the first error ends the run and is
/// reported by the binary.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read NIfTI: {0}")]
    Nifti(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Two volumes of one run do not share a voxel grid
    #[error("voxel grid mismatch between '{first}' and '{second}': {reason}")]
    GridMismatch {
        first: String,
        second: String,
        reason: String,
    },

    #[error("external tool '{program}' not found on PATH")]
    ToolNotFound { program: String },

    /// An external tool exited with a non-zero status
    #[error("'{command}' failed with {status}: {stderr}")]
    ToolFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("model weights not found at '{}'", path.display())]
    MissingWeights { path: PathBuf },

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Wrap an I/O error together with the path it happened on
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
