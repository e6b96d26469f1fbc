use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by [`crate::ImageProcessor`].
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The requested operation is not one of `generate`, `upscale` or `modify`.
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Loading the input image or running a pipeline failed. Carries the
    /// underlying message.
    #[error("{0}")]
    ProcessingFailure(String),
}

impl ProcessError {
    pub(crate) fn processing(err: anyhow::Error) -> Self {
        Self::ProcessingFailure(format!("{err:#}"))
    }
}

#[derive(Debug, Error)]
pub enum ThemeError {
    #[error("failed to read theme file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse theme file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("theme table has no `default` entry")]
    MissingDefault,
}
