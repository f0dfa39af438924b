use std::path::PathBuf;
use thiserror::Error;

/// Typed failures of lifecycle operations.
///
/// Operations return `anyhow::Result`; these variants travel inside it and can
/// be recovered with `downcast_ref` when a caller needs to tell them apart.
#[derive(Error, Debug)]
pub enum FleetError {
    /// Operation invoked in the wrong state. Nothing was changed.
    #[error("{0}")]
    Precondition(String),

    /// Filesystem operation that still failed after its single retry.
    #[error("failed to remove {}: {source}", path.display())]
    TransientIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Process could not be terminated within the retry budget.
    /// The instance needs operator attention.
    #[error("{0}")]
    ProcessControl(String),

    /// Malformed input (archive, manifest, template). Earlier steps are not rolled back.
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}

impl FleetError {
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}
