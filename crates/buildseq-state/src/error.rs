//! Error types for buildseq-state

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by checkpoint persistence.
///
/// Every variant is run-scoped: the orchestrator cannot continue without a
/// trustworthy resume state, so none of these are retried automatically.
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// The checkpoint medium holds a record that cannot be parsed.
    #[error("checkpoint corrupt at {}:{line}: {detail}", path.display())]
    CheckpointCorrupt {
        path: PathBuf,
        line: usize,
        detail: String,
    },

    /// A record could not be durably written.
    #[error("checkpoint write to {} failed: {source}", path.display())]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Reading the checkpoint medium failed.
    #[error("checkpoint io error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be encoded.
    #[error("checkpoint serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for checkpoint operations
pub type CheckpointResult<T> = std::result::Result<T, CheckpointError>;
