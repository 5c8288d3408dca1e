//! Error taxonomy for buildseq.
//!
//! Manifest, graph, config and checkpoint errors are run-scoped: they abort a
//! run before or while it executes and are wrapped in [`BuildError`].
//! [`ExecutionError`] is package-scoped: it is recorded against one phase of
//! one package and never aborts the run.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use buildseq_state::{CheckpointError, FailureReason, Phase};

use crate::machine::TransitionError;

/// Errors produced while loading and validating a manifest.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("cannot read manifest {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Syntax error, wrong field type, missing field or invalid value.
    #[error("malformed manifest: {detail}")]
    MalformedManifest { detail: String },

    #[error("duplicate package '{name}' in manifest")]
    DuplicatePackage { name: String },

    #[error("package '{package}' depends on '{dependency}', which is not declared in the manifest")]
    UnknownDependency { package: String, dependency: String },
}

impl ManifestError {
    pub(crate) fn malformed(detail: impl Into<String>) -> Self {
        ManifestError::MalformedManifest {
            detail: detail.into(),
        }
    }
}

/// Errors produced by the dependency graph builder.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// `path` starts and ends with the same package.
    #[error("cyclic dependency: {}", path.join(" -> "))]
    CyclicDependency { path: Vec<String> },

    #[error(
        "package '{package}' (group '{package_group}') depends on '{dependency}' \
         from later group '{dependency_group}'"
    )]
    GroupOrderViolation {
        package: String,
        package_group: String,
        dependency: String,
        dependency_group: String,
    },

    #[error("package not found in graph: {name}")]
    PackageNotFound { name: String },
}

/// Errors produced while loading or validating orchestrator configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config {}: {detail}", path.display())]
    Parse { path: PathBuf, detail: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Why a build action did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionErrorKind {
    NonZeroExit,
    Timeout { limit: Duration },
    ActionNotFound,
    ChecksumMismatch { expected: String, actual: String },
    Spawn,
    Cancelled,
    /// The phase FAILED earlier and was not armed for retry.
    Blocked { reason: FailureReason },
}

impl fmt::Display for ExecutionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionErrorKind::NonZeroExit => f.write_str("nonzero exit"),
            ExecutionErrorKind::Timeout { limit } => write!(f, "timeout after {}s", limit.as_secs()),
            ExecutionErrorKind::ActionNotFound => f.write_str("build action not found"),
            ExecutionErrorKind::ChecksumMismatch { .. } => f.write_str("checksum mismatch"),
            ExecutionErrorKind::Spawn => f.write_str("spawn failure"),
            ExecutionErrorKind::Cancelled => f.write_str("cancelled"),
            ExecutionErrorKind::Blocked { .. } => f.write_str("blocked by an earlier failure"),
        }
    }
}

/// A failed (package, phase) execution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{package}/{phase}: {kind}: {message}")]
pub struct ExecutionError {
    pub package: String,
    pub phase: Phase,
    pub kind: ExecutionErrorKind,
    pub exit_code: Option<i32>,
    pub message: String,
    /// Log or other output captured before the failure.
    pub output_ref: Option<String>,
}

impl ExecutionError {
    pub fn new(
        package: impl Into<String>,
        phase: Phase,
        kind: ExecutionErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            package: package.into(),
            phase,
            kind,
            exit_code: None,
            message: message.into(),
            output_ref: None,
        }
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    pub fn with_output_ref(mut self, output_ref: Option<String>) -> Self {
        self.output_ref = output_ref;
        self
    }

    /// The persisted failure reason for this error.
    pub fn reason(&self) -> FailureReason {
        match &self.kind {
            ExecutionErrorKind::NonZeroExit => FailureReason::NonZeroExit {
                code: self.exit_code.unwrap_or(-1),
            },
            ExecutionErrorKind::Timeout { limit } => FailureReason::Timeout {
                limit_secs: limit.as_secs(),
            },
            ExecutionErrorKind::ActionNotFound => FailureReason::ActionNotFound,
            ExecutionErrorKind::ChecksumMismatch { expected, actual } => {
                FailureReason::ChecksumMismatch {
                    expected: expected.clone(),
                    actual: actual.clone(),
                }
            }
            ExecutionErrorKind::Spawn => FailureReason::Spawn {
                message: self.message.clone(),
            },
            ExecutionErrorKind::Cancelled => FailureReason::Cancelled,
            ExecutionErrorKind::Blocked { reason } => reason.clone(),
        }
    }
}

/// Run-scoped errors. Any of these aborts the whole run.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("phase state machine violated: {0}")]
    Transition(#[from] TransitionError),

    #[error("worker for package '{package}' panicked: {detail}")]
    WorkerPanicked { package: String, detail: String },
}

/// Result type for run-scoped operations.
pub type Result<T> = std::result::Result<T, BuildError>;
