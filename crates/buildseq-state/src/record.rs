//! Phase and phase-record types persisted by the checkpoint.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named step in a package's build lifecycle.
///
/// Variants are declared in standard execution order, so the derived `Ord`
/// follows the default sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Prepare,
    Configure,
    Build,
    Test,
    Install,
    Cleanup,
}

impl Phase {
    /// The default phase sequence used when a package does not override it.
    pub const STANDARD: [Phase; 6] = [
        Phase::Prepare,
        Phase::Configure,
        Phase::Build,
        Phase::Test,
        Phase::Install,
        Phase::Cleanup,
    ];

    /// Lowercase name, as used in manifests, script file names and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Prepare => "prepare",
            Phase::Configure => "configure",
            Phase::Build => "build",
            Phase::Test => "test",
            Phase::Install => "install",
            Phase::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string does not name a [`Phase`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown phase '{0}' (expected one of prepare, configure, build, test, install, cleanup)")]
pub struct UnknownPhase(pub String);

impl FromStr for Phase {
    type Err = UnknownPhase;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::STANDARD
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| UnknownPhase(s.to_string()))
    }
}

/// Status of one (package, phase) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl PhaseStatus {
    /// SUCCEEDED or SKIPPED: the next phase may begin.
    pub fn is_done(&self) -> bool {
        matches!(self, PhaseStatus::Succeeded | PhaseStatus::Skipped)
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PhaseStatus::Pending => "PENDING",
            PhaseStatus::Running => "RUNNING",
            PhaseStatus::Succeeded => "SUCCEEDED",
            PhaseStatus::Failed => "FAILED",
            PhaseStatus::Skipped => "SKIPPED",
        };
        f.write_str(s)
    }
}

/// Why a phase ended FAILED.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The build action exited with a nonzero status.
    NonZeroExit { code: i32 },
    /// The phase exceeded its maximum duration.
    Timeout { limit_secs: u64 },
    /// No build action could be resolved for the (package, phase) pair.
    ActionNotFound,
    /// The package source did not match its declared checksum.
    ChecksumMismatch { expected: String, actual: String },
    /// The build action could not be started or crashed.
    Spawn { message: String },
    /// The run was cancelled while the phase was in flight.
    Cancelled,
    /// The phase was RUNNING when the previous run stopped.
    Interrupted,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::NonZeroExit { code } => write!(f, "exited with status {code}"),
            FailureReason::Timeout { limit_secs } => {
                write!(f, "timed out after {limit_secs}s")
            }
            FailureReason::ActionNotFound => f.write_str("build action not found"),
            FailureReason::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch (expected {expected}, got {actual})")
            }
            FailureReason::Spawn { message } => write!(f, "failed to run build action: {message}"),
            FailureReason::Cancelled => f.write_str("cancelled"),
            FailureReason::Interrupted => f.write_str("interrupted by a previous run"),
        }
    }
}

/// One execution attempt of a package phase.
///
/// A record is written on every status transition; the latest record for a
/// (package, phase) pair is authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub package: String,
    pub phase: Phase,
    pub status: PhaseStatus,
    /// 1-based attempt counter; bumped every time the phase re-enters RUNNING.
    pub attempt: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    /// Identifier of the phase output (a log path), owned by the executor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_ref: Option<String>,
}

impl PhaseRecord {
    /// A record for a phase that has not run yet.
    pub fn pending(package: impl Into<String>, phase: Phase) -> Self {
        Self {
            package: package.into(),
            phase,
            status: PhaseStatus::Pending,
            attempt: 0,
            started_at: None,
            finished_at: None,
            exit_code: None,
            reason: None,
            output_ref: None,
        }
    }

    /// Transition into RUNNING at `now`, starting a new attempt.
    pub fn start(&self, now: DateTime<Utc>) -> Self {
        Self {
            status: PhaseStatus::Running,
            attempt: self.attempt + 1,
            started_at: Some(now),
            finished_at: None,
            exit_code: None,
            reason: None,
            output_ref: None,
            ..self.clone()
        }
    }

    /// Transition a RUNNING record into SUCCEEDED.
    pub fn succeed(&self, now: DateTime<Utc>, exit_code: i32, output_ref: Option<String>) -> Self {
        Self {
            status: PhaseStatus::Succeeded,
            finished_at: Some(now),
            exit_code: Some(exit_code),
            reason: None,
            output_ref,
            ..self.clone()
        }
    }

    /// Transition a RUNNING record into FAILED.
    pub fn fail(
        &self,
        now: DateTime<Utc>,
        reason: FailureReason,
        exit_code: Option<i32>,
        output_ref: Option<String>,
    ) -> Self {
        Self {
            status: PhaseStatus::Failed,
            finished_at: Some(now),
            exit_code,
            reason: Some(reason),
            output_ref,
            ..self.clone()
        }
    }

    /// Transition a PENDING record into SKIPPED.
    pub fn skip(&self, now: DateTime<Utc>) -> Self {
        Self {
            status: PhaseStatus::Skipped,
            started_at: None,
            finished_at: Some(now),
            ..self.clone()
        }
    }

    /// Reclassify a RUNNING record found on load as FAILED/Interrupted.
    ///
    /// The start timestamp and attempt counter are kept so the record still
    /// shows when the interrupted attempt began.
    pub fn interrupted(&self) -> Self {
        Self {
            status: PhaseStatus::Failed,
            reason: Some(FailureReason::Interrupted),
            ..self.clone()
        }
    }
}
