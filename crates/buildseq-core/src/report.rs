//! Run summaries and checkpoint status reports.

use std::fmt;

use buildseq_state::{Checkpoint, Phase, PhaseRecord, PhaseStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::graph::BuildPlan;
use crate::manifest::Manifest;

/// Terminal status of a package for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PackageStatus {
    Succeeded,
    Failed,
    Skipped,
    /// Some phases finished but the run stopped before the rest started.
    Incomplete,
    NotStarted,
}

impl PackageStatus {
    /// Status used for package-level status events.
    pub fn as_phase_status(&self) -> PhaseStatus {
        match self {
            PackageStatus::Succeeded => PhaseStatus::Succeeded,
            PackageStatus::Failed => PhaseStatus::Failed,
            PackageStatus::Skipped => PhaseStatus::Skipped,
            PackageStatus::Incomplete | PackageStatus::NotStarted => PhaseStatus::Pending,
        }
    }
}

impl fmt::Display for PackageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PackageStatus::Succeeded => "SUCCEEDED",
            PackageStatus::Failed => "FAILED",
            PackageStatus::Skipped => "SKIPPED",
            PackageStatus::Incomplete => "INCOMPLETE",
            PackageStatus::NotStarted => "NOT STARTED",
        })
    }
}

/// Why a package was skipped without being started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// `dependency` (a direct or transitive dependency) failed.
    DependencyFailed { dependency: String },
    /// An earlier phase group did not fully succeed.
    GroupBarrier { group: String },
    /// Another package failed under the halt-run policy.
    RunHalted,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::DependencyFailed { dependency } => {
                write!(f, "dependency '{dependency}' failed")
            }
            SkipReason::GroupBarrier { group } => {
                write!(f, "phase group '{group}' did not complete")
            }
            SkipReason::RunHalted => f.write_str("run halted after a failure"),
        }
    }
}

/// One package's line in a run summary or status report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageReport {
    pub name: String,
    pub version: String,
    pub status: PackageStatus,
    /// Whether any phase executed during this run.
    pub executed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_phase: Option<Phase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    /// The originating error for failed or dependency-skipped packages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub phases: Vec<PhaseRecord>,
}

/// Outcome of one orchestrator run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
    /// Packages in plan order.
    pub packages: Vec<PackageReport>,
}

impl RunSummary {
    /// Every package SUCCEEDED.
    pub fn is_success(&self) -> bool {
        self.packages
            .iter()
            .all(|p| p.status == PackageStatus::Succeeded)
    }

    pub fn count(&self, status: PackageStatus) -> usize {
        self.packages.iter().filter(|p| p.status == status).count()
    }

    pub fn package(&self, name: &str) -> Option<&PackageReport> {
        self.packages.iter().find(|p| p.name == name)
    }

    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "run {}", self.run_id)?;
        render_packages(f, &self.packages)?;
        write!(
            f,
            "{} succeeded, {} failed, {} skipped, {} incomplete, {} not started",
            self.count(PackageStatus::Succeeded),
            self.count(PackageStatus::Failed),
            self.count(PackageStatus::Skipped),
            self.count(PackageStatus::Incomplete),
            self.count(PackageStatus::NotStarted),
        )?;
        if self.cancelled {
            write!(f, " (cancelled)")?;
        }
        writeln!(f)
    }
}

/// Checkpoint contents, per package, without running anything.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub packages: Vec<PackageReport>,
    /// Phases that were RUNNING when the previous run stopped.
    pub interrupted: Vec<String>,
}

impl StatusReport {
    /// Build a report from the checkpoint. With a manifest and plan, packages
    /// are listed in plan order and unrun packages are included; otherwise
    /// every checkpointed package is listed by name.
    pub fn new(checkpoint: &Checkpoint, plan: Option<(&Manifest, &BuildPlan)>) -> Self {
        let packages = match plan {
            Some((manifest, plan)) => plan
                .steps()
                .filter_map(|step| manifest.get(&step.package))
                .map(|pkg| {
                    let records: Vec<PhaseRecord> = pkg
                        .phases
                        .iter()
                        .filter_map(|&p| checkpoint.latest(&pkg.name, p).cloned())
                        .collect();
                    derive_report(&pkg.name, &pkg.version, pkg.phases.len(), records)
                })
                .collect(),
            None => checkpoint
                .packages()
                .map(|name| {
                    let records = checkpoint.records_for(name);
                    let phases = records.len();
                    derive_report(name, "", phases, records)
                })
                .collect(),
        };
        let interrupted = checkpoint
            .interrupted()
            .iter()
            .map(|i| format!("{}/{}", i.package, i.phase))
            .collect();
        Self {
            packages,
            interrupted,
        }
    }

    /// A FAILED package is still waiting for a retry. Unrun, skipped and
    /// incomplete packages do not count.
    pub fn has_failures(&self) -> bool {
        self.packages
            .iter()
            .any(|p| p.status == PackageStatus::Failed)
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.packages.is_empty() {
            return writeln!(f, "checkpoint is empty");
        }
        render_packages(f, &self.packages)?;
        for phase in &self.interrupted {
            writeln!(f, "interrupted: {phase}")?;
        }
        Ok(())
    }
}

fn derive_report(name: &str, version: &str, expected: usize, phases: Vec<PhaseRecord>) -> PackageReport {
    let failed = phases.iter().find(|r| r.status == PhaseStatus::Failed);
    let done = phases.iter().filter(|r| r.status.is_done()).count();
    let status = if failed.is_some() {
        PackageStatus::Failed
    } else if done == expected && expected > 0 {
        PackageStatus::Succeeded
    } else if phases.iter().any(|r| r.status != PhaseStatus::Pending) {
        PackageStatus::Incomplete
    } else {
        PackageStatus::NotStarted
    };
    PackageReport {
        name: name.to_string(),
        version: version.to_string(),
        status,
        executed: false,
        failed_phase: failed.map(|r| r.phase),
        skip_reason: None,
        error: failed.and_then(|r| r.reason.as_ref()).map(|r| r.to_string()),
        phases,
    }
}

fn render_packages(f: &mut fmt::Formatter<'_>, packages: &[PackageReport]) -> fmt::Result {
    let width = packages.iter().map(|p| p.name.len()).max().unwrap_or(0);
    for pkg in packages {
        let label = if pkg.version.is_empty() {
            pkg.name.clone()
        } else {
            format!("{}-{}", pkg.name, pkg.version)
        };
        write!(f, "{:<w$}  {}", label, pkg.status, w = width + 12)?;
        if let Some(phase) = pkg.failed_phase {
            write!(f, "  [{phase}]")?;
        }
        if let Some(reason) = &pkg.skip_reason {
            write!(f, "  {reason}")?;
        } else if let Some(err) = &pkg.error {
            write!(f, "  {err}")?;
        }
        writeln!(f)?;
    }
    Ok(())
}
