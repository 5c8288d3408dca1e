//! Per-package phase state machine.
//!
//! ```text
//! PENDING ──▶ RUNNING ──▶ SUCCEEDED
//!    │           │
//!    │           └──────▶ FAILED ──(retry)──▶ RUNNING
//!    └──▶ SKIPPED
//! ```
//!
//! Phases run strictly in the package's declared order. A phase starts only
//! when every earlier phase is SUCCEEDED or SKIPPED, and every transition is
//! persisted before the machine moves on.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use buildseq_state::{Checkpoint, CheckpointStore, FailureReason, Phase, PhaseRecord, PhaseStatus};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ExecutionError, ExecutionErrorKind, Result};
use crate::events::{EventSink, StatusEvent};
use crate::executor::{BuildExecutor, ExecutionRequest};
use crate::manifest::Package;
use crate::policy::{PhaseTimeouts, SkipPolicy};

/// An illegal phase status change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{package}/{phase}: illegal transition {from} -> {to}")]
pub struct TransitionError {
    pub package: String,
    pub phase: Phase,
    pub from: PhaseStatus,
    pub to: PhaseStatus,
}

/// Handles a machine needs to advance. Cheap to clone.
#[derive(Clone)]
pub struct PhaseContext {
    pub executor: Arc<dyn BuildExecutor>,
    pub store: Arc<dyn CheckpointStore>,
    pub sink: Arc<dyn EventSink>,
    pub skip: Arc<SkipPolicy>,
    pub timeouts: Arc<PhaseTimeouts>,
    pub cancel: CancellationToken,
}

/// What the machine would do on the next [`PackageMachine::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    Run(Phase),
    /// A phase FAILED and has not been armed for retry.
    Blocked(Phase),
    Complete,
}

/// Result of one [`PackageMachine::advance`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseOutcome {
    Succeeded(Phase),
    Skipped(Phase),
    Failed(ExecutionError),
    /// A failed phase blocks the package until it is retried.
    Blocked(Phase),
    /// Cancellation was requested before the next phase started.
    Cancelled,
    Complete,
}

/// Drives one package through its phases.
#[derive(Debug, Clone)]
pub struct PackageMachine {
    package: Package,
    records: BTreeMap<Phase, PhaseRecord>,
    armed: BTreeSet<Phase>,
}

impl PackageMachine {
    /// Restore the machine from checkpointed records. Records for phases the
    /// package does not run are ignored.
    pub fn new(package: Package, checkpoint: &Checkpoint) -> Self {
        let records = package
            .phases
            .iter()
            .map(|&phase| {
                let rec = checkpoint
                    .latest(&package.name, phase)
                    .cloned()
                    .unwrap_or_else(|| PhaseRecord::pending(package.name.clone(), phase));
                (phase, rec)
            })
            .collect();
        Self {
            package,
            records,
            armed: BTreeSet::new(),
        }
    }

    pub fn package(&self) -> &Package {
        &self.package
    }

    pub fn name(&self) -> &str {
        &self.package.name
    }

    /// Current record per phase, in execution order.
    pub fn records(&self) -> Vec<&PhaseRecord> {
        self.package
            .phases
            .iter()
            .filter_map(|p| self.records.get(p))
            .collect()
    }

    pub fn status(&self, phase: Phase) -> Option<PhaseStatus> {
        self.records.get(&phase).map(|r| r.status)
    }

    pub fn attempt(&self, phase: Phase) -> u32 {
        self.records.get(&phase).map_or(0, |r| r.attempt)
    }

    /// The error a [`PhaseOutcome::Blocked`] phase stands for, rebuilt from
    /// its recorded failure.
    pub fn blocked_error(&self, phase: Phase) -> ExecutionError {
        let record = self.current(phase);
        let reason = record.reason.clone().unwrap_or(FailureReason::Interrupted);
        let mut err = ExecutionError::new(
            &self.package.name,
            phase,
            ExecutionErrorKind::Blocked {
                reason: reason.clone(),
            },
            reason.to_string(),
        )
        .with_output_ref(record.output_ref);
        err.exit_code = record.exit_code;
        err
    }

    pub fn is_complete(&self) -> bool {
        self.next_step() == NextStep::Complete
    }

    /// First FAILED phase, if any.
    pub fn failed_phase(&self) -> Option<Phase> {
        self.package
            .phases
            .iter()
            .copied()
            .find(|p| self.status(*p) == Some(PhaseStatus::Failed))
    }

    /// Whether any phase has run or been skipped.
    pub fn has_started(&self) -> bool {
        self.records.values().any(|r| r.status != PhaseStatus::Pending)
    }

    pub fn next_step(&self) -> NextStep {
        for &phase in &self.package.phases {
            match self.status(phase) {
                Some(PhaseStatus::Succeeded) | Some(PhaseStatus::Skipped) => continue,
                Some(PhaseStatus::Failed) if self.armed.contains(&phase) => {
                    return NextStep::Run(phase)
                }
                Some(PhaseStatus::Failed) | Some(PhaseStatus::Running) => {
                    return NextStep::Blocked(phase)
                }
                Some(PhaseStatus::Pending) | None => return NextStep::Run(phase),
            }
        }
        NextStep::Complete
    }

    /// Allow a FAILED phase to re-enter RUNNING on the next advance.
    pub fn retry(&mut self, phase: Phase) -> std::result::Result<(), TransitionError> {
        match self.status(phase) {
            Some(PhaseStatus::Failed) => {
                self.armed.insert(phase);
                Ok(())
            }
            other => Err(TransitionError {
                package: self.package.name.clone(),
                phase,
                from: other.unwrap_or(PhaseStatus::Pending),
                to: PhaseStatus::Running,
            }),
        }
    }

    /// Arm the first FAILED phase for retry. Returns it, if there was one.
    pub fn retry_failed(&mut self) -> Option<Phase> {
        let phase = self.failed_phase()?;
        self.armed.insert(phase);
        Some(phase)
    }

    /// Execute, skip or report the next phase.
    ///
    /// Errors are run-scoped: a checkpoint write failed or the machine was
    /// asked for an illegal transition. Build failures are returned as
    /// [`PhaseOutcome::Failed`].
    pub async fn advance(&mut self, ctx: &PhaseContext) -> Result<PhaseOutcome> {
        let phase = match self.next_step() {
            NextStep::Complete => return Ok(PhaseOutcome::Complete),
            NextStep::Blocked(phase) => return Ok(PhaseOutcome::Blocked(phase)),
            NextStep::Run(phase) => phase,
        };

        if ctx.skip.should_skip(&self.package.name, phase)
            && self.status(phase) == Some(PhaseStatus::Pending)
        {
            let skipped = self.current(phase).skip(Utc::now());
            self.commit(ctx, skipped).await?;
            return Ok(PhaseOutcome::Skipped(phase));
        }

        if ctx.cancel.is_cancelled() {
            return Ok(PhaseOutcome::Cancelled);
        }

        let running = self.current(phase).start(Utc::now());
        self.commit(ctx, running.clone()).await?;
        self.armed.remove(&phase);

        let limit = ctx.timeouts.resolve(&self.package, phase);
        let request = ExecutionRequest::new(&self.package, phase, running.attempt, ctx.cancel.clone());
        debug!(package = %self.package.name, %phase, attempt = running.attempt, limit_secs = limit.as_secs(), "executing phase");

        let result = tokio::time::timeout(limit, ctx.executor.execute(&request)).await;
        let now = Utc::now();
        match result {
            Ok(Ok(done)) => {
                self.commit(ctx, running.succeed(now, done.exit_code, done.output_ref))
                    .await?;
                Ok(PhaseOutcome::Succeeded(phase))
            }
            Ok(Err(err)) => {
                let failed = running.fail(now, err.reason(), err.exit_code, err.output_ref.clone());
                self.commit(ctx, failed).await?;
                Ok(PhaseOutcome::Failed(err))
            }
            Err(_elapsed) => {
                let err = ExecutionError::new(
                    self.package.name.clone(),
                    phase,
                    ExecutionErrorKind::Timeout { limit },
                    format!("exceeded {}s", limit.as_secs()),
                );
                let failed = running.fail(now, err.reason(), None, None);
                self.commit(ctx, failed).await?;
                Ok(PhaseOutcome::Failed(err))
            }
        }
    }

    fn current(&self, phase: Phase) -> PhaseRecord {
        self.records
            .get(&phase)
            .cloned()
            .unwrap_or_else(|| PhaseRecord::pending(self.package.name.clone(), phase))
    }

    /// Validate, persist, then apply and announce a new record.
    async fn commit(&mut self, ctx: &PhaseContext, record: PhaseRecord) -> Result<()> {
        let from = self.current(record.phase).status;
        if !allowed(from, record.status, self.armed.contains(&record.phase)) {
            return Err(TransitionError {
                package: self.package.name.clone(),
                phase: record.phase,
                from,
                to: record.status,
            }
            .into());
        }
        ctx.store.persist(&record).await?;
        ctx.sink.emit(&StatusEvent::from_record(&record));
        self.records.insert(record.phase, record);
        Ok(())
    }
}

fn allowed(from: PhaseStatus, to: PhaseStatus, armed: bool) -> bool {
    use PhaseStatus::*;
    matches!(
        (from, to),
        (Pending, Running) | (Pending, Skipped) | (Running, Succeeded) | (Running, Failed)
    ) || (from == Failed && to == Running && armed)
}
