//! Structured lifecycle events for build runs.
//!
//! - `RunSpan`: the run-scoped span
//! - `emit_*`: one function per lifecycle event, each tagged `event = "..."`
//!
//! Filter with `BUILDSEQ_LOG`, e.g. `BUILDSEQ_LOG=buildseq_core=debug`.

use buildseq_state::{InterruptedPhase, Phase, PhaseStatus};
use tracing::{info, warn};

/// Run-scoped tracing span.
///
/// Async code attaches it with [`tracing::Instrument`]; synchronous code can
/// [`enter`](RunSpan::enter) it.
///
/// ```ignore
/// let span = RunSpan::new("0b6f…");
/// build().instrument(span.span().clone()).await;
/// ```
#[derive(Debug, Clone)]
pub struct RunSpan {
    span: tracing::Span,
}

impl RunSpan {
    pub fn new(run_id: &str) -> Self {
        Self {
            span: tracing::info_span!("buildseq.run", run_id = %run_id),
        }
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }
}

/// Run started with `packages` planned in `groups` phase groups.
pub fn emit_run_started(run_id: &str, packages: usize, groups: usize) {
    info!(event = "run.started", run_id = %run_id, packages = packages, groups = groups);
}

/// A (package, phase) pair changed status.
pub fn emit_phase_transition(package: &str, phase: Phase, status: PhaseStatus, detail: Option<&str>) {
    info!(
        event = "phase.transition",
        package = %package,
        phase = %phase,
        status = %status,
        detail = detail.unwrap_or(""),
    );
}

/// A package reached its terminal status for this run.
pub fn emit_package_finished(package: &str, status: &str, detail: Option<&str>) {
    info!(
        event = "package.finished",
        package = %package,
        status = %status,
        detail = detail.unwrap_or(""),
    );
}

/// Run finished.
pub fn emit_run_finished(run_id: &str, duration_ms: u64, succeeded: usize, unfinished: usize) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        succeeded = succeeded,
        unfinished = unfinished,
        success = unfinished == 0,
    );
}

/// A RUNNING record was found on load and reclassified as interrupted.
pub fn emit_checkpoint_interrupted(phase: &InterruptedPhase) {
    warn!(
        event = "checkpoint.interrupted",
        package = %phase.package,
        phase = %phase.phase,
        attempt = phase.attempt,
    );
}

/// A failed phase is being retried.
pub fn emit_phase_retry(package: &str, phase: Phase, attempt: u32, delay_ms: u64) {
    warn!(
        event = "phase.retry",
        package = %package,
        phase = %phase,
        attempt = attempt,
        delay_ms = delay_ms,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_span_enter() {
        let span = RunSpan::new("test-run");
        let _entered = span.enter();
        emit_phase_transition("gcc", Phase::Build, PhaseStatus::Running, None);
    }
}
