//! Run orchestration.
//!
//! [`Orchestrator`] owns the manifest, graph and plan of one run and drives a
//! [`PackageMachine`] per package on its own tokio task. Packages start once
//! every dependency has completed all of its phases; at most
//! `max_concurrent` packages build at the same time. Phase groups act as
//! barriers: a group starts only when every package of the earlier groups
//! succeeded.
//!
//! Build failures are recorded and reported, never returned as errors. Only
//! run-scoped failures (checkpoint writes, illegal transitions, panicked
//! workers) abort the run, aborting every in-flight package with it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use buildseq_state::{CheckpointStore, Phase};
use chrono::Utc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::{BuildError, ExecutionError, ExecutionErrorKind, Result};
use crate::events::{EventSink, StatusEvent, TracingSink};
use crate::executor::BuildExecutor;
use crate::graph::{BuildPlan, DependencyGraph, GroupOrdering, PlanGroup};
use crate::machine::{PackageMachine, PhaseContext, PhaseOutcome};
use crate::manifest::Manifest;
use crate::obs::{self, RunSpan};
use crate::policy::{FailurePolicy, NoRetry, PhaseTimeouts, RetryDecision, RetryPolicy, SkipPolicy};
use crate::report::{PackageReport, PackageStatus, RunSummary, SkipReason};

/// How a package task ended.
#[derive(Debug)]
enum DriveOutcome {
    Completed,
    Failed(ExecutionError),
    /// Cancellation stopped the package between phases.
    Cancelled,
}

/// Per-package result collected by the scheduler.
#[derive(Debug, Clone)]
struct Finished {
    status: PackageStatus,
    executed: bool,
    skip_reason: Option<SkipReason>,
    error: Option<String>,
    failed_phase: Option<Phase>,
}

impl Finished {
    fn status(status: PackageStatus, executed: bool) -> Self {
        Self {
            status,
            executed,
            skip_reason: None,
            error: None,
            failed_phase: None,
        }
    }

    fn skipped(reason: SkipReason, error: Option<String>) -> Self {
        Self {
            status: PackageStatus::Skipped,
            executed: false,
            skip_reason: Some(reason),
            error,
            failed_phase: None,
        }
    }
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Package name plus the driven machine, or the panic message of its task.
type TaskOutput = (String, std::result::Result<(PackageMachine, Result<DriveOutcome>), String>);

/// Drives every package of a manifest to a terminal status.
pub struct Orchestrator {
    manifest: Manifest,
    graph: DependencyGraph,
    plan: BuildPlan,
    store: Arc<dyn CheckpointStore>,
    executor: Arc<dyn BuildExecutor>,
    sink: Arc<dyn EventSink>,
    retry: Arc<dyn RetryPolicy>,
    skip: Arc<SkipPolicy>,
    timeouts: Arc<PhaseTimeouts>,
    failure_policy: FailurePolicy,
    max_concurrent: usize,
    cancel: CancellationToken,
    run_id: Uuid,
}

impl Orchestrator {
    /// Build the graph and plan. Fails on cycles and group-order violations.
    pub fn new(
        manifest: Manifest,
        ordering: GroupOrdering,
        store: Arc<dyn CheckpointStore>,
        executor: Arc<dyn BuildExecutor>,
    ) -> Result<Self> {
        let graph = DependencyGraph::build(&manifest)?;
        let plan = graph.build_plan(ordering)?;
        Ok(Self {
            manifest,
            graph,
            plan,
            store,
            executor,
            sink: Arc::new(TracingSink),
            retry: Arc::new(NoRetry),
            skip: Arc::new(SkipPolicy::new()),
            timeouts: Arc::new(PhaseTimeouts::default()),
            failure_policy: FailurePolicy::default(),
            max_concurrent: 4,
            cancel: CancellationToken::new(),
            run_id: Uuid::new_v4(),
        })
    }

    /// Build an orchestrator with every policy taken from `config`.
    pub fn from_config(
        manifest: Manifest,
        config: &OrchestratorConfig,
        store: Arc<dyn CheckpointStore>,
        executor: Arc<dyn BuildExecutor>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(manifest, config.group_ordering, store, executor)?
            .with_retry_policy(config.retry_policy())
            .with_skip_policy(config.skip_policy())
            .with_timeouts(config.timeouts()?)
            .with_failure_policy(config.failure_policy)
            .with_max_concurrent(config.max_concurrent_packages))
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_retry_policy(mut self, retry: Arc<dyn RetryPolicy>) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_skip_policy(mut self, skip: SkipPolicy) -> Self {
        self.skip = Arc::new(skip);
        self
    }

    pub fn with_timeouts(mut self, timeouts: PhaseTimeouts) -> Self {
        self.timeouts = Arc::new(timeouts);
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Maximum packages building at once; 0 is treated as 1.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    /// Token that stops the run when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn plan(&self) -> &BuildPlan {
        &self.plan
    }

    /// Execute the plan, resuming from the checkpoint.
    pub async fn run(&self) -> Result<RunSummary> {
        let run_id = self.run_id.to_string();
        let span = RunSpan::new(&run_id);
        self.execute(&run_id).instrument(span.span().clone()).await
    }

    async fn execute(&self, run_id: &str) -> Result<RunSummary> {
        let started_at = Utc::now();

        let checkpoint = self.store.load_all().await?;
        for phase in checkpoint.interrupted() {
            obs::emit_checkpoint_interrupted(phase);
        }
        obs::emit_run_started(run_id, self.plan.len(), self.plan.groups.len());

        let mut machines: HashMap<String, PackageMachine> = HashMap::new();
        let mut finished: HashMap<String, Finished> = HashMap::new();
        for step in self.plan.steps() {
            let Some(pkg) = self.graph.package(&step.package) else {
                continue;
            };
            let mut machine = PackageMachine::new(pkg.clone(), &checkpoint);
            if machine.is_complete() {
                debug!(package = %step.package, "already complete");
                let result = Finished::status(PackageStatus::Succeeded, false);
                self.announce(&step.package, &result);
                finished.insert(step.package.clone(), result);
            } else if let Some(phase) = machine.retry_failed() {
                info!(package = %step.package, %phase, "retrying phase that failed in a previous run");
            }
            machines.insert(step.package.clone(), machine);
        }

        let mut halted = false;
        let mut broken_group: Option<String> = None;
        for (index, group) in self.plan.groups.iter().enumerate() {
            if let Some(barrier) = &broken_group {
                self.skip_group(group, barrier, &mut finished);
                continue;
            }
            if !self.cancel.is_cancelled() && !halted {
                halted = self.run_group(group, &mut machines, &mut finished).await?;
            }
            let complete = group.steps.iter().all(|s| {
                finished
                    .get(&s.package)
                    .is_some_and(|f| f.status == PackageStatus::Succeeded)
            });
            if !complete && index + 1 < self.plan.groups.len() && !self.cancel.is_cancelled() && !halted {
                let name = group.name.clone().unwrap_or_else(|| "(ungrouped)".to_string());
                warn!(group = %name, "phase group did not complete, skipping later groups");
                broken_group = Some(name);
            }
        }

        let summary = self.summarize(started_at, machines, finished, halted);
        obs::emit_run_finished(
            run_id,
            summary.duration_ms(),
            summary.count(PackageStatus::Succeeded),
            summary.packages.len() - summary.count(PackageStatus::Succeeded),
        );
        Ok(summary)
    }

    /// Schedule one phase group. Returns whether a halt-run failure occurred.
    async fn run_group(
        &self,
        group: &PlanGroup,
        machines: &mut HashMap<String, PackageMachine>,
        finished: &mut HashMap<String, Finished>,
    ) -> Result<bool> {
        let mut pending: Vec<String> = group
            .steps
            .iter()
            .map(|s| s.package.clone())
            .filter(|name| !finished.contains_key(name))
            .collect();
        let mut tasks: JoinSet<TaskOutput> = JoinSet::new();
        let mut halted = false;

        loop {
            if !self.cancel.is_cancelled() && !halted {
                let mut index = 0;
                while index < pending.len() && tasks.len() < self.max_concurrent {
                    let name = &pending[index];
                    if !self.dependencies_succeeded(name, finished) {
                        index += 1;
                        continue;
                    }
                    let name = pending.remove(index);
                    let Some(machine) = machines.remove(&name) else {
                        continue;
                    };
                    debug!(package = %name, "starting package");
                    tasks.spawn(self.spawn_package(name, machine));
                }
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            let (name, output) = joined.map_err(|e| BuildError::WorkerPanicked {
                package: "(scheduler)".to_string(),
                detail: e.to_string(),
            })?;
            let (machine, outcome) = match output {
                Ok((machine, Ok(outcome))) => (machine, outcome),
                Ok((_, Err(run_err))) => {
                    error!(package = %name, error = %run_err, "aborting run");
                    return Err(run_err);
                }
                Err(detail) => {
                    error!(package = %name, %detail, "package worker panicked");
                    return Err(BuildError::WorkerPanicked {
                        package: name,
                        detail,
                    });
                }
            };

            let result = match outcome {
                DriveOutcome::Completed => Finished::status(PackageStatus::Succeeded, true),
                DriveOutcome::Cancelled => {
                    let started = machine.has_started();
                    let status = if started {
                        PackageStatus::Incomplete
                    } else {
                        PackageStatus::NotStarted
                    };
                    Finished::status(status, started)
                }
                DriveOutcome::Failed(err) => {
                    let cancelled = err.kind == ExecutionErrorKind::Cancelled;
                    if !cancelled {
                        self.skip_dependents(&name, &err, finished, &mut pending);
                        if self.failure_policy == FailurePolicy::HaltRun {
                            warn!(package = %name, "halting run after failure");
                            halted = true;
                        }
                    }
                    Finished {
                        status: PackageStatus::Failed,
                        executed: true,
                        skip_reason: None,
                        error: Some(err.to_string()),
                        failed_phase: Some(err.phase),
                    }
                }
            };
            self.announce(&name, &result);
            finished.insert(name.clone(), result);
            machines.insert(name, machine);
        }

        if halted {
            for name in pending.drain(..) {
                let result = Finished::skipped(SkipReason::RunHalted, None);
                self.announce(&name, &result);
                finished.insert(name, result);
            }
        }
        Ok(halted)
    }

    fn spawn_package(
        &self,
        name: String,
        machine: PackageMachine,
    ) -> impl std::future::Future<Output = TaskOutput> + Send + 'static {
        let ctx = PhaseContext {
            executor: Arc::clone(&self.executor),
            store: Arc::clone(&self.store),
            sink: Arc::clone(&self.sink),
            skip: Arc::clone(&self.skip),
            timeouts: Arc::clone(&self.timeouts),
            cancel: self.cancel.clone(),
        };
        let retry = Arc::clone(&self.retry);
        let span = tracing::info_span!("package", package = %name);
        async move {
            let mut inner = AbortOnDrop(tokio::spawn(drive(machine, ctx, retry).instrument(span)));
            let output = (&mut inner.0).await.map_err(|e| e.to_string());
            (name, output)
        }
    }

    fn dependencies_succeeded(&self, name: &str, finished: &HashMap<String, Finished>) -> bool {
        self.graph.dependencies_of(name).is_ok_and(|deps| {
            deps.iter().all(|d| {
                finished
                    .get(d)
                    .is_some_and(|f| f.status == PackageStatus::Succeeded)
            })
        })
    }

    /// Mark every unfinished transitive dependent of `failed` as skipped.
    fn skip_dependents(
        &self,
        failed: &str,
        err: &ExecutionError,
        finished: &mut HashMap<String, Finished>,
        pending: &mut Vec<String>,
    ) {
        let dependents = self.graph.transitive_dependents_of(failed).unwrap_or_default();
        for dependent in dependents {
            if finished.contains_key(&dependent) {
                continue;
            }
            pending.retain(|p| p != &dependent);
            let result = Finished::skipped(
                SkipReason::DependencyFailed {
                    dependency: failed.to_string(),
                },
                Some(err.to_string()),
            );
            self.announce(&dependent, &result);
            finished.insert(dependent, result);
        }
    }

    fn skip_group(&self, group: &PlanGroup, barrier: &str, finished: &mut HashMap<String, Finished>) {
        for step in &group.steps {
            if finished.contains_key(&step.package) {
                continue;
            }
            let result = Finished::skipped(
                SkipReason::GroupBarrier {
                    group: barrier.to_string(),
                },
                None,
            );
            self.announce(&step.package, &result);
            finished.insert(step.package.clone(), result);
        }
    }

    fn announce(&self, package: &str, result: &Finished) {
        let detail = match (&result.skip_reason, &result.error) {
            (Some(reason), _) => Some(reason.to_string()),
            (None, Some(err)) => Some(err.clone()),
            (None, None) => None,
        };
        self.sink.emit(&StatusEvent::package(
            package,
            result.status.as_phase_status(),
            detail,
        ));
    }

    fn summarize(
        &self,
        started_at: chrono::DateTime<Utc>,
        mut machines: HashMap<String, PackageMachine>,
        mut finished: HashMap<String, Finished>,
        halted: bool,
    ) -> RunSummary {
        let packages = self
            .plan
            .steps()
            .map(|step| {
                let machine = machines.remove(&step.package);
                let result = finished.remove(&step.package).unwrap_or_else(|| {
                    let status = match &machine {
                        Some(m) if m.has_started() => PackageStatus::Incomplete,
                        _ => PackageStatus::NotStarted,
                    };
                    let mut result = Finished::status(status, false);
                    if halted && status == PackageStatus::NotStarted {
                        result = Finished::skipped(SkipReason::RunHalted, None);
                    }
                    result
                });
                let phases = machine
                    .map(|m| m.records().into_iter().cloned().collect())
                    .unwrap_or_default();
                PackageReport {
                    name: step.package.clone(),
                    version: step.version.clone(),
                    status: result.status,
                    executed: result.executed,
                    failed_phase: result.failed_phase,
                    skip_reason: result.skip_reason,
                    error: result.error,
                    phases,
                }
            })
            .collect();
        RunSummary {
            run_id: self.run_id,
            started_at,
            finished_at: Utc::now(),
            cancelled: self.cancel.is_cancelled(),
            packages,
        }
    }
}

/// Drive one package until it completes, fails for good or is cancelled.
async fn drive(
    mut machine: PackageMachine,
    ctx: PhaseContext,
    retry: Arc<dyn RetryPolicy>,
) -> (PackageMachine, Result<DriveOutcome>) {
    let mut attempts: BTreeMap<Phase, u32> = BTreeMap::new();
    loop {
        let outcome = match machine.advance(&ctx).await {
            Ok(outcome) => outcome,
            Err(err) => return (machine, Err(err)),
        };
        match outcome {
            PhaseOutcome::Succeeded(_) | PhaseOutcome::Skipped(_) => continue,
            PhaseOutcome::Complete => return (machine, Ok(DriveOutcome::Completed)),
            PhaseOutcome::Cancelled => return (machine, Ok(DriveOutcome::Cancelled)),
            PhaseOutcome::Blocked(phase) => {
                let err = machine.blocked_error(phase);
                return (machine, Ok(DriveOutcome::Failed(err)));
            }
            PhaseOutcome::Failed(err) => {
                if err.kind == ExecutionErrorKind::Cancelled || ctx.cancel.is_cancelled() {
                    return (machine, Ok(DriveOutcome::Failed(err)));
                }
                let attempt = attempts.entry(err.phase).or_insert(0);
                *attempt += 1;
                match retry.decide(machine.name(), err.phase, *attempt, &err) {
                    RetryDecision::GiveUp => return (machine, Ok(DriveOutcome::Failed(err))),
                    RetryDecision::Retry { delay } => {
                        obs::emit_phase_retry(machine.name(), err.phase, *attempt + 1, delay.as_millis() as u64);
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = ctx.cancel.cancelled() => {
                                return (machine, Ok(DriveOutcome::Failed(err)));
                            }
                        }
                        if let Err(e) = machine.retry(err.phase) {
                            return (machine, Err(e.into()));
                        }
                    }
                }
            }
        }
    }
}
