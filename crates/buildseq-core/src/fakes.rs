//! Scripted build executor for tests.
//!
//! `ScriptedExecutor` succeeds every (package, phase) immediately unless told
//! otherwise, and records every call so tests can assert on execution order
//! and concurrency.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use buildseq_state::Phase;
use tokio_util::sync::CancellationToken;

use crate::error::{ExecutionError, ExecutionErrorKind};
use crate::executor::{BuildExecutor, ExecutionRequest, ExecutionResult};

#[derive(Debug, Clone, Default)]
struct Rule {
    /// Failure kind and how many more attempts fail; `None` = every attempt.
    failure: Option<(ExecutionErrorKind, Option<u32>)>,
    delay: Option<Duration>,
    /// Cancelled once the phase starts.
    cancels: Option<CancellationToken>,
}

/// A call observed by [`ScriptedExecutor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedPhase {
    pub package: String,
    pub phase: Phase,
    pub attempt: u32,
}

/// Build executor driven by per-(package, phase) rules.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    rules: Mutex<HashMap<(String, Phase), Rule>>,
    calls: Mutex<Vec<ExecutedPhase>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn rule(&self, package: &str, phase: Phase, f: impl FnOnce(&mut Rule)) {
        let mut rules = self.rules.lock().unwrap();
        f(rules.entry((package.to_string(), phase)).or_default());
    }

    /// Every attempt of `(package, phase)` exits nonzero.
    pub fn fail(self, package: &str, phase: Phase) -> Self {
        self.fail_with(package, phase, ExecutionErrorKind::NonZeroExit)
    }

    /// Every attempt of `(package, phase)` fails with `kind`.
    pub fn fail_with(self, package: &str, phase: Phase, kind: ExecutionErrorKind) -> Self {
        self.rule(package, phase, |r| r.failure = Some((kind, None)));
        self
    }

    /// The first `times` attempts of `(package, phase)` exit nonzero.
    pub fn fail_times(self, package: &str, phase: Phase, times: u32) -> Self {
        self.rule(package, phase, |r| {
            r.failure = Some((ExecutionErrorKind::NonZeroExit, Some(times)))
        });
        self
    }

    /// `(package, phase)` takes `delay` before finishing.
    pub fn delay(self, package: &str, phase: Phase, delay: Duration) -> Self {
        self.rule(package, phase, |r| r.delay = Some(delay));
        self
    }

    /// Cancel `token` as soon as `(package, phase)` starts.
    pub fn cancel_when(self, package: &str, phase: Phase, token: CancellationToken) -> Self {
        self.rule(package, phase, |r| r.cancels = Some(token));
        self
    }

    /// Every execution so far, in start order.
    pub fn calls(&self) -> Vec<ExecutedPhase> {
        self.calls.lock().unwrap().clone()
    }

    /// Phases executed for `package`, in start order.
    pub fn phases_run(&self, package: &str) -> Vec<Phase> {
        self.calls()
            .into_iter()
            .filter(|c| c.package == package)
            .map(|c| c.phase)
            .collect()
    }

    /// Packages in the order their first phase started.
    pub fn package_order(&self) -> Vec<String> {
        let mut order: Vec<String> = Vec::new();
        for call in self.calls() {
            if !order.contains(&call.package) {
                order.push(call.package);
            }
        }
        order
    }

    /// Highest number of executions observed running at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl BuildExecutor for ScriptedExecutor {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, ExecutionError> {
        self.calls.lock().unwrap().push(ExecutedPhase {
            package: request.package.clone(),
            phase: request.phase,
            attempt: request.attempt,
        });
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let (failure, delay, cancels) = {
            let mut rules = self.rules.lock().unwrap();
            match rules.get_mut(&(request.package.clone(), request.phase)) {
                None => (None, None, None),
                Some(rule) => {
                    let failure = match &mut rule.failure {
                        Some((kind, None)) => Some(kind.clone()),
                        Some((kind, Some(left))) if *left > 0 => {
                            *left -= 1;
                            Some(kind.clone())
                        }
                        _ => None,
                    };
                    (failure, rule.delay, rule.cancels.clone())
                }
            }
        };

        if let Some(token) = cancels {
            token.cancel();
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match failure {
            Some(kind) => {
                let exit = matches!(kind, ExecutionErrorKind::NonZeroExit).then_some(1);
                let mut err = ExecutionError::new(
                    request.package.clone(),
                    request.phase,
                    kind,
                    "scripted failure",
                );
                err.exit_code = exit;
                Err(err)
            }
            None => Ok(ExecutionResult {
                exit_code: 0,
                output_ref: Some(format!("mem://{}/{}", request.package, request.phase)),
                duration: delay.unwrap_or_default(),
            }),
        }
    }
}
