//! Failure, retry and skip policies.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use buildseq_state::Phase;
use serde::{Deserialize, Serialize};

use crate::error::{ExecutionError, ExecutionErrorKind};
use crate::manifest::Package;

/// What the orchestrator does once a package has failed for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Skip every transitive dependent; unrelated packages keep building.
    #[default]
    HaltDependents,
    /// Stop scheduling any new package. In-flight packages finish.
    HaltRun,
}

/// Outcome of a [`RetryPolicy`] decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

/// Decides whether a failed phase is attempted again within the same run.
///
/// `attempt` counts the failures of this phase so far in the current run,
/// starting at 1.
pub trait RetryPolicy: Send + Sync {
    fn decide(
        &self,
        package: &str,
        phase: Phase,
        attempt: u32,
        error: &ExecutionError,
    ) -> RetryDecision;
}

/// Never retry within a run.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn decide(&self, _: &str, _: Phase, _: u32, _: &ExecutionError) -> RetryDecision {
        RetryDecision::GiveUp
    }
}

/// Retry transient failures up to `max_attempts` total attempts with a fixed
/// delay between them.
///
/// Only nonzero exits, timeouts and spawn failures are retried. A missing
/// action or a checksum mismatch fails the same way every time, and a
/// cancelled phase must not be restarted.
#[derive(Debug, Clone, Copy)]
pub struct FixedRetry {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl FixedRetry {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }
}

impl RetryPolicy for FixedRetry {
    fn decide(
        &self,
        _package: &str,
        _phase: Phase,
        attempt: u32,
        error: &ExecutionError,
    ) -> RetryDecision {
        let transient = matches!(
            error.kind,
            ExecutionErrorKind::NonZeroExit
                | ExecutionErrorKind::Timeout { .. }
                | ExecutionErrorKind::Spawn
        );
        if transient && attempt < self.max_attempts {
            RetryDecision::Retry { delay: self.delay }
        } else {
            RetryDecision::GiveUp
        }
    }
}

/// Phases that are recorded SKIPPED instead of executed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkipPolicy {
    all: BTreeSet<Phase>,
    per_package: BTreeMap<String, BTreeSet<Phase>>,
}

impl SkipPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip `phase` for every package.
    pub fn skip_phase(mut self, phase: Phase) -> Self {
        self.all.insert(phase);
        self
    }

    /// Skip `phase` for `package` only.
    pub fn skip_package_phase(mut self, package: impl Into<String>, phase: Phase) -> Self {
        self.per_package
            .entry(package.into())
            .or_default()
            .insert(phase);
        self
    }

    pub fn should_skip(&self, package: &str, phase: Phase) -> bool {
        self.all.contains(&phase)
            || self
                .per_package
                .get(package)
                .is_some_and(|phases| phases.contains(&phase))
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty() && self.per_package.is_empty()
    }
}

/// Maximum phase durations.
///
/// Lookup order: the package's own manifest timeout for the phase, then the
/// configured per-phase timeout, then the default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseTimeouts {
    pub default: Duration,
    pub per_phase: BTreeMap<Phase, Duration>,
}

impl PhaseTimeouts {
    pub fn new(default: Duration) -> Self {
        Self {
            default,
            per_phase: BTreeMap::new(),
        }
    }

    pub fn with_phase(mut self, phase: Phase, limit: Duration) -> Self {
        self.per_phase.insert(phase, limit);
        self
    }

    pub fn resolve(&self, package: &Package, phase: Phase) -> Duration {
        package
            .timeouts
            .get(&phase)
            .or_else(|| self.per_phase.get(&phase))
            .copied()
            .unwrap_or(self.default)
    }
}

impl Default for PhaseTimeouts {
    fn default() -> Self {
        Self::new(Duration::from_secs(4 * 60 * 60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err(kind: ExecutionErrorKind) -> ExecutionError {
        ExecutionError::new("gcc", Phase::Build, kind, "failed")
    }

    #[test]
    fn test_no_retry_always_gives_up() {
        let decision = NoRetry.decide("gcc", Phase::Build, 1, &err(ExecutionErrorKind::NonZeroExit));
        assert_eq!(decision, RetryDecision::GiveUp);
    }

    #[test]
    fn test_fixed_retry_stops_at_max_attempts() {
        let policy = FixedRetry::new(3, Duration::from_secs(5));
        let e = err(ExecutionErrorKind::NonZeroExit);
        assert_eq!(
            policy.decide("gcc", Phase::Build, 1, &e),
            RetryDecision::Retry {
                delay: Duration::from_secs(5)
            }
        );
        assert!(matches!(
            policy.decide("gcc", Phase::Build, 2, &e),
            RetryDecision::Retry { .. }
        ));
        assert_eq!(policy.decide("gcc", Phase::Build, 3, &e), RetryDecision::GiveUp);
    }

    #[test]
    fn test_fixed_retry_ignores_deterministic_failures() {
        let policy = FixedRetry::new(5, Duration::ZERO);
        for kind in [
            ExecutionErrorKind::ActionNotFound,
            ExecutionErrorKind::Cancelled,
            ExecutionErrorKind::ChecksumMismatch {
                expected: "a".into(),
                actual: "b".into(),
            },
        ] {
            assert_eq!(policy.decide("gcc", Phase::Prepare, 1, &err(kind)), RetryDecision::GiveUp);
        }
    }

    #[test]
    fn test_skip_policy_global_and_per_package() {
        let policy = SkipPolicy::new()
            .skip_phase(Phase::Cleanup)
            .skip_package_phase("gcc", Phase::Test);
        assert!(policy.should_skip("binutils", Phase::Cleanup));
        assert!(policy.should_skip("gcc", Phase::Test));
        assert!(!policy.should_skip("binutils", Phase::Test));
        assert!(!SkipPolicy::new().should_skip("gcc", Phase::Test));
    }

    #[test]
    fn test_timeouts_prefer_manifest_then_config_then_default() {
        let mut pkg = Package {
            name: "gcc".into(),
            version: "13.2.0".into(),
            source: "gcc.tar.xz".into(),
            checksum: "0".repeat(64),
            dependencies: vec![],
            phases: Phase::STANDARD.to_vec(),
            group: None,
            timeouts: BTreeMap::new(),
        };
        pkg.timeouts.insert(Phase::Build, Duration::from_secs(600));
        let timeouts = PhaseTimeouts::new(Duration::from_secs(60))
            .with_phase(Phase::Build, Duration::from_secs(300))
            .with_phase(Phase::Test, Duration::from_secs(900));
        assert_eq!(timeouts.resolve(&pkg, Phase::Build), Duration::from_secs(600));
        assert_eq!(timeouts.resolve(&pkg, Phase::Test), Duration::from_secs(900));
        assert_eq!(timeouts.resolve(&pkg, Phase::Install), Duration::from_secs(60));
    }

    #[test]
    fn test_failure_policy_deserializes_snake_case() {
        #[derive(Deserialize)]
        struct Wrapper {
            policy: FailurePolicy,
        }
        let w: Wrapper = toml::from_str("policy = \"halt_run\"").unwrap();
        assert_eq!(w.policy, FailurePolicy::HaltRun);
        assert_eq!(FailurePolicy::default(), FailurePolicy::HaltDependents);
    }
}
