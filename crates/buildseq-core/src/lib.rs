//! buildseq core library
//!
//! Dependency-ordered, phase-sequenced package builds with checkpoint and
//! resume. A [`Manifest`] declares packages and their dependencies, the
//! [`DependencyGraph`] turns it into a [`BuildPlan`], and the
//! [`Orchestrator`] drives one [`PackageMachine`] per package through its
//! phases, persisting every transition to a
//! [`CheckpointStore`](buildseq_state::CheckpointStore) before moving on.

pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod fakes;
pub mod graph;
pub mod machine;
pub mod manifest;
pub mod obs;
pub mod orchestrator;
pub mod policy;
pub mod report;
pub mod telemetry;

pub use config::{OrchestratorConfig, RetryConfig};
pub use error::{
    BuildError, ConfigError, ExecutionError, ExecutionErrorKind, GraphError, ManifestError, Result,
};
pub use events::{ChannelSink, EventSink, FanoutSink, StatusEvent, TracingSink};
pub use executor::{
    sha256_file, BuildExecutor, ExecutionRequest, ExecutionResult, ScriptExecutor,
    ScriptExecutorConfig,
};
pub use graph::{BuildPlan, DependencyGraph, GroupOrdering, PlanGroup, PlanStep};
pub use machine::{NextStep, PackageMachine, PhaseContext, PhaseOutcome, TransitionError};
pub use manifest::{Manifest, ManifestFormat, Package};
pub use orchestrator::Orchestrator;
pub use policy::{
    FailurePolicy, FixedRetry, NoRetry, PhaseTimeouts, RetryDecision, RetryPolicy, SkipPolicy,
};
pub use report::{PackageReport, PackageStatus, RunSummary, SkipReason, StatusReport};
pub use telemetry::{init_tracing, LogFormat, LOG_ENV};

pub use buildseq_state::{Phase, PhaseRecord, PhaseStatus};

/// Crate version, reported by the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
