//! Orchestrator configuration.
//!
//! Loaded from an optional TOML file; every field has a default so an empty
//! file (or no file) is a valid configuration.
//!
//! ```toml
//! max_concurrent_packages = 2
//! default_timeout_secs = 7200
//! skip_phases = ["test"]
//! failure_policy = "halt_dependents"
//!
//! [phase_timeouts]
//! build = 14400
//!
//! [retry]
//! max_attempts = 2
//! delay_secs = 30
//!
//! [env]
//! MAKEFLAGS = "-j8"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use buildseq_state::Phase;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::executor::ScriptExecutorConfig;
use crate::graph::GroupOrdering;
use crate::policy::{FailurePolicy, FixedRetry, NoRetry, PhaseTimeouts, RetryPolicy, SkipPolicy};

/// Retry settings. `max_attempts` counts the first attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            delay_secs: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorConfig {
    /// Packages building at the same time. At least 1.
    pub max_concurrent_packages: usize,
    /// Phase timeout when neither the manifest nor `phase_timeouts` sets one.
    pub default_timeout_secs: u64,
    /// Per-phase timeouts, keyed by phase name.
    pub phase_timeouts: BTreeMap<String, u64>,
    /// Phases skipped for every package.
    pub skip_phases: Vec<Phase>,
    /// Phases skipped for specific packages.
    pub skip: BTreeMap<String, Vec<Phase>>,
    pub failure_policy: FailurePolicy,
    pub group_ordering: GroupOrdering,
    /// Kill running build actions on cancellation instead of letting them
    /// finish.
    pub cancel_in_flight: bool,
    pub retry: RetryConfig,
    /// Checkpoint and run metadata directory.
    pub state_dir: PathBuf,
    pub scripts_dir: PathBuf,
    pub work_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Base for relative package sources.
    pub source_dir: Option<PathBuf>,
    /// Extra environment for build actions.
    pub env: BTreeMap<String, String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_packages: 4,
            default_timeout_secs: 4 * 60 * 60,
            phase_timeouts: BTreeMap::new(),
            skip_phases: Vec::new(),
            skip: BTreeMap::new(),
            failure_policy: FailurePolicy::default(),
            group_ordering: GroupOrdering::default(),
            cancel_in_flight: true,
            retry: RetryConfig::default(),
            state_dir: PathBuf::from(".buildseq"),
            scripts_dir: PathBuf::from("scripts"),
            work_dir: PathBuf::from("work"),
            log_dir: PathBuf::from("logs"),
            source_dir: None,
            env: BTreeMap::new(),
        }
    }
}

impl OrchestratorConfig {
    /// Read, parse and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_packages == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_packages must be at least 1".into(),
            ));
        }
        if self.default_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "default_timeout_secs must be positive".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        self.phase_timeout_map()?;
        for key in self.env.keys() {
            if key.is_empty() || key.contains('=') {
                return Err(ConfigError::Invalid(format!(
                    "env: '{key}' is not a valid variable name"
                )));
            }
            if key.starts_with("BUILDSEQ_") {
                return Err(ConfigError::Invalid(format!(
                    "env: '{key}' is reserved for buildseq"
                )));
            }
        }
        Ok(())
    }

    fn phase_timeout_map(&self) -> Result<BTreeMap<Phase, Duration>, ConfigError> {
        let mut map = BTreeMap::new();
        for (name, secs) in &self.phase_timeouts {
            let phase: Phase = name
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("phase_timeouts: {e}")))?;
            if *secs == 0 {
                return Err(ConfigError::Invalid(format!(
                    "phase_timeouts.{name} must be positive"
                )));
            }
            map.insert(phase, Duration::from_secs(*secs));
        }
        Ok(map)
    }

    pub fn timeouts(&self) -> Result<PhaseTimeouts, ConfigError> {
        Ok(PhaseTimeouts {
            default: Duration::from_secs(self.default_timeout_secs),
            per_phase: self.phase_timeout_map()?,
        })
    }

    pub fn skip_policy(&self) -> SkipPolicy {
        let mut policy = self
            .skip_phases
            .iter()
            .fold(SkipPolicy::new(), |p, &phase| p.skip_phase(phase));
        for (package, phases) in &self.skip {
            for &phase in phases {
                policy = policy.skip_package_phase(package.clone(), phase);
            }
        }
        policy
    }

    pub fn retry_policy(&self) -> Arc<dyn RetryPolicy> {
        if self.retry.max_attempts <= 1 {
            Arc::new(NoRetry)
        } else {
            Arc::new(FixedRetry::new(
                self.retry.max_attempts,
                Duration::from_secs(self.retry.delay_secs),
            ))
        }
    }

    pub fn executor_config(&self) -> ScriptExecutorConfig {
        ScriptExecutorConfig {
            scripts_dir: self.scripts_dir.clone(),
            work_dir: self.work_dir.clone(),
            log_dir: self.log_dir.clone(),
            source_dir: self.source_dir.clone(),
            env: self.env.clone(),
            cancel_in_flight: self.cancel_in_flight,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> OrchestratorConfig {
        toml::from_str(text).unwrap()
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse("");
        assert_eq!(config, OrchestratorConfig::default());
        assert_eq!(config.max_concurrent_packages, 4);
        config.validate().unwrap();
    }

    #[test]
    fn test_full_config_parses() {
        let config = parse(
            r#"
            max_concurrent_packages = 2
            default_timeout_secs = 60
            skip_phases = ["cleanup"]
            failure_policy = "halt_run"
            group_ordering = "ignore"
            cancel_in_flight = false

            [phase_timeouts]
            build = 600

            [skip]
            gcc = ["test"]

            [retry]
            max_attempts = 3
            delay_secs = 5

            [env]
            MAKEFLAGS = "-j8"
            "#,
        );
        config.validate().unwrap();
        assert_eq!(config.failure_policy, FailurePolicy::HaltRun);
        assert_eq!(config.group_ordering, GroupOrdering::Ignore);
        assert_eq!(
            config.timeouts().unwrap().per_phase.get(&Phase::Build),
            Some(&Duration::from_secs(600))
        );
        let skip = config.skip_policy();
        assert!(skip.should_skip("zlib", Phase::Cleanup));
        assert!(skip.should_skip("gcc", Phase::Test));
        assert!(!config.executor_config().cancel_in_flight);
    }

    #[test]
    fn test_zero_concurrency_is_invalid() {
        let err = parse("max_concurrent_packages = 0").validate().unwrap_err();
        assert!(err.to_string().contains("max_concurrent_packages"));
    }

    #[test]
    fn test_unknown_phase_timeout_is_invalid() {
        let err = parse("[phase_timeouts]\ncompile = 10").validate().unwrap_err();
        assert!(err.to_string().contains("compile"));
    }

    #[test]
    fn test_reserved_env_is_invalid() {
        let err = parse("[env]\nBUILDSEQ_PHASE = \"x\"").validate().unwrap_err();
        assert!(err.to_string().contains("reserved"));
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        assert!(toml::from_str::<OrchestratorConfig>("max_jobs = 3").is_err());
    }

    #[test]
    fn test_load_reports_parse_errors_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buildseq.toml");
        std::fs::write(&path, "max_concurrent_packages = \"many\"").unwrap();
        match OrchestratorConfig::load(&path).unwrap_err() {
            ConfigError::Parse { path: p, .. } => assert_eq!(p, path),
            other => panic!("expected parse error, got {other:?}"),
        }
    }
}
