//! Build action execution.
//!
//! [`BuildExecutor`] is the seam between the orchestrator and whatever
//! actually builds a package. [`ScriptExecutor`] runs one bash script per
//! (package, phase):
//!
//! ```text
//! <scripts>/<package>/<phase>.sh     package-specific action
//! <scripts>/default/<phase>.sh       fallback for every package
//! ```
//!
//! Scripts run in `<work>/<package>-<version>` with a cleared environment and
//! their combined output appended to `<logs>/<package>/<phase>.log`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use buildseq_state::Phase;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ExecutionError, ExecutionErrorKind};
use crate::manifest::Package;

/// Script directory consulted when a package has no script of its own.
pub const FALLBACK_SCRIPT_DIR: &str = "default";

/// One (package, phase) execution.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub package: String,
    pub version: String,
    pub source: String,
    /// Lowercase SHA-256 hex digest of the source.
    pub checksum: String,
    pub phase: Phase,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Cancelled when the run is being stopped.
    pub cancel: CancellationToken,
}

impl ExecutionRequest {
    pub fn new(package: &Package, phase: Phase, attempt: u32, cancel: CancellationToken) -> Self {
        Self {
            package: package.name.clone(),
            version: package.version.clone(),
            source: package.source.clone(),
            checksum: package.checksum.clone(),
            phase,
            attempt,
            cancel,
        }
    }

    fn error(&self, kind: ExecutionErrorKind, message: impl Into<String>) -> ExecutionError {
        ExecutionError::new(self.package.clone(), self.phase, kind, message)
    }
}

/// A successful execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub exit_code: i32,
    /// Where the output went (a log path for [`ScriptExecutor`]).
    pub output_ref: Option<String>,
    pub duration: Duration,
}

/// Performs the build action for one (package, phase).
///
/// Implementations report failure as [`ExecutionError`]; they do not enforce
/// the phase timeout, the caller does. Dropping the returned future must stop
/// the action.
#[async_trait]
pub trait BuildExecutor: Send + Sync {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, ExecutionError>;
}

/// Settings for [`ScriptExecutor`].
#[derive(Debug, Clone)]
pub struct ScriptExecutorConfig {
    pub scripts_dir: PathBuf,
    pub work_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Base directory for relative local sources; the process cwd when unset.
    pub source_dir: Option<PathBuf>,
    /// Extra environment passed to every script.
    pub env: BTreeMap<String, String>,
    /// Kill the running script when the run is cancelled instead of letting it
    /// finish.
    pub cancel_in_flight: bool,
}

impl ScriptExecutorConfig {
    pub fn new(scripts_dir: impl Into<PathBuf>, work_dir: impl Into<PathBuf>, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            scripts_dir: scripts_dir.into(),
            work_dir: work_dir.into(),
            log_dir: log_dir.into(),
            source_dir: None,
            env: BTreeMap::new(),
            cancel_in_flight: true,
        }
    }
}

/// Runs `bash <script>` per (package, phase).
#[derive(Debug, Clone)]
pub struct ScriptExecutor {
    config: ScriptExecutorConfig,
}

impl ScriptExecutor {
    pub fn new(config: ScriptExecutorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScriptExecutorConfig {
        &self.config
    }

    /// The script that would run for `(package, phase)`, if any.
    pub fn resolve_script(&self, package: &str, phase: Phase) -> Option<PathBuf> {
        let file = format!("{}.sh", phase.as_str());
        [package, FALLBACK_SCRIPT_DIR]
            .into_iter()
            .map(|dir| self.config.scripts_dir.join(dir).join(&file))
            .find(|p| p.is_file())
    }

    pub fn work_dir_for(&self, package: &str, version: &str) -> PathBuf {
        self.config.work_dir.join(format!("{package}-{version}"))
    }

    pub fn log_path_for(&self, package: &str, phase: Phase) -> PathBuf {
        self.config
            .log_dir
            .join(package)
            .join(format!("{}.log", phase.as_str()))
    }

    /// Local file the source locator points at, if it is one.
    fn local_source(&self, source: &str) -> Option<PathBuf> {
        if source.contains("://") {
            return None;
        }
        let path = Path::new(source);
        Some(match (&self.config.source_dir, path.is_relative()) {
            (Some(base), true) => base.join(path),
            _ => path.to_path_buf(),
        })
    }

    async fn verify_source(&self, request: &ExecutionRequest) -> Result<(), ExecutionError> {
        let Some(path) = self.local_source(&request.source) else {
            debug!(package = %request.package, source = %request.source, "remote source, checksum left to the action");
            return Ok(());
        };
        if !path.is_file() {
            debug!(package = %request.package, path = %path.display(), "source not present, checksum left to the action");
            return Ok(());
        }
        let hashed = path.clone();
        let actual = tokio::task::spawn_blocking(move || sha256_file(&hashed))
            .await
            .map_err(|e| request.error(ExecutionErrorKind::Spawn, e.to_string()))?
            .map_err(|e| {
                request.error(
                    ExecutionErrorKind::Spawn,
                    format!("cannot read source {}: {e}", path.display()),
                )
            })?;
        if actual != request.checksum {
            return Err(request.error(
                ExecutionErrorKind::ChecksumMismatch {
                    expected: request.checksum.clone(),
                    actual: actual.clone(),
                },
                format!("{} has sha256 {actual}", path.display()),
            ));
        }
        Ok(())
    }

    async fn open_log(&self, request: &ExecutionRequest, log_path: &Path) -> std::io::Result<std::fs::File> {
        if let Some(parent) = log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .await?;
        let header = format!(
            "=== buildseq {}-{} {} attempt {} at {} ===\n",
            request.package,
            request.version,
            request.phase,
            request.attempt,
            chrono::Utc::now().to_rfc3339()
        );
        file.write_all(header.as_bytes()).await?;
        file.flush().await?;
        Ok(file.into_std().await)
    }
}

#[async_trait]
impl BuildExecutor for ScriptExecutor {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, ExecutionError> {
        let start = Instant::now();

        let script = self.resolve_script(&request.package, request.phase).ok_or_else(|| {
            request.error(
                ExecutionErrorKind::ActionNotFound,
                format!(
                    "no {}.sh under {} for '{}' or 'default'",
                    request.phase,
                    self.config.scripts_dir.display(),
                    request.package
                ),
            )
        })?;

        if request.phase == Phase::Prepare {
            self.verify_source(request).await?;
        }

        let work_dir = self.work_dir_for(&request.package, &request.version);
        let log_path = self.log_path_for(&request.package, request.phase);
        let output_ref = Some(log_path.display().to_string());

        let spawn_err = |e: std::io::Error| {
            request
                .error(ExecutionErrorKind::Spawn, e.to_string())
                .with_output_ref(output_ref.clone())
        };
        tokio::fs::create_dir_all(&work_dir).await.map_err(spawn_err)?;
        let stdout = self.open_log(request, &log_path).await.map_err(spawn_err)?;
        let stderr = stdout.try_clone().map_err(spawn_err)?;

        let mut cmd = Command::new("bash");
        cmd.arg(&script)
            .current_dir(&work_dir)
            .env_clear()
            .env(
                "PATH",
                std::env::var("PATH").unwrap_or_else(|_| "/usr/local/bin:/usr/bin:/bin".to_string()),
            )
            .envs(&self.config.env)
            .env("BUILDSEQ_PACKAGE", &request.package)
            .env("BUILDSEQ_VERSION", &request.version)
            .env("BUILDSEQ_PHASE", request.phase.as_str())
            .env("BUILDSEQ_SOURCE", &request.source)
            .env("BUILDSEQ_CHECKSUM", &request.checksum)
            .env("BUILDSEQ_WORK_DIR", &work_dir)
            .env("BUILDSEQ_LOG_FILE", &log_path)
            .env("BUILDSEQ_ATTEMPT", request.attempt.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);
        if let Ok(home) = std::env::var("HOME") {
            cmd.env("HOME", home);
        }

        debug!(package = %request.package, phase = %request.phase, script = %script.display(), "spawning build action");
        let mut child = cmd.spawn().map_err(spawn_err)?;

        let waited = if self.config.cancel_in_flight {
            tokio::select! {
                status = child.wait() => status,
                _ = request.cancel.cancelled() => {
                    warn!(package = %request.package, phase = %request.phase, "killing build action on cancellation");
                    // kill_on_drop reaps the child when it goes out of scope
                    return Err(request
                        .error(ExecutionErrorKind::Cancelled, "run cancelled")
                        .with_output_ref(output_ref.clone()));
                }
            }
        } else {
            child.wait().await
        };
        let status = waited.map_err(spawn_err)?;

        let exit_code = status.code().unwrap_or(-1);
        if !status.success() {
            return Err(request
                .error(
                    ExecutionErrorKind::NonZeroExit,
                    format!("{} exited with {status}", script.display()),
                )
                .with_exit_code(exit_code)
                .with_output_ref(output_ref));
        }

        Ok(ExecutionResult {
            exit_code,
            output_ref,
            duration: start.elapsed(),
        })
    }
}

/// Streaming SHA-256 of a file, lowercase hex.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        executor: ScriptExecutor,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let mut config = ScriptExecutorConfig::new(root.join("scripts"), root.join("work"), root.join("logs"));
        config.source_dir = Some(root.join("sources"));
        config.env.insert("MAKEFLAGS".into(), "-j2".into());
        Fixture {
            _dir: dir,
            root,
            executor: ScriptExecutor::new(config),
        }
    }

    fn write_script(root: &Path, package: &str, phase: &str, body: &str) {
        let dir = root.join("scripts").join(package);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(format!("{phase}.sh")), body).unwrap();
    }

    fn request(phase: Phase, source: &str, checksum: &str) -> ExecutionRequest {
        ExecutionRequest {
            package: "zlib".into(),
            version: "1.3.1".into(),
            source: source.into(),
            checksum: checksum.into(),
            phase,
            attempt: 1,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_runs_default_script_in_work_dir_with_env() {
        let fx = fixture();
        write_script(
            &fx.root,
            "default",
            "build",
            "echo \"$BUILDSEQ_PACKAGE $BUILDSEQ_PHASE $MAKEFLAGS\"\npwd\n",
        );
        let result = fx
            .executor
            .execute(&request(Phase::Build, "https://example.org/zlib.tar.xz", "00"))
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);

        let log = std::fs::read_to_string(fx.root.join("logs/zlib/build.log")).unwrap();
        assert!(log.contains("zlib build -j2"));
        assert!(log.contains("zlib-1.3.1"));
        assert_eq!(
            result.output_ref.as_deref(),
            Some(fx.root.join("logs/zlib/build.log").display().to_string().as_str())
        );
    }

    #[tokio::test]
    async fn test_attempts_append_headed_sections_to_one_log() {
        let fx = fixture();
        write_script(&fx.root, "zlib", "configure", "echo \"configured $BUILDSEQ_ATTEMPT\"\n");
        let mut req = request(Phase::Configure, "https://x/zlib.tar.xz", "00");
        fx.executor.execute(&req).await.unwrap();
        req.attempt = 2;
        fx.executor.execute(&req).await.unwrap();

        let log = std::fs::read_to_string(fx.root.join("logs/zlib/configure.log")).unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("=== buildseq zlib-1.3.1 configure attempt 1 at "));
        assert_eq!(lines[1], "configured 1");
        assert!(lines[2].starts_with("=== buildseq zlib-1.3.1 configure attempt 2 at "));
        assert_eq!(lines[3], "configured 2");
    }

    #[tokio::test]
    async fn test_package_script_overrides_default() {
        let fx = fixture();
        write_script(&fx.root, "default", "install", "exit 0\n");
        write_script(&fx.root, "zlib", "install", "exit 7\n");
        let err = fx
            .executor
            .execute(&request(Phase::Install, "https://x/zlib.tar.xz", "00"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ExecutionErrorKind::NonZeroExit);
        assert_eq!(err.exit_code, Some(7));
        assert!(err.output_ref.is_some());
    }

    #[tokio::test]
    async fn test_missing_script_is_action_not_found() {
        let fx = fixture();
        let err = fx
            .executor
            .execute(&request(Phase::Configure, "https://x/zlib.tar.xz", "00"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ExecutionErrorKind::ActionNotFound);
    }

    #[tokio::test]
    async fn test_environment_is_cleared() {
        let fx = fixture();
        std::env::set_var("BUILDSEQ_TEST_LEAK", "leaked");
        write_script(
            &fx.root,
            "default",
            "test",
            "if [ -n \"$BUILDSEQ_TEST_LEAK\" ]; then exit 9; fi\n",
        );
        let result = fx
            .executor
            .execute(&request(Phase::Test, "https://x/zlib.tar.xz", "00"))
            .await;
        assert!(result.is_ok(), "{result:?}");
    }

    #[tokio::test]
    async fn test_prepare_verifies_local_source_checksum() {
        let fx = fixture();
        write_script(&fx.root, "default", "prepare", "exit 0\n");
        std::fs::create_dir_all(fx.root.join("sources")).unwrap();
        std::fs::write(fx.root.join("sources/zlib.tar"), b"test").unwrap();
        let good = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

        fx.executor
            .execute(&request(Phase::Prepare, "zlib.tar", good))
            .await
            .unwrap();

        let bad = "0".repeat(64);
        let err = fx
            .executor
            .execute(&request(Phase::Prepare, "zlib.tar", &bad))
            .await
            .unwrap_err();
        match err.kind {
            ExecutionErrorKind::ChecksumMismatch { expected, actual } => {
                assert_eq!(expected, bad);
                assert_eq!(actual, good);
            }
            other => panic!("expected checksum mismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancellation_kills_running_script() {
        let fx = fixture();
        write_script(&fx.root, "default", "build", "sleep 30\n");
        let req = request(Phase::Build, "https://x/zlib.tar.xz", "00");
        let cancel = req.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });
        let started = Instant::now();
        let err = fx.executor.execute(&req).await.unwrap_err();
        assert_eq!(err.kind, ExecutionErrorKind::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_sha256_file_matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"test").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
        );
    }
}
