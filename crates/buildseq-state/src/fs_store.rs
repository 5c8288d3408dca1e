//! Filesystem-backed checkpoint store.
//!
//! Layout under the state directory:
//!
//! ```text
//! <root>/checkpoint.jsonl   append-only log, one PhaseRecord per line
//! <root>/run.json           metadata of the run that owns the log
//! ```
//!
//! Every record is appended, flushed and `fsync`ed before `persist` returns.
//! A crash can only ever leave a truncated *last* line behind. Load and
//! append agree on it: a tail that parses is a record (and gets its newline
//! before the next append), anything else is a torn write that is dropped on
//! load and cut off before the next append.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::checkpoint::Checkpoint;
use crate::error::{CheckpointError, CheckpointResult};
use crate::record::PhaseRecord;
use crate::store::CheckpointStore;

pub const CHECKPOINT_FILENAME: &str = "checkpoint.jsonl";
pub const RUN_INFO_FILENAME: &str = "run.json";

/// Metadata describing the run that owns a state directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: Uuid,
    pub manifest_path: PathBuf,
    /// SHA-256 hex digest of the manifest bytes at run start.
    pub manifest_digest: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct WriterState {
    tail_checked: bool,
}

/// Append-only JSON-lines checkpoint store.
pub struct FsCheckpointStore {
    root: PathBuf,
    log_path: PathBuf,
    writer: Mutex<WriterState>,
}

impl FsCheckpointStore {
    /// Open (or create) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> CheckpointResult<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root).map_err(|source| CheckpointError::WriteFailure {
            path: root.clone(),
            source,
        })?;
        let log_path = root.join(CHECKPOINT_FILENAME);
        Ok(Self {
            root,
            log_path,
            writer: Mutex::new(WriterState::default()),
        })
    }

    /// State directory this store writes into.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the append-only record log.
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Atomically replace `run.json`.
    pub async fn write_run_info(&self, info: &RunInfo) -> CheckpointResult<()> {
        let _guard = self.writer.lock().await;
        let mut bytes = serde_json::to_vec_pretty(info)?;
        bytes.push(b'\n');
        write_atomic(&self.root, &self.root.join(RUN_INFO_FILENAME), bytes).await
    }

    /// Read `run.json`, if a run has been started in this directory.
    pub async fn read_run_info(&self) -> CheckpointResult<Option<RunInfo>> {
        let path = self.root.join(RUN_INFO_FILENAME);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CheckpointError::Io(e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| CheckpointError::CheckpointCorrupt {
                path,
                line: e.line(),
                detail: e.to_string(),
            })
    }

    /// Rewrite the log so it holds only the latest record per
    /// (package, phase). The new log replaces the old one by atomic rename,
    /// so a crash mid-compaction leaves the original log untouched.
    ///
    /// Records are kept exactly as persisted; RUNNING records are *not*
    /// reclassified here.
    pub async fn compact(&self) -> CheckpointResult<usize> {
        let _guard = self.writer.lock().await;
        let checkpoint = self.replay().await?;
        let mut bytes = Vec::new();
        for record in checkpoint.records() {
            serde_json::to_writer(&mut bytes, record)?;
            bytes.push(b'\n');
        }
        let kept = checkpoint.len();
        write_atomic(&self.root, &self.log_path, bytes).await?;
        info!(path = %self.log_path.display(), records = kept, "checkpoint compacted");
        Ok(kept)
    }

    /// Replay the log without normalization.
    async fn replay(&self) -> CheckpointResult<Checkpoint> {
        let content = match tokio::fs::read_to_string(&self.log_path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Checkpoint::new()),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                return Err(CheckpointError::CheckpointCorrupt {
                    path: self.log_path.clone(),
                    line: 0,
                    detail: e.to_string(),
                })
            }
            Err(e) => return Err(CheckpointError::Io(e)),
        };
        parse_log(&self.log_path, &content).map(Checkpoint::from_records)
    }

    /// Settle an unterminated final line before the first append.
    ///
    /// A fragment that parses is the record `load_all` already reports, so it
    /// is kept and terminated. Anything else is a torn write and is cut off.
    async fn repair_tail(&self) -> CheckpointResult<()> {
        let content = match tokio::fs::read(&self.log_path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(CheckpointError::Io(e)),
        };
        if content.is_empty() || content.ends_with(b"\n") {
            return Ok(());
        }
        let keep = content
            .iter()
            .rposition(|b| *b == b'\n')
            .map(|i| i + 1)
            .unwrap_or(0);
        if serde_json::from_slice::<PhaseRecord>(&content[keep..]).is_ok() {
            debug!(path = %self.log_path.display(), "terminating unterminated checkpoint record");
            let mut file = tokio::fs::OpenOptions::new()
                .append(true)
                .open(&self.log_path)
                .await
                .map_err(|source| self.write_failure(source))?;
            file.write_all(b"\n")
                .await
                .map_err(|source| self.write_failure(source))?;
            return file
                .sync_all()
                .await
                .map_err(|source| self.write_failure(source));
        }
        warn!(
            path = %self.log_path.display(),
            dropped_bytes = content.len() - keep,
            "dropping torn checkpoint tail before append"
        );
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&self.log_path)
            .await
            .map_err(|source| self.write_failure(source))?;
        file.set_len(keep as u64)
            .await
            .map_err(|source| self.write_failure(source))?;
        file.sync_all()
            .await
            .map_err(|source| self.write_failure(source))
    }

    fn write_failure(&self, source: std::io::Error) -> CheckpointError {
        CheckpointError::WriteFailure {
            path: self.log_path.clone(),
            source,
        }
    }
}

#[async_trait]
impl CheckpointStore for FsCheckpointStore {
    async fn persist(&self, record: &PhaseRecord) -> CheckpointResult<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut state = self.writer.lock().await;
        if !state.tail_checked {
            self.repair_tail().await?;
            state.tail_checked = true;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await
            .map_err(|source| self.write_failure(source))?;
        file.write_all(&line)
            .await
            .map_err(|source| self.write_failure(source))?;
        file.sync_data()
            .await
            .map_err(|source| self.write_failure(source))?;

        debug!(
            package = %record.package,
            phase = %record.phase,
            status = %record.status,
            "checkpoint record persisted"
        );
        Ok(())
    }

    async fn load_all(&self) -> CheckpointResult<Checkpoint> {
        let mut checkpoint = self.replay().await?;
        checkpoint.normalize_interrupted();
        Ok(checkpoint)
    }

    async fn clear(&self) -> CheckpointResult<()> {
        let mut state = self.writer.lock().await;
        for path in [self.log_path.clone(), self.root.join(RUN_INFO_FILENAME)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => info!(path = %path.display(), "removed checkpoint file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(CheckpointError::WriteFailure { path, source }),
            }
        }
        state.tail_checked = true;
        Ok(())
    }
}

/// Parse a JSON-lines log. A final line without a trailing newline that does
/// not parse is a torn write and is dropped; any other bad line is corruption.
fn parse_log(path: &Path, content: &str) -> CheckpointResult<Vec<PhaseRecord>> {
    let complete = content.ends_with('\n');
    let lines: Vec<&str> = content.split('\n').collect();
    let last = lines.len().saturating_sub(1);
    let mut records = Vec::with_capacity(lines.len());

    for (idx, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<PhaseRecord>(line) {
            Ok(record) => records.push(record),
            Err(e) if idx == last && !complete => {
                warn!(
                    path = %path.display(),
                    line = idx + 1,
                    error = %e,
                    "ignoring torn final checkpoint record"
                );
            }
            Err(e) => {
                return Err(CheckpointError::CheckpointCorrupt {
                    path: path.to_path_buf(),
                    line: idx + 1,
                    detail: e.to_string(),
                })
            }
        }
    }
    Ok(records)
}

/// Write `bytes` to a temp file in `dir`, fsync it, then rename over `target`.
async fn write_atomic(dir: &Path, target: &Path, bytes: Vec<u8>) -> CheckpointResult<()> {
    let dir = dir.to_path_buf();
    let target = target.to_path_buf();
    let failure_path = target.clone();
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&target).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(|e| CheckpointError::WriteFailure {
        path: failure_path.clone(),
        source: std::io::Error::new(std::io::ErrorKind::Other, e),
    })?
    .map_err(|source| CheckpointError::WriteFailure {
        path: failure_path,
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{FailureReason, Phase, PhaseStatus};

    fn make_store() -> (tempfile::TempDir, FsCheckpointStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCheckpointStore::open(dir.path().join("state")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_load_from_missing_log_is_empty() {
        let (_dir, store) = make_store();
        let cp = store.load_all().await.unwrap();
        assert!(cp.is_empty());
    }

    #[tokio::test]
    async fn test_torn_tail_is_dropped_on_load_and_repaired_on_append() {
        let (_dir, store) = make_store();
        let now = Utc::now();
        let done = PhaseRecord::pending("gcc", Phase::Prepare)
            .start(now)
            .succeed(now, 0, None);
        store.persist(&done).await.unwrap();

        // Simulate a crash halfway through the next append.
        let mut raw = std::fs::read_to_string(store.log_path()).unwrap();
        raw.push_str("{\"package\":\"gcc\",\"phase\":\"conf");
        std::fs::write(store.log_path(), raw).unwrap();

        let cp = store.load_all().await.unwrap();
        assert_eq!(cp.len(), 1);

        // A fresh store instance repairs the tail before appending.
        let reopened = FsCheckpointStore::open(store.root()).unwrap();
        let next = PhaseRecord::pending("gcc", Phase::Configure).start(now);
        reopened.persist(&next).await.unwrap();
        let cp = reopened.load_all().await.unwrap();
        assert_eq!(cp.len(), 2);
        let configure = cp.latest("gcc", Phase::Configure).unwrap();
        assert_eq!(configure.reason, Some(FailureReason::Interrupted));
    }

    #[tokio::test]
    async fn test_unterminated_but_complete_record_survives_next_append() {
        let (_dir, store) = make_store();
        let now = Utc::now();
        let running = PhaseRecord::pending("gcc", Phase::Configure).start(now);
        store.persist(&running).await.unwrap();

        // The record made it to disk but the newline did not.
        let done = running.succeed(now, 0, None);
        let mut raw = std::fs::read_to_string(store.log_path()).unwrap();
        raw.push_str(&serde_json::to_string(&done).unwrap());
        std::fs::write(store.log_path(), raw).unwrap();

        let reopened = FsCheckpointStore::open(store.root()).unwrap();
        let cp = reopened.load_all().await.unwrap();
        assert_eq!(
            cp.latest("gcc", Phase::Configure).unwrap().status,
            PhaseStatus::Succeeded
        );

        reopened
            .persist(&PhaseRecord::pending("gcc", Phase::Build).start(now))
            .await
            .unwrap();
        let cp = reopened.load_all().await.unwrap();
        assert_eq!(
            cp.latest("gcc", Phase::Configure).unwrap().status,
            PhaseStatus::Succeeded
        );
        assert_eq!(
            cp.latest("gcc", Phase::Build).unwrap().reason,
            Some(FailureReason::Interrupted)
        );
        let raw = std::fs::read_to_string(reopened.log_path()).unwrap();
        assert_eq!(raw.lines().count(), 3);
    }

    #[tokio::test]
    async fn test_garbage_in_the_middle_is_corrupt() {
        let (_dir, store) = make_store();
        let now = Utc::now();
        let rec = PhaseRecord::pending("zlib", Phase::Build).skip(now);
        let line = serde_json::to_string(&rec).unwrap();
        std::fs::write(store.log_path(), format!("{line}\nnot json\n{line}\n")).unwrap();

        match store.load_all().await {
            Err(CheckpointError::CheckpointCorrupt { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected CheckpointCorrupt, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_compact_keeps_latest_record_per_phase() {
        let (_dir, store) = make_store();
        let now = Utc::now();
        let running = PhaseRecord::pending("gcc", Phase::Build).start(now);
        store.persist(&running).await.unwrap();
        store
            .persist(&running.fail(now, FailureReason::NonZeroExit { code: 1 }, Some(1), None))
            .await
            .unwrap();
        let retry = running
            .fail(now, FailureReason::NonZeroExit { code: 1 }, Some(1), None)
            .start(now);
        store.persist(&retry).await.unwrap();

        let kept = store.compact().await.unwrap();
        assert_eq!(kept, 1);
        let raw = std::fs::read_to_string(store.log_path()).unwrap();
        assert_eq!(raw.lines().count(), 1);

        // Compaction preserves the raw RUNNING record; load still normalizes it.
        let cp = store.load_all().await.unwrap();
        let build = cp.latest("gcc", Phase::Build).unwrap();
        assert_eq!(build.status, PhaseStatus::Failed);
        assert_eq!(build.attempt, 2);
    }

    #[tokio::test]
    async fn test_run_info_round_trip_and_clear() {
        let (_dir, store) = make_store();
        assert!(store.read_run_info().await.unwrap().is_none());

        let info = RunInfo {
            run_id: Uuid::new_v4(),
            manifest_path: PathBuf::from("/srv/lfs/manifest.toml"),
            manifest_digest: "ab".repeat(32),
            started_at: Utc::now(),
        };
        store.write_run_info(&info).await.unwrap();
        assert_eq!(store.read_run_info().await.unwrap(), Some(info));

        store
            .persist(&PhaseRecord::pending("a", Phase::Prepare).skip(Utc::now()))
            .await
            .unwrap();
        store.clear().await.unwrap();
        assert!(store.read_run_info().await.unwrap().is_none());
        assert!(store.load_all().await.unwrap().is_empty());
    }
}
