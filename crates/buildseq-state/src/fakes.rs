//! In-memory fakes for the checkpoint store (testing only)
//!
//! `MemoryCheckpointStore` satisfies the [`CheckpointStore`] contract without
//! touching the filesystem and additionally keeps the full write history so
//! tests can assert on transition order.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::checkpoint::Checkpoint;
use crate::error::{CheckpointError, CheckpointResult};
use crate::record::PhaseRecord;
use crate::store::CheckpointStore;

/// In-memory checkpoint store backed by a `Vec<PhaseRecord>` write log.
#[derive(Debug)]
pub struct MemoryCheckpointStore {
    log: Mutex<Vec<PhaseRecord>>,
    /// Writes allowed before every further `persist` fails; `usize::MAX` = never.
    write_budget: AtomicUsize,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self {
            log: Mutex::new(Vec::new()),
            write_budget: AtomicUsize::new(usize::MAX),
        }
    }

    /// Seed the store with records, as if a previous run had written them.
    pub fn with_records(records: Vec<PhaseRecord>) -> Self {
        let store = Self::new();
        *store.log.lock().unwrap() = records;
        store
    }

    /// Make every `persist` after the next `writes` successful ones fail.
    pub fn fail_after(&self, writes: usize) {
        self.write_budget.store(writes, Ordering::SeqCst);
    }

    /// Every record persisted so far, in write order.
    pub fn history(&self) -> Vec<PhaseRecord> {
        self.log.lock().unwrap().clone()
    }
}

impl Default for MemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn persist(&self, record: &PhaseRecord) -> CheckpointResult<()> {
        let budget = self.write_budget.load(Ordering::SeqCst);
        if budget == 0 {
            return Err(CheckpointError::WriteFailure {
                path: "memory://checkpoint".into(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "injected write failure"),
            });
        }
        if budget != usize::MAX {
            self.write_budget.store(budget - 1, Ordering::SeqCst);
        }
        self.log.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn load_all(&self) -> CheckpointResult<Checkpoint> {
        let mut checkpoint = Checkpoint::from_records(self.history());
        checkpoint.normalize_interrupted();
        Ok(checkpoint)
    }

    async fn clear(&self) -> CheckpointResult<()> {
        self.log.lock().unwrap().clear();
        Ok(())
    }
}
