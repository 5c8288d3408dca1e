//! Checkpoint store trait.
//!
//! Implementations must guarantee:
//! - `persist` is atomic per record: a crash never corrupts records written
//!   before it, and a record is durable once `persist` returns `Ok`.
//! - Writes are serialized (single-writer), even when the store is shared
//!   between concurrently running package workers.
//! - `load_all` returns the latest record per (package, phase) with every
//!   RUNNING record reclassified as FAILED/Interrupted.
//!
//! An in-memory fake is provided in [`crate::fakes`].

use async_trait::async_trait;

use crate::checkpoint::Checkpoint;
use crate::error::CheckpointResult;
use crate::record::PhaseRecord;

/// Durable record of phase transitions, the basis for resume.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Durably persist one phase record.
    async fn persist(&self, record: &PhaseRecord) -> CheckpointResult<()>;

    /// Load the full checkpoint, normalizing interrupted RUNNING records.
    async fn load_all(&self) -> CheckpointResult<Checkpoint>;

    /// Remove every record. Only ever invoked by an explicit operator action.
    async fn clear(&self) -> CheckpointResult<()>;
}
