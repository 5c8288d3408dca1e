//! buildseq-state: checkpoint persistence for buildseq
//!
//! This crate is the persistence layer of the build orchestrator. It owns the
//! record types that describe one (package, phase) execution attempt and the
//! stores that make those records durable across crashes.
//!
//! ## Key Components
//!
//! - [`PhaseRecord`]: one execution attempt of a package phase
//! - [`Checkpoint`]: latest record per (package, phase), normalized on load
//! - [`CheckpointStore`]: async persistence trait (single-writer)
//! - [`FsCheckpointStore`]: append-only JSON-lines log with atomic compaction
//! - [`fakes::MemoryCheckpointStore`]: in-memory store for tests

mod checkpoint;
mod error;
pub mod fakes;
mod fs_store;
mod record;
pub mod store;

pub use checkpoint::{Checkpoint, InterruptedPhase};
pub use error::{CheckpointError, CheckpointResult};
pub use fs_store::{FsCheckpointStore, RunInfo, CHECKPOINT_FILENAME, RUN_INFO_FILENAME};
pub use record::{FailureReason, Phase, PhaseRecord, PhaseStatus, UnknownPhase};
pub use store::CheckpointStore;
