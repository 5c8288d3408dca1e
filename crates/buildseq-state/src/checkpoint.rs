//! The in-memory view of a checkpoint: latest record per (package, phase).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::record::{Phase, PhaseRecord, PhaseStatus};

/// A RUNNING record that was reclassified as interrupted on load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptedPhase {
    pub package: String,
    pub phase: Phase,
    pub attempt: u32,
}

/// Snapshot of every package's phase records.
///
/// Built by replaying persisted records in write order; a later record for
/// the same (package, phase) replaces the earlier one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checkpoint {
    packages: BTreeMap<String, BTreeMap<Phase, PhaseRecord>>,
    interrupted: Vec<InterruptedPhase>,
}

impl Checkpoint {
    /// Create an empty checkpoint.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replay `records` in write order. The result is *not* normalized; call
    /// [`Checkpoint::normalize_interrupted`] before handing it to a scheduler.
    pub fn from_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = PhaseRecord>,
    {
        let mut checkpoint = Self::new();
        for record in records {
            checkpoint.apply(record);
        }
        checkpoint
    }

    /// Apply a single record, replacing any earlier one for the same pair.
    pub fn apply(&mut self, record: PhaseRecord) {
        self.packages
            .entry(record.package.clone())
            .or_default()
            .insert(record.phase, record);
    }

    /// Reclassify every RUNNING record as FAILED/Interrupted.
    ///
    /// After this call no package has a RUNNING phase. The reclassified
    /// phases are returned and also kept on the checkpoint for reporting.
    pub fn normalize_interrupted(&mut self) -> Vec<InterruptedPhase> {
        let mut found = Vec::new();
        for records in self.packages.values_mut() {
            for record in records.values_mut() {
                if record.status == PhaseStatus::Running {
                    found.push(InterruptedPhase {
                        package: record.package.clone(),
                        phase: record.phase,
                        attempt: record.attempt,
                    });
                    *record = record.interrupted();
                }
            }
        }
        self.interrupted.extend(found.iter().cloned());
        found
    }

    /// Phases reclassified by the last normalization.
    pub fn interrupted(&self) -> &[InterruptedPhase] {
        &self.interrupted
    }

    /// Latest record for a (package, phase) pair.
    pub fn latest(&self, package: &str, phase: Phase) -> Option<&PhaseRecord> {
        self.packages.get(package).and_then(|r| r.get(&phase))
    }

    /// All records of `package`, in phase order.
    pub fn records_for(&self, package: &str) -> Vec<PhaseRecord> {
        self.packages
            .get(package)
            .map(|r| r.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Names of packages with at least one record, sorted.
    pub fn packages(&self) -> impl Iterator<Item = &str> {
        self.packages.keys().map(String::as_str)
    }

    /// Every record, grouped by package name then phase order.
    pub fn records(&self) -> impl Iterator<Item = &PhaseRecord> {
        self.packages.values().flat_map(|r| r.values())
    }

    /// Count of (package, phase) pairs holding a record.
    pub fn len(&self) -> usize {
        self.packages.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Consume into a `package -> records` map, records in phase order.
    pub fn into_map(self) -> BTreeMap<String, Vec<PhaseRecord>> {
        self.packages
            .into_iter()
            .map(|(name, records)| (name, records.into_values().collect()))
            .collect()
    }
}
