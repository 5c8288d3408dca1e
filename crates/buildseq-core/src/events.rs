//! Status events emitted on every transition.

use std::sync::Arc;

use buildseq_state::{Phase, PhaseRecord, PhaseStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::obs;

/// A status change of a package or of one of its phases.
///
/// `phase` is `None` for package-level events (finished, skipped because a
/// dependency failed, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusEvent {
    pub package: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    pub status: PhaseStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl StatusEvent {
    /// Event for a persisted phase record.
    pub fn from_record(record: &PhaseRecord) -> Self {
        Self {
            package: record.package.clone(),
            phase: Some(record.phase),
            status: record.status,
            timestamp: record.finished_at.or(record.started_at).unwrap_or_else(Utc::now),
            detail: record.reason.as_ref().map(|r| r.to_string()),
        }
    }

    /// Package-level event.
    pub fn package(package: impl Into<String>, status: PhaseStatus, detail: Option<String>) -> Self {
        Self {
            package: package.into(),
            phase: None,
            status,
            timestamp: Utc::now(),
            detail,
        }
    }
}

/// Receiver of status events. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &StatusEvent);
}

/// Writes every event as a structured `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &StatusEvent) {
        match event.phase {
            Some(phase) => obs::emit_phase_transition(
                &event.package,
                phase,
                event.status,
                event.detail.as_deref(),
            ),
            None => obs::emit_package_finished(
                &event.package,
                &event.status.to_string(),
                event.detail.as_deref(),
            ),
        }
    }
}

/// Forwards events into a tokio channel, for embedding buildseq in another
/// program. Events are dropped once the receiver is gone.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<StatusEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StatusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: &StatusEvent) {
        let _ = self.tx.send(event.clone());
    }
}

/// Sends every event to each inner sink, in order.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: &StatusEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_record_carries_failure_reason() {
        let rec = PhaseRecord::pending("gcc", Phase::Build).start(Utc::now()).fail(
            Utc::now(),
            buildseq_state::FailureReason::NonZeroExit { code: 1 },
            Some(1),
            None,
        );
        let event = StatusEvent::from_record(&rec);
        assert_eq!(event.phase, Some(Phase::Build));
        assert_eq!(event.status, PhaseStatus::Failed);
        assert_eq!(event.detail.as_deref(), Some("exited with status 1"));
    }

    #[tokio::test]
    async fn test_fanout_reaches_every_sink() {
        let (a, mut rx_a) = ChannelSink::new();
        let (b, mut rx_b) = ChannelSink::new();
        let fanout = FanoutSink::new()
            .with(Arc::new(a))
            .with(Arc::new(TracingSink))
            .with(Arc::new(b));
        fanout.emit(&StatusEvent::package("zlib", PhaseStatus::Succeeded, None));
        assert_eq!(rx_a.recv().await.unwrap().package, "zlib");
        assert_eq!(rx_b.recv().await.unwrap().status, PhaseStatus::Succeeded);
    }

    #[test]
    fn test_channel_sink_survives_dropped_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.emit(&StatusEvent::package("zlib", PhaseStatus::Failed, None));
    }

    #[test]
    fn test_event_serializes_without_empty_fields() {
        let event = StatusEvent::package("zlib", PhaseStatus::Skipped, None);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["status"], "SKIPPED");
        assert!(json.get("phase").is_none());
    }
}
