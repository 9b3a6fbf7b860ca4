//! Progress events and the bounded fan-in sink
//!
//! Every pipeline of a run reports through a clone of one `EventSink`.
//! The sink never blocks a producer: when the queue is full, new events
//! are dropped and the drop is logged once per overflow burst. Consumers
//! treat `(source_id, phase)` as the interleaving key; events for one
//! source are phase-monotonic, events across sources interleave freely.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Pipeline phase that emitted an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Classify,
    ExpandAndScore,
    Synthesize,
    Validate,
    /// Run-level events (pipeline start, terminal result, failure)
    Pipeline,
}

/// Event status within a phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Started,
    Progress,
    Completed,
    Failed,
}

/// One progress event on the live stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub source_id: String,
    pub phase: Phase,
    pub status: EventStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(
        source_id: impl Into<String>,
        phase: Phase,
        status: EventStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            phase,
            status,
            message: message.into(),
            data: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Bounded multi-producer sink feeding one consumer
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<ProgressEvent>,
    dropped_in_burst: Arc<AtomicU64>,
}

impl EventSink {
    /// Create a sink and its single consumer end
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped_in_burst: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Enqueue one event without ever blocking the producer
    pub fn emit(&self, event: ProgressEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {
                let dropped = self.dropped_in_burst.swap(0, Ordering::Relaxed);
                if dropped > 0 {
                    tracing::warn!(dropped, "progress queue recovered after overflow burst");
                }
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Log the first drop of a burst, count the rest
                if self.dropped_in_burst.fetch_add(1, Ordering::Relaxed) == 0 {
                    tracing::warn!("progress queue full, dropping new events");
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // Consumer went away; nothing useful to do
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(source: &str, phase: Phase, status: EventStatus) -> ProgressEvent {
        ProgressEvent::new(source, phase, status, "test")
    }

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let (sink, mut rx) = EventSink::new(8);
        sink.emit(event("rust", Phase::Classify, EventStatus::Started));
        sink.emit(event("rust", Phase::Classify, EventStatus::Completed));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.status, EventStatus::Started);
        assert_eq!(second.status, EventStatus::Completed);
    }

    #[tokio::test]
    async fn test_full_queue_drops_new_events() {
        let (sink, mut rx) = EventSink::new(1);
        sink.emit(event("rust", Phase::Classify, EventStatus::Started));
        // Queue is full; these are dropped, never blocking
        sink.emit(event("rust", Phase::Classify, EventStatus::Progress));
        sink.emit(event("rust", Phase::Classify, EventStatus::Progress));

        let kept = rx.recv().await.unwrap();
        assert_eq!(kept.status, EventStatus::Started);

        // Draining makes room again
        sink.emit(event("rust", Phase::Classify, EventStatus::Completed));
        let next = rx.recv().await.unwrap();
        assert_eq!(next.status, EventStatus::Completed);
    }

    #[tokio::test]
    async fn test_emit_after_consumer_drop_is_silent() {
        let (sink, rx) = EventSink::new(4);
        drop(rx);
        sink.emit(event("rust", Phase::Synthesize, EventStatus::Started));
    }

    #[test]
    fn test_event_serialization_shape() {
        let e = event("rust", Phase::ExpandAndScore, EventStatus::Completed)
            .with_data(serde_json::json!({"added": 3}));
        let value = serde_json::to_value(&e).unwrap();
        assert_eq!(value["phase"], "expand_and_score");
        assert_eq!(value["status"], "completed");
        assert_eq!(value["data"]["added"], 3);
    }
}
