// ── Event notification ──
//
// Fire-and-forget fan-out of reconciliation and maintenance events.
// Publishing never blocks and never fails; a sink with nowhere to put
// an event drops it.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tokio::sync::{broadcast, mpsc};
use tracing::trace;
use uuid::Uuid;

const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
    DeviceDiscovered,
    DeviceUpdated,
    MetricsCollected,
    FieldLocked,
    FieldUnlocked,
    DownsamplingCompleted,
    GarbageCollected,
}

/// One published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetEvent {
    pub id: Uuid,
    pub kind: EventKind,
    pub at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl FleetEvent {
    pub fn new(kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            at: Utc::now(),
            payload,
        }
    }
}

/// Publish capability handed to the core.
pub trait EventSink: Send + Sync + fmt::Debug {
    fn publish(&self, kind: EventKind, payload: serde_json::Value);
}

// ── Broadcast ────────────────────────────────────────────────────────

/// Fan-out to any number of in-process subscribers. Events published
/// while nobody is subscribed are dropped; slow subscribers lag.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<Arc<FleetEvent>>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<FleetEvent>> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(DEFAULT_BROADCAST_CAPACITY)
    }
}

impl EventSink for BroadcastSink {
    fn publish(&self, kind: EventKind, payload: serde_json::Value) {
        let _ = self.tx.send(Arc::new(FleetEvent::new(kind, payload)));
    }
}

// ── Bounded channel ──────────────────────────────────────────────────

/// Single consumer (e.g. an uploader). A full buffer drops the event.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<FleetEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<FleetEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn publish(&self, kind: EventKind, payload: serde_json::Value) {
        if let Err(e) = self.tx.try_send(FleetEvent::new(kind, payload)) {
            trace!(event = %kind, error = %e, "event dropped");
        }
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _kind: EventKind, _payload: serde_json::Value) {}
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn broadcast_without_subscribers_is_silent() {
        let sink = BroadcastSink::new(4);
        sink.publish(EventKind::DeviceDiscovered, json!({ "serial": "A" }));

        let mut rx = sink.subscribe();
        sink.publish(EventKind::DeviceUpdated, json!({ "serial": "A" }));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::DeviceUpdated);
    }

    #[tokio::test]
    async fn full_channel_drops_instead_of_blocking() {
        let (sink, mut rx) = ChannelSink::new(1);
        sink.publish(EventKind::FieldLocked, json!(1));
        sink.publish(EventKind::FieldUnlocked, json!(2));

        assert_eq!(rx.recv().await.unwrap().kind, EventKind::FieldLocked);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn kinds_use_snake_case_names() {
        assert_eq!(EventKind::DownsamplingCompleted.to_string(), "downsampling_completed");
        assert_eq!(
            serde_json::to_value(EventKind::GarbageCollected).unwrap(),
            json!("garbage_collected")
        );
    }
}
