//! C9 — Event Bus.
//!
//! Publish/subscribe fan-out for the two subjects named in §6:
//! `models.model.loaded` and `memory.pressure.warning`. Grounded on
//! `mofa-kernel`'s `AgentBus`, which fans broadcast messages out per
//! subject via `tokio::sync::broadcast`. A bounded `broadcast` channel is
//! itself a ring buffer that overwrites its oldest unread entry once full —
//! exactly the drop-oldest overflow policy §9 calls for in place of the
//! original's unbounded per-subject queues, so no extra backpressure layer
//! is needed on top of it. Slow subscribers observe
//! `RecvError::Lagged(n)` and are responsible for their own catch-up, per
//! §5's "subscribers process at their own pace" shared-resource policy.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use moc_telemetry::Telemetry;
use std::sync::Arc;

/// Default per-subject ring buffer depth.
pub const DEFAULT_SUBJECT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    ModelLoaded {
        model_name: String,
        vram_mb: u64,
        at: DateTime<Utc>,
    },
    MemoryPressureWarning {
        device_id: u32,
        usage_pct: f64,
        at: DateTime<Utc>,
    },
}

impl Event {
    pub fn subject(&self) -> &'static str {
        match self {
            Event::ModelLoaded { .. } => "models.model.loaded",
            Event::MemoryPressureWarning { .. } => "memory.pressure.warning",
        }
    }
}

pub struct EventBus {
    subjects: DashMap<&'static str, broadcast::Sender<Event>>,
    capacity: usize,
    telemetry: Option<Arc<Telemetry>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBJECT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subjects: DashMap::new(),
            capacity,
            telemetry: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<Telemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    fn sender_for(&self, subject: &'static str) -> broadcast::Sender<Event> {
        self.subjects
            .entry(subject)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Subscribe to a specific subject. Returns immediately; messages
    /// published before this call are not replayed.
    pub fn subscribe(&self, subject: &'static str) -> broadcast::Receiver<Event> {
        self.sender_for(subject).subscribe()
    }

    /// Publish an event on its own subject. A publish with zero current
    /// subscribers on that subject is a successful no-op, matching
    /// fire-and-forget fan-out semantics.
    pub fn publish(&self, event: Event) {
        let subject = event.subject();
        let sender = self.sender_for(subject);
        let _ = sender.send(event);
        if let Some(telemetry) = &self.telemetry {
            let _ = telemetry; // reserved for future bus-depth gauges
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("models.model.loaded");
        bus.publish(Event::ModelLoaded {
            model_name: "m".into(),
            vram_mb: 9000,
            at: Utc::now(),
        });
        let evt = rx.recv().await.unwrap();
        match evt {
            Event::ModelLoaded { model_name, .. } => assert_eq!(model_name, "m"),
            _ => panic!("wrong subject delivered"),
        }
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_error() {
        let bus = EventBus::new();
        bus.publish(Event::MemoryPressureWarning {
            device_id: 0,
            usage_pct: 92.0,
            at: Utc::now(),
        });
    }

    #[tokio::test]
    async fn overflow_drops_oldest_not_newest() {
        let bus = EventBus::with_capacity(2);
        let mut rx = bus.subscribe("models.model.loaded");
        for i in 0..5u64 {
            bus.publish(Event::ModelLoaded {
                model_name: format!("m{i}"),
                vram_mb: i,
                at: Utc::now(),
            });
        }
        // The receiver lagged; the next recv reports it rather than silently
        // returning the oldest entry.
        let err = rx.recv().await.unwrap_err();
        matches!(err, broadcast::error::RecvError::Lagged(_));
    }
}
