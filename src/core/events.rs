//! Typed event fan-out for gateway observers.
//!
//! Everything outward-facing — sensor updates, connection state changes,
//! operator-visible log lines, power-manager adjustments — is published as
//! a [`GatewayEvent`] on a broadcast bus. Observers (a TUI, a web
//! dashboard, a history writer) hold receivers; no component holds a
//! pointer to another.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::core::node::SensorReading;

/// Default bus capacity. Slow observers that fall this far behind lose
/// the oldest events (broadcast lag), not the newest.
const BUS_CAPACITY: usize = 256;

/// Severity of an operator-visible log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

/// Connection lifecycle transitions published by the session layer and
/// the reconnect supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateChangeKind {
    Connected,
    Disconnected,
    Reconnecting,
    Reconnected,
    Failover,
}

/// Events fanned out to gateway observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    /// A node reported fresh telemetry.
    SensorUpdate {
        node_id: String,
        duty: u8,
        voltage: f64,
        current: f64,
        power: f64,
        last_seen: DateTime<Utc>,
    },

    /// The session's connection state changed.
    StateChange {
        kind: StateChangeKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },

    /// An operator-visible log line.
    LogLine { text: String, severity: Severity },

    /// The power manager issued (or summarized) an adjustment pass.
    PowerAdjust { summary: String },
}

impl GatewayEvent {
    /// Build a sensor-update event from a parsed reading, stamped now.
    pub fn from_reading(reading: &SensorReading) -> Self {
        Self::SensorUpdate {
            node_id: reading.node_id.clone(),
            duty: reading.duty,
            voltage: reading.voltage,
            current: reading.current,
            power: reading.power,
            last_seen: Utc::now(),
        }
    }
}

/// Thread-safe fan-out of [`GatewayEvent`]s to arbitrary subscribers.
///
/// Cloning the bus clones the sender; all clones publish into the same
/// stream. Publishing with no live subscribers is a no-op.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    /// Create a bus with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(BUS_CAPACITY)
    }

    /// Create a bus with an explicit capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Dropped silently when nobody is listening.
    pub fn publish(&self, event: GatewayEvent) {
        let _ = self.tx.send(event);
    }

    /// Publish an operator-visible log line.
    pub fn log(&self, severity: Severity, text: impl Into<String>) {
        self.publish(GatewayEvent::LogLine {
            text: text.into(),
            severity,
        });
    }

    /// Publish a connection state change.
    pub fn state_change(&self, kind: StateChangeKind, details: Option<String>) {
        self.publish(GatewayEvent::StateChange { kind, details });
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
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
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.log(Severity::Info, "hello");

        match rx.recv().await.unwrap() {
            GatewayEvent::LogLine { text, severity } => {
                assert_eq!(text, "hello");
                assert_eq!(severity, Severity::Info);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::new();
        // Must not panic or error.
        bus.state_change(StateChangeKind::Disconnected, None);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_fan_out_to_multiple_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(GatewayEvent::PowerAdjust {
            summary: "N1:40->42%".into(),
        });

        assert!(matches!(
            a.recv().await.unwrap(),
            GatewayEvent::PowerAdjust { .. }
        ));
        assert!(matches!(
            b.recv().await.unwrap(),
            GatewayEvent::PowerAdjust { .. }
        ));
    }

    #[test]
    fn test_event_serializes_tagged() {
        let event = GatewayEvent::StateChange {
            kind: StateChangeKind::Reconnecting,
            details: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"state_change\""));
        assert!(json.contains("\"reconnecting\""));
    }
}
