//! Per-node state for the mesh gateway.
//!
//! A [`NodeState`] is created the first time a node responds with a
//! parseable sensor reading and lives until the controller shuts down;
//! an unreachable node is marked unresponsive, never evicted.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// One parsed sensor payload from a mesh node.
///
/// This is the unit that flows from the notification parser through the
/// controller to the event bus and the history sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    /// Node identifier in wire form ("0".."9").
    pub node_id: String,

    /// Reported duty cycle, 0-100 %.
    pub duty: u8,

    /// Bus voltage in volts.
    pub voltage: f64,

    /// Load current in milliamps.
    pub current: f64,

    /// Load power in milliwatts.
    pub power: f64,
}

/// Tracks the last known state of a single mesh node.
#[derive(Debug, Clone)]
pub struct NodeState {
    /// Node identifier in wire form ("0".."9").
    pub node_id: String,

    /// Current duty from the last sensor reading, 0-100 %.
    pub duty: u8,

    /// Operator-requested duty ceiling; the power manager never commands
    /// above this, and restores it when the threshold is cleared.
    pub target_duty: u8,

    /// Last duty the power manager confirmed it sent (not sensor data —
    /// sensor readings lag the device by up to a cycle).
    pub commanded_duty: u8,

    /// Bus voltage in volts.
    pub voltage: f64,

    /// Load current in milliamps.
    pub current: f64,

    /// Load power in milliwatts.
    pub power: f64,

    /// Monotonic timestamp of the last sensor response.
    pub last_seen: Instant,

    /// False once the node has been silent past the staleness timeout.
    pub responsive: bool,

    /// Poll-cycle generation that last refreshed this node.
    pub poll_gen: u64,
}

impl NodeState {
    /// Create a fresh node record with zeroed telemetry.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            duty: 0,
            target_duty: 0,
            commanded_duty: 0,
            voltage: 0.0,
            current: 0.0,
            power: 0.0,
            last_seen: Instant::now(),
            responsive: true,
            poll_gen: 0,
        }
    }

    /// Apply a sensor reading: telemetry fields, freshness, and the poll
    /// generation that produced it. Command fields are untouched.
    pub fn apply_reading(&mut self, reading: &SensorReading, poll_gen: u64) {
        self.duty = reading.duty;
        self.voltage = reading.voltage;
        self.current = reading.current;
        self.power = reading.power;
        self.last_seen = Instant::now();
        self.responsive = true;
        self.poll_gen = poll_gen;
    }

    /// Seconds since the node last responded.
    pub fn age_secs(&self) -> f64 {
        self.last_seen.elapsed().as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_node_defaults() {
        let ns = NodeState::new("3");
        assert_eq!(ns.node_id, "3");
        assert_eq!(ns.duty, 0);
        assert_eq!(ns.commanded_duty, 0);
        assert!(ns.responsive);
    }

    #[test]
    fn test_apply_reading_leaves_command_fields() {
        let mut ns = NodeState::new("1");
        ns.target_duty = 80;
        ns.commanded_duty = 45;

        let reading = SensorReading {
            node_id: "1".into(),
            duty: 50,
            voltage: 12.3,
            current: 1200.0,
            power: 14760.0,
        };
        ns.apply_reading(&reading, 7);

        assert_eq!(ns.duty, 50);
        assert_eq!(ns.poll_gen, 7);
        assert_eq!(ns.target_duty, 80);
        assert_eq!(ns.commanded_duty, 45);
    }
}
