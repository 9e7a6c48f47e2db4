//! Inbound notification parsing.
//!
//! The edge device chunks messages longer than MTU-1: continuation chunks
//! carry a leading `+`, the terminal chunk does not. [`ChunkBuffer`]
//! reassembles chunks into logical messages; [`classify`] turns a message
//! into a typed [`Notification`]. Classified messages whose payload fails
//! to parse surface as `Raw` with the node tag preserved — nothing is
//! dropped silently.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::core::node::SensorReading;

/// Sensor payload: `D:<duty>%,V:<volts>V,I:<current>mA,P:<power>mW`.
/// Unit suffixes are case-insensitive (the firmware emits both `mW` and `MW`).
static SENSOR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^D:(\d+)%,V:([\d.]+)V,I:([\d.]+)mA,P:([\d.]+)mW")
        .expect("sensor payload regex")
});

/// Node tag preceding `:DATA:`, e.g. `NODE2`.
static NODE_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^NODE(\d+)").expect("node tag regex"));

/// A reassembled, classified notification from the edge device.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// `NODE<id>:DATA:` payload that parsed cleanly.
    Sensor(SensorReading),

    /// `ERROR:` frame (mesh-level failure).
    Error(String),

    /// `TIMEOUT:` frame (mesh send timed out).
    Timeout(String),

    /// `SENT:` frame (mesh send completed; informational only).
    SendComplete(String),

    /// `MESH_READY` announcement after the edge device provisions.
    MeshReady(String),

    /// Anything unclassified, including classified messages whose payload
    /// failed to parse.
    Raw(String),
}

/// Accumulates `+`-prefixed continuation chunks into logical messages.
///
/// The buffer must be cleared on disconnect: a partial message from a dead
/// connection would otherwise corrupt the first message of the next one.
#[derive(Debug, Default)]
pub struct ChunkBuffer {
    buf: String,
}

impl ChunkBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one raw frame. Returns the completed logical message when the
    /// frame was terminal, or `None` while more chunks are pending.
    pub fn push(&mut self, frame: &[u8]) -> Option<String> {
        let decoded = String::from_utf8_lossy(frame);
        let decoded = decoded.trim();

        if let Some(rest) = decoded.strip_prefix('+') {
            self.buf.push_str(rest);
            return None;
        }

        if self.buf.is_empty() {
            Some(decoded.to_string())
        } else {
            let mut message = std::mem::take(&mut self.buf);
            message.push_str(decoded);
            Some(message)
        }
    }

    /// Drop any partial message (call on disconnect).
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// True while continuation chunks are buffered.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

/// Classify a reassembled message by prefix.
pub fn classify(message: &str) -> Notification {
    if let Some((tag, payload)) = message.split_once(":DATA:") {
        match parse_sensor(tag, payload) {
            Some(reading) => return Notification::Sensor(reading),
            // Keep the tag so the operator sees which node sent garbage.
            None => return Notification::Raw(message.to_string()),
        }
    }

    if let Some(rest) = message.strip_prefix("ERROR:") {
        Notification::Error(rest.to_string())
    } else if let Some(rest) = message.strip_prefix("TIMEOUT:") {
        Notification::Timeout(rest.to_string())
    } else if let Some(rest) = message.strip_prefix("SENT:") {
        Notification::SendComplete(rest.to_string())
    } else if message.starts_with("MESH_READY") {
        Notification::MeshReady(message.to_string())
    } else {
        Notification::Raw(message.to_string())
    }
}

/// Parse the node tag and sensor payload of a `:DATA:` message.
fn parse_sensor(tag: &str, payload: &str) -> Option<SensorReading> {
    let node = NODE_ID_RE.captures(tag)?;
    let caps = SENSOR_RE.captures(payload)?;

    Some(SensorReading {
        node_id: node.get(1)?.as_str().to_string(),
        duty: caps.get(1)?.as_str().parse().ok()?,
        voltage: caps.get(2)?.as_str().parse().ok()?,
        current: caps.get(3)?.as_str().parse().ok()?,
        power: caps.get(4)?.as_str().parse().ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_chunk_is_identity() {
        let mut buf = ChunkBuffer::new();
        let msg = buf.push(b"NODE0:DATA:D:50%,V:12.000V,I:100.0mA,P:1200.0mW");
        assert_eq!(
            msg.as_deref(),
            Some("NODE0:DATA:D:50%,V:12.000V,I:100.0mA,P:1200.0mW")
        );
        assert!(!buf.has_partial());
    }

    #[test]
    fn test_chunked_sensor_reading_reassembles() {
        // Two continuation chunks followed by a terminal chunk.
        let mut buf = ChunkBuffer::new();
        assert_eq!(buf.push(b"+NODE2:DATA:D:50%,V:12."), None);
        assert_eq!(buf.push(b"+345V,I:1234.5mA,P:15"), None);
        let msg = buf.push(b"234.5mW").expect("terminal chunk completes");
        assert_eq!(msg, "NODE2:DATA:D:50%,V:12.345V,I:1234.5mA,P:15234.5mW");

        match classify(&msg) {
            Notification::Sensor(r) => {
                assert_eq!(r.node_id, "2");
                assert_eq!(r.duty, 50);
                assert_eq!(r.voltage, 12.345);
                assert_eq!(r.current, 1234.5);
                assert_eq!(r.power, 15234.5);
            }
            other => panic!("expected sensor reading, got {:?}", other),
        }
    }

    #[test]
    fn test_arbitrary_partition_reassembles_once() {
        let original = "NODE7:DATA:D:33%,V:11.987V,I:456.7mA,P:5474.2mW";
        // Split at a few awkward byte offsets.
        for cut in [1, 5, 12, original.len() - 1] {
            let (head, tail) = original.split_at(cut);
            let mut buf = ChunkBuffer::new();
            let chunk = format!("+{head}");
            assert_eq!(buf.push(chunk.as_bytes()), None);
            assert_eq!(buf.push(tail.as_bytes()).as_deref(), Some(original));
            assert!(!buf.has_partial());
        }
    }

    #[test]
    fn test_clear_drops_partial() {
        let mut buf = ChunkBuffer::new();
        buf.push(b"+NODE1:DATA:D:1");
        buf.clear();
        // Next terminal chunk must not inherit the stale prefix.
        assert_eq!(buf.push(b"MESH_READY").as_deref(), Some("MESH_READY"));
    }

    #[test]
    fn test_classify_prefixes() {
        assert_eq!(
            classify("ERROR:MESH_TIMEOUT"),
            Notification::Error("MESH_TIMEOUT".into())
        );
        assert_eq!(
            classify("TIMEOUT:NODE3"),
            Notification::Timeout("NODE3".into())
        );
        assert_eq!(
            classify("SENT:0:DUTY:50"),
            Notification::SendComplete("0:DUTY:50".into())
        );
        assert!(matches!(
            classify("MESH_READY addr=0x0005"),
            Notification::MeshReady(_)
        ));
        assert_eq!(classify("boot v0.7.0"), Notification::Raw("boot v0.7.0".into()));
    }

    #[test]
    fn test_unparseable_payload_surfaces_as_raw() {
        // Classified as a DATA message but the payload is garbage.
        let msg = "NODE4:DATA:D:fifty%,V:?,I:?,P:?";
        assert_eq!(classify(msg), Notification::Raw(msg.to_string()));
    }

    #[test]
    fn test_case_insensitive_units() {
        let msg = "NODE0:DATA:D:10%,V:5.000V,I:200.0MA,P:1000.0MW";
        assert!(matches!(classify(msg), Notification::Sensor(_)));
    }
}
