//! Outbound command frames.
//!
//! Commands are routed strings of the form `<target>:<verb>[:<value>]`.
//! The edge device forwards node-addressed frames over the mesh and
//! translates `ALL` into a single group broadcast, so a group READ costs
//! O(1) airtime instead of O(n) per-node messages.

use std::fmt;
use std::str::FromStr;

use crate::core::error::{GatewayError, Result};

/// Addressing for a command frame: a single mesh node or the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    /// One mesh node, address 0-9.
    Node(u8),

    /// Every subscribed node via group broadcast.
    All,
}

impl Target {
    /// Parse a target from operator input ("0".."9", "all"/"ALL").
    pub fn parse(s: &str) -> Result<Self> {
        s.parse()
    }

    /// Wire form of this target.
    pub fn as_wire(&self) -> String {
        match self {
            Self::Node(n) => n.to_string(),
            Self::All => "ALL".to_string(),
        }
    }
}

impl FromStr for Target {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("all") {
            return Ok(Self::All);
        }
        match s.parse::<u8>() {
            Ok(n) if n <= 9 => Ok(Self::Node(n)),
            _ => Err(GatewayError::InvalidTarget(s.to_string())),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_wire())
    }
}

/// The verbs a mesh node understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeCommand {
    /// Set the duty cycle, clamped to 0-100 %.
    Duty(u8),

    /// Start the ramp test.
    Ramp,

    /// Stop the load.
    Stop,

    /// Request a single sensor reading.
    Read,

    /// Request device status.
    Status,

    /// Start continuous monitoring.
    Monitor,
}

impl NodeCommand {
    /// The verb token on the wire.
    pub const fn verb(&self) -> &'static str {
        match self {
            Self::Duty(_) => "DUTY",
            Self::Ramp => "RAMP",
            Self::Stop => "STOP",
            Self::Read => "READ",
            Self::Status => "STATUS",
            Self::Monitor => "MONITOR",
        }
    }

    /// Optional value token on the wire.
    fn value(&self) -> Option<String> {
        match self {
            Self::Duty(pct) => Some(pct.to_string()),
            _ => None,
        }
    }
}

/// A complete routed command, ready for the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFrame {
    pub target: Target,
    pub command: NodeCommand,
}

impl CommandFrame {
    /// Build a frame. Duty values are clamped to 100 here so nothing
    /// out of range ever reaches the wire.
    pub fn new(target: Target, command: NodeCommand) -> Self {
        let command = match command {
            NodeCommand::Duty(pct) => NodeCommand::Duty(pct.min(100)),
            other => other,
        };
        Self { target, command }
    }

    /// Convenience constructor for the common duty write.
    pub fn duty(target: Target, pct: u8) -> Self {
        Self::new(target, NodeCommand::Duty(pct))
    }
}

impl fmt::Display for CommandFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.command.value() {
            Some(value) => write!(f, "{}:{}:{}", self.target, self.command.verb(), value),
            None => write!(f, "{}:{}", self.target, self.command.verb()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_parse() {
        assert_eq!(Target::parse("0").unwrap(), Target::Node(0));
        assert_eq!(Target::parse("9").unwrap(), Target::Node(9));
        assert_eq!(Target::parse("all").unwrap(), Target::All);
        assert_eq!(Target::parse("ALL").unwrap(), Target::All);
        assert!(Target::parse("10").is_err());
        assert!(Target::parse("x").is_err());
        assert!(Target::parse("-1").is_err());
    }

    #[test]
    fn test_frame_wire_forms() {
        let f = CommandFrame::duty(Target::Node(3), 50);
        assert_eq!(f.to_string(), "3:DUTY:50");

        let f = CommandFrame::new(Target::All, NodeCommand::Read);
        assert_eq!(f.to_string(), "ALL:READ");

        let f = CommandFrame::new(Target::Node(0), NodeCommand::Stop);
        assert_eq!(f.to_string(), "0:STOP");
    }

    #[test]
    fn test_duty_clamped() {
        let f = CommandFrame::duty(Target::Node(1), 200);
        assert_eq!(f.to_string(), "1:DUTY:100");
    }
}
