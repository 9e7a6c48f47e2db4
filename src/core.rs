//! Core abstractions for the mesh gateway.
//!
//! This module provides the data model, event types, and error taxonomy
//! shared by the transport, controller, and power manager.

pub mod error;
pub mod events;
pub mod node;

pub use error::{GatewayError, Result};
pub use events::{EventBus, GatewayEvent, Severity, StateChangeKind};
pub use node::{NodeState, SensorReading};
