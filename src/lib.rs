//! # Mesh Gateway (meshgw)
//!
//! A host-side BLE gateway for a mesh of battery-powered DC load nodes,
//! with a closed-loop power manager that holds aggregate draw below an
//! operator-set threshold.
//!
//! ## Features
//!
//! - **Single-link session**: one GATT connection to the mesh-edge device,
//!   with scan, subscribe, and auto-failover to surviving gateways
//! - **Typed wire protocol**: routed `<node>:<verb>[:<value>]` commands and
//!   chunk-reassembled, classified notifications
//! - **Equilibrium power manager**: weighted budget shares, live
//!   mW-per-duty-% estimation, cooldown and dead-band damped nudging
//! - **Event-bus observers**: TUIs, dashboards, and history writers
//!   subscribe; no component holds a pointer to another
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use meshgw::prelude::*;
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//!
//! // On the dedicated I/O runtime:
//! let (frame_tx, frame_rx) = mpsc::unbounded_channel();
//! let session = Arc::new(Session::new(frame_tx).await?);
//! let controller = Controller::new(session, EventBus::new(), None);
//! tokio::spawn(controller.clone().run_notifications(frame_rx));
//!
//! let devices = controller.scan(Duration::from_secs(10), None).await?;
//! controller.connect_first(&devices).await?;
//! controller.set_duty(Target::Node(1), 50).await?;
//! controller.enable_threshold(3000.0);
//! ```
//!
//! ## Threading Model
//!
//! The BLE stack delivers notifications over inter-process signals that
//! need a continuously running reactor, so the session lives on a
//! dedicated I/O thread ([`transport::IoThread`]). UI threads observe
//! through [`core::events::EventBus`] receivers and submit work onto the
//! I/O runtime.

pub mod config;
pub mod core;
pub mod gateway;
pub mod history;
pub mod power;
pub mod protocol;
pub mod transport;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::core::{
        error::{GatewayError, Result},
        events::{EventBus, GatewayEvent, Severity, StateChangeKind},
        node::{NodeState, SensorReading},
    };
    pub use crate::gateway::Controller;
    pub use crate::power::PowerManager;
    pub use crate::protocol::{CommandFrame, NodeCommand, Target};
    pub use crate::transport::{Device, IoThread, Session};
}

// Re-export core types at crate root for convenience
pub use crate::core::error::{GatewayError, Result};
pub use crate::core::events::{EventBus, GatewayEvent, Severity, StateChangeKind};
pub use crate::core::node::{NodeState, SensorReading};
pub use crate::gateway::Controller;
pub use crate::power::PowerManager;
pub use crate::protocol::{CommandFrame, NodeCommand, Target};
