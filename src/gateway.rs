//! Gateway controller layer.
//!
//! This module holds session state and command routing:
//! - `Controller`: the typed command API and notification dispatch
//! - `signals`: per-node one-shot response latches
//! - `supervisor`: connection health polling with auto-failover
//!
//! # Architecture
//!
//! The controller never exposes the transport directly. Observers attach
//! through the event bus; the power manager reaches the mesh through the
//! controller's shared link, which enforces the connected/reconnecting
//! short-circuits for every writer.

pub mod controller;
pub mod signals;
pub mod supervisor;

pub use controller::{CachedReading, Controller};
pub use signals::ResponseSignals;
pub use supervisor::failover_order;
