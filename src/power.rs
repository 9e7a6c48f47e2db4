//! Closed-loop power management.
//!
//! The power manager divides an operator-set power budget into weighted
//! shares, estimates each node's milliwatts-per-duty-percent from live
//! telemetry, and nudges duty cycles toward each node's share on a fixed
//! poll cadence. It never commands above the operator's duty ceiling and
//! converges toward the budget rather than guaranteeing it is never
//! momentarily exceeded.

pub mod manager;

pub use manager::{MeshPort, PowerManager};
