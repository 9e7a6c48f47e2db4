//! Wire protocol for the mesh-edge device.
//!
//! Outbound: routed command frames (`<target>:<verb>[:<value>]`).
//! Inbound: chunked UTF-8 notifications reassembled and classified into
//! typed [`Notification`]s.

pub mod command;
pub mod parser;

pub use command::{CommandFrame, NodeCommand, Target};
pub use parser::{classify, ChunkBuffer, Notification};
