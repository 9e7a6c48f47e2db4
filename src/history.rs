//! Sensor history sink.
//!
//! The gateway appends one row per sensor update. The contract is
//! synchronous and append-only; the production store (SQLite in WAL mode,
//! shared with the web dashboard) lives outside this crate. Persistence
//! errors are swallowed by the caller — history must never stall the
//! notification path.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::Result;

/// One stored sensor reading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRow {
    pub timestamp: DateTime<Utc>,
    pub node_id: String,
    pub duty: u8,
    pub voltage: f64,
    pub current_ma: f64,
    pub power_mw: f64,
    /// Duty the power manager last confirmed for this node, 0 when idle.
    pub commanded_duty: u8,
}

/// Append-only history store.
pub trait HistorySink: Send + Sync {
    /// Append a reading. Called synchronously from the event path.
    fn insert_reading(
        &self,
        node_id: &str,
        duty: u8,
        voltage: f64,
        current_ma: f64,
        power_mw: f64,
        commanded_duty: u8,
    ) -> Result<()>;
}

/// In-memory history, for tests and headless runs without a database.
#[derive(Debug, Default)]
pub struct MemoryHistory {
    rows: Mutex<Vec<HistoryRow>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// All rows, oldest first.
    pub fn rows(&self) -> Vec<HistoryRow> {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of stored rows.
    pub fn len(&self) -> usize {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl HistorySink for MemoryHistory {
    fn insert_reading(
        &self,
        node_id: &str,
        duty: u8,
        voltage: f64,
        current_ma: f64,
        power_mw: f64,
        commanded_duty: u8,
    ) -> Result<()> {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(HistoryRow {
                timestamp: Utc::now(),
                node_id: node_id.to_string(),
                duty,
                voltage,
                current_ma,
                power_mw,
                commanded_duty,
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_read_back() {
        let history = MemoryHistory::new();
        history
            .insert_reading("2", 50, 12.345, 1234.5, 15234.5, 0)
            .unwrap();

        let rows = history.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].node_id, "2");
        assert_eq!(rows[0].duty, 50);
        assert_eq!(rows[0].power_mw, 15234.5);
    }

    #[test]
    fn test_append_only_ordering() {
        let history = MemoryHistory::new();
        for duty in [10, 20, 30] {
            history
                .insert_reading("1", duty, 12.0, 100.0, 1200.0, 0)
                .unwrap();
        }
        let duties: Vec<u8> = history.rows().iter().map(|r| r.duty).collect();
        assert_eq!(duties, vec![10, 20, 30]);
    }
}
