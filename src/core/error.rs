//! Error types for the mesh gateway.

use thiserror::Error;

/// A specialized Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// The main error type for all gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    // === Discovery Errors ===
    /// Scan completed without finding any gateway device
    #[error("No mesh gateways found")]
    ScanEmpty,

    /// Scan itself failed
    #[error("Scan error: {0}")]
    Scan(String),

    // === Connection Errors ===
    /// Connection attempt failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// The device lacks the gateway GATT service (relay or plain sensor node)
    #[error("No gateway service on {0}")]
    NoGattService(String),

    /// Command attempted while disconnected
    #[error("Not connected")]
    NotConnected,

    /// Command attempted while the supervisor is reconnecting
    #[error("Reconnecting, command rejected")]
    Reconnecting,

    // === Protocol Errors ===
    /// A classified notification whose payload failed to parse
    #[error("Parse error: {0}")]
    Parse(String),

    /// Invalid node target (not 0-9 or ALL)
    #[error("Invalid node target: {0}")]
    InvalidTarget(String),

    /// A node did not confirm a command within the wait window
    #[error("Node {0} did not respond")]
    NodeNoResponse(String),

    // === Configuration Errors ===
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // === Transport Errors ===
    /// Underlying BLE stack error
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // === Internal Errors ===
    /// Internal error (bug)
    #[error("Internal error: {0}")]
    Internal(String),

    /// The I/O thread or an event channel has shut down
    #[error("Channel closed")]
    ChannelClosed,
}

impl GatewayError {
    /// Check if this error indicates the link is gone and the supervisor
    /// should take over.
    pub fn needs_reconnect(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::NotConnected | Self::Ble(_) | Self::ChannelClosed
        )
    }

    /// Check if this error is retryable against the same device.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::NodeNoResponse(_))
    }

    /// Create a scan error.
    pub fn scan(msg: impl Into<String>) -> Self {
        Self::Scan(msg.into())
    }

    /// Create a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a parse error.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_reconnect() {
        assert!(GatewayError::NotConnected.needs_reconnect());
        assert!(GatewayError::connection("test").needs_reconnect());
        assert!(!GatewayError::parse("test").needs_reconnect());
        assert!(!GatewayError::Reconnecting.needs_reconnect());
    }

    #[test]
    fn test_is_retryable() {
        assert!(GatewayError::NodeNoResponse("3".into()).is_retryable());
        assert!(GatewayError::connection("test").is_retryable());
        assert!(!GatewayError::NotConnected.is_retryable());
    }
}
