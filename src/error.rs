use thiserror::Error;

/// Errors that can occur while discovering robots and pulling their status
#[derive(Error, Debug)]
pub enum NexusError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// No Bluetooth adapter is available on this host
    #[error("No Bluetooth adapter found")]
    AdapterNotFound,

    /// An operation needed an open session but there is none
    #[error("No peripheral connected")]
    NotConnected,

    /// Device connection failed
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// GATT service discovery did not complete
    #[error("Service discovery failed")]
    ServiceDiscoveryFailed,

    /// A blocking wait on a radio completion ran out of time
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        /// Operation that was waiting
        operation: &'static str,
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Subscription or initial-read handshake failed
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The reassembled document could not be interpreted
    #[error("Malformed document: {0}")]
    MalformedDocument(String),

    /// JSON decoding failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A wave kept stalling after repeated missing-packet requests
    #[error("Wave {wave} still incomplete after {rounds} retransmission rounds")]
    RetransmissionLimit {
        /// Zero-based wave index within the transfer
        wave: u32,
        /// Number of missing-packet requests sent for the wave
        rounds: u32,
    },

    /// A worker's channel was closed underneath it
    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),

    /// Configuration rejected by validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for robot-nexus operations
pub type Result<T> = std::result::Result<T, NexusError>;

impl NexusError {
    /// Check if this error is a transient radio fault, recovered by resetting
    /// the adapter and rescanning
    #[must_use]
    pub const fn is_radio_fault(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::ConnectionFailed(_)
                | Self::ServiceDiscoveryFailed
                | Self::AdapterNotFound
        )
    }

    /// Check if this error comes from packet loss within a transfer
    #[must_use]
    pub const fn is_protocol_loss(&self) -> bool {
        matches!(self, Self::RetransmissionLimit { .. } | Self::Protocol(_))
    }

    /// Check if this error means the peripheral sent data we cannot use
    #[must_use]
    pub const fn is_malformed_data(&self) -> bool {
        matches!(self, Self::MalformedDocument(_) | Self::Json(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let connection_error = NexusError::ConnectionFailed("gatt 133".to_string());
        assert!(connection_error.is_radio_fault());
        assert!(!connection_error.is_protocol_loss());
        assert!(!connection_error.is_malformed_data());

        let loss = NexusError::RetransmissionLimit { wave: 1, rounds: 5 };
        assert!(!loss.is_radio_fault());
        assert!(loss.is_protocol_loss());

        let malformed = NexusError::MalformedDocument("missing state".to_string());
        assert!(malformed.is_malformed_data());
        assert!(!malformed.is_radio_fault());

        let json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(NexusError::from(json).is_malformed_data());
    }

    #[test]
    fn test_error_display() {
        let error = NexusError::Timeout {
            operation: "descriptor write",
            timeout_ms: 5000,
        };
        let error_string = format!("{error}");
        assert!(error_string.contains("descriptor write"));
        assert!(error_string.contains("5000ms"));
    }
}
