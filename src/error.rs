use thiserror::Error;

use crate::types::ProtocolType;

/// Errors that can occur while probing an indoor bike
#[derive(Error, Debug)]
pub enum BikeError {
    /// Bluetooth Low Energy stack errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Transport-level failure reported by the BLE collaborator
    #[error("Transport error: {0}")]
    Transport(String),

    /// Device not found during scanning or lookup
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Device connection failed
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// No device is connected to the session
    #[error("No device connected")]
    NotConnected,

    /// The transport reports the device was already disconnected
    #[error("Device already disconnected")]
    AlreadyDisconnected,

    /// Operation structurally impossible for the bound protocol
    #[error("{operation} is not supported by the {protocol} protocol")]
    ProtocolUnsupported {
        /// Protocol bound to the session
        protocol: ProtocolType,
        /// Operation that was attempted
        operation: String,
    },

    /// Protocol variant recognised but not implemented
    #[error("{0} protocol is not implemented")]
    NotImplemented(ProtocolType),

    /// Reborn challenge-response mismatch
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Device signalled an authentication error and must be reconnected
    #[error("Device rejected authentication - reconnect required")]
    AuthenticationRejectedByDevice,

    /// A frame failed a structural sanity check
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Operation timed out
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Operation not valid in the current session state
    #[error("Invalid session state: {state}")]
    InvalidState {
        /// Current state description
        state: String,
    },

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for bike probing operations
pub type Result<T> = std::result::Result<T, BikeError>;

impl BikeError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::Transport(_)
                | Self::ConnectionFailed(_)
                | Self::NotConnected
                | Self::AlreadyDisconnected
                | Self::DeviceNotFound(_)
        )
    }

    /// Check if this error is recoverable without reconnecting
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::MalformedFrame(_))
    }

    /// Check if the caller has to reconnect before trying again
    #[must_use]
    pub const fn requires_reconnect(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed(_) | Self::AuthenticationRejectedByDevice
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let connection_error = BikeError::ConnectionFailed("test".to_string());
        assert!(connection_error.is_connection_error());
        assert!(!connection_error.is_recoverable());
        assert!(!connection_error.requires_reconnect());

        let timeout_error = BikeError::Timeout { timeout_ms: 5000 };
        assert!(!timeout_error.is_connection_error());
        assert!(timeout_error.is_recoverable());

        let frame_error = BikeError::MalformedFrame("short".to_string());
        assert!(frame_error.is_recoverable());

        let state_error = BikeError::InvalidState {
            state: "ready".to_string(),
        };
        assert!(!state_error.is_recoverable());
        assert!(!state_error.is_connection_error());

        let auth_error = BikeError::AuthenticationRejectedByDevice;
        assert!(!auth_error.is_connection_error());
        assert!(auth_error.requires_reconnect());
    }

    #[test]
    fn test_error_display() {
        let error = BikeError::ProtocolUnsupported {
            protocol: ProtocolType::Mobi,
            operation: "SET_RESISTANCE_LEVEL".to_string(),
        };
        let error_string = format!("{error}");
        assert!(error_string.contains("SET_RESISTANCE_LEVEL"));
        assert!(error_string.contains("MOBI"));

        let error = BikeError::NotImplemented(ProtocolType::TacxNeo);
        assert_eq!(format!("{error}"), "TACX_NEO protocol is not implemented");
    }
}
