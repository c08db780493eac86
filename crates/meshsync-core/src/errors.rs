//! Error types for meshsync
//!
//! This module contains the error taxonomy used across the core: transport
//! failures while resolving a link, handshake failures, persistence failures,
//! change-key parsing errors, and the MeshError type that unifies them all.
//!
//! Identity conflicts are not errors in this sense. They are recorded per node
//! as [`crate::node_db::NodeErrorKind`] and never abort anything.

use thiserror::Error;

use crate::types::{ConnectionId, MeshDeviceId};

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Specific transport error types
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Connection failed to {target}: {reason}")]
    ConnectionFailed { target: String, reason: String },
    #[error("{message}")]
    Unreachable { url: String, message: String },
    #[error("{device} not available")]
    DeviceUnavailable { device: String },
    #[error("{feature} not supported")]
    Unsupported { feature: String },
    #[error("Transport is not available: {transport_type}")]
    TransportUnavailable { transport_type: String },
    #[error("Transport timeout after {duration_ms}ms")]
    Timeout { duration_ms: u64 },
    #[error("Send failed: {reason}")]
    SendFailed { reason: String },
    #[error("Transport closed: {reason}")]
    Closed { reason: String },
}

/// Device handshake error types
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("Configure request failed: {reason}")]
    ConfigureFailed { reason: String },
    #[error("Heartbeat failed: {reason}")]
    HeartbeatFailed { reason: String },
    #[error("Device rejected request: {reason}")]
    Rejected { reason: String },
}

/// Persistence error types
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage is not available")]
    Unavailable,
    #[error("Serialization failed for {collection}/{key}: {source}")]
    Serialization {
        collection: String,
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Storage backend error: {reason}")]
    Backend { reason: String },
}

/// Errors parsing a serialized change-registry key
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChangeKeyError {
    #[error("Unknown change key type: {0}")]
    UnknownType(String),
    #[error("Unknown {kind} variant: {variant}")]
    UnknownVariant { kind: &'static str, variant: String },
    #[error("Invalid channel index: {0}")]
    InvalidChannelIndex(String),
    #[error("Malformed change key: {0}")]
    Malformed(String),
}

/// Errors that can occur during connection state transitions
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateTransitionError {
    /// Invalid state transition attempted
    #[error("Invalid transition from {from_state} on event {event}")]
    InvalidTransition { from_state: String, event: String },
}

// ----------------------------------------------------------------------------
// Core Error Type
// ----------------------------------------------------------------------------

/// Core error type for meshsync
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Change key error: {0}")]
    ChangeKey(#[from] ChangeKeyError),

    #[error("State transition error: {0}")]
    StateTransition(#[from] StateTransitionError),

    /// Configuration error
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    /// Outbound action attempted without an active device link
    #[error("No active device connection")]
    NotConnected,

    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    #[error("Unknown device: {0}")]
    UnknownDevice(MeshDeviceId),
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl MeshError {
    /// Create a transport connection failed error
    pub fn connection_failed<T: Into<String>, R: Into<String>>(target: T, reason: R) -> Self {
        MeshError::Transport(TransportError::ConnectionFailed {
            target: target.into(),
            reason: reason.into(),
        })
    }

    /// Create a send failure error
    pub fn send_failed<R: Into<String>>(reason: R) -> Self {
        MeshError::Transport(TransportError::SendFailed {
            reason: reason.into(),
        })
    }

    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        MeshError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a storage backend error
    pub fn storage_error<T: Into<String>>(reason: T) -> Self {
        MeshError::Storage(StorageError::Backend {
            reason: reason.into(),
        })
    }

    /// Create a configure failure error
    pub fn handshake_failed<R: Into<String>>(reason: R) -> Self {
        MeshError::Handshake(HandshakeError::ConfigureFailed {
            reason: reason.into(),
        })
    }

    /// Whether this error belongs to the connection layer (aborts a connect attempt)
    pub fn is_connection_error(&self) -> bool {
        matches!(self, MeshError::Transport(_) | MeshError::Handshake(_))
    }

    /// Human-readable cause suitable for a connection's `error` field
    pub fn user_message(&self) -> String {
        match self {
            MeshError::Transport(err) => err.to_string(),
            MeshError::Handshake(err) => err.to_string(),
            other => other.to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, MeshError>;
pub type MeshResult<T> = Result<T>;

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_strips_layer_prefix() {
        let err = MeshError::Transport(TransportError::DeviceUnavailable {
            device: "Bluetooth device".into(),
        });
        assert_eq!(err.user_message(), "Bluetooth device not available");
        assert!(err.is_connection_error());
    }

    #[test]
    fn test_unreachable_displays_message_only() {
        let err = TransportError::Unreachable {
            url: "http://meshtastic.local".into(),
            message: "HTTP endpoint not reachable (may be blocked by CORS)".into(),
        };
        assert_eq!(
            err.to_string(),
            "HTTP endpoint not reachable (may be blocked by CORS)"
        );
    }

    #[test]
    fn test_convenience_constructors() {
        assert!(matches!(
            MeshError::config_error("bad"),
            MeshError::Configuration { .. }
        ));
        assert!(matches!(
            MeshError::storage_error("disk"),
            MeshError::Storage(StorageError::Backend { .. })
        ));
        assert!(!MeshError::NotConnected.is_connection_error());
        assert!(MeshError::handshake_failed("timeout").is_connection_error());
    }
}
