//! Connection records and status lifecycle
//!
//! A [`Connection`] is the persisted description of how to reach a device.
//! Its [`ConnectionStatus`] only changes through the consuming
//! [`ConnectionStatus::transition`], and the [`ConnectionRegistry`] keeps an
//! audit trail of every transition it applies.

use std::collections::VecDeque;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::{MeshError, Result, StateTransitionError};
use crate::types::{ConnectionId, MeshDeviceId, Timestamp};

// ----------------------------------------------------------------------------
// Connection Types
// ----------------------------------------------------------------------------

/// Transport family of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionType {
    Http,
    Bluetooth,
    Serial,
    Unknown,
}

impl ConnectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::Http => "http",
            ConnectionType::Bluetooth => "bluetooth",
            ConnectionType::Serial => "serial",
            ConnectionType::Unknown => "unknown",
        }
    }
}

/// Transport-specific identifiers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ConnectionTarget {
    Http {
        url: String,
    },
    #[serde(rename_all = "camelCase")]
    Bluetooth {
        #[serde(default)]
        device_id: String,
        #[serde(default)]
        device_name: String,
        #[serde(default)]
        gatt_service_uuid: String,
    },
    #[serde(rename_all = "camelCase")]
    Serial {
        #[serde(default)]
        usb_vendor_id: u16,
        #[serde(default)]
        usb_product_id: u16,
    },
    Unknown,
}

impl ConnectionTarget {
    pub fn kind(&self) -> ConnectionType {
        match self {
            ConnectionTarget::Http { .. } => ConnectionType::Http,
            ConnectionTarget::Bluetooth { .. } => ConnectionType::Bluetooth,
            ConnectionTarget::Serial { .. } => ConnectionType::Serial,
            ConnectionTarget::Unknown => ConnectionType::Unknown,
        }
    }
}

// ----------------------------------------------------------------------------
// Status State Machine
// ----------------------------------------------------------------------------

/// Lifecycle status of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Configuring,
    Configured,
    Error,
}

/// Events that drive status changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A connect attempt started
    Connect,
    /// The transport was resolved and the device link attached
    TransportOpened,
    /// The configure request was issued
    ConfigureStarted,
    /// The device finished streaming its configuration
    ConfigureComplete,
    /// Transport resolution or the handshake failed
    Fail { reason: String },
    /// Teardown by request or because the link dropped
    Disconnect,
}

impl ConnectionEvent {
    fn name(&self) -> &'static str {
        match self {
            ConnectionEvent::Connect => "Connect",
            ConnectionEvent::TransportOpened => "TransportOpened",
            ConnectionEvent::ConfigureStarted => "ConfigureStarted",
            ConnectionEvent::ConfigureComplete => "ConfigureComplete",
            ConnectionEvent::Fail { .. } => "Fail",
            ConnectionEvent::Disconnect => "Disconnect",
        }
    }
}

/// Audit trail entry for one status change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: Timestamp,
    pub connection_id: ConnectionId,
    pub from_state: ConnectionStatus,
    pub to_state: ConnectionStatus,
    pub event: String,
}

/// Result of a status transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusTransition {
    pub new_status: ConnectionStatus,
    /// Cause to store on the connection when entering `Error`
    pub error: Option<String>,
    pub audit_entry: AuditEntry,
}

impl ConnectionStatus {
    /// Process an event and transition (consumes self)
    pub fn transition(
        self,
        event: ConnectionEvent,
        connection_id: ConnectionId,
        now: Timestamp,
    ) -> core::result::Result<StatusTransition, StateTransitionError> {
        use ConnectionStatus::*;

        let event_name = event.name();
        let (new_status, error) = match (self, event) {
            (Disconnected | Error, ConnectionEvent::Connect) => (Connecting, None),
            (Connecting, ConnectionEvent::TransportOpened) => (Connected, None),
            (Connected, ConnectionEvent::ConfigureStarted) => (Configuring, None),
            (Configuring | Configured, ConnectionEvent::ConfigureComplete) => (Configured, None),
            (Connecting | Connected | Configuring | Configured, ConnectionEvent::Fail { reason }) => {
                (Error, Some(reason))
            }
            (_, ConnectionEvent::Disconnect) => (Disconnected, None),
            (state, _) => {
                return Err(StateTransitionError::InvalidTransition {
                    from_state: format!("{:?}", state),
                    event: event_name.to_string(),
                });
            }
        };

        Ok(StatusTransition {
            new_status,
            error,
            audit_entry: AuditEntry {
                timestamp: now,
                connection_id,
                from_state: self,
                to_state: new_status,
                event: event_name.to_string(),
            },
        })
    }

    /// Connected, configuring or configured
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionStatus::Connected | ConnectionStatus::Configuring | ConnectionStatus::Configured
        )
    }

    /// Active or still resolving a transport
    pub fn is_busy(&self) -> bool {
        self.is_active() || *self == ConnectionStatus::Connecting
    }
}

// ----------------------------------------------------------------------------
// Connection Record
// ----------------------------------------------------------------------------

/// Persisted connection record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: ConnectionId,
    pub name: String,
    pub created_at: Timestamp,
    #[serde(default)]
    pub last_connected_at: Option<Timestamp>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub mesh_device_id: Option<MeshDeviceId>,
    #[serde(default)]
    pub is_default: bool,
    #[serde(flatten)]
    pub target: ConnectionTarget,
    #[serde(skip)]
    status: ConnectionStatus,
}

impl Connection {
    pub fn kind(&self) -> ConnectionType {
        self.target.kind()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }
}

/// User input for a new connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConnection {
    pub name: String,
    pub target: ConnectionTarget,
}

// ----------------------------------------------------------------------------
// Connection Registry
// ----------------------------------------------------------------------------

/// Statistics for connection management
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub connections_added: u64,
    pub connections_removed: u64,
    pub state_transitions: u64,
    pub rejected_transitions: u64,
}

/// All known connections plus the status audit trail
#[derive(Debug, Clone)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, Connection>,
    audit_trail: VecDeque<AuditEntry>,
    max_audit_entries: usize,
    stats: ConnectionStats,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl ConnectionRegistry {
    pub fn new(max_audit_entries: usize) -> Self {
        Self {
            connections: HashMap::new(),
            audit_trail: VecDeque::new(),
            max_audit_entries,
            stats: ConnectionStats::default(),
        }
    }

    /// Build a record from user input
    ///
    /// An HTTP connection without a name is named after its url.
    pub fn create_connection_from_input(input: NewConnection, now: Timestamp) -> Connection {
        let name = match &input.target {
            ConnectionTarget::Http { url } if input.name.is_empty() => url.clone(),
            _ => input.name,
        };
        Connection {
            id: ConnectionId::new(),
            name,
            created_at: now,
            last_connected_at: None,
            error: None,
            mesh_device_id: None,
            is_default: false,
            target: input.target,
            status: ConnectionStatus::Disconnected,
        }
    }

    /// Create and store a connection from user input
    pub fn add_connection(&mut self, input: NewConnection, now: Timestamp) -> ConnectionId {
        let connection = Self::create_connection_from_input(input, now);
        let id = connection.id;
        info!("Added {} connection {} ({})", connection.kind().as_str(), connection.name, id);
        self.insert(connection);
        id
    }

    /// Store an existing record, e.g. one loaded from persistence
    ///
    /// Loaded records always start disconnected.
    pub fn insert(&mut self, mut connection: Connection) {
        connection.status = ConnectionStatus::Disconnected;
        self.stats.connections_added += 1;
        self.connections.insert(connection.id, connection);
    }

    pub fn get_connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    /// Apply an edit to a stored connection
    pub fn update_connection<F>(&mut self, id: ConnectionId, update: F) -> Result<()>
    where
        F: FnOnce(&mut Connection),
    {
        let connection = self
            .connections
            .get_mut(&id)
            .ok_or(MeshError::UnknownConnection(id))?;
        update(connection);
        Ok(())
    }

    pub fn remove_connection(&mut self, id: ConnectionId) -> Option<Connection> {
        let removed = self.connections.remove(&id);
        if removed.is_some() {
            self.stats.connections_removed += 1;
        }
        removed
    }

    /// Every connection, oldest first
    pub fn list_connections(&self) -> Vec<&Connection> {
        let mut list: Vec<&Connection> = self.connections.values().collect();
        list.sort_by_key(|c| (c.created_at, c.id));
        list
    }

    /// Flag one connection as default and clear the flag everywhere else
    pub fn set_default_connection(&mut self, id: ConnectionId, is_default: bool) -> Result<()> {
        if !self.connections.contains_key(&id) {
            return Err(MeshError::UnknownConnection(id));
        }
        for (key, connection) in self.connections.iter_mut() {
            connection.is_default = *key == id && is_default;
        }
        Ok(())
    }

    pub fn get_default_connection(&self) -> Option<&Connection> {
        self.connections.values().find(|c| c.is_default)
    }

    /// Connections currently connected, configuring or configured
    pub fn active_connections(&self) -> Vec<ConnectionId> {
        self.connections
            .values()
            .filter(|c| c.status.is_active())
            .map(|c| c.id)
            .collect()
    }

    // ------------------------------------------------------------------------
    // Status transitions
    // ------------------------------------------------------------------------

    /// Drive a connection's status through the state machine
    ///
    /// Entering `Error` stores the cause on the record; any other successful
    /// transition clears it. Invalid transitions leave the record untouched.
    pub fn process_connection_event(
        &mut self,
        id: ConnectionId,
        event: ConnectionEvent,
        now: Timestamp,
    ) -> Result<StatusTransition> {
        let connection = self
            .connections
            .get_mut(&id)
            .ok_or(MeshError::UnknownConnection(id))?;

        let transition = match connection.status.transition(event, id, now) {
            Ok(transition) => transition,
            Err(err) => {
                warn!("Connection {}: {}", id, err);
                self.stats.rejected_transitions += 1;
                return Err(err.into());
            }
        };

        connection.status = transition.new_status;
        match transition.new_status {
            ConnectionStatus::Error => connection.error = transition.error.clone(),
            ConnectionStatus::Connecting => connection.error = None,
            _ => {}
        }

        self.audit_trail.push_back(transition.audit_entry.clone());
        while self.audit_trail.len() > self.max_audit_entries {
            self.audit_trail.pop_front();
        }
        self.stats.state_transitions += 1;

        Ok(transition)
    }

    /// Most recent audit entries, oldest first
    pub fn get_recent_audit_entries(&self, limit: usize) -> Vec<&AuditEntry> {
        let start = self.audit_trail.len().saturating_sub(limit);
        self.audit_trail.iter().skip(start).collect()
    }

    pub fn audit_len(&self) -> usize {
        self.audit_trail.len()
    }

    pub fn get_statistics(&self) -> &ConnectionStats {
        &self.stats
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_http(name: &str, url: &str) -> NewConnection {
        NewConnection {
            name: name.to_string(),
            target: ConnectionTarget::Http {
                url: url.to_string(),
            },
        }
    }

    #[test]
    fn test_happy_path_transitions() {
        let id = ConnectionId::new();
        let now = Timestamp::new(1);
        let mut status = ConnectionStatus::Disconnected;
        for (event, expected) in [
            (ConnectionEvent::Connect, ConnectionStatus::Connecting),
            (ConnectionEvent::TransportOpened, ConnectionStatus::Connected),
            (ConnectionEvent::ConfigureStarted, ConnectionStatus::Configuring),
            (ConnectionEvent::ConfigureComplete, ConnectionStatus::Configured),
            (ConnectionEvent::Disconnect, ConnectionStatus::Disconnected),
        ] {
            let transition = status.transition(event, id, now).unwrap();
            assert_eq!(transition.new_status, expected);
            assert_eq!(transition.audit_entry.from_state, status);
            status = transition.new_status;
        }
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let id = ConnectionId::new();
        let now = Timestamp::new(1);
        assert!(ConnectionStatus::Disconnected
            .transition(ConnectionEvent::TransportOpened, id, now)
            .is_err());
        assert!(ConnectionStatus::Disconnected
            .transition(ConnectionEvent::Fail { reason: "x".into() }, id, now)
            .is_err());
        assert!(ConnectionStatus::Configured
            .transition(ConnectionEvent::Connect, id, now)
            .is_err());
    }

    #[test]
    fn test_fail_carries_reason() {
        let transition = ConnectionStatus::Connecting
            .transition(
                ConnectionEvent::Fail {
                    reason: "Bluetooth device not available".into(),
                },
                ConnectionId::new(),
                Timestamp::new(1),
            )
            .unwrap();
        assert_eq!(transition.new_status, ConnectionStatus::Error);
        assert_eq!(transition.error.as_deref(), Some("Bluetooth device not available"));
    }

    #[test]
    fn test_http_name_defaults_to_url() {
        let conn = ConnectionRegistry::create_connection_from_input(
            create_test_http("", "http://meshtastic.local"),
            Timestamp::new(1),
        );
        assert_eq!(conn.name, "http://meshtastic.local");
        assert_eq!(conn.kind(), ConnectionType::Http);
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_single_default() {
        let mut registry = ConnectionRegistry::default();
        let a = registry.add_connection(create_test_http("a", "http://a"), Timestamp::new(1));
        let b = registry.add_connection(create_test_http("b", "http://b"), Timestamp::new(2));

        registry.set_default_connection(a, true).unwrap();
        registry.set_default_connection(b, true).unwrap();
        assert_eq!(registry.get_default_connection().map(|c| c.id), Some(b));
        assert!(!registry.get_connection(a).unwrap().is_default);

        registry.set_default_connection(b, false).unwrap();
        assert!(registry.get_default_connection().is_none());
        assert!(registry.set_default_connection(ConnectionId::new(), true).is_err());
    }

    #[test]
    fn test_list_ordered_by_creation() {
        let mut registry = ConnectionRegistry::default();
        let late = registry.add_connection(create_test_http("late", "http://l"), Timestamp::new(20));
        let early = registry.add_connection(create_test_http("early", "http://e"), Timestamp::new(10));
        let ids: Vec<ConnectionId> = registry.list_connections().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![early, late]);
    }

    #[test]
    fn test_registry_records_audit_and_error() {
        let mut registry = ConnectionRegistry::new(3);
        let id = registry.add_connection(create_test_http("a", "http://a"), Timestamp::new(1));
        let now = Timestamp::new(5);

        registry.process_connection_event(id, ConnectionEvent::Connect, now).unwrap();
        registry
            .process_connection_event(id, ConnectionEvent::Fail { reason: "down".into() }, now)
            .unwrap();
        let conn = registry.get_connection(id).unwrap();
        assert_eq!(conn.status(), ConnectionStatus::Error);
        assert_eq!(conn.error.as_deref(), Some("down"));

        assert!(registry
            .process_connection_event(id, ConnectionEvent::ConfigureComplete, now)
            .is_err());
        assert_eq!(registry.get_statistics().rejected_transitions, 1);

        registry.process_connection_event(id, ConnectionEvent::Connect, now).unwrap();
        assert_eq!(registry.get_connection(id).unwrap().error, None);
        registry.process_connection_event(id, ConnectionEvent::Disconnect, now).unwrap();

        assert_eq!(registry.audit_len(), 3);
        let recent = registry.get_recent_audit_entries(1);
        assert_eq!(recent[0].to_state, ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_connection_serde_flattens_target() {
        let conn = ConnectionRegistry::create_connection_from_input(
            NewConnection {
                name: "radio".into(),
                target: ConnectionTarget::Serial {
                    usb_vendor_id: 0x239a,
                    usb_product_id: 0x8029,
                },
            },
            Timestamp::new(1),
        );
        let json = serde_json::to_value(&conn).unwrap();
        assert_eq!(json["type"], "serial");
        assert_eq!(json["usbVendorId"], 0x239a);
        assert!(json.get("status").is_none());

        let back: Connection = serde_json::from_value(json).unwrap();
        assert_eq!(back, conn);
    }
}
