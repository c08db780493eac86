//! Centralized Configuration Management
//!
//! All tunables used by the stores and the connection runtime live here so a
//! consumer can build one [`MeshConfig`] and hand it to the context.

use core::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{MeshError, Result};

// ----------------------------------------------------------------------------
// Retention Configuration
// ----------------------------------------------------------------------------

/// Caps and windows for every bounded collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Nodes not heard from for this many days are pruned
    pub node_retention_days: u64,
    /// Maximum messages kept per conversation or channel log
    pub message_log_cap: usize,
    /// Maximum number of message stores (device identity slots)
    pub message_store_cap: usize,
    /// Maximum number of device records
    pub device_cap: usize,
    /// Maximum traceroute targets tracked per device
    pub traceroute_target_cap: usize,
    /// Maximum routes remembered per traceroute target
    pub traceroute_route_cap: usize,
    /// Maximum waypoints kept per device
    pub waypoint_cap: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            node_retention_days: 14,     // Two weeks of silence
            message_log_cap: 1000,       // Per conversation/channel
            message_store_cap: 10,       // Identity slots
            device_cap: 10,              // Identity slots
            traceroute_target_cap: 100,  // Distinct targets
            traceroute_route_cap: 100,   // Routes per target
            waypoint_cap: 100,           // Waypoints per device
        }
    }
}

impl RetentionConfig {
    /// Retention window in seconds
    pub fn node_retention_secs(&self) -> u64 {
        self.node_retention_days * 24 * 60 * 60
    }

    /// Smaller caps for constrained environments
    pub fn low_memory() -> Self {
        Self {
            node_retention_days: 7,
            message_log_cap: 200,
            message_store_cap: 3,
            device_cap: 3,
            traceroute_target_cap: 20,
            traceroute_route_cap: 10,
            waypoint_cap: 25,
        }
    }

    /// Tiny caps so eviction is easy to exercise in tests
    pub fn testing() -> Self {
        Self {
            node_retention_days: 14,
            message_log_cap: 5,
            message_store_cap: 3,
            device_cap: 3,
            traceroute_target_cap: 3,
            traceroute_route_cap: 3,
            waypoint_cap: 3,
        }
    }
}

// ----------------------------------------------------------------------------
// Heartbeat Configuration
// ----------------------------------------------------------------------------

/// Heartbeat cadence for the active device link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Interval while the device is still streaming its configuration
    pub configuring_interval: Duration,
    /// Interval once the device reported configuration complete
    pub steady_interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            configuring_interval: Duration::from_secs(5), // Fast during handshake
            steady_interval: Duration::from_secs(5 * 60), // Maintenance cadence
        }
    }
}

impl HeartbeatConfig {
    /// Short intervals for tests driven by a paused clock
    pub fn testing() -> Self {
        Self {
            configuring_interval: Duration::from_millis(50),
            steady_interval: Duration::from_millis(500),
        }
    }
}

// ----------------------------------------------------------------------------
// Transport Configuration
// ----------------------------------------------------------------------------

/// Transport resolution settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Timeout for the HTTP reachability probe
    pub http_probe_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            http_probe_timeout: Duration::from_millis(2500),
        }
    }
}

// ----------------------------------------------------------------------------
// Persistence Configuration
// ----------------------------------------------------------------------------

/// Write-back settings for the persisted collections
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Whether mutations are written back at all
    pub enabled: bool,
    /// Minimum delay between a mutation and its flush (coalesces bursts)
    pub flush_throttle: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            flush_throttle: Duration::from_millis(3000),
        }
    }
}

impl PersistenceConfig {
    /// In-memory only
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

// ----------------------------------------------------------------------------
// Audit Configuration
// ----------------------------------------------------------------------------

/// Connection audit trail settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Maximum transition entries kept
    pub max_entries: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { max_entries: 1000 }
    }
}

// ----------------------------------------------------------------------------
// Mesh Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for the core and the runtime
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Bounded collection caps
    pub retention: RetentionConfig,
    /// Heartbeat cadence
    pub heartbeat: HeartbeatConfig,
    /// Transport resolution
    pub transport: TransportConfig,
    /// Persistence write-back
    pub persistence: PersistenceConfig,
    /// Connection audit trail
    pub audit: AuditConfig,
}

impl MeshConfig {
    /// Create new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration for constrained environments
    pub fn low_memory() -> Self {
        Self {
            retention: RetentionConfig::low_memory(),
            audit: AuditConfig { max_entries: 100 },
            ..Self::default()
        }
    }

    /// Configuration for tests: short timers, small caps, fast flushes
    pub fn testing() -> Self {
        Self {
            retention: RetentionConfig::testing(),
            heartbeat: HeartbeatConfig::testing(),
            transport: TransportConfig {
                http_probe_timeout: Duration::from_millis(100),
            },
            persistence: PersistenceConfig {
                enabled: true,
                flush_throttle: Duration::from_millis(100),
            },
            audit: AuditConfig { max_entries: 50 },
        }
    }

    /// Reject configurations the stores cannot honor
    pub fn validate(&self) -> Result<()> {
        let r = &self.retention;
        if r.message_log_cap == 0 {
            return Err(MeshError::config_error("Message log cap cannot be zero"));
        }
        if r.message_store_cap == 0 || r.device_cap == 0 {
            return Err(MeshError::config_error("Identity slot caps cannot be zero"));
        }
        if r.traceroute_target_cap == 0 || r.traceroute_route_cap == 0 {
            return Err(MeshError::config_error("Traceroute caps cannot be zero"));
        }
        if r.waypoint_cap == 0 {
            return Err(MeshError::config_error("Waypoint cap cannot be zero"));
        }
        if self.heartbeat.configuring_interval.is_zero() {
            return Err(MeshError::config_error("Heartbeat interval cannot be zero"));
        }
        if self.heartbeat.configuring_interval >= self.heartbeat.steady_interval {
            return Err(MeshError::config_error(
                "Configuring heartbeat must be faster than the steady heartbeat",
            ));
        }
        if self.audit.max_entries == 0 {
            return Err(MeshError::config_error("Audit trail size cannot be zero"));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
