//! Core types for meshsync
//!
//! Identifiers shared by every store plus the timestamp and time source
//! abstractions used for liveness, retention and audit trails.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Node Number
// ----------------------------------------------------------------------------

/// Numeric identity of one radio in the mesh
pub type NodeNum = u32;

/// Broadcast destination used by the device firmware
pub const BROADCAST_NUM: NodeNum = 0xFFFF_FFFF;

/// Channel slot index (0..=7)
pub type ChannelIndex = u8;

/// Number of channel slots on a device
pub const CHANNEL_COUNT: ChannelIndex = 8;

/// Format a node number the way the mesh firmware displays it (`!a1b2c3d4`)
pub fn node_id_string(num: NodeNum) -> String {
    format!("!{}", hex::encode(num.to_be_bytes()))
}

// ----------------------------------------------------------------------------
// Mesh Device Id
// ----------------------------------------------------------------------------

/// Random non-zero `u32`, used for slot ids and outbound packet ids
pub fn random_nonzero_u32() -> u32 {
    loop {
        let candidate = (Uuid::new_v4().as_u128() & 0xFFFF_FFFF) as u32;
        if candidate != 0 {
            return candidate;
        }
    }
}

/// Identity slot binding a physical device to its stores across reconnects
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MeshDeviceId(u32);

impl MeshDeviceId {
    /// Create from a raw slot number
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Generate a fresh, non-zero random slot id
    pub fn random() -> Self {
        Self(random_nonzero_u32())
    }

    /// Get the raw slot number
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Storage key for persisted collections
    pub fn storage_key(&self) -> String {
        self.0.to_string()
    }

    /// Parse a storage key written by [`MeshDeviceId::storage_key`]
    pub fn from_storage_key(key: &str) -> Option<Self> {
        key.parse().ok().map(Self)
    }
}

impl fmt::Display for MeshDeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Connection Id
// ----------------------------------------------------------------------------

/// Identifier of a persisted connection record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a new random connection id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing uuid
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Storage key for persisted collections
    pub fn storage_key(&self) -> String {
        self.0.to_string()
    }

    /// Parse a storage key written by [`ConnectionId::storage_key`]
    pub fn from_storage_key(key: &str) -> Option<Self> {
        Uuid::parse_str(key).ok().map(Self)
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Millisecond timestamp since Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

use core::ops::{Add, Sub};

impl Add<u64> for Timestamp {
    type Output = Timestamp;

    fn add(self, other: u64) -> Timestamp {
        Timestamp(self.0 + other)
    }
}

impl Sub for Timestamp {
    type Output = u64;

    fn sub(self, other: Timestamp) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

impl Timestamp {
    /// Create a new timestamp
    pub const fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Create a timestamp from whole seconds
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1000))
    }

    /// Get current timestamp (context-aware based on available features)
    pub fn now() -> Self {
        cfg_if::cfg_if! {
            if #[cfg(feature = "std")] {
                use std::time::{SystemTime, UNIX_EPOCH};
                let duration = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default();
                Self(duration.as_millis() as u64)
            } else if #[cfg(feature = "wasm")] {
                // Best effort: time since page load on top of a fixed base
                const WASM_FALLBACK_BASE: u64 = 1_700_000_000_000;
                Self(WASM_FALLBACK_BASE + instant::now() as u64)
            } else {
                Self(0)
            }
        }
    }

    /// Get the raw milliseconds
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Get whole seconds (node liveness is tracked in seconds)
    pub fn as_secs(&self) -> u64 {
        self.0 / 1000
    }

    /// Add seconds to this timestamp
    pub fn add_seconds(&self, seconds: u64) -> Self {
        Self(self.0 + (seconds * 1000))
    }

    /// Get duration since another timestamp
    pub fn duration_since(&self, other: Self) -> core::time::Duration {
        let millis_diff = self.0.saturating_sub(other.0);
        core::time::Duration::from_millis(millis_diff)
    }
}

// ----------------------------------------------------------------------------
// Time Source Trait
// ----------------------------------------------------------------------------

/// Source of wall-clock timestamps
///
/// Stores never read the clock directly; the context hands them `now` from
/// whichever source it was built with so tests can pin time.
pub trait TimeSource: Send + Sync {
    /// Get the current timestamp
    fn now(&self) -> Timestamp;
}

/// Wall-clock implementation of TimeSource
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl SystemTimeSource {
    pub fn new() -> Self {
        Self
    }
}

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Manually advanced clock shared between clones
#[derive(Debug, Clone, Default)]
pub struct ManualTimeSource {
    millis: Arc<AtomicU64>,
}

impl ManualTimeSource {
    /// Create a clock pinned at the given timestamp
    pub fn new(start: Timestamp) -> Self {
        Self {
            millis: Arc::new(AtomicU64::new(start.as_millis())),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, millis: u64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }

    /// Jump to an absolute timestamp
    pub fn set(&self, ts: Timestamp) {
        self.millis.store(ts.as_millis(), Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::new(self.millis.load(Ordering::SeqCst))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
