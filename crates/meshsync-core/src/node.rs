//! Node records
//!
//! The decoded view of one mesh participant as the client knows it. Every
//! sub-record is optional because packets arrive piecemeal: a user packet,
//! a position packet and a telemetry packet for the same node are merged
//! field by field.

use serde::{Deserialize, Serialize};

use crate::types::{node_id_string, NodeNum};

// ----------------------------------------------------------------------------
// Public Key
// ----------------------------------------------------------------------------

/// Curve25519 public key announced by a node
///
/// Stored and persisted as base64, the form the device reports it in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct PublicKey(Vec<u8>);

impl PublicKey {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Base64 form for display and persistence
    pub fn to_base64(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(&self.0)
    }

    /// Parse the base64 form
    pub fn from_base64(encoded: &str) -> Result<Self, base64::DecodeError> {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map(Self)
    }
}

impl From<Vec<u8>> for PublicKey {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Self::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}

// ----------------------------------------------------------------------------
// Sub-records
// ----------------------------------------------------------------------------

/// User identity announced by a node
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub long_name: String,
    pub short_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<PublicKey>,
    pub hw_model: u32,
    pub role: u32,
    pub is_licensed: bool,
    pub is_unmessagable: bool,
}

impl User {
    /// The announced key, treating an empty key as absent
    pub fn key(&self) -> Option<&PublicKey> {
        self.public_key.as_ref().filter(|k| !k.is_empty())
    }
}

/// Last known position
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub latitude_i: Option<i32>,
    pub longitude_i: Option<i32>,
    pub altitude: Option<i32>,
    pub time: u32,
    pub precision_bits: u32,
    pub sats_in_view: u32,
}

/// Device health telemetry
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMetrics {
    pub battery_level: Option<u32>,
    pub voltage: Option<f32>,
    pub channel_utilization: Option<f32>,
    pub air_util_tx: Option<f32>,
    pub uptime_seconds: Option<u32>,
}

/// Environment sensor telemetry
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentMetrics {
    pub temperature: Option<f32>,
    pub relative_humidity: Option<f32>,
    pub barometric_pressure: Option<f32>,
    pub gas_resistance: Option<f32>,
    pub iaq: Option<u32>,
}

/// Power monitor telemetry
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PowerMetrics {
    pub ch1_voltage: Option<f32>,
    pub ch1_current: Option<f32>,
    pub ch2_voltage: Option<f32>,
    pub ch2_current: Option<f32>,
}

/// Telemetry from a Linux-hosted node
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostMetrics {
    pub uptime_seconds: Option<u32>,
    pub freemem_bytes: Option<u64>,
    pub diskfree1_bytes: Option<u64>,
    pub load1: Option<u32>,
    pub load5: Option<u32>,
    pub load15: Option<u32>,
}

/// Particulate sensor telemetry
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AirQualityMetrics {
    pub pm10_standard: Option<u32>,
    pub pm25_standard: Option<u32>,
    pub pm100_standard: Option<u32>,
    pub co2: Option<u32>,
}

/// Mesh traffic counters kept by the reporting node
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalStats {
    pub uptime_seconds: Option<u32>,
    pub channel_utilization: Option<f32>,
    pub air_util_tx: Option<f32>,
    pub num_packets_tx: Option<u32>,
    pub num_packets_rx: Option<u32>,
    pub num_packets_rx_bad: Option<u32>,
    pub num_online_nodes: Option<u32>,
    pub num_total_nodes: Option<u32>,
}

// ----------------------------------------------------------------------------
// Node Record
// ----------------------------------------------------------------------------

/// Everything known about one node
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub num: NodeNum,
    #[serde(default)]
    pub user: Option<User>,
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default)]
    pub device_metrics: Option<DeviceMetrics>,
    #[serde(default)]
    pub environment_metrics: Option<EnvironmentMetrics>,
    #[serde(default)]
    pub power_metrics: Option<PowerMetrics>,
    #[serde(default)]
    pub host_metrics: Option<HostMetrics>,
    #[serde(default)]
    pub air_quality_metrics: Option<AirQualityMetrics>,
    #[serde(default)]
    pub local_stats: Option<LocalStats>,
    /// Epoch seconds; zero means never heard
    #[serde(default)]
    pub last_heard: u32,
    #[serde(default)]
    pub snr: f32,
    #[serde(default)]
    pub hops_away: Option<u32>,
    #[serde(default)]
    pub channel: u32,
    #[serde(default)]
    pub via_mqtt: bool,
    #[serde(default)]
    pub is_favorite: bool,
    #[serde(default)]
    pub is_ignored: bool,
    #[serde(default)]
    pub is_key_manually_verified: bool,
}

impl NodeRecord {
    /// A record carrying only the node number
    pub fn placeholder(num: NodeNum) -> Self {
        Self {
            num,
            ..Self::default()
        }
    }

    /// The node's announced public key, if any
    pub fn public_key(&self) -> Option<&PublicKey> {
        self.user.as_ref().and_then(User::key)
    }

    /// Long name when known, else the `!xxxxxxxx` id
    pub fn display_name(&self) -> String {
        match &self.user {
            Some(user) if !user.long_name.is_empty() => user.long_name.clone(),
            _ => node_id_string(self.num),
        }
    }

    /// Merge an accepted update into this record
    ///
    /// Scalars come from `incoming`; optional sub-records fall back to what
    /// was already known when the update omits them.
    pub fn merged_with(&self, incoming: NodeRecord) -> NodeRecord {
        NodeRecord {
            user: incoming.user.or_else(|| self.user.clone()),
            position: incoming.position.or_else(|| self.position.clone()),
            device_metrics: incoming
                .device_metrics
                .or_else(|| self.device_metrics.clone()),
            environment_metrics: incoming
                .environment_metrics
                .or_else(|| self.environment_metrics.clone()),
            power_metrics: incoming
                .power_metrics
                .or_else(|| self.power_metrics.clone()),
            host_metrics: incoming.host_metrics.or_else(|| self.host_metrics.clone()),
            air_quality_metrics: incoming
                .air_quality_metrics
                .or_else(|| self.air_quality_metrics.clone()),
            local_stats: incoming.local_stats.or_else(|| self.local_stats.clone()),
            ..incoming
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
