//! Device events and outbound packets
//!
//! Decoding the wire format happens behind the device link. What reaches
//! the core is a stream of already-structured [`DeviceEvent`]s, and what
//! leaves it are the structured requests in the outbound section below.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::change_registry::{ConfigVariant, ModuleConfigVariant};
use crate::device::Channel;
use crate::node::{
    AirQualityMetrics, DeviceMetrics, EnvironmentMetrics, HostMetrics, LocalStats, NodeRecord,
    Position, PowerMetrics, User,
};
use crate::types::{ChannelIndex, NodeNum, Timestamp, BROADCAST_NUM};

// ----------------------------------------------------------------------------
// Packet Envelope
// ----------------------------------------------------------------------------

/// Envelope metadata carried by every mesh packet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PacketMeta<T> {
    pub id: u32,
    pub from: NodeNum,
    pub to: NodeNum,
    pub channel: ChannelIndex,
    pub rx_time: Timestamp,
    pub data: T,
}

impl<T> PacketMeta<T> {
    pub fn is_broadcast(&self) -> bool {
        self.to == BROADCAST_NUM
    }
}

// ----------------------------------------------------------------------------
// Routing
// ----------------------------------------------------------------------------

/// Routing error codes reported by the firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoutingError {
    None,
    NoRoute,
    GotNak,
    Timeout,
    NoInterface,
    MaxRetransmit,
    NoChannel,
    TooLarge,
    NoResponse,
    DutyCycleLimit,
    BadRequest,
    NotAuthorized,
    PkiFailed,
    PkiUnknownPubkey,
    AdminBadSessionKey,
    AdminPublicKeyUnauthorized,
    /// A code this client does not know
    Other(u32),
}

impl RoutingError {
    /// Map a raw firmware code
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => RoutingError::None,
            1 => RoutingError::NoRoute,
            2 => RoutingError::GotNak,
            3 => RoutingError::Timeout,
            4 => RoutingError::NoInterface,
            5 => RoutingError::MaxRetransmit,
            6 => RoutingError::NoChannel,
            7 => RoutingError::TooLarge,
            8 => RoutingError::NoResponse,
            9 => RoutingError::DutyCycleLimit,
            32 => RoutingError::BadRequest,
            33 => RoutingError::NotAuthorized,
            34 => RoutingError::PkiFailed,
            35 => RoutingError::PkiUnknownPubkey,
            36 => RoutingError::AdminBadSessionKey,
            37 => RoutingError::AdminPublicKeyUnauthorized,
            other => RoutingError::Other(other),
        }
    }

    /// Whether this code is recorded against the sending node
    pub fn marks_node(&self) -> bool {
        matches!(self, RoutingError::NoChannel | RoutingError::PkiUnknownPubkey)
    }
}

/// Hops discovered by a traceroute
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteDiscovery {
    pub route: Vec<NodeNum>,
    #[serde(default)]
    pub snr_towards: Vec<i32>,
    #[serde(default)]
    pub route_back: Vec<NodeNum>,
    #[serde(default)]
    pub snr_back: Vec<i32>,
}

/// Payload of a routing packet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Routing {
    ErrorReason(RoutingError),
    RouteRequest(RouteDiscovery),
    RouteReply(RouteDiscovery),
}

// ----------------------------------------------------------------------------
// Device-reported Records
// ----------------------------------------------------------------------------

/// Telemetry categories
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Telemetry {
    DeviceMetrics(DeviceMetrics),
    EnvironmentMetrics(EnvironmentMetrics),
    PowerMetrics(PowerMetrics),
    HostMetrics(HostMetrics),
    AirQualityMetrics(AirQualityMetrics),
    LocalStats(LocalStats),
}

/// Telemetry category to request from a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TelemetryKind {
    Device,
    Environment,
    Power,
    Host,
    AirQuality,
    LocalStats,
}

/// Link status reported by the device link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeviceStatus {
    Restarting,
    #[default]
    Disconnected,
    Connecting,
    Reconnecting,
    Connected,
    Configuring,
    Configured,
}

/// Own-node info sent first in the configure stream
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MyNodeInfo {
    pub my_node_num: NodeNum,
    #[serde(default)]
    pub reboot_count: u32,
    #[serde(default)]
    pub min_app_version: u32,
}

/// Firmware metadata
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMetadata {
    pub firmware_version: String,
    #[serde(default)]
    pub hw_model: u32,
    #[serde(default)]
    pub has_bluetooth: bool,
    #[serde(default)]
    pub has_wifi: bool,
    #[serde(default)]
    pub role: u32,
}

/// A waypoint shared on the mesh
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Waypoint {
    pub id: u32,
    #[serde(default)]
    pub latitude_i: Option<i32>,
    #[serde(default)]
    pub longitude_i: Option<i32>,
    /// Epoch seconds; zero means never expires
    #[serde(default)]
    pub expire: u32,
    #[serde(default)]
    pub locked_to: NodeNum,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub icon: u32,
}

impl Waypoint {
    /// The tombstone broadcast to delete a waypoint on the mesh
    pub fn deletion(id: u32) -> Self {
        Self {
            id,
            expire: 1,
            ..Self::default()
        }
    }

    /// Whether the waypoint has expired at `now`
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expire != 0 && u64::from(self.expire) < now.as_secs()
    }
}

/// One neighbor heard by a node
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Neighbor {
    pub node_id: NodeNum,
    pub snr: f32,
}

/// Neighbor report from one node
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NeighborInfo {
    pub node_id: NodeNum,
    #[serde(default)]
    pub node_broadcast_interval_secs: u32,
    #[serde(default)]
    pub neighbors: Vec<Neighbor>,
}

/// Notification pushed by the firmware for the user
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientNotification {
    #[serde(default)]
    pub reply_id: Option<u32>,
    pub time: u32,
    pub level: u32,
    pub message: String,
}

/// Liveness fields of any received packet
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshPacketInfo {
    pub from: NodeNum,
    pub rx_snr: f32,
    /// Epoch seconds; zero when the radio had no clock
    pub rx_time: u32,
}

/// One received config section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSection {
    pub variant: ConfigVariant,
    pub value: Value,
}

/// One received module config section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleConfigSection {
    pub variant: ModuleConfigVariant,
    pub value: Value,
}

// ----------------------------------------------------------------------------
// Device Event
// ----------------------------------------------------------------------------

/// Everything the device link can deliver
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Metadata(DeviceMetadata),
    Routing(PacketMeta<Routing>),
    Telemetry(PacketMeta<Telemetry>),
    DeviceStatus(DeviceStatus),
    Waypoint(PacketMeta<Waypoint>),
    MyNodeInfo(MyNodeInfo),
    User(PacketMeta<User>),
    Position(PacketMeta<Position>),
    NodeInfo(NodeRecord),
    Channel(Channel),
    Config(ConfigSection),
    ModuleConfig(ModuleConfigSection),
    Message(PacketMeta<String>),
    TraceRoute(PacketMeta<RouteDiscovery>),
    PendingSettings(bool),
    MeshPacket(MeshPacketInfo),
    ClientNotification(ClientNotification),
    NeighborInfo(PacketMeta<NeighborInfo>),
    /// End of the configure stream, carrying the request's correlation id
    ConfigComplete { id: u32 },
    /// The remote side dropped the link
    Closed { reason: String },
}

impl DeviceEvent {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            DeviceEvent::Metadata(_) => "metadata",
            DeviceEvent::Routing(_) => "routing",
            DeviceEvent::Telemetry(_) => "telemetry",
            DeviceEvent::DeviceStatus(_) => "deviceStatus",
            DeviceEvent::Waypoint(_) => "waypoint",
            DeviceEvent::MyNodeInfo(_) => "myNodeInfo",
            DeviceEvent::User(_) => "user",
            DeviceEvent::Position(_) => "position",
            DeviceEvent::NodeInfo(_) => "nodeInfo",
            DeviceEvent::Channel(_) => "channel",
            DeviceEvent::Config(_) => "config",
            DeviceEvent::ModuleConfig(_) => "moduleConfig",
            DeviceEvent::Message(_) => "message",
            DeviceEvent::TraceRoute(_) => "traceroute",
            DeviceEvent::PendingSettings(_) => "pendingSettings",
            DeviceEvent::MeshPacket(_) => "meshPacket",
            DeviceEvent::ClientNotification(_) => "clientNotification",
            DeviceEvent::NeighborInfo(_) => "neighborInfo",
            DeviceEvent::ConfigComplete { .. } => "configComplete",
            DeviceEvent::Closed { .. } => "closed",
        }
    }
}

// ----------------------------------------------------------------------------
// Outbound
// ----------------------------------------------------------------------------

/// Admin actions sent to the local device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "payload")]
pub enum AdminAction {
    SetFavoriteNode(NodeNum),
    RemoveFavoriteNode(NodeNum),
    SetIgnoredNode(NodeNum),
    RemoveIgnoredNode(NodeNum),
    RemoveNodeByNum(NodeNum),
    SetFixedPosition(Position),
    RemoveFixedPosition,
    SetOwner(User),
    Reboot { seconds: u32 },
}

/// Where an outbound text or waypoint goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Destination {
    Broadcast,
    Node(NodeNum),
}

impl Destination {
    pub fn node_num(&self) -> NodeNum {
        match self {
            Destination::Broadcast => BROADCAST_NUM,
            Destination::Node(num) => *num,
        }
    }
}

/// A text message to send
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundText {
    /// Packet id, also the message id used for delivery tracking
    pub id: u32,
    pub text: String,
    pub destination: Destination,
    pub channel: ChannelIndex,
    pub want_ack: bool,
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
