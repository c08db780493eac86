//! Device record
//!
//! Per-device aggregate for one identity slot: confirmed config sections, the
//! channel table, pending edits, waypoints, traceroutes, neighbor reports,
//! unread counters and firmware notifications. Connection linkage fields are
//! runtime only and never persisted.

use core::fmt;

use hashbrown::HashMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::change_registry::{ChangeKey, ChangeRegistry, ConfigVariant, ModuleConfigVariant};
use crate::config::RetentionConfig;
use crate::events::{
    ClientNotification, DeviceMetadata, DeviceStatus, MyNodeInfo, NeighborInfo, PacketMeta,
    RouteDiscovery, Waypoint,
};
use crate::retention::RetentionEvictor;
use crate::types::{ChannelIndex, ConnectionId, MeshDeviceId, NodeNum, Timestamp, CHANNEL_COUNT};

// ----------------------------------------------------------------------------
// Channel
// ----------------------------------------------------------------------------

/// Role of a channel slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChannelRole {
    #[default]
    Disabled,
    Primary,
    Secondary,
}

/// One channel slot
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub index: ChannelIndex,
    #[serde(default)]
    pub role: ChannelRole,
    /// Opaque settings payload (name, psk, uplink flags)
    #[serde(default)]
    pub settings: Value,
}

impl Channel {
    pub fn empty(index: ChannelIndex) -> Self {
        Self {
            index,
            ..Self::default()
        }
    }
}

// ----------------------------------------------------------------------------
// Connection Phase
// ----------------------------------------------------------------------------

/// Handshake progress as seen by the device record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionPhase {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Configuring,
    Configured,
}

// ----------------------------------------------------------------------------
// Waypoints
// ----------------------------------------------------------------------------

/// Where and when a waypoint was heard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaypointMetadata {
    pub created: Timestamp,
    #[serde(default)]
    pub updated: Option<Timestamp>,
    pub from: NodeNum,
    pub channel: ChannelIndex,
}

/// A stored waypoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaypointRecord {
    pub waypoint: Waypoint,
    pub metadata: WaypointMetadata,
}

// ----------------------------------------------------------------------------
// Unread Counters
// ----------------------------------------------------------------------------

/// Conversation an unread counter belongs to
///
/// Persisted as `node:<num>` or `channel:<index>` so it can key a JSON map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnreadKey {
    /// Direct chat with the sending node
    Node(NodeNum),
    /// Broadcast traffic on a channel
    Channel(ChannelIndex),
}

impl fmt::Display for UnreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnreadKey::Node(num) => write!(f, "node:{}", num),
            UnreadKey::Channel(index) => write!(f, "channel:{}", index),
        }
    }
}

impl UnreadKey {
    fn parse(key: &str) -> Option<Self> {
        let (kind, value) = key.split_once(':')?;
        match kind {
            "node" => value.parse().ok().map(UnreadKey::Node),
            "channel" => value.parse().ok().map(UnreadKey::Channel),
            _ => None,
        }
    }
}

impl Serialize for UnreadKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for UnreadKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let key = String::deserialize(deserializer)?;
        UnreadKey::parse(&key)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid unread key: {}", key)))
    }
}

// ----------------------------------------------------------------------------
// Device Record
// ----------------------------------------------------------------------------

/// Everything known about one connected device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    id: MeshDeviceId,
    #[serde(default)]
    my_node_num: Option<NodeNum>,
    #[serde(default)]
    pub hardware: MyNodeInfo,
    #[serde(default)]
    pub metadata: Option<DeviceMetadata>,
    channels: [Channel; CHANNEL_COUNT as usize],
    #[serde(default)]
    config: HashMap<ConfigVariant, Value>,
    #[serde(default)]
    module_config: HashMap<ModuleConfigVariant, Value>,
    #[serde(default)]
    change_registry: ChangeRegistry,
    #[serde(default)]
    traceroutes: HashMap<NodeNum, Vec<PacketMeta<RouteDiscovery>>>,
    #[serde(default)]
    waypoints: Vec<WaypointRecord>,
    #[serde(default)]
    neighbor_info: HashMap<NodeNum, NeighborInfo>,
    #[serde(default)]
    pub active_node: NodeNum,
    #[serde(default)]
    pub pending_settings_changes: bool,
    #[serde(default)]
    pub message_draft: String,
    #[serde(default)]
    unread_counts: HashMap<UnreadKey, u32>,
    #[serde(default)]
    client_notifications: Vec<ClientNotification>,
    /// Last time this slot was bound to a connection
    #[serde(default)]
    pub last_used: Timestamp,

    #[serde(skip)]
    status: DeviceStatus,
    #[serde(skip)]
    connection_phase: ConnectionPhase,
    #[serde(skip)]
    connection_id: Option<ConnectionId>,
    #[serde(skip)]
    retention: RetentionConfig,
}

impl DeviceRecord {
    pub fn new(id: MeshDeviceId) -> Self {
        Self {
            id,
            my_node_num: None,
            hardware: MyNodeInfo::default(),
            metadata: None,
            channels: core::array::from_fn(|i| Channel::empty(i as ChannelIndex)),
            config: HashMap::new(),
            module_config: HashMap::new(),
            change_registry: ChangeRegistry::new(),
            traceroutes: HashMap::new(),
            waypoints: Vec::new(),
            neighbor_info: HashMap::new(),
            active_node: 0,
            pending_settings_changes: false,
            message_draft: String::new(),
            unread_counts: HashMap::new(),
            client_notifications: Vec::new(),
            last_used: Timestamp::default(),
            status: DeviceStatus::Disconnected,
            connection_phase: ConnectionPhase::Disconnected,
            connection_id: None,
            retention: RetentionConfig::default(),
        }
    }

    /// Apply collection caps other than the defaults
    pub fn with_retention(mut self, retention: RetentionConfig) -> Self {
        self.retention = retention;
        self
    }

    pub fn set_retention(&mut self, retention: RetentionConfig) {
        self.retention = retention;
    }

    pub fn id(&self) -> MeshDeviceId {
        self.id
    }

    pub fn my_node_num(&self) -> Option<NodeNum> {
        self.my_node_num
    }

    // ------------------------------------------------------------------------
    // Connection linkage
    // ------------------------------------------------------------------------

    pub fn status(&self) -> DeviceStatus {
        self.status
    }

    pub fn set_status(&mut self, status: DeviceStatus) {
        self.status = status;
    }

    pub fn connection_phase(&self) -> ConnectionPhase {
        self.connection_phase
    }

    pub fn set_connection_phase(&mut self, phase: ConnectionPhase) {
        self.connection_phase = phase;
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection_id
    }

    pub fn set_connection_id(&mut self, id: Option<ConnectionId>) {
        self.connection_id = id;
    }

    // ------------------------------------------------------------------------
    // Config
    // ------------------------------------------------------------------------

    pub fn set_config(&mut self, variant: ConfigVariant, value: Value) {
        self.config.insert(variant, value);
    }

    pub fn set_module_config(&mut self, variant: ModuleConfigVariant, value: Value) {
        self.module_config.insert(variant, value);
    }

    /// Confirmed config section, without pending edits
    pub fn config(&self, variant: ConfigVariant) -> Option<&Value> {
        self.config.get(&variant)
    }

    pub fn module_config(&self, variant: ModuleConfigVariant) -> Option<&Value> {
        self.module_config.get(&variant)
    }

    /// Confirmed config overlaid by any pending edit
    pub fn get_effective_config(&self, variant: ConfigVariant) -> Option<Value> {
        self.change_registry
            .overlay(&ChangeKey::Config(variant), self.config.get(&variant))
    }

    /// Confirmed module config overlaid by any pending edit
    pub fn get_effective_module_config(&self, variant: ModuleConfigVariant) -> Option<Value> {
        self.change_registry
            .overlay(&ChangeKey::ModuleConfig(variant), self.module_config.get(&variant))
    }

    pub fn change_registry(&self) -> &ChangeRegistry {
        &self.change_registry
    }

    pub fn change_registry_mut(&mut self) -> &mut ChangeRegistry {
        &mut self.change_registry
    }

    /// Fold pending channel, config and module edits into confirmed state
    ///
    /// Admin messages and user edits are not part of the confirmed state and
    /// are left for the caller to clear.
    pub fn apply_pending_changes(&mut self) {
        let channels: Vec<(ChannelIndex, Value)> = self
            .change_registry
            .get_all_channel_changes()
            .into_iter()
            .map(|(i, v)| (i, v.clone()))
            .collect();
        let configs: Vec<(ConfigVariant, Value)> = self
            .change_registry
            .get_all_config_changes()
            .into_iter()
            .map(|(v, value)| (v, value.clone()))
            .collect();
        let modules: Vec<(ModuleConfigVariant, Value)> = self
            .change_registry
            .get_all_module_config_changes()
            .into_iter()
            .map(|(v, value)| (v, value.clone()))
            .collect();

        for (index, value) in channels {
            match serde_json::from_value::<Channel>(value) {
                Ok(channel) => self.add_channel(Channel { index, ..channel }),
                Err(err) => warn!("Pending channel {} is not a channel: {}", index, err),
            }
        }
        for (variant, value) in configs {
            let effective = self
                .change_registry
                .overlay(&ChangeKey::Config(variant), self.config.get(&variant))
                .unwrap_or(value);
            self.config.insert(variant, effective);
        }
        for (variant, value) in modules {
            let effective = self
                .change_registry
                .overlay(&ChangeKey::ModuleConfig(variant), self.module_config.get(&variant))
                .unwrap_or(value);
            self.module_config.insert(variant, effective);
        }
    }

    // ------------------------------------------------------------------------
    // Channels
    // ------------------------------------------------------------------------

    /// Store a channel in its slot; out-of-range indices are ignored
    pub fn add_channel(&mut self, channel: Channel) {
        match self.channels.get_mut(usize::from(channel.index)) {
            Some(slot) => *slot = channel,
            None => warn!("Ignoring channel with out-of-range index {}", channel.index),
        }
    }

    pub fn channel(&self, index: ChannelIndex) -> Option<&Channel> {
        self.channels.get(usize::from(index))
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    // ------------------------------------------------------------------------
    // Own node
    // ------------------------------------------------------------------------

    /// Record own-node info
    ///
    /// Folding other slots with the same node number is done by
    /// [`reconcile`] through the owning context.
    pub fn set_hardware(&mut self, hardware: MyNodeInfo) {
        self.my_node_num = Some(hardware.my_node_num);
        self.hardware = hardware;
    }

    pub fn set_active_node(&mut self, node: NodeNum) {
        self.active_node = node;
    }

    pub fn set_pending_settings_changes(&mut self, pending: bool) {
        self.pending_settings_changes = pending;
    }

    pub fn add_metadata(&mut self, metadata: DeviceMetadata) {
        self.metadata = Some(metadata);
    }

    pub fn set_message_draft(&mut self, draft: impl Into<String>) {
        self.message_draft = draft.into();
    }

    // ------------------------------------------------------------------------
    // Waypoints
    // ------------------------------------------------------------------------

    /// Insert or update a waypoint heard on the mesh
    ///
    /// An update keeps the original creation time. An expired update removes
    /// the waypoint, and an already expired new waypoint is never stored.
    pub fn add_waypoint(
        &mut self,
        waypoint: Waypoint,
        channel: ChannelIndex,
        from: NodeNum,
        rx_time: Timestamp,
        now: Timestamp,
    ) {
        let existing = self
            .waypoints
            .iter()
            .position(|w| w.waypoint.id == waypoint.id)
            .map(|index| self.waypoints.remove(index));

        if waypoint.is_expired(now) {
            if existing.is_some() {
                debug!("Waypoint {} expired, removing", waypoint.id);
            }
            return;
        }

        let metadata = match existing {
            Some(previous) => WaypointMetadata {
                created: previous.metadata.created,
                updated: Some(rx_time),
                from,
                channel,
            },
            None => WaypointMetadata {
                created: rx_time,
                updated: None,
                from,
                channel,
            },
        };
        self.waypoints.push(WaypointRecord { waypoint, metadata });
        RetentionEvictor::new(self.retention.waypoint_cap).trim_front(&mut self.waypoints);
    }

    /// Remove a waypoint from the store, returning it
    pub fn remove_waypoint(&mut self, id: u32) -> Option<WaypointRecord> {
        let index = self.waypoints.iter().position(|w| w.waypoint.id == id)?;
        Some(self.waypoints.remove(index))
    }

    pub fn get_waypoint(&self, id: u32) -> Option<&WaypointRecord> {
        self.waypoints.iter().find(|w| w.waypoint.id == id)
    }

    pub fn waypoints(&self) -> &[WaypointRecord] {
        &self.waypoints
    }

    // ------------------------------------------------------------------------
    // Traceroutes and neighbors
    // ------------------------------------------------------------------------

    /// Append a traceroute result under its sender
    pub fn add_trace_route(&mut self, route: PacketMeta<RouteDiscovery>) {
        let routes = self.traceroutes.entry(route.from).or_default();
        routes.push(route);
        RetentionEvictor::new(self.retention.traceroute_route_cap).trim_front(routes);

        RetentionEvictor::new(self.retention.traceroute_target_cap).trim_map(
            &mut self.traceroutes,
            |_, routes| routes.last().map(|r| r.rx_time).unwrap_or_default(),
        );
    }

    pub fn get_trace_routes(&self, target: NodeNum) -> &[PacketMeta<RouteDiscovery>] {
        self.traceroutes
            .get(&target)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn trace_route_target_count(&self) -> usize {
        self.traceroutes.len()
    }

    /// Replace the neighbor report of a node
    pub fn add_neighbor_info(&mut self, node: NodeNum, info: NeighborInfo) {
        self.neighbor_info.insert(node, info);
    }

    pub fn get_neighbor_info(&self, node: NodeNum) -> Option<&NeighborInfo> {
        self.neighbor_info.get(&node)
    }

    // ------------------------------------------------------------------------
    // Unread counters
    // ------------------------------------------------------------------------

    pub fn increment_unread(&mut self, key: UnreadKey) {
        *self.unread_counts.entry(key).or_insert(0) += 1;
    }

    pub fn get_unread_count(&self, key: UnreadKey) -> u32 {
        self.unread_counts.get(&key).copied().unwrap_or(0)
    }

    pub fn get_all_unread_count(&self) -> u32 {
        self.unread_counts.values().sum()
    }

    pub fn reset_unread(&mut self, key: UnreadKey) {
        self.unread_counts.remove(&key);
    }

    // ------------------------------------------------------------------------
    // Client notifications
    // ------------------------------------------------------------------------

    pub fn add_client_notification(&mut self, notification: ClientNotification) {
        self.client_notifications.push(notification);
    }

    pub fn remove_client_notification(&mut self, index: usize) -> Option<ClientNotification> {
        (index < self.client_notifications.len()).then(|| self.client_notifications.remove(index))
    }

    pub fn get_client_notification(&self, index: usize) -> Option<&ClientNotification> {
        self.client_notifications.get(index)
    }

    pub fn client_notifications(&self) -> &[ClientNotification] {
        &self.client_notifications
    }
}

// ----------------------------------------------------------------------------
// Identity Reconciliation
// ----------------------------------------------------------------------------

/// Result of folding other device records into a recipient
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceReconciliation {
    pub merged: DeviceRecord,
    pub absorbed: Vec<MeshDeviceId>,
}

/// Adopt traceroutes, neighbor reports and live waypoints from every device
/// record sharing the recipient's own node number
///
/// Entries the recipient already holds are kept. Expired donor waypoints are
/// dropped.
pub fn reconcile<'a, I>(recipient: &DeviceRecord, donors: I, now: Timestamp) -> DeviceReconciliation
where
    I: IntoIterator<Item = &'a DeviceRecord>,
{
    let mut merged = recipient.clone();
    let mut absorbed = Vec::new();

    let Some(own) = recipient.my_node_num else {
        return DeviceReconciliation { merged, absorbed };
    };

    let mut matching: Vec<&DeviceRecord> = donors
        .into_iter()
        .filter(|d| d.id != recipient.id && d.my_node_num == Some(own))
        .collect();
    matching.sort_by_key(|d| d.id);

    for donor in matching {
        info!("Adopting device record {} into {}", donor.id, recipient.id);
        for (target, routes) in &donor.traceroutes {
            merged
                .traceroutes
                .entry(*target)
                .or_insert_with(|| routes.clone());
        }
        for (node, info) in &donor.neighbor_info {
            merged
                .neighbor_info
                .entry(*node)
                .or_insert_with(|| info.clone());
        }
        for record in &donor.waypoints {
            let known = merged
                .waypoints
                .iter()
                .any(|w| w.waypoint.id == record.waypoint.id);
            if !known && !record.waypoint.is_expired(now) {
                merged.waypoints.push(record.clone());
            }
        }
        absorbed.push(donor.id);
    }

    let retention = merged.retention.clone();
    RetentionEvictor::new(retention.waypoint_cap).trim_front(&mut merged.waypoints);
    RetentionEvictor::new(retention.traceroute_target_cap).trim_map(
        &mut merged.traceroutes,
        |_, routes| routes.last().map(|r| r.rx_time).unwrap_or_default(),
    );

    DeviceReconciliation { merged, absorbed }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn create_test_device(id: u32, own: Option<NodeNum>) -> DeviceRecord {
        let mut device = DeviceRecord::new(MeshDeviceId::new(id)).with_retention(RetentionConfig::testing());
        if let Some(num) = own {
            device.set_hardware(MyNodeInfo {
                my_node_num: num,
                ..MyNodeInfo::default()
            });
        }
        device
    }

    fn create_test_waypoint(id: u32, expire: u32) -> Waypoint {
        Waypoint {
            id,
            expire,
            name: format!("wp {}", id),
            ..Waypoint::default()
        }
    }

    fn create_test_route(from: NodeNum, secs: u64) -> PacketMeta<RouteDiscovery> {
        PacketMeta {
            id: 0,
            from,
            to: 1,
            channel: 0,
            rx_time: Timestamp::from_secs(secs),
            data: RouteDiscovery {
                route: vec![from, 1],
                ..RouteDiscovery::default()
            },
        }
    }

    #[test]
    fn test_channel_table_has_eight_slots() {
        let mut device = create_test_device(1, None);
        assert_eq!(device.channels().len(), 8);
        device.add_channel(Channel {
            index: 3,
            role: ChannelRole::Secondary,
            settings: json!({"name": "ops"}),
        });
        device.add_channel(Channel::empty(8));
        assert_eq!(device.channel(3).map(|c| c.role), Some(ChannelRole::Secondary));
        assert_eq!(device.channels().len(), 8);
    }

    #[test]
    fn test_effective_config_overlays_pending() {
        let mut device = create_test_device(1, None);
        device.set_config(ConfigVariant::Lora, json!({"region": 1, "hopLimit": 3}));
        device.change_registry_mut().set_change(
            ChangeKey::Config(ConfigVariant::Lora),
            json!({"hopLimit": 5}),
            None,
            Timestamp::new(1),
        );

        assert_eq!(
            device.get_effective_config(ConfigVariant::Lora),
            Some(json!({"region": 1, "hopLimit": 5}))
        );
        assert_eq!(
            device.config(ConfigVariant::Lora),
            Some(&json!({"region": 1, "hopLimit": 3}))
        );
        assert_eq!(device.get_effective_module_config(ModuleConfigVariant::Mqtt), None);
    }

    #[test]
    fn test_apply_pending_changes() {
        let mut device = create_test_device(1, None);
        device.set_module_config(ModuleConfigVariant::Mqtt, json!({"enabled": false, "root": "msh"}));
        let registry = device.change_registry_mut();
        registry.set_change(
            ChangeKey::ModuleConfig(ModuleConfigVariant::Mqtt),
            json!({"enabled": true}),
            None,
            Timestamp::new(1),
        );
        registry.set_change(
            ChangeKey::Channel(1),
            json!({"index": 1, "role": "Secondary", "settings": {"name": "b"}}),
            None,
            Timestamp::new(2),
        );

        device.apply_pending_changes();
        assert_eq!(
            device.module_config(ModuleConfigVariant::Mqtt),
            Some(&json!({"enabled": true, "root": "msh"}))
        );
        assert_eq!(device.channel(1).map(|c| c.role), Some(ChannelRole::Secondary));
    }

    #[test]
    fn test_waypoint_lifecycle() {
        let now = Timestamp::from_secs(1_000);
        let mut device = create_test_device(1, None);

        device.add_waypoint(create_test_waypoint(1, 0), 0, 5, Timestamp::from_secs(10), now);
        device.add_waypoint(create_test_waypoint(2, 500), 0, 5, Timestamp::from_secs(10), now);
        device.add_waypoint(create_test_waypoint(3, 2_000), 0, 5, Timestamp::from_secs(10), now);
        assert!(device.get_waypoint(1).is_some());
        assert!(device.get_waypoint(2).is_none());
        assert!(device.get_waypoint(3).is_some());

        device.add_waypoint(create_test_waypoint(1, 0), 2, 6, Timestamp::from_secs(20), now);
        let updated = device.get_waypoint(1).unwrap();
        assert_eq!(updated.metadata.created, Timestamp::from_secs(10));
        assert_eq!(updated.metadata.updated, Some(Timestamp::from_secs(20)));
        assert_eq!(updated.metadata.channel, 2);

        device.add_waypoint(create_test_waypoint(3, 900), 0, 5, Timestamp::from_secs(30), now);
        assert!(device.get_waypoint(3).is_none());

        assert!(device.remove_waypoint(1).is_some());
        assert!(device.remove_waypoint(1).is_none());
    }

    #[test]
    fn test_waypoint_cap() {
        let now = Timestamp::from_secs(1);
        let mut device = create_test_device(1, None);
        for id in 0..5 {
            device.add_waypoint(create_test_waypoint(id, 0), 0, 5, now, now);
        }
        assert_eq!(device.waypoints().len(), 3);
        assert!(device.get_waypoint(0).is_none());
        assert!(device.get_waypoint(4).is_some());
    }

    #[test]
    fn test_traceroute_caps() {
        let mut device = create_test_device(1, None);
        for secs in 0..5 {
            device.add_trace_route(create_test_route(7, secs));
        }
        assert_eq!(device.get_trace_routes(7).len(), 3);

        for target in 10..13 {
            device.add_trace_route(create_test_route(target, 100 + u64::from(target)));
        }
        assert_eq!(device.trace_route_target_count(), 3);
        assert!(device.get_trace_routes(7).is_empty());
    }

    #[test]
    fn test_unread_counters() {
        let mut device = create_test_device(1, None);
        device.increment_unread(UnreadKey::Node(5));
        device.increment_unread(UnreadKey::Node(5));
        device.increment_unread(UnreadKey::Channel(0));
        assert_eq!(device.get_unread_count(UnreadKey::Node(5)), 2);
        assert_eq!(device.get_all_unread_count(), 3);
        device.reset_unread(UnreadKey::Node(5));
        assert_eq!(device.get_unread_count(UnreadKey::Node(5)), 0);
        assert_eq!(device.get_all_unread_count(), 1);
    }

    #[test]
    fn test_unread_node_and_channel_do_not_collide() {
        let mut device = create_test_device(1, None);
        device.increment_unread(UnreadKey::Node(1));
        device.increment_unread(UnreadKey::Channel(1));
        device.increment_unread(UnreadKey::Channel(1));
        assert_eq!(device.get_unread_count(UnreadKey::Node(1)), 1);
        assert_eq!(device.get_unread_count(UnreadKey::Channel(1)), 2);

        device.reset_unread(UnreadKey::Channel(1));
        assert_eq!(device.get_unread_count(UnreadKey::Node(1)), 1);
        assert_eq!(device.get_all_unread_count(), 1);

        let json = serde_json::to_value(&device).unwrap();
        assert_eq!(json["unreadCounts"], json!({ "node:1": 1 }));
        let back: DeviceRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back.get_unread_count(UnreadKey::Node(1)), 1);
        assert_eq!(back.get_unread_count(UnreadKey::Channel(1)), 0);
    }

    #[test]
    fn test_client_notifications() {
        let mut device = create_test_device(1, None);
        device.add_client_notification(ClientNotification {
            message: "low battery".into(),
            ..ClientNotification::default()
        });
        assert_eq!(
            device.get_client_notification(0).map(|n| n.message.as_str()),
            Some("low battery")
        );
        assert!(device.remove_client_notification(1).is_none());
        assert!(device.remove_client_notification(0).is_some());
        assert!(device.client_notifications().is_empty());
    }

    #[test]
    fn test_runtime_fields_not_persisted() {
        let mut device = create_test_device(1, Some(9));
        device.set_status(DeviceStatus::Configured);
        device.set_connection_phase(ConnectionPhase::Configured);
        device.set_connection_id(Some(ConnectionId::new()));

        let json = serde_json::to_value(&device).unwrap();
        assert!(json.get("status").is_none());
        assert!(json.get("connectionId").is_none());

        let back: DeviceRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back.status(), DeviceStatus::Disconnected);
        assert_eq!(back.connection_phase(), ConnectionPhase::Disconnected);
        assert_eq!(back.connection_id(), None);
        assert_eq!(back.my_node_num(), Some(9));
    }

    #[test]
    fn test_reconcile_adopts_donor_state() {
        let now = Timestamp::from_secs(1_000);
        let mut old = create_test_device(1, Some(1));
        old.add_trace_route(create_test_route(7, 1));
        old.add_neighbor_info(7, NeighborInfo::default());
        old.add_waypoint(create_test_waypoint(1, 0), 0, 7, Timestamp::from_secs(1), Timestamp::from_secs(1));
        old.add_waypoint(create_test_waypoint(2, 500), 0, 7, Timestamp::from_secs(1), Timestamp::from_secs(1));

        let mut current = create_test_device(2, Some(1));
        current.add_neighbor_info(
            7,
            NeighborInfo {
                node_id: 7,
                node_broadcast_interval_secs: 60,
                neighbors: Vec::new(),
            },
        );

        let result = reconcile(&current, [&old], now);
        assert_eq!(result.absorbed, vec![MeshDeviceId::new(1)]);
        let merged = result.merged;
        assert_eq!(merged.get_trace_routes(7).len(), 1);
        assert_eq!(
            merged.get_neighbor_info(7).map(|n| n.node_broadcast_interval_secs),
            Some(60)
        );
        assert!(merged.get_waypoint(1).is_some());
        assert!(merged.get_waypoint(2).is_none());
    }
}
