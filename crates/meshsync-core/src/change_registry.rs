//! Pending configuration edits
//!
//! The [`ChangeRegistry`] is an overlay of edits the user made but the device
//! has not confirmed yet. Entries are keyed by the serialized form of a
//! [`ChangeKey`], so re-editing the same field overwrites the previous
//! entry. Queued admin messages carry a fresh id each and accumulate.

use core::fmt;
use core::str::FromStr;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::errors::{ChangeKeyError, MeshError, Result};
use crate::events::AdminAction;
use crate::types::{ChannelIndex, Timestamp, CHANNEL_COUNT};

// ----------------------------------------------------------------------------
// Config Sections
// ----------------------------------------------------------------------------

/// Device config sections
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConfigVariant {
    Device,
    Position,
    Power,
    Network,
    Display,
    Lora,
    Bluetooth,
    Security,
}

impl ConfigVariant {
    pub const ALL: [ConfigVariant; 8] = [
        ConfigVariant::Device,
        ConfigVariant::Position,
        ConfigVariant::Power,
        ConfigVariant::Network,
        ConfigVariant::Display,
        ConfigVariant::Lora,
        ConfigVariant::Bluetooth,
        ConfigVariant::Security,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigVariant::Device => "device",
            ConfigVariant::Position => "position",
            ConfigVariant::Power => "power",
            ConfigVariant::Network => "network",
            ConfigVariant::Display => "display",
            ConfigVariant::Lora => "lora",
            ConfigVariant::Bluetooth => "bluetooth",
            ConfigVariant::Security => "security",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.as_str() == s)
    }
}

/// Module config sections
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ModuleConfigVariant {
    Mqtt,
    Serial,
    ExternalNotification,
    StoreForward,
    RangeTest,
    Telemetry,
    CannedMessage,
    Audio,
    NeighborInfo,
    AmbientLighting,
    DetectionSensor,
    Paxcounter,
}

impl ModuleConfigVariant {
    pub const ALL: [ModuleConfigVariant; 12] = [
        ModuleConfigVariant::Mqtt,
        ModuleConfigVariant::Serial,
        ModuleConfigVariant::ExternalNotification,
        ModuleConfigVariant::StoreForward,
        ModuleConfigVariant::RangeTest,
        ModuleConfigVariant::Telemetry,
        ModuleConfigVariant::CannedMessage,
        ModuleConfigVariant::Audio,
        ModuleConfigVariant::NeighborInfo,
        ModuleConfigVariant::AmbientLighting,
        ModuleConfigVariant::DetectionSensor,
        ModuleConfigVariant::Paxcounter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleConfigVariant::Mqtt => "mqtt",
            ModuleConfigVariant::Serial => "serial",
            ModuleConfigVariant::ExternalNotification => "externalNotification",
            ModuleConfigVariant::StoreForward => "storeForward",
            ModuleConfigVariant::RangeTest => "rangeTest",
            ModuleConfigVariant::Telemetry => "telemetry",
            ModuleConfigVariant::CannedMessage => "cannedMessage",
            ModuleConfigVariant::Audio => "audio",
            ModuleConfigVariant::NeighborInfo => "neighborInfo",
            ModuleConfigVariant::AmbientLighting => "ambientLighting",
            ModuleConfigVariant::DetectionSensor => "detectionSensor",
            ModuleConfigVariant::Paxcounter => "paxcounter",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.as_str() == s)
    }
}

/// Admin message kinds that can be queued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdminVariant {
    SetFixedPosition,
    Other,
}

impl AdminVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdminVariant::SetFixedPosition => "setFixedPosition",
            AdminVariant::Other => "other",
        }
    }

    fn for_action(action: &AdminAction) -> Self {
        match action {
            AdminAction::SetFixedPosition(_) => AdminVariant::SetFixedPosition,
            _ => AdminVariant::Other,
        }
    }
}

// ----------------------------------------------------------------------------
// Change Key
// ----------------------------------------------------------------------------

/// What a pending change targets
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChangeKey {
    Config(ConfigVariant),
    ModuleConfig(ModuleConfigVariant),
    Channel(ChannelIndex),
    User,
    AdminMessage { variant: AdminVariant, id: String },
}

impl ChangeKey {
    /// Serialized composite key
    pub fn serialize_key(&self) -> String {
        self.to_string()
    }

    /// Parse a key produced by [`ChangeKey::serialize_key`]
    pub fn deserialize_key(s: &str) -> core::result::Result<Self, ChangeKeyError> {
        let (kind, rest) = match s.split_once(':') {
            Some((kind, rest)) => (kind, Some(rest)),
            None => (s, None),
        };

        match (kind, rest) {
            ("user", None) => Ok(ChangeKey::User),
            ("config", Some(variant)) => ConfigVariant::parse(variant)
                .map(ChangeKey::Config)
                .ok_or_else(|| ChangeKeyError::UnknownVariant {
                    kind: "config",
                    variant: variant.to_string(),
                }),
            ("moduleConfig", Some(variant)) => ModuleConfigVariant::parse(variant)
                .map(ChangeKey::ModuleConfig)
                .ok_or_else(|| ChangeKeyError::UnknownVariant {
                    kind: "moduleConfig",
                    variant: variant.to_string(),
                }),
            ("channel", Some(index)) => match index.parse::<ChannelIndex>() {
                Ok(i) if i < CHANNEL_COUNT => Ok(ChangeKey::Channel(i)),
                _ => Err(ChangeKeyError::InvalidChannelIndex(index.to_string())),
            },
            ("adminMessage", Some(rest)) => {
                let (variant, id) = rest
                    .split_once(':')
                    .filter(|(_, id)| !id.is_empty())
                    .ok_or_else(|| ChangeKeyError::Malformed(s.to_string()))?;
                let variant = match variant {
                    "setFixedPosition" => AdminVariant::SetFixedPosition,
                    "other" => AdminVariant::Other,
                    other => {
                        return Err(ChangeKeyError::UnknownVariant {
                            kind: "adminMessage",
                            variant: other.to_string(),
                        })
                    }
                };
                Ok(ChangeKey::AdminMessage {
                    variant,
                    id: id.to_string(),
                })
            }
            ("user", Some(_)) | ("config", None) | ("moduleConfig", None) | ("channel", None)
            | ("adminMessage", None) => Err(ChangeKeyError::Malformed(s.to_string())),
            (other, _) => Err(ChangeKeyError::UnknownType(other.to_string())),
        }
    }

    pub fn is_admin_message(&self) -> bool {
        matches!(self, ChangeKey::AdminMessage { .. })
    }
}

impl fmt::Display for ChangeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKey::Config(v) => write!(f, "config:{}", v.as_str()),
            ChangeKey::ModuleConfig(v) => write!(f, "moduleConfig:{}", v.as_str()),
            ChangeKey::Channel(i) => write!(f, "channel:{}", i),
            ChangeKey::User => write!(f, "user"),
            ChangeKey::AdminMessage { variant, id } => {
                write!(f, "adminMessage:{}:{}", variant.as_str(), id)
            }
        }
    }
}

impl FromStr for ChangeKey {
    type Err = ChangeKeyError;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        Self::deserialize_key(s)
    }
}

impl Serialize for ChangeKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.serialize_key())
    }
}

impl<'de> Deserialize<'de> for ChangeKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> core::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::deserialize_key(&s).map_err(serde::de::Error::custom)
    }
}

// ----------------------------------------------------------------------------
// Change Entry
// ----------------------------------------------------------------------------

/// One pending edit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEntry {
    pub key: ChangeKey,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_value: Option<Value>,
    pub timestamp: Timestamp,
    /// Insertion order, breaks timestamp ties
    #[serde(default)]
    pub sequence: u64,
}

// ----------------------------------------------------------------------------
// Change Registry
// ----------------------------------------------------------------------------

/// Keyed overlay of uncommitted edits
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeRegistry {
    changes: HashMap<String, ChangeEntry>,
    #[serde(default)]
    next_sequence: u64,
}

impl ChangeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the entry for `key`
    pub fn set_change(
        &mut self,
        key: ChangeKey,
        value: Value,
        original_value: Option<Value>,
        now: Timestamp,
    ) {
        let serialized = key.serialize_key();
        debug!("Pending change {}", serialized);
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.changes.insert(
            serialized,
            ChangeEntry {
                key,
                value,
                original_value,
                timestamp: now,
                sequence,
            },
        );
    }

    pub fn remove_change(&mut self, key: &ChangeKey) -> Option<ChangeEntry> {
        self.changes.remove(&key.serialize_key())
    }

    pub fn has_change(&self, key: &ChangeKey) -> bool {
        self.changes.contains_key(&key.serialize_key())
    }

    pub fn get_change(&self, key: &ChangeKey) -> Option<&ChangeEntry> {
        self.changes.get(&key.serialize_key())
    }

    /// Drop every pending entry
    pub fn clear_all_changes(&mut self) {
        self.changes.clear();
    }

    pub fn has_config_change(&self, variant: ConfigVariant) -> bool {
        self.has_change(&ChangeKey::Config(variant))
    }

    pub fn has_module_config_change(&self, variant: ModuleConfigVariant) -> bool {
        self.has_change(&ChangeKey::ModuleConfig(variant))
    }

    pub fn has_channel_change(&self, index: ChannelIndex) -> bool {
        self.has_change(&ChangeKey::Channel(index))
    }

    pub fn has_user_change(&self) -> bool {
        self.has_change(&ChangeKey::User)
    }

    pub fn get_config_change_count(&self) -> usize {
        self.count(|k| matches!(k, ChangeKey::Config(_)))
    }

    pub fn get_module_config_change_count(&self) -> usize {
        self.count(|k| matches!(k, ChangeKey::ModuleConfig(_)))
    }

    pub fn get_channel_change_count(&self) -> usize {
        self.count(|k| matches!(k, ChangeKey::Channel(_)))
    }

    pub fn get_admin_message_change_count(&self) -> usize {
        self.count(ChangeKey::is_admin_message)
    }

    pub fn get_total_change_count(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Pending config sections with a non-null value, oldest first
    pub fn get_all_config_changes(&self) -> Vec<(ConfigVariant, &Value)> {
        self.ordered()
            .filter_map(|e| match e.key {
                ChangeKey::Config(v) if !e.value.is_null() => Some((v, &e.value)),
                _ => None,
            })
            .collect()
    }

    /// Pending module sections with a non-null value, oldest first
    pub fn get_all_module_config_changes(&self) -> Vec<(ModuleConfigVariant, &Value)> {
        self.ordered()
            .filter_map(|e| match e.key {
                ChangeKey::ModuleConfig(v) if !e.value.is_null() => Some((v, &e.value)),
                _ => None,
            })
            .collect()
    }

    /// Pending channel slots, oldest first
    pub fn get_all_channel_changes(&self) -> Vec<(ChannelIndex, &Value)> {
        self.ordered()
            .filter_map(|e| match e.key {
                ChangeKey::Channel(i) => Some((i, &e.value)),
                _ => None,
            })
            .collect()
    }

    /// Queued admin actions, oldest first
    ///
    /// Entries whose payload no longer decodes are skipped.
    pub fn get_all_queued_admin_messages(&self) -> Vec<(ChangeKey, AdminAction)> {
        self.ordered()
            .filter(|e| e.key.is_admin_message())
            .filter_map(|e| match serde_json::from_value(e.value.clone()) {
                Ok(action) => Some((e.key.clone(), action)),
                Err(err) => {
                    debug!("Skipping undecodable admin message {}: {}", e.key, err);
                    None
                }
            })
            .collect()
    }

    /// Queue a discrete admin action under a fresh key
    pub fn queue_admin_message(&mut self, action: AdminAction, now: Timestamp) -> Result<ChangeKey> {
        let value = serde_json::to_value(&action)
            .map_err(|e| MeshError::config_error(format!("Unencodable admin action: {}", e)))?;
        let key = ChangeKey::AdminMessage {
            variant: AdminVariant::for_action(&action),
            id: Uuid::new_v4().to_string(),
        };
        self.set_change(key.clone(), value, None, now);
        Ok(key)
    }

    /// Confirmed value overlaid by the pending one
    ///
    /// Object properties of the pending value win over the confirmed ones.
    /// A non-object pending value replaces the confirmed value outright.
    pub fn overlay(&self, key: &ChangeKey, confirmed: Option<&Value>) -> Option<Value> {
        let pending = self.get_change(key).map(|e| &e.value).filter(|v| !v.is_null());
        match (confirmed, pending) {
            (None, None) => None,
            (Some(c), None) => Some(c.clone()),
            (None, Some(p)) => Some(p.clone()),
            (Some(Value::Object(c)), Some(Value::Object(p))) => {
                let mut merged = c.clone();
                for (k, v) in p {
                    merged.insert(k.clone(), v.clone());
                }
                Some(Value::Object(merged))
            }
            (Some(_), Some(p)) => Some(p.clone()),
        }
    }

    fn count<F: Fn(&ChangeKey) -> bool>(&self, pred: F) -> usize {
        self.changes.values().filter(|e| pred(&e.key)).count()
    }

    fn ordered(&self) -> impl Iterator<Item = &ChangeEntry> {
        let mut entries: Vec<&ChangeEntry> = self.changes.values().collect();
        entries.sort_by_key(|e| (e.timestamp, e.sequence));
        entries.into_iter()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Position;
    use serde_json::json;

    fn create_test_registry() -> ChangeRegistry {
        let mut registry = ChangeRegistry::new();
        registry.set_change(
            ChangeKey::Config(ConfigVariant::Lora),
            json!({"region": 3}),
            Some(json!({"region": 1})),
            Timestamp::new(10),
        );
        registry.set_change(
            ChangeKey::ModuleConfig(ModuleConfigVariant::Mqtt),
            json!({"enabled": true}),
            None,
            Timestamp::new(20),
        );
        registry.set_change(ChangeKey::Channel(2), json!({"name": "ops"}), None, Timestamp::new(30));
        registry
    }

    #[test]
    fn test_key_grammar() {
        let keys = [
            ChangeKey::Config(ConfigVariant::Lora),
            ChangeKey::ModuleConfig(ModuleConfigVariant::ExternalNotification),
            ChangeKey::Channel(7),
            ChangeKey::User,
            ChangeKey::AdminMessage {
                variant: AdminVariant::SetFixedPosition,
                id: "abc".into(),
            },
        ];
        let expected = [
            "config:lora",
            "moduleConfig:externalNotification",
            "channel:7",
            "user",
            "adminMessage:setFixedPosition:abc",
        ];
        for (key, text) in keys.iter().zip(expected) {
            assert_eq!(key.serialize_key(), text);
            assert_eq!(&ChangeKey::deserialize_key(text).unwrap(), key);
        }
    }

    #[test]
    fn test_key_rejections() {
        assert!(matches!(
            ChangeKey::deserialize_key("bogus:x"),
            Err(ChangeKeyError::UnknownType(_))
        ));
        assert!(matches!(
            ChangeKey::deserialize_key("config:wifi"),
            Err(ChangeKeyError::UnknownVariant { kind: "config", .. })
        ));
        assert!(matches!(
            ChangeKey::deserialize_key("channel:8"),
            Err(ChangeKeyError::InvalidChannelIndex(_))
        ));
        assert!(matches!(
            ChangeKey::deserialize_key("channel:x"),
            Err(ChangeKeyError::InvalidChannelIndex(_))
        ));
        assert!(matches!(
            ChangeKey::deserialize_key("adminMessage:other"),
            Err(ChangeKeyError::Malformed(_))
        ));
    }

    #[test]
    fn test_same_key_overwrites() {
        let mut registry = create_test_registry();
        registry.set_change(
            ChangeKey::Config(ConfigVariant::Lora),
            json!({"region": 5}),
            None,
            Timestamp::new(40),
        );
        assert_eq!(registry.get_config_change_count(), 1);
        assert_eq!(registry.get_total_change_count(), 3);
        let entry = registry.get_change(&ChangeKey::Config(ConfigVariant::Lora)).unwrap();
        assert_eq!(entry.value, json!({"region": 5}));
    }

    #[test]
    fn test_admin_messages_accumulate() {
        let mut registry = ChangeRegistry::new();
        let position = Position {
            latitude_i: Some(1),
            longitude_i: Some(2),
            ..Position::default()
        };
        let a = registry
            .queue_admin_message(AdminAction::SetFixedPosition(position.clone()), Timestamp::new(1))
            .unwrap();
        let b = registry
            .queue_admin_message(AdminAction::SetFixedPosition(position), Timestamp::new(2))
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(registry.get_admin_message_change_count(), 2);

        let queued = registry.get_all_queued_admin_messages();
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].0, a);
        assert!(a.serialize_key().starts_with("adminMessage:setFixedPosition:"));
    }

    #[test]
    fn test_getters_skip_null_and_order_by_time() {
        let mut registry = create_test_registry();
        registry.set_change(
            ChangeKey::Config(ConfigVariant::Device),
            Value::Null,
            None,
            Timestamp::new(5),
        );
        registry.set_change(
            ChangeKey::Config(ConfigVariant::Display),
            json!({"screenOnSecs": 30}),
            None,
            Timestamp::new(1),
        );

        let configs: Vec<ConfigVariant> = registry
            .get_all_config_changes()
            .into_iter()
            .map(|(v, _)| v)
            .collect();
        assert_eq!(configs, vec![ConfigVariant::Display, ConfigVariant::Lora]);
        assert_eq!(registry.get_config_change_count(), 3);
        assert!(registry.has_channel_change(2));
        assert!(!registry.has_user_change());
    }

    #[test]
    fn test_overlay_semantics() {
        let registry = create_test_registry();
        let lora = ChangeKey::Config(ConfigVariant::Lora);

        let confirmed = json!({"region": 1, "hopLimit": 3});
        assert_eq!(
            registry.overlay(&lora, Some(&confirmed)),
            Some(json!({"region": 3, "hopLimit": 3}))
        );
        assert_eq!(registry.overlay(&lora, None), Some(json!({"region": 3})));

        let power = ChangeKey::Config(ConfigVariant::Power);
        assert_eq!(registry.overlay(&power, None), None);
        assert_eq!(registry.overlay(&power, Some(&json!(1))), Some(json!(1)));
    }

    #[test]
    fn test_clear_all_changes() {
        let mut registry = create_test_registry();
        registry.clear_all_changes();
        assert!(registry.is_empty());
        assert_eq!(registry.get_total_change_count(), 0);
    }

    #[test]
    fn test_registry_serde_round_trip() {
        let registry = create_test_registry();
        let json = serde_json::to_value(&registry).unwrap();
        let back: ChangeRegistry = serde_json::from_value(json).unwrap();
        assert_eq!(back, registry);
    }
}
