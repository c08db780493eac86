//! Explicit container for every store
//!
//! `MeshContext` owns the device identity slots (a DeviceRecord, NodeDatabase
//! and MessageStore per [`MeshDeviceId`]), the connection registry and the
//! app settings. It applies cross-slot identity reconciliation and tracks
//! which records changed since the last flush.

use hashbrown::{HashMap, HashSet};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::app::{AppSettings, APP_SETTINGS_KEY};
use crate::config::MeshConfig;
use crate::connection::{
    Connection, ConnectionEvent, ConnectionRegistry, NewConnection, StatusTransition,
};
use crate::device::{self, DeviceRecord};
use crate::errors::{MeshError, Result, StorageError};
use crate::events::MyNodeInfo;
use crate::message_store::{self, MessageStore};
use crate::node_db::{self, NodeDatabase};
use crate::retention::RetentionEvictor;
use crate::storage::{decode_record, Collection, Persistence};
use crate::types::{node_id_string, ConnectionId, MeshDeviceId, NodeNum, Timestamp};

// ----------------------------------------------------------------------------
// Record Keys
// ----------------------------------------------------------------------------

/// Address of one persisted record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub collection: Collection,
    pub key: String,
}

impl RecordKey {
    pub fn new(collection: Collection, key: impl Into<String>) -> Self {
        Self {
            collection,
            key: key.into(),
        }
    }

    fn slot(collection: Collection, id: MeshDeviceId) -> Self {
        Self::new(collection, id.storage_key())
    }
}

/// Slots removed by an identity merge
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityMerge {
    pub devices: Vec<MeshDeviceId>,
    pub node_databases: Vec<MeshDeviceId>,
    pub message_stores: Vec<MeshDeviceId>,
}

impl IdentityMerge {
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty() && self.node_databases.is_empty() && self.message_stores.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Mesh Context
// ----------------------------------------------------------------------------

/// Owner of all client state
#[derive(Debug)]
pub struct MeshContext {
    config: MeshConfig,
    devices: HashMap<MeshDeviceId, DeviceRecord>,
    node_dbs: HashMap<MeshDeviceId, NodeDatabase>,
    message_stores: HashMap<MeshDeviceId, MessageStore>,
    connections: ConnectionRegistry,
    app: AppSettings,
    dirty: HashSet<RecordKey>,
}

impl MeshContext {
    pub fn new(config: MeshConfig) -> Self {
        let connections = ConnectionRegistry::new(config.audit.max_entries);
        Self {
            config,
            devices: HashMap::new(),
            node_dbs: HashMap::new(),
            message_stores: HashMap::new(),
            connections,
            app: AppSettings::default(),
            dirty: HashSet::new(),
        }
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // App settings
    // ------------------------------------------------------------------------

    pub fn app(&self) -> &AppSettings {
        &self.app
    }

    pub fn app_mut(&mut self) -> &mut AppSettings {
        self.mark_dirty(RecordKey::new(Collection::App, APP_SETTINGS_KEY));
        &mut self.app
    }

    /// The slot of the currently selected device
    pub fn selected_device_id(&self) -> Option<MeshDeviceId> {
        self.app.selected_device_id
    }

    // ------------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------------

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    pub fn add_connection(&mut self, input: NewConnection, now: Timestamp) -> ConnectionId {
        let id = self.connections.add_connection(input, now);
        self.mark_connection(id);
        id
    }

    pub fn get_connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get_connection(id)
    }

    pub fn update_connection<F>(&mut self, id: ConnectionId, update: F) -> Result<()>
    where
        F: FnOnce(&mut Connection),
    {
        self.connections.update_connection(id, update)?;
        self.mark_connection(id);
        Ok(())
    }

    pub fn set_default_connection(&mut self, id: ConnectionId, is_default: bool) -> Result<()> {
        self.connections.set_default_connection(id, is_default)?;
        let ids: Vec<ConnectionId> = self.connections.list_connections().iter().map(|c| c.id).collect();
        for id in ids {
            self.mark_connection(id);
        }
        Ok(())
    }

    /// Drive a connection's status; the persisted error field follows it
    pub fn process_connection_event(
        &mut self,
        id: ConnectionId,
        event: ConnectionEvent,
        now: Timestamp,
    ) -> Result<StatusTransition> {
        let transition = self.connections.process_connection_event(id, event, now)?;
        self.mark_connection(id);
        Ok(transition)
    }

    /// Remove a connection record and the device record bound to it
    pub fn delete_connection(&mut self, id: ConnectionId) -> Option<Connection> {
        let removed = self.connections.remove_connection(id)?;
        self.mark_connection(id);
        if let Some(device_id) = removed.mesh_device_id {
            self.remove_device(device_id);
            if self.app.selected_device_id == Some(device_id) {
                self.app_mut().selected_device_id = None;
            }
        }
        info!("Deleted connection {} ({})", removed.name, id);
        Some(removed)
    }

    fn mark_connection(&mut self, id: ConnectionId) {
        self.mark_dirty(RecordKey::new(Collection::Connections, id.storage_key()));
    }

    // ------------------------------------------------------------------------
    // Device records
    // ------------------------------------------------------------------------

    /// Get or create the device record for a slot and mark it used
    pub fn add_device(&mut self, id: MeshDeviceId, now: Timestamp) -> &mut DeviceRecord {
        if !self.devices.contains_key(&id) {
            debug!("Creating device record {}", id);
            let record = DeviceRecord::new(id).with_retention(self.config.retention.clone());
            self.devices.insert(id, record);
        }
        if let Some(record) = self.devices.get_mut(&id) {
            record.last_used = now;
        }
        self.mark_dirty(RecordKey::slot(Collection::Devices, id));
        self.evict_devices(id);
        self.devices
            .entry(id)
            .or_insert_with(|| DeviceRecord::new(id))
    }

    pub fn device(&self, id: MeshDeviceId) -> Option<&DeviceRecord> {
        self.devices.get(&id)
    }

    pub fn device_mut(&mut self, id: MeshDeviceId) -> Option<&mut DeviceRecord> {
        let record = self.devices.get_mut(&id)?;
        self.dirty.insert(RecordKey::slot(Collection::Devices, id));
        Some(record)
    }

    pub fn remove_device(&mut self, id: MeshDeviceId) -> Option<DeviceRecord> {
        let removed = self.devices.remove(&id);
        if removed.is_some() {
            self.mark_dirty(RecordKey::slot(Collection::Devices, id));
        }
        removed
    }

    pub fn device_ids(&self) -> Vec<MeshDeviceId> {
        let mut ids: Vec<MeshDeviceId> = self.devices.keys().copied().collect();
        ids.sort();
        ids
    }

    fn evict_devices(&mut self, keep: MeshDeviceId) {
        let active = self.app.selected_device_id;
        let evicted = RetentionEvictor::new(self.config.retention.device_cap).trim_map_protecting(
            &mut self.devices,
            |_, record| record.last_used,
            |id| *id == keep || Some(*id) == active,
        );
        for (id, _) in evicted {
            info!("Evicted device record {}", id);
            self.dirty.insert(RecordKey::slot(Collection::Devices, id));
        }
    }

    // ------------------------------------------------------------------------
    // Node databases
    // ------------------------------------------------------------------------

    /// Get or create the node database for a slot, pruning stale nodes
    pub fn add_node_db(&mut self, id: MeshDeviceId, now: Timestamp) -> &mut NodeDatabase {
        let window = self.config.retention.node_retention_secs();
        let db = self
            .node_dbs
            .entry(id)
            .or_insert_with(|| NodeDatabase::new(id));
        let pruned = db.prune_stale_nodes(now, window);
        if pruned > 0 {
            debug!("Pruned {} stale nodes from {}", pruned, id);
        }
        self.mark_dirty(RecordKey::slot(Collection::NodeDatabases, id));
        self.evict_node_dbs(id);
        self.node_dbs
            .entry(id)
            .or_insert_with(|| NodeDatabase::new(id))
    }

    pub fn node_db(&self, id: MeshDeviceId) -> Option<&NodeDatabase> {
        self.node_dbs.get(&id)
    }

    pub fn node_db_mut(&mut self, id: MeshDeviceId) -> Option<&mut NodeDatabase> {
        let db = self.node_dbs.get_mut(&id)?;
        self.dirty.insert(RecordKey::slot(Collection::NodeDatabases, id));
        Some(db)
    }

    pub fn remove_node_db(&mut self, id: MeshDeviceId) -> Option<NodeDatabase> {
        let removed = self.node_dbs.remove(&id);
        if removed.is_some() {
            self.mark_dirty(RecordKey::slot(Collection::NodeDatabases, id));
        }
        removed
    }

    fn evict_node_dbs(&mut self, keep: MeshDeviceId) {
        let active = self.app.selected_device_id;
        let devices = &self.devices;
        let evicted = RetentionEvictor::new(self.config.retention.device_cap).trim_map_protecting(
            &mut self.node_dbs,
            |id, _| devices.get(id).map(|d| d.last_used).unwrap_or_default(),
            |id| *id == keep || Some(*id) == active,
        );
        for (id, _) in evicted {
            info!("Evicted node database {}", id);
            self.dirty.insert(RecordKey::slot(Collection::NodeDatabases, id));
        }
    }

    // ------------------------------------------------------------------------
    // Message stores
    // ------------------------------------------------------------------------

    /// Get or create the message store for a slot
    pub fn add_message_store(&mut self, id: MeshDeviceId) -> &mut MessageStore {
        let cap = self.config.retention.message_log_cap;
        self.message_stores
            .entry(id)
            .or_insert_with(|| MessageStore::new(id).with_log_cap(cap));
        self.mark_dirty(RecordKey::slot(Collection::Messages, id));
        self.evict_message_stores(id);
        self.message_stores
            .entry(id)
            .or_insert_with(|| MessageStore::new(id).with_log_cap(cap))
    }

    pub fn message_store(&self, id: MeshDeviceId) -> Option<&MessageStore> {
        self.message_stores.get(&id)
    }

    pub fn message_store_mut(&mut self, id: MeshDeviceId) -> Option<&mut MessageStore> {
        let store = self.message_stores.get_mut(&id)?;
        self.dirty.insert(RecordKey::slot(Collection::Messages, id));
        Some(store)
    }

    pub fn remove_message_store(&mut self, id: MeshDeviceId) -> Option<MessageStore> {
        let removed = self.message_stores.remove(&id);
        if removed.is_some() {
            self.mark_dirty(RecordKey::slot(Collection::Messages, id));
        }
        removed
    }

    fn evict_message_stores(&mut self, keep: MeshDeviceId) {
        let active = self.app.selected_device_id;
        let devices = &self.devices;
        let evicted = RetentionEvictor::new(self.config.retention.message_store_cap)
            .trim_map_protecting(
                &mut self.message_stores,
                |id, _| devices.get(id).map(|d| d.last_used).unwrap_or_default(),
                |id| *id == keep || Some(*id) == active,
            );
        for (id, _) in evicted {
            info!("Evicted message store {}", id);
            self.dirty.insert(RecordKey::slot(Collection::Messages, id));
        }
    }

    // ------------------------------------------------------------------------
    // Identity slots
    // ------------------------------------------------------------------------

    /// Add or load the device, node database and message store of a slot
    pub fn bind_slot(&mut self, id: MeshDeviceId, now: Timestamp) {
        self.add_device(id, now);
        self.add_node_db(id, now);
        self.add_message_store(id);
    }

    /// Record the own-node info of a slot and fold in every other slot that
    /// turns out to be the same physical node
    pub fn apply_my_node_info(
        &mut self,
        id: MeshDeviceId,
        info: MyNodeInfo,
        now: Timestamp,
    ) -> IdentityMerge {
        let num = info.my_node_num;
        self.bind_slot(id, now);
        if let Some(device) = self.device_mut(id) {
            device.set_hardware(info);
        }
        let mut merge = self.set_node_num(id, num);

        if let Some(recipient) = self.devices.get(&id) {
            let result = device::reconcile(recipient, self.devices.values(), now);
            self.devices.insert(id, result.merged);
            for donor in &result.absorbed {
                self.remove_device(*donor);
            }
            merge.devices = result.absorbed;
        }
        self.mark_dirty(RecordKey::slot(Collection::Devices, id));
        self.relink_connections(&merge, id);

        if !merge.is_empty() {
            info!(
                "Node {} merged {} device, {} node database and {} message store slots into {}",
                node_id_string(num),
                merge.devices.len(),
                merge.node_databases.len(),
                merge.message_stores.len(),
                id
            );
        }
        merge
    }

    /// Change the own node number of a slot's node database and message
    /// store, absorbing every other database and store bound to `num`
    ///
    /// Device records are left alone; [`MeshContext::apply_my_node_info`]
    /// reconciles those too.
    pub fn set_node_num(&mut self, id: MeshDeviceId, num: NodeNum) -> IdentityMerge {
        let mut merge = IdentityMerge::default();

        if let Some(db) = self.node_dbs.get_mut(&id) {
            db.set_my_node_num(num);
            let result = node_db::reconcile(&self.node_dbs[&id], self.node_dbs.values());
            self.node_dbs.insert(id, result.merged);
            for donor in &result.absorbed {
                self.remove_node_db(*donor);
            }
            merge.node_databases = result.absorbed;
            self.mark_dirty(RecordKey::slot(Collection::NodeDatabases, id));
        }

        if let Some(store) = self.message_stores.get_mut(&id) {
            store.set_my_node_num(num);
            let result = message_store::reconcile(&self.message_stores[&id], self.message_stores.values());
            self.message_stores.insert(id, result.merged);
            for donor in &result.absorbed {
                self.remove_message_store(*donor);
            }
            merge.message_stores = result.absorbed;
            self.mark_dirty(RecordKey::slot(Collection::Messages, id));
        }

        self.relink_connections(&merge, id);
        merge
    }

    /// Point connections bound to absorbed slots at the surviving slot
    fn relink_connections(&mut self, merge: &IdentityMerge, survivor: MeshDeviceId) {
        let absorbed: HashSet<MeshDeviceId> = merge
            .devices
            .iter()
            .chain(&merge.node_databases)
            .chain(&merge.message_stores)
            .copied()
            .collect();
        if absorbed.is_empty() {
            return;
        }
        let stale: Vec<ConnectionId> = self
            .connections
            .list_connections()
            .iter()
            .filter(|c| c.mesh_device_id.is_some_and(|d| absorbed.contains(&d)))
            .map(|c| c.id)
            .collect();
        for connection in stale {
            if let Err(err) =
                self.update_connection(connection, |c| c.mesh_device_id = Some(survivor))
            {
                warn!("Could not relink connection {}: {}", connection, err);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    fn mark_dirty(&mut self, key: RecordKey) {
        self.dirty.insert(key);
    }

    /// Whether any record changed since the last [`MeshContext::take_dirty`]
    pub fn has_pending_writes(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Drain the set of changed records, in key order
    pub fn take_dirty(&mut self) -> Vec<RecordKey> {
        let mut keys: Vec<RecordKey> = self.dirty.drain().collect();
        keys.sort();
        keys
    }

    /// Put records back after a failed write so the next flush retries them
    pub fn restore_dirty<I: IntoIterator<Item = RecordKey>>(&mut self, keys: I) {
        self.dirty.extend(keys);
    }

    /// Current serialized form of a record, or `None` if it was deleted
    pub fn record_value(&self, key: &RecordKey) -> Result<Option<Value>> {
        let encode = |result: serde_json::Result<Value>| {
            result.map(Some).map_err(|source| {
                MeshError::Storage(StorageError::Serialization {
                    collection: key.collection.as_str().to_string(),
                    key: key.key.clone(),
                    source,
                })
            })
        };

        match key.collection {
            Collection::App => encode(serde_json::to_value(&self.app)),
            Collection::Connections => match ConnectionId::from_storage_key(&key.key)
                .and_then(|id| self.connections.get_connection(id))
            {
                Some(connection) => encode(serde_json::to_value(connection)),
                None => Ok(None),
            },
            Collection::Devices => match Self::slot_record(&key.key, &self.devices) {
                Some(record) => encode(serde_json::to_value(record)),
                None => Ok(None),
            },
            Collection::NodeDatabases => match Self::slot_record(&key.key, &self.node_dbs) {
                Some(db) => encode(serde_json::to_value(db)),
                None => Ok(None),
            },
            Collection::Messages => match Self::slot_record(&key.key, &self.message_stores) {
                Some(store) => encode(serde_json::to_value(store)),
                None => Ok(None),
            },
        }
    }

    fn slot_record<'a, T>(key: &str, map: &'a HashMap<MeshDeviceId, T>) -> Option<&'a T> {
        MeshDeviceId::from_storage_key(key).and_then(|id| map.get(&id))
    }

    /// Every record currently held, in key order
    pub fn snapshot(&self) -> Result<Vec<(RecordKey, Value)>> {
        let mut keys = vec![RecordKey::new(Collection::App, APP_SETTINGS_KEY)];
        keys.extend(
            self.connections
                .list_connections()
                .iter()
                .map(|c| RecordKey::new(Collection::Connections, c.id.storage_key())),
        );
        keys.extend(self.devices.keys().map(|id| RecordKey::slot(Collection::Devices, *id)));
        keys.extend(self.node_dbs.keys().map(|id| RecordKey::slot(Collection::NodeDatabases, *id)));
        keys.extend(self.message_stores.keys().map(|id| RecordKey::slot(Collection::Messages, *id)));
        keys.sort();

        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.record_value(&key)? {
                records.push((key, value));
            }
        }
        Ok(records)
    }

    /// Rebuild a context from persisted collections
    ///
    /// Records that fail to decode are logged and skipped. Node databases are
    /// pruned as they load.
    pub async fn load(config: MeshConfig, store: &dyn Persistence, now: Timestamp) -> Result<Self> {
        let mut context = Self::new(config);
        let window = context.config.retention.node_retention_secs();

        if let Some(value) = store.get(Collection::App, APP_SETTINGS_KEY).await? {
            match decode_record::<AppSettings>(Collection::App, APP_SETTINGS_KEY, value) {
                Ok(settings) => context.app = settings,
                Err(e) => warn!("Skipping app settings: {}", e),
            }
        }

        for (key, value) in store.get_all(Collection::Connections).await? {
            match decode_record::<Connection>(Collection::Connections, &key, value) {
                Ok(connection) => context.connections.insert(connection),
                Err(e) => warn!("Skipping connection record: {}", e),
            }
        }

        for (key, value) in store.get_all(Collection::Devices).await? {
            match decode_record::<DeviceRecord>(Collection::Devices, &key, value) {
                Ok(mut record) => {
                    record.set_retention(context.config.retention.clone());
                    context.devices.insert(record.id(), record);
                }
                Err(e) => warn!("Skipping device record: {}", e),
            }
        }

        for (key, value) in store.get_all(Collection::NodeDatabases).await? {
            match decode_record::<NodeDatabase>(Collection::NodeDatabases, &key, value) {
                Ok(mut db) => {
                    if db.prune_stale_nodes(now, window) > 0 {
                        context.dirty.insert(RecordKey::slot(Collection::NodeDatabases, db.id()));
                    }
                    context.node_dbs.insert(db.id(), db);
                }
                Err(e) => warn!("Skipping node database: {}", e),
            }
        }

        for (key, value) in store.get_all(Collection::Messages).await? {
            match decode_record::<MessageStore>(Collection::Messages, &key, value) {
                Ok(mut messages) => {
                    messages.set_log_cap(context.config.retention.message_log_cap);
                    context.message_stores.insert(messages.id(), messages);
                }
                Err(e) => warn!("Skipping message store: {}", e),
            }
        }

        info!(
            "Loaded {} connections and {} device slots",
            context.connections.list_connections().len(),
            context.devices.len()
        );
        Ok(context)
    }
}

impl Default for MeshContext {
    fn default() -> Self {
        Self::new(MeshConfig::default())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetentionConfig;
    use crate::connection::ConnectionTarget;
    use crate::message_store::{Message, MessageState, MessageType};
    use crate::node::{NodeRecord, PublicKey, User};
    use crate::storage::{put_record, MemoryPersistence};
    use crate::types::BROADCAST_NUM;

    const NOW: Timestamp = Timestamp::from_secs(2_000_000);

    fn create_test_context() -> MeshContext {
        MeshContext::new(MeshConfig {
            retention: RetentionConfig {
                device_cap: 3,
                message_store_cap: 3,
                ..RetentionConfig::default()
            },
            ..MeshConfig::default()
        })
    }

    fn create_test_node(num: u32, key: &str) -> NodeRecord {
        NodeRecord {
            user: Some(User {
                id: node_id_string(num),
                long_name: format!("Node {}", num),
                public_key: Some(PublicKey::new(key.as_bytes().to_vec())),
                ..User::default()
            }),
            last_heard: NOW.as_secs() as u32,
            ..NodeRecord::placeholder(num)
        }
    }

    fn create_test_message(id: u32, from: u32) -> Message {
        Message {
            message_id: id,
            from,
            to: BROADCAST_NUM,
            channel: 0,
            message_type: MessageType::Broadcast,
            date: NOW,
            state: MessageState::Ack,
            message: format!("hello {}", id),
        }
    }

    fn info(num: u32) -> MyNodeInfo {
        MyNodeInfo {
            my_node_num: num,
            ..MyNodeInfo::default()
        }
    }

    #[test]
    fn test_bind_slot_creates_triple() {
        let mut ctx = create_test_context();
        let id = MeshDeviceId::new(7);
        ctx.bind_slot(id, NOW);
        assert!(ctx.device(id).is_some());
        assert!(ctx.node_db(id).is_some());
        assert!(ctx.message_store(id).is_some());
        assert_eq!(ctx.device(id).unwrap().last_used, NOW);
    }

    #[test]
    fn test_device_cap_never_evicts_active() {
        let mut ctx = create_test_context();
        ctx.app_mut().selected_device_id = Some(MeshDeviceId::new(1));
        for i in 1..=5u32 {
            ctx.add_device(MeshDeviceId::new(i), Timestamp::new(i as u64 * 10));
            ctx.add_message_store(MeshDeviceId::new(i));
        }
        assert_eq!(ctx.device_ids().len(), 3);
        assert!(ctx.device(MeshDeviceId::new(1)).is_some());
        assert!(ctx.device(MeshDeviceId::new(5)).is_some());
        assert!(ctx.device(MeshDeviceId::new(2)).is_none());
        assert!(ctx.message_store(MeshDeviceId::new(1)).is_some());
        assert!(ctx.message_store(MeshDeviceId::new(5)).is_some());
    }

    #[test]
    fn test_identity_merge_absorbs_old_slot() {
        let mut ctx = create_test_context();
        let old = MeshDeviceId::new(1);
        let new = MeshDeviceId::new(2);

        ctx.apply_my_node_info(old, info(0xabc), NOW);
        ctx.node_db_mut(old).unwrap().add_node(create_test_node(5, "K5"));
        ctx.node_db_mut(old).unwrap().add_node(create_test_node(6, "K6"));
        ctx.message_store_mut(old).unwrap().save_message(create_test_message(1, 5));
        let conn = ctx.add_connection(
            NewConnection {
                name: "radio".into(),
                target: ConnectionTarget::Http {
                    url: "http://radio".into(),
                },
            },
            NOW,
        );
        ctx.update_connection(conn, |c| c.mesh_device_id = Some(old)).unwrap();

        let merge = ctx.apply_my_node_info(new, info(0xabc), NOW);
        assert_eq!(merge.node_databases, vec![old]);
        assert_eq!(merge.message_stores, vec![old]);
        assert_eq!(merge.devices, vec![old]);

        assert!(ctx.node_db(old).is_none());
        assert!(ctx.device(old).is_none());
        let db = ctx.node_db(new).unwrap();
        assert!(db.get_node(5).is_some() && db.get_node(6).is_some());
        assert_eq!(ctx.message_store(new).unwrap().log_count(), 1);
        assert_eq!(ctx.get_connection(conn).unwrap().mesh_device_id, Some(new));

        let again = ctx.apply_my_node_info(new, info(0xabc), NOW);
        assert!(again.is_empty());
    }

    #[test]
    fn test_merge_relinks_every_stale_connection() {
        let mut ctx = create_test_context();
        let old = MeshDeviceId::new(1);
        let new = MeshDeviceId::new(2);
        let other = MeshDeviceId::new(3);
        ctx.apply_my_node_info(old, info(0xabc), NOW);
        ctx.apply_my_node_info(other, info(0xdef), NOW);

        let mut connect = |name: &str, slot: MeshDeviceId| {
            let conn = ctx.add_connection(
                NewConnection {
                    name: name.into(),
                    target: ConnectionTarget::Http {
                        url: format!("http://{name}"),
                    },
                },
                NOW,
            );
            ctx.update_connection(conn, |c| c.mesh_device_id = Some(slot)).unwrap();
            conn
        };
        let first = connect("first", old);
        let second = connect("second", old);
        let unrelated = connect("unrelated", other);

        ctx.apply_my_node_info(new, info(0xabc), NOW);
        assert_eq!(ctx.get_connection(first).unwrap().mesh_device_id, Some(new));
        assert_eq!(ctx.get_connection(second).unwrap().mesh_device_id, Some(new));
        assert_eq!(ctx.get_connection(unrelated).unwrap().mesh_device_id, Some(other));
    }

    #[test]
    fn test_set_node_num_leaves_devices_alone() {
        let mut ctx = create_test_context();
        let a = MeshDeviceId::new(1);
        let b = MeshDeviceId::new(2);
        ctx.apply_my_node_info(a, info(1), NOW);
        ctx.node_db_mut(a).unwrap().add_node(create_test_node(5, "K5"));
        ctx.node_db_mut(a).unwrap().add_node(create_test_node(6, "K6"));
        ctx.apply_my_node_info(b, info(2), NOW);

        let merge = ctx.set_node_num(b, 1);
        assert_eq!(merge.node_databases, vec![a]);
        assert_eq!(merge.message_stores, vec![a]);
        assert!(merge.devices.is_empty());

        let db = ctx.node_db(b).unwrap();
        assert_eq!(db.my_node_num(), Some(1));
        assert!(db.get_node(5).is_some() && db.get_node(6).is_some());
        assert!(ctx.node_db(a).is_none());
        assert!(ctx.device(a).is_some());
    }

    #[test]
    fn test_different_node_numbers_do_not_merge() {
        let mut ctx = create_test_context();
        ctx.apply_my_node_info(MeshDeviceId::new(1), info(1), NOW);
        let merge = ctx.apply_my_node_info(MeshDeviceId::new(2), info(2), NOW);
        assert!(merge.is_empty());
        assert_eq!(ctx.device_ids().len(), 2);
    }

    #[test]
    fn test_delete_connection_removes_bound_device() {
        let mut ctx = create_test_context();
        let slot = MeshDeviceId::new(9);
        ctx.bind_slot(slot, NOW);
        ctx.app_mut().selected_device_id = Some(slot);
        let conn = ctx.add_connection(
            NewConnection {
                name: String::new(),
                target: ConnectionTarget::Http {
                    url: "http://radio".into(),
                },
            },
            NOW,
        );
        ctx.update_connection(conn, |c| c.mesh_device_id = Some(slot)).unwrap();
        ctx.take_dirty();

        assert!(ctx.delete_connection(conn).is_some());
        assert!(ctx.device(slot).is_none());
        assert_eq!(ctx.selected_device_id(), None);

        let dirty = ctx.take_dirty();
        assert!(dirty.contains(&RecordKey::new(Collection::Connections, conn.storage_key())));
        assert!(dirty.contains(&RecordKey::slot(Collection::Devices, slot)));
        for key in dirty {
            if key.collection != Collection::App {
                assert_eq!(ctx.record_value(&key).unwrap(), None);
            }
        }
    }

    #[tokio::test]
    async fn test_load_round_trip() {
        let store = MemoryPersistence::new();
        let mut ctx = create_test_context();
        let slot = MeshDeviceId::new(4);
        ctx.apply_my_node_info(slot, info(0x44), NOW);
        ctx.node_db_mut(slot).unwrap().add_node(create_test_node(8, "K8"));
        ctx.message_store_mut(slot).unwrap().save_message(create_test_message(3, 8));
        ctx.app_mut().selected_device_id = Some(slot);

        for (key, value) in ctx.snapshot().unwrap() {
            store.put(key.collection, &key.key, value).await.unwrap();
        }
        put_record(&store, Collection::Devices, "garbage", &"not a device").await.unwrap();

        let loaded = MeshContext::load(ctx.config().clone(), &store, NOW).await.unwrap();
        assert_eq!(loaded.selected_device_id(), Some(slot));
        assert_eq!(loaded.device_ids(), vec![slot]);
        assert!(loaded.node_db(slot).unwrap().get_node(8).is_some());
        assert_eq!(loaded.message_store(slot).unwrap().log_count(), 1);
        assert_eq!(loaded.device(slot).unwrap().my_node_num(), Some(0x44));
    }

    #[tokio::test]
    async fn test_load_prunes_stale_nodes() {
        let store = MemoryPersistence::new();
        let mut ctx = create_test_context();
        let slot = MeshDeviceId::new(4);
        ctx.add_node_db(slot, NOW).add_node(create_test_node(8, "K8"));
        for (key, value) in ctx.snapshot().unwrap() {
            store.put(key.collection, &key.key, value).await.unwrap();
        }

        let later = NOW.add_seconds(15 * 86_400);
        let mut loaded = MeshContext::load(ctx.config().clone(), &store, later).await.unwrap();
        assert_eq!(loaded.node_db(slot).unwrap().get_nodes_length(), 0);
        assert!(loaded
            .take_dirty()
            .contains(&RecordKey::slot(Collection::NodeDatabases, slot)));
    }
}
