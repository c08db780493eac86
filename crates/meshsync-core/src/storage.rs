//! Persistence abstraction
//!
//! One logical collection per entity kind, each a key-value map of JSON
//! records. Runtime-only fields are stripped by the records' serde attributes
//! before anything reaches a backend.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::errors::{MeshError, Result, StorageError};

// ----------------------------------------------------------------------------
// Collections
// ----------------------------------------------------------------------------

/// Logical collections in the persisted store
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Collection {
    Connections,
    Devices,
    Messages,
    NodeDatabases,
    App,
}

impl Collection {
    pub const ALL: [Collection; 5] = [
        Collection::Connections,
        Collection::Devices,
        Collection::Messages,
        Collection::NodeDatabases,
        Collection::App,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Connections => "connections",
            Collection::Devices => "devices",
            Collection::Messages => "messages",
            Collection::NodeDatabases => "nodeDatabases",
            Collection::App => "app",
        }
    }
}

// ----------------------------------------------------------------------------
// Persistence Trait
// ----------------------------------------------------------------------------

/// Key-value backend for persisted collections
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Fetch one record
    async fn get(&self, collection: Collection, key: &str) -> Result<Option<Value>>;

    /// Insert or replace one record
    async fn put(&self, collection: Collection, key: &str, value: Value) -> Result<()>;

    /// Every record of a collection, ordered by key
    async fn get_all(&self, collection: Collection) -> Result<Vec<(String, Value)>>;

    /// Delete one record; deleting a missing key is not an error
    async fn delete(&self, collection: Collection, key: &str) -> Result<()>;
}

/// Serialize a record and write it
pub async fn put_record<T: Serialize + ?Sized>(
    store: &dyn Persistence,
    collection: Collection,
    key: &str,
    record: &T,
) -> Result<()> {
    let value = serde_json::to_value(record).map_err(|source| StorageError::Serialization {
        collection: collection.as_str().to_string(),
        key: key.to_string(),
        source,
    })?;
    store.put(collection, key, value).await
}

/// Decode a stored record
pub fn decode_record<T: DeserializeOwned>(collection: Collection, key: &str, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|source| {
        MeshError::Storage(StorageError::Serialization {
            collection: collection.as_str().to_string(),
            key: key.to_string(),
            source,
        })
    })
}

// ----------------------------------------------------------------------------
// In-Memory Backend
// ----------------------------------------------------------------------------

/// In-memory persistence for tests and ephemeral sessions
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    collections: RwLock<BTreeMap<Collection, BTreeMap<String, Value>>>,
    fail_writes: AtomicBool,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with a backend error
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of records in a collection
    pub async fn len(&self, collection: Collection) -> usize {
        self.collections
            .read()
            .await
            .get(&collection)
            .map_or(0, |records| records.len())
    }

    pub async fn is_empty(&self) -> bool {
        self.collections.read().await.values().all(|records| records.is_empty())
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Backend {
                reason: "write rejected".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn get(&self, collection: Collection, key: &str) -> Result<Option<Value>> {
        Ok(self
            .collections
            .read()
            .await
            .get(&collection)
            .and_then(|records| records.get(key).cloned()))
    }

    async fn put(&self, collection: Collection, key: &str, value: Value) -> Result<()> {
        self.check_writable()?;
        self.collections
            .write()
            .await
            .entry(collection)
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn get_all(&self, collection: Collection) -> Result<Vec<(String, Value)>> {
        Ok(self
            .collections
            .read()
            .await
            .get(&collection)
            .map(|records| records.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn delete(&self, collection: Collection, key: &str) -> Result<()> {
        self.check_writable()?;
        if let Some(records) = self.collections.write().await.get_mut(&collection) {
            records.remove(key);
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
