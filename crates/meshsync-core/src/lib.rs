//! Meshsync Core
//!
//! Synchronous state model for a radio mesh client: node identity and
//! conflict tracking, conversation logs, pending configuration edits, device
//! records and the connection lifecycle. Async I/O stays behind the traits in
//! [`transport`] and [`storage`]; orchestration lives in `meshsync-runtime`.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod app;
pub mod change_registry;
pub mod config;
pub mod connection;
pub mod context;
pub mod device;
pub mod errors;
pub mod events;
pub mod identity;
pub mod message_store;
pub mod node;
pub mod node_db;
pub mod retention;
pub mod storage;
pub mod transport;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use app::{AppSettings, RasterSource};
pub use change_registry::{ChangeEntry, ChangeKey, ChangeRegistry, ConfigVariant, ModuleConfigVariant};
pub use config::{
    AuditConfig, HeartbeatConfig, MeshConfig, PersistenceConfig, RetentionConfig, TransportConfig,
};
pub use connection::{
    AuditEntry, Connection, ConnectionEvent, ConnectionRegistry, ConnectionStatus,
    ConnectionTarget, ConnectionType, NewConnection,
};
pub use context::{IdentityMerge, MeshContext, RecordKey};
pub use device::{Channel, ChannelRole, ConnectionPhase, DeviceRecord, UnreadKey};
pub use errors::{MeshError, MeshResult, Result};
pub use events::{AdminAction, DeviceEvent, DeviceStatus, Destination, OutboundText};
pub use identity::{NodeIdentityResolver, Resolution};
pub use message_store::{Message, MessageState, MessageStore, MessageTarget, MessageType};
pub use node::{NodeRecord, PublicKey, User};
pub use node_db::{NodeDatabase, NodeErrorKind};
pub use retention::RetentionEvictor;
pub use storage::{Collection, MemoryPersistence, Persistence};
pub use transport::{ConnectOptions, DeviceLink, LinkFactory, Transport, TransportConnector};
pub use types::{ConnectionId, MeshDeviceId, NodeNum, Timestamp, BROADCAST_NUM};
