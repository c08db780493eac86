//! Meshsync Runtime
//!
//! The async half of meshsync:
//! - `ConnectionManager`: the single-session connect, configure and teardown
//!   driver, plus outbound user actions;
//! - `EventDispatcher`: routes decoded device events into the stores;
//! - `SaveWorkflow`: pushes pending configuration edits to the radio;
//! - `Flusher`: throttled write-back to a persistence backend.
//!
//! `meshsync-core` holds the state model; this crate only orchestrates it.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

mod actions;
pub mod dispatch;
pub mod flush;
pub mod heartbeat;
pub mod logging;
pub mod manager;
pub mod save;
pub mod testing;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use dispatch::{DispatchOutcome, EventDispatcher};
pub use flush::{FlushStats, Flusher};
pub use heartbeat::{Cadence, Heartbeat};
pub use logging::{setup_logging, try_setup_logging};
pub use manager::ConnectionManager;
pub use save::{PhaseProgress, SaveError, SaveFailure, SavePhase, SaveReport, SaveWorkflow};

// Re-export core types for convenience
pub use meshsync_core::{
    ConnectOptions, Connection, ConnectionId, ConnectionStatus, ConnectionTarget, DeviceEvent,
    MeshConfig, MeshContext, MeshDeviceId, MeshError, NewConnection, Result, Timestamp,
};
