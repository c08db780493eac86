//! Connection Manager
//!
//! Owns the single active device session: transport resolution, the
//! configure handshake, heartbeats, inbound event dispatch and teardown.
//! Every operation takes `&mut self`, so connect, disconnect and event
//! processing never interleave.

use std::sync::Arc;

use meshsync_core::{
    connection::{AuditEntry, ConnectionStats, StatusTransition},
    transport::resolve_target,
    Connection, ConnectOptions, ConnectionEvent, ConnectionId, ConnectionPhase, DeviceEvent,
    DeviceLink, DeviceStatus, LinkFactory, MeshConfig, MeshContext, MeshDeviceId, MeshError,
    Persistence, Result, Timestamp, Transport, TransportConnector,
};
use meshsync_core::types::TimeSource;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::dispatch::{DispatchOutcome, EventDispatcher};
use crate::flush::{FlushStats, Flusher};
use crate::heartbeat::{Cadence, Heartbeat};
use crate::save::{SaveError, SaveReport, SaveWorkflow};

// ----------------------------------------------------------------------------
// Active Session
// ----------------------------------------------------------------------------

/// Resources of the one connection currently holding a device link
pub(crate) struct ActiveSession {
    pub(crate) connection_id: ConnectionId,
    pub(crate) device_id: MeshDeviceId,
    pub(crate) link: Arc<dyn DeviceLink>,
    events: mpsc::UnboundedReceiver<DeviceEvent>,
    heartbeat: Option<Heartbeat>,
    configure_id: Option<u32>,
}

/// What woke the run loop
enum Wake {
    Event(Option<DeviceEvent>),
    Flush,
}

async fn next_event(events: Option<&mut mpsc::UnboundedReceiver<DeviceEvent>>) -> Option<DeviceEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn flush_due(flusher: Option<&Flusher>) {
    match flusher {
        Some(flusher) => flusher.wait_due().await,
        None => std::future::pending().await,
    }
}

// ----------------------------------------------------------------------------
// Connection Manager
// ----------------------------------------------------------------------------

/// Drives connections and routes device events into the mesh context
pub struct ConnectionManager {
    pub(crate) context: MeshContext,
    connector: Arc<dyn TransportConnector>,
    links: Arc<dyn LinkFactory>,
    time: Arc<dyn TimeSource>,
    pub(crate) session: Option<ActiveSession>,
    flusher: Option<Flusher>,
    save: SaveWorkflow,
}

impl ConnectionManager {
    /// Create a manager around an already-built context
    pub fn new(
        context: MeshContext,
        connector: Arc<dyn TransportConnector>,
        links: Arc<dyn LinkFactory>,
        time: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            context,
            connector,
            links,
            time,
            session: None,
            flusher: None,
            save: SaveWorkflow::new(),
        }
    }

    /// Load the context from `store` and write changes back to it
    pub async fn open(
        config: MeshConfig,
        store: Arc<dyn Persistence>,
        connector: Arc<dyn TransportConnector>,
        links: Arc<dyn LinkFactory>,
        time: Arc<dyn TimeSource>,
    ) -> Result<Self> {
        config.validate()?;
        let context = MeshContext::load(config, store.as_ref(), time.now()).await?;
        let manager = Self::new(context, connector, links, time);
        Ok(manager.with_persistence(store))
    }

    /// Persist through `store` with the configured throttle
    pub fn with_persistence(mut self, store: Arc<dyn Persistence>) -> Self {
        let persistence = &self.context.config().persistence;
        if persistence.enabled {
            self.flusher = Some(Flusher::new(store, persistence.flush_throttle));
        } else {
            debug!("Persistence disabled; records stay in memory");
        }
        self
    }

    pub fn context(&self) -> &MeshContext {
        &self.context
    }

    /// Direct access to the stores; changes are picked up by the next flush
    pub fn context_mut(&mut self) -> &mut MeshContext {
        &mut self.context
    }

    pub(crate) fn now(&self) -> Timestamp {
        self.time.now()
    }

    /// Connection holding the device link, if any
    pub fn active_connection_id(&self) -> Option<ConnectionId> {
        self.session.as_ref().map(|s| s.connection_id)
    }

    /// Device slot of the active session
    pub fn active_device_id(&self) -> Option<MeshDeviceId> {
        self.session.as_ref().map(|s| s.device_id)
    }

    /// Cadence of the running heartbeat
    pub fn heartbeat_cadence(&self) -> Option<Cadence> {
        self.session
            .as_ref()
            .and_then(|s| s.heartbeat.as_ref())
            .map(|h| h.cadence())
    }

    pub fn is_saving(&self) -> bool {
        self.save.is_saving()
    }

    // ------------------------------------------------------------------------
    // Connect
    // ------------------------------------------------------------------------

    /// Resolve, open and configure a connection
    ///
    /// A connection that is already connecting or connected is left alone.
    /// Any other active session is disconnected first.
    pub async fn connect(&mut self, id: ConnectionId, options: ConnectOptions) -> Result<()> {
        let connection = self
            .context
            .get_connection(id)
            .ok_or(MeshError::UnknownConnection(id))?;
        if connection.status().is_busy() {
            debug!("Connection {} already {:?}", id, connection.status());
            return Ok(());
        }
        let target = connection.target.clone();
        let known_slot = connection.mesh_device_id;

        if let Some(active) = self.active_connection_id() {
            info!("Disconnecting {} before connecting {}", active, id);
            self.disconnect(active).await?;
        }

        self.transition(id, ConnectionEvent::Connect)?;

        let probe_timeout = self.context.config().transport.http_probe_timeout;
        let resolved =
            match resolve_target(self.connector.as_ref(), &target, options, probe_timeout).await {
                Ok(resolved) => resolved,
                Err(err) => return Err(self.fail(id, err)),
            };
        let transport = match self.connector.open(&resolved).await {
            Ok(transport) => transport,
            Err(err) => return Err(self.fail(id, err)),
        };

        let transport: Arc<dyn Transport> = Arc::from(transport);

        let device_id = known_slot.unwrap_or_else(MeshDeviceId::random);
        let (link, events) = match self.links.attach(transport.clone(), device_id).await {
            Ok(attached) => attached,
            Err(err) => {
                if let Err(close_err) = transport.close().await {
                    warn!("Closing transport of {} failed: {}", id, close_err);
                }
                return Err(self.fail(id, err));
            }
        };

        // Slots are only created once a link exists to fill them
        let now = self.now();
        self.context.bind_slot(device_id, now);

        self.context.app_mut().set_selected_device(Some(device_id));
        if let Some(device) = self.context.device_mut(device_id) {
            device.set_connection_id(Some(id));
        }
        self.set_phase(device_id, ConnectionPhase::Connected, DeviceStatus::Connected);
        self.context
            .update_connection(id, |c| c.mesh_device_id = Some(device_id))?;
        self.transition(id, ConnectionEvent::TransportOpened)?;

        self.session = Some(ActiveSession {
            connection_id: id,
            device_id,
            link: link.clone(),
            events,
            heartbeat: None,
            configure_id: None,
        });

        self.set_phase(device_id, ConnectionPhase::Configuring, DeviceStatus::Configuring);
        self.transition(id, ConnectionEvent::ConfigureStarted)?;

        let configure_id = match link.configure().await {
            Ok(configure_id) => configure_id,
            Err(err) => {
                warn!("Configure request for {} failed: {}", id, err);
                self.teardown().await;
                return Err(self.fail(id, err));
            }
        };

        if let Err(err) = link.heartbeat().await {
            warn!("Initial heartbeat failed: {}", err);
        }
        let interval = self.context.config().heartbeat.configuring_interval;
        if let Some(session) = self.session.as_mut() {
            session.configure_id = Some(configure_id);
            session.heartbeat = Some(Heartbeat::start(link, interval, Cadence::Configuring));
        }

        self.context
            .update_connection(id, |c| c.last_connected_at = Some(now))?;
        self.schedule_flush();
        info!("Connection {} configuring device {} (request {})", id, device_id, configure_id);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Disconnect
    // ------------------------------------------------------------------------

    /// Tear down the session of `id` and mark it disconnected
    pub async fn disconnect(&mut self, id: ConnectionId) -> Result<()> {
        if self.context.get_connection(id).is_none() {
            return Err(MeshError::UnknownConnection(id));
        }
        if self.active_connection_id() == Some(id) {
            self.teardown().await;
        }
        self.transition(id, ConnectionEvent::Disconnect)?;
        self.schedule_flush();
        info!("Connection {} disconnected", id);
        Ok(())
    }

    /// Tear down if active, then remove the connection and its device record
    pub async fn delete_connection(&mut self, id: ConnectionId) -> Result<Connection> {
        if self.active_connection_id() == Some(id) {
            self.teardown().await;
        }
        let removed = self
            .context
            .delete_connection(id)
            .ok_or(MeshError::UnknownConnection(id))?;
        self.schedule_flush();
        Ok(removed)
    }

    /// Release the active session
    ///
    /// The heartbeat is stopped and the event receiver dropped before the
    /// link is closed, so nothing of the old session reaches the stores.
    async fn teardown(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        if let Some(heartbeat) = session.heartbeat.take() {
            heartbeat.stop();
        }
        drop(session.events);

        if let Err(err) = session.link.disconnect().await {
            warn!("Closing link of {} failed: {}", session.connection_id, err);
        }

        let device_id = session.device_id;
        if let Some(device) = self.context.device_mut(device_id) {
            device.set_connection_id(None);
        }
        self.set_phase(device_id, ConnectionPhase::Disconnected, DeviceStatus::Disconnected);
        debug!("Session of {} torn down", session.connection_id);
    }

    // ------------------------------------------------------------------------
    // Event Processing
    // ------------------------------------------------------------------------

    /// Process every event already queued by the active link
    pub async fn pump(&mut self) -> usize {
        let mut processed = 0;
        loop {
            let (connection_id, event) = {
                let Some(session) = self.session.as_mut() else {
                    break;
                };
                match session.events.try_recv() {
                    Ok(event) => (session.connection_id, event),
                    Err(_) => break,
                }
            };
            self.handle_event(connection_id, event).await;
            processed += 1;
        }
        self.schedule_flush();
        processed
    }

    /// Process events and flushes until the session ends and writes settle
    pub async fn run(&mut self) {
        loop {
            self.schedule_flush();
            let flush_pending = self.flusher.as_ref().is_some_and(|f| f.deadline().is_some());
            if self.session.is_none() && !flush_pending {
                break;
            }

            let wake = {
                let events = self.session.as_mut().map(|s| &mut s.events);
                let flusher = self.flusher.as_ref();
                tokio::select! {
                    event = next_event(events) => Wake::Event(event),
                    _ = flush_due(flusher) => Wake::Flush,
                }
            };

            match wake {
                Wake::Event(Some(event)) => {
                    if let Some(connection_id) = self.active_connection_id() {
                        self.handle_event(connection_id, event).await;
                    }
                }
                Wake::Event(None) => {
                    if let Some(connection_id) = self.active_connection_id() {
                        warn!("Event stream of {} ended", connection_id);
                        self.handle_closed(connection_id, "event stream ended").await;
                    }
                }
                Wake::Flush => self.flush().await,
            }
        }
    }

    /// Write pending records now
    pub async fn flush(&mut self) {
        if let Some(flusher) = self.flusher.as_mut() {
            flusher.flush(&mut self.context).await;
        }
    }

    pub fn flush_statistics(&self) -> Option<FlushStats> {
        self.flusher.as_ref().map(|f| f.get_statistics())
    }

    async fn handle_event(&mut self, connection_id: ConnectionId, event: DeviceEvent) {
        let Some(device_id) = self
            .session
            .as_ref()
            .filter(|s| s.connection_id == connection_id)
            .map(|s| s.device_id)
        else {
            debug!("Dropping {} for inactive connection {}", event.name(), connection_id);
            return;
        };

        let now = self.now();
        match EventDispatcher::dispatch(&mut self.context, device_id, event, now) {
            DispatchOutcome::Applied | DispatchOutcome::Dropped => {}
            DispatchOutcome::Lifecycle(DeviceEvent::ConfigComplete { id }) => {
                self.handle_config_complete(connection_id, id)
            }
            DispatchOutcome::Lifecycle(DeviceEvent::Closed { reason }) => {
                self.handle_closed(connection_id, &reason).await
            }
            DispatchOutcome::Lifecycle(other) => {
                debug!("Ignoring lifecycle event {}", other.name())
            }
        }
    }

    fn handle_config_complete(&mut self, connection_id: ConnectionId, id: u32) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.configure_id.is_some_and(|expected| expected != id) {
            warn!(
                "Ignoring configure completion {} for {} (expected {:?})",
                id, connection_id, session.configure_id
            );
            return;
        }
        let device_id = session.device_id;
        let interval = self.context.config().heartbeat.steady_interval;
        if let Some(old) = session.heartbeat.take() {
            old.stop();
        }
        session.heartbeat = Some(Heartbeat::start(session.link.clone(), interval, Cadence::Steady));

        if let Err(err) = self.transition(connection_id, ConnectionEvent::ConfigureComplete) {
            warn!("Configure completion for {} rejected: {}", connection_id, err);
        }
        self.set_phase(device_id, ConnectionPhase::Configured, DeviceStatus::Configured);

        let now = self.now();
        let window = self.context.config().retention.node_retention_secs();
        if let Some(db) = self.context.node_db_mut(device_id) {
            let pruned = db.prune_stale_nodes(now, window);
            if pruned > 0 {
                info!("Pruned {} stale node(s) after configuring", pruned);
            }
        }
        info!("Connection {} configured", connection_id);
    }

    async fn handle_closed(&mut self, connection_id: ConnectionId, reason: &str) {
        info!("Device closed connection {}: {}", connection_id, reason);
        self.teardown().await;
        if let Err(err) = self.transition(connection_id, ConnectionEvent::Disconnect) {
            warn!("Disconnect of {} rejected: {}", connection_id, err);
        }
        self.schedule_flush();
    }

    // ------------------------------------------------------------------------
    // Save
    // ------------------------------------------------------------------------

    /// Push the active device's pending edits to the radio
    pub async fn save(&mut self) -> core::result::Result<SaveReport, SaveError> {
        let Some((link, device_id)) = self
            .session
            .as_ref()
            .map(|s| (s.link.clone(), s.device_id))
        else {
            return Err(SaveError::NotConnected);
        };
        let Some(device) = self.context.device_mut(device_id) else {
            return Err(SaveError::NotConnected);
        };
        let report = self.save.run(link.as_ref(), device).await;
        self.schedule_flush();
        report
    }

    // ------------------------------------------------------------------------
    // Audit
    // ------------------------------------------------------------------------

    pub fn get_recent_audit_entries(&self, limit: usize) -> Vec<&AuditEntry> {
        self.context.connections().get_recent_audit_entries(limit)
    }

    pub fn get_statistics(&self) -> &ConnectionStats {
        self.context.connections().get_statistics()
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn transition(&mut self, id: ConnectionId, event: ConnectionEvent) -> Result<StatusTransition> {
        let now = self.now();
        let transition = self.context.process_connection_event(id, event, now)?;
        debug!(
            "Connection {}: {:?} -> {:?}",
            id, transition.audit_entry.from_state, transition.new_status
        );
        Ok(transition)
    }

    /// Put the connection in `Error` and hand the cause back to the caller
    fn fail(&mut self, id: ConnectionId, err: MeshError) -> MeshError {
        warn!("Connection {} failed: {}", id, err);
        let reason = err.user_message();
        if let Err(rejected) = self.transition(id, ConnectionEvent::Fail { reason }) {
            warn!("Could not mark {} failed: {}", id, rejected);
        }
        self.schedule_flush();
        err
    }

    fn set_phase(&mut self, device_id: MeshDeviceId, phase: ConnectionPhase, status: DeviceStatus) {
        if let Some(device) = self.context.device_mut(device_id) {
            device.set_connection_phase(phase);
            device.set_status(status);
        }
    }

    pub(crate) fn schedule_flush(&mut self) {
        if !self.context.has_pending_writes() {
            return;
        }
        if let Some(flusher) = self.flusher.as_mut() {
            flusher.schedule();
        }
    }
}
