//! Mock Collaborators
//!
//! Deterministic in-memory stand-ins for the platform connector, the
//! protocol codec and the device link. Used by the integration tests and by
//! anything that wants to drive a [`ConnectionManager`] without a radio.
//!
//! [`ConnectionManager`]: crate::ConnectionManager

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use hashbrown::HashSet;
use meshsync_core::{
    events::{ConfigSection, ModuleConfigSection, TelemetryKind, Waypoint},
    transport::{BluetoothDevice, ResolvedTarget, SerialPortInfo},
    AdminAction, Channel, ConfigVariant, ConnectionType, DeviceEvent, DeviceLink, Destination,
    LinkFactory, MeshDeviceId, MeshError, NodeNum, OutboundText, Result, Transport,
    TransportConnector,
};
use tokio::sync::mpsc;
use url::Url;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ----------------------------------------------------------------------------
// Mock Transport
// ----------------------------------------------------------------------------

/// Byte transport that records what it was asked to do
#[derive(Debug)]
pub struct MockTransport {
    kind: ConnectionType,
    closed: Arc<AtomicBool>,
}

impl MockTransport {
    pub fn new(kind: ConnectionType) -> Self {
        Self {
            kind,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, _bytes: Vec<u8>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MeshError::send_failed("transport closed"));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn kind(&self) -> ConnectionType {
        self.kind
    }
}

// ----------------------------------------------------------------------------
// Mock Connector
// ----------------------------------------------------------------------------

/// Platform connector with scripted discovery results
#[derive(Debug, Default)]
pub struct MockConnector {
    reachable: bool,
    bluetooth_supported: bool,
    serial_supported: bool,
    known_devices: Vec<BluetoothDevice>,
    prompt_device: Option<BluetoothDevice>,
    known_ports: Vec<SerialPortInfo>,
    prompt_port: Option<SerialPortInfo>,
    fail_open: bool,
    opened: Mutex<Vec<ResolvedTarget>>,
    transports: Mutex<Vec<Arc<AtomicBool>>>,
    prompts: AtomicU32,
}

impl MockConnector {
    /// Every transport family supported and every HTTP endpoint reachable
    pub fn new() -> Self {
        Self {
            reachable: true,
            bluetooth_supported: true,
            serial_supported: true,
            ..Self::default()
        }
    }

    pub fn with_reachable(mut self, reachable: bool) -> Self {
        self.reachable = reachable;
        self
    }

    pub fn with_bluetooth_supported(mut self, supported: bool) -> Self {
        self.bluetooth_supported = supported;
        self
    }

    pub fn with_serial_supported(mut self, supported: bool) -> Self {
        self.serial_supported = supported;
        self
    }

    pub fn with_known_device(mut self, device: BluetoothDevice) -> Self {
        self.known_devices.push(device);
        self
    }

    pub fn with_prompt_device(mut self, device: BluetoothDevice) -> Self {
        self.prompt_device = Some(device);
        self
    }

    pub fn with_known_port(mut self, port: SerialPortInfo) -> Self {
        self.known_ports.push(port);
        self
    }

    pub fn with_prompt_port(mut self, port: SerialPortInfo) -> Self {
        self.prompt_port = Some(port);
        self
    }

    pub fn with_failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Targets opened so far, oldest first
    pub fn opened(&self) -> Vec<ResolvedTarget> {
        lock(&self.opened).clone()
    }

    /// Transports handed out so far that have been closed
    pub fn closed_count(&self) -> usize {
        lock(&self.transports)
            .iter()
            .filter(|closed| closed.load(Ordering::SeqCst))
            .count()
    }

    pub fn prompt_count(&self) -> u32 {
        self.prompts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportConnector for MockConnector {
    fn is_bluetooth_supported(&self) -> bool {
        self.bluetooth_supported
    }

    fn is_serial_supported(&self) -> bool {
        self.serial_supported
    }

    async fn probe_http(&self, _url: &Url, _timeout: Duration) -> bool {
        self.reachable
    }

    async fn known_bluetooth_device(&self, device_id: &str) -> Option<BluetoothDevice> {
        self.known_devices.iter().find(|d| d.id == device_id).cloned()
    }

    async fn prompt_bluetooth_device(&self, _service_uuid: &str) -> Option<BluetoothDevice> {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        self.prompt_device.clone()
    }

    async fn known_serial_ports(&self) -> Vec<SerialPortInfo> {
        self.known_ports.clone()
    }

    async fn prompt_serial_port(&self) -> Option<SerialPortInfo> {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        self.prompt_port
    }

    async fn open(&self, target: &ResolvedTarget) -> Result<Box<dyn Transport>> {
        if self.fail_open {
            return Err(MeshError::connection_failed(format!("{:?}", target), "port busy"));
        }
        lock(&self.opened).push(target.clone());
        let kind = match target {
            ResolvedTarget::Http(_) => ConnectionType::Http,
            ResolvedTarget::Bluetooth(_) => ConnectionType::Bluetooth,
            ResolvedTarget::Serial(_) => ConnectionType::Serial,
        };
        let transport = MockTransport::new(kind);
        lock(&self.transports).push(transport.closed.clone());
        Ok(Box::new(transport))
    }
}

// ----------------------------------------------------------------------------
// Mock Link
// ----------------------------------------------------------------------------

/// Request recorded by a [`MockLink`]
#[derive(Debug, Clone, PartialEq)]
pub enum LinkCall {
    Configure,
    Heartbeat,
    SetChannel(u8),
    SetConfig(ConfigSection),
    SetModuleConfig(ModuleConfigSection),
    CommitEditSettings,
    SendAdmin(AdminAction),
    SendText(OutboundText),
    SendWaypoint {
        waypoint: Waypoint,
        destination: Destination,
        channel: u8,
    },
    RequestNodeInfo(NodeNum),
    RequestTelemetry(NodeNum, TelemetryKind),
    Disconnect,
}

/// Scripted link behavior
#[derive(Debug, Clone, Default)]
pub struct MockLinkConfig {
    /// Events emitted in response to `configure`, before the completion signal
    pub configure_script: Vec<DeviceEvent>,
    /// Whether `configure` is followed by a completion signal
    pub complete_configure: bool,
    pub fail_configure: bool,
    /// Whether the factory refuses to attach a codec
    pub fail_attach: bool,
    pub fail_heartbeat: bool,
    pub fail_commit: bool,
    pub fail_send_text: bool,
    pub fail_admin: bool,
    pub failing_configs: HashSet<ConfigVariant>,
    /// Delay applied to every request
    pub latency: Option<Duration>,
}

impl MockLinkConfig {
    /// A link that completes configuration immediately
    pub fn responsive() -> Self {
        Self {
            complete_configure: true,
            ..Self::default()
        }
    }

    pub fn with_script(mut self, events: Vec<DeviceEvent>) -> Self {
        self.configure_script = events;
        self
    }
}

/// Device link double that records every request
pub struct MockLink {
    device_id: MeshDeviceId,
    config: MockLinkConfig,
    calls: Mutex<Vec<LinkCall>>,
    events: mpsc::UnboundedSender<DeviceEvent>,
    next_configure_id: AtomicU32,
}

impl MockLink {
    fn new(
        device_id: MeshDeviceId,
        config: MockLinkConfig,
    ) -> (Self, mpsc::UnboundedReceiver<DeviceEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let link = Self {
            device_id,
            config,
            calls: Mutex::new(Vec::new()),
            events,
            next_configure_id: AtomicU32::new(1),
        };
        (link, receiver)
    }

    pub fn device_id(&self) -> MeshDeviceId {
        self.device_id
    }

    pub fn calls(&self) -> Vec<LinkCall> {
        lock(&self.calls).clone()
    }

    pub fn count(&self, matcher: impl Fn(&LinkCall) -> bool) -> usize {
        lock(&self.calls).iter().filter(|call| matcher(call)).count()
    }

    pub fn heartbeat_count(&self) -> usize {
        self.count(|call| matches!(call, LinkCall::Heartbeat))
    }

    /// Push an inbound event as if the device had sent it
    pub fn emit(&self, event: DeviceEvent) -> bool {
        self.events.send(event).is_ok()
    }

    /// Simulate the remote side dropping the link
    pub fn drop_link(&self, reason: &str) -> bool {
        self.emit(DeviceEvent::Closed {
            reason: reason.to_string(),
        })
    }

    async fn record(&self, call: LinkCall, fail: bool) -> Result<()> {
        if let Some(latency) = self.config.latency {
            tokio::time::sleep(latency).await;
        }
        let name = format!("{:?}", call);
        lock(&self.calls).push(call);
        if fail {
            return Err(MeshError::send_failed(format!("device rejected {}", name)));
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceLink for MockLink {
    async fn configure(&self) -> Result<u32> {
        if let Some(latency) = self.config.latency {
            tokio::time::sleep(latency).await;
        }
        lock(&self.calls).push(LinkCall::Configure);
        if self.config.fail_configure {
            return Err(MeshError::handshake_failed("device did not answer"));
        }
        let id = self.next_configure_id.fetch_add(1, Ordering::SeqCst);
        for event in &self.config.configure_script {
            self.emit(event.clone());
        }
        if self.config.complete_configure {
            self.emit(DeviceEvent::ConfigComplete { id });
        }
        Ok(id)
    }

    async fn heartbeat(&self) -> Result<()> {
        self.record(LinkCall::Heartbeat, self.config.fail_heartbeat).await
    }

    async fn set_channel(&self, channel: &Channel) -> Result<()> {
        self.record(LinkCall::SetChannel(channel.index), false).await
    }

    async fn set_config(&self, section: &ConfigSection) -> Result<()> {
        let fail = self.config.failing_configs.contains(&section.variant);
        self.record(LinkCall::SetConfig(section.clone()), fail).await
    }

    async fn set_module_config(&self, section: &ModuleConfigSection) -> Result<()> {
        self.record(LinkCall::SetModuleConfig(section.clone()), false).await
    }

    async fn commit_edit_settings(&self) -> Result<()> {
        self.record(LinkCall::CommitEditSettings, self.config.fail_commit).await
    }

    async fn send_admin(&self, action: &AdminAction) -> Result<()> {
        self.record(LinkCall::SendAdmin(action.clone()), self.config.fail_admin).await
    }

    async fn send_text(&self, text: &OutboundText) -> Result<()> {
        self.record(LinkCall::SendText(text.clone()), self.config.fail_send_text).await
    }

    async fn send_waypoint(
        &self,
        waypoint: &Waypoint,
        destination: Destination,
        channel: u8,
    ) -> Result<()> {
        let call = LinkCall::SendWaypoint {
            waypoint: waypoint.clone(),
            destination,
            channel,
        };
        self.record(call, false).await
    }

    async fn request_node_info(&self, node: NodeNum) -> Result<()> {
        self.record(LinkCall::RequestNodeInfo(node), false).await
    }

    async fn request_telemetry(&self, node: NodeNum, kind: TelemetryKind) -> Result<()> {
        self.record(LinkCall::RequestTelemetry(node, kind), false).await
    }

    async fn disconnect(&self) -> Result<()> {
        self.record(LinkCall::Disconnect, false).await
    }
}

// ----------------------------------------------------------------------------
// Mock Link Factory
// ----------------------------------------------------------------------------

/// Attaches [`MockLink`]s and keeps them for inspection
#[derive(Default)]
pub struct MockLinkFactory {
    config: Mutex<MockLinkConfig>,
    links: Mutex<Vec<Arc<MockLink>>>,
}

impl MockLinkFactory {
    pub fn new(config: MockLinkConfig) -> Self {
        Self {
            config: Mutex::new(config),
            links: Mutex::new(Vec::new()),
        }
    }

    /// Behavior of links attached from now on
    pub fn set_config(&self, config: MockLinkConfig) {
        *lock(&self.config) = config;
    }

    pub fn last_link(&self) -> Option<Arc<MockLink>> {
        lock(&self.links).last().cloned()
    }

    pub fn attach_count(&self) -> usize {
        lock(&self.links).len()
    }
}

#[async_trait]
impl LinkFactory for MockLinkFactory {
    async fn attach(
        &self,
        _transport: Arc<dyn Transport>,
        device_id: MeshDeviceId,
    ) -> Result<(Arc<dyn DeviceLink>, mpsc::UnboundedReceiver<DeviceEvent>)> {
        let config = lock(&self.config).clone();
        if config.fail_attach {
            return Err(MeshError::connection_failed(
                device_id.to_string(),
                "codec rejected the transport",
            ));
        }
        let (link, receiver) = MockLink::new(device_id, config);
        let link = Arc::new(link);
        lock(&self.links).push(link.clone());
        Ok((link, receiver))
    }
}
