//! Transport abstraction for meshsync
//!
//! Three seams separate the core from the platform:
//! - [`TransportConnector`] finds and opens a raw byte transport (HTTP,
//!   Bluetooth or Serial);
//! - [`LinkFactory`] wraps an open transport in the device protocol codec;
//! - [`DeviceLink`] is the decoded request surface of one attached device.
//!
//! [`resolve_target`] holds the protocol-specific rules for turning a stored
//! [`ConnectionTarget`] into something a connector can open.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

use crate::connection::{ConnectionTarget, ConnectionType};
use crate::device::Channel;
use crate::errors::{MeshError, Result, TransportError};
use crate::events::{
    AdminAction, ConfigSection, DeviceEvent, Destination, ModuleConfigSection, OutboundText,
    TelemetryKind, Waypoint,
};
use crate::types::{ChannelIndex, MeshDeviceId, NodeNum};

// ----------------------------------------------------------------------------
// Transport Trait
// ----------------------------------------------------------------------------

/// An open byte transport to one device
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write raw bytes to the device
    async fn send(&self, bytes: Vec<u8>) -> Result<()>;

    /// Close the underlying channel
    async fn close(&self) -> Result<()>;

    /// Transport family
    fn kind(&self) -> ConnectionType;
}

// ----------------------------------------------------------------------------
// Discovery
// ----------------------------------------------------------------------------

/// A Bluetooth device the platform can open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BluetoothDevice {
    pub id: String,
    pub name: String,
}

/// A serial port the platform can open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialPortInfo {
    pub usb_vendor_id: u16,
    pub usb_product_id: u16,
}

impl SerialPortInfo {
    fn matches(&self, vendor: u16, product: u16) -> bool {
        self.usb_vendor_id == vendor && self.usb_product_id == product
    }
}

/// A transport target that passed discovery and can be opened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedTarget {
    Http(Url),
    Bluetooth(BluetoothDevice),
    Serial(SerialPortInfo),
}

/// Platform discovery and open operations
#[async_trait]
pub trait TransportConnector: Send + Sync {
    fn is_bluetooth_supported(&self) -> bool;

    fn is_serial_supported(&self) -> bool;

    /// Lightweight reachability probe, bounded by `timeout`
    async fn probe_http(&self, url: &Url, timeout: Duration) -> bool;

    /// Re-acquire a previously granted Bluetooth device
    async fn known_bluetooth_device(&self, device_id: &str) -> Option<BluetoothDevice>;

    /// Ask the user to pick a device advertising `service_uuid`
    async fn prompt_bluetooth_device(&self, service_uuid: &str) -> Option<BluetoothDevice>;

    /// Previously granted serial ports
    async fn known_serial_ports(&self) -> Vec<SerialPortInfo>;

    /// Ask the user to pick a serial port
    async fn prompt_serial_port(&self) -> Option<SerialPortInfo>;

    /// Prompt for a port only to read its USB identifiers
    async fn request_serial_port_info(&self) -> Option<SerialPortInfo> {
        self.prompt_serial_port().await
    }

    /// Open a resolved target
    async fn open(&self, target: &ResolvedTarget) -> Result<Box<dyn Transport>>;
}

/// Per-attempt connect options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Whether Bluetooth and Serial may fall back to a user prompt
    pub allow_prompt: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self { allow_prompt: true }
    }
}

/// Turn a stored connection target into an openable one
pub async fn resolve_target(
    connector: &dyn TransportConnector,
    target: &ConnectionTarget,
    options: ConnectOptions,
    probe_timeout: Duration,
) -> Result<ResolvedTarget> {
    match target {
        ConnectionTarget::Http { url } => {
            let parsed = Url::parse(url)
                .map_err(|e| MeshError::config_error(format!("Invalid url {}: {}", url, e)))?;
            if connector.probe_http(&parsed, probe_timeout).await {
                return Ok(ResolvedTarget::Http(parsed));
            }
            let message = if parsed.scheme() == "https" {
                format!(
                    "Cannot reach HTTPS endpoint. If using a self-signed certificate, open {} in a new tab, accept the certificate warning, then try connecting again.",
                    url
                )
            } else {
                "HTTP endpoint not reachable (may be blocked by CORS)".to_string()
            };
            warn!("HTTP probe failed for {}", url);
            Err(TransportError::Unreachable {
                url: url.clone(),
                message,
            }
            .into())
        }

        ConnectionTarget::Bluetooth {
            device_id,
            gatt_service_uuid,
            ..
        } => {
            if !connector.is_bluetooth_supported() {
                return Err(TransportError::Unsupported {
                    feature: "Web Bluetooth".to_string(),
                }
                .into());
            }
            if !device_id.is_empty() {
                if let Some(device) = connector.known_bluetooth_device(device_id).await {
                    debug!("Re-acquired Bluetooth device {}", device.id);
                    return Ok(ResolvedTarget::Bluetooth(device));
                }
            }
            if options.allow_prompt {
                if let Some(device) = connector.prompt_bluetooth_device(gatt_service_uuid).await {
                    return Ok(ResolvedTarget::Bluetooth(device));
                }
            }
            Err(TransportError::DeviceUnavailable {
                device: "Bluetooth device".to_string(),
            }
            .into())
        }

        ConnectionTarget::Serial {
            usb_vendor_id,
            usb_product_id,
        } => {
            if !connector.is_serial_supported() {
                return Err(TransportError::Unsupported {
                    feature: "Web Serial".to_string(),
                }
                .into());
            }
            let known = connector.known_serial_ports().await;
            if let Some(port) = known
                .into_iter()
                .find(|p| p.matches(*usb_vendor_id, *usb_product_id))
            {
                debug!("Re-acquired serial port {:04x}:{:04x}", port.usb_vendor_id, port.usb_product_id);
                return Ok(ResolvedTarget::Serial(port));
            }
            if options.allow_prompt {
                if let Some(port) = connector.prompt_serial_port().await {
                    return Ok(ResolvedTarget::Serial(port));
                }
            }
            Err(TransportError::DeviceUnavailable {
                device: "Serial port".to_string(),
            }
            .into())
        }

        ConnectionTarget::Unknown => Err(TransportError::TransportUnavailable {
            transport_type: ConnectionType::Unknown.as_str().to_string(),
        }
        .into()),
    }
}

// ----------------------------------------------------------------------------
// Device Link
// ----------------------------------------------------------------------------

/// Decoded request surface of an attached device
#[async_trait]
pub trait DeviceLink: Send + Sync {
    /// Request the configuration stream; returns its correlation id
    async fn configure(&self) -> Result<u32>;

    async fn heartbeat(&self) -> Result<()>;

    async fn set_channel(&self, channel: &Channel) -> Result<()>;

    async fn set_config(&self, section: &ConfigSection) -> Result<()>;

    async fn set_module_config(&self, section: &ModuleConfigSection) -> Result<()>;

    /// Ask the device to persist and apply edited settings
    async fn commit_edit_settings(&self) -> Result<()>;

    async fn send_admin(&self, action: &AdminAction) -> Result<()>;

    /// Send a text message under its own packet id
    async fn send_text(&self, text: &OutboundText) -> Result<()>;

    async fn send_waypoint(
        &self,
        waypoint: &Waypoint,
        destination: Destination,
        channel: ChannelIndex,
    ) -> Result<()>;

    async fn request_node_info(&self, node: NodeNum) -> Result<()>;

    async fn request_telemetry(&self, node: NodeNum, kind: TelemetryKind) -> Result<()>;

    /// Release the codec and close the transport
    async fn disconnect(&self) -> Result<()>;
}

/// Attaches the protocol codec to an open transport
#[async_trait]
pub trait LinkFactory: Send + Sync {
    async fn attach(
        &self,
        transport: Arc<dyn Transport>,
        device_id: MeshDeviceId,
    ) -> Result<(Arc<dyn DeviceLink>, mpsc::UnboundedReceiver<DeviceEvent>)>;
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct StubConnector {
        reachable: bool,
        bluetooth: bool,
        serial: bool,
        known_device: Option<BluetoothDevice>,
        prompt_device: Option<BluetoothDevice>,
        ports: Vec<SerialPortInfo>,
        prompt_port: Option<SerialPortInfo>,
    }

    struct NullTransport;

    #[async_trait]
    impl Transport for NullTransport {
        async fn send(&self, _bytes: Vec<u8>) -> Result<()> {
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }

        fn kind(&self) -> ConnectionType {
            ConnectionType::Unknown
        }
    }

    #[async_trait]
    impl TransportConnector for StubConnector {
        fn is_bluetooth_supported(&self) -> bool {
            self.bluetooth
        }

        fn is_serial_supported(&self) -> bool {
            self.serial
        }

        async fn probe_http(&self, _url: &Url, _timeout: Duration) -> bool {
            self.reachable
        }

        async fn known_bluetooth_device(&self, device_id: &str) -> Option<BluetoothDevice> {
            self.known_device.clone().filter(|d| d.id == device_id)
        }

        async fn prompt_bluetooth_device(&self, _service_uuid: &str) -> Option<BluetoothDevice> {
            self.prompt_device.clone()
        }

        async fn known_serial_ports(&self) -> Vec<SerialPortInfo> {
            self.ports.clone()
        }

        async fn prompt_serial_port(&self) -> Option<SerialPortInfo> {
            self.prompt_port
        }

        async fn open(&self, _target: &ResolvedTarget) -> Result<Box<dyn Transport>> {
            Ok(Box::new(NullTransport))
        }
    }

    fn create_test_device(id: &str) -> BluetoothDevice {
        BluetoothDevice {
            id: id.to_string(),
            name: format!("Meshtastic_{}", id),
        }
    }

    const TIMEOUT: Duration = Duration::from_millis(2500);

    async fn resolve(
        connector: &StubConnector,
        target: ConnectionTarget,
        allow_prompt: bool,
    ) -> Result<ResolvedTarget> {
        resolve_target(connector, &target, ConnectOptions { allow_prompt }, TIMEOUT).await
    }

    #[tokio::test]
    async fn test_http_probe_messages() {
        let down = StubConnector::default();
        let err = resolve(&down, ConnectionTarget::Http { url: "https://10.0.0.5".into() }, true)
            .await
            .unwrap_err();
        assert!(err.user_message().starts_with("Cannot reach HTTPS endpoint"));

        let err = resolve(&down, ConnectionTarget::Http { url: "http://10.0.0.5".into() }, true)
            .await
            .unwrap_err();
        assert_eq!(err.user_message(), "HTTP endpoint not reachable (may be blocked by CORS)");

        let err = resolve(&down, ConnectionTarget::Http { url: "not a url".into() }, true)
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Configuration { .. }));

        let up = StubConnector {
            reachable: true,
            ..Default::default()
        };
        let resolved = resolve(&up, ConnectionTarget::Http { url: "http://10.0.0.5".into() }, true)
            .await
            .unwrap();
        assert!(matches!(resolved, ResolvedTarget::Http(_)));
    }

    #[tokio::test]
    async fn test_bluetooth_prefers_known_then_prompt() {
        let target = ConnectionTarget::Bluetooth {
            device_id: "aa".into(),
            device_name: String::new(),
            gatt_service_uuid: "6ba1b218".into(),
        };

        let unsupported = StubConnector::default();
        let err = resolve(&unsupported, target.clone(), true).await.unwrap_err();
        assert_eq!(err.user_message(), "Web Bluetooth not supported");

        let connector = StubConnector {
            bluetooth: true,
            known_device: Some(create_test_device("aa")),
            prompt_device: Some(create_test_device("bb")),
            ..Default::default()
        };
        assert_eq!(
            resolve(&connector, target.clone(), true).await.unwrap(),
            ResolvedTarget::Bluetooth(create_test_device("aa"))
        );

        let prompt_only = StubConnector {
            bluetooth: true,
            prompt_device: Some(create_test_device("bb")),
            ..Default::default()
        };
        assert_eq!(
            resolve(&prompt_only, target.clone(), true).await.unwrap(),
            ResolvedTarget::Bluetooth(create_test_device("bb"))
        );
        let err = resolve(&prompt_only, target, false).await.unwrap_err();
        assert_eq!(err.user_message(), "Bluetooth device not available");
    }

    #[tokio::test]
    async fn test_serial_matches_usb_ids() {
        let target = ConnectionTarget::Serial {
            usb_vendor_id: 0x239a,
            usb_product_id: 0x8029,
        };
        let connector = StubConnector {
            serial: true,
            ports: vec![
                SerialPortInfo {
                    usb_vendor_id: 0x10c4,
                    usb_product_id: 0xea60,
                },
                SerialPortInfo {
                    usb_vendor_id: 0x239a,
                    usb_product_id: 0x8029,
                },
            ],
            ..Default::default()
        };
        let resolved = resolve(&connector, target.clone(), false).await.unwrap();
        assert_eq!(
            resolved,
            ResolvedTarget::Serial(SerialPortInfo {
                usb_vendor_id: 0x239a,
                usb_product_id: 0x8029,
            })
        );

        let empty = StubConnector {
            serial: true,
            ..Default::default()
        };
        let err = resolve(&empty, target, false).await.unwrap_err();
        assert_eq!(err.user_message(), "Serial port not available");
        assert!(empty.request_serial_port_info().await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_target_never_resolves() {
        let connector = StubConnector::default();
        let err = resolve(&connector, ConnectionTarget::Unknown, true).await.unwrap_err();
        assert!(matches!(
            err,
            MeshError::Transport(TransportError::TransportUnavailable { .. })
        ));
        assert!(connector.open(&ResolvedTarget::Http(Url::parse("http://x").unwrap())).await.is_ok());
    }
}
