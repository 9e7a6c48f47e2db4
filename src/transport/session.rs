//! The single GATT link to the mesh-edge device.
//!
//! A [`Session`] owns at most one connection at a time: scan, connect,
//! subscribe to the sensor characteristic, write commands, disconnect.
//! Raw notification frames are forwarded to the controller over an
//! unbounded channel in wire order.
//!
//! All methods must run on the I/O thread's runtime (see
//! [`crate::transport::io_thread`]): the notification pump is spawned onto
//! the caller's reactor, and it has to be the one that stays alive.

use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{sleep, Duration};
use uuid::Uuid;

use crate::core::error::{GatewayError, Result};

/// Primary service advertised by an unprovisioned edge device.
pub const GATEWAY_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000dc01_0000_1000_8000_00805f9b34fb);

/// Notification characteristic carrying sensor frames.
pub const SENSOR_DATA_CHAR_UUID: Uuid = Uuid::from_u128(0x0000dc02_0000_1000_8000_00805f9b34fb);

/// Write characteristic accepting routed command frames.
pub const COMMAND_CHAR_UUID: Uuid = Uuid::from_u128(0x0000dc03_0000_1000_8000_00805f9b34fb);

/// Advertised-name prefixes that identify candidate gateways:
/// "Mesh-Gateway" before provisioning, "ESP-BLE-MESH" once the mesh proxy
/// advert takes over, "DC-Monitor" for combined sensor+gateway nodes.
pub const DEVICE_NAME_PREFIXES: &[&str] = &["Mesh-Gateway", "DC-Monitor", "ESP-BLE-MESH"];

/// The edge device chunks outbound notifications at ATT default payload
/// size; the platform stack does not surface the negotiated MTU, so this
/// is what the session reports.
const ASSUMED_MTU: usize = 23;

/// A peer found during a scan.
#[derive(Clone)]
pub struct Device {
    peripheral: Peripheral,
    /// Advertised local name, if any.
    pub name: Option<String>,
    /// Platform address string (MAC on Linux).
    pub address: String,
}

impl Device {
    /// Display label: name when advertised, address otherwise.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("address", &self.address)
            .finish()
    }
}

/// Connected-peer state: the peripheral plus its resolved characteristics.
struct Peer {
    peripheral: Peripheral,
    command_char: Characteristic,
    address: String,
}

/// Owns the attribute-protocol link. One connection at a time.
pub struct Session {
    adapter: Adapter,
    peer: RwLock<Option<Peer>>,
    frame_tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl Session {
    /// Create a session on the first Bluetooth adapter. Raw notification
    /// frames will be forwarded into `frame_tx`.
    pub async fn new(frame_tx: mpsc::UnboundedSender<Vec<u8>>) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::scan("no Bluetooth adapter found"))?;

        Ok(Self {
            adapter,
            peer: RwLock::new(None),
            frame_tx,
        })
    }

    /// Scan for candidate gateways.
    ///
    /// A device qualifies when its advertised name matches a known prefix
    /// or its advertised services include the gateway service UUID. When
    /// `target_address` is given, that address qualifies directly without
    /// name/UUID filtering.
    pub async fn scan(
        &self,
        timeout: Duration,
        target_address: Option<&str>,
    ) -> Result<Vec<Device>> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        sleep(timeout).await;
        let _ = self.adapter.stop_scan().await;

        let mut devices = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            let address = peripheral.address().to_string();
            let props = match peripheral.properties().await {
                Ok(Some(props)) => props,
                _ => continue,
            };
            let name = props.local_name.clone();

            let matches_address = target_address
                .map(|t| address.eq_ignore_ascii_case(t))
                .unwrap_or(false);
            let matches_name = name
                .as_deref()
                .map(|n| DEVICE_NAME_PREFIXES.iter().any(|p| n.contains(p)))
                .unwrap_or(false);
            let matches_service = props.services.contains(&GATEWAY_SERVICE_UUID);

            if matches_address || matches_name || matches_service {
                tracing::debug!(%address, ?name, "scan hit");
                devices.push(Device {
                    peripheral,
                    name,
                    address,
                });
            }
        }

        Ok(devices)
    }

    /// Connect to a device and subscribe to sensor notifications.
    ///
    /// Subscription failure means the device does not expose the gateway
    /// service (a relay or plain sensor node): the link is torn down and
    /// `NoGattService` returned so the caller can try the next candidate.
    pub async fn connect(&self, device: &Device) -> Result<()> {
        let peripheral = device.peripheral.clone();

        peripheral
            .connect()
            .await
            .map_err(|e| GatewayError::connection(format!("{}: {e}", device.label())))?;
        peripheral.discover_services().await?;

        let chars = peripheral.characteristics();
        let sensor_char = chars.iter().find(|c| c.uuid == SENSOR_DATA_CHAR_UUID);
        let command_char = chars.iter().find(|c| c.uuid == COMMAND_CHAR_UUID);

        let (sensor_char, command_char) = match (sensor_char, command_char) {
            (Some(s), Some(c)) => (s.clone(), c.clone()),
            _ => {
                let _ = peripheral.disconnect().await;
                return Err(GatewayError::NoGattService(device.label().to_string()));
            }
        };

        if let Err(e) = peripheral.subscribe(&sensor_char).await {
            tracing::debug!(device = device.label(), error = %e, "subscribe failed");
            let _ = peripheral.disconnect().await;
            return Err(GatewayError::NoGattService(device.label().to_string()));
        }

        // Pump notifications in wire order onto the frame channel. The
        // stream ends when the peripheral disconnects.
        let mut notifications = peripheral.notifications().await?;
        let frame_tx = self.frame_tx.clone();
        tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != SENSOR_DATA_CHAR_UUID {
                    continue;
                }
                if frame_tx.send(notification.value).is_err() {
                    break;
                }
            }
            tracing::debug!("notification stream ended");
        });

        *self.peer.write().await = Some(Peer {
            peripheral,
            command_char,
            address: device.address.clone(),
        });

        Ok(())
    }

    /// Write one command frame. Single-writer, fire-and-forget.
    pub async fn write_command(&self, cmd: &str) -> Result<()> {
        let guard = self.peer.read().await;
        let peer = guard.as_ref().ok_or(GatewayError::NotConnected)?;
        peer.peripheral
            .write(&peer.command_char, cmd.as_bytes(), WriteType::WithoutResponse)
            .await?;
        Ok(())
    }

    /// Tear down the connection. Idempotent; an already-dropped link is
    /// not an error.
    pub async fn disconnect(&self) {
        if let Some(peer) = self.peer.write().await.take() {
            if let Err(e) = peer.peripheral.disconnect().await {
                tracing::debug!(error = %e, "disconnect (already down?)");
            }
        }
    }

    /// Whether the link is currently up. Mid-session drops are only
    /// observed here, by the supervisor's periodic health check — the
    /// transport does not signal them.
    pub async fn is_connected(&self) -> bool {
        let guard = self.peer.read().await;
        match guard.as_ref() {
            Some(peer) => peer.peripheral.is_connected().await.unwrap_or(false),
            None => false,
        }
    }

    /// Address of the connected peer, if any.
    pub async fn peer_address(&self) -> Option<String> {
        self.peer.read().await.as_ref().map(|p| p.address.clone())
    }

    /// Negotiated MTU as far as the session can tell.
    pub fn mtu(&self) -> usize {
        ASSUMED_MTU
    }
}
