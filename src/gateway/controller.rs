//! Gateway controller: session state, the typed command API, and
//! notification dispatch.
//!
//! The controller sits between the transport session and everything that
//! observes it. Inbound frames are reassembled, classified, and fanned out
//! (node caches, response latches, power manager, history sink, event
//! bus); outbound commands go through a shared [`MeshLink`] that enforces
//! the connected/reconnecting short-circuits. The link doubles as the
//! power manager's [`MeshPort`], so no component holds a pointer back into
//! the controller.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::core::error::{GatewayError, Result};
use crate::core::events::{EventBus, GatewayEvent, Severity, StateChangeKind};
use crate::core::node::SensorReading;
use crate::gateway::signals::ResponseSignals;
use crate::history::HistorySink;
use crate::power::manager::{MeshPort, PowerManager};
use crate::protocol::command::{CommandFrame, NodeCommand, Target};
use crate::protocol::parser::{classify, ChunkBuffer, Notification};
use crate::transport::session::{Device, Session};

/// Default wait for a node to answer a direct command.
const NODE_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Latest telemetry per node, independent of the power manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedReading {
    pub duty: u8,
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    pub received: DateTime<Utc>,
}

/// Link state shared by the controller, the supervisor, and the power
/// manager: the session plus everything needed to route a command and
/// wait for its answer.
pub(crate) struct MeshLink {
    pub(crate) session: Arc<Session>,
    pub(crate) signals: ResponseSignals,
    pub(crate) known_nodes: DashSet<String>,
    pub(crate) sensing_node_count: AtomicUsize,
    pub(crate) reconnecting: AtomicBool,
    pub(crate) was_connected: AtomicBool,
    pub(crate) last_connected_address: Mutex<Option<String>>,
}

impl MeshLink {
    fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            signals: ResponseSignals::new(),
            known_nodes: DashSet::new(),
            sensing_node_count: AtomicUsize::new(0),
            reconnecting: AtomicBool::new(false),
            was_connected: AtomicBool::new(false),
            last_connected_address: Mutex::new(None),
        }
    }

    /// Write a frame, enforcing the reconnecting/connected short-circuits.
    pub(crate) async fn send_frame(&self, frame: CommandFrame) -> Result<()> {
        if self.reconnecting.load(Ordering::SeqCst) {
            return Err(GatewayError::Reconnecting);
        }
        if !self.session.is_connected().await {
            return Err(GatewayError::NotConnected);
        }
        self.session.write_command(&frame.to_string()).await
    }

    pub(crate) fn record_connected(&self, address: &str) {
        self.was_connected.store(true, Ordering::SeqCst);
        self.reconnecting.store(false, Ordering::SeqCst);
        *self
            .last_connected_address
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(address.to_string());
    }

    pub(crate) fn last_address(&self) -> Option<String> {
        self.last_connected_address
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl MeshPort for MeshLink {
    async fn send(&self, frame: CommandFrame) -> Result<()> {
        self.send_frame(frame).await
    }

    async fn wait_node_response(&self, node_id: &str, wait_for: Duration) -> bool {
        self.signals.wait(node_id, wait_for).await
    }

    fn sensing_node_count(&self) -> usize {
        self.sensing_node_count.load(Ordering::SeqCst)
    }

    fn known_node_ids(&self) -> Vec<String> {
        self.known_nodes.iter().map(|id| id.clone()).collect()
    }
}

/// The gateway controller. Construct with [`Controller::new`], then drive
/// [`Controller::run_notifications`] with the session's frame receiver on
/// the I/O runtime.
pub struct Controller {
    pub(crate) link: Arc<MeshLink>,
    pub(crate) power: Arc<PowerManager>,
    pub(crate) bus: EventBus,
    pub(crate) running: AtomicBool,
    history: Option<Arc<dyn HistorySink>>,
    last_readings: DashMap<String, CachedReading>,
    target_node: Mutex<Target>,
    monitoring: AtomicBool,
    chunks: Mutex<ChunkBuffer>,
}

impl Controller {
    pub fn new(
        session: Arc<Session>,
        bus: EventBus,
        history: Option<Arc<dyn HistorySink>>,
    ) -> Arc<Self> {
        let link = Arc::new(MeshLink::new(session));
        let power = Arc::new(PowerManager::new(
            link.clone() as Arc<dyn MeshPort>,
            bus.clone(),
        ));

        Arc::new(Self {
            link,
            power,
            bus,
            running: AtomicBool::new(true),
            history,
            last_readings: DashMap::new(),
            target_node: Mutex::new(Target::Node(0)),
            monitoring: AtomicBool::new(false),
            chunks: Mutex::new(ChunkBuffer::new()),
        })
    }

    /// The event bus this controller publishes on.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// The power manager.
    pub fn power(&self) -> &Arc<PowerManager> {
        &self.power
    }

    // ---- Session Lifecycle ----

    /// Scan for gateways and record the sensing-node count (mesh devices
    /// minus the edge gateway itself) for discovery bootstrap.
    pub async fn scan(
        &self,
        timeout: Duration,
        target_address: Option<&str>,
    ) -> Result<Vec<Device>> {
        self.bus.log(
            Severity::Info,
            format!("Scanning for BLE devices ({}s)...", timeout.as_secs()),
        );
        let devices = self.link.session.scan(timeout, target_address).await?;
        for device in &devices {
            self.bus
                .log(Severity::Info, format!("Found: {} [{}]", device.label(), device.address));
        }
        if devices.is_empty() {
            self.bus.log(Severity::Warn, "No mesh gateways found");
        }
        self.link
            .sensing_node_count
            .store(devices.len().saturating_sub(1), Ordering::SeqCst);
        Ok(devices)
    }

    /// Try each scanned device in order until one accepts the gateway
    /// subscription. Devices without the gateway service are skipped.
    pub async fn connect_first(&self, devices: &[Device]) -> Result<()> {
        if devices.is_empty() {
            return Err(GatewayError::ScanEmpty);
        }
        let mut last_err = GatewayError::ScanEmpty;
        for device in devices {
            self.bus
                .log(Severity::Info, format!("Connecting to {}...", device.label()));
            match self.link.session.connect(device).await {
                Ok(()) => {
                    self.link.record_connected(&device.address);
                    self.bus.log(
                        Severity::Info,
                        format!(
                            "Subscribed to sensor notifications (MTU {})",
                            self.link.session.mtu()
                        ),
                    );
                    self.bus.state_change(
                        StateChangeKind::Connected,
                        Some(device.address.clone()),
                    );
                    return Ok(());
                }
                Err(e) => {
                    self.bus
                        .log(Severity::Warn, format!("{}: {e}", device.label()));
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Disconnect and clear any half-reassembled notification.
    pub async fn disconnect(&self) {
        self.link.session.disconnect().await;
        self.chunks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.bus.state_change(StateChangeKind::Disconnected, None);
    }

    /// Disable the power manager (restoring duty ceilings), then drop the
    /// link and stop the supervisor.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        if self.power.is_active() {
            self.power.disable().await;
        }
        self.disconnect().await;
    }

    // ---- Target Selection ----

    /// Currently selected default target.
    pub fn target_node(&self) -> Target {
        *self
            .target_node
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Select the default target for subsequent commands.
    pub fn set_target_node(&self, target: Target) {
        *self
            .target_node
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = target;
    }

    // ---- Command API ----

    /// Set a node's duty cycle (0-100 %).
    ///
    /// Operator duty commands double as ceiling updates: while the power
    /// manager is active, the requested value becomes the node's
    /// `target_duty` (for every known node when targeting ALL). The
    /// manager's own writes bypass this path via [`MeshLink`].
    pub async fn set_duty(&self, target: Target, percent: u8) -> Result<()> {
        let clamped = percent.min(100);
        if clamped != percent {
            self.bus
                .log(Severity::Warn, format!("Duty clamped to {clamped}%"));
        }

        if self.power.is_active() {
            match target {
                Target::All => {
                    let ids = if self.power.node_ids().is_empty() {
                        self.link.known_node_ids()
                    } else {
                        self.power.node_ids()
                    };
                    // No nodes known yet: targets get set as they respond.
                    for id in ids {
                        self.power.set_target_duty(&id, clamped);
                    }
                }
                Target::Node(n) => self.power.set_target_duty(&n.to_string(), clamped),
            }
        }

        self.send_logged(CommandFrame::duty(target, clamped)).await
    }

    /// Start the ramp test on a node.
    pub async fn start_ramp(&self, target: Target) -> Result<()> {
        self.send_logged(CommandFrame::new(target, NodeCommand::Ramp))
            .await
    }

    /// Stop the load on a node. Also leaves monitor mode.
    pub async fn stop(&self, target: Target) -> Result<()> {
        self.monitoring.store(false, Ordering::SeqCst);
        self.send_logged(CommandFrame::new(target, NodeCommand::Stop))
            .await
    }

    /// Request a single sensor reading.
    pub async fn read_sensor(&self, target: Target) -> Result<()> {
        self.send_logged(CommandFrame::new(target, NodeCommand::Read))
            .await
    }

    /// Request device status.
    pub async fn read_status(&self, target: Target) -> Result<()> {
        self.send_logged(CommandFrame::new(target, NodeCommand::Status))
            .await
    }

    /// Start continuous monitoring on a node.
    pub async fn start_monitor(&self, target: Target) -> Result<()> {
        self.monitoring.store(true, Ordering::SeqCst);
        self.send_logged(CommandFrame::new(target, NodeCommand::Monitor))
            .await
    }

    /// Escape hatch: send a raw command string.
    pub async fn raw(&self, command: &str) -> Result<()> {
        if self.link.reconnecting.load(Ordering::SeqCst) {
            self.bus
                .log(Severity::Warn, "Cannot send - reconnecting...");
            return Err(GatewayError::Reconnecting);
        }
        if !self.link.session.is_connected().await {
            self.bus.log(Severity::Warn, "Not connected");
            return Err(GatewayError::NotConnected);
        }
        self.link.session.write_command(command).await?;
        self.bus.log(Severity::Info, format!("Sent: {command}"));
        Ok(())
    }

    /// Whether monitor mode is active.
    pub fn is_monitoring(&self) -> bool {
        self.monitoring.load(Ordering::SeqCst)
    }

    /// Wait for a sensor response from a specific node.
    pub async fn wait_node_response(&self, node_id: &str, wait_for: Duration) -> bool {
        self.link.signals.wait(node_id, wait_for).await
    }

    /// Wait with the default command timeout.
    pub async fn wait_node_response_default(&self, node_id: &str) -> bool {
        self.wait_node_response(node_id, NODE_RESPONSE_TIMEOUT).await
    }

    // ---- Power Management ----

    /// Enable the power manager and start its poll loop on the current
    /// runtime (must be the I/O runtime).
    pub fn enable_threshold(&self, mw: f64) {
        self.power.set_threshold(mw);
        tokio::spawn(self.power.clone().poll_loop());
    }

    /// Disable the power manager and restore operator duty ceilings.
    pub async fn disable_threshold(&self) {
        self.power.disable().await;
    }

    // ---- Observers ----

    /// Latest reading per node, independent of the power manager.
    pub fn last_readings(&self) -> Vec<(String, CachedReading)> {
        self.last_readings
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Node ids that have produced at least one sensor reading.
    pub fn known_nodes(&self) -> Vec<String> {
        self.link.known_node_ids()
    }

    // ---- Notification Path ----

    /// Consume raw frames from the session pump. Runs until the channel
    /// closes; spawn on the I/O runtime.
    pub async fn run_notifications(
        self: Arc<Self>,
        mut frames: tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        while let Some(frame) = frames.recv().await {
            self.handle_frame(&frame);
        }
        tracing::debug!("frame channel closed");
    }

    /// Reassemble and dispatch one notification frame.
    pub(crate) fn handle_frame(&self, frame: &[u8]) {
        let message = {
            let mut chunks = self.chunks.lock().unwrap_or_else(PoisonError::into_inner);
            chunks.push(frame)
        };
        let Some(message) = message else {
            return;
        };

        match classify(&message) {
            Notification::Sensor(reading) => self.handle_reading(reading),
            Notification::Error(rest) => {
                // Discovery probes during a poll cycle produce expected
                // mesh errors; keep them off the operator's screen.
                if self.power.is_polling() {
                    tracing::debug!(error = %rest, "mesh error during poll");
                } else {
                    self.bus
                        .log(Severity::Error, format!("!! ERROR:{rest}"));
                }
            }
            Notification::Timeout(rest) => {
                if self.power.is_polling() {
                    tracing::debug!(timeout = %rest, "mesh timeout during poll");
                } else {
                    self.bus
                        .log(Severity::Warn, format!("!! TIMEOUT:{rest}"));
                }
            }
            Notification::SendComplete(rest) => {
                tracing::debug!(sent = %rest, "mesh send complete");
            }
            Notification::MeshReady(line) => {
                self.bus.log(Severity::Info, line);
            }
            Notification::Raw(line) => {
                self.bus.log(Severity::Info, line);
            }
        }
    }

    fn handle_reading(&self, reading: SensorReading) {
        self.link.known_nodes.insert(reading.node_id.clone());

        self.last_readings.insert(
            reading.node_id.clone(),
            CachedReading {
                duty: reading.duty,
                voltage: reading.voltage,
                current: reading.current,
                power: reading.power,
                received: Utc::now(),
            },
        );

        self.power.on_sensor_data(&reading);

        // Unblock any waiter pacing on this node.
        self.link.signals.signal(&reading.node_id);

        if let Some(history) = &self.history {
            let commanded = self
                .power
                .commanded_duty(&reading.node_id)
                .unwrap_or_default();
            if let Err(e) = history.insert_reading(
                &reading.node_id,
                reading.duty,
                reading.voltage,
                reading.current,
                reading.power,
                commanded,
            ) {
                tracing::debug!(error = %e, "history insert failed");
            }
        }

        self.bus.publish(GatewayEvent::from_reading(&reading));
    }

    async fn send_logged(&self, frame: CommandFrame) -> Result<()> {
        match self.link.send_frame(frame).await {
            Ok(()) => {
                self.bus.log(Severity::Info, format!("Sent: {frame}"));
                Ok(())
            }
            Err(e @ GatewayError::Reconnecting) => {
                self.bus
                    .log(Severity::Warn, "Cannot send - reconnecting...");
                Err(e)
            }
            Err(e @ GatewayError::NotConnected) => {
                self.bus.log(Severity::Warn, "Not connected");
                Err(e)
            }
            Err(e) => {
                self.bus
                    .log(Severity::Warn, format!("Failed to send command: {e}"));
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cached_reading_serializes() {
        let cached = CachedReading {
            duty: 50,
            voltage: 12.345,
            current: 1234.5,
            power: 15234.5,
            received: Utc::now(),
        };
        let json = serde_json::to_string(&cached).unwrap();
        assert!(json.contains("\"duty\":50"));
    }
}
