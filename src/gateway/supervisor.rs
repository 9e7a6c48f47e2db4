//! Connection health supervisor with auto-failover.
//!
//! Mid-session drops are not signaled by the transport, so a background
//! task polls link health every two seconds. On a drop it pauses the
//! power manager, rescans, and tries every discovered device with the
//! just-died address last — any surviving gateway beats waiting for the
//! dead one to come back.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::time::{sleep, Duration};

use crate::core::events::{Severity, StateChangeKind};
use crate::gateway::controller::Controller;
use crate::transport::session::Device;

/// Health-check cadence.
const HEALTH_INTERVAL: Duration = Duration::from_secs(2);

/// Rescan window during reconnect attempts.
const RESCAN_TIMEOUT: Duration = Duration::from_secs(5);

/// Order reconnect candidates: every other device first (scan order
/// preserved), the previously-connected address last.
pub fn failover_order<T>(
    devices: Vec<T>,
    dead_address: Option<&str>,
    address: impl Fn(&T) -> &str,
) -> Vec<T> {
    let Some(dead) = dead_address else {
        return devices;
    };
    let (dead_devices, mut ordered): (Vec<T>, Vec<T>) = devices
        .into_iter()
        .partition(|d| address(d).eq_ignore_ascii_case(dead));
    ordered.extend(dead_devices);
    ordered
}

/// Monitor link health and reconnect on drops. Runs on the I/O runtime
/// until the controller shuts down.
pub async fn run(controller: Arc<Controller>) {
    loop {
        sleep(HEALTH_INTERVAL).await;
        if !controller.running.load(Ordering::SeqCst) {
            return;
        }

        if controller.link.session.is_connected().await {
            continue;
        }

        // Transition: connected -> gone.
        if controller.link.was_connected.swap(false, Ordering::SeqCst) {
            controller.bus.log(
                Severity::Error,
                "[RECONNECT] Connection lost! Attempting reconnect...",
            );
            controller.link.reconnecting.store(true, Ordering::SeqCst);
            controller
                .bus
                .state_change(StateChangeKind::Reconnecting, None);

            if controller.power.is_active() {
                controller.power.pause();
                controller
                    .bus
                    .log(Severity::Info, "[RECONNECT] PowerManager paused");
            }

            // Drop the stale peer handle and any half-reassembled frame.
            controller.disconnect().await;
        }

        if !controller.link.reconnecting.load(Ordering::SeqCst) {
            continue;
        }

        let dead_address = controller.link.last_address();
        let devices = match controller.scan(RESCAN_TIMEOUT, None).await {
            Ok(devices) if !devices.is_empty() => devices,
            Ok(_) => {
                controller.bus.log(
                    Severity::Warn,
                    "[FAILOVER] No nodes found, retrying in 5s...",
                );
                continue;
            }
            Err(e) => {
                controller
                    .bus
                    .log(Severity::Warn, format!("[FAILOVER] Error: {e}, retrying in 5s..."));
                continue;
            }
        };

        for device in failover_order(devices, dead_address.as_deref(), |d: &Device| {
            d.address.as_str()
        }) {
            match controller.link.session.connect(&device).await {
                Ok(()) => {
                    let same_peer = dead_address
                        .as_deref()
                        .map(|a| a.eq_ignore_ascii_case(&device.address))
                        .unwrap_or(false);
                    let (kind, label) = if same_peer {
                        (StateChangeKind::Reconnected, "[RECONNECT] Reconnected to original node")
                    } else {
                        (StateChangeKind::Failover, "[FAILOVER] Connected")
                    };
                    controller.bus.log(
                        Severity::Info,
                        format!("{label}: {}", device.label()),
                    );
                    controller.link.record_connected(&device.address);
                    controller
                        .bus
                        .state_change(kind, Some(device.address.clone()));

                    if controller.power.is_active() {
                        controller.power.resume();
                        controller
                            .bus
                            .log(Severity::Info, "[RECONNECT] PowerManager resumed");
                    }
                    break;
                }
                Err(e) => {
                    tracing::debug!(device = device.label(), error = %e, "failover attempt failed");
                }
            }
        }

        if controller.link.reconnecting.load(Ordering::SeqCst) {
            controller.bus.log(
                Severity::Warn,
                "[FAILOVER] No node available, retrying in 5s...",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(devices: &[&str], dead: Option<&str>) -> Vec<String> {
        let devices: Vec<String> = devices.iter().map(|s| s.to_string()).collect();
        failover_order(devices, dead, |d| d.as_str())
    }

    #[test]
    fn test_dead_address_tried_last() {
        // Connected to A, scan returns {A, B, C}: attempts go B, C, A.
        assert_eq!(order(&["A", "B", "C"], Some("A")), vec!["B", "C", "A"]);
    }

    #[test]
    fn test_scan_order_preserved_for_others() {
        assert_eq!(order(&["C", "A", "B"], Some("A")), vec!["C", "B", "A"]);
    }

    #[test]
    fn test_no_previous_address_keeps_order() {
        assert_eq!(order(&["A", "B"], None), vec!["A", "B"]);
    }

    #[test]
    fn test_address_match_ignores_case() {
        assert_eq!(
            order(&["AA:BB", "CC:DD"], Some("aa:bb")),
            vec!["CC:DD", "AA:BB"]
        );
    }
}
