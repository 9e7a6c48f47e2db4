//! Equilibrium-based power balancer for mesh nodes.
//!
//! Maintains total power near (threshold - headroom) by nudging node duty
//! cycles up or down each poll cycle:
//!   - No priority: all nodes get an equal power share (budget/N)
//!   - With priority: the priority node gets [`PRIORITY_WEIGHT`] shares
//!     versus 1 for normal nodes, with a one-pass redistribution when its
//!     duty ceiling caps what it can absorb
//!   - Bidirectional: raises duty under budget, lowers it over budget
//!
//! The manager talks to the mesh through the [`MeshPort`] seam so the
//! control loop can be driven against a mock in tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::{sleep, Duration, Instant};

use crate::core::error::Result;
use crate::core::events::{EventBus, GatewayEvent, Severity};
use crate::core::node::{NodeState, SensorReading};
use crate::protocol::command::{CommandFrame, NodeCommand, Target};

/// Seconds between poll cycles.
pub const POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Minimum spacing between successive per-node READs (must exceed the
/// mesh send-complete time).
pub const READ_STAGGER: Duration = Duration::from_millis(2500);

/// Silence before a node is marked unresponsive (relay round trips are slow).
pub const STALE_TIMEOUT: Duration = Duration::from_secs(45);

/// Minimum spacing between adjustments (give the mesh time to settle).
pub const COOLDOWN: Duration = Duration::from_secs(5);

/// Target buffer below threshold; budget = threshold - headroom.
pub const HEADROOM_MW: f64 = 500.0;

/// Priority node's share weight; normal nodes weigh 1.
pub const PRIORITY_WEIGHT: f64 = 2.0;

/// Skip adjustment when |total - budget| is inside this fraction of budget.
pub const DEADBAND_FRAC: f64 = 0.05;

/// Max drift between commanded and sensor duty considered in sync, in %.
pub const SYNC_TOL: u8 = 2;

/// Bootstrap mw-per-% estimate before any telemetry exists.
pub const FALLBACK_MW_PER_PCT: f64 = 50.0;

/// Group-poll response window.
const RESPONSE_WAIT: Duration = Duration::from_secs(4);

/// Radio breathing gap between response collection and adjustment.
const SETTLE_GAP: Duration = Duration::from_secs(1);

/// Per-node confirmation window for duty writes and discovery probes.
const NODE_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// In-flight command drain window taken by `disable`.
const DRAIN_WINDOW: Duration = Duration::from_secs(2);

/// The mesh side of the power manager: command dispatch, response waits,
/// and the discovery inputs owned by the controller.
#[async_trait]
pub trait MeshPort: Send + Sync {
    /// Write a command frame. Must not touch operator duty targets —
    /// the manager's own writes are not operator requests.
    async fn send(&self, frame: CommandFrame) -> Result<()>;

    /// Wait until `node_id` answers with a sensor reading, or time out.
    async fn wait_node_response(&self, node_id: &str, wait_for: Duration) -> bool;

    /// Sensing-node count derived from the last scan (mesh devices minus
    /// the edge gateway itself).
    fn sensing_node_count(&self) -> usize;

    /// Node ids that have already produced a sensor reading.
    fn known_node_ids(&self) -> Vec<String>;
}

/// Clears an atomic flag on drop, so cancellation mid-cycle cannot leave
/// the loop or balancer wedged.
struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Discovery-aware, equilibrium-seeking duty balancer.
pub struct PowerManager {
    port: Arc<dyn MeshPort>,
    bus: EventBus,

    /// Node map. The notification path writes sensor fields, the balancer
    /// writes command fields; shard locks are never held across an await.
    nodes: DashMap<String, NodeState>,

    threshold_mw: Mutex<Option<f64>>,
    priority_node: Mutex<Option<String>>,
    last_adjustment: Mutex<Option<Instant>>,

    adjusting: AtomicBool,
    polling: AtomicBool,
    paused: AtomicBool,
    force_evaluate: AtomicBool,
    needs_bootstrap: AtomicBool,
    poll_generation: AtomicU64,
}

impl PowerManager {
    pub fn new(port: Arc<dyn MeshPort>, bus: EventBus) -> Self {
        Self {
            port,
            bus,
            nodes: DashMap::new(),
            threshold_mw: Mutex::new(None),
            priority_node: Mutex::new(None),
            last_adjustment: Mutex::new(None),
            adjusting: AtomicBool::new(false),
            polling: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            force_evaluate: AtomicBool::new(false),
            needs_bootstrap: AtomicBool::new(false),
            poll_generation: AtomicU64::new(0),
        }
    }

    // ---- Public API ----

    /// Enable power management with the given threshold in mW.
    ///
    /// On first enable only, every node's current duty is frozen as its
    /// `target_duty` ceiling — whatever the operator set before engaging
    /// the manager. Re-invocations while already active must not
    /// re-snapshot; that would latch manager-reduced values as ceilings.
    pub fn set_threshold(&self, mw: f64) {
        let first_enable = {
            let mut guard = lock(&self.threshold_mw);
            let first = guard.is_none();
            *guard = Some(mw);
            first
        };

        self.needs_bootstrap
            .store(self.nodes.is_empty(), Ordering::SeqCst);

        if first_enable {
            for mut entry in self.nodes.iter_mut() {
                if entry.duty > 0 {
                    entry.target_duty = entry.duty;
                    self.bus.log(
                        Severity::Info,
                        format!("[PM] N{} target frozen at {}%", entry.node_id, entry.duty),
                    );
                }
            }
        }

        // Force immediate evaluation on the next cycle and clear any
        // in-progress flag a dying balancer may have left behind.
        self.force_evaluate.store(true, Ordering::SeqCst);
        self.adjusting.store(false, Ordering::SeqCst);

        let budget = mw - HEADROOM_MW;
        let n = self.responsive_count().max(1);
        self.bus.log(
            Severity::Info,
            format!(
                "[POWER] Threshold: {mw:.0}mW -> budget {budget:.0}mW ({:.0}mW x {n} nodes)",
                budget / n as f64
            ),
        );
    }

    /// Disable power management and restore operator duty ceilings.
    ///
    /// Takes a drain window first: cancelling a partially-sent mesh frame
    /// would leave the mesh in an undefined state, so in-flight commands
    /// get time to complete instead.
    pub async fn disable(&self) {
        *lock(&self.threshold_mw) = None;
        sleep(DRAIN_WINDOW).await;

        for node_id in self.sorted_node_ids() {
            let (commanded, target) = match self.nodes.get(&node_id) {
                Some(ns) => (ns.commanded_duty, ns.target_duty),
                None => continue,
            };
            if commanded != target && target > 0 {
                self.bus.log(
                    Severity::Info,
                    format!("[POWER] Restoring node {node_id}: {commanded}% -> {target}%"),
                );
                if let Ok(target_node) = node_id.parse::<u8>() {
                    let frame = CommandFrame::duty(Target::Node(target_node), target);
                    if self.port.send(frame).await.is_ok() {
                        // Best effort; the next operator command re-syncs anyway.
                        self.port
                            .wait_node_response(&node_id, NODE_RESPONSE_TIMEOUT)
                            .await;
                    }
                }
            }
            if let Some(mut ns) = self.nodes.get_mut(&node_id) {
                ns.commanded_duty = 0;
            }
        }

        self.bus.log(Severity::Info, "[POWER] Threshold disabled");
    }

    /// Designate a priority node. Triggers a rebalance on the next cycle.
    pub fn set_priority(&self, node_id: impl Into<String>) {
        let node_id = node_id.into();
        *lock(&self.priority_node) = Some(node_id.clone());
        self.force_evaluate.store(true, Ordering::SeqCst);

        if let Some(mw) = *lock(&self.threshold_mw) {
            let budget = mw - HEADROOM_MW;
            let n = self.responsive_count().max(1);
            let total_shares = PRIORITY_WEIGHT + (n as f64 - 1.0);
            self.bus.log(
                Severity::Info,
                format!(
                    "[POWER] Priority: N{node_id} ({:.0}mW), others: {:.0}mW each",
                    budget * PRIORITY_WEIGHT / total_shares,
                    budget / total_shares
                ),
            );
        } else {
            self.bus
                .log(Severity::Info, format!("[POWER] Priority node: {node_id}"));
        }
    }

    /// Remove the priority designation; shares equalize next cycle.
    pub fn clear_priority(&self) {
        *lock(&self.priority_node) = None;
        self.force_evaluate.store(true, Ordering::SeqCst);

        if let Some(mw) = *lock(&self.threshold_mw) {
            let budget = mw - HEADROOM_MW;
            let n = self.responsive_count().max(1);
            self.bus.log(
                Severity::Info,
                format!(
                    "[POWER] Priority cleared -> equalizing at {:.0}mW each",
                    budget / n as f64
                ),
            );
        } else {
            self.bus.log(Severity::Info, "[POWER] Priority cleared");
        }
    }

    /// Record an operator-requested duty for a node.
    ///
    /// `commanded_duty` is synced too so the live mw-per-% estimate stays
    /// accurate when the operator changes duty while the manager is active.
    pub fn set_target_duty(&self, node_id: &str, duty: u8) {
        let mut ns = self
            .nodes
            .entry(node_id.to_string())
            .or_insert_with(|| NodeState::new(node_id));
        ns.target_duty = duty;
        ns.commanded_duty = duty;
    }

    /// Whether a threshold is currently set.
    pub fn is_active(&self) -> bool {
        lock(&self.threshold_mw).is_some()
    }

    /// Ids of every node the manager tracks.
    pub fn node_ids(&self) -> Vec<String> {
        self.sorted_node_ids()
    }

    /// Last confirmed commanded duty for a node, if tracked.
    pub fn commanded_duty(&self, node_id: &str) -> Option<u8> {
        self.nodes.get(node_id).map(|ns| ns.commanded_duty)
    }

    /// Whether the poll loop is mid-cycle (used to suppress expected mesh
    /// noise from discovery probes and group polls).
    pub fn is_polling(&self) -> bool {
        self.polling.load(Ordering::SeqCst)
    }

    /// Pause the loop (reconnect supervisor). The loop idles without I/O.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Resume after a reconnect.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Update node state from a parsed sensor reading.
    pub fn on_sensor_data(&self, reading: &SensorReading) {
        let generation = self.poll_generation.load(Ordering::SeqCst);
        let mut ns = self
            .nodes
            .entry(reading.node_id.clone())
            .or_insert_with(|| NodeState::new(reading.node_id.clone()));
        ns.apply_reading(reading, generation);

        // Only sync commanded_duty while the manager is off. While active,
        // only a confirmed nudge updates it — stale sensor data overwriting
        // what was just sent causes oscillation.
        if lock(&self.threshold_mw).is_none() {
            ns.commanded_duty = reading.duty;
        }
    }

    /// Human-readable status summary.
    pub fn status(&self) -> String {
        let mut lines = vec!["--- Power Manager ---".to_string()];

        let threshold = *lock(&self.threshold_mw);
        match threshold {
            Some(mw) => {
                lines.push(format!("Threshold: {mw:.0} mW"));
                lines.push(format!(
                    "Budget:    {:.0} mW (headroom: {HEADROOM_MW:.0} mW)",
                    mw - HEADROOM_MW
                ));
            }
            None => lines.push("Threshold: OFF".to_string()),
        }
        match lock(&self.priority_node).clone() {
            Some(id) => lines.push(format!("Priority:  node {id}")),
            None => lines.push("Priority:  none".to_string()),
        }

        if self.nodes.is_empty() {
            lines.push("No nodes discovered yet".to_string());
        } else {
            let shares = self.display_shares(threshold);
            let mut total = 0.0;
            lines.push("Nodes:".to_string());
            for node_id in self.sorted_node_ids() {
                let Some(ns) = self.nodes.get(&node_id) else {
                    continue;
                };
                let state = if ns.responsive { "ok" } else { "stale" };
                let target = if ns.target_duty != ns.duty {
                    format!(" (target:{}%)", ns.target_duty)
                } else {
                    String::new()
                };
                let share = shares
                    .iter()
                    .find(|(id, _)| *id == node_id)
                    .map(|(_, s)| format!(" share:{s:.0}mW"))
                    .unwrap_or_default();
                lines.push(format!(
                    "  Node {}: D:{}%{} V:{:.2}V I:{:.1}mA P:{:.0}mW [{}]{}",
                    node_id, ns.duty, target, ns.voltage, ns.current, ns.power, state, share
                ));
                if ns.responsive {
                    total += ns.power;
                }
            }
            lines.push(format!("Total power: {total:.0} mW"));
            if let Some(mw) = threshold {
                lines.push(format!("Headroom:    {:.0} mW", mw - total));
            }
        }
        lines.push("--------------------".to_string());
        lines.join("\n")
    }

    // ---- Control Loop ----

    /// Periodic poll-and-adjust cycle. Runs until the threshold clears.
    ///
    /// An overlapping start waits briefly for the previous loop to clear
    /// its flag, then declines as a recoverable duplicate — the old loop
    /// keeps ownership.
    pub async fn poll_loop(self: Arc<Self>) {
        if self.polling.load(Ordering::SeqCst) {
            let mut cleared = false;
            for _ in 0..10 {
                sleep(Duration::from_millis(100)).await;
                if !self.polling.load(Ordering::SeqCst) {
                    cleared = true;
                    break;
                }
            }
            if !cleared {
                tracing::debug!("poll loop already running, declining duplicate");
                return;
            }
        }

        self.polling.store(true, Ordering::SeqCst);
        let _polling = FlagGuard(&self.polling);

        if self.needs_bootstrap.swap(false, Ordering::SeqCst) {
            self.bootstrap_discovery().await;
            sleep(DRAIN_WINDOW).await;
        }

        while self.is_active() {
            if self.paused.load(Ordering::SeqCst) {
                sleep(POLL_INTERVAL).await;
                continue;
            }
            self.poll_all_nodes().await;
            self.wait_for_responses(RESPONSE_WAIT).await;
            self.mark_stale_nodes();
            sleep(SETTLE_GAP).await;
            self.evaluate_and_adjust().await;
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Discover sensing nodes by probing only as many addresses as the
    /// scan found: `sensing_node_count = mesh devices - 1` (the edge
    /// gateway itself). Nodes that answer with sensor data become known;
    /// relays and absentees are simply not added.
    async fn bootstrap_discovery(&self) {
        let count = self.port.sensing_node_count();
        if count == 0 {
            self.bus
                .log(Severity::Info, "[POWER] No sensing nodes found in scan");
            return;
        }

        let known = self.port.known_node_ids();
        if known.len() >= count {
            self.bus.log(
                Severity::Info,
                format!("[POWER] {} node(s) already discovered", known.len()),
            );
            // Seed from the controller's known set instead of probing.
            for node_id in known {
                if self.nodes.contains_key(&node_id) {
                    continue;
                }
                let Ok(n) = node_id.parse::<u8>() else {
                    continue;
                };
                let frame = CommandFrame::new(Target::Node(n), NodeCommand::Read);
                if self.port.send(frame).await.is_ok() {
                    self.port
                        .wait_node_response(&node_id, NODE_RESPONSE_TIMEOUT)
                        .await;
                }
            }
            return;
        }

        self.bus.log(
            Severity::Info,
            format!("[POWER] Probing {count} sensing node(s)..."),
        );
        for n in 1..=count.min(9) as u8 {
            if !self.is_active() {
                return;
            }
            let node_id = n.to_string();
            if self.nodes.contains_key(&node_id) {
                self.bus
                    .log(Severity::Info, format!("[POWER] Node {n} already known"));
                continue;
            }

            let probe_started = Instant::now();
            let frame = CommandFrame::new(Target::Node(n), NodeCommand::Read);
            if self.port.send(frame).await.is_err() {
                continue;
            }
            let responded = self
                .port
                .wait_node_response(&node_id, NODE_RESPONSE_TIMEOUT)
                .await;
            self.bus.log(
                Severity::Info,
                if responded {
                    format!("[POWER] Found node {n}")
                } else {
                    format!("[POWER] Node {n} no response")
                },
            );

            // Keep successive probes spaced past the mesh send-complete time.
            let elapsed = probe_started.elapsed();
            if elapsed < READ_STAGGER {
                sleep(READ_STAGGER - elapsed).await;
            }
        }
        self.bus.log(
            Severity::Info,
            format!("[POWER] Discovery complete: {} node(s)", self.nodes.len()),
        );
    }

    /// One group READ; every subscribed node answers individually.
    async fn poll_all_nodes(&self) {
        self.poll_generation.fetch_add(1, Ordering::SeqCst);
        if self.nodes.is_empty() {
            return;
        }
        let frame = CommandFrame::new(Target::All, NodeCommand::Read);
        if let Err(e) = self.port.send(frame).await {
            tracing::debug!(error = %e, "group poll send failed");
        }
    }

    /// Wait until every responsive node has reported for this generation,
    /// or the window closes.
    async fn wait_for_responses(&self, window: Duration) {
        let generation = self.poll_generation.load(Ordering::SeqCst);
        let deadline = Instant::now() + window;
        while Instant::now() < deadline {
            if !self.is_active() {
                return;
            }
            let all_fresh = self
                .nodes
                .iter()
                .filter(|ns| ns.responsive)
                .all(|ns| ns.poll_gen == generation);
            if all_fresh {
                return;
            }
            sleep(Duration::from_millis(100)).await;
        }
    }

    /// Mark nodes silent past [`STALE_TIMEOUT`] as unresponsive.
    fn mark_stale_nodes(&self) {
        for mut ns in self.nodes.iter_mut() {
            if !ns.node_id.chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            let age = ns.last_seen.elapsed();
            if age > STALE_TIMEOUT {
                if ns.responsive {
                    self.bus.log(
                        Severity::Warn,
                        format!(
                            "[POWER] Node {} unresponsive ({:.0}s)",
                            ns.node_id,
                            age.as_secs_f64()
                        ),
                    );
                }
                ns.responsive = false;
            }
        }
    }

    /// Bidirectional equilibrium step: nudge responsive nodes toward their
    /// budget share, with cooldown, dead band, and ceiling short-circuit.
    async fn evaluate_and_adjust(&self) {
        let Some(threshold) = *lock(&self.threshold_mw) else {
            return;
        };
        if self.adjusting.load(Ordering::SeqCst) {
            tracing::debug!("skip: adjustment already in progress");
            return;
        }

        let forced = self.force_evaluate.load(Ordering::SeqCst);
        if !forced {
            if let Some(last) = *lock(&self.last_adjustment) {
                let since = last.elapsed();
                if since < COOLDOWN {
                    tracing::debug!(since_secs = since.as_secs_f64(), "skip: cooldown");
                    return;
                }
            }
        }

        let mut responsive = self.responsive_snapshot();
        if responsive.is_empty() {
            tracing::debug!("skip: no responsive nodes");
            return;
        }

        let budget = threshold - HEADROOM_MW;
        if budget <= 0.0 {
            tracing::debug!(budget, "skip: threshold too low");
            return;
        }

        self.force_evaluate.store(false, Ordering::SeqCst);

        // Dead-band and ceiling checks use the responsive-only sum, the
        // same set the shares divide over.
        let total_power: f64 = responsive.iter().map(|ns| ns.power).sum();

        for ns in &responsive {
            tracing::debug!(
                node = %ns.node_id,
                power = ns.power,
                commanded = ns.commanded_duty,
                target = ns.target_duty,
                sensor = ns.duty,
                "pre-adjust state"
            );
        }

        if !forced {
            // Dead band: leave a settled system alone. Forced evals bypass
            // this because shares may need rebalancing even when the total
            // is fine (threshold or priority just changed).
            let deadband = budget * DEADBAND_FRAC;
            let diff = (total_power - budget).abs();
            if diff < deadband {
                tracing::debug!(total_power, budget, diff, "skip: dead band");
                return;
            }

            let all_at_ceiling = responsive
                .iter()
                .all(|ns| ns.target_duty > 0 && ns.commanded_duty >= ns.target_duty);
            let all_in_sync = responsive
                .iter()
                .filter(|ns| ns.commanded_duty > 0)
                .all(|ns| ns.duty.abs_diff(ns.commanded_duty) <= SYNC_TOL);

            if all_at_ceiling && all_in_sync && total_power <= budget {
                tracing::debug!(total_power, budget, "skip: all at ceiling and under budget");
                return;
            }
            if all_at_ceiling && !all_in_sync {
                // Nodes believe they are at ceiling but the devices
                // disagree — keep nudging until they converge.
                for ns in &responsive {
                    if ns.commanded_duty > 0 && ns.duty.abs_diff(ns.commanded_duty) > SYNC_TOL {
                        tracing::debug!(
                            node = %ns.node_id,
                            commanded = ns.commanded_duty,
                            actual = ns.duty,
                            "out of sync"
                        );
                    }
                }
            }
        } else {
            tracing::debug!("forced re-evaluation (threshold/priority change)");
            // Re-seed commanded_duty from sensor data so stale commanded
            // values cannot corrupt the mw-per-% estimates.
            for ns in &mut responsive {
                if ns.duty > 0 && ns.commanded_duty != ns.duty {
                    if let Some(mut entry) = self.nodes.get_mut(&ns.node_id) {
                        entry.commanded_duty = ns.duty;
                    }
                    ns.commanded_duty = ns.duty;
                }
            }
        }

        let direction = if total_power < budget { "UP" } else { "DOWN" };
        self.bus.log(
            Severity::Info,
            format!(
                "[POWER] {direction}: {total_power:.0}/{budget:.0}mW, nodes: {:?}",
                responsive.iter().map(|ns| ns.node_id.as_str()).collect::<Vec<_>>()
            ),
        );

        self.adjusting.store(true, Ordering::SeqCst);
        let _adjusting = FlagGuard(&self.adjusting);

        let priority = lock(&self.priority_node).clone();
        match priority {
            Some(ref id) if responsive.iter().any(|ns| &ns.node_id == id) => {
                self.balance_with_priority(&responsive, budget, id).await;
            }
            _ => self.balance_equal(&responsive, budget).await,
        }

        *lock(&self.last_adjustment) = Some(Instant::now());
    }

    /// Estimate milliwatts per duty-percent for a node.
    ///
    /// `commanded_duty` (what was sent) is preferred over sensor-reported
    /// duty: sensor data lags the device by up to a cycle, and dividing
    /// fresh power by a newer duty reads spuriously low and oscillates.
    fn estimate_mw_per_pct(ns: &NodeState, all: &[NodeState]) -> f64 {
        let duty = if ns.commanded_duty > 0 {
            ns.commanded_duty
        } else {
            ns.duty
        };
        if duty > 0 && ns.power > 0.0 {
            return ns.power / duty as f64;
        }

        let estimates: Vec<f64> = all
            .iter()
            .filter_map(|n| {
                let d = if n.commanded_duty > 0 { n.commanded_duty } else { n.duty };
                (d > 0 && n.power > 0.0).then(|| n.power / d as f64)
            })
            .collect();
        if estimates.is_empty() {
            FALLBACK_MW_PER_PCT
        } else {
            estimates.iter().sum::<f64>() / estimates.len() as f64
        }
    }

    /// Nudge one node toward its share. Returns a change description, or
    /// `None` when no command was needed.
    ///
    /// The command is sent once; a missed confirmation leaves
    /// `commanded_duty` untouched so the next cycle re-evaluates from
    /// truthful state instead of propagating an uncertain write.
    async fn nudge_node(
        &self,
        ns: &NodeState,
        share_mw: f64,
        all: &[NodeState],
    ) -> Option<String> {
        let node: u8 = ns.node_id.parse().ok()?;

        let mw_per_pct = Self::estimate_mw_per_pct(ns, all);
        let ideal = share_mw / mw_per_pct;
        let ceiling = if ns.target_duty > 0 { ns.target_duty } else { 100 };
        let new_duty = ideal.clamp(0.0, ceiling as f64).round() as u8;
        let current = if ns.commanded_duty > 0 {
            ns.commanded_duty
        } else {
            ns.duty
        };

        tracing::debug!(
            node = %ns.node_id,
            share_mw,
            mw_per_pct,
            ideal,
            ceiling,
            new_duty,
            current,
            "nudge"
        );

        if new_duty == current {
            return None;
        }

        let frame = CommandFrame::duty(Target::Node(node), new_duty);
        if let Err(e) = self.port.send(frame).await {
            tracing::debug!(node = %ns.node_id, error = %e, "nudge send failed");
            return None;
        }

        let confirmed = self
            .port
            .wait_node_response(&ns.node_id, NODE_RESPONSE_TIMEOUT)
            .await;
        if confirmed {
            if let Some(mut entry) = self.nodes.get_mut(&ns.node_id) {
                entry.commanded_duty = new_duty;
            }
        } else {
            tracing::debug!(
                node = %ns.node_id,
                new_duty,
                kept = current,
                "no confirmation, keeping commanded duty"
            );
        }

        Some(format!("N{}:{}->{}%", ns.node_id, current, new_duty))
    }

    /// Equal power shares: each node gets budget/N.
    async fn balance_equal(&self, nodes: &[NodeState], budget: f64) {
        let share = budget / nodes.len() as f64;

        let mut changes = Vec::new();
        for ns in Self::sorted_by_id(nodes) {
            if let Some(change) = self.nudge_node(ns, share, nodes).await {
                changes.push(change);
            }
        }

        if !changes.is_empty() {
            let total: f64 = nodes.iter().map(|ns| ns.power).sum();
            let summary = format!(
                "Balancing {total:.0}/{budget:.0}mW (share:{share:.0}mW each) - {}",
                changes.join(", ")
            );
            self.bus.publish(GatewayEvent::PowerAdjust { summary });
        }
    }

    /// Weighted shares: the priority node gets [`PRIORITY_WEIGHT`] shares.
    /// When its duty ceiling caps what it can absorb, the surplus is
    /// redistributed equally in a single pass; the next cycle rebalances
    /// any remainder.
    async fn balance_with_priority(&self, nodes: &[NodeState], budget: f64, priority: &str) {
        let Some(priority_ns) = nodes.iter().find(|ns| ns.node_id == priority) else {
            return;
        };
        let mut non_priority: Vec<&NodeState> =
            nodes.iter().filter(|ns| ns.node_id != priority).collect();
        non_priority.sort_by_key(|ns| ns.node_id.parse::<u32>().unwrap_or(u32::MAX));

        let total_shares = PRIORITY_WEIGHT + non_priority.len() as f64;
        let mut priority_share = budget * (PRIORITY_WEIGHT / total_shares);

        let pri_mw_per_pct = Self::estimate_mw_per_pct(priority_ns, nodes);
        let pri_ceiling = if priority_ns.target_duty > 0 {
            priority_ns.target_duty
        } else {
            100
        };
        let pri_max_power = pri_ceiling as f64 * pri_mw_per_pct;
        if pri_max_power < priority_share && !non_priority.is_empty() {
            priority_share = pri_max_power;
        }
        let remaining = budget - priority_share;
        let other_share = if non_priority.is_empty() {
            0.0
        } else {
            remaining / non_priority.len() as f64
        };

        let mut changes = Vec::new();
        if let Some(change) = self.nudge_node(priority_ns, priority_share, nodes).await {
            changes.push(format!("{change}(pri)"));
        }
        for ns in &non_priority {
            if let Some(change) = self.nudge_node(ns, other_share, nodes).await {
                changes.push(change);
            }
        }

        if !changes.is_empty() {
            let total: f64 = nodes.iter().map(|ns| ns.power).sum();
            let summary = format!(
                "Balancing {total:.0}/{budget:.0}mW (pri:{priority_share:.0}mW, others:{other_share:.0}mW each) - {}",
                changes.join(", ")
            );
            self.bus.publish(GatewayEvent::PowerAdjust { summary });
        }
    }

    // ---- Helpers ----

    /// Per-node shares for the status display, mirroring the balancer's
    /// weighting but without the ceiling redistribution.
    fn display_shares(&self, threshold: Option<f64>) -> Vec<(String, f64)> {
        let Some(mw) = threshold else {
            return Vec::new();
        };
        let responsive = self.responsive_count();
        if responsive == 0 {
            return Vec::new();
        }
        let budget = mw - HEADROOM_MW;

        let priority = lock(&self.priority_node).clone();
        match priority {
            Some(ref pri) if self.nodes.contains_key(pri) => {
                let total_shares = PRIORITY_WEIGHT + (responsive as f64 - 1.0);
                self.nodes
                    .iter()
                    .map(|ns| {
                        let share = if &ns.node_id == pri {
                            budget * PRIORITY_WEIGHT / total_shares
                        } else {
                            budget / total_shares
                        };
                        (ns.node_id.clone(), share)
                    })
                    .collect()
            }
            _ => {
                let share = budget / responsive as f64;
                self.nodes
                    .iter()
                    .map(|ns| (ns.node_id.clone(), share))
                    .collect()
            }
        }
    }

    fn responsive_count(&self) -> usize {
        self.nodes.iter().filter(|ns| ns.responsive).count()
    }

    fn responsive_snapshot(&self) -> Vec<NodeState> {
        self.nodes
            .iter()
            .filter(|ns| ns.responsive)
            .map(|ns| ns.clone())
            .collect()
    }

    fn sorted_node_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.nodes.iter().map(|ns| ns.node_id.clone()).collect();
        ids.sort_by_key(|id| id.parse::<u32>().unwrap_or(u32::MAX));
        ids
    }

    fn sorted_by_id(nodes: &[NodeState]) -> Vec<&NodeState> {
        let mut sorted: Vec<&NodeState> = nodes.iter().collect();
        sorted.sort_by_key(|ns| ns.node_id.parse::<u32>().unwrap_or(u32::MAX));
        sorted
    }
}

/// Lock a mutex, recovering the data from a poisoned lock — a panicked
/// writer cannot leave the manager permanently wedged.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex as StdMutex;

    /// Records outgoing frames; confirmation behavior is configurable.
    struct MockPort {
        sent: StdMutex<Vec<String>>,
        respond: AtomicBool,
        node_count: usize,
    }

    impl MockPort {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: StdMutex::new(Vec::new()),
                respond: AtomicBool::new(true),
                node_count: 0,
            })
        }

        fn with_node_count(count: usize) -> Arc<Self> {
            Arc::new(Self {
                sent: StdMutex::new(Vec::new()),
                respond: AtomicBool::new(true),
                node_count: count,
            })
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MeshPort for MockPort {
        async fn send(&self, frame: CommandFrame) -> Result<()> {
            self.sent.lock().unwrap().push(frame.to_string());
            Ok(())
        }

        async fn wait_node_response(&self, _node_id: &str, _wait_for: Duration) -> bool {
            self.respond.load(Ordering::SeqCst)
        }

        fn sensing_node_count(&self) -> usize {
            self.node_count
        }

        fn known_node_ids(&self) -> Vec<String> {
            Vec::new()
        }
    }

    fn reading(node_id: &str, duty: u8, power: f64) -> SensorReading {
        SensorReading {
            node_id: node_id.to_string(),
            duty,
            voltage: 12.0,
            current: power / 12.0,
            power,
        }
    }

    fn manager(port: Arc<MockPort>) -> Arc<PowerManager> {
        Arc::new(PowerManager::new(port, EventBus::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_equal_share_nudges_only_drifted_node() {
        let port = MockPort::new();
        let pm = manager(port.clone());

        pm.on_sensor_data(&reading("1", 40, 1200.0));
        pm.on_sensor_data(&reading("2", 40, 1250.0));
        pm.set_threshold(3000.0);
        pm.set_target_duty("1", 100);
        pm.set_target_duty("2", 100);

        // Forced evaluation (threshold just set): budget 2500, share 1250.
        // Node 1 at 30 mW/% wants 41.67% -> 42; node 2 at 31.25 mW/% is
        // already exactly on share.
        pm.evaluate_and_adjust().await;

        assert_eq!(port.sent(), vec!["1:DUTY:42"]);
        assert_eq!(pm.nodes.get("1").unwrap().commanded_duty, 42);
        assert_eq!(pm.nodes.get("2").unwrap().commanded_duty, 40);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_band_suppresses_adjustment() {
        let port = MockPort::new();
        let pm = manager(port.clone());

        pm.on_sensor_data(&reading("1", 30, 740.0));
        pm.on_sensor_data(&reading("2", 30, 740.0));
        pm.set_threshold(2000.0);
        pm.set_target_duty("1", 50);
        pm.set_target_duty("2", 50);

        // First (forced) pass: both nodes sit on their 750 mW share, no
        // commands needed, cooldown timestamp recorded.
        pm.evaluate_and_adjust().await;
        assert!(port.sent().is_empty());

        // Past the cooldown, total 1480 vs budget 1500: |diff| 20 < 75.
        tokio::time::advance(Duration::from_secs(6)).await;
        pm.evaluate_and_adjust().await;

        assert!(port.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_ceiling_redistributes_surplus() {
        let port = MockPort::new();
        let pm = manager(port.clone());

        pm.on_sensor_data(&reading("1", 20, 400.0));
        pm.on_sensor_data(&reading("2", 50, 1250.0));
        pm.set_threshold(3000.0);
        pm.set_target_duty("2", 100);
        pm.set_priority("1");

        // Priority share 1666.67 capped to pri_max 400 (20% x 20 mW/%);
        // surplus flows to node 2: 2100 mW / 25 mW/% = 84%.
        pm.evaluate_and_adjust().await;

        assert_eq!(port.sent(), vec!["2:DUTY:84"]);
        assert_eq!(pm.nodes.get("1").unwrap().commanded_duty, 20);
        assert_eq!(pm.nodes.get("2").unwrap().commanded_duty, 84);

        // Invariant: commanded <= target <= 100 while active.
        for ns in pm.nodes.iter() {
            assert!(ns.commanded_duty <= ns.target_duty);
            assert!(ns.target_duty <= 100);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_restores_operator_targets() {
        let port = MockPort::new();
        let pm = manager(port.clone());

        pm.on_sensor_data(&reading("3", 80, 2000.0));
        pm.set_threshold(3000.0);
        // Simulate a manager-reduced duty.
        pm.nodes.get_mut("3").unwrap().commanded_duty = 45;

        pm.disable().await;

        assert_eq!(port.sent(), vec!["3:DUTY:80"]);
        assert!(!pm.is_active());
        assert_eq!(pm.nodes.get("3").unwrap().commanded_duty, 0);
        // The operator ceiling survives for the next enable.
        assert_eq!(pm.nodes.get("3").unwrap().target_duty, 80);
    }

    #[tokio::test(start_paused = true)]
    async fn test_re_enable_does_not_resnapshot_targets() {
        let port = MockPort::new();
        let pm = manager(port.clone());

        pm.on_sensor_data(&reading("1", 40, 1000.0));
        pm.set_threshold(3000.0);
        assert_eq!(pm.nodes.get("1").unwrap().target_duty, 40);

        // Manager reduced the node, sensor now reports the lower duty.
        pm.on_sensor_data(&reading("1", 20, 500.0));
        pm.set_threshold(2500.0);

        // The ceiling must still be the operator's 40, not the reduced 20.
        assert_eq!(pm.nodes.get("1").unwrap().target_duty, 40);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_nudge_keeps_commanded_duty() {
        let port = MockPort::new();
        port.respond.store(false, Ordering::SeqCst);
        let pm = manager(port.clone());

        pm.on_sensor_data(&reading("1", 40, 1200.0));
        pm.set_threshold(3000.0);
        pm.set_target_duty("1", 100);

        pm.evaluate_and_adjust().await;

        // Share 2500 at 30 mW/% clamps to the 83% ideal -> command sent,
        // but without confirmation the commanded duty stays at the
        // resynced sensor value.
        assert_eq!(port.sent(), vec!["1:DUTY:83"]);
        assert_eq!(pm.nodes.get("1").unwrap().commanded_duty, 40);
    }

    #[tokio::test(start_paused = true)]
    async fn test_under_budget_raises_duty() {
        let port = MockPort::new();
        let pm = manager(port.clone());

        pm.on_sensor_data(&reading("1", 10, 300.0));
        pm.set_threshold(2000.0);
        pm.set_target_duty("1", 100);

        // Budget 1500 at 30 mW/% -> 50%.
        pm.evaluate_and_adjust().await;
        assert_eq!(port.sent(), vec!["1:DUTY:50"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_probes_scanned_count() {
        let port = MockPort::with_node_count(2);
        let pm = manager(port.clone());
        pm.set_threshold(3000.0);

        pm.bootstrap_discovery().await;

        assert_eq!(port.sent(), vec!["1:READ", "2:READ"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_poll_loop_declines() {
        let port = MockPort::new();
        let pm = manager(port.clone());
        pm.set_threshold(3000.0);
        pm.polling.store(true, Ordering::SeqCst);

        // The stale flag never clears, so the duplicate gives up without
        // touching the mesh.
        pm.clone().poll_loop().await;

        assert!(port.sent().is_empty());
        assert!(pm.polling.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sensor_data_syncs_commanded_only_when_disabled() {
        let port = MockPort::new();
        let pm = manager(port);

        pm.on_sensor_data(&reading("1", 35, 900.0));
        assert_eq!(pm.nodes.get("1").unwrap().commanded_duty, 35);

        pm.set_threshold(3000.0);
        pm.on_sensor_data(&reading("1", 12, 300.0));
        // Active manager: sensor data must not clobber commanded state.
        assert_eq!(pm.nodes.get("1").unwrap().commanded_duty, 35);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_summary_lists_nodes() {
        let port = MockPort::new();
        let pm = manager(port);

        pm.on_sensor_data(&reading("1", 40, 1200.0));
        pm.set_threshold(3000.0);

        let status = pm.status();
        assert!(status.contains("Threshold: 3000 mW"));
        assert!(status.contains("Budget:    2500 mW"));
        assert!(status.contains("Node 1: D:40%"));
        assert!(status.contains("Total power: 1200 mW"));
    }
}
