//! meshgw CLI entry point.
//!
//! One-shot commands against mesh nodes, a streaming monitor mode, and a
//! headless power-manager mode. Commands are sent as
//! `NODE_ID:COMMAND[:VALUE]` to the mesh-edge device, which forwards them
//! to the targeted node.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use meshgw::config::GatewayConfig;
use meshgw::core::events::{EventBus, GatewayEvent, Severity};
use meshgw::gateway::{supervisor, Controller};
use meshgw::protocol::Target;
use meshgw::transport::{IoThread, Session};

/// Mesh Gateway - BLE gateway for DC load nodes
#[derive(Parser, Debug)]
#[command(name = "meshgw", version, about, long_about = None)]
struct Args {
    /// Scan for gateways and exit
    #[arg(long)]
    scan: bool,

    /// Connect to a specific address
    #[arg(long)]
    address: Option<String>,

    /// Target mesh node ID (0-9 or ALL)
    #[arg(long)]
    node: Option<String>,

    /// Set duty cycle (0-100%)
    #[arg(long)]
    duty: Option<u8>,

    /// Run ramp test
    #[arg(long)]
    ramp: bool,

    /// Stop load
    #[arg(long)]
    stop: bool,

    /// Get node status
    #[arg(long)]
    status: bool,

    /// Single sensor reading
    #[arg(long)]
    read: bool,

    /// Start continuous monitoring
    #[arg(long)]
    monitor: bool,

    /// Scan timeout in seconds
    #[arg(long)]
    timeout: Option<f64>,

    /// Total power limit in mW (runs the power manager headless)
    #[arg(long)]
    threshold: Option<f64>,

    /// Priority node for the power manager
    #[arg(long)]
    priority: Option<String>,

    /// Configuration file path
    #[arg(short, long, default_value = "meshgw.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> meshgw::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let mut config = if args.config.exists() {
        GatewayConfig::load(&args.config)?
    } else {
        GatewayConfig::default()
    };
    if let Some(address) = args.address.clone() {
        config.address = Some(address);
    }
    if let Some(timeout) = args.timeout {
        config.scan_timeout_secs = timeout;
    }
    if let Some(node) = args.node.clone() {
        config.default_node = node;
    }
    let target = config.default_target()?;

    let io = IoThread::start()?;
    let result = io.run(run(args, config, target))?;
    io.stop();
    result
}

async fn run(args: Args, config: GatewayConfig, target: Target) -> meshgw::Result<()> {
    let bus = EventBus::new();
    spawn_printer(bus.clone(), args.verbose);

    let (frame_tx, frame_rx) = tokio::sync::mpsc::unbounded_channel();
    let session = Arc::new(Session::new(frame_tx).await?);
    let controller = Controller::new(session, bus, None);
    tokio::spawn(controller.clone().run_notifications(frame_rx));

    let mut devices = controller
        .scan(config.scan_timeout(), config.address.as_deref())
        .await?;

    if args.scan {
        println!("\nFound {} gateway(s)", devices.len());
        return Ok(());
    }

    // A requested address is tried first; other matches stay as fallback.
    if let Some(address) = config.address.as_deref() {
        devices.sort_by_key(|d| !d.address.eq_ignore_ascii_case(address));
    }
    controller.connect_first(&devices).await?;
    tokio::spawn(supervisor::run(controller.clone()));

    let mut oneshot = false;
    if let Some(duty) = args.duty {
        controller.set_duty(target, duty).await?;
        oneshot = true;
    }
    if args.ramp {
        controller.start_ramp(target).await?;
        oneshot = true;
    }
    if args.stop {
        controller.stop(target).await?;
        oneshot = true;
    }
    if args.status {
        controller.read_status(target).await?;
        oneshot = true;
    }
    if args.read {
        controller.read_sensor(target).await?;
        if let Target::Node(n) = target {
            controller.wait_node_response_default(&n.to_string()).await;
        }
        oneshot = true;
    }

    if args.monitor {
        controller.start_monitor(target).await?;
    }
    if let Some(mw) = args.threshold {
        controller.enable_threshold(mw);
        if let Some(priority) = args.priority.clone() {
            controller.power().set_priority(priority);
        }
    }

    if oneshot && !args.monitor && args.threshold.is_none() {
        // Give trailing notifications a moment to land before exit.
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    } else {
        println!("Running. Press Ctrl+C to stop.");
        tokio::signal::ctrl_c().await?;
        if controller.power().is_active() {
            println!("{}", controller.power().status());
        }
    }

    controller.shutdown().await;
    Ok(())
}

/// Print bus events to stdout; this is the CLI's observer surface.
fn spawn_printer(bus: EventBus, verbose: bool) {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            let ts = chrono::Local::now().format("%H:%M:%S");
            match event {
                GatewayEvent::LogLine { text, severity } => {
                    if severity == Severity::Debug && !verbose {
                        continue;
                    }
                    println!("[{ts}] {text}");
                }
                GatewayEvent::SensorUpdate {
                    node_id,
                    duty,
                    voltage,
                    current,
                    power,
                    ..
                } => {
                    println!(
                        "[{ts}] NODE{node_id} >> D:{duty}%,V:{voltage:.3}V,I:{current:.1}mA,P:{power:.1}mW"
                    );
                }
                GatewayEvent::StateChange { kind, details } => {
                    println!("[{ts}] ** {kind:?} {}", details.unwrap_or_default());
                }
                GatewayEvent::PowerAdjust { summary } => {
                    println!("[{ts}] [POWER] {summary}");
                }
            }
        }
    });
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "meshgw=debug" } else { "meshgw=info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
