//! Arrow-Relay target entry point.
//!
//! Resolves the controller address (CLI flag or UDP announce), builds the
//! control client around the key press executor, and pumps client events
//! into the log until a shutdown signal arrives.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use relay_core::{
    local_ipv4, CommandType, DeviceInfo, DeviceType, DEFAULT_CONTROL_PORT, TARGET_DISCOVERY_PORT,
};
use relay_target::infrastructure::discovery::{await_announce, broadcast_register};
use relay_target::{
    ClientConfig, ClientEvent, ControlClient, ExecuteCommandUseCase, KeyPressExecutor,
    LoggingKeyPressExecutor,
};

/// Arrow-Relay target: registers with a controller and executes the
/// arrow-key commands it dispatches.
#[derive(Debug, Parser)]
#[command(name = "relay-target", version, about)]
struct Args {
    /// Controller host or IP.  Omit to discover one via UDP announce.
    #[arg(long, env = "RELAY_CONTROLLER")]
    controller: Option<String>,

    /// Controller control-channel port.
    #[arg(long, env = "RELAY_CONTROL_PORT", default_value_t = DEFAULT_CONTROL_PORT)]
    control_port: u16,

    /// UDP port to listen on for controller announces.
    #[arg(long, default_value_t = TARGET_DISCOVERY_PORT)]
    announce_port: u16,

    /// Seconds to wait for an announce before giving up.
    #[arg(long, default_value_t = 30)]
    discover_timeout: u64,

    /// Human-readable device name advertised to the controller.
    #[arg(long, env = "RELAY_NAME", default_value = "arrow-relay-target")]
    name: String,

    /// Seconds between heartbeats.
    #[arg(long, default_value_t = 10)]
    heartbeat_interval: u64,

    /// Require manual pairing instead of echoing the token automatically.
    #[arg(long)]
    manual_pairing: bool,

    /// Exit after the first disconnect instead of reconnecting.
    #[arg(long)]
    no_reconnect: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging.  Level is overridden by `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let device = DeviceInfo {
        id: format!("target-{}", Uuid::new_v4()),
        name: args.name.clone(),
        ip: local_ipv4(),
        mac: None,
        device_type: DeviceType::Target,
        supported_commands: vec![CommandType::ArrowLeft, CommandType::ArrowRight],
    };
    info!(id = %device.id, name = %device.name, "Arrow-Relay target starting");

    // ── Controller address ────────────────────────────────────────────────────
    let (controller_host, control_port) = match args.controller.clone() {
        Some(host) => (host, args.control_port),
        None => {
            info!("no controller configured; waiting for a UDP announce");
            // Let an already-running controller learn about us while we wait.
            if let Err(e) = broadcast_register(&device) {
                warn!("register broadcast failed: {e}");
            }
            let announce_port = args.announce_port;
            let timeout = Duration::from_secs(args.discover_timeout);
            let candidate =
                tokio::task::spawn_blocking(move || await_announce(announce_port, timeout))
                    .await
                    .context("discovery task panicked")?
                    .context("controller discovery failed")?;
            (candidate.source.to_string(), candidate.control_port)
        }
    };
    info!(host = %controller_host, port = control_port, "controller resolved");

    // ── Control client ────────────────────────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));

    let executor: Arc<dyn KeyPressExecutor> = Arc::new(LoggingKeyPressExecutor);
    let use_case = Arc::new(ExecuteCommandUseCase::new(
        executor,
        device.supported_commands.clone(),
    ));

    let mut config = ClientConfig::new(controller_host, device);
    config.controller_port = control_port;
    config.heartbeat_interval = Duration::from_secs(args.heartbeat_interval);
    config.auto_accept_pairing = !args.manual_pairing;
    config.auto_reconnect = !args.no_reconnect;

    let (client, mut events) =
        ControlClient::new(config, use_case, Arc::clone(&running));
    Arc::clone(&client).start();

    // ── Ctrl-C handler ────────────────────────────────────────────────────────
    let running_clone = Arc::clone(&running);
    let shutdown_client = Arc::clone(&client);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            running_clone.store(false, Ordering::Relaxed);
            shutdown_client.cancel_reconnect().await;
        }
    });

    // ── Event pump ────────────────────────────────────────────────────────────
    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::Connected => info!("connected to controller"),
            ClientEvent::Registered {
                pairing_required,
                pairing_token,
            } => {
                if pairing_required && pairing_token.is_some() && args.manual_pairing {
                    info!("pairing required; restart without --manual-pairing to auto-accept");
                } else {
                    info!(pairing_required, "registered with controller");
                }
            }
            ClientEvent::Paired { .. } => info!("paired with controller"),
            ClientEvent::PairingRejected { error } => {
                warn!("pairing rejected: {error}");
            }
            ClientEvent::CommandExecuted {
                command_type,
                success,
            } => {
                info!(command = %command_type, success, "command executed");
            }
            ClientEvent::ErrorReceived { code, message } => {
                warn!(?code, "controller reported an error: {message}");
            }
            ClientEvent::Disconnected => info!("disconnected from controller"),
            ClientEvent::Reconnecting { attempt, delay } => {
                info!(attempt, ?delay, "reconnecting");
            }
            ClientEvent::ReconnectGaveUp { attempts } => {
                error!(attempts, "giving up on the controller");
                break;
            }
        }
        if !running.load(Ordering::Relaxed) {
            break;
        }
    }

    info!("Arrow-Relay target stopped");
    Ok(())
}
