//! Arrow-Relay controller entry point.
//!
//! Wires together the device registry, the WebSocket control server, and
//! the optional UDP discovery service, then pumps their event channels into
//! the log until a shutdown signal arrives.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ DeviceRegistry::new()   -- authoritative device table
//!  └─ ControlServer::run()    -- WebSocket accept loop + liveness sweep
//!  └─ start_discovery()       -- UDP announce/register thread (optional)
//!  └─ event pumps             -- registry / server / discovery logging
//! ```

use std::net::IpAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use clap::Parser;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use relay_controller::application::registry::{DeviceRegistry, RegistryEvent, DEFAULT_PAIRING_TTL};
use relay_controller::infrastructure::network::discovery::{start_discovery, DiscoveryConfig};
use relay_controller::infrastructure::network::server::{ControlServer, ServerConfig, ServerEvent};
use relay_core::{
    local_ipv4, DeviceInfo, DeviceType, CONTROLLER_DISCOVERY_PORT, DEFAULT_CONTROL_PORT,
    TARGET_DISCOVERY_PORT,
};

/// Arrow-Relay controller: accepts target sessions, runs pairing, and
/// dispatches arrow-key commands.
#[derive(Debug, Parser)]
#[command(name = "relay-controller", version, about)]
struct Args {
    /// Address the control server binds.
    #[arg(long, env = "RELAY_BIND", default_value = "0.0.0.0")]
    bind: IpAddr,

    /// TCP port of the WebSocket control channel.
    #[arg(long, env = "RELAY_CONTROL_PORT", default_value_t = DEFAULT_CONTROL_PORT)]
    control_port: u16,

    /// UDP port for receiving target register broadcasts.
    #[arg(long, env = "RELAY_DISCOVERY_PORT", default_value_t = CONTROLLER_DISCOVERY_PORT)]
    discovery_port: u16,

    /// UDP port targets listen on for announce broadcasts.
    #[arg(long, env = "RELAY_ANNOUNCE_PORT", default_value_t = TARGET_DISCOVERY_PORT)]
    announce_port: u16,

    /// Seconds between announce broadcasts.
    #[arg(long, default_value_t = 5)]
    announce_interval: u64,

    /// Seconds between liveness sweep cycles.
    #[arg(long, default_value_t = 30)]
    sweep_interval: u64,

    /// Human-readable controller name advertised during discovery.
    #[arg(long, env = "RELAY_NAME", default_value = "arrow-relay-controller")]
    name: String,

    /// Disable the UDP discovery service entirely.
    #[arg(long)]
    no_discovery: bool,
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
    let controller_id = format!("controller-{}", Uuid::new_v4());
    info!(id = %controller_id, "Arrow-Relay controller starting");

    // Shutdown flag shared across all background services.
    let running = Arc::new(AtomicBool::new(true));

    // ── Registry and control server ───────────────────────────────────────────
    let (registry, mut registry_rx) = DeviceRegistry::new(DEFAULT_PAIRING_TTL);
    let registry = Arc::new(Mutex::new(registry));

    let server_config = ServerConfig {
        bind_address: args.bind,
        control_port: args.control_port,
        sweep_interval: Duration::from_secs(args.sweep_interval),
        controller_id: controller_id.clone(),
    };
    let (server, mut server_rx) = ControlServer::new(server_config, Arc::clone(&registry));

    let server_task = {
        let server = Arc::clone(&server);
        let running = Arc::clone(&running);
        tokio::spawn(async move {
            if let Err(e) = server.run(running).await {
                error!("control server failed: {e}");
            }
        })
    };

    // ── Discovery service ─────────────────────────────────────────────────────
    let discovery_rx = if args.no_discovery {
        info!("discovery disabled by flag");
        None
    } else {
        let identity = DeviceInfo {
            id: controller_id.clone(),
            name: args.name.clone(),
            ip: local_ipv4(),
            mac: None,
            device_type: DeviceType::Controller,
            supported_commands: Vec::new(),
        };
        let mut config = DiscoveryConfig::new(identity, args.control_port);
        config.discovery_port = args.discovery_port;
        config.announce_port = args.announce_port;
        config.announce_interval = Duration::from_secs(args.announce_interval);

        match start_discovery(config, Arc::clone(&running)) {
            Ok(rx) => Some(rx),
            Err(e) => {
                error!("failed to start discovery: {e}");
                None
            }
        }
    };

    // ── Event pumps ───────────────────────────────────────────────────────────
    tokio::spawn(async move {
        while let Some(event) = registry_rx.recv().await {
            match event {
                RegistryEvent::DeviceRegistered { device_id } => {
                    info!(device_id = %device_id, "device registered");
                }
                RegistryEvent::DeviceMigrated { old_id, new_id } => {
                    info!(old_id = %old_id, new_id = %new_id, "device identity migrated");
                }
                RegistryEvent::DevicePaired { device_id } => {
                    info!(device_id = %device_id, "device paired");
                }
                other => {
                    info!(?other, "registry event");
                }
            }
        }
    });

    tokio::spawn(async move {
        while let Some(event) = server_rx.recv().await {
            match event {
                ServerEvent::CommandResult {
                    device_id,
                    command_type,
                    success,
                    error,
                } => {
                    if success {
                        info!(device_id = %device_id, command = %command_type, "command succeeded");
                    } else {
                        warn!(
                            device_id = %device_id,
                            command = %command_type,
                            error = ?error,
                            "command failed on target"
                        );
                    }
                }
                ServerEvent::PairingFailed { device_id, reason } => {
                    warn!(device_id = %device_id, reason = %reason, "pairing rejected");
                }
                ServerEvent::ConnectionTimedOut {
                    connection_id,
                    device_id,
                } => {
                    warn!(%connection_id, ?device_id, "connection timed out");
                }
                other => {
                    info!(?other, "server event");
                }
            }
        }
    });

    if let Some(mut rx) = discovery_rx {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                info!(
                    device_id = %event.device.id,
                    name = %event.device.name,
                    addr = %event.addr,
                    "target discovered via broadcast"
                );
            }
        });
    }

    // ── Ctrl-C handler ────────────────────────────────────────────────────────
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            running_clone.store(false, Ordering::Relaxed);
        }
    });

    info!("Arrow-Relay controller ready.  Press Ctrl-C to exit.");

    // Block until the accept loop drains; it watches the shutdown flag.
    let _ = server_task.await;

    info!("Arrow-Relay controller stopped");
    Ok(())
}
