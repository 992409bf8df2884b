//! ControlServer: WebSocket accept loop, session routing, command dispatch,
//! and the liveness sweep.
//!
//! Each accepted session gets an ephemeral connection id and an owned
//! [`Connection`] record in the shared connection table.  The socket write
//! half is owned exclusively by the session's writer loop; every other part
//! of the server (message handlers, `send_arrow_command`, the sweep)
//! reaches the socket only through the session's [`SessionCommand`]
//! channel.  This keeps the table free of shared socket handles.
//!
//! # Lock ordering
//!
//! Paths that take both locks always take the registry lock before the
//! connection-table lock.  Nothing awaits while holding either lock.
//!
//! # Liveness sweep
//!
//! On every sweep tick, connections still marked not-alive from the
//! previous tick are terminated (socket closed, device unbound,
//! `disconnect_device` called); every surviving connection is then reset to
//! not-alive and sent a transport ping.  A pong — or any inbound frame —
//! re-marks the connection alive, so one missed ping is tolerated and the
//! second is fatal.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use relay_core::{
    CommandParameters, CommandPayload, CommandResultPayload, CommandType, DeviceType, Envelope,
    ErrorCode, ErrorPayload, MessageKind, PairingRequestPayload, PairingResponsePayload,
    RegisterPayload, RegisteredPayload, Sender, DEFAULT_CONTROL_PORT,
};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, timeout};
use tokio_tungstenite::{accept_async, tungstenite::Message as WsMessage};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::application::registry::{ConnectionId, DeviceRegistry, PairError};

/// Error type for server startup and command dispatch.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind control listener on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Error type for [`ControlServer::send_arrow_command`] preconditions.
///
/// The variants mirror the check order: unknown device, no live session,
/// not paired, command not advertised, no live bound connection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("unknown device `{0}`")]
    UnknownDevice(String),
    #[error("device `{0}` is not connected")]
    NotConnected(String),
    #[error("device `{0}` is not paired")]
    NotPaired(String),
    #[error("device `{device_id}` does not support `{command}`")]
    UnsupportedCommand {
        device_id: String,
        command: CommandType,
    },
    #[error("no live connection bound to device `{0}`")]
    NoLiveConnection(String),
}

/// Configuration for the control server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: IpAddr,
    pub control_port: u16,
    /// Interval of the liveness sweep.  A silent connection survives one
    /// full interval and is terminated on the next.
    pub sweep_interval: Duration,
    /// Identity stamped on every envelope the controller sends.
    pub controller_id: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".parse().expect("valid address literal"),
            control_port: DEFAULT_CONTROL_PORT,
            sweep_interval: Duration::from_secs(30),
            controller_id: format!("controller-{}", Uuid::new_v4()),
        }
    }
}

/// Instructions delivered to a session's writer loop.
#[derive(Debug)]
pub(crate) enum SessionCommand {
    /// Send one JSON text frame.
    Frame(String),
    /// Send a transport-level ping.
    Ping,
    /// Reply to an inbound transport ping.
    Pong(Vec<u8>),
    /// Send a close frame and end the session.
    Terminate,
}

/// Owned per-session record in the connection table.
///
/// The socket handle itself lives in the session task; this record only
/// carries the outbound channel to it.
#[derive(Debug)]
pub(crate) struct Connection {
    pub id: ConnectionId,
    pub device_id: Option<String>,
    pub is_alive: bool,
    pub last_activity: Instant,
    outbound: mpsc::Sender<SessionCommand>,
}

/// Events emitted by the server to the application layer.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    SessionOpened {
        connection_id: ConnectionId,
        peer: SocketAddr,
    },
    SessionClosed {
        connection_id: ConnectionId,
    },
    DeviceRegistered {
        device_id: String,
        connection_id: ConnectionId,
    },
    PairingCompleted {
        device_id: String,
    },
    PairingFailed {
        device_id: String,
        reason: String,
    },
    /// A target reported the outcome of a dispatched command.  Correlated by
    /// (device id, command type); the protocol carries no request id.
    CommandResult {
        device_id: String,
        command_type: CommandType,
        success: bool,
        error: Option<String>,
    },
    /// A connection missed two consecutive liveness pings and was terminated.
    ConnectionTimedOut {
        connection_id: ConnectionId,
        device_id: Option<String>,
    },
}

/// The controller's WebSocket control server.
pub struct ControlServer {
    config: ServerConfig,
    registry: Arc<Mutex<DeviceRegistry>>,
    connections: Arc<Mutex<HashMap<ConnectionId, Connection>>>,
    event_tx: mpsc::Sender<ServerEvent>,
}

impl ControlServer {
    /// Creates a server around a shared registry and returns it together
    /// with the event receiver.  Nothing is bound until [`Self::run`].
    pub fn new(
        config: ServerConfig,
        registry: Arc<Mutex<DeviceRegistry>>,
    ) -> (Arc<Self>, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(128);
        let server = Arc::new(Self {
            config,
            registry,
            connections: Arc::new(Mutex::new(HashMap::new())),
            event_tx: tx,
        });
        (server, rx)
    }

    fn identity(&self) -> Sender {
        Sender {
            id: self.config.controller_id.clone(),
            device_type: DeviceType::Controller,
        }
    }

    fn emit(&self, event: ServerEvent) {
        if self.event_tx.try_send(event).is_err() {
            debug!("server event channel full; notification dropped");
        }
    }

    // ── Accept loop ───────────────────────────────────────────────────────────

    /// Binds the control port and runs the accept loop until `running` is
    /// cleared.  Also starts the liveness sweep task.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::BindFailed`] if the listener cannot be bound.
    pub async fn run(
        self: Arc<Self>,
        running: Arc<AtomicBool>,
    ) -> Result<(), ServerError> {
        let addr = SocketAddr::new(self.config.bind_address, self.config.control_port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::BindFailed { addr, source })?;
        self.run_with_listener(listener, running).await;
        Ok(())
    }

    /// Runs the accept loop on an already-bound listener.
    ///
    /// Split from [`Self::run`] so tests can bind port 0 themselves and
    /// learn the OS-assigned port before starting the server.
    pub async fn run_with_listener(
        self: Arc<Self>,
        listener: TcpListener,
        running: Arc<AtomicBool>,
    ) {
        if let Ok(addr) = listener.local_addr() {
            info!("control server listening on {addr}");
        }

        // Liveness sweep runs concurrently with the accept loop.
        let sweeper = Arc::clone(&self);
        let sweep_running = Arc::clone(&running);
        let sweep_task = tokio::spawn(async move {
            let mut ticker = interval(sweeper.config.sweep_interval);
            ticker.tick().await; // skip the immediate first tick
            while sweep_running.load(Ordering::Relaxed) {
                ticker.tick().await;
                sweeper.sweep_once().await;
            }
        });

        loop {
            if !running.load(Ordering::Relaxed) {
                info!("shutdown flag set; stopping accept loop");
                break;
            }

            // Short accept timeout so the loop notices the shutdown flag
            // even when no targets are connecting.
            match timeout(Duration::from_millis(200), listener.accept()).await {
                Ok(Ok((stream, peer))) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        server.handle_session(stream, peer).await;
                    });
                }
                Ok(Err(e)) => {
                    error!("accept error: {e}");
                }
                Err(_) => {
                    // Timeout; loop back to check the running flag.
                }
            }
        }

        sweep_task.abort();
        self.shutdown_all().await;
    }

    /// Terminates every open session.  Called on shutdown before the
    /// listening port is released.
    async fn shutdown_all(&self) {
        let mut conns = self.connections.lock().await;
        for (_, conn) in conns.drain() {
            let _ = conn.outbound.try_send(SessionCommand::Terminate);
        }
    }

    // ── Per-session handling ──────────────────────────────────────────────────

    async fn handle_session(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!("WebSocket handshake failed with {peer}: {e}");
                return;
            }
        };

        let connection_id = Uuid::new_v4();
        info!(%connection_id, %peer, "session opened");

        let (mut ws_sink, mut ws_rx) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<SessionCommand>(64);

        {
            let mut conns = self.connections.lock().await;
            conns.insert(
                connection_id,
                Connection {
                    id: connection_id,
                    device_id: None,
                    is_alive: true,
                    last_activity: Instant::now(),
                    outbound: out_tx.clone(),
                },
            );
        }
        self.emit(ServerEvent::SessionOpened {
            connection_id,
            peer,
        });

        // Writer loop: sole owner of the socket write half.
        let writer = async move {
            while let Some(cmd) = out_rx.recv().await {
                let result = match cmd {
                    SessionCommand::Frame(text) => ws_sink.send(WsMessage::Text(text)).await,
                    SessionCommand::Ping => ws_sink.send(WsMessage::Ping(Vec::new())).await,
                    SessionCommand::Pong(data) => ws_sink.send(WsMessage::Pong(data)).await,
                    SessionCommand::Terminate => {
                        let _ = ws_sink.send(WsMessage::Close(None)).await;
                        break;
                    }
                };
                if result.is_err() {
                    break;
                }
            }
        };

        // Reader loop: decodes frames and routes them to the handlers.
        let reader = async {
            while let Some(frame) = ws_rx.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => {
                        self.mark_alive(connection_id).await;
                        self.handle_frame(connection_id, &out_tx, &text).await;
                    }
                    Ok(WsMessage::Ping(data)) => {
                        self.mark_alive(connection_id).await;
                        let _ = out_tx.send(SessionCommand::Pong(data)).await;
                    }
                    Ok(WsMessage::Pong(_)) => {
                        self.mark_alive(connection_id).await;
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {
                        debug!(%connection_id, "non-text frame ignored");
                    }
                    Err(e) => {
                        debug!(%connection_id, "read error: {e}");
                        break;
                    }
                }
            }
        };

        tokio::select! {
            _ = writer => {}
            _ = reader => {}
        }

        // Teardown: unbind the device and drop the table entry.  The entry
        // may already be gone if the sweep or a superseding registration
        // terminated this session.
        let bound_device = {
            let mut registry = self.registry.lock().await;
            let mut conns = self.connections.lock().await;
            match conns.remove(&connection_id) {
                Some(conn) => {
                    if let Some(device_id) = &conn.device_id {
                        let _ = registry.disconnect_device(device_id);
                    }
                    conn.device_id
                }
                None => None,
            }
        };
        info!(%connection_id, device_id = ?bound_device, "session closed");
        self.emit(ServerEvent::SessionClosed { connection_id });
    }

    /// Marks a connection alive and refreshes its activity timestamp.
    async fn mark_alive(&self, connection_id: ConnectionId) {
        let mut conns = self.connections.lock().await;
        if let Some(conn) = conns.get_mut(&connection_id) {
            conn.is_alive = true;
            conn.last_activity = Instant::now();
        }
    }

    // ── Message routing ───────────────────────────────────────────────────────

    async fn handle_frame(
        &self,
        connection_id: ConnectionId,
        out_tx: &mpsc::Sender<SessionCommand>,
        text: &str,
    ) {
        let envelope = match relay_core::decode_envelope(text) {
            Ok(env) => env,
            Err(e) => {
                debug!(%connection_id, "invalid frame: {e}");
                self.send_error(out_tx, ErrorCode::InvalidMessage, &e.to_string())
                    .await;
                return;
            }
        };

        match envelope.kind {
            MessageKind::Register => {
                self.handle_register(connection_id, out_tx, &envelope).await;
            }
            MessageKind::PairingRequest => {
                self.handle_pairing_request(connection_id, out_tx, &envelope)
                    .await;
            }
            MessageKind::Heartbeat => {
                self.handle_heartbeat(connection_id, out_tx).await;
            }
            MessageKind::CommandResult => {
                self.handle_command_result(connection_id, &envelope).await;
            }
            other => {
                debug!(%connection_id, kind = %other, "unexpected message kind");
                self.send_error(
                    out_tx,
                    ErrorCode::InvalidMessage,
                    &format!("unexpected message type `{other}`"),
                )
                .await;
            }
        }
    }

    async fn handle_register(
        &self,
        connection_id: ConnectionId,
        out_tx: &mpsc::Sender<SessionCommand>,
        envelope: &Envelope,
    ) {
        if envelope.sender.device_type != DeviceType::Target {
            self.send_error(
                out_tx,
                ErrorCode::InvalidMessage,
                "only targets may register",
            )
            .await;
            return;
        }

        let payload: RegisterPayload = match envelope.payload() {
            Ok(p) => p,
            Err(e) => {
                self.send_error(out_tx, ErrorCode::InvalidMessage, &e.to_string())
                    .await;
                return;
            }
        };

        let device_id = payload.device.id.clone();
        let (record, superseded) = {
            let mut registry = self.registry.lock().await;
            let mut conns = self.connections.lock().await;

            let record = registry.register_device(payload.device);

            // A prior live session bound to this device id is forcibly
            // terminated so identity never splits across two sockets.
            let superseded = record.connection_id.filter(|prev| *prev != connection_id);
            if let Some(prev) = superseded {
                if let Some(old) = conns.remove(&prev) {
                    let _ = old.outbound.try_send(SessionCommand::Terminate);
                    warn!(device_id = %record.info.id, old_connection = %prev,
                        "superseding previous connection for re-registering device");
                }
            }

            let record = match registry.connect_device(&record.info.id, connection_id) {
                Ok(r) => r,
                Err(e) => {
                    // Unreachable in practice: the record was just upserted.
                    error!("connect_device failed after upsert: {e}");
                    return;
                }
            };
            if let Some(conn) = conns.get_mut(&connection_id) {
                conn.device_id = Some(record.info.id.clone());
            }
            (record, superseded)
        };

        if superseded.is_some() {
            debug!(device_id = %device_id, "previous connection unbound");
        }

        let reply = RegisteredPayload {
            device_id: record.info.id.clone(),
            pairing_required: !record.paired,
            pairing_token: if record.paired {
                None
            } else {
                record.pairing_token.clone()
            },
        };
        self.send_payload(out_tx, MessageKind::Registered, &reply).await;
        self.emit(ServerEvent::DeviceRegistered {
            device_id: record.info.id,
            connection_id,
        });
    }

    async fn handle_pairing_request(
        &self,
        connection_id: ConnectionId,
        out_tx: &mpsc::Sender<SessionCommand>,
        envelope: &Envelope,
    ) {
        let payload: PairingRequestPayload = match envelope.payload() {
            Ok(p) => p,
            Err(e) => {
                self.send_error(out_tx, ErrorCode::InvalidMessage, &e.to_string())
                    .await;
                return;
            }
        };

        let result = {
            let mut registry = self.registry.lock().await;
            let conns = self.connections.lock().await;
            match conns.get(&connection_id).and_then(|c| c.device_id.clone()) {
                None => Err((None, "Connection is not registered".to_string())),
                Some(device_id) => registry
                    .pair_device(&device_id, &payload.pairing_token)
                    .map_err(|e: PairError| (Some(device_id.clone()), e.to_string())),
            }
        };

        match result {
            Ok(record) => {
                let reply = PairingResponsePayload {
                    accepted: true,
                    auth_token: record.auth_token.clone(),
                    error: None,
                };
                self.send_payload(out_tx, MessageKind::PairingResponse, &reply)
                    .await;
                self.emit(ServerEvent::PairingCompleted {
                    device_id: record.info.id,
                });
            }
            Err((device_id, reason)) => {
                let reply = PairingResponsePayload {
                    accepted: false,
                    auth_token: None,
                    error: Some(reason.clone()),
                };
                self.send_payload(out_tx, MessageKind::PairingResponse, &reply)
                    .await;
                if let Some(device_id) = device_id {
                    self.emit(ServerEvent::PairingFailed { device_id, reason });
                }
            }
        }
    }

    async fn handle_heartbeat(
        &self,
        connection_id: ConnectionId,
        out_tx: &mpsc::Sender<SessionCommand>,
    ) {
        {
            let mut registry = self.registry.lock().await;
            let mut conns = self.connections.lock().await;
            if let Some(conn) = conns.get_mut(&connection_id) {
                conn.is_alive = true;
                conn.last_activity = Instant::now();
                if let Some(device_id) = &conn.device_id {
                    registry.touch(device_id);
                }
            }
        }
        self.send_payload(out_tx, MessageKind::HeartbeatAck, &serde_json::json!({}))
            .await;
    }

    async fn handle_command_result(&self, connection_id: ConnectionId, envelope: &Envelope) {
        let payload: CommandResultPayload = match envelope.payload() {
            Ok(p) => p,
            Err(e) => {
                debug!(%connection_id, "malformed command_result: {e}");
                return;
            }
        };

        let device_id = {
            let conns = self.connections.lock().await;
            conns
                .get(&connection_id)
                .and_then(|c| c.device_id.clone())
                .unwrap_or_else(|| envelope.sender.id.clone())
        };

        debug!(
            device_id = %device_id,
            command = %payload.command_type,
            success = payload.success,
            "command result received"
        );
        self.emit(ServerEvent::CommandResult {
            device_id,
            command_type: payload.command_type,
            success: payload.success,
            error: payload.error,
        });
    }

    // ── Replies ───────────────────────────────────────────────────────────────

    async fn send_payload<T: serde::Serialize>(
        &self,
        out_tx: &mpsc::Sender<SessionCommand>,
        kind: MessageKind,
        payload: &T,
    ) {
        let data = match serde_json::to_value(payload) {
            Ok(v) => v,
            Err(e) => {
                error!("failed to serialize {kind} payload: {e}");
                return;
            }
        };
        let envelope = Envelope::new(kind, self.identity(), data);
        let _ = out_tx.send(SessionCommand::Frame(envelope.encode())).await;
    }

    async fn send_error(
        &self,
        out_tx: &mpsc::Sender<SessionCommand>,
        code: ErrorCode,
        message: &str,
    ) {
        let payload = ErrorPayload {
            code,
            message: message.to_string(),
        };
        self.send_payload(out_tx, MessageKind::Error, &payload).await;
    }

    // ── Command dispatch ──────────────────────────────────────────────────────

    /// Dispatches an arrow command to a paired target.
    ///
    /// Success means the frame was queued to the session's transport buffer
    /// only; the execution outcome arrives later as a
    /// [`ServerEvent::CommandResult`] correlated by (device id, command
    /// type).  Callers must not assume more than one command of the same
    /// type in flight per device.
    ///
    /// # Errors
    ///
    /// [`DispatchError`] variants report the first failed precondition, in
    /// order: unknown device, not connected, not paired, command not
    /// advertised, no live bound connection.
    pub async fn send_arrow_command(
        &self,
        device_id: &str,
        command: CommandType,
        parameters: CommandParameters,
    ) -> Result<(), DispatchError> {
        let registry = self.registry.lock().await;
        let conns = self.connections.lock().await;

        let device = registry
            .get(device_id)
            .ok_or_else(|| DispatchError::UnknownDevice(device_id.to_string()))?;
        if !device.is_online() {
            return Err(DispatchError::NotConnected(device_id.to_string()));
        }
        if !device.paired {
            return Err(DispatchError::NotPaired(device_id.to_string()));
        }
        if !device.supports(command) {
            return Err(DispatchError::UnsupportedCommand {
                device_id: device_id.to_string(),
                command,
            });
        }
        let connection = device
            .connection_id
            .and_then(|id| conns.get(&id))
            .ok_or_else(|| DispatchError::NoLiveConnection(device_id.to_string()))?;

        let payload = CommandPayload {
            command_type: command,
            parameters,
        };
        let data = serde_json::to_value(&payload)
            .expect("command payload is plain data");
        let envelope = Envelope::new(MessageKind::Command, self.identity(), data);

        // try_send: the locks are held, so the call must not suspend.  A
        // full outbound buffer counts as no usable connection.
        connection
            .outbound
            .try_send(SessionCommand::Frame(envelope.encode()))
            .map_err(|_| DispatchError::NoLiveConnection(device_id.to_string()))?;

        debug!(device_id, command = %command, "command queued");
        Ok(())
    }

    // ── Liveness sweep ────────────────────────────────────────────────────────

    /// Runs one liveness cycle.
    ///
    /// Public for tests; production code drives it from the interval task in
    /// [`Self::run_with_listener`].
    pub async fn sweep_once(&self) {
        let mut registry = self.registry.lock().await;
        let mut conns = self.connections.lock().await;

        let dead: Vec<ConnectionId> = conns
            .values()
            .filter(|c| !c.is_alive)
            .map(|c| c.id)
            .collect();

        for id in dead {
            if let Some(conn) = conns.remove(&id) {
                warn!(connection_id = %id, device_id = ?conn.device_id,
                    idle = ?conn.last_activity.elapsed(),
                    "connection missed two liveness pings; terminating");
                let _ = conn.outbound.try_send(SessionCommand::Terminate);
                if let Some(device_id) = &conn.device_id {
                    let _ = registry.disconnect_device(device_id);
                }
                self.emit(ServerEvent::ConnectionTimedOut {
                    connection_id: id,
                    device_id: conn.device_id,
                });
            }
        }

        for conn in conns.values_mut() {
            conn.is_alive = false;
            let _ = conn.outbound.try_send(SessionCommand::Ping);
        }
    }

    // ── Test support ──────────────────────────────────────────────────────────

    /// Inserts a connection record backed by a bare channel, bypassing the
    /// WebSocket layer.  Used by integration tests to exercise dispatch and
    /// sweep logic without sockets.
    #[doc(hidden)]
    pub async fn inject_connection(
        &self,
        connection_id: ConnectionId,
        device_id: Option<String>,
    ) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(64);
        let (out_tx, mut out_rx) = mpsc::channel::<SessionCommand>(64);
        tokio::spawn(async move {
            while let Some(cmd) = out_rx.recv().await {
                let text = match cmd {
                    SessionCommand::Frame(text) => text,
                    SessionCommand::Ping => "<ping>".to_string(),
                    SessionCommand::Pong(_) => "<pong>".to_string(),
                    SessionCommand::Terminate => "<terminate>".to_string(),
                };
                if tx.send(text).await.is_err() {
                    break;
                }
            }
        });
        let mut conns = self.connections.lock().await;
        conns.insert(
            connection_id,
            Connection {
                id: connection_id,
                device_id,
                is_alive: true,
                last_activity: Instant::now(),
                outbound: out_tx,
            },
        );
        rx
    }

    /// Re-marks a connection alive, standing in for an inbound pong.  Test
    /// helper.
    #[doc(hidden)]
    pub async fn mark_alive_for_test(&self, connection_id: ConnectionId) {
        self.mark_alive(connection_id).await;
    }

    /// Returns `(exists, is_alive)` for a connection.  Test helper.
    #[doc(hidden)]
    pub async fn connection_liveness(&self, connection_id: ConnectionId) -> (bool, bool) {
        let conns = self.connections.lock().await;
        match conns.get(&connection_id) {
            Some(c) => (true, c.is_alive),
            None => (false, false),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
