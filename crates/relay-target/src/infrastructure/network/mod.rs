//! Network infrastructure for the target application.
//!
//! Handles the WebSocket control channel to the controller and dispatches
//! inbound messages to the application layer.
//!
//! Architecture:
//! - `ControlClient` owns the connection lifecycle and the reconnect
//!   schedule.
//! - Each live session splits the socket; the write half is owned by a
//!   writer task fed through an `mpsc` channel.
//! - Inbound `command` frames are executed through the injected use case
//!   and answered with `command_result`; everything else becomes a
//!   [`ClientEvent`] for the application layer.
//!
//! # Reconnect schedule
//!
//! When a session ends unexpectedly and auto-reconnect is enabled, exactly
//! one reconnect timer is pending at any time: the spawned timer's
//! `JoinHandle` is stored, and scheduling a replacement aborts the previous
//! handle first.  The delay grows as `min(base · 2^(attempt-1), cap)`; the
//! counter resets to zero whenever the transport opens, and after the
//! configured maximum the client gives up permanently with
//! [`ClientEvent::ReconnectGaveUp`].

use std::future::Future;
use std::pin::Pin;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use relay_core::{
    CommandPayload, DeviceInfo, DeviceType, Envelope, ErrorCode, ErrorPayload, MessageKind,
    PairingRequestPayload, PairingResponsePayload, RegisterPayload, RegisteredPayload, Sender,
    DEFAULT_CONTROL_PORT,
};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, error, info, warn};

use crate::application::execute_command::ExecuteCommandUseCase;

/// Errors that can occur in the client network layer.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The WebSocket connection to the controller failed.
    #[error("failed to connect to controller at {url}: {source}")]
    ConnectFailed {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },
}

/// Connection state of the control client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Paired,
}

/// Configuration for the control client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Host or IP of the controller's control channel.
    pub controller_host: String,
    /// TCP port of the controller's control channel.
    pub controller_port: u16,
    /// Identity advertised in `register`.
    pub device: DeviceInfo,
    /// Interval of the application-level heartbeat loop.
    pub heartbeat_interval: Duration,
    /// First reconnect delay; doubles per failed attempt.
    pub reconnect_base: Duration,
    /// Upper bound on the reconnect delay.
    pub reconnect_cap: Duration,
    /// Attempts before the client gives up permanently.
    pub max_reconnect_attempts: u32,
    pub auto_reconnect: bool,
    /// Echo the pairing token back immediately when `registered` asks for
    /// pairing, instead of waiting for the application layer.
    pub auto_accept_pairing: bool,
}

impl ClientConfig {
    pub fn new(controller_host: impl Into<String>, device: DeviceInfo) -> Self {
        Self {
            controller_host: controller_host.into(),
            controller_port: DEFAULT_CONTROL_PORT,
            device,
            heartbeat_interval: Duration::from_secs(10),
            reconnect_base: Duration::from_secs(1),
            reconnect_cap: Duration::from_secs(60),
            max_reconnect_attempts: 10,
            auto_reconnect: true,
            auto_accept_pairing: true,
        }
    }
}

/// Events emitted by the client to the application layer.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The transport opened and `register` was sent.
    Connected,
    /// The controller acknowledged registration.
    Registered {
        pairing_required: bool,
        pairing_token: Option<String>,
    },
    /// Pairing completed (or was never required).
    Paired { auth_token: Option<String> },
    /// The controller rejected the pairing request.
    PairingRejected { error: String },
    /// A command was executed and its result reported back.
    CommandExecuted {
        command_type: relay_core::CommandType,
        success: bool,
    },
    /// An `error` message arrived from the controller.
    ErrorReceived { code: ErrorCode, message: String },
    /// The transport closed.
    Disconnected,
    /// A reconnect attempt is scheduled.
    Reconnecting { attempt: u32, delay: Duration },
    /// The maximum attempt count was exceeded; no further attempts follow.
    ReconnectGaveUp { attempts: u32 },
}

/// Instructions delivered to a session's writer task.
#[derive(Debug)]
enum Outbound {
    Frame(String),
    Pong(Vec<u8>),
}

/// Computes the backoff delay for reconnect attempt `attempt` (1-based).
pub fn delay_for_attempt(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(31);
    let delay = base.saturating_mul(1u32 << exp);
    delay.min(cap)
}

/// Manages the WebSocket control channel from the target to the controller.
pub struct ControlClient {
    config: ClientConfig,
    use_case: Arc<ExecuteCommandUseCase>,
    state: Mutex<ClientState>,
    auth_token: Mutex<Option<String>>,
    attempt: AtomicU32,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
    event_tx: mpsc::Sender<ClientEvent>,
    running: Arc<AtomicBool>,
}

impl ControlClient {
    /// Creates a new (not yet connected) client and returns it together
    /// with the event receiver.
    pub fn new(
        config: ClientConfig,
        use_case: Arc<ExecuteCommandUseCase>,
        running: Arc<AtomicBool>,
    ) -> (Arc<Self>, mpsc::Receiver<ClientEvent>) {
        let (tx, rx) = mpsc::channel(128);
        let client = Arc::new(Self {
            config,
            use_case,
            state: Mutex::new(ClientState::Disconnected),
            auth_token: Mutex::new(None),
            attempt: AtomicU32::new(0),
            reconnect_task: Mutex::new(None),
            heartbeat_task: Mutex::new(None),
            event_tx: tx,
            running,
        });
        (client, rx)
    }

    /// Current connection state.
    pub async fn state(&self) -> ClientState {
        *self.state.lock().await
    }

    /// Auth token issued by the controller, once paired.
    pub async fn auth_token(&self) -> Option<String> {
        self.auth_token.lock().await.clone()
    }

    fn identity(&self) -> Sender {
        Sender {
            id: self.config.device.id.clone(),
            device_type: DeviceType::Target,
        }
    }

    fn control_url(&self) -> String {
        format!(
            "ws://{}:{}",
            self.config.controller_host, self.config.controller_port
        )
    }

    async fn emit(&self, event: ClientEvent) {
        if self.event_tx.send(event).await.is_err() {
            debug!("client event receiver dropped");
        }
    }

    async fn set_state(&self, state: ClientState) {
        *self.state.lock().await = state;
    }

    // ── Connection lifecycle ──────────────────────────────────────────────────

    /// Starts the first connection attempt in the background.
    pub fn start(self: Arc<Self>) {
        tokio::spawn(self.connect_cycle());
    }

    /// One full connect-session-teardown cycle.  On unexpected session end
    /// (with auto-reconnect on) it schedules the next cycle.
    ///
    /// Boxed because the reconnect timer re-enters the cycle; an `async fn`
    /// here would make the future type refer to itself.
    fn connect_cycle(self: Arc<Self>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            if !self.running.load(Ordering::Relaxed) {
                return;
            }
            self.set_state(ClientState::Connecting).await;
            let url = self.control_url();
            info!(%url, "connecting to controller");

            match connect_async(&url).await {
                Ok((ws_stream, _response)) => {
                    // Transport open: reset the backoff counter.
                    self.attempt.store(0, Ordering::Relaxed);
                    self.set_state(ClientState::Connected).await;
                    self.emit(ClientEvent::Connected).await;

                    self.run_session(ws_stream).await;

                    self.stop_heartbeat().await;
                    self.set_state(ClientState::Disconnected).await;
                    self.emit(ClientEvent::Disconnected).await;
                    info!("session with controller ended");
                }
                Err(e) => {
                    warn!(%url, "could not connect to controller: {e}");
                    self.set_state(ClientState::Disconnected).await;
                }
            }

            if self.running.load(Ordering::Relaxed) && self.config.auto_reconnect {
                self.schedule_reconnect().await;
            }
        })
    }

    /// Drives one established session until the transport closes.
    async fn run_session(
        &self,
        ws_stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) {
        let (mut ws_sink, mut ws_rx) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(64);

        // Writer task: sole owner of the socket write half.
        let writer = tokio::spawn(async move {
            while let Some(cmd) = out_rx.recv().await {
                let result = match cmd {
                    Outbound::Frame(text) => ws_sink.send(WsMessage::Text(text)).await,
                    Outbound::Pong(data) => ws_sink.send(WsMessage::Pong(data)).await,
                };
                if result.is_err() {
                    break;
                }
            }
            let _ = ws_sink.send(WsMessage::Close(None)).await;
        });

        // Register immediately, then keep the heartbeat loop running for
        // the whole session.
        self.send_register(&out_tx).await;
        self.start_heartbeat(out_tx.clone()).await;

        // Reader loop.
        while let Some(frame) = ws_rx.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => {
                    self.handle_frame(&out_tx, &text).await;
                }
                Ok(WsMessage::Ping(data)) => {
                    let _ = out_tx.send(Outbound::Pong(data)).await;
                }
                Ok(WsMessage::Pong(_)) => {}
                Ok(WsMessage::Close(_)) => {
                    debug!("controller closed the session");
                    break;
                }
                Ok(_) => {
                    debug!("non-text frame ignored");
                }
                Err(e) => {
                    debug!("read error on control channel: {e}");
                    break;
                }
            }
        }

        // The heartbeat task holds an outbound sender; it must stop before
        // the writer can drain and exit.
        self.stop_heartbeat().await;
        drop(out_tx);
        let _ = writer.await;
    }

    /// Stops the heartbeat loop synchronously so it can never write into a
    /// session that already ended.
    async fn stop_heartbeat(&self) {
        if let Some(handle) = self.heartbeat_task.lock().await.take() {
            handle.abort();
        }
    }

    async fn start_heartbeat(&self, out_tx: mpsc::Sender<Outbound>) {
        self.stop_heartbeat().await;
        let interval = self.config.heartbeat_interval;
        let identity = self.identity();
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.tick().await; // skip the immediate first tick
            loop {
                ticker.tick().await;
                let frame =
                    Envelope::new(MessageKind::Heartbeat, identity.clone(), serde_json::json!({}))
                        .encode();
                if out_tx.send(Outbound::Frame(frame)).await.is_err() {
                    break;
                }
            }
        });
        *self.heartbeat_task.lock().await = Some(handle);
    }

    /// Schedules the next reconnect attempt, replacing any pending timer.
    async fn schedule_reconnect(self: Arc<Self>) {
        let attempt = self.attempt.fetch_add(1, Ordering::Relaxed) + 1;
        if attempt > self.config.max_reconnect_attempts {
            error!(
                attempts = attempt - 1,
                "maximum reconnect attempts exceeded; giving up"
            );
            self.emit(ClientEvent::ReconnectGaveUp {
                attempts: attempt - 1,
            })
            .await;
            return;
        }

        let delay = delay_for_attempt(
            self.config.reconnect_base,
            self.config.reconnect_cap,
            attempt,
        );
        info!(attempt, ?delay, "scheduling reconnect");
        self.emit(ClientEvent::Reconnecting { attempt, delay }).await;

        let this = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            time::sleep(delay).await;
            this.connect_cycle().await;
        });

        // At most one pending timer: abort the previous one before storing
        // the replacement.
        let mut guard = self.reconnect_task.lock().await;
        if let Some(old) = guard.take() {
            old.abort();
        }
        *guard = Some(handle);
    }

    /// Cancels any pending reconnect timer.  Called on shutdown.
    pub async fn cancel_reconnect(&self) {
        if let Some(handle) = self.reconnect_task.lock().await.take() {
            handle.abort();
        }
    }

    // ── Outbound messages ─────────────────────────────────────────────────────

    async fn send_register(&self, out_tx: &mpsc::Sender<Outbound>) {
        let payload = RegisterPayload {
            device: self.config.device.clone(),
        };
        self.send_payload(out_tx, MessageKind::Register, &payload)
            .await;
    }

    async fn send_payload<T: serde::Serialize>(
        &self,
        out_tx: &mpsc::Sender<Outbound>,
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
        let _ = out_tx.send(Outbound::Frame(envelope.encode())).await;
    }

    // ── Inbound message handling ──────────────────────────────────────────────

    async fn handle_frame(&self, out_tx: &mpsc::Sender<Outbound>, text: &str) {
        let envelope = match relay_core::decode_envelope(text) {
            Ok(env) => env,
            Err(e) => {
                warn!("invalid frame from controller: {e}");
                return;
            }
        };

        match envelope.kind {
            MessageKind::Registered => {
                self.handle_registered(out_tx, &envelope).await;
            }
            MessageKind::PairingResponse => {
                self.handle_pairing_response(&envelope).await;
            }
            MessageKind::Command => {
                self.handle_command(out_tx, &envelope).await;
            }
            MessageKind::HeartbeatAck => {
                debug!("heartbeat acknowledged");
            }
            MessageKind::Error => {
                if let Ok(payload) = envelope.payload::<ErrorPayload>() {
                    warn!(code = ?payload.code, "controller error: {}", payload.message);
                    self.emit(ClientEvent::ErrorReceived {
                        code: payload.code,
                        message: payload.message,
                    })
                    .await;
                }
            }
            other => {
                debug!(kind = %other, "unexpected message kind from controller");
            }
        }
    }

    async fn handle_registered(&self, out_tx: &mpsc::Sender<Outbound>, envelope: &Envelope) {
        let payload: RegisteredPayload = match envelope.payload() {
            Ok(p) => p,
            Err(e) => {
                warn!("malformed registered payload: {e}");
                return;
            }
        };

        info!(
            device_id = %payload.device_id,
            pairing_required = payload.pairing_required,
            "registration acknowledged"
        );
        self.emit(ClientEvent::Registered {
            pairing_required: payload.pairing_required,
            pairing_token: payload.pairing_token.clone(),
        })
        .await;

        if !payload.pairing_required {
            // Already paired from a previous run.
            self.set_state(ClientState::Paired).await;
            self.emit(ClientEvent::Paired { auth_token: None }).await;
            return;
        }

        if self.config.auto_accept_pairing {
            match payload.pairing_token {
                Some(token) => {
                    let request = PairingRequestPayload {
                        pairing_token: token,
                    };
                    self.send_payload(out_tx, MessageKind::PairingRequest, &request)
                        .await;
                }
                None => {
                    warn!("pairing required but no token was issued");
                }
            }
        }
    }

    async fn handle_pairing_response(&self, envelope: &Envelope) {
        let payload: PairingResponsePayload = match envelope.payload() {
            Ok(p) => p,
            Err(e) => {
                warn!("malformed pairing_response payload: {e}");
                return;
            }
        };

        if payload.accepted {
            info!("pairing accepted by controller");
            *self.auth_token.lock().await = payload.auth_token.clone();
            self.set_state(ClientState::Paired).await;
            self.emit(ClientEvent::Paired {
                auth_token: payload.auth_token,
            })
            .await;
        } else {
            let reason = payload
                .error
                .unwrap_or_else(|| "pairing rejected".to_string());
            warn!("pairing rejected: {reason}");
            self.emit(ClientEvent::PairingRejected { error: reason }).await;
        }
    }

    async fn handle_command(&self, out_tx: &mpsc::Sender<Outbound>, envelope: &Envelope) {
        let payload: CommandPayload = match envelope.payload() {
            Ok(p) => p,
            Err(e) => {
                warn!("malformed command payload: {e}");
                let reply = ErrorPayload {
                    code: ErrorCode::InvalidCommand,
                    message: e.to_string(),
                };
                self.send_payload(out_tx, MessageKind::Error, &reply).await;
                return;
            }
        };

        // The executor may sleep through hold times, so it runs off the
        // async reader.
        let command_type = payload.command_type;
        let use_case = Arc::clone(&self.use_case);
        let result = tokio::task::spawn_blocking(move || use_case.execute(&payload))
            .await
            .unwrap_or_else(|e| {
                error!("command execution task failed: {e}");
                relay_core::CommandResultPayload {
                    command_type,
                    success: false,
                    error: Some("Internal error executing command".to_string()),
                }
            });

        self.emit(ClientEvent::CommandExecuted {
            command_type: result.command_type,
            success: result.success,
        })
        .await;
        self.send_payload(out_tx, MessageKind::CommandResult, &result)
            .await;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
