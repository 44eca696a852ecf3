//! Connection session: socket lifecycle, receive loop, and reconnection.
//!
//! One background task per device owns the WebSocket exclusively. Commands
//! reach it over an `mpsc` channel carrying a one-shot reply slot; decoded
//! inbound frames are dispatched to the request tracker (solicited
//! replies) or the notification sink (pushes). On any transport failure
//! the task fails every pending request, waits a fixed interval, and
//! reconnects -- forever, until an explicit shutdown. Auth failures are
//! terminal and deliberately outside that retry loop.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{RwLock, broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::auth::{self, AuthChallenge, AuthParams};
use crate::codec::{self, DecodedMessage, RpcError, RpcRequest};
use crate::config::DeviceConfig;
use crate::error::Error;
use crate::state::{self, DeviceState, StateChange};
use crate::tracker::{RequestTracker, RpcOutcome};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

const COMMAND_CHANNEL_SIZE: usize = 32;
const CHANGE_CHANNEL_SIZE: usize = 256;

/// The status-fetch issued right after connecting, both to prime the
/// cache and to register this client for push notifications.
const STATUS_METHOD: &str = "Shelly.GetStatus";

// ── ConnectionState ──────────────────────────────────────────────────

/// Observable session state. Exactly one state at a time, published on a
/// `watch` channel so consumers see every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Reconnecting,
    /// Terminal: the device demands credentials we don't have, or
    /// rejected the ones we do. Not retried -- rebuild the session with
    /// corrected credentials.
    AuthFailed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::AuthFailed => "auth failed",
        };
        f.write_str(name)
    }
}

// ── SessionTiming ────────────────────────────────────────────────────

/// Timing knobs for the session loop.
///
/// The defaults are the device-documented values; tests shrink them to
/// keep scenarios fast.
#[derive(Debug, Clone)]
pub struct SessionTiming {
    /// Bound on one transport connect attempt.
    pub connect_timeout: Duration,

    /// Per-request timeout enforced by the sweep.
    pub request_timeout: Duration,

    /// Fixed delay between reconnect attempts. Constant, not
    /// exponential: the device is a single local peer, not a fleet.
    pub reconnect_interval: Duration,

    /// How often abandoned requests are swept.
    pub sweep_interval: Duration,

    /// WebSocket ping keepalive interval.
    pub heartbeat_interval: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            reconnect_interval: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

// ── Session handle ───────────────────────────────────────────────────

enum SessionCommand {
    Call {
        method: String,
        params: Option<Value>,
        reply: oneshot::Sender<RpcOutcome>,
    },
}

/// Handle to a running device session.
///
/// Cheaply cloneable; dropping all clones does not stop the background
/// task -- call [`shutdown`](Self::shutdown).
#[derive(Clone)]
pub struct Session {
    cmd_tx: mpsc::Sender<SessionCommand>,
    state_rx: watch::Receiver<ConnectionState>,
    change_tx: broadcast::Sender<StateChange>,
    device_state: Arc<RwLock<DeviceState>>,
    cancel: CancellationToken,
    /// Endpoint text for error reporting only.
    endpoint: Arc<str>,
}

impl Session {
    /// Spawn the session task with default timing. Returns immediately;
    /// the first connect attempt happens in the background.
    pub fn spawn(config: DeviceConfig) -> Self {
        Self::spawn_with_timing(config, SessionTiming::default())
    }

    /// Spawn with explicit timing (tests, unusual deployments).
    pub fn spawn_with_timing(config: DeviceConfig, timing: SessionTiming) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (change_tx, _) = broadcast::channel(CHANGE_CHANNEL_SIZE);
        let device_state = Arc::new(RwLock::new(DeviceState::default()));
        let cancel = CancellationToken::new();
        let endpoint: Arc<str> =
            Arc::from(format!("ws://{}:{}/rpc", config.host, config.port).as_str());

        let ctx = SessionCtx {
            config,
            timing,
            cmd_rx,
            state_tx,
            change_tx: change_tx.clone(),
            device_state: device_state.clone(),
            cancel: cancel.clone(),
        };
        tokio::spawn(session_loop(ctx));

        Self {
            cmd_tx,
            state_rx,
            change_tx,
            device_state,
            cancel,
            endpoint,
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// A receiver observing every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Subscribe to normalized state-change events, delivered in arrival
    /// order. A lagging subscriber gets `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.change_tx.subscribe()
    }

    /// Snapshot of the device state cache.
    pub async fn device_state(&self) -> DeviceState {
        self.device_state.read().await.clone()
    }

    /// Send an RPC request and await its result.
    ///
    /// Fails fast with [`Error::NotConnected`] (no bytes sent) unless the
    /// session is `Connected`; a terminal auth state yields
    /// [`Error::AuthFailed`].
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, Error> {
        match *self.state_rx.borrow() {
            ConnectionState::Connected => {}
            ConnectionState::AuthFailed => return Err(Error::AuthFailed),
            _ => return Err(Error::NotConnected),
        }

        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::Call {
                method: method.to_string(),
                params,
                reply,
            })
            .await
            .map_err(|_| Error::NotConnected)?;

        // The slot is fulfilled exactly once: response, timeout sweep,
        // or connection-wide failure. A dropped slot means the task died
        // mid-flight, equivalent to losing the connection.
        rx.await.map_err(|_| Error::ConnectionLost)?
    }

    /// Wait until the session first reaches `Connected`, bounded.
    ///
    /// Terminal auth states fail immediately; the bound expiring maps to
    /// [`Error::ConnectionFailed`].
    pub async fn wait_until_connected(&self, timeout: Duration) -> Result<(), Error> {
        let mut state_rx = self.state_rx.clone();
        let wait = async {
            loop {
                match *state_rx.borrow_and_update() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::AuthFailed => return Err(Error::AuthFailed),
                    _ => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(Error::Shutdown);
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::ConnectionFailed {
                url: self.endpoint.to_string(),
                reason: format!("not connected within {}s", timeout.as_secs()),
            })?
    }

    /// Stop the session: cancels an in-flight connect attempt and any
    /// pending reconnect timer, fails all pending requests with
    /// [`Error::Shutdown`], and settles in `Disconnected`.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

// ── Session task ─────────────────────────────────────────────────────

struct SessionCtx {
    config: DeviceConfig,
    timing: SessionTiming,
    cmd_rx: mpsc::Receiver<SessionCommand>,
    state_tx: watch::Sender<ConnectionState>,
    change_tx: broadcast::Sender<StateChange>,
    device_state: Arc<RwLock<DeviceState>>,
    cancel: CancellationToken,
}

impl SessionCtx {
    fn set_state(&self, state: ConnectionState) {
        if *self.state_tx.borrow() != state {
            tracing::debug!(%state, "connection state");
            let _ = self.state_tx.send(state);
        }
    }

    /// Merge one normalized payload into the cache atomically, then
    /// broadcast it. The session task is the only writer, so arrival
    /// order is preserved end to end.
    async fn apply_change(&self, change: StateChange) {
        {
            let mut device_state = self.device_state.write().await;
            device_state.apply(&change);
        }
        let _ = self.change_tx.send(change);
    }
}

/// Outer loop: connect → run → classify the exit.
async fn session_loop(mut ctx: SessionCtx) {
    loop {
        ctx.set_state(ConnectionState::Connecting);
        match connect_and_run(&mut ctx).await {
            // Explicit shutdown.
            Ok(()) => break,
            Err(error) if error.is_auth() => {
                tracing::error!(%error, "authentication failed, not retrying");
                ctx.set_state(ConnectionState::AuthFailed);
                serve_terminal(&mut ctx).await;
                break;
            }
            Err(error) => {
                tracing::warn!(
                    %error,
                    delay_secs = ctx.timing.reconnect_interval.as_secs(),
                    "connection lost, will reconnect"
                );
                ctx.set_state(ConnectionState::Reconnecting);
                if !wait_reconnect_interval(&mut ctx).await {
                    break;
                }
            }
        }
    }
    ctx.set_state(ConnectionState::Disconnected);
}

/// Fixed-interval reconnect delay. Commands arriving meanwhile are
/// answered `NotConnected` immediately so callers never queue up behind
/// a dead connection. Returns `false` when shut down.
async fn wait_reconnect_interval(ctx: &mut SessionCtx) -> bool {
    let sleep = tokio::time::sleep(ctx.timing.reconnect_interval);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => return false,
            () = &mut sleep => return true,
            command = ctx.cmd_rx.recv() => match command {
                Some(SessionCommand::Call { reply, .. }) => {
                    let _ = reply.send(Err(Error::NotConnected));
                }
                None => return false,
            },
        }
    }
}

/// After a terminal auth failure: keep answering commands with the
/// terminal error until shutdown. No reconnect timer runs here.
async fn serve_terminal(ctx: &mut SessionCtx) {
    loop {
        tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => return,
            command = ctx.cmd_rx.recv() => match command {
                Some(SessionCommand::Call { reply, .. }) => {
                    let _ = reply.send(Err(Error::AuthFailed));
                }
                None => return,
            },
        }
    }
}

/// One connection attempt plus its connected lifetime.
async fn connect_and_run(ctx: &mut SessionCtx) -> Result<(), Error> {
    let url = ctx.config.ws_url()?;
    tracing::debug!(url = %url, "connecting");

    let connect = tokio::time::timeout(
        ctx.timing.connect_timeout,
        tokio_tungstenite::connect_async(url.as_str()),
    );
    let ws = tokio::select! {
        biased;
        () = ctx.cancel.cancelled() => return Ok(()),
        attempt = connect => match attempt {
            Err(_) => {
                return Err(Error::ConnectionFailed {
                    url: url.to_string(),
                    reason: format!("connect timed out after {}s", ctx.timing.connect_timeout.as_secs()),
                });
            }
            Ok(Err(e)) => {
                return Err(Error::ConnectionFailed {
                    url: url.to_string(),
                    reason: e.to_string(),
                });
            }
            Ok(Ok((ws, _response))) => ws,
        },
    };

    tracing::info!(url = %url, "connected");
    let (sink, stream) = ws.split();
    run_connected(ctx, &url, sink, stream).await
}

/// Per-connection mutable state shared by the dispatch helpers.
struct ConnState {
    tracker: RequestTracker,
    /// Negotiated digest material, attached to every request once set.
    auth: Option<AuthParams>,
    /// The configured credentials were rejected once already; a second
    /// rejection is terminal.
    auth_rejected: bool,
    /// Correlation id of a request resubmitted with auth; its resolution
    /// confirms (or rejects) the negotiation.
    awaiting_auth: Option<u64>,
}

/// The connected receive loop. All exits fail the remaining pending
/// requests exactly once, with a reason matching the exit class.
async fn run_connected(
    ctx: &mut SessionCtx,
    url: &Url,
    mut sink: WsSink,
    mut stream: WsStream,
) -> Result<(), Error> {
    let mut conn = ConnState {
        tracker: RequestTracker::with_timeout(ctx.timing.request_timeout),
        auth: None,
        auth_rejected: false,
        awaiting_auth: None,
    };

    ctx.set_state(ConnectionState::Connected);

    // Prime the cache and register for pushes. The result slot is
    // dropped: the response is applied to the cache at dispatch time.
    let (id, _rx) = conn.tracker.register(STATUS_METHOD, None);
    send_request(&mut sink, &ctx.config, &conn, id, STATUS_METHOD, None).await?;

    let mut sweep = tokio::time::interval_at(
        Instant::now() + ctx.timing.sweep_interval,
        ctx.timing.sweep_interval,
    );
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut heartbeat = tokio::time::interval_at(
        Instant::now() + ctx.timing.heartbeat_interval,
        ctx.timing.heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let result = loop {
        tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => break Ok(()),

            command = ctx.cmd_rx.recv() => match command {
                Some(SessionCommand::Call { method, params, reply }) => {
                    if conn.awaiting_auth.is_some() {
                        // Mid-negotiation: fail fast rather than queue
                        // behind an exchange that may turn terminal.
                        let _ = reply.send(Err(Error::NotConnected));
                        continue;
                    }
                    let id = conn.tracker.register_with(&method, params.clone(), reply);
                    if let Err(e) = send_request(&mut sink, &ctx.config, &conn, id, &method, params).await {
                        break Err(e);
                    }
                }
                // Every handle dropped: equivalent to shutdown.
                None => break Ok(()),
            },

            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match dispatch_frame(ctx, &mut conn, &mut sink, &text).await {
                        Ok(()) => {}
                        Err(e) => break Err(e),
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!(?frame, "close frame received");
                    break Err(Error::Transport("server closed the connection".to_string()));
                }
                // Pong replies to inbound pings are handled by tungstenite.
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(Error::Transport(e.to_string())),
                None => break Err(Error::Transport("stream ended".to_string())),
            },

            _ = sweep.tick() => {
                conn.tracker.sweep(Instant::now());
                // A swept auth resubmission would otherwise leave the
                // session stuck in `Authenticating` with no way out:
                // nothing clears `awaiting_auth` and a late reply for
                // the swept id is discarded as unknown. Treat it as a
                // dead connection and reconnect.
                if let Some(id) = conn.awaiting_auth {
                    if conn.tracker.method(id).is_none() {
                        break Err(Error::Transport(
                            "auth negotiation timed out".to_string(),
                        ));
                    }
                }
            }

            _ = heartbeat.tick() => {
                if let Err(e) = sink.send(Message::Ping(Bytes::new())).await {
                    break Err(Error::Transport(e.to_string()));
                }
            }
        }
    };

    match &result {
        Ok(()) => {
            conn.tracker.fail_all(|| Error::Shutdown);
            let _ = sink.close().await;
        }
        Err(Error::AuthRequired) => {
            conn.tracker.fail_all(|| Error::AuthRequired);
            let _ = sink.close().await;
        }
        Err(Error::AuthFailed) => {
            conn.tracker.fail_all(|| Error::AuthFailed);
            let _ = sink.close().await;
        }
        Err(error) => {
            tracing::debug!(%error, url = %url, "failing pending requests");
            conn.tracker.fail_all(|| Error::ConnectionLost);
        }
    }
    result
}

/// Encode and send one request, attaching negotiated auth if present.
async fn send_request(
    sink: &mut WsSink,
    config: &DeviceConfig,
    conn: &ConnState,
    id: u64,
    method: &str,
    params: Option<Value>,
) -> Result<(), Error> {
    let mut request = RpcRequest::new(id, config.client_id.clone(), method)
        .with_auth(conn.auth.clone());
    if let Some(params) = params {
        request = request.with_params(params);
    }

    let frame = codec::encode(&request)?;
    tracing::trace!(id, method, "sending request");
    sink.send(Message::Text(frame.into()))
        .await
        .map_err(|e| Error::Transport(e.to_string()))
}

/// Decode one text frame and route it.
async fn dispatch_frame(
    ctx: &SessionCtx,
    conn: &mut ConnState,
    sink: &mut WsSink,
    text: &str,
) -> Result<(), Error> {
    match codec::decode(text) {
        DecodedMessage::Response { id, result, error } => {
            if let Some(error) = error {
                if error.is_auth_challenge() {
                    return handle_challenge(ctx, conn, sink, id, &error).await;
                }
                settle_auth_wait(ctx, conn, id);
                conn.tracker.resolve(
                    id,
                    Err(Error::Rpc {
                        code: error.code,
                        message: error.message,
                    }),
                );
                return Ok(());
            }

            let result = result.unwrap_or(Value::Null);
            // A status-fetch reply doubles as a full push: apply it to
            // the cache before the caller (if any) sees it.
            if conn.tracker.method(id) == Some(STATUS_METHOD) {
                if let Some(change) = state::normalize_status(&result) {
                    ctx.apply_change(change).await;
                }
            }
            settle_auth_wait(ctx, conn, id);
            conn.tracker.resolve(id, Ok(result));
            Ok(())
        }

        DecodedMessage::Notification { method, params } => {
            let change = match method.as_str() {
                "NotifyStatus" => state::normalize_status(&params),
                "NotifyEvent" => state::normalize_event(&params),
                other => {
                    tracing::trace!(method = other, "ignoring unknown notification");
                    None
                }
            };
            if let Some(change) = change {
                ctx.apply_change(change).await;
            }
            Ok(())
        }

        DecodedMessage::Malformed { reason } => {
            tracing::warn!(reason, "ignoring malformed frame");
            Ok(())
        }
    }
}

/// A non-challenge resolution of the resubmitted request settles the
/// auth exchange: credentials were accepted.
fn settle_auth_wait(ctx: &SessionCtx, conn: &mut ConnState, id: u64) {
    if conn.awaiting_auth == Some(id) {
        conn.awaiting_auth = None;
        conn.auth_rejected = false;
        ctx.set_state(ConnectionState::Connected);
    }
}

/// Digest auth challenge handling.
///
/// First challenge: compute a response and resubmit the original request
/// under a fresh id. A challenge while auth is already attached counts
/// as a rejection; the second consecutive rejection is terminal.
async fn handle_challenge(
    ctx: &SessionCtx,
    conn: &mut ConnState,
    sink: &mut WsSink,
    id: u64,
    error: &RpcError,
) -> Result<(), Error> {
    let Some(entry) = conn.tracker.take(id) else {
        tracing::debug!(id, "auth challenge for unknown request id, discarding");
        return Ok(());
    };

    let (Some(username), Some(password)) = (&ctx.config.username, &ctx.config.password) else {
        tracing::error!("device requires authentication, no credentials configured");
        entry.fail(Error::AuthRequired);
        return Err(Error::AuthRequired);
    };

    if conn.auth.is_some() {
        if conn.auth_rejected {
            tracing::error!("credentials rejected twice, giving up");
            entry.fail(Error::AuthFailed);
            return Err(Error::AuthFailed);
        }
        conn.auth_rejected = true;
    }

    let Some(challenge) = AuthChallenge::parse(&error.message, &ctx.config.host) else {
        // Unusable challenge payload: surface the raw error to the one
        // caller, stay connected.
        tracing::warn!(message = %error.message, "unparseable auth challenge");
        entry.fail(Error::Rpc {
            code: error.code,
            message: error.message.clone(),
        });
        return Ok(());
    };

    ctx.set_state(ConnectionState::Authenticating);
    tracing::debug!(realm = %challenge.realm, "answering auth challenge");

    conn.auth = Some(auth::respond(&challenge, username, password));

    let method = entry.method.clone();
    let params = entry.params.clone();
    let new_id = conn.tracker.resubmit(entry);
    conn.awaiting_auth = Some(new_id);
    send_request(sink, &ctx.config, conn, new_id, &method, params).await
}
