//! Session Client
//!
//! Authenticated, auto-reconnecting RPC client over one WebSocket.
//!
//! A [`SessionClient`] is a cheap handle. All session state lives in a single
//! supervisor task that processes commands and transport events strictly in
//! order:
//!
//! ```text
//!  SessionClient ──commands──▶ Supervisor ──frames──▶ writer task ──▶ socket
//!                                  ▲
//!                                  └──events── reader task ◀── socket
//!                                  └──events── signing tasks
//! ```
//!
//! Every socket gets a new epoch. Events carry the epoch they were produced
//! under and anything from an older epoch is discarded, so nothing from a
//! superseded connection leaks into the next one.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, instrument, warn};

use crate::network::auth::{self, AuthConfig, HandshakeError};
use crate::network::events::{Broadcaster, Subscription};
use crate::network::protocol::{timestamp_ms, ChallengeToken, Inbound, RpcRequest, PING};
use crate::network::session::{
    PendingRequest, PendingTable, RequestError, RequestOutcome, Status, StatusEvent, StatusSnapshot,
};
use crate::network::signer::{SignPayload, Signer};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Reconnection policy (linear backoff).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Consecutive failed attempts before giving up.
    pub max_attempts: u32,
    /// Delay unit; attempt `n` waits `n * base_delay`.
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt number `attempt` (1-based). Saturates instead of
    /// overflowing.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.checked_mul(attempt).unwrap_or(Duration::MAX)
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the remote service.
    pub url: String,
    /// Default per-request timeout.
    pub request_timeout: Duration,
    /// Bound on connecting plus the whole handshake.
    pub handshake_timeout: Duration,
    /// Keepalive period while connected. Zero disables keepalives.
    pub keepalive_interval: Duration,
    /// Reconnection policy.
    pub reconnect: ReconnectPolicy,
    /// Handshake parameters.
    pub auth: AuthConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8000/ws".to_string(),
            request_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Create config from environment variables.
    ///
    /// Durations are positive milliseconds; zero or unparsable values fall
    /// back to the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let millis = |name: &str, default: Duration| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(default)
        };

        Self {
            url: std::env::var("SESSION_URL").unwrap_or(defaults.url),
            request_timeout: millis("SESSION_REQUEST_TIMEOUT_MS", defaults.request_timeout),
            handshake_timeout: millis("SESSION_HANDSHAKE_TIMEOUT_MS", defaults.handshake_timeout),
            keepalive_interval: millis("SESSION_KEEPALIVE_MS", defaults.keepalive_interval),
            reconnect: ReconnectPolicy {
                max_attempts: std::env::var("SESSION_RECONNECT_MAX_ATTEMPTS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.reconnect.max_attempts),
                base_delay: millis("SESSION_RECONNECT_BASE_MS", defaults.reconnect.base_delay),
            },
            auth: AuthConfig::from_env(),
        }
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Socket-level failures. Each one sends the session down the reconnect path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Could not open the socket.
    #[error("connect failed: {0}")]
    Connect(String),
    /// Read or write failed.
    #[error("socket error: {0}")]
    Socket(String),
    /// The remote side closed the socket.
    #[error("closed by remote: {0}")]
    Closed(String),
}

/// Session-scoped errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// Transport failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// Handshake failure.
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),
    /// Reconnect attempts ran out.
    #[error("reconnect attempts exhausted after {attempts} tries")]
    ReconnectExhausted {
        /// Attempts made.
        attempts: u32,
    },
    /// The session was closed.
    #[error("client closed")]
    Closed,
}

// =============================================================================
// CLIENT HANDLE
// =============================================================================

/// Commands from handles to the supervisor.
enum Command {
    Connect {
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    Send {
        id: u64,
        method: String,
        frame: String,
        epoch: u64,
        timeout: Duration,
        reply: oneshot::Sender<RequestOutcome>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

struct ClientInner {
    config: ClientConfig,
    signer: Arc<dyn Signer>,
    identity: String,
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<StatusSnapshot>,
    next_id: Arc<AtomicU64>,
    messages: Broadcaster<Value>,
    statuses: Broadcaster<StatusEvent>,
}

/// Handle to one authenticated session.
///
/// Clones share the session. When the last clone is dropped the session is
/// closed as if [`SessionClient::close`] had been called.
#[derive(Clone)]
pub struct SessionClient {
    inner: Arc<ClientInner>,
}

impl SessionClient {
    /// Create a client and start its supervisor. Must be called inside a
    /// Tokio runtime. Nothing connects until [`SessionClient::connect`].
    pub fn new(config: ClientConfig, signer: Arc<dyn Signer>) -> Self {
        let identity = signer.identity().to_string();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, snapshot) = watch::channel(StatusSnapshot::default());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let next_id = Arc::new(AtomicU64::new(1));
        let messages = Broadcaster::new();
        let statuses = Broadcaster::new();

        let supervisor = Supervisor {
            config: config.clone(),
            signer: signer.clone(),
            identity: identity.clone(),
            status: Status::Disconnected,
            epoch: 0,
            attempts: 0,
            link: None,
            connecting: None,
            signing: None,
            challenge: None,
            handshake_deadline: None,
            reconnect_at: None,
            keepalive: None,
            pending: PendingTable::new(),
            waiters: Vec::new(),
            next_id: next_id.clone(),
            events_tx,
            events_rx,
            status_tx,
            messages: messages.clone(),
            statuses: statuses.clone(),
        };
        tokio::spawn(supervisor.run(commands_rx));

        Self {
            inner: Arc::new(ClientInner {
                config,
                signer,
                identity,
                commands,
                snapshot,
                next_id,
                messages,
                statuses,
            }),
        }
    }

    /// Identity the session authenticates as.
    pub fn identity(&self) -> &str {
        &self.inner.identity
    }

    /// Client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Current status.
    pub fn status(&self) -> Status {
        self.inner.snapshot.borrow().status
    }

    /// Current status, epoch and reconnect counter.
    pub fn snapshot(&self) -> StatusSnapshot {
        *self.inner.snapshot.borrow()
    }

    /// Receiver that observes every snapshot update.
    pub fn watch(&self) -> watch::Receiver<StatusSnapshot> {
        self.inner.snapshot.clone()
    }

    /// Observe unsolicited inbound messages.
    pub fn on_message<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.messages.subscribe(observer)
    }

    /// Observe status transitions.
    pub fn on_status_change<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&StatusEvent) + Send + Sync + 'static,
    {
        self.inner.statuses.subscribe(observer)
    }

    /// Connect and authenticate.
    ///
    /// Resolves once the session is connected. If a connection attempt is
    /// already in flight this joins it instead of opening a second socket.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .commands
            .send(Command::Connect { reply })
            .map_err(|_| ClientError::Closed)?;
        rx.await.unwrap_or(Err(ClientError::Closed))
    }

    /// Close the session: cancel timers and retries, fail outstanding requests.
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.inner.commands.send(Command::Close { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Send a signed request and wait for its answer.
    pub async fn send_request(&self, method: &str, params: Value) -> Result<Value, RequestError> {
        self.send_request_with_timeout(method, params, self.inner.config.request_timeout)
            .await
    }

    /// Same as [`SessionClient::send_request`] with an explicit timeout.
    pub async fn send_request_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, RequestError> {
        let snapshot = self.snapshot();
        if snapshot.status != Status::Connected {
            return Err(RequestError::NotConnected);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let request = RpcRequest::new(id, method, params);
        let frame = sign_request(self.inner.signer.as_ref(), &request).await?;

        let (reply, rx) = oneshot::channel();
        self.inner
            .commands
            .send(Command::Send {
                id,
                method: method.to_string(),
                frame,
                epoch: snapshot.epoch,
                timeout,
                reply,
            })
            .map_err(|_| RequestError::ConnectionClosed)?;

        rx.await.unwrap_or(Err(RequestError::ConnectionClosed))
    }
}

/// Sign a request with the message scheme and wrap it in its envelope.
async fn sign_request(signer: &dyn Signer, request: &RpcRequest) -> Result<String, RequestError> {
    let payload = request
        .signing_payload()
        .map_err(|e| RequestError::Encode(e.to_string()))?;
    let signature = signer.sign(&SignPayload::Message(payload)).await?;
    request
        .to_json(&[signature.into()])
        .map_err(|e| RequestError::Encode(e.to_string()))
}

// =============================================================================
// TRANSPORT
// =============================================================================

/// Events reported to the supervisor, tagged with the epoch they belong to.
enum LinkEvent {
    Opened { epoch: u64, stream: Box<WsStream> },
    OpenFailed { epoch: u64, error: TransportError },
    Frame { epoch: u64, text: String },
    Closed { epoch: u64, error: TransportError },
    VerifySigned { epoch: u64, result: Result<String, HandshakeError> },
    KeepaliveSigned { epoch: u64, result: Result<String, RequestError> },
}

impl LinkEvent {
    fn epoch(&self) -> u64 {
        match self {
            LinkEvent::Opened { epoch, .. }
            | LinkEvent::OpenFailed { epoch, .. }
            | LinkEvent::Frame { epoch, .. }
            | LinkEvent::Closed { epoch, .. }
            | LinkEvent::VerifySigned { epoch, .. }
            | LinkEvent::KeepaliveSigned { epoch, .. } => *epoch,
        }
    }
}

/// One open socket: a reader task and a writer task.
struct Link {
    outbound: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
}

impl Link {
    fn open(epoch: u64, stream: WsStream, events: mpsc::UnboundedSender<LinkEvent>) -> Self {
        let (mut sink, mut source) = stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        // Spawn writer task
        let writer_events = events.clone();
        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = sink.send(msg).await {
                    let _ = writer_events.send(LinkEvent::Closed {
                        epoch,
                        error: TransportError::Socket(e.to_string()),
                    });
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        // Spawn reader task
        let reader = tokio::spawn(async move {
            let error = loop {
                match source.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if events.send(LinkEvent::Frame { epoch, text }).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => {
                            if events.send(LinkEvent::Frame { epoch, text }).is_err() {
                                return;
                            }
                        }
                        Err(_) => debug!("Dropping non UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                        break TransportError::Closed(reason);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break TransportError::Socket(e.to_string()),
                    None => break TransportError::Closed("stream ended".to_string()),
                }
            };
            let _ = events.send(LinkEvent::Closed { epoch, error });
        });

        Self { outbound, reader }
    }

    fn send(&self, text: String) -> bool {
        self.outbound.send(Message::Text(text)).is_ok()
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        // Writer drains the close frame, then exits once the channel is gone.
        let _ = self.outbound.send(Message::Close(None));
        self.reader.abort();
    }
}

// =============================================================================
// SUPERVISOR
// =============================================================================

/// Owns the session. Runs as one task per client.
struct Supervisor {
    config: ClientConfig,
    signer: Arc<dyn Signer>,
    identity: String,
    status: Status,
    epoch: u64,
    attempts: u32,
    link: Option<Link>,
    connecting: Option<JoinHandle<()>>,
    signing: Option<JoinHandle<()>>,
    challenge: Option<ChallengeToken>,
    handshake_deadline: Option<Instant>,
    reconnect_at: Option<Instant>,
    keepalive: Option<Interval>,
    pending: PendingTable,
    waiters: Vec<oneshot::Sender<Result<(), ClientError>>>,
    next_id: Arc<AtomicU64>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    events_rx: mpsc::UnboundedReceiver<LinkEvent>,
    status_tx: watch::Sender<StatusSnapshot>,
    messages: Broadcaster<Value>,
    statuses: Broadcaster<StatusEvent>,
}

impl Supervisor {
    #[instrument(skip_all, fields(identity = %self.identity, url = %self.config.url))]
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let request_deadline = self.pending.next_deadline();

            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All client handles dropped, shutting down session");
                        self.close_session();
                        break;
                    }
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                _ = sleep_until_opt(self.handshake_deadline) => self.on_handshake_timeout(),
                _ = sleep_until_opt(self.reconnect_at) => self.on_reconnect_due(),
                _ = sleep_until_opt(request_deadline) => {
                    let expired = self.pending.expire(Instant::now());
                    debug!("{} request(s) timed out", expired);
                }
                _ = tick_opt(&mut self.keepalive) => self.on_keepalive_tick(),
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { reply } => match self.status {
                Status::Connected => {
                    let _ = reply.send(Ok(()));
                }
                Status::Connecting | Status::Authenticating | Status::Reconnecting => {
                    self.waiters.push(reply);
                }
                Status::Disconnected | Status::AuthFailed | Status::ReconnectFailed => {
                    self.waiters.push(reply);
                    self.attempts = 0;
                    self.reconnect_at = None;
                    self.open_transport();
                }
            },
            Command::Send { id, method, frame, epoch, timeout, reply } => {
                if self.status != Status::Connected || epoch != self.epoch {
                    // Signed against a session that was closed meanwhile.
                    let error = if self.status == Status::Disconnected && epoch < self.epoch {
                        RequestError::ConnectionClosed
                    } else {
                        RequestError::NotConnected
                    };
                    let _ = reply.send(Err(error));
                    return;
                }
                let sent = self.link.as_ref().map(|link| link.send(frame)).unwrap_or(false);
                if !sent {
                    let _ = reply.send(Err(RequestError::ConnectionLost));
                    return;
                }
                debug!("Request {} ({}) sent", id, method);
                self.pending.insert(PendingRequest {
                    id,
                    method,
                    deadline: deadline_after(timeout),
                    timeout,
                    reply,
                });
            }
            Command::Close { reply } => {
                self.close_session();
                let _ = reply.send(());
            }
        }
    }

    fn handle_event(&mut self, event: LinkEvent) {
        if event.epoch() != self.epoch {
            debug!("Dropping event from superseded connection {}", event.epoch());
            return;
        }

        match event {
            LinkEvent::Opened { stream, .. } => self.on_opened(*stream),
            LinkEvent::OpenFailed { error, .. } => {
                self.connecting = None;
                self.on_transport_lost(error);
            }
            LinkEvent::Frame { text, .. } => match Inbound::parse(&text) {
                Ok(inbound) => self.route(inbound),
                Err(e) => warn!("Dropping malformed frame: {}", e),
            },
            LinkEvent::Closed { error, .. } => self.on_transport_lost(error),
            LinkEvent::VerifySigned { result, .. } => {
                self.signing = None;
                if self.status != Status::Authenticating {
                    return;
                }
                match result {
                    Ok(frame) => {
                        if let Some(link) = &self.link {
                            link.send(frame);
                        }
                    }
                    Err(e) => self.fail_handshake(e),
                }
            }
            LinkEvent::KeepaliveSigned { result, .. } => {
                if self.status != Status::Connected {
                    return;
                }
                match result {
                    Ok(frame) => {
                        let sent = self.link.as_ref().map(|link| link.send(frame)).unwrap_or(false);
                        if !sent {
                            warn!("Keepalive could not be queued");
                        }
                    }
                    Err(e) => warn!("Keepalive signing failed: {}", e),
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Transport lifecycle
    // -------------------------------------------------------------------------

    fn open_transport(&mut self) {
        self.epoch += 1;
        let epoch = self.epoch;
        let url = self.config.url.clone();
        let events = self.events_tx.clone();

        info!("Connecting to {} (epoch {})", url, epoch);
        self.connecting = Some(tokio::spawn(async move {
            let event = match connect_async(url.as_str()).await {
                Ok((stream, _response)) => LinkEvent::Opened {
                    epoch,
                    stream: Box::new(stream),
                },
                Err(e) => LinkEvent::OpenFailed {
                    epoch,
                    error: TransportError::Connect(e.to_string()),
                },
            };
            let _ = events.send(event);
        }));
        // One budget covers opening the socket and the whole handshake.
        self.handshake_deadline = Some(deadline_after(self.config.handshake_timeout));
        self.set_status(Status::Connecting);
    }

    fn on_opened(&mut self, stream: WsStream) {
        self.connecting = None;
        if self.status != Status::Connecting {
            return;
        }

        self.link = Some(Link::open(self.epoch, stream, self.events_tx.clone()));
        self.set_status(Status::Authenticating);

        // Handshake frames are not correlated; their id is the send time.
        match auth::auth_request(timestamp_ms(), &self.config.auth, &self.identity) {
            Ok(frame) => {
                if let Some(link) = &self.link {
                    link.send(frame);
                }
            }
            Err(e) => self.fail_handshake(e),
        }
    }

    /// Drop everything tied to the current socket.
    fn teardown(&mut self, pending_error: RequestError) {
        self.keepalive = None;
        self.handshake_deadline = None;
        self.challenge = None;
        if let Some(task) = self.connecting.take() {
            task.abort();
        }
        if let Some(task) = self.signing.take() {
            task.abort();
        }
        self.link = None;
        self.epoch += 1;

        let failed = self.pending.fail_all(pending_error);
        if failed > 0 {
            debug!("Failed {} outstanding request(s)", failed);
        }
    }

    fn on_transport_lost(&mut self, error: TransportError) {
        if matches!(self.status, Status::Disconnected | Status::ReconnectFailed) {
            return;
        }
        warn!("Transport lost while {}: {}", self.status, error);
        self.teardown(RequestError::ConnectionLost);
        self.resolve_waiters(Err(ClientError::Transport(error)));
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        let policy = self.config.reconnect;
        if self.attempts >= policy.max_attempts {
            error!("Giving up after {} reconnect attempts", self.attempts);
            self.reconnect_at = None;
            self.resolve_waiters(Err(ClientError::ReconnectExhausted { attempts: self.attempts }));
            self.set_status(Status::ReconnectFailed);
            return;
        }

        self.attempts += 1;
        let delay = policy.delay_for(self.attempts);
        info!("Reconnect attempt {} in {:?}", self.attempts, delay);
        self.reconnect_at = Some(deadline_after(delay));
        self.set_status(Status::Reconnecting);
    }

    fn on_reconnect_due(&mut self) {
        self.reconnect_at = None;
        if self.status == Status::Reconnecting {
            self.open_transport();
        }
    }

    fn close_session(&mut self) {
        self.reconnect_at = None;
        self.teardown(RequestError::ConnectionClosed);
        self.resolve_waiters(Err(ClientError::Closed));
        self.set_status(Status::Disconnected);
    }

    // -------------------------------------------------------------------------
    // Handshake
    // -------------------------------------------------------------------------

    fn on_challenge(&mut self, payload: Value) {
        if self.status != Status::Authenticating {
            debug!("Ignoring challenge while {}", self.status);
            return;
        }

        let token = match ChallengeToken::parse(&payload) {
            Ok(token) => token,
            Err(e) => {
                self.fail_handshake(e.into());
                return;
            }
        };
        debug!("Challenge received, signing verification");
        self.challenge = Some(token.clone());

        let signer = self.signer.clone();
        let auth_config = self.config.auth.clone();
        let events = self.events_tx.clone();
        let epoch = self.epoch;
        if let Some(previous) = self.signing.take() {
            previous.abort();
        }
        self.signing = Some(tokio::spawn(async move {
            let result = auth::auth_verify(timestamp_ms(), &auth_config, signer.as_ref(), &token).await;
            let _ = events.send(LinkEvent::VerifySigned { epoch, result });
        }));
    }

    fn on_auth_verify(&mut self, payload: Value) {
        if self.status != Status::Authenticating {
            debug!("Ignoring auth_verify while {}", self.status);
            return;
        }
        match auth::verify_outcome(&payload) {
            Ok(()) => self.on_authenticated(),
            Err(e) => self.fail_handshake(e),
        }
    }

    fn on_authenticated(&mut self) {
        self.handshake_deadline = None;
        self.challenge = None;
        self.attempts = 0;

        let period = self.config.keepalive_interval.min(FAR_FUTURE);
        self.keepalive = if period.is_zero() {
            debug!("Keepalive disabled");
            None
        } else {
            let mut keepalive = interval_at(deadline_after(period), period);
            keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
            Some(keepalive)
        };

        info!("Authenticated as {}", self.identity);
        self.set_status(Status::Connected);
        self.resolve_waiters(Ok(()));
    }

    fn fail_handshake(&mut self, error: HandshakeError) {
        warn!("Handshake failed: {}", error);
        self.handshake_deadline = None;
        self.challenge = None;
        self.set_status(Status::AuthFailed);
        self.resolve_waiters(Err(ClientError::Handshake(error)));

        self.teardown(RequestError::ConnectionLost);
        self.schedule_reconnect();
    }

    fn on_handshake_timeout(&mut self) {
        self.handshake_deadline = None;
        let limit = self.config.handshake_timeout;
        match self.status {
            Status::Connecting => {
                self.on_transport_lost(TransportError::Connect(format!("timed out after {:?}", limit)))
            }
            Status::Authenticating => self.fail_handshake(HandshakeError::Timeout(limit)),
            _ => {}
        }
    }

    // -------------------------------------------------------------------------
    // Traffic
    // -------------------------------------------------------------------------

    fn route(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Challenge(payload) => self.on_challenge(payload),
            Inbound::AuthVerify(payload) => self.on_auth_verify(payload),
            Inbound::Response(response) => {
                if !self.pending.settle(response.id, Ok(response.payload)) {
                    debug!("Dropping response for untracked request {}", response.id);
                }
            }
            Inbound::Error(err) => {
                if self.status == Status::Authenticating && !self.pending.contains(err.id) {
                    self.fail_handshake(HandshakeError::Rejected(format!("{} (code {})", err.message, err.code)));
                    return;
                }
                let outcome = Err(RequestError::Rejected {
                    code: err.code,
                    message: err.message,
                });
                if !self.pending.settle(err.id, outcome) {
                    debug!("Dropping error for untracked request {}", err.id);
                }
            }
            Inbound::Notification(value) => self.messages.publish(&value),
        }
    }

    fn on_keepalive_tick(&mut self) {
        if self.status != Status::Connected {
            return;
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let signer = self.signer.clone();
        let events = self.events_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let request = RpcRequest::new(id, PING, json!([]));
            let result = sign_request(signer.as_ref(), &request).await;
            let _ = events.send(LinkEvent::KeepaliveSigned { epoch, result });
        });
    }

    // -------------------------------------------------------------------------
    // Status
    // -------------------------------------------------------------------------

    fn set_status(&mut self, status: Status) {
        let changed = self.status != status;
        self.status = status;
        self.status_tx.send_replace(StatusSnapshot {
            status,
            epoch: self.epoch,
            reconnect_attempts: self.attempts,
        });

        if changed {
            info!("Session status: {}", status);
            self.statuses.publish(&StatusEvent::now(status));
        }
    }

    fn resolve_waiters(&mut self, result: Result<(), ClientError>) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }
}

/// Roughly 30 years; stands in for "never" when a duration overflows `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + after`, clamped so huge durations cannot overflow.
fn deadline_after(after: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(after.min(FAR_FUTURE)).unwrap_or(now)
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => future::pending().await,
    }
}

async fn tick_opt(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending().await,
    }
}
