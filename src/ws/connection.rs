#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::fmt;
use std::future;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use backoff::backoff::Backoff as _;
use futures::{FutureExt as _, SinkExt as _, StreamExt as _};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior, interval_at, sleep, timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

use super::backoff::ReconnectBackoff;
use super::config::Config;
use super::endpoint;
use super::error::WsError;
use super::message::{Control, Heartbeat, Inbound, SubscribeRequest};
use super::registry::{HandlerRegistry, Registration};
use crate::Result;
use crate::auth::TokenStore;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected
    Idle,
    /// Opening a socket
    Connecting,
    /// Socket open and heartbeat running
    Open {
        /// When the connection was established
        since: Instant,
    },
    /// Waiting for the backoff timer before the next attempt
    ReconnectScheduled {
        /// Attempt number the timer will start (1-based)
        attempt: u32,
        /// Backoff delay before that attempt
        delay: Duration,
    },
    /// Closed by [`ConnectionManager::disconnect`]; stays closed until `connect` is called
    Closed,
    /// Gave up after the configured number of reconnect attempts
    Exhausted {
        /// Attempts made since the last successful open
        attempts: u32,
    },
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

/// Maintains one logical WebSocket connection with auto-reconnect, heartbeat and typed
/// dispatch to registered handlers.
///
/// The manager is a cheap handle: clones share the same connection and handler registry, so one
/// instance can be created by the application's composition root and passed to every consumer.
/// The socket lives in a background task that is recreated on [`connect`](Self::connect) after a
/// [`disconnect`](Self::disconnect) or after reconnect attempts ran out; the handler registry
/// persists across all of it. Dropping the last handle stops the background task.
///
/// Must be used from within a tokio runtime.
///
/// # Example
///
/// ```no_run
/// use trading_realtime::ws::{ConnectionManager, config::Config};
///
/// # async fn example() {
/// let config = Config::builder()
///     .url("wss://api.example.com/ws")
///     .channels(vec!["prices".to_owned()])
///     .build();
/// let manager = ConnectionManager::new(config);
///
/// let prices = manager.on("price_update", |payload| {
///     println!("price: {payload}");
/// });
/// manager.connect();
///
/// // Later...
/// prices.unsubscribe();
/// manager.disconnect().await;
/// # }
/// ```
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
    driver: Arc<Mutex<DriverSlot>>,
}

struct Shared {
    endpoint: String,
    config: Config,
    tokens: Option<TokenStore>,
    registry: Arc<HandlerRegistry>,
    state_tx: watch::Sender<ConnectionState>,
    live: RwLock<Live>,
    /// Cuts a pending backoff sleep short when `connect` is called during it.
    reconnect_now: Notify,
}

/// Which background task may publish state, and the writer of its open socket.
///
/// Every `connect` that spawns a task and every completed `disconnect` start a new generation.
/// Writes tagged with an older generation are discarded, so a task that is still winding down
/// cannot overwrite the state or socket of its successor.
#[derive(Default)]
struct Live {
    generation: u64,
    /// `None` while no socket is open.
    outbound: Option<mpsc::UnboundedSender<String>>,
}

struct Driver {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the background task; cancels it when the last manager handle goes away.
#[derive(Default)]
struct DriverSlot(Option<Driver>);

impl Drop for DriverSlot {
    fn drop(&mut self) {
        if let Some(driver) = self.0.take() {
            driver.token.cancel();
        }
    }
}

/// How an open session ended.
enum SessionEnd {
    /// `disconnect` was called
    Cancelled,
    /// The socket failed or was closed by the remote
    Lost(WsError),
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.shared.endpoint)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager for the configured endpoint. Nothing is dialed until
    /// [`connect`](Self::connect).
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::build(config, None)
    }

    /// Create a manager that appends the current access token from `tokens` to the address on
    /// every connection attempt, so reconnects pick up refreshed tokens.
    #[must_use]
    pub fn with_token_store(config: Config, tokens: TokenStore) -> Self {
        Self::build(config, Some(tokens))
    }

    fn build(config: Config, tokens: Option<TokenStore>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);

        Self {
            shared: Arc::new(Shared {
                endpoint: config.endpoint(),
                config,
                tokens,
                registry: HandlerRegistry::new(),
                state_tx,
                live: RwLock::new(Live::default()),
                reconnect_now: Notify::new(),
            }),
            driver: Arc::new(Mutex::new(DriverSlot::default())),
        }
    }

    /// Open the connection.
    ///
    /// No-op while a connection is open or being established. When a reconnect is pending its
    /// backoff wait is skipped. After [`disconnect`](Self::disconnect) or exhausted reconnect
    /// attempts a fresh connection starts with the attempt counter at zero.
    pub fn connect(&self) {
        // A poisoned slot only means a panic while swapping drivers; the slot itself is valid.
        let mut slot = self.driver.lock().unwrap_or_else(PoisonError::into_inner);

        // The task publishes `Exhausted` just before it returns.
        let gave_up = matches!(self.state(), ConnectionState::Exhausted { .. });
        if let Some(driver) = &slot.0
            && !gave_up
            && !driver.handle.is_finished()
            && !driver.token.is_cancelled()
        {
            // The permit is kept if the task has not reached its backoff wait yet.
            if matches!(self.state(), ConnectionState::ReconnectScheduled { .. }) {
                self.shared.reconnect_now.notify_one();
            }
            return;
        }

        if let Some(previous) = slot.0.take() {
            previous.token.cancel();
        }

        let generation = self.shared.begin_generation();
        let token = CancellationToken::new();
        let shared = Arc::clone(&self.shared);
        let driver_token = token.clone();
        let handle = tokio::spawn(async move {
            shared.run(driver_token, generation).await;
        });

        slot.0 = Some(Driver { token, handle });
    }

    /// Close the connection and cancel any pending reconnect or heartbeat.
    ///
    /// This is the only way to stop automatic reconnection. Returns once the background task has
    /// stopped, so no automatic connection attempt can happen afterwards. Calling it again is a
    /// no-op. A [`connect`](Self::connect) made while this call is waiting wins: its connection is
    /// left untouched.
    pub async fn disconnect(&self) {
        let driver = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .0
            .take();

        if let Some(Driver { token, handle }) = driver {
            token.cancel();
            if let Err(e) = handle.await {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, "Connection task ended abnormally");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
            }
        }

        let slot = self.driver.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.0.is_none() {
            self.shared.retire();
        }
    }

    /// Serialize `message` to JSON and send it if the socket is open.
    ///
    /// Returns `false` without sending when no socket is open or serialization fails. Messages are
    /// never queued for a later connection.
    pub fn send<T: Serialize + ?Sized>(&self, message: &T) -> bool {
        let json = match serde_json::to_string(message) {
            Ok(json) => json,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, "Unable to serialize outbound message");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                return false;
            }
        };

        self.shared.send_text(json)
    }

    /// Register a handler for messages of `msg_type`.
    ///
    /// The handler receives the message `payload`. Registering for [`WILDCARD`](super::WILDCARD)
    /// (`"*"`) instead delivers every application message as its full envelope.
    pub fn on<F>(&self, msg_type: &str, handler: F) -> Registration
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.shared.registry.on(msg_type, handler)
    }

    /// Register a handler that receives the payload deserialized as `T`.
    ///
    /// Payloads that do not deserialize into `T` are logged and skipped for this handler only.
    pub fn on_typed<T, F>(&self, msg_type: &str, handler: F) -> Registration
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let expected = msg_type.to_owned();
        self.on(msg_type, move |payload| match T::deserialize(payload) {
            Ok(value) => handler(value),
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(msg_type = %expected, error = %e, "Payload does not match handler type");
                #[cfg(not(feature = "tracing"))]
                let _ = (&expected, &e);
            }
        })
    }

    /// Register an observer invoked every time a connection opens.
    pub fn on_connect<F>(&self, handler: F) -> Registration
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.registry.on_connect(handler)
    }

    /// Register an observer invoked every time an open connection closes.
    pub fn on_disconnect<F>(&self, handler: F) -> Registration
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.registry.on_disconnect(handler)
    }

    /// Whether a socket exists and is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state().is_connected() && self.shared.has_outbound()
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// The resolved address this manager dials (without any token).
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.shared.config
    }
}

impl Shared {
    // `Live` holds no invariant a panic could break, so poisoning is recoverable.
    fn live(&self) -> RwLockReadGuard<'_, Live> {
        self.live.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn live_mut(&self) -> RwLockWriteGuard<'_, Live> {
        self.live.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    /// Hand the connection over to a new background task and return its generation.
    fn begin_generation(&self) -> u64 {
        let mut live = self.live_mut();
        live.generation = live.generation.wrapping_add(1);
        live.outbound = None;
        live.generation
    }

    /// End the current generation after `disconnect`, leaving the manager closed.
    fn retire(&self) {
        let mut live = self.live_mut();
        live.generation = live.generation.wrapping_add(1);
        live.outbound = None;
        self.set_state(ConnectionState::Closed);
    }

    /// Publish `state` unless `generation` has been superseded.
    fn publish(&self, generation: u64, state: ConnectionState) {
        let live = self.live();
        if live.generation == generation {
            self.set_state(state);
        }
    }

    fn has_outbound(&self) -> bool {
        self.live()
            .outbound
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    fn set_outbound(&self, generation: u64, tx: mpsc::UnboundedSender<String>) {
        let mut live = self.live_mut();
        if live.generation == generation {
            live.outbound = Some(tx);
        }
    }

    fn clear_outbound(&self, generation: u64) {
        let mut live = self.live_mut();
        if live.generation == generation {
            live.outbound = None;
        }
    }

    fn send_text(&self, text: String) -> bool {
        if !self.state_tx.borrow().is_connected() {
            return false;
        }

        self.live()
            .outbound
            .as_ref()
            .is_some_and(|tx| tx.send(text).is_ok())
    }

    fn dial_address(&self) -> String {
        match self.tokens.as_ref().and_then(TokenStore::access_token) {
            Some(token) => endpoint::with_token(&self.endpoint, &token),
            None => self.endpoint.clone(),
        }
    }

    /// Main connection loop with automatic reconnection.
    async fn run(self: Arc<Self>, token: CancellationToken, generation: u64) {
        let mut backoff = ReconnectBackoff::new(&self.config.reconnect);

        loop {
            self.publish(generation, ConnectionState::Connecting);

            let opened = tokio::select! {
                () = token.cancelled() => break,
                result = self.open() => result,
            };

            let had_session = match opened {
                Ok(ws_stream) => {
                    backoff.reset();
                    match self.run_session(ws_stream, &token, generation).await {
                        SessionEnd::Cancelled => {
                            self.publish(generation, ConnectionState::Closed);
                            self.registry.notify_disconnect();
                            break;
                        }
                        SessionEnd::Lost(e) => {
                            #[cfg(feature = "tracing")]
                            tracing::warn!(error = %e, "Connection lost");
                            #[cfg(not(feature = "tracing"))]
                            let _ = &e;
                            true
                        }
                    }
                }
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(endpoint = %self.endpoint, error = %e, "Unable to connect");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &e;
                    false
                }
            };

            // Drop a permit left by a `connect` that raced the previous wait.
            let _: Option<()> = self.reconnect_now.notified().now_or_never();

            let next = backoff.next_backoff();
            match next {
                Some(delay) => self.publish(
                    generation,
                    ConnectionState::ReconnectScheduled {
                        attempt: backoff.attempt(),
                        delay,
                    },
                ),
                None => self.publish(
                    generation,
                    ConnectionState::Exhausted {
                        attempts: backoff.attempt(),
                    },
                ),
            }

            if had_session {
                self.registry.notify_disconnect();
            }

            let Some(delay) = next else {
                #[cfg(feature = "tracing")]
                tracing::error!(
                    attempts = backoff.attempt(),
                    "Giving up on reconnecting; call connect() to retry"
                );
                return;
            };

            #[cfg(feature = "tracing")]
            tracing::info!(attempt = backoff.attempt(), ?delay, "Scheduling reconnect");

            tokio::select! {
                () = token.cancelled() => break,
                () = sleep(delay) => {}
                () = self.reconnect_now.notified() => {}
            }
        }

        self.publish(generation, ConnectionState::Closed);
    }

    /// Open a socket, bounded by the connect timeout when one is configured.
    async fn open(&self) -> Result<WsStream> {
        let address = self.dial_address();
        let handshake = connect_async(address.as_str());

        let (ws_stream, _) = match self.config.connect_timeout {
            Some(limit) => timeout(limit, handshake)
                .await
                .map_err(|_elapsed| WsError::ConnectTimeout(limit))??,
            None => handshake.await?,
        };

        Ok(ws_stream)
    }

    /// Drive an open socket until it is lost or `token` is cancelled.
    async fn run_session(
        &self,
        ws_stream: WsStream,
        token: &CancellationToken,
        generation: u64,
    ) -> SessionEnd {
        let (mut write, mut read) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();

        self.set_outbound(generation, outbound_tx);
        self.publish(
            generation,
            ConnectionState::Open {
                since: Instant::now(),
            },
        );

        #[cfg(feature = "tracing")]
        tracing::info!(endpoint = %self.endpoint, "Connected");

        let end = 'session: {
            if !self.config.channels.is_empty() {
                let request = SubscribeRequest::subscribe(self.config.channels.clone());
                match serde_json::to_string(&request) {
                    Ok(json) => {
                        if let Err(e) = write.send(Message::Text(json.into())).await {
                            break 'session SessionEnd::Lost(WsError::Transport(e));
                        }
                    }
                    Err(e) => {
                        #[cfg(feature = "tracing")]
                        tracing::error!(error = %e, "Unable to serialize subscribe request");
                        #[cfg(not(feature = "tracing"))]
                        let _ = &e;
                    }
                }
            }

            // A zero interval disables the heartbeat.
            let period = self.config.heartbeat_interval;
            let mut heartbeat = (!period.is_zero()).then(|| {
                let mut interval = interval_at(time::Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                interval
            });
            let mut pong_deadline: Option<time::Instant> = None;

            self.registry.notify_connect();

            loop {
                let heartbeat_tick = async {
                    match heartbeat.as_mut() {
                        Some(interval) => {
                            interval.tick().await;
                        }
                        None => future::pending::<()>().await,
                    }
                };
                let deadline = pong_deadline;
                let pong_timeout = async move {
                    match deadline {
                        Some(deadline) => time::sleep_until(deadline).await,
                        None => future::pending().await,
                    }
                };

                tokio::select! {
                    () = token.cancelled() => {
                        if let Err(e) = write.send(Message::Close(None)).await {
                            #[cfg(feature = "tracing")]
                            tracing::debug!(error = %e, "Close frame not delivered");
                            #[cfg(not(feature = "tracing"))]
                            let _ = &e;
                        }
                        break SessionEnd::Cancelled;
                    }

                    frame = read.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(Control::Pong) = self.handle_text(text.as_bytes()) {
                                pong_deadline = None;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            #[cfg(feature = "tracing")]
                            tracing::debug!(?frame, "Server closed the connection");
                            #[cfg(not(feature = "tracing"))]
                            let _ = &frame;
                            break SessionEnd::Lost(WsError::ClosedByServer);
                        }
                        Some(Ok(_)) => {
                            // Binary frames and transport-level ping/pong carry no envelopes.
                        }
                        Some(Err(e)) => {
                            #[cfg(feature = "tracing")]
                            tracing::error!(error = %e, "WebSocket error");
                            break SessionEnd::Lost(WsError::Transport(e));
                        }
                        None => break SessionEnd::Lost(WsError::ClosedByServer),
                    },

                    Some(text) = outbound_rx.recv() => {
                        if let Err(e) = write.send(Message::Text(text.into())).await {
                            break SessionEnd::Lost(WsError::Transport(e));
                        }
                    }

                    () = heartbeat_tick => {
                        let ping = match serde_json::to_string(&Heartbeat::Ping) {
                            Ok(ping) => ping,
                            Err(e) => break SessionEnd::Lost(WsError::Encode(e)),
                        };
                        if let Err(e) = write.send(Message::Text(ping.into())).await {
                            break SessionEnd::Lost(WsError::Transport(e));
                        }
                        if pong_deadline.is_none()
                            && let Some(limit) = self.config.heartbeat_timeout
                        {
                            pong_deadline = Some(time::Instant::now() + limit);
                        }
                    }

                    () = pong_timeout => {
                        let limit = self.config.heartbeat_timeout.unwrap_or_default();
                        #[cfg(feature = "tracing")]
                        tracing::warn!(?limit, "Heartbeat timeout: no pong received");
                        break SessionEnd::Lost(WsError::HeartbeatTimeout(limit));
                    }
                }
            }
        };

        // Messages still queued for this socket are dropped with it.
        self.clear_outbound(generation);

        end
    }

    /// Decode a text frame and dispatch application messages. Returns the control message, if
    /// that is what the frame carried.
    fn handle_text(&self, bytes: &[u8]) -> Option<Control> {
        match Inbound::decode(bytes) {
            Ok(Inbound::Control(control)) => {
                #[cfg(feature = "tracing")]
                tracing::trace!(?control, "Received control message");
                Some(control)
            }
            Ok(Inbound::Application(envelope)) => {
                #[cfg(feature = "tracing")]
                tracing::trace!(msg_type = ?envelope.msg_type(), "Dispatching message");
                self.registry.dispatch(&envelope);
                None
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    text = %String::from_utf8_lossy(bytes),
                    error = %e,
                    "Dropping malformed WebSocket message"
                );
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                None
            }
        }
    }
}
