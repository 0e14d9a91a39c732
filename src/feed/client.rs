// =============================================================================
// Feed Client — persistent WebSocket connection to the upstream broker feed
// =============================================================================
//
// One full-duplex connection: authenticate, replay the subscription set,
// stream ticks, answer heartbeats. A supervisor task owns the connection and
// walks the state machine
//
//   Disconnected → Connecting → Authenticating → Live
//                      ↑                           |
//                      └──── Reconnecting ←────────┘  (transport error,
//                                                      auth failure,
//                                                      heartbeat timeout)
//
// Reconnect delay grows as base · 2^attempt, capped by a maximum attempt
// count; exhaustion is terminal and surfaces by closing the tick stream.
// The subscription set survives reconnects and is replayed after every
// successful authentication, before any feed frame is consumed.
// =============================================================================

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::errors::CoreError;
use crate::feed::protocol::{
    auth_frame, heartbeat_frame, parse_inbound, subscribe_frame, unsubscribe_frame, Inbound,
};
use crate::runtime_config::FeedSettings;
use crate::types::{SubscriptionKey, Tick};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Capacity of the outbound tick channel. Beyond this depth the socket read
/// suspends until the consumer catches up.
const TICK_CHANNEL_CAPACITY: usize = 10_000;

// =============================================================================
// Connection state machine
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Live,
    Reconnecting,
    ShuttingDown,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Authenticating => write!(f, "Authenticating"),
            Self::Live => write!(f, "Live"),
            Self::Reconnecting => write!(f, "Reconnecting"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
        }
    }
}

/// Commands handled by the connection supervisor.
enum FeedCommand {
    Subscribe(SubscriptionKey),
    Unsubscribe(SubscriptionKey),
    Shutdown,
}

/// Why a live session ended.
enum SessionEnd {
    Transport(String),
    Shutdown,
}

/// Why a connection attempt failed before going live.
enum OpenFailure {
    Shutdown,
    Failed(CoreError),
}

/// Reconnect delay for a 1-based attempt counter: base, 2·base, 4·base, ...
/// The shift is clamped so a pathological attempt count cannot overflow.
fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(10);
    Duration::from_millis(base_ms.saturating_mul(1u64 << shift))
}

// =============================================================================
// FeedClient
// =============================================================================

/// Client for the upstream broker feed.
///
/// `subscribe` / `unsubscribe` update the subscription set unconditionally;
/// frames are transmitted when the connection is live and the full set is
/// replayed after every reconnect. `ticks()` hands out the tick stream
/// receiver (once). `shutdown()` is cooperative and stops reconnecting.
pub struct FeedClient {
    settings: FeedSettings,
    state: RwLock<ConnectionState>,
    subscriptions: RwLock<BTreeSet<SubscriptionKey>>,
    command_tx: mpsc::UnboundedSender<FeedCommand>,
    command_rx: Mutex<Option<mpsc::UnboundedReceiver<FeedCommand>>>,
    tick_tx: Mutex<Option<mpsc::Sender<Tick>>>,
    tick_rx: Mutex<Option<mpsc::Receiver<Tick>>>,
    shutdown_tx: watch::Sender<bool>,
    running: AtomicBool,
    parse_failures: AtomicU64,
    frames_received: AtomicU64,
}

impl FeedClient {
    pub fn new(settings: FeedSettings) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (tick_tx, tick_rx) = mpsc::channel(TICK_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            settings,
            state: RwLock::new(ConnectionState::Disconnected),
            subscriptions: RwLock::new(BTreeSet::new()),
            command_tx,
            command_rx: Mutex::new(Some(command_rx)),
            tick_tx: Mutex::new(Some(tick_tx)),
            tick_rx: Mutex::new(Some(tick_rx)),
            shutdown_tx,
            running: AtomicBool::new(false),
            parse_failures: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
        }
    }

    // ── Public interface ────────────────────────────────────────────────

    /// Start the connection supervisor and wait for the first successful
    /// authentication. Idempotent: returns Ok immediately when already
    /// connected or connecting.
    pub async fn connect(self: &Arc<Self>) -> Result<(), CoreError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let client = Arc::clone(self);
        tokio::spawn(async move {
            client.supervise(ready_tx).await;
        });

        match ready_rx.await {
            Ok(result) => result,
            Err(_) => Err(CoreError::FeedTransport(
                "feed supervisor exited unexpectedly".into(),
            )),
        }
    }

    /// Record a subscription and transmit it when live. Deferred
    /// subscriptions are replayed after the next successful auth.
    pub fn subscribe(&self, key: SubscriptionKey) {
        let inserted = self.subscriptions.write().insert(key.clone());
        if !inserted {
            return;
        }
        debug!(key = %key, "subscription recorded");
        if self.state() == ConnectionState::Live {
            let _ = self.command_tx.send(FeedCommand::Subscribe(key));
        }
    }

    /// Remove a subscription and transmit the unsubscribe when live.
    pub fn unsubscribe(&self, key: &SubscriptionKey) {
        let removed = self.subscriptions.write().remove(key);
        if !removed {
            return;
        }
        debug!(key = %key, "subscription removed");
        if self.state() == ConnectionState::Live {
            let _ = self.command_tx.send(FeedCommand::Unsubscribe(key.clone()));
        }
    }

    /// Take the tick stream receiver. Yields parsed ticks in arrival order;
    /// the stream closes when the client stops (shutdown or terminal
    /// reconnect failure). Returns `None` after the first call.
    pub fn ticks(&self) -> Option<mpsc::Receiver<Tick>> {
        self.tick_rx.lock().take()
    }

    /// Cooperative shutdown: close the connection, stop reconnecting.
    pub fn shutdown(&self) {
        info!("feed client shutdown requested");
        self.set_state(ConnectionState::ShuttingDown);
        // send_replace updates the flag even before the supervisor has
        // subscribed.
        self.shutdown_tx.send_replace(true);
        let _ = self.command_tx.send(FeedCommand::Shutdown);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Live
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionKey> {
        self.subscriptions.read().iter().cloned().collect()
    }

    /// Malformed inbound frames counted and discarded so far.
    pub fn parse_failures(&self) -> u64 {
        self.parse_failures.load(Ordering::Relaxed)
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    // ── Supervisor ──────────────────────────────────────────────────────

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.write();
        if *state != next {
            debug!(from = %*state, to = %next, "feed connection state transition");
            *state = next;
        }
    }

    async fn supervise(self: Arc<Self>, ready: oneshot::Sender<Result<(), CoreError>>) {
        let mut command_rx = self
            .command_rx
            .lock()
            .take()
            .expect("feed supervisor started twice");
        let tick_tx = self
            .tick_tx
            .lock()
            .take()
            .expect("feed supervisor started twice");
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ready = Some(ready);
        let mut attempt: u32 = 0;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let session_id = Uuid::new_v4();
            self.set_state(ConnectionState::Connecting);

            match self.open_and_auth(session_id, &mut command_rx).await {
                Ok((write, read)) => {
                    attempt = 0;
                    self.set_state(ConnectionState::Live);
                    info!(session = %session_id, "feed connection live");
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Ok(()));
                    }

                    match self
                        .run_session(session_id, write, read, &mut command_rx, &tick_tx, &mut shutdown_rx)
                        .await
                    {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Transport(reason) => {
                            warn!(session = %session_id, reason = %reason, "feed session ended");
                        }
                    }
                }
                Err(OpenFailure::Shutdown) => break,
                Err(OpenFailure::Failed(err)) => {
                    warn!(session = %session_id, error = %err, "feed connection attempt failed");
                }
            }

            attempt += 1;
            if attempt > self.settings.reconnect_max_attempts {
                error!(
                    attempts = attempt - 1,
                    "reconnect attempts exhausted — feed client stopping"
                );
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Err(CoreError::FeedTransport(
                        "reconnect attempts exhausted".into(),
                    )));
                }
                break;
            }

            self.set_state(ConnectionState::Reconnecting);
            let delay = backoff_delay(self.settings.reconnect_base_delay_ms, attempt);
            info!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.changed() => break,
            }
        }

        self.set_state(ConnectionState::Disconnected);
        if let Some(tx) = ready.take() {
            let _ = tx.send(Err(CoreError::Cancelled));
        }
        info!("feed supervisor stopped");
        // tick_tx drops here, closing the tick stream for downstream
        // consumers.
    }

    /// Open the socket, authenticate, and replay the subscription set.
    async fn open_and_auth(
        &self,
        session_id: Uuid,
        command_rx: &mut mpsc::UnboundedReceiver<FeedCommand>,
    ) -> Result<(WsSink, WsSource), OpenFailure> {
        let connect_timeout = Duration::from_secs(self.settings.connect_timeout_secs);
        let auth_timeout = Duration::from_secs(self.settings.auth_timeout_secs);

        let ws = match timeout(connect_timeout, connect_async(self.settings.url.as_str())).await {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => {
                return Err(OpenFailure::Failed(CoreError::FeedTransport(e.to_string())))
            }
            Err(_) => {
                return Err(OpenFailure::Failed(CoreError::FeedTransport(
                    "connect timed out".into(),
                )))
            }
        };

        self.set_state(ConnectionState::Authenticating);
        let (mut write, mut read) = ws.split();

        let frame = auth_frame(
            &self.settings.bearer_token,
            &self.settings.client_id,
            &self.settings.feed_token,
        );
        if let Err(e) = write.send(Message::Text(frame)).await {
            return Err(OpenFailure::Failed(CoreError::FeedTransport(format!(
                "auth send failed: {e}"
            ))));
        }

        let ack = timeout(auth_timeout, Self::await_auth_ack(&mut read)).await;
        match ack {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(OpenFailure::Failed(err)),
            Err(_) => {
                return Err(OpenFailure::Failed(CoreError::FeedAuth(
                    "auth response timed out".into(),
                )))
            }
        }

        // Commands queued while offline are superseded by the subscription
        // set about to be replayed; drain them so nothing is sent twice.
        loop {
            match command_rx.try_recv() {
                Ok(FeedCommand::Shutdown) => return Err(OpenFailure::Shutdown),
                Ok(_) => continue,
                Err(_) => break,
            }
        }

        let keys: Vec<SubscriptionKey> = self.subscriptions.read().iter().cloned().collect();
        for key in &keys {
            if let Err(e) = write.send(Message::Text(subscribe_frame(key))).await {
                return Err(OpenFailure::Failed(CoreError::FeedTransport(format!(
                    "subscription replay failed at {key}: {e}"
                ))));
            }
        }
        if !keys.is_empty() {
            info!(session = %session_id, replayed = keys.len(), "subscription set replayed");
        }

        Ok((write, read))
    }

    /// Read frames until an auth acknowledgement arrives. Heartbeats and
    /// unrelated frames received before the ack are skipped.
    async fn await_auth_ack(read: &mut WsSource) -> Result<(), CoreError> {
        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => match parse_inbound(&text) {
                    Ok(Inbound::AuthAck { ok: true, .. }) => return Ok(()),
                    Ok(Inbound::AuthAck { ok: false, message }) => {
                        return Err(CoreError::FeedAuth(
                            message.unwrap_or_else(|| "authentication rejected".into()),
                        ))
                    }
                    Ok(Inbound::Error { code, message }) => {
                        return Err(CoreError::FeedAuth(format!("error {code}: {message}")))
                    }
                    Ok(_) | Err(_) => continue,
                },
                Some(Ok(Message::Close(_))) | None => {
                    return Err(CoreError::FeedTransport(
                        "connection closed during authentication".into(),
                    ))
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(CoreError::FeedTransport(e.to_string())),
            }
        }
    }

    /// The live session loop: pump inbound frames into the tick stream,
    /// transmit subscription commands, send heartbeats, and watch for the
    /// heartbeat timeout.
    async fn run_session(
        &self,
        session_id: Uuid,
        mut write: WsSink,
        mut read: WsSource,
        command_rx: &mut mpsc::UnboundedReceiver<FeedCommand>,
        tick_tx: &mpsc::Sender<Tick>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let mut heartbeat = interval(Duration::from_secs(self.settings.heartbeat_interval_secs));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let heartbeat_timeout = Duration::from_secs(self.settings.heartbeat_timeout_secs);
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_inbound = Instant::now();
                        self.frames_received.fetch_add(1, Ordering::Relaxed);
                        match parse_inbound(&text) {
                            Ok(Inbound::Feed(raw)) => {
                                let tick = raw.into_tick(&self.settings.source_tag, "", Utc::now());
                                if tick_tx.send(tick).await.is_err() {
                                    debug!(session = %session_id, "tick receiver dropped — discarding feed frames");
                                }
                            }
                            Ok(Inbound::Heartbeat) => {}
                            Ok(Inbound::AuthAck { .. }) => {}
                            Ok(Inbound::Error { code, message }) => {
                                warn!(session = %session_id, code, message = %message, "feed error frame");
                            }
                            Err(e) => {
                                self.parse_failures.fetch_add(1, Ordering::Relaxed);
                                debug!(session = %session_id, error = %e, "dropping malformed frame");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        last_inbound = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) => {
                        return SessionEnd::Transport("closed by peer".into());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::Transport(e.to_string()),
                    None => return SessionEnd::Transport("stream ended".into()),
                },

                cmd = command_rx.recv() => match cmd {
                    Some(FeedCommand::Subscribe(key)) => {
                        if let Err(e) = write.send(Message::Text(subscribe_frame(&key))).await {
                            return SessionEnd::Transport(format!("subscribe send failed: {e}"));
                        }
                        debug!(session = %session_id, key = %key, "subscribe frame sent");
                    }
                    Some(FeedCommand::Unsubscribe(key)) => {
                        if let Err(e) = write.send(Message::Text(unsubscribe_frame(&key))).await {
                            return SessionEnd::Transport(format!("unsubscribe send failed: {e}"));
                        }
                        debug!(session = %session_id, key = %key, "unsubscribe frame sent");
                    }
                    Some(FeedCommand::Shutdown) | None => {
                        let _ = write.send(Message::Close(None)).await;
                        return SessionEnd::Shutdown;
                    }
                },

                _ = heartbeat.tick() => {
                    if last_inbound.elapsed() > heartbeat_timeout {
                        return SessionEnd::Transport("heartbeat timeout".into());
                    }
                    if let Err(e) = write.send(Message::Text(heartbeat_frame())).await {
                        return SessionEnd::Transport(format!("heartbeat send failed: {e}"));
                    }
                }

                _ = shutdown_rx.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
            }
        }
    }
}
