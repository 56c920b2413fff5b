// src/connection/manager.rs
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::TcpStream;
use tokio::sync::{RwLock, mpsc, watch};
use tokio::time::{Duration, Instant, timeout};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::backoff::BackoffScheduler;
use super::recovery::RecoveryClient;
use super::sequence::{ConnectionSession, ReplayWindow, merge_replay};
use super::subscription::{
    EventFilter, Subscription, SubscriptionId, SubscriptionRegistry,
};
use crate::config::Settings;
use crate::error::ChannelError;
use crate::message::Message;

/// Connection lifecycle states, published through the status watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Reconnection gave up. Terminal until `reconnect_now()` or an
    /// explicit disconnect/connect cycle.
    Error,
}

// Commands that can be sent to the channel manager
#[derive(Debug)]
enum ManagerCommand {
    Connect,
    Disconnect,
    ReconnectNow,
    Shutdown,
}

// Events from the transport reader task and the gap-recovery fetch, tagged
// with the transport generation so events from retired transports are
// discarded.
#[derive(Debug)]
enum StreamEvent {
    Frame {
        generation: u64,
        message: Message,
    },
    PingReceived {
        generation: u64,
        payload: Vec<u8>,
    },
    ConnectionClosed {
        generation: u64,
    },
    ConnectionError {
        generation: u64,
        reason: String,
    },
    RecoveryFetched {
        generation: u64,
        outcome: Result<Vec<Message>, ChannelError>,
    },
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Realtime ordered-message channel.
///
/// Keeps one WebSocket session open to the update server, delivers parsed
/// frames to registered consumers in sequence order, and recovers missed
/// messages through the replay endpoint after an outage. All lifecycle
/// state lives in a spawned manager task; the public methods send commands
/// to it, so every transition is serialized.
pub struct ChannelManager {
    command_tx: mpsc::Sender<ManagerCommand>,
    status_rx: watch::Receiver<ConnectionState>,
    session: Arc<RwLock<Option<ConnectionSession>>>,
    subscriptions: Arc<RwLock<SubscriptionRegistry>>,
}

impl ChannelManager {
    /// Create a new channel manager and spawn its background task. The
    /// channel starts disconnected; call [`connect`](Self::connect) to open
    /// the stream.
    pub async fn new(settings: &Settings) -> Result<Self> {
        let recovery = RecoveryClient::new_from_settings(&settings.recovery)
            .context("Failed to build gap-recovery client")?;
        let backoff = BackoffScheduler::new(&settings.reconnect);

        let (command_tx, command_rx) = mpsc::channel(64);
        let (stream_event_tx, stream_event_rx) = mpsc::channel(256);
        let (status_tx, status_rx) = watch::channel(ConnectionState::Disconnected);

        let session = Arc::new(RwLock::new(None));
        let subscriptions = Arc::new(RwLock::new(SubscriptionRegistry::default()));

        let task = ManagerTask {
            url: settings.stream.url.clone(),
            connect_timeout: Duration::from_secs(settings.stream.connect_timeout_secs),
            backoff,
            recovery,
            status_tx,
            stream_event_tx,
            session: Arc::clone(&session),
            subscriptions: Arc::clone(&subscriptions),
            state: ConnectionState::Disconnected,
            sink: None,
            generation: 0,
            attempts: 0,
            next_attempt_at: None,
            replay: None,
        };
        tokio::spawn(task.run(command_rx, stream_event_rx));

        Ok(Self {
            command_tx,
            status_rx,
            session,
            subscriptions,
        })
    }

    /// Open the stream. Idempotent: a no-op while already connecting or
    /// connected.
    pub async fn connect(&self) -> Result<()> {
        self.command_tx
            .send(ManagerCommand::Connect)
            .await
            .context("Failed to send connect command")
    }

    /// Close the stream and reset the session. Terminal user action; no
    /// automatic reconnection follows.
    pub async fn disconnect(&self) -> Result<()> {
        self.command_tx
            .send(ManagerCommand::Disconnect)
            .await
            .context("Failed to send disconnect command")
    }

    /// Skip any remaining backoff, reset the attempt counter, and retry
    /// immediately.
    pub async fn reconnect_now(&self) -> Result<()> {
        self.command_tx
            .send(ManagerCommand::ReconnectNow)
            .await
            .context("Failed to send reconnect command")
    }

    /// Stop the manager task entirely. Used on application shutdown.
    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx
            .send(ManagerCommand::Shutdown)
            .await
            .context("Failed to send shutdown command")
    }

    /// Register a consumer. Handlers registered for the same filter run in
    /// insertion order; a handler returning `Err` is logged and isolated.
    pub async fn subscribe<F, S>(
        &self,
        filter: EventFilter,
        description: S,
        handler: F,
    ) -> SubscriptionId
    where
        F: Fn(Message) -> anyhow::Result<()> + Send + Sync + 'static,
        S: Into<String>,
    {
        let subscription = Subscription::new(filter, description, handler);
        let id = subscription.id;
        self.subscriptions.write().await.insert(subscription);
        id
    }

    /// Remove a consumer by the id `subscribe` returned.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscriptions.write().await.remove(id)
    }

    /// Watch receiver over the connection state. Every failure the channel
    /// cannot recover from on its own surfaces here as
    /// [`ConnectionState::Error`].
    pub fn connection_status(&self) -> watch::Receiver<ConnectionState> {
        self.status_rx.clone()
    }

    pub fn is_connected(&self) -> bool {
        *self.status_rx.borrow() == ConnectionState::Connected
    }

    pub async fn last_sequence_number(&self) -> Option<u64> {
        self.session
            .read()
            .await
            .as_ref()
            .and_then(|s| s.tracker.last_sequence_number())
    }

    pub async fn connection_id(&self) -> Option<String> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.connection_id.clone())
    }
}

struct ManagerTask {
    url: String,
    connect_timeout: Duration,
    backoff: BackoffScheduler,
    recovery: RecoveryClient,
    status_tx: watch::Sender<ConnectionState>,
    stream_event_tx: mpsc::Sender<StreamEvent>,
    session: Arc<RwLock<Option<ConnectionSession>>>,
    subscriptions: Arc<RwLock<SubscriptionRegistry>>,
    state: ConnectionState,
    sink: Option<WsSink>,
    // Bumped on every transport open and on disconnect; retires stale
    // reader tasks and in-flight recovery fetches.
    generation: u64,
    // Consecutive failed connection attempts.
    attempts: u32,
    // The single pending backoff deadline.
    next_attempt_at: Option<Instant>,
    // Present exactly while gap recovery is in flight ("recovering").
    replay: Option<ReplayWindow>,
}

impl ManagerTask {
    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<ManagerCommand>,
        mut stream_event_rx: mpsc::Receiver<StreamEvent>,
    ) {
        info!("Channel manager task started");

        'manager_loop: loop {
            // Evaluated even when the branch below is disabled; only polled
            // while a reconnect deadline is armed.
            let deadline = self.next_attempt_at.unwrap_or_else(Instant::now);

            tokio::select! {
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(ManagerCommand::Connect) => self.handle_connect().await,
                        Some(ManagerCommand::Disconnect) => self.handle_disconnect().await,
                        Some(ManagerCommand::ReconnectNow) => {
                            info!("Manual reconnect requested, skipping remaining backoff");
                            self.next_attempt_at = None;
                            self.attempts = 0;
                            self.handle_connect().await;
                        }
                        Some(ManagerCommand::Shutdown) => {
                            info!("Shutting down channel manager");
                            self.handle_disconnect().await;
                            break 'manager_loop;
                        }
                        None => {
                            warn!("Command channel closed, shutting down channel manager");
                            self.handle_disconnect().await;
                            break 'manager_loop;
                        }
                    }
                }

                Some(event) = stream_event_rx.recv() => {
                    self.handle_stream_event(event).await;
                }

                _ = tokio::time::sleep_until(deadline), if self.next_attempt_at.is_some() => {
                    self.next_attempt_at = None;
                    debug!("Backoff timer fired after {} failed attempts", self.attempts);
                    self.handle_connect().await;
                }
            }
        }

        info!("Channel manager task exiting");
    }

    async fn handle_connect(&mut self) {
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            debug!("connect() ignored: already {:?}", self.state);
            return;
        }

        self.set_state(ConnectionState::Connecting);
        self.open_transport().await;
    }

    async fn open_transport(&mut self) {
        self.generation += 1;
        let generation = self.generation;

        info!(
            "Opening stream transport to {} (generation {})",
            self.url, generation
        );
        match timeout(self.connect_timeout, connect_async(self.url.as_str())).await {
            Ok(Ok((ws, _response))) => {
                let (sink, source) = ws.split();
                self.sink = Some(sink);
                Self::spawn_reader(source, generation, self.stream_event_tx.clone());

                self.attempts = 0;
                self.next_attempt_at = None;
                self.set_state(ConnectionState::Connected);
                info!("Stream transport established");

                // A prior session means we may have missed messages; open
                // the replay window before any live frame is processed.
                if self.session.read().await.is_some() {
                    self.replay = Some(ReplayWindow::new());
                    self.spawn_recovery_fetch(generation).await;
                }
            }
            Ok(Err(e)) => {
                self.handle_connect_failure(ChannelError::Transport(e.to_string()))
                    .await;
            }
            Err(_) => {
                let reason = format!("connect timed out after {:?}", self.connect_timeout);
                self.handle_connect_failure(ChannelError::Transport(reason))
                    .await;
            }
        }
    }

    async fn handle_connect_failure(&mut self, error: ChannelError) {
        self.sink = None;
        self.attempts += 1;

        if self.backoff.exhausted(self.attempts) {
            let exhausted = ChannelError::MaxAttemptsExceeded {
                attempts: self.attempts,
            };
            error!("{error}; {exhausted}");
            self.next_attempt_at = None;
            self.set_state(ConnectionState::Error);
            return;
        }

        let delay = self.backoff.delay(self.attempts - 1);
        warn!(
            "{}; retrying in {:?} (attempt #{} of {})",
            error,
            delay,
            self.attempts,
            self.backoff.max_attempts()
        );
        self.next_attempt_at = Some(Instant::now() + delay);
        self.set_state(ConnectionState::Reconnecting);
    }

    async fn handle_disconnect(&mut self) {
        info!("Disconnecting stream channel");
        self.next_attempt_at = None;
        self.attempts = 0;
        self.replay = None;
        // Retire the live reader and any in-flight recovery fetch.
        self.generation += 1;

        if let Some(mut sink) = self.sink.take() {
            let _ = sink.send(WsMessage::Close(None)).await;
            let _ = sink.close().await;
        }

        *self.session.write().await = None;
        self.set_state(ConnectionState::Disconnected);
    }

    async fn handle_stream_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Frame {
                generation,
                message,
            } => {
                if generation != self.generation {
                    debug!("Ignoring frame from retired transport");
                    return;
                }
                self.handle_frame(message).await;
            }
            StreamEvent::PingReceived {
                generation,
                payload,
            } => {
                if generation != self.generation {
                    return;
                }
                debug!("Received ping, sending pong");
                if let Some(mut sink) = self.sink.take() {
                    match sink.send(WsMessage::Pong(payload.into())).await {
                        Ok(()) => {
                            // Put the sink back
                            self.sink = Some(sink);
                        }
                        Err(e) => {
                            self.handle_transport_lost(format!("pong write failed: {e}"))
                                .await;
                        }
                    }
                }
            }
            StreamEvent::ConnectionClosed { generation } => {
                if generation != self.generation {
                    return;
                }
                self.handle_transport_lost("connection closed by server".to_string())
                    .await;
            }
            StreamEvent::ConnectionError { generation, reason } => {
                if generation != self.generation {
                    return;
                }
                self.handle_transport_lost(reason).await;
            }
            StreamEvent::RecoveryFetched {
                generation,
                outcome,
            } => {
                if generation != self.generation {
                    debug!("Discarding recovery batch from retired transport");
                    return;
                }
                self.apply_recovery(outcome).await;
            }
        }
    }

    // Unsolicited close or error on the live transport.
    async fn handle_transport_lost(&mut self, reason: String) {
        if self.state != ConnectionState::Connected {
            // Raced an explicit transition; that path already cleaned up.
            return;
        }
        warn!("Stream transport lost: {reason}");
        self.sink = None;
        // An open replay window died with its transport; the next recovery
        // fetch covers whatever it held, since the counter never advanced.
        self.replay = None;
        self.handle_connect_failure(ChannelError::Transport(reason))
            .await;
    }

    async fn handle_frame(&mut self, message: Message) {
        if message.is_connected_frame() {
            self.handle_connected_frame(message).await;
            return;
        }

        if let Some(window) = self.replay.as_mut() {
            window.push(message);
            return;
        }

        self.deliver(message).await;
    }

    // Session bookkeeping for the `connected` control frame. Not dispatched
    // to consumers: its fixed sequence 0 would regress the counter.
    async fn handle_connected_frame(&mut self, message: Message) {
        let Some(connection_id) = message.connection_id().map(str::to_string) else {
            warn!("Connected frame without a connectionId, dropping");
            return;
        };

        let mut session = self.session.write().await;
        match session.as_mut() {
            Some(live) => {
                // Transient reconnect: the session is re-keyed, the
                // sequence counter survives.
                info!("Session re-established (connection id {})", connection_id);
                live.connection_id = connection_id;
            }
            None => {
                info!("Session established (connection id {})", connection_id);
                *session = Some(ConnectionSession::new(
                    connection_id,
                    message.sequence_number,
                ));
            }
        }
    }

    async fn spawn_recovery_fetch(&self, generation: u64) {
        let since = self
            .session
            .read()
            .await
            .as_ref()
            .and_then(|s| s.tracker.last_sequence_number())
            .unwrap_or(0);
        let recovery = self.recovery.clone();
        let events = self.stream_event_tx.clone();

        info!("Recovering missed messages since sequence {}", since);
        tokio::spawn(async move {
            let outcome = recovery.fetch_since(since).await;
            let _ = events
                .send(StreamEvent::RecoveryFetched {
                    generation,
                    outcome,
                })
                .await;
        });
    }

    async fn apply_recovery(&mut self, outcome: Result<Vec<Message>, ChannelError>) {
        // The window is the "recovering" flag: absent means the cycle was
        // torn down (disconnect or another drop) and the batch is stale.
        let Some(window) = self.replay.take() else {
            debug!("Recovery batch arrived with no open replay window, discarding");
            return;
        };

        let fetched = match outcome {
            Ok(batch) => {
                info!("Gap recovery fetched {} missed messages", batch.len());
                batch
            }
            Err(e) => {
                // Documented degradation: replay what we buffered and move on.
                warn!("{e}; replaying buffered messages only");
                Vec::new()
            }
        };

        let buffered = window.into_messages();
        let merged = merge_replay(fetched, buffered);
        info!("Replaying {} merged messages", merged.len());
        for message in merged {
            self.deliver(message).await;
        }
    }

    // Deliver one consumer-bound message through the sequence gate.
    async fn deliver(&mut self, message: Message) {
        let admitted = {
            let mut session = self.session.write().await;
            match session.as_mut() {
                Some(live) => live.tracker.admit(message.sequence_number),
                None => {
                    warn!(
                        "Dropping {} message #{} received before session establishment",
                        message.kind, message.sequence_number
                    );
                    return;
                }
            }
        };

        if admitted {
            self.subscriptions.read().await.dispatch(&message);
        }
    }

    fn spawn_reader(source: WsSource, generation: u64, events: mpsc::Sender<StreamEvent>) {
        tokio::spawn(async move {
            let mut source = source;
            while let Some(result) = source.next().await {
                match result {
                    Ok(WsMessage::Text(text)) => match Message::parse(text.as_str()) {
                        Ok(message) => {
                            let event = StreamEvent::Frame {
                                generation,
                                message,
                            };
                            if events.send(event).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            // Malformed frame: dropped, counter untouched.
                            warn!("Dropping frame: {}", ChannelError::Parse(e));
                        }
                    },
                    Ok(WsMessage::Ping(payload)) => {
                        let event = StreamEvent::PingReceived {
                            generation,
                            payload: payload.to_vec(),
                        };
                        if events.send(event).await.is_err() {
                            return;
                        }
                    }
                    Ok(WsMessage::Pong(_)) => {}
                    Ok(WsMessage::Close(_)) => {
                        let _ = events
                            .send(StreamEvent::ConnectionClosed { generation })
                            .await;
                        return;
                    }
                    Ok(WsMessage::Binary(_)) => {
                        warn!("Ignoring unexpected binary frame");
                    }
                    Ok(WsMessage::Frame(_)) => {}
                    Err(e) => {
                        let _ = events
                            .send(StreamEvent::ConnectionError {
                                generation,
                                reason: e.to_string(),
                            })
                            .await;
                        return;
                    }
                }
            }

            // EOF without a close frame
            let _ = events
                .send(StreamEvent::ConnectionClosed { generation })
                .await;
        });
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!("Connection state {:?} -> {:?}", self.state, next);
            self.state = next;
            let _ = self.status_tx.send(next);
        }
    }
}
