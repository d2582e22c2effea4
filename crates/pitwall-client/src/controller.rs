//! Connection state machine and the client handle.
//!
//! One controller task per client owns the [`IngestSession`] and the
//! connection state. Commands from the [`ClientHandle`], results of
//! connection attempts, transport events, the reconnect timer, and the
//! flush timer are all serialized through its `select!` loop, so the
//! snapshot has exactly one writer.
//!
//! ```text
//!   Idle --start--> Negotiating --ok--> Connecting --open--> Subscribed --frame--> Streaming
//!    ^                  |                   |                     |                    |
//!    +---- negotiation failed               +-- timeout/error --> Reconnecting <-- closed
//!          (retry after backoff)                                  (retry after backoff)
//! ```
//!
//! A socket that closes before its attempt reports `Connected` is still a
//! lost connection: the close is remembered and applied when the link
//! arrives.
//!
//! `stop()` moves any state to Closing, then to Idle once the final flush
//! has run and the socket is closed. An attempt still in flight is left to
//! finish and closes whatever it opens.
//!
//! Flushes run on a blocking thread, at most one at a time, so journal
//! writes never stall frame handling.

use std::sync::Arc;
use std::time::Duration;

use pitwall_core::config::TimingConfig;
use pitwall_core::{FeedConfig, FeedObserver, Snapshot};
use pitwall_store::{FlushBatch, Journal, PersistenceBuffer, StoreError};
use pitwall_types::{ConnectionState, Envelope, ErrorKind, ErrorReport, SubscribeRequest};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{ClientError, ConnectionError, NegotiationError};
use crate::session::IngestSession;
use crate::transport::{
    EventSink, FeedTransport, Link, TransportEvent, WebSocketTransport, connect_with_timeout,
};

/// Capacity of the event broadcast channel. Slow subscribers that fall
/// further behind than this miss events.
const EVENT_CAPACITY: usize = 1024;

/// A written flush batch and its result, sent back from the blocking pool.
type FlushDone = (FlushBatch, Result<usize, StoreError>);

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Notifications published to every subscriber of [`ClientHandle::events`].
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// A sub-message was merged into a topic.
    Topic {
        /// Topic name.
        topic: String,
        /// Merged view of the topic, or the appended entry for append-only
        /// topics.
        payload: Value,
    },
    /// An envelope was fully applied.
    Snapshot {
        /// The snapshot as of this envelope. Never mutated after publication.
        snapshot: Arc<Snapshot>,
        /// The envelope that produced it.
        envelope: Arc<Envelope>,
    },
    /// A failure that did not stop ingestion.
    Error(ErrorReport),
    /// The connection state changed.
    State(ConnectionState),
}

/// A live timing client that has not been started yet.
#[derive(Debug)]
pub struct FeedClient<T = WebSocketTransport> {
    config: FeedConfig,
    transport: Arc<T>,
}

impl FeedClient<WebSocketTransport> {
    /// Create a client that connects over a secure WebSocket.
    pub fn new(config: FeedConfig) -> Self {
        let transport = WebSocketTransport::new(config.feed.clone(), &config.timing);
        Self::with_transport(config, transport)
    }
}

impl<T: FeedTransport> FeedClient<T> {
    /// Create a client over a custom transport.
    pub fn with_transport(config: FeedConfig, transport: T) -> Self {
        Self {
            config,
            transport: Arc::new(transport),
        }
    }

    /// The configuration the client will run with.
    pub const fn config(&self) -> &FeedConfig {
        &self.config
    }

    /// Open the durable history and spawn the controller task, which
    /// immediately starts negotiating.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Store`] if the journal files cannot be
    /// initialized.
    pub fn start(self, topics: Vec<String>) -> Result<ClientHandle, ClientError> {
        let buffer = PersistenceBuffer::open(Journal::from_config(&self.config.persistence))?;
        let session = IngestSession::new(&self.config, buffer);

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (attempt_tx, attempt_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();

        let controller = Controller {
            transport: self.transport,
            hub: self.config.feed.hub.clone(),
            timing: self.config.timing.clone(),
            flush_interval: self.config.persistence.flush_interval(),
            topics,
            next_request_id: 1,
            state: ConnectionState::Idle,
            state_tx,
            publisher: EventPublisher {
                tx: event_tx.clone(),
            },
            session,
            epoch: 0,
            link: None,
            pending_close: None,
            retry_at: None,
            flushing: false,
            attempt_tx,
            transport_tx,
            flush_tx,
        };
        tokio::spawn(controller.run(command_rx, attempt_rx, transport_rx, flush_rx));

        Ok(ClientHandle {
            commands: command_tx,
            events: event_tx,
            state: state_rx,
        })
    }
}

/// Handle to a running client. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<FeedEvent>,
    state: watch::Receiver<ConnectionState>,
}

impl ClientHandle {
    /// Subscribe to topic, snapshot, error, and state notifications.
    pub fn events(&self) -> broadcast::Receiver<FeedEvent> {
        self.events.subscribe()
    }

    /// Replace the active topic set.
    ///
    /// Sent immediately when connected; every later reconnect resubscribes
    /// to this set.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Stopped`] if the client has stopped.
    pub fn subscribe(&self, topics: Vec<String>) -> Result<(), ClientError> {
        self.commands
            .send(Command::Subscribe(topics))
            .map_err(|_closed| ClientError::Stopped)
    }

    /// The current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// A receiver that observes every state change.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Stop the client.
    ///
    /// Resolves once the final flush has run and the socket is closed.
    /// Calling it again, or after the client has stopped, returns
    /// immediately.
    pub async fn stop(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(Command::Stop(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Controller internals
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Command {
    Subscribe(Vec<String>),
    Stop(oneshot::Sender<()>),
}

/// Progress of one negotiate-then-connect attempt.
#[derive(Debug)]
enum AttemptEvent {
    Negotiated,
    NegotiationFailed(NegotiationError),
    Connected(Link),
    ConnectFailed(ConnectionError),
}

/// Bridges core notifications onto the broadcast channel.
struct EventPublisher {
    tx: broadcast::Sender<FeedEvent>,
}

impl EventPublisher {
    fn publish(&self, event: FeedEvent) -> usize {
        // send fails only when nobody is subscribed, which is normal.
        self.tx.send(event).unwrap_or(0)
    }
}

impl FeedObserver for EventPublisher {
    fn on_topic(&mut self, topic: &str, payload: &Value) {
        self.publish(FeedEvent::Topic {
            topic: topic.to_owned(),
            payload: payload.clone(),
        });
    }

    fn on_snapshot(&mut self, snapshot: &Arc<Snapshot>, envelope: &Arc<Envelope>) {
        self.publish(FeedEvent::Snapshot {
            snapshot: Arc::clone(snapshot),
            envelope: Arc::clone(envelope),
        });
    }

    fn on_error(&mut self, report: &ErrorReport) {
        self.publish(FeedEvent::Error(report.clone()));
    }
}

struct Controller<T> {
    transport: Arc<T>,
    hub: String,
    timing: TimingConfig,
    flush_interval: Duration,
    /// Most recently requested topic set; every subscribe uses it verbatim.
    topics: Vec<String>,
    next_request_id: u64,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    publisher: EventPublisher,
    session: IngestSession,
    /// Incremented per attempt and on stop. Events tagged with an older
    /// epoch belong to a superseded connection.
    epoch: u64,
    link: Option<Link>,
    /// Close reported by the current attempt's socket before the attempt
    /// handed over its link.
    pending_close: Option<(Option<u16>, String)>,
    retry_at: Option<Instant>,
    flushing: bool,
    attempt_tx: mpsc::UnboundedSender<(u64, AttemptEvent)>,
    transport_tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
    flush_tx: mpsc::UnboundedSender<FlushDone>,
}

impl<T: FeedTransport> Controller<T> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut attempts: mpsc::UnboundedReceiver<(u64, AttemptEvent)>,
        mut events: mpsc::UnboundedReceiver<(u64, TransportEvent)>,
        mut flushes: mpsc::UnboundedReceiver<FlushDone>,
    ) {
        info!(
            hub = %self.hub,
            topics = self.topics.len(),
            backoff_ms = self.timing.reconnect_backoff_ms,
            "client starting"
        );
        self.begin_attempt();

        let mut flush = tokio::time::interval(self.flush_interval);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let retry_at = self.retry_at;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Subscribe(topics)) => self.resubscribe(topics),
                    Some(Command::Stop(ack)) => {
                        self.shutdown(&mut flushes).await;
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        debug!("all client handles dropped");
                        self.shutdown(&mut flushes).await;
                        break;
                    }
                },
                Some((epoch, event)) = attempts.recv() => self.on_attempt(epoch, event),
                Some((epoch, event)) = events.recv() => self.on_transport(epoch, event),
                Some((batch, result)) = flushes.recv() => self.finish_flush(batch, result),
                () = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.retry_at = None;
                    self.begin_attempt();
                }
                _ = flush.tick() => self.start_flush(),
            }
        }

        // An attempt still in flight finds the channel closed and closes its
        // own link; one that already reported is closed here.
        attempts.close();
        while let Ok((epoch, event)) = attempts.try_recv() {
            if let AttemptEvent::Connected(link) = event {
                debug!(epoch, "closing connection opened during stop");
                tokio::spawn(link.close());
            }
        }

        // Acknowledge stop requests that raced the shutdown.
        commands.close();
        while let Ok(command) = commands.try_recv() {
            if let Command::Stop(ack) = command {
                let _ = ack.send(());
            }
        }
        info!(
            frames = self.session.sequencer().frames_received(),
            recorded = self.session.buffer().total_recorded(),
            "client stopped"
        );
    }

    fn begin_attempt(&mut self) {
        if self.state.is_attempting() {
            debug!(attempt = self.epoch, "attempt already in flight");
            return;
        }
        self.epoch = self.epoch.saturating_add(1);
        self.pending_close = None;
        info!(attempt = self.epoch, topics = self.topics.len(), "negotiating");
        self.set_state(ConnectionState::Negotiating);

        let sink = EventSink::new(self.epoch, self.transport_tx.clone());
        tokio::spawn(run_attempt(
            Arc::clone(&self.transport),
            self.epoch,
            sink,
            self.timing.connect_timeout(),
            self.attempt_tx.clone(),
        ));
    }

    fn on_attempt(&mut self, epoch: u64, event: AttemptEvent) {
        if epoch != self.epoch {
            if let AttemptEvent::Connected(link) = event {
                debug!(epoch, "closing connection from superseded attempt");
                tokio::spawn(link.close());
            }
            return;
        }

        match event {
            AttemptEvent::Negotiated => self.set_state(ConnectionState::Connecting),
            AttemptEvent::NegotiationFailed(e) => {
                warn!(attempt = epoch, error = %e, "negotiation failed");
                self.report(ErrorKind::Negotiation, e.to_string());
                self.set_state(ConnectionState::Idle);
                self.schedule_retry();
            }
            AttemptEvent::ConnectFailed(e) => {
                warn!(attempt = epoch, error = %e, "connect failed");
                self.report(ErrorKind::Connection, e.to_string());
                self.set_state(ConnectionState::Reconnecting);
                self.schedule_retry();
            }
            AttemptEvent::Connected(link) => {
                if let Some((code, reason)) = self.pending_close.take() {
                    debug!(attempt = epoch, "socket closed before the attempt completed");
                    tokio::spawn(link.close());
                    self.connection_lost(code, &reason);
                    return;
                }
                info!(attempt = epoch, "connected");
                self.link = Some(link);
                self.set_state(ConnectionState::Subscribed);
                self.send_subscribe();
            }
        }
    }

    fn on_transport(&mut self, epoch: u64, event: TransportEvent) {
        if epoch != self.epoch {
            debug!(epoch, current = self.epoch, "event from superseded connection dropped");
            return;
        }

        match event {
            TransportEvent::Frame { text, received_at } => {
                if self.state == ConnectionState::Subscribed {
                    self.set_state(ConnectionState::Streaming);
                }
                self.session.ingest(&text, received_at, &mut self.publisher);
            }
            TransportEvent::Error(message) => {
                warn!(error = %message, "socket error");
                self.report(ErrorKind::Connection, message);
            }
            TransportEvent::Closed { code, reason } => {
                if self.state.is_attempting() {
                    debug!(?code, "socket closed while the attempt is in flight");
                    self.pending_close = Some((code, reason));
                } else if self.state.is_connected() {
                    self.connection_lost(code, &reason);
                } else {
                    debug!(?code, state = %self.state, "close ignored");
                }
            }
        }
    }

    /// Drop the link and retry after the backoff.
    fn connection_lost(&mut self, code: Option<u16>, reason: &str) {
        warn!(?code, reason, "socket closed");
        let code = code.map_or_else(|| "none".to_owned(), |c| c.to_string());
        self.report(
            ErrorKind::Connection,
            format!("socket closed (code {code}): {reason}"),
        );
        self.link = None;
        self.set_state(ConnectionState::Reconnecting);
        self.schedule_retry();
    }

    fn resubscribe(&mut self, topics: Vec<String>) {
        info!(topics = topics.len(), "topic set replaced");
        self.topics = topics;
        if self.state.is_connected() {
            self.send_subscribe();
        }
    }

    fn send_subscribe(&mut self) {
        if self.topics.is_empty() {
            debug!("no topics to subscribe to");
            return;
        }
        let request_id = self.next_request_id;
        let request = SubscribeRequest::new(self.hub.clone(), self.topics.clone(), request_id);
        let text = match serde_json::to_string(&request) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "subscribe request could not be encoded");
                return;
            }
        };
        self.next_request_id = self.next_request_id.saturating_add(1);

        let sent = self.link.as_ref().map(|link| link.send(text));
        match sent {
            Some(Ok(())) => info!(request_id, topics = self.topics.len(), "subscribe sent"),
            Some(Err(e)) => {
                warn!(request_id, error = %e, "subscribe could not be sent");
                self.connection_lost(None, &e.to_string());
            }
            None => debug!(request_id, "no connection for subscribe"),
        }
    }

    fn schedule_retry(&mut self) {
        let backoff = self.timing.reconnect_backoff();
        info!(backoff_ms = self.timing.reconnect_backoff_ms, "retrying after backoff");
        self.retry_at = Some(Instant::now().checked_add(backoff).unwrap_or_else(Instant::now));
    }

    async fn shutdown(&mut self, flushes: &mut mpsc::UnboundedReceiver<FlushDone>) {
        info!(state = %self.state, "stopping");
        self.set_state(ConnectionState::Closing);
        self.retry_at = None;
        self.pending_close = None;
        self.epoch = self.epoch.saturating_add(1);

        if let Some(link) = self.link.take() {
            link.close().await;
        }

        self.wait_for_flush(flushes).await;
        self.start_flush();
        self.wait_for_flush(flushes).await;
        self.set_state(ConnectionState::Idle);
    }

    /// Hand pending history entries to a blocking thread, unless a flush is
    /// already running.
    fn start_flush(&mut self) {
        if self.flushing {
            debug!("previous flush still running");
            return;
        }
        let Some(mut batch) = self.session.begin_flush() else {
            return;
        };
        self.flushing = true;
        let done = self.flush_tx.clone();
        tokio::task::spawn_blocking(move || {
            let result = batch.write();
            let _ = done.send((batch, result));
        });
    }

    fn finish_flush(&mut self, batch: FlushBatch, result: Result<usize, StoreError>) {
        self.flushing = false;
        self.session.finish_flush(batch, result, &mut self.publisher);
    }

    async fn wait_for_flush(&mut self, flushes: &mut mpsc::UnboundedReceiver<FlushDone>) {
        while self.flushing {
            match flushes.recv().await {
                Some((batch, result)) => self.finish_flush(batch, result),
                None => self.flushing = false,
            }
        }
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        info!(from = %self.state, to = %next, "connection state changed");
        self.state = next;
        self.state_tx.send_replace(next);
        self.publisher.publish(FeedEvent::State(next));
    }

    fn report(&mut self, kind: ErrorKind, message: String) {
        self.publisher.on_error(&ErrorReport::now(kind, message));
    }
}

/// Negotiate, then connect, reporting each step to the controller.
async fn run_attempt<T: FeedTransport>(
    transport: Arc<T>,
    epoch: u64,
    sink: EventSink,
    connect_timeout: Duration,
    tx: mpsc::UnboundedSender<(u64, AttemptEvent)>,
) {
    let credentials = match transport.negotiate().await {
        Ok(credentials) => credentials,
        Err(e) => {
            let _ = tx.send((epoch, AttemptEvent::NegotiationFailed(e)));
            return;
        }
    };
    if tx.send((epoch, AttemptEvent::Negotiated)).is_err() {
        return;
    }

    let event = match connect_with_timeout(transport.as_ref(), credentials, sink, connect_timeout).await {
        Ok(link) => AttemptEvent::Connected(link),
        Err(e) => AttemptEvent::ConnectFailed(e),
    };
    // The controller has stopped: close instead of leaking the socket.
    if let Err(mpsc::error::SendError((_, AttemptEvent::Connected(link)))) = tx.send((epoch, event)) {
        link.close().await;
    }
}
