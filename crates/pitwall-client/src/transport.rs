//! Streaming transport.
//!
//! A [`FeedTransport`] negotiates credentials and opens a connection. An
//! open connection is represented by a [`Link`] for outbound traffic and an
//! [`EventSink`] through which the transport reports inbound frames,
//! errors, and the close. The transport never retries; the controller
//! decides what happens after a failure.
//!
//! [`WebSocketTransport`] is the production implementation. Tests drive the
//! controller with scripted transports built on the same types.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use pitwall_core::config::{EndpointConfig, TimingConfig};
use pitwall_types::Credentials;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::{ACCEPT_ENCODING, COOKIE, USER_AGENT};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{ConnectionError, NegotiationError};
use crate::negotiate::{Negotiator, connection_data};

/// How long [`Link::close`] waits for the socket to acknowledge.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

/// Something that can negotiate and open a feed connection.
pub trait FeedTransport: Send + Sync + 'static {
    /// Perform the negotiation handshake.
    fn negotiate(&self) -> impl Future<Output = Result<Credentials, NegotiationError>> + Send;

    /// Open a connection with `credentials`, reporting inbound traffic to
    /// `sink` until the connection closes.
    fn connect(
        &self,
        credentials: Credentials,
        sink: EventSink,
    ) -> impl Future<Output = Result<Link, ConnectionError>> + Send;
}

/// Open a connection, failing with [`ConnectionError::Timeout`] if it is
/// not open within `deadline`.
pub async fn connect_with_timeout<T: FeedTransport>(
    transport: &T,
    credentials: Credentials,
    sink: EventSink,
    deadline: Duration,
) -> Result<Link, ConnectionError> {
    match tokio::time::timeout(deadline, transport.connect(credentials, sink)).await {
        Ok(result) => result,
        Err(_elapsed) => Err(ConnectionError::Timeout),
    }
}

// ---------------------------------------------------------------------------
// Events and links
// ---------------------------------------------------------------------------

/// Inbound traffic on an open connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A text frame that is not a keep-alive.
    Frame {
        /// Frame text.
        text: String,
        /// Receipt time.
        received_at: DateTime<Utc>,
    },
    /// The socket reported an error. A close follows.
    Error(String),
    /// The socket closed.
    Closed {
        /// Close code, if the peer sent one.
        code: Option<u16>,
        /// Close reason.
        reason: String,
    },
}

/// Whether a frame carries nothing: empty, whitespace, or a bare `{}`.
pub fn is_keep_alive(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.is_empty() || trimmed == "{}"
}

/// Where a connection reports its inbound traffic.
///
/// Each connection attempt gets its own sink tagged with the attempt's
/// epoch, so events from a superseded connection can be told apart.
#[derive(Debug, Clone)]
pub struct EventSink {
    epoch: u64,
    tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
}

impl EventSink {
    /// Create a sink that tags events with `epoch`.
    pub const fn new(epoch: u64, tx: mpsc::UnboundedSender<(u64, TransportEvent)>) -> Self {
        Self { epoch, tx }
    }

    /// Report a received frame. Keep-alive frames are dropped here.
    ///
    /// Returns `false` once nobody is listening.
    pub fn frame(&self, text: impl Into<String>) -> bool {
        let text = text.into();
        if is_keep_alive(&text) {
            debug!("keep-alive frame dropped");
            return !self.tx.is_closed();
        }
        self.send(TransportEvent::Frame {
            text,
            received_at: Utc::now(),
        })
    }

    /// Report a socket error.
    pub fn error(&self, message: impl Into<String>) -> bool {
        self.send(TransportEvent::Error(message.into()))
    }

    /// Report that the socket closed.
    pub fn closed(&self, code: Option<u16>, reason: impl Into<String>) -> bool {
        self.send(TransportEvent::Closed {
            code,
            reason: reason.into(),
        })
    }

    fn send(&self, event: TransportEvent) -> bool {
        self.tx.send((self.epoch, event)).is_ok()
    }
}

/// Outbound instructions for an open connection.
#[derive(Debug)]
pub enum LinkCommand {
    /// Send a text frame.
    Send(String),
    /// Close the socket and acknowledge once it is closed.
    Close(oneshot::Sender<()>),
}

/// Handle to an open connection.
#[derive(Debug)]
pub struct Link {
    outbound: mpsc::UnboundedSender<LinkCommand>,
}

impl Link {
    /// Create a link and the receiver its connection reads commands from.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<LinkCommand>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        (Self { outbound }, rx)
    }

    /// Queue a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Closed`] if the connection has gone away.
    pub fn send(&self, text: String) -> Result<(), ConnectionError> {
        self.outbound
            .send(LinkCommand::Send(text))
            .map_err(|_closed| ConnectionError::Closed)
    }

    /// Close the connection and wait briefly for it to finish.
    pub async fn close(self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.outbound.send(LinkCommand::Close(ack_tx)).is_err() {
            return;
        }
        if tokio::time::timeout(CLOSE_GRACE, ack_rx).await.is_err() {
            warn!("socket did not acknowledge close");
        }
    }
}

// ---------------------------------------------------------------------------
// WebSocket implementation
// ---------------------------------------------------------------------------

/// The production transport: HTTPS negotiation and a secure WebSocket.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    negotiator: Negotiator,
    endpoint: EndpointConfig,
}

impl WebSocketTransport {
    /// Create a transport for `endpoint`.
    pub fn new(endpoint: EndpointConfig, timing: &TimingConfig) -> Self {
        Self {
            negotiator: Negotiator::new(endpoint.clone(), timing.negotiate_timeout()),
            endpoint,
        }
    }
}

impl FeedTransport for WebSocketTransport {
    async fn negotiate(&self) -> Result<Credentials, NegotiationError> {
        self.negotiator.negotiate().await
    }

    async fn connect(&self, credentials: Credentials, sink: EventSink) -> Result<Link, ConnectionError> {
        let url = connect_url(&self.endpoint, &credentials)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectionError::Request(e.to_string()))?;

        let headers = request.headers_mut();
        headers.insert(USER_AGENT, header_value(&self.endpoint.user_agent)?);
        headers.insert(ACCEPT_ENCODING, header_value(&self.endpoint.accept_encoding)?);
        headers.insert(COOKIE, header_value(&credentials.cookie)?);

        let (socket, response) = connect_async(request)
            .await
            .map_err(|e| ConnectionError::Handshake(e.to_string()))?;
        info!(status = %response.status(), "socket open");

        let (link, commands) = Link::channel();
        tokio::spawn(pump(socket, commands, sink));
        Ok(link)
    }
}

/// Build the `wss://` connect URL carrying the token and hub name.
pub fn connect_url(endpoint: &EndpointConfig, credentials: &Credentials) -> Result<Url, ConnectionError> {
    let base = endpoint.base_url.trim_end_matches('/');
    let mut url = Url::parse_with_params(
        &format!("{base}/connect"),
        [
            ("clientProtocol", endpoint.client_protocol.as_str()),
            ("transport", "webSockets"),
            ("connectionToken", credentials.token.as_str()),
            ("connectionData", connection_data(&endpoint.hub).as_str()),
        ],
    )
    .map_err(|e| ConnectionError::Request(e.to_string()))?;

    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => other,
    }
    .to_owned();
    url.set_scheme(&scheme)
        .map_err(|()| ConnectionError::Request(format!("cannot use scheme {scheme}")))?;
    Ok(url)
}

fn header_value(value: &str) -> Result<HeaderValue, ConnectionError> {
    HeaderValue::from_str(value).map_err(|e| ConnectionError::Request(e.to_string()))
}

/// Shuttle frames between the socket, the sink, and the link.
async fn pump<S>(
    socket: tokio_tungstenite::WebSocketStream<S>,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    sink: EventSink,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut writer, mut reader) = socket.split();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(LinkCommand::Send(text)) => {
                    if let Err(e) = writer.send(Message::Text(text.into())).await {
                        warn!(error = %e, "socket write failed");
                        sink.error(e.to_string());
                        sink.closed(None, e.to_string());
                        break;
                    }
                }
                Some(LinkCommand::Close(ack)) => {
                    if let Err(e) = writer.close().await {
                        debug!(error = %e, "socket close failed");
                    }
                    let _ = ack.send(());
                    break;
                }
                None => {
                    let _ = writer.close().await;
                    break;
                }
            },
            message = reader.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if !sink.frame(text.as_str()) {
                        let _ = writer.close().await;
                        break;
                    }
                }
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => {
                        sink.frame(text);
                    }
                    Err(e) => debug!(error = %e, len = bytes.len(), "non-UTF-8 binary frame dropped"),
                },
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame.map_or((None, String::new()), |f| {
                        (Some(u16::from(f.code)), f.reason.to_string())
                    });
                    info!(?code, reason = %reason, "socket closed by peer");
                    sink.closed(code, reason);
                    break;
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "socket read failed");
                    sink.error(e.to_string());
                    sink.closed(None, e.to_string());
                    break;
                }
                None => {
                    info!("socket stream ended");
                    sink.closed(None, "stream ended");
                    break;
                }
            },
        }
    }
}
