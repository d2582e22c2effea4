//! Error types for the client.
//!
//! Negotiation and connection failures never escape the controller: they
//! are logged, reported to observers, and retried after the backoff.
//! [`ClientError`] covers what can fail before the controller is running.

use pitwall_core::ConfigError;
use pitwall_store::StoreError;

/// Errors from the negotiation handshake.
#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    /// The negotiate URL could not be built.
    #[error("invalid negotiate URL: {0}")]
    Url(String),

    /// The HTTP request failed (DNS, TLS, timeout, connection reset).
    #[error("negotiate request failed: {0}")]
    Request(String),

    /// The hub answered with a non-success status.
    #[error("negotiate returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },

    /// The response body was not the expected JSON.
    #[error("negotiate response malformed: {0}")]
    Malformed(String),

    /// The response carried no connection token.
    #[error("negotiate response missing ConnectionToken")]
    MissingToken,

    /// The response set no session-affinity cookie.
    #[error("negotiate response set no cookie")]
    MissingCookie,
}

/// Errors from opening or using the streaming socket.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The connect URL or handshake request could not be built.
    #[error("invalid connect request: {0}")]
    Request(String),

    /// The socket did not open before the deadline.
    #[error("connect timed out")]
    Timeout,

    /// The socket handshake failed.
    #[error("socket handshake failed: {0}")]
    Handshake(String),

    /// The socket is no longer accepting writes.
    #[error("socket closed")]
    Closed,
}

/// Errors that prevent the client from starting or accepting commands.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Configuration could not be loaded.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// The durable history could not be opened.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The client has already stopped.
    #[error("client stopped")]
    Stopped,
}
