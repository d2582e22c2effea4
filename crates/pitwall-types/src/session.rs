//! Session credentials and connection states.

use serde::{Deserialize, Serialize};

/// Credentials obtained from one negotiation handshake.
///
/// Consumed by exactly one connection attempt and never persisted. A
/// reconnect always negotiates a fresh pair.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Opaque connection token issued by the hub.
    pub token: String,
    /// Session-affinity cookie header value.
    pub cookie: String,
}

impl Credentials {
    /// Create credentials from a token and affinity cookie.
    pub fn new(token: impl Into<String>, cookie: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            cookie: cookie.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &"<redacted>")
            .field("cookie", &"<redacted>")
            .finish()
    }
}

/// States of the client connection state machine.
///
/// Exactly one value exists per client; it also guards against starting a
/// second negotiation or connect while one is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Nothing in flight; either not started or waiting to retry after a
    /// failed negotiation.
    Idle,
    /// Negotiation request in flight.
    Negotiating,
    /// Socket open in progress.
    Connecting,
    /// Socket open and the subscription request sent.
    Subscribed,
    /// At least one frame received on the current socket.
    Streaming,
    /// Stop requested; flushing and closing.
    Closing,
    /// Socket lost; waiting for the backoff delay.
    Reconnecting,
}

impl ConnectionState {
    /// Whether a socket is open and ingesting.
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Subscribed | Self::Streaming)
    }

    /// Whether a negotiation or connect attempt is in flight.
    pub const fn is_attempting(self) -> bool {
        matches!(self, Self::Negotiating | Self::Connecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Negotiating => write!(f, "negotiating"),
            Self::Connecting => write!(f, "connecting"),
            Self::Subscribed => write!(f, "subscribed"),
            Self::Streaming => write!(f, "streaming"),
            Self::Closing => write!(f, "closing"),
            Self::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_hides_secrets() {
        let credentials = Credentials::new("secret-token", "GCLB=abc");
        let rendered = format!("{credentials:?}");
        assert!(!rendered.contains("secret-token"));
        assert!(!rendered.contains("GCLB"));
    }

    #[test]
    fn connected_states() {
        assert!(ConnectionState::Subscribed.is_connected());
        assert!(ConnectionState::Streaming.is_connected());
        assert!(!ConnectionState::Reconnecting.is_connected());
        assert!(ConnectionState::Negotiating.is_attempting());
        assert!(!ConnectionState::Idle.is_attempting());
    }
}
