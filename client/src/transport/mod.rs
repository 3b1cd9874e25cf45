//! # Transport
//!
//! The controller talks to the terminal through the [`Transport`] trait: a
//! single persistent duplex text connection with a non-blocking lifecycle.
//! Everything the connection has to say (state transitions, inbound frames,
//! errors) arrives in order on one [`TransportEvent`] channel handed over at
//! construction.
//!
//! [`websocket::WebSocketTransport`] is the production implementation.

pub mod websocket;

use thiserror::Error;

pub use websocket::WebSocketTransport;

/// Connection lifecycle. `Connecting` leads to `Connected` or
/// `Disconnected`; `Connected` only ever leads to `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

/// What a transport reports to its listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    StateChanged(ConnectionState),
    Received(String),
    Error(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid terminal url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid sub-protocol header: {0}")]
    InvalidSubprotocol(String),

    #[error("connect timed out after {0}ms")]
    Timeout(u64),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// One duplex connection to the terminal.
///
/// All methods return immediately. Results are reported as
/// [`TransportEvent`]s.
pub trait Transport: Send + Sync {
    /// Start connecting. Restarts a pending attempt; no-op when connected.
    fn connect(&self);

    /// Close gracefully. Cancels a pending attempt. Idempotent.
    fn disconnect(&self);

    /// Queue a text frame. Silently dropped unless connected.
    fn send(&self, text: String);

    fn state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Point future connect attempts at a new `ws://` url.
    fn set_url(&self, url: String);
}
