//! Error types for relay-pool.

use std::time::Duration;

use thiserror::Error;

use crate::message::MessageError;
use crate::RelayUrl;

/// Errors surfaced by the relay pool and its transports.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A configured relay URL is not a usable ws:// or wss:// endpoint.
    #[error("invalid relay url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The pool has no relays to connect to.
    #[error("no relays configured")]
    NoRelaysConfigured,

    /// Every relay failed during connect. Carries one aggregate message.
    #[error("no relays reachable: {0}")]
    NoRelaysReachable(String),

    /// A newer connect() or a disconnect() replaced this attempt.
    #[error("connection attempt superseded")]
    Superseded,

    /// The caller asked for something the pool cannot do.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A network operation did not finish in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// WebSocket handshake or transport failure.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// The relay refused or dropped the connection.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The relay has no live link.
    #[error("not connected to {0}")]
    NotConnected(RelayUrl),

    /// Relay sent a frame that is not a valid NIP-01 message.
    #[error("message error: {0}")]
    Message(#[from] MessageError),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),
}
