//! Crate-wide error taxonomy (§7).

use thiserror::Error;

/// The engine's error taxonomy. Each variant maps to one of the error
/// kinds enumerated in §7; callers match on kind rather than string
/// content.
#[derive(Error, Debug)]
pub enum Error {
    /// Underlying socket or HTTP transport failure; triggers reconnect.
    #[error("transport error on {venue}: {source}")]
    Transport {
        venue: String,
        #[source]
        source: anyhow::Error,
    },

    /// Non-2xx venue response; body preserved for the caller.
    #[error("http {status} from {venue} {endpoint}: {body}")]
    HttpStatus {
        venue: String,
        endpoint: String,
        status: u16,
        body: String,
    },

    /// Admission could not be achieved within the venue's maximum
    /// window; normally absorbed by waiting instead of raised.
    #[error("rate limit exhausted for {venue} weight kind {kind}")]
    RateLimitExhausted { venue: String, kind: String },

    /// Any failure from the order-submission RPC.
    #[error("order placement failed on {venue}: {reason}")]
    OrderPlacementError { venue: String, reason: String },

    /// Attempted mutation of an order already terminal at the venue;
    /// the Account treats this as success.
    #[error("order {0} already closed")]
    OrderClosed(String),

    /// Read against an order book before its first snapshot.
    #[error("order book for {0} not initialized")]
    NotInitialized(String),

    /// Subscribe/order on a pair absent from `exchange_info`.
    #[error("unknown market {0}")]
    UnknownMarket(String),

    /// Signing or WS-login rejected; fatal for that account.
    #[error("authentication failed for {venue}: {reason}")]
    AuthFailed { venue: String, reason: String },

    /// An internal consistency check failed; state is forcibly
    /// refreshed from REST after this is logged.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
