//! Client error types.

use thiserror::Error;

/// Errors from relay sessions, negentropy and configuration.
///
/// Most relay-side failures never reach the caller as an error: the pool and
/// the query manager turn them into events, `None` or a failed `OkResponse`.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("timeout error: {0}")]
    Timeout(String),

    #[error("not connected")]
    NotConnected,

    /// A relay sent a frame that does not follow the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("negentropy error: {0}")]
    Negentropy(#[from] nostr::Nip77Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Client result type.
pub type Result<T> = std::result::Result<T, ClientError>;
