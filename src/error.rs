//! Error types shared by the server and client halves of the engine
//!
//! # Error Categories
//!
//! - `PreconditionFailure` - a connection was requested on a request that cannot stream
//! - `ClosedConnection` - write/close on a connection that is already closed
//! - `TransportFailure` - I/O error while writing or reading the stream
//! - `MalformedFrame` - a wire line the parser had to skip
//! - `InvalidState` - illegal lifecycle transition (e.g. double `open()`)
//!
//! Transport failures are recoverable: the broadcaster prunes the failing
//! subscriber, the event source reconnects.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Result type for SSE operations
pub type SseResult<T> = Result<T, SseError>;

/// Errors raised by the SSE engine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SseError {
    /// The request context cannot be suspended into a streaming response
    #[error("precondition failed: {0}")]
    PreconditionFailure(String),

    /// The connection was already closed
    #[error("connection is closed")]
    ClosedConnection,

    /// The underlying transport failed (broken pipe, reset, read stall)
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// A wire line was structurally invalid and skipped
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Illegal state transition
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The server answered the streaming request with an error status
    #[error("server responded with status {0}")]
    Status(StatusCode),

    /// The server answered with something other than an event stream
    #[error("unexpected content type: {0}")]
    ContentType(String),

    /// An outbound event violates its invariants
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// The payload could not be rendered for its media type
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl SseError {
    /// Create a new transport failure
    pub fn transport(message: impl Into<String>) -> Self {
        Self::TransportFailure(message.into())
    }

    /// Create a new precondition failure
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::PreconditionFailure(message.into())
    }

    /// Create a new invalid-state error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    /// Create a new serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    /// Whether the error ends a connection but leaves room for a retry
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::TransportFailure(_))
    }
}

impl From<serde_json::Error> for SseError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(format!("JSON error: {}", err))
    }
}

impl From<std::io::Error> for SseError {
    fn from(err: std::io::Error) -> Self {
        Self::transport(err.to_string())
    }
}

impl From<reqwest::Error> for SseError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) if err.is_status() => Self::Status(status),
            _ => Self::transport(err.to_string()),
        }
    }
}

impl IntoResponse for SseError {
    fn into_response(self) -> Response {
        let status = match &self {
            SseError::InvalidEvent(_) | SseError::Serialization(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}
