//! Error types for firehose-nozzle

use thiserror::Error;

/// Errors returned by nozzle construction and lifecycle calls
#[derive(Debug, Error)]
pub enum NozzleError {
    /// Missing or invalid configuration field
    #[error("Configuration error: {0}")]
    Config(String),

    /// Auth endpoint answered with a non-success status
    #[error("Failed to fetch token from '{endpoint}': status {status}")]
    Auth { endpoint: String, status: u16 },

    /// Auth endpoint answered with a body we could not use
    #[error("Invalid token response from '{endpoint}': {reason}")]
    AuthResponse { endpoint: String, reason: String },

    /// Deadline exceeded while talking to the auth endpoint
    #[error("Request timeout: {0}")]
    Timeout(String),

    /// Network failure below the HTTP status level
    #[error("HTTP error: {0}")]
    Http(String),

    /// Source could not be started
    #[error("Source error: {0}")]
    Source(String),

    /// `close()` called on a consumer or source that is not running
    #[error("Not running: {0}")]
    NotRunning(String),
}

/// Result type alias for nozzle operations
pub type Result<T> = std::result::Result<T, NozzleError>;

/// Errors delivered on the transport error sequence
///
/// These come from the event source verbatim; the nozzle forwards them to
/// the application and only ever inspects [`TransportError::close_code`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The remote side closed the connection
    #[error("Connection closed with code {code}: {reason}")]
    Closed { code: u16, reason: String },

    /// The websocket upgrade was refused
    #[error("Handshake rejected with status {status}")]
    Handshake { status: u16 },

    /// Connect, read or TLS failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// A frame could not be decoded into an envelope
    #[error("Failed to decode envelope: {0}")]
    Decode(String),

    /// The connection request could not be built
    #[error("Invalid request: {0}")]
    Request(String),
}

impl TransportError {
    /// Close code carried by a closure error, if any
    pub fn close_code(&self) -> Option<u16> {
        match self {
            TransportError::Closed { code, .. } => Some(*code),
            _ => None,
        }
    }
}
