//! Error types for debug interconnect operations.

use thiserror::Error;

/// Errors returned by host modules, gateways, workers and device transports.
///
/// The enum is `Clone` and `PartialEq` so that a worker thread can report a
/// failure to its owner inside a status message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiError {
    /// The operation requires an established connection that is absent.
    #[error("not connected")]
    NotConnected,

    /// The connect handshake did not complete.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// No response arrived within the bounded wait.
    #[error("timed out")]
    Timeout,

    /// Generic failure or protocol violation (malformed frame, unexpected
    /// tag, rejected command).
    #[error("failure: {0}")]
    Failure(String),

    /// Another register request or connection transition is already in
    /// flight on this instance.
    #[error("another request is already in flight")]
    Busy,

    /// Caller supplied an argument the protocol cannot express
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl DiError {
    /// Shorthand for [`DiError::Failure`].
    pub fn failure(msg: impl Into<String>) -> Self {
        Self::Failure(msg.into())
    }

    /// Shorthand for [`DiError::ConnectionFailed`].
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed(msg.into())
    }

    /// Shorthand for [`DiError::InvalidArgument`].
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}

impl From<std::io::Error> for DiError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected => Self::NotConnected,
            ErrorKind::WouldBlock | ErrorKind::TimedOut => Self::Timeout,
            _ => Self::Failure(err.to_string()),
        }
    }
}

/// Result type for debug interconnect operations
pub type DiResult<T> = Result<T, DiError>;
