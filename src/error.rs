//! Error types for the WebSocket server

use std::io;

use thiserror::Error;

/// Result type alias for server operations
pub type Result<T> = std::result::Result<T, Error>;

/// Server error types
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or insufficient construction options
    #[error("Invalid configuration: {0}")]
    Configuration(String),
    /// Another server already claimed this path on the listener
    #[error("Path {path:?} is already claimed on this listener")]
    PathConflict {
        /// The contested path (`None` is the catch-all entry)
        path: Option<String>,
    },
    /// The upgrade request failed handshake validation (answered with 400)
    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    /// The admission predicate declined the client (answered with 401)
    #[error("Client rejected by admission policy")]
    AdmissionRejected,
    /// I/O error from a listener or socket
    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),
    /// Malformed HTTP request head
    #[error("Invalid HTTP: {0}")]
    InvalidHttp(&'static str),
    /// The server was closed
    #[error("Server closed")]
    ServerClosed,
    /// The connection is already closed
    #[error("Connection closed")]
    ConnectionClosed,
    /// An operation did not complete in time (an admission timeout answers 401)
    #[error("Timed out: {0}")]
    Timeout(&'static str),
}

/// Reasons an upgrade request fails validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HandshakeError {
    /// `Connection` does not carry the `upgrade` token
    #[error("missing upgrade connection token")]
    MissingConnectionUpgrade,
    /// `Upgrade` is absent or not `websocket`
    #[error("not a websocket upgrade")]
    NotWebSocket,
    /// `Sec-WebSocket-Key` is absent or empty
    #[error("missing handshake key")]
    MissingKey,
    /// `Sec-WebSocket-Version` is absent, non-numeric, or unsupported
    #[error("unsupported or missing version")]
    UnsupportedVersion,
}

impl Error {
    /// HTTP status a peer sees when an attempt fails with this error
    pub fn status(&self) -> Option<http::StatusCode> {
        match self {
            Error::Handshake(_) | Error::InvalidHttp(_) => Some(http::StatusCode::BAD_REQUEST),
            Error::AdmissionRejected | Error::ServerClosed | Error::Timeout(_) => {
                Some(http::StatusCode::UNAUTHORIZED)
            }
            _ => None,
        }
    }

    /// Returns true if this error is local to a single handshake attempt
    pub fn is_rejection(&self) -> bool {
        matches!(self, Error::Handshake(_) | Error::AdmissionRejected)
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Transport(e) => e,
            Error::ConnectionClosed | Error::ServerClosed => {
                io::Error::new(io::ErrorKind::BrokenPipe, e.to_string())
            }
            Error::Timeout(_) => io::Error::new(io::ErrorKind::TimedOut, e.to_string()),
            other => io::Error::other(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_messages() {
        assert_eq!(
            HandshakeError::MissingConnectionUpgrade.to_string(),
            "missing upgrade connection token"
        );
        assert_eq!(HandshakeError::NotWebSocket.to_string(), "not a websocket upgrade");
        assert_eq!(HandshakeError::MissingKey.to_string(), "missing handshake key");
        assert_eq!(
            HandshakeError::UnsupportedVersion.to_string(),
            "unsupported or missing version"
        );
    }

    #[test]
    fn test_rejection_status() {
        let err = Error::from(HandshakeError::MissingKey);
        assert_eq!(err.status(), Some(http::StatusCode::BAD_REQUEST));
        assert!(err.is_rejection());

        assert_eq!(
            Error::AdmissionRejected.status(),
            Some(http::StatusCode::UNAUTHORIZED)
        );
        assert!(Error::AdmissionRejected.is_rejection());

        let io = Error::from(io::Error::new(io::ErrorKind::AddrInUse, "in use"));
        assert_eq!(io.status(), None);
        assert!(!io.is_rejection());
    }

    #[test]
    fn test_into_io_error() {
        let err: io::Error = Error::ConnectionClosed.into();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);

        let err: io::Error = Error::Timeout("admission").into();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
