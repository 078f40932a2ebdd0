//! Error types for POP3 operations

use thiserror::Error;

/// Result type for POP3 operations
pub type Pop3Result<T> = Result<T, Pop3Error>;

/// Errors that can occur during a POP3 session
#[derive(Debug, Error)]
pub enum Pop3Error {
    /// Connection failed or was closed by the peer
    #[error("Failed to connect to POP3 server: {0}")]
    ConnectionFailed(String),

    /// USER/PASS rejected
    #[error("POP3 authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Server answered `-ERR`
    #[error("POP3 server error: {0}")]
    ServerError(String),

    /// Response did not follow the protocol
    #[error("Malformed POP3 response: {0}")]
    ProtocolError(String),

    /// TLS error
    #[error("TLS error: {0}")]
    TlsError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// A protocol phase exceeded its deadline
    #[error("Timed out during {0}")]
    Timeout(String),

    /// Session is not connected
    #[error("POP3 session is not connected")]
    NotConnected,
}

impl Pop3Error {
    /// `-ERR` replies leave the session usable; everything else does not
    pub fn is_server_rejection(&self) -> bool {
        matches!(self, Pop3Error::ServerError(_))
    }
}
