//! Error types for the core module

use thiserror::Error;

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in core operations
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database error
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Account not found
    #[error("Account not found: {0}")]
    AccountNotFound(i64),

    /// Folder not found
    #[error("Folder not found: {0}")]
    FolderNotFound(String),

    /// IMAP error
    #[error("IMAP error: {0}")]
    ImapError(String),

    /// POP3 error
    #[error("POP3 error: {0}")]
    Pop3Error(String),

    /// SMTP error
    #[error("SMTP error: {0}")]
    SmtpError(String),

    /// Neither delivery path accepted the message
    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),

    /// Configuration could not be read or parsed
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<sqlx::Error> for CoreError {
    fn from(e: sqlx::Error) -> Self {
        CoreError::DatabaseError(e.to_string())
    }
}

impl From<mailbridge_imap::ImapError> for CoreError {
    fn from(e: mailbridge_imap::ImapError) -> Self {
        CoreError::ImapError(e.to_string())
    }
}

impl From<mailbridge_pop3::Pop3Error> for CoreError {
    fn from(e: mailbridge_pop3::Pop3Error) -> Self {
        CoreError::Pop3Error(e.to_string())
    }
}

impl From<mailbridge_smtp::SmtpError> for CoreError {
    fn from(e: mailbridge_smtp::SmtpError) -> Self {
        CoreError::SmtpError(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::SerializationError(e.to_string())
    }
}
