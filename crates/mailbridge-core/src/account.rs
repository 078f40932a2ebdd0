//! External POP3 account model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of the most recent fetch attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccountStatus {
    Pending,
    Success,
    Failed,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Pending => "PENDING",
            AccountStatus::Success => "SUCCESS",
            AccountStatus::Failed => "FAILED",
        }
    }

    /// Unknown values read back as `Pending`
    pub fn parse(value: &str) -> Self {
        match value {
            "SUCCESS" => AccountStatus::Success,
            "FAILED" => AccountStatus::Failed,
            _ => AccountStatus::Pending,
        }
    }
}

/// An external POP3 mailbox fetched on behalf of a user
#[derive(Debug, Clone)]
pub struct Account {
    /// Row id, 0 until saved
    pub id: i64,
    /// Owner; also the re-delivery recipient
    pub user_email: String,
    pub pop3_host: String,
    pub pop3_port: u16,
    /// Implicit TLS
    pub pop3_tls: bool,
    pub pop3_user: String,
    pub pop3_pass: String,
    /// When false, delivered messages are DELEd
    pub keep_on_server: bool,
    pub is_active: bool,
    pub status: AccountStatus,
    pub last_error: Option<String>,
    pub last_fetched_at: Option<DateTime<Utc>>,
    /// Password for the user's own IMAP mailbox; enables append delivery
    pub imap_pass: Option<String>,
}

impl Account {
    /// A new, unsaved account with the usual defaults (port 110, no TLS, keep mail)
    pub fn new(
        user_email: impl Into<String>,
        pop3_host: impl Into<String>,
        pop3_user: impl Into<String>,
        pop3_pass: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            user_email: user_email.into(),
            pop3_host: pop3_host.into(),
            pop3_port: 110,
            pop3_tls: false,
            pop3_user: pop3_user.into(),
            pop3_pass: pop3_pass.into(),
            keep_on_server: true,
            is_active: true,
            status: AccountStatus::Pending,
            last_error: None,
            last_fetched_at: None,
            imap_pass: None,
        }
    }

    /// Progress label shown while this account is fetched
    pub fn label(&self) -> String {
        format!("{}@{}", self.pop3_user, self.pop3_host)
    }
}
