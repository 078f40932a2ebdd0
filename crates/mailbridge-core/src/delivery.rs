//! Lossless re-delivery of fetched messages into the user's own mailbox

use crate::account::Account;
use crate::config::DeliveryConfig;
use crate::message::{imap_internal_date, message_date};
use crate::{CoreError, CoreResult};
use async_trait::async_trait;
use mailbridge_imap::ImapClient;
use mailbridge_smtp::{inject_provenance_headers, RelayClient};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Which path accepted a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryRoute {
    /// Appended straight into the target folder
    ImapAppend,
    /// Re-injected through the local relay
    SmtpRelay,
}

/// Hands one normalized message to its owner's mailbox
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, account: &Account, raw: &[u8]) -> CoreResult<DeliveryRoute>;
}

/// One APPEND into a user's mailbox
#[derive(Debug, Clone, Copy)]
pub struct AppendRequest<'a> {
    pub user_email: &'a str,
    pub password: &'a str,
    pub folder: &'a str,
    pub flags: &'a [&'a str],
    /// IMAP `date-time`, e.g. `05-Mar-2024 09:15:00 +0900`
    pub internal_date: &'a str,
}

/// Stores a message directly in a user's IMAP folder
#[async_trait]
pub trait MailboxAppender: Send + Sync {
    async fn append(&self, request: AppendRequest<'_>, raw: &[u8]) -> CoreResult<()>;
}

/// Submits a message to the local MTA for exactly one recipient
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn reinject(&self, deliver_to: &str, raw: &[u8]) -> CoreResult<()>;
}

/// Short-lived IMAP sessions against the user mailbox server
pub struct ImapAppender {
    host: String,
    port: u16,
}

impl ImapAppender {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

#[async_trait]
impl MailboxAppender for ImapAppender {
    /// Login, APPEND, logout
    async fn append(&self, request: AppendRequest<'_>, raw: &[u8]) -> CoreResult<()> {
        let mut client = ImapClient::new(self.host.clone(), self.port);
        client
            .authenticate_login(request.user_email, request.password)
            .await?;

        let appended = client
            .append(request.folder, raw, request.flags, Some(request.internal_date))
            .await;

        if let Err(e) = client.logout().await {
            debug!("IMAP logout after append failed: {}", e);
        }

        appended?;
        Ok(())
    }
}

#[async_trait]
impl RelayTransport for RelayClient {
    async fn reinject(&self, deliver_to: &str, raw: &[u8]) -> CoreResult<()> {
        RelayClient::reinject(self, deliver_to, raw).await?;
        Ok(())
    }
}

/// Production delivery: IMAP APPEND when the account has a mailbox
/// password, SMTP re-injection otherwise or when the append fails
pub struct Redeliverer {
    config: DeliveryConfig,
    appender: Arc<dyn MailboxAppender>,
    relay: Arc<dyn RelayTransport>,
}

impl Redeliverer {
    pub fn new(config: DeliveryConfig) -> Self {
        let appender = Arc::new(ImapAppender::new(config.imap_host.clone(), config.imap_port));
        let relay = Arc::new(RelayClient::new(config.smtp_host.clone(), config.smtp_port));
        Self::with_transports(config, appender, relay)
    }

    pub fn with_transports(
        config: DeliveryConfig,
        appender: Arc<dyn MailboxAppender>,
        relay: Arc<dyn RelayTransport>,
    ) -> Self {
        Self {
            config,
            appender,
            relay,
        }
    }

    /// APPEND with `\Seen` and the message's own date
    async fn append(&self, account: &Account, password: &str, raw: &[u8]) -> CoreResult<()> {
        let date = imap_internal_date(&message_date(raw));
        let request = AppendRequest {
            user_email: &account.user_email,
            password,
            folder: &self.config.target_folder,
            flags: &["\\Seen"],
            internal_date: &date,
        };
        self.appender.append(request, raw).await
    }

    async fn reinject(&self, account: &Account, raw: &[u8]) -> CoreResult<()> {
        let stamped = inject_provenance_headers(raw, &self.config.agent, &account.user_email);
        self.relay.reinject(&account.user_email, &stamped).await
    }
}

#[async_trait]
impl Delivery for Redeliverer {
    async fn deliver(&self, account: &Account, raw: &[u8]) -> CoreResult<DeliveryRoute> {
        if let Some(password) = account.imap_pass.as_deref() {
            match self.append(account, password, raw).await {
                Ok(()) => {
                    debug!("Appended message for {}", account.user_email);
                    return Ok(DeliveryRoute::ImapAppend);
                }
                Err(e) => warn!(
                    "IMAP append for {} failed, falling back to relay: {}",
                    account.user_email, e
                ),
            }
        }

        self.reinject(account, raw)
            .await
            .map_err(|e| CoreError::DeliveryFailed(e.to_string()))?;
        info!("Re-injected message for {}", account.user_email);
        Ok(DeliveryRoute::SmtpRelay)
    }
}
