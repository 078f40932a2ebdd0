//! Core logic for mailbridge
//!
//! POP3 ingestion with lossless re-delivery, IMAP cache reconciliation,
//! header repair, mail rules, the fetch scheduler and storage.

mod account;
pub mod codec;
mod config;
mod database;
mod delivery;
mod error;
mod ingest;
mod message;
mod progress;
mod reconcile;
mod rules;
mod scheduler;
mod session;

#[cfg(test)]
mod testing;

pub use account::{Account, AccountStatus};
pub use config::{Config, DeliveryConfig, FetchConfig, SyncConfig};
pub use database::{CachedMessage, Database, SyncEvent};
pub use delivery::{
    AppendRequest, Delivery, DeliveryRoute, ImapAppender, MailboxAppender, Redeliverer,
    RelayTransport,
};
pub use error::{CoreError, CoreResult};
pub use ingest::{FetchOutcome, NetworkConnector, Pop3Connector, Pop3Fetcher, Pop3Mailbox};
pub use progress::{MemoryProgress, Progress, ProgressStatus, ProgressStore};
pub use reconcile::{mailbox_summary, MailboxSummary, ReconcileReport, Reconciler};
pub use rules::{apply_rules, Condition, Rule, RuleAction, RuleEngine};
pub use scheduler::{AccountFetcher, Scheduler};
pub use session::MailboxSession;
