//! POP3 ingestion: dedup, retrieval and re-delivery for one external account

use crate::account::Account;
use crate::config::FetchConfig;
use crate::database::Database;
use crate::delivery::Delivery;
use crate::message::{fallback_key, header_block, normalize_pop3};
use async_trait::async_trait;
use mailbridge_pop3::{ListEntry, Pop3Client, Pop3Error, Pop3Result, UidlEntry};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// The POP3 commands the fetcher drives
#[async_trait]
pub trait Pop3Mailbox: Send {
    async fn login(&mut self, username: &str, password: &str) -> Pop3Result<()>;
    async fn uidl(&mut self) -> Pop3Result<Vec<UidlEntry>>;
    async fn list(&mut self) -> Pop3Result<Vec<ListEntry>>;
    async fn top(&mut self, index: u32, lines: u32) -> Pop3Result<Vec<u8>>;
    async fn retr(&mut self, index: u32) -> Pop3Result<Vec<u8>>;
    async fn dele(&mut self, index: u32) -> Pop3Result<()>;
    async fn quit(&mut self) -> Pop3Result<()>;
}

#[async_trait]
impl Pop3Mailbox for Pop3Client {
    async fn login(&mut self, username: &str, password: &str) -> Pop3Result<()> {
        Pop3Client::login(self, username, password).await
    }

    async fn uidl(&mut self) -> Pop3Result<Vec<UidlEntry>> {
        Pop3Client::uidl(self).await
    }

    async fn list(&mut self) -> Pop3Result<Vec<ListEntry>> {
        Pop3Client::list(self).await
    }

    async fn top(&mut self, index: u32, lines: u32) -> Pop3Result<Vec<u8>> {
        Pop3Client::top(self, index, lines).await
    }

    async fn retr(&mut self, index: u32) -> Pop3Result<Vec<u8>> {
        Pop3Client::retr(self, index).await
    }

    async fn dele(&mut self, index: u32) -> Pop3Result<()> {
        Pop3Client::dele(self, index).await
    }

    async fn quit(&mut self) -> Pop3Result<()> {
        Pop3Client::quit(self).await
    }
}

/// Opens a POP3 session for an account
#[async_trait]
pub trait Pop3Connector: Send + Sync {
    async fn connect(&self, account: &Account) -> Pop3Result<Box<dyn Pop3Mailbox>>;
}

/// Real network connections, plain or implicit TLS per account
pub struct NetworkConnector;

#[async_trait]
impl Pop3Connector for NetworkConnector {
    async fn connect(&self, account: &Account) -> Pop3Result<Box<dyn Pop3Mailbox>> {
        let client =
            Pop3Client::connect(&account.pop3_host, account.pop3_port, account.pop3_tls).await?;
        Ok(Box::new(client))
    }
}

/// Result of one `fetch_account` run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOutcome {
    /// Messages newly delivered during this run, including before a failure
    pub delivered: usize,
    /// Failure recorded on the account, if the run ended on the FAILED path
    pub error: Option<String>,
}

/// Where the session state machine currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connect,
    Login,
    Index,
    Message(u32),
    Quit,
}

impl Phase {
    /// Connect and login get the short deadline, everything else the transfer one
    fn deadline(self, config: &FetchConfig) -> Duration {
        match self {
            Phase::Connect | Phase::Login | Phase::Quit => config.connect_timeout(),
            Phase::Index | Phase::Message(_) => config.transfer_timeout(),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Connect => write!(f, "connect"),
            Phase::Login => write!(f, "login"),
            Phase::Index => write!(f, "message listing"),
            Phase::Message(index) => write!(f, "message {}", index),
            Phase::Quit => write!(f, "quit"),
        }
    }
}

/// What happened to a single message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageOutcome {
    Delivered,
    Duplicate,
    Skipped,
}

/// Runs the watchdog around one protocol event; expiry becomes `Pop3Error::Timeout`
async fn guarded<T>(
    phase: Phase,
    config: &FetchConfig,
    event: impl Future<Output = Pop3Result<T>>,
) -> Pop3Result<T> {
    match tokio::time::timeout(phase.deadline(config), event).await {
        Ok(result) => result,
        Err(_) => Err(Pop3Error::Timeout(phase.to_string())),
    }
}

/// The message stored on the account for a failed run
fn failure_message(error: &Pop3Error) -> String {
    match error {
        Pop3Error::AuthenticationFailed(msg) => format!("Authentication failed: {}", msg),
        Pop3Error::Timeout(phase) => format!("Timed out during {}", phase),
        Pop3Error::ConnectionFailed(msg) => format!("Connection failed: {}", msg),
        other => format!("Connection failed: {}", other),
    }
}

/// Whether the session is still in step with the server after `error`
fn reply_consumed(error: &Pop3Error) -> bool {
    matches!(
        error,
        Pop3Error::AuthenticationFailed(_) | Pop3Error::ServerError(_)
    )
}

/// Fetches external POP3 accounts into their owners' mailboxes
pub struct Pop3Fetcher {
    db: Arc<Database>,
    connector: Arc<dyn Pop3Connector>,
    delivery: Arc<dyn Delivery>,
    config: FetchConfig,
}

impl Pop3Fetcher {
    pub fn new(
        db: Arc<Database>,
        connector: Arc<dyn Pop3Connector>,
        delivery: Arc<dyn Delivery>,
        config: FetchConfig,
    ) -> Self {
        Self {
            db,
            connector,
            delivery,
            config,
        }
    }

    /// Fetch every new message of `account` and re-deliver it.
    ///
    /// `on_progress(processed, total)` is called once the index is known and
    /// after every message. Failures are recorded on the account; messages
    /// delivered before the failure stay delivered and counted.
    pub async fn fetch_account(
        &self,
        account: &Account,
        on_progress: &(dyn Fn(usize, usize) + Send + Sync),
    ) -> FetchOutcome {
        info!("Fetching POP3 account {}", account.label());
        let mut delivered = 0;

        let mut session = match guarded(
            Phase::Connect,
            &self.config,
            self.connector.connect(account),
        )
        .await
        {
            Ok(session) => session,
            Err(e) => return self.fail(account, None, &e, delivered).await,
        };

        match self
            .run_session(account, session.as_mut(), &mut delivered, on_progress)
            .await
        {
            Ok(()) => {
                if let Err(e) = guarded(Phase::Quit, &self.config, session.quit()).await {
                    warn!("QUIT failed for {}: {}", account.label(), e);
                }
                if let Err(e) = self.db.mark_account_fetched(account.id).await {
                    warn!("Failed to record fetch for {}: {}", account.label(), e);
                }
                info!(
                    "Fetched {} new message(s) for {}",
                    delivered,
                    account.label()
                );
                FetchOutcome {
                    delivered,
                    error: None,
                }
            }
            Err(e) => self.fail(account, Some(session.as_mut()), &e, delivered).await,
        }
    }

    /// Terminal FAILED path: record the error, QUIT best-effort, keep the partial count.
    ///
    /// QUIT is only sent when the last reply was read in full. After a timeout
    /// or transport error the stream may still hold part of a response, so the
    /// session is dropped instead and the server rolls back its DELEs.
    async fn fail(
        &self,
        account: &Account,
        session: Option<&mut dyn Pop3Mailbox>,
        error: &Pop3Error,
        delivered: usize,
    ) -> FetchOutcome {
        let message = failure_message(error);
        warn!("POP3 fetch for {} failed: {}", account.label(), message);

        match session {
            Some(session) if reply_consumed(error) => {
                if let Err(e) = guarded(Phase::Quit, &self.config, session.quit()).await {
                    debug!("QUIT after failure for {}: {}", account.label(), e);
                }
            }
            Some(_) => debug!("Dropping POP3 session for {} without QUIT", account.label()),
            None => {}
        }

        if let Err(e) = self.db.mark_account_failed(account.id, &message).await {
            warn!("Failed to record error for {}: {}", account.label(), e);
        }

        FetchOutcome {
            delivered,
            error: Some(message),
        }
    }

    async fn run_session(
        &self,
        account: &Account,
        session: &mut dyn Pop3Mailbox,
        delivered: &mut usize,
        on_progress: &(dyn Fn(usize, usize) + Send + Sync),
    ) -> Pop3Result<()> {
        guarded(
            Phase::Login,
            &self.config,
            session.login(&account.pop3_user, &account.pop3_pass),
        )
        .await?;

        let index = self.index(session).await?;
        let total = index.len();
        debug!("{} message(s) on server for {}", total, account.label());
        on_progress(0, total);

        let mut duplicates = 0;
        for (processed, (number, uidl)) in index.into_iter().enumerate() {
            match self.process_message(account, session, number, uidl).await? {
                MessageOutcome::Delivered => *delivered += 1,
                MessageOutcome::Duplicate => duplicates += 1,
                MessageOutcome::Skipped => {}
            }
            on_progress(processed + 1, total);
        }

        if duplicates > 0 {
            debug!(
                "Skipped {} already-delivered message(s) for {}",
                duplicates,
                account.label()
            );
        }
        Ok(())
    }

    /// Message numbers in ascending order with their UIDL, if the server has UIDL
    async fn index(&self, session: &mut dyn Pop3Mailbox) -> Pop3Result<Vec<(u32, Option<String>)>> {
        let mut index: Vec<(u32, Option<String>)> =
            match guarded(Phase::Index, &self.config, session.uidl()).await {
                Ok(entries) => entries.into_iter().map(|e| (e.index, Some(e.uid))).collect(),
                Err(e) if e.is_server_rejection() => {
                    debug!("UIDL unsupported ({}), falling back to LIST", e);
                    guarded(Phase::Index, &self.config, session.list())
                        .await?
                        .into_iter()
                        .map(|e| (e.index, None))
                        .collect()
                }
                Err(e) => return Err(e),
            };
        index.sort_by_key(|(number, _)| *number);
        Ok(index)
    }

    async fn process_message(
        &self,
        account: &Account,
        session: &mut dyn Pop3Mailbox,
        number: u32,
        uidl: Option<String>,
    ) -> Pop3Result<MessageOutcome> {
        let phase = Phase::Message(number);
        let uidl = uidl.filter(|uid| uid.chars().count() >= self.config.min_uidl_len);

        if let Some(key) = &uidl {
            match self.db.has_message_key(account.id, key).await {
                Ok(true) => {
                    self.delete_delivered(account, session, number).await?;
                    return Ok(MessageOutcome::Duplicate);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("Ledger lookup failed for message {}: {}", number, e);
                    return Ok(MessageOutcome::Skipped);
                }
            }
        }

        let raw = match guarded(phase, &self.config, session.retr(number)).await {
            Ok(raw) => raw,
            Err(e) if e.is_server_rejection() => {
                warn!("RETR {} rejected for {}: {}", number, account.label(), e);
                return Ok(MessageOutcome::Skipped);
            }
            Err(e) => return Err(e),
        };
        let message = normalize_pop3(&raw);

        let key = match uidl {
            Some(key) => key,
            None => {
                let headers = match guarded(phase, &self.config, session.top(number, 0)).await {
                    Ok(top) => normalize_pop3(&top),
                    Err(e) if e.is_server_rejection() => {
                        debug!("TOP {} rejected, using retrieved headers: {}", number, e);
                        header_block(&message).to_vec()
                    }
                    Err(e) => return Err(e),
                };
                let key = fallback_key(&headers);

                match self.db.has_message_key(account.id, &key).await {
                    Ok(true) => {
                        debug!("Message {} already delivered as {}", number, key);
                        self.delete_delivered(account, session, number).await?;
                        return Ok(MessageOutcome::Duplicate);
                    }
                    Ok(false) => key,
                    Err(e) => {
                        warn!("Ledger lookup failed for message {}: {}", number, e);
                        return Ok(MessageOutcome::Skipped);
                    }
                }
            }
        };

        match self.delivery.deliver(account, &message).await {
            Ok(route) => {
                debug!("Delivered message {} for {} via {:?}", number, account.label(), route);
                if let Err(e) = self.db.record_message_key(account.id, &key).await {
                    warn!("Failed to record {} in the ledger: {}", key, e);
                }
                self.delete_delivered(account, session, number).await?;
                Ok(MessageOutcome::Delivered)
            }
            Err(e) => {
                warn!(
                    "Delivery of message {} for {} failed: {}",
                    number,
                    account.label(),
                    e
                );
                Ok(MessageOutcome::Skipped)
            }
        }
    }

    /// DELE a delivered message unless the account keeps mail on the server
    async fn delete_delivered(
        &self,
        account: &Account,
        session: &mut dyn Pop3Mailbox,
        number: u32,
    ) -> Pop3Result<()> {
        if account.keep_on_server {
            return Ok(());
        }

        match guarded(Phase::Message(number), &self.config, session.dele(number)).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_server_rejection() => {
                warn!("DELE {} rejected for {}: {}", number, account.label(), e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::AccountStatus;
    use crate::testing::{RecordingDelivery, ScriptedPop3};
    use std::sync::Mutex;

    async fn setup(
        server: &ScriptedPop3,
        delivery: Arc<RecordingDelivery>,
        keep_on_server: bool,
    ) -> (Arc<Database>, Pop3Fetcher, Account) {
        let db = Arc::new(Database::open_memory().await.unwrap());
        let mut account = Account::new("alice@corp.example", "pop.example.net", "alice", "pw");
        account.keep_on_server = keep_on_server;
        account.id = db.save_account(&account).await.unwrap();

        let config = FetchConfig {
            connect_timeout_secs: 1,
            transfer_timeout_secs: 1,
            ..FetchConfig::default()
        };
        let fetcher = Pop3Fetcher::new(db.clone(), Arc::new(server.clone()), delivery, config);
        (db, fetcher, account)
    }

    fn no_progress(_: usize, _: usize) {}

    #[tokio::test]
    async fn test_second_fetch_delivers_nothing() {
        let server = ScriptedPop3::new(vec![
            ("uid-0001", b"Subject: one\r\n\r\nfirst\r\n".as_slice()),
            ("uid-0002", b"Subject: two\r\n\r\n.dotted\r\n".as_slice()),
        ]);
        let delivery = Arc::new(RecordingDelivery::new());
        let (db, fetcher, account) = setup(&server, delivery.clone(), true).await;

        let first = fetcher.fetch_account(&account, &no_progress).await;
        assert_eq!(first, FetchOutcome { delivered: 2, error: None });
        assert_eq!(delivery.delivered()[1], b"Subject: two\r\n\r\n.dotted\r\n".to_vec());

        let second = fetcher.fetch_account(&account, &no_progress).await;
        assert_eq!(second.delivered, 0);
        assert_eq!(server.count("RETR"), 2);
        assert_eq!(delivery.delivered().len(), 2);

        let stored = db.get_account(account.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AccountStatus::Success);
        assert!(stored.last_fetched_at.is_some());
    }

    #[tokio::test]
    async fn test_hash_key_catches_identical_uidl_less_messages() {
        let same = b"From: x@y.example\r\nSubject: no id\r\n\r\nbody\r\n".as_slice();
        let server = ScriptedPop3::without_uidl(vec![same, same]);
        let delivery = Arc::new(RecordingDelivery::new());
        let (db, fetcher, account) = setup(&server, delivery.clone(), true).await;

        let outcome = fetcher.fetch_account(&account, &no_progress).await;

        assert_eq!(outcome.delivered, 1);
        assert_eq!(server.count("LIST"), 1);
        assert_eq!(server.count("TOP"), 2);
        let key = fallback_key(b"From: x@y.example\r\nSubject: no id\r\n\r\n");
        assert!(key.starts_with("hash-"));
        assert!(db.has_message_key(account.id, &key).await.unwrap());
    }

    #[tokio::test]
    async fn test_short_uidl_uses_message_id() {
        let server = ScriptedPop3::new(vec![(
            "7",
            b"Message-ID: <m1@example.net>\r\n\r\nhi\r\n".as_slice(),
        )]);
        let delivery = Arc::new(RecordingDelivery::new());
        let (db, fetcher, account) = setup(&server, delivery, true).await;

        assert_eq!(fetcher.fetch_account(&account, &no_progress).await.delivered, 1);
        assert!(db
            .has_message_key(account.id, "msgid-<m1@example.net>")
            .await
            .unwrap());
        assert!(!db.has_message_key(account.id, "7").await.unwrap());
    }

    #[tokio::test]
    async fn test_delivery_failure_skips_only_that_message() {
        let server = ScriptedPop3::new(vec![
            ("uid-a", b"Subject: a\r\n\r\n".as_slice()),
            ("uid-b", b"Subject: poison\r\n\r\n".as_slice()),
            ("uid-c", b"Subject: c\r\n\r\n".as_slice()),
        ]);
        let delivery = Arc::new(RecordingDelivery::failing_on("poison"));
        let (db, fetcher, account) = setup(&server, delivery, false).await;

        let outcome = fetcher.fetch_account(&account, &no_progress).await;

        assert_eq!(outcome, FetchOutcome { delivered: 2, error: None });
        assert!(!db.has_message_key(account.id, "uid-b").await.unwrap());
        assert_eq!(server.commands_matching("DELE"), vec!["DELE 1", "DELE 3"]);
        assert_eq!(server.remaining(), 1);
    }

    #[tokio::test]
    async fn test_ledger_skip_still_deletes() {
        let server = ScriptedPop3::new(vec![("uid-old", b"Subject: old\r\n\r\n".as_slice())]);
        let delivery = Arc::new(RecordingDelivery::new());
        let (db, fetcher, account) = setup(&server, delivery.clone(), false).await;
        db.record_message_key(account.id, "uid-old").await.unwrap();

        let outcome = fetcher.fetch_account(&account, &no_progress).await;

        assert_eq!(outcome.delivered, 0);
        assert_eq!(server.count("RETR"), 0);
        assert_eq!(server.commands_matching("DELE"), vec!["DELE 1"]);
        assert!(delivery.delivered().is_empty());
    }

    #[tokio::test]
    async fn test_auth_failure_marks_account() {
        let server = ScriptedPop3::new(vec![("uid-a", b"Subject: a\r\n\r\n".as_slice())]);
        server.reject_login();
        let delivery = Arc::new(RecordingDelivery::new());
        let (db, fetcher, account) = setup(&server, delivery, true).await;

        let outcome = fetcher.fetch_account(&account, &no_progress).await;

        assert_eq!(outcome.delivered, 0);
        let error = outcome.error.unwrap();
        assert!(error.starts_with("Authentication failed: "), "{}", error);
        assert_eq!(server.count("QUIT"), 1);

        let stored = db.get_account(account.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AccountStatus::Failed);
        assert_eq!(stored.last_error.as_deref(), Some(error.as_str()));
    }

    #[tokio::test]
    async fn test_watchdog_keeps_partial_progress() {
        let server = ScriptedPop3::new(vec![
            ("uid-a", b"Subject: a\r\n\r\n".as_slice()),
            ("uid-b", b"Subject: b\r\n\r\n".as_slice()),
        ]);
        server.stall_on_retr(2);
        let delivery = Arc::new(RecordingDelivery::new());
        let (db, fetcher, account) = setup(&server, delivery, true).await;

        let outcome = fetcher.fetch_account(&account, &no_progress).await;

        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.error.as_deref(), Some("Timed out during message 2"));
        // The half-read RETR leaves the stream out of step, so no QUIT
        assert_eq!(server.count("QUIT"), 0);
        assert!(db.has_message_key(account.id, "uid-a").await.unwrap());
    }

    #[tokio::test]
    async fn test_progress_reported_per_message() {
        let server = ScriptedPop3::new(vec![
            ("uid-a", b"Subject: a\r\n\r\n".as_slice()),
            ("uid-b", b"Subject: b\r\n\r\n".as_slice()),
        ]);
        let delivery = Arc::new(RecordingDelivery::new());
        let (_db, fetcher, account) = setup(&server, delivery, true).await;

        let seen = Mutex::new(Vec::new());
        let record = |current: usize, total: usize| seen.lock().unwrap().push((current, total));
        fetcher.fetch_account(&account, &record).await;

        assert_eq!(*seen.lock().unwrap(), vec![(0, 2), (1, 2), (2, 2)]);
    }

    #[test]
    fn test_failure_messages() {
        assert_eq!(
            failure_message(&Pop3Error::ConnectionFailed("refused".into())),
            "Connection failed: refused"
        );
        assert_eq!(
            failure_message(&Pop3Error::Timeout(Phase::Login.to_string())),
            "Timed out during login"
        );
    }

    #[test]
    fn test_quit_only_when_stream_is_in_step() {
        assert!(reply_consumed(&Pop3Error::AuthenticationFailed("bad password".into())));
        assert!(reply_consumed(&Pop3Error::ServerError("no such message".into())));
        assert!(!reply_consumed(&Pop3Error::Timeout("message 1".into())));
        assert!(!reply_consumed(&Pop3Error::ProtocolError("garbage".into())));
    }
}
