//! In-memory fakes for the network seams

use crate::account::Account;
use crate::delivery::{AppendRequest, Delivery, DeliveryRoute, MailboxAppender, RelayTransport};
use crate::ingest::{FetchOutcome, Pop3Connector, Pop3Mailbox};
use crate::scheduler::AccountFetcher;
use crate::session::MailboxSession;
use crate::{CoreError, CoreResult};
use async_trait::async_trait;
use mailbridge_imap::{EmailAddress, Envelope, Folder, MessageFlags, MessageHeader};
use mailbridge_pop3::{ListEntry, Pop3Error, Pop3Result, UidlEntry};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

// --- IMAP ---

pub struct FakeFolder {
    pub uidvalidity: u32,
    pub attributes: Vec<String>,
    pub messages: BTreeMap<u32, MessageHeader>,
}

/// A scripted IMAP server with a few folders
pub struct FakeMailbox {
    primary: String,
    pub folders: BTreeMap<String, FakeFolder>,
    pub selected: Option<String>,
    /// Folders whose SELECT fails
    pub broken: HashSet<String>,
    pub fail_moves: bool,
    pub selects: Vec<String>,
    pub metadata_batches: Vec<Vec<u32>>,
    pub flag_calls: Vec<(u32, Vec<String>)>,
    pub move_calls: Vec<(u32, String)>,
    pub closes: usize,
    /// SELECT and CLOSE, shared with other sessions on the same server
    pub journal: Arc<Mutex<Vec<String>>>,
    /// `fetch_all_flags` signals the first and then waits on the second
    pub hold_flags: Option<(Arc<Notify>, Arc<Notify>)>,
}

fn fake_header(uid: u32, subject: &str, seen: bool, flagged: bool) -> MessageHeader {
    let raw_header = format!(
        "From: Billing <billing@vendor.example>\r\nTo: alice@corp.example\r\nSubject: {}\r\n\r\n",
        subject
    );
    MessageHeader {
        uid,
        envelope: Envelope {
            message_id: Some(format!("<{}@vendor.example>", uid)),
            subject: Some(subject.to_string()),
            from: vec![EmailAddress::new(
                Some("Billing".into()),
                "billing@vendor.example".into(),
            )],
            to: vec![EmailAddress::new(None, "alice@corp.example".into())],
            date: Some("Tue, 5 Mar 2024 09:15:00 +0900".into()),
            in_reply_to: None,
        },
        flags: MessageFlags {
            seen,
            flagged,
            ..Default::default()
        },
        size: raw_header.len() as u32,
        has_attachments: false,
        raw_header: raw_header.into_bytes(),
    }
}

impl FakeMailbox {
    pub fn new(name: &str, uidvalidity: u32) -> Self {
        let mut folders = BTreeMap::new();
        folders.insert(
            name.to_string(),
            FakeFolder {
                uidvalidity,
                attributes: Vec::new(),
                messages: BTreeMap::new(),
            },
        );

        Self {
            primary: name.to_string(),
            folders,
            selected: None,
            broken: HashSet::new(),
            fail_moves: false,
            selects: Vec::new(),
            metadata_batches: Vec::new(),
            flag_calls: Vec::new(),
            move_calls: Vec::new(),
            closes: 0,
            journal: Arc::new(Mutex::new(Vec::new())),
            hold_flags: None,
        }
    }

    pub fn with_journal(mut self, journal: Arc<Mutex<Vec<String>>>) -> Self {
        self.journal = journal;
        self
    }

    pub fn holding_flags(mut self, started: Arc<Notify>, release: Arc<Notify>) -> Self {
        self.hold_flags = Some((started, release));
        self
    }

    fn note(&self, event: String) {
        self.journal.lock().unwrap().push(event);
    }

    /// Add a message to the folder the mailbox was created with
    pub fn with_message(mut self, uid: u32, subject: &str, seen: bool, flagged: bool) -> Self {
        let primary = self.primary.clone();
        self.add_message(&primary, uid, subject, seen, flagged);
        self
    }

    pub fn with_folder(mut self, path: &str, attributes: &[&str], uidvalidity: u32) -> Self {
        self.folders.insert(
            path.to_string(),
            FakeFolder {
                uidvalidity,
                attributes: attributes.iter().map(|a| a.to_string()).collect(),
                messages: BTreeMap::new(),
            },
        );
        self
    }

    pub fn add_message(&mut self, folder: &str, uid: u32, subject: &str, seen: bool, flagged: bool) {
        if let Some(folder) = self.folders.get_mut(folder) {
            folder
                .messages
                .insert(uid, fake_header(uid, subject, seen, flagged));
        }
    }

    pub fn contains(&self, folder: &str, uid: u32) -> bool {
        self.folders
            .get(folder)
            .is_some_and(|f| f.messages.contains_key(&uid))
    }

    fn folder(&self, path: &str) -> Folder {
        let fake = &self.folders[path];
        let mut folder = Folder::new(path.to_string(), Some('/'), fake.attributes.clone());
        folder.uidvalidity = Some(fake.uidvalidity);
        folder.message_count = Some(fake.messages.len() as u32);
        folder.unread_count = Some(fake.messages.values().filter(|m| !m.flags.seen).count() as u32);
        folder.uid_next = Some(fake.messages.keys().max().map_or(1, |uid| uid + 1));
        folder
    }

    fn selected_folder(&mut self) -> CoreResult<&mut FakeFolder> {
        let path = self
            .selected
            .clone()
            .ok_or_else(|| CoreError::ImapError("No mailbox selected".into()))?;
        self.folders
            .get_mut(&path)
            .ok_or(CoreError::FolderNotFound(path))
    }
}

#[async_trait]
impl MailboxSession for FakeMailbox {
    async fn list_folders(&mut self) -> CoreResult<Vec<Folder>> {
        Ok(self.folders.keys().map(|path| self.folder(path)).collect())
    }

    async fn folder_status(&mut self, path: &str) -> CoreResult<Folder> {
        if !self.folders.contains_key(path) {
            return Err(CoreError::FolderNotFound(path.to_string()));
        }
        Ok(self.folder(path))
    }

    async fn select(&mut self, path: &str) -> CoreResult<Folder> {
        self.selects.push(path.to_string());
        self.note(format!("select {}", path));
        if self.broken.contains(path) || !self.folders.contains_key(path) {
            return Err(CoreError::FolderNotFound(path.to_string()));
        }
        self.selected = Some(path.to_string());
        Ok(self.folder(path))
    }

    async fn fetch_all_flags(&mut self) -> CoreResult<Vec<(u32, MessageFlags)>> {
        if let Some((started, release)) = self.hold_flags.clone() {
            started.notify_one();
            release.notified().await;
        }
        Ok(self
            .selected_folder()?
            .messages
            .iter()
            .map(|(uid, m)| (*uid, m.flags.clone()))
            .collect())
    }

    async fn fetch_metadata(&mut self, uids: &[u32]) -> CoreResult<Vec<MessageHeader>> {
        self.metadata_batches.push(uids.to_vec());
        let folder = self.selected_folder()?;
        Ok(uids
            .iter()
            .filter_map(|uid| folder.messages.get(uid).cloned())
            .collect())
    }

    async fn move_message(&mut self, uid: u32, target: &str) -> CoreResult<()> {
        if self.fail_moves {
            return Err(CoreError::ImapError(format!("[TRYCREATE] {}", target)));
        }
        self.move_calls.push((uid, target.to_string()));

        let moved = self
            .selected_folder()
            .ok()
            .and_then(|source| source.messages.remove(&uid));
        if let (Some(message), Some(dest)) = (moved, self.folders.get_mut(target)) {
            dest.messages.insert(uid, message);
        }
        Ok(())
    }

    async fn add_flags(&mut self, uid: u32, flags: &[&str]) -> CoreResult<()> {
        self.flag_calls
            .push((uid, flags.iter().map(|f| f.to_string()).collect()));

        if let Ok(folder) = self.selected_folder() {
            if let Some(message) = folder.messages.get_mut(&uid) {
                for flag in flags {
                    match *flag {
                        "\\Deleted" => message.flags.deleted = true,
                        "\\Flagged" => message.flags.flagged = true,
                        "\\Seen" => message.flags.seen = true,
                        other => {
                            message.flags.custom.insert(other.to_lowercase());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> CoreResult<()> {
        if let Ok(folder) = self.selected_folder() {
            folder.messages.retain(|_, m| !m.flags.deleted);
        }
        self.selected = None;
        self.closes += 1;
        self.note("close".to_string());
        Ok(())
    }
}

// --- POP3 ---

#[derive(Default)]
pub struct Pop3State {
    /// (UIDL, raw dot-stuffed message) by message number - 1
    pub messages: Vec<(String, Vec<u8>)>,
    pub uidl_supported: bool,
    pub reject_login: bool,
    pub stall_on_retr: Option<u32>,
    pub commands: Vec<String>,
}

/// A POP3 server shared by every session it hands out; DELEs apply on QUIT
#[derive(Clone, Default)]
pub struct ScriptedPop3 {
    pub state: Arc<Mutex<Pop3State>>,
}

impl ScriptedPop3 {
    pub fn new(messages: Vec<(&str, &[u8])>) -> Self {
        let state = Pop3State {
            messages: messages
                .into_iter()
                .map(|(uid, raw)| (uid.to_string(), stuff(raw)))
                .collect(),
            uidl_supported: true,
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn without_uidl(messages: Vec<&[u8]>) -> Self {
        let server = Self::new(messages.into_iter().map(|raw| ("", raw)).collect());
        server.state.lock().unwrap().uidl_supported = false;
        server
    }

    pub fn reject_login(&self) {
        self.state.lock().unwrap().reject_login = true;
    }

    pub fn stall_on_retr(&self, index: u32) {
        self.state.lock().unwrap().stall_on_retr = Some(index);
    }

    pub fn commands_matching(&self, prefix: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .commands
            .iter()
            .filter(|c| c.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.commands_matching(prefix).len()
    }

    pub fn remaining(&self) -> usize {
        self.state.lock().unwrap().messages.len()
    }
}

/// Dot-stuff a message the way a server sends it
fn stuff(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    for line in raw.split_inclusive(|b| *b == b'\n') {
        if line.starts_with(b".") {
            out.push(b'.');
        }
        out.extend_from_slice(line);
    }
    out
}

struct ScriptedSession {
    state: Arc<Mutex<Pop3State>>,
    deleted: Vec<u32>,
}

impl ScriptedSession {
    fn log(&self, command: String) {
        self.state.lock().unwrap().commands.push(command);
    }

    fn message(&self, index: u32) -> Pop3Result<Vec<u8>> {
        let state = self.state.lock().unwrap();
        index
            .checked_sub(1)
            .and_then(|i| state.messages.get(i as usize))
            .map(|(_, raw)| raw.clone())
            .ok_or_else(|| Pop3Error::ServerError("no such message".into()))
    }
}

#[async_trait]
impl Pop3Mailbox for ScriptedSession {
    async fn login(&mut self, _username: &str, _password: &str) -> Pop3Result<()> {
        self.log("LOGIN".into());
        if self.state.lock().unwrap().reject_login {
            return Err(Pop3Error::AuthenticationFailed("invalid credentials".into()));
        }
        Ok(())
    }

    async fn uidl(&mut self) -> Pop3Result<Vec<UidlEntry>> {
        self.log("UIDL".into());
        let state = self.state.lock().unwrap();
        if !state.uidl_supported {
            return Err(Pop3Error::ServerError("unknown command".into()));
        }
        Ok(state
            .messages
            .iter()
            .enumerate()
            .map(|(i, (uid, _))| UidlEntry {
                index: i as u32 + 1,
                uid: uid.clone(),
            })
            .collect())
    }

    async fn list(&mut self) -> Pop3Result<Vec<ListEntry>> {
        self.log("LIST".into());
        let state = self.state.lock().unwrap();
        Ok(state
            .messages
            .iter()
            .enumerate()
            .map(|(i, (_, raw))| ListEntry {
                index: i as u32 + 1,
                size: raw.len() as u64,
            })
            .collect())
    }

    async fn top(&mut self, index: u32, _lines: u32) -> Pop3Result<Vec<u8>> {
        self.log(format!("TOP {}", index));
        let raw = self.message(index)?;
        let mut headers = crate::message::header_block(&raw).to_vec();
        headers.extend_from_slice(b"\r\n\r\n");
        Ok(headers)
    }

    async fn retr(&mut self, index: u32) -> Pop3Result<Vec<u8>> {
        self.log(format!("RETR {}", index));
        let stall = self.state.lock().unwrap().stall_on_retr == Some(index);
        if stall {
            std::future::pending::<()>().await;
        }
        self.message(index)
    }

    async fn dele(&mut self, index: u32) -> Pop3Result<()> {
        self.log(format!("DELE {}", index));
        self.deleted.push(index);
        Ok(())
    }

    async fn quit(&mut self) -> Pop3Result<()> {
        self.log("QUIT".into());
        let mut state = self.state.lock().unwrap();
        let mut number = 0;
        let deleted = std::mem::take(&mut self.deleted);
        state.messages.retain(|_| {
            number += 1;
            !deleted.contains(&number)
        });
        Ok(())
    }
}

#[async_trait]
impl Pop3Connector for ScriptedPop3 {
    async fn connect(&self, _account: &Account) -> Pop3Result<Box<dyn Pop3Mailbox>> {
        Ok(Box::new(ScriptedSession {
            state: Arc::clone(&self.state),
            deleted: Vec::new(),
        }))
    }
}

// --- delivery ---

/// Accepts every message unless it contains `reject_marker`
#[derive(Default)]
pub struct RecordingDelivery {
    reject_marker: Option<String>,
    delivered: Mutex<Vec<Vec<u8>>>,
}

impl RecordingDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(marker: &str) -> Self {
        Self {
            reject_marker: Some(marker.to_string()),
            ..Self::default()
        }
    }

    pub fn delivered(&self) -> Vec<Vec<u8>> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl Delivery for RecordingDelivery {
    async fn deliver(&self, _account: &Account, raw: &[u8]) -> CoreResult<DeliveryRoute> {
        if let Some(marker) = &self.reject_marker {
            if raw
                .windows(marker.len())
                .any(|w| w == marker.as_bytes())
            {
                return Err(CoreError::DeliveryFailed("relay refused".into()));
            }
        }
        self.delivered.lock().unwrap().push(raw.to_vec());
        Ok(DeliveryRoute::SmtpRelay)
    }
}

/// An APPEND as the appender saw it
#[derive(Debug, Clone)]
pub struct RecordedAppend {
    pub user_email: String,
    pub password: String,
    pub folder: String,
    pub flags: Vec<String>,
    pub internal_date: String,
    pub raw: Vec<u8>,
}

/// Records every APPEND; fails all of them when built with `failing`
#[derive(Default)]
pub struct RecordingAppender {
    fail: bool,
    appends: Mutex<Vec<RecordedAppend>>,
}

impl RecordingAppender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn appends(&self) -> Vec<RecordedAppend> {
        self.appends.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailboxAppender for RecordingAppender {
    async fn append(&self, request: AppendRequest<'_>, raw: &[u8]) -> CoreResult<()> {
        self.appends.lock().unwrap().push(RecordedAppend {
            user_email: request.user_email.to_string(),
            password: request.password.to_string(),
            folder: request.folder.to_string(),
            flags: request.flags.iter().map(|f| f.to_string()).collect(),
            internal_date: request.internal_date.to_string(),
            raw: raw.to_vec(),
        });
        if self.fail {
            return Err(CoreError::ImapError("NO [TRYCREATE] no such mailbox".into()));
        }
        Ok(())
    }
}

/// Records every re-injection as (recipient, bytes)
#[derive(Default)]
pub struct RecordingRelay {
    fail: bool,
    sent: Mutex<Vec<(String, Vec<u8>)>>,
}

impl RecordingRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<(String, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl RelayTransport for RecordingRelay {
    async fn reinject(&self, deliver_to: &str, raw: &[u8]) -> CoreResult<()> {
        self.sent
            .lock()
            .unwrap()
            .push((deliver_to.to_string(), raw.to_vec()));
        if self.fail {
            return Err(CoreError::SmtpError("connection refused".into()));
        }
        Ok(())
    }
}

// --- scheduling ---

/// Delivers a fixed count per account; optionally fails some accounts or
/// blocks until released
#[derive(Default)]
pub struct StubFetcher {
    per_account: usize,
    failing: HashSet<String>,
    hold: bool,
    calls: AtomicUsize,
    pub started: Notify,
    pub release: Notify,
}

impl StubFetcher {
    pub fn delivering(per_account: usize) -> Self {
        Self {
            per_account,
            ..Self::default()
        }
    }

    /// Accounts with this POP3 user deliver one message, then fail
    pub fn failing_for(mut self, pop3_user: &str) -> Self {
        self.failing.insert(pop3_user.to_string());
        self
    }

    pub fn holding(mut self) -> Self {
        self.hold = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AccountFetcher for StubFetcher {
    async fn fetch(
        &self,
        account: &Account,
        on_progress: &(dyn Fn(usize, usize) + Send + Sync),
    ) -> FetchOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();
        if self.hold {
            self.release.notified().await;
        }

        if self.failing.contains(&account.pop3_user) {
            on_progress(1, self.per_account);
            return FetchOutcome {
                delivered: 1,
                error: Some("Connection failed: reset".into()),
            };
        }

        on_progress(self.per_account, self.per_account);
        FetchOutcome {
            delivered: self.per_account,
            error: None,
        }
    }
}
