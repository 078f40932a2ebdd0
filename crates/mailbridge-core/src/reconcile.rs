//! IMAP to cache reconciliation

use crate::codec::repair;
use crate::config::SyncConfig;
use crate::database::{CachedMessage, Database};
use crate::message::{header_value, parse_date};
use crate::rules::RuleEngine;
use crate::session::MailboxSession;
use crate::CoreResult;
use mail_parser::MessageParser;
use mailbridge_imap::{FolderType, MessageHeader};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// What one reconcile pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    /// New messages a rule moved away or deleted; never cached
    pub removed_by_rules: usize,
    /// The cache partition was dropped because UIDVALIDITY changed
    pub reset: bool,
}

/// Message counts per well-known folder
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MailboxSummary {
    pub inbox: u32,
    pub inbox_unread: u32,
    pub sent: u32,
    pub drafts: u32,
    pub trash: u32,
    pub spam: u32,
}

#[derive(Debug, Serialize)]
struct Recipient {
    name: String,
    address: String,
}

type MailboxLock = Arc<tokio::sync::Mutex<()>>;

/// Brings the cache of a mailbox in line with the live server
pub struct Reconciler {
    db: Arc<Database>,
    rules: RuleEngine,
    config: SyncConfig,
    locks: Mutex<HashMap<(String, String), MailboxLock>>,
}

impl Reconciler {
    pub fn new(db: Arc<Database>, config: SyncConfig) -> Self {
        Self {
            rules: RuleEngine::new(db.clone()),
            db,
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, user_email: &str, mailbox: &str) -> MailboxLock {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks
            .entry((user_email.to_string(), mailbox.to_string()))
            .or_default()
            .clone()
    }

    /// Reconcile one mailbox. A second caller for the same (user, mailbox)
    /// waits for the first pass to finish. The mailbox is closed afterwards,
    /// which expunges anything a rule marked `\Deleted`.
    pub async fn reconcile(
        &self,
        session: &mut dyn MailboxSession,
        user_email: &str,
        mailbox: &str,
    ) -> CoreResult<ReconcileReport> {
        let lock = self.lock_for(user_email, mailbox);
        let _held = lock.lock().await;

        let result = self.reconcile_locked(session, user_email, mailbox).await;

        if let Err(e) = session.close().await {
            debug!("Closing {} after reconcile failed: {}", mailbox, e);
        }

        match &result {
            Ok(report) => debug!("Reconciled {} / {}: {:?}", user_email, mailbox, report),
            Err(e) => warn!("Reconcile of {} / {} failed: {}", user_email, mailbox, e),
        }
        result
    }

    async fn reconcile_locked(
        &self,
        session: &mut dyn MailboxSession,
        user_email: &str,
        mailbox: &str,
    ) -> CoreResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let folder = session.select(mailbox).await?;

        if let Some(live_validity) = folder.uidvalidity {
            let stored = self.db.mailbox_uidvalidity(user_email, mailbox).await?;
            if stored.is_some_and(|v| v != live_validity) {
                info!(
                    "UIDVALIDITY of {} changed ({:?} -> {}), dropping cache",
                    mailbox, stored, live_validity
                );
                self.db.clear_mailbox_cache(user_email, mailbox).await?;
                report.reset = true;
            }
        }

        let live = session.fetch_all_flags().await?;
        let cached = self.db.cached_flags(user_email, mailbox).await?;

        let live_uids: HashSet<u32> = live.iter().map(|(uid, _)| *uid).collect();
        let mut to_fetch = Vec::new();
        let mut to_update = Vec::new();
        for (uid, flags) in &live {
            let (seen, flagged) = flags.cached_state();
            match cached.get(uid) {
                None => to_fetch.push(*uid),
                Some(&state) if state != (seen, flagged) => to_update.push((*uid, seen, flagged)),
                Some(_) => {}
            }
        }
        let to_delete: Vec<u32> = cached
            .keys()
            .filter(|uid| !live_uids.contains(uid))
            .copied()
            .collect();

        if !to_delete.is_empty() {
            report.deleted = self
                .db
                .delete_cached_uids(user_email, mailbox, &to_delete, self.config.delete_chunk_size)
                .await? as usize;
        }
        self.db
            .update_cached_flags(user_email, mailbox, &to_update)
            .await?;
        report.updated = to_update.len();

        to_fetch.sort_unstable();
        for batch in to_fetch.chunks(self.config.metadata_batch_size.max(1)) {
            let headers = session.fetch_metadata(batch).await?;

            for header in &headers {
                let message = cached_message(user_email, mailbox, header);

                let removed = match self.rules.apply(user_email, mailbox, &message, session).await {
                    Ok(removed) => removed,
                    Err(e) => {
                        warn!("Rule evaluation for uid {} failed: {}", header.uid, e);
                        false
                    }
                };
                if removed {
                    report.removed_by_rules += 1;
                    continue;
                }

                self.db.insert_cached_message(&message).await?;
                report.inserted += 1;
            }
        }

        if let Some(live_validity) = folder.uidvalidity {
            self.db
                .set_mailbox_uidvalidity(user_email, mailbox, live_validity)
                .await?;
        }

        Ok(report)
    }

    /// Reconcile every selectable folder; returns how many succeeded
    pub async fn reconcile_all(
        &self,
        session: &mut dyn MailboxSession,
        user_email: &str,
    ) -> CoreResult<usize> {
        let folders = session.list_folders().await?;
        let mut reconciled = 0;

        for folder in folders.iter().filter(|f| f.is_selectable()) {
            match self.reconcile(session, user_email, &folder.full_path).await {
                Ok(_) => reconciled += 1,
                Err(e) => warn!("Skipping {}: {}", folder.full_path, e),
            }
        }

        info!(
            "Reconciled {}/{} folders for {}",
            reconciled,
            folders.len(),
            user_email
        );
        Ok(reconciled)
    }
}

/// STATUS counts bucketed by folder type. Folders whose STATUS fails are skipped.
pub async fn mailbox_summary(session: &mut dyn MailboxSession) -> CoreResult<MailboxSummary> {
    let folders = session.list_folders().await?;
    let mut summary = MailboxSummary::default();

    for folder in folders.iter().filter(|f| f.is_selectable()) {
        let status = match session.folder_status(&folder.full_path).await {
            Ok(status) => status,
            Err(e) => {
                debug!("STATUS {} failed: {}", folder.full_path, e);
                continue;
            }
        };
        let count = status.message_count.unwrap_or(0);

        match folder.folder_type {
            FolderType::Inbox => {
                summary.inbox += count;
                summary.inbox_unread += status.unread_count.unwrap_or(0);
            }
            FolderType::Sent => summary.sent += count,
            FolderType::Drafts => summary.drafts += count,
            FolderType::Trash => summary.trash += count,
            FolderType::Spam => summary.spam += count,
            FolderType::Archive | FolderType::Other => {}
        }
    }

    Ok(summary)
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Addresses from one raw header. The whole value goes through the codec
/// before it is parsed, so raw 8-bit and mislabeled names come out intact.
fn header_addresses(raw: &[u8], name: &str) -> Vec<Recipient> {
    let Some(value) = header_value(raw, name) else {
        return Vec::new();
    };
    let line = format!("{}: {}\r\n\r\n", name, repair(&value));

    let Some(parsed) = MessageParser::default().parse_headers(line.as_bytes()) else {
        return Vec::new();
    };
    let list = if name.eq_ignore_ascii_case("from") {
        parsed.from()
    } else {
        parsed.to()
    };

    list.map(|list| {
        list.iter()
            .filter_map(|a| {
                Some(Recipient {
                    name: a.name().unwrap_or_default().trim().to_string(),
                    address: non_empty(a.address()?.to_string())?,
                })
            })
            .collect()
    })
    .unwrap_or_default()
}

/// Build the cache row for a freshly fetched message
fn cached_message(user_email: &str, mailbox: &str, header: &MessageHeader) -> CachedMessage {
    let envelope = &header.envelope;
    let raw = header.raw_header.as_slice();
    let parsed = MessageParser::default().parse_headers(raw);

    let subject = header_value(raw, "Subject")
        .map(|v| repair(&v))
        .and_then(non_empty)
        .or_else(|| {
            parsed
                .as_ref()
                .and_then(|p| p.subject())
                .map(|s| repair(s))
                .and_then(non_empty)
        })
        .or_else(|| {
            envelope
                .subject
                .as_deref()
                .map(|s| repair(s))
                .and_then(non_empty)
        })
        .unwrap_or_else(|| "(no subject)".to_string());

    let (from_name, from_address) = match header_addresses(raw, "From").into_iter().next() {
        Some(from) => (non_empty(from.name), non_empty(from.address)),
        None => envelope
            .from
            .first()
            .map(|from| {
                (
                    from.name.as_deref().map(|n| repair(n)).and_then(non_empty),
                    non_empty(from.address.clone()),
                )
            })
            .unwrap_or((None, None)),
    };

    let mut recipients = header_addresses(raw, "To");
    if recipients.is_empty() {
        recipients = envelope
            .to
            .iter()
            .map(|to| Recipient {
                name: to.name.as_deref().map(|n| repair(n)).unwrap_or_default(),
                address: to.address.clone(),
            })
            .collect();
    }
    let to_addresses = serde_json::to_string(&recipients).unwrap_or_else(|_| "[]".to_string());

    let raw_date = envelope.date.clone().or_else(|| {
        header_value(raw, "Date").map(|v| String::from_utf8_lossy(&v).into_owned())
    });
    let parsed_date = raw_date.as_deref().and_then(parse_date);

    CachedMessage {
        id: 0,
        user_email: user_email.to_string(),
        mailbox: mailbox.to_string(),
        uid: header.uid as i64,
        message_id: envelope.message_id.clone().and_then(non_empty),
        in_reply_to: envelope.in_reply_to.clone().and_then(non_empty),
        from_name,
        from_address,
        to_addresses,
        subject,
        date_sent: parsed_date.map(|d| d.to_rfc3339()).or(raw_date),
        date_epoch: parsed_date.map(|d| d.timestamp()),
        is_seen: header.flags.seen,
        is_flagged: header.flags.flagged,
        has_attachments: header.has_attachments,
        size: header.size as i64,
    }
}
