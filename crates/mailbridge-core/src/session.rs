//! Live mailbox session used by reconciliation and rule actions

use crate::CoreResult;
use async_trait::async_trait;
use mailbridge_imap::{Folder, ImapClient, MessageFlags, MessageHeader};

/// The IMAP operations the reconciler and the rule executor drive.
///
/// `ImapClient` is the production implementation; tests use a scripted mailbox.
#[async_trait]
pub trait MailboxSession: Send {
    async fn list_folders(&mut self) -> CoreResult<Vec<Folder>>;

    /// STATUS without selecting
    async fn folder_status(&mut self, path: &str) -> CoreResult<Folder>;

    /// Select read-write; the selection is held until `close`
    async fn select(&mut self, path: &str) -> CoreResult<Folder>;

    /// UID and flags of every message in the selected mailbox
    async fn fetch_all_flags(&mut self) -> CoreResult<Vec<(u32, MessageFlags)>>;

    async fn fetch_metadata(&mut self, uids: &[u32]) -> CoreResult<Vec<MessageHeader>>;

    async fn move_message(&mut self, uid: u32, target: &str) -> CoreResult<()>;

    async fn add_flags(&mut self, uid: u32, flags: &[&str]) -> CoreResult<()>;

    /// Close the selected mailbox, expunging `\Deleted` messages
    async fn close(&mut self) -> CoreResult<()>;
}

#[async_trait]
impl MailboxSession for ImapClient {
    async fn list_folders(&mut self) -> CoreResult<Vec<Folder>> {
        Ok(ImapClient::list_folders(self).await?)
    }

    async fn folder_status(&mut self, path: &str) -> CoreResult<Folder> {
        Ok(ImapClient::folder_status(self, path).await?)
    }

    async fn select(&mut self, path: &str) -> CoreResult<Folder> {
        Ok(self.select_folder(path).await?)
    }

    async fn fetch_all_flags(&mut self) -> CoreResult<Vec<(u32, MessageFlags)>> {
        Ok(ImapClient::fetch_all_flags(self).await?)
    }

    async fn fetch_metadata(&mut self, uids: &[u32]) -> CoreResult<Vec<MessageHeader>> {
        Ok(ImapClient::fetch_metadata(self, uids).await?)
    }

    async fn move_message(&mut self, uid: u32, target: &str) -> CoreResult<()> {
        Ok(ImapClient::move_message(self, uid, target).await?)
    }

    async fn add_flags(&mut self, uid: u32, flags: &[&str]) -> CoreResult<()> {
        Ok(ImapClient::add_flags(self, uid, flags).await?)
    }

    async fn close(&mut self) -> CoreResult<()> {
        Ok(ImapClient::close(self).await?)
    }
}
