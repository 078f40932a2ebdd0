//! IMAP protocol client for mailbridge
//!
//! Wraps an `async-imap` session with the operations the reconciler, the
//! rule executor and the append re-delivery path need.

mod client;
mod error;
mod folder;
mod message;

pub use client::ImapClient;
pub use error::{ImapError, ImapResult};
pub use folder::{Folder, FolderType};
pub use message::{EmailAddress, Envelope, MessageFlags, MessageHeader};
