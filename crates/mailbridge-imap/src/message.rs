//! IMAP message types

use std::collections::HashSet;

/// Email message flags
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFlags {
    /// Message has been read
    pub seen: bool,
    /// Message has been answered
    pub answered: bool,
    /// Message is flagged/starred
    pub flagged: bool,
    /// Message is marked for deletion
    pub deleted: bool,
    /// Message is a draft
    pub draft: bool,
    /// Keywords and non-system flags, lower-cased
    pub custom: HashSet<String>,
}

impl MessageFlags {
    /// Parse flags given as IMAP flag strings (`\Seen`, `$Label1`, ...)
    pub fn from_imap_flags(flags: &[&str]) -> Self {
        let mut result = MessageFlags::default();

        for flag in flags {
            match flag.to_lowercase().as_str() {
                "\\seen" => result.seen = true,
                "\\answered" => result.answered = true,
                "\\flagged" => result.flagged = true,
                "\\deleted" => result.deleted = true,
                "\\draft" => result.draft = true,
                "\\recent" => {}
                other => {
                    result.custom.insert(other.to_string());
                }
            }
        }

        result
    }

    /// The two flags mirrored into the cache
    pub fn cached_state(&self) -> (bool, bool) {
        (self.seen, self.flagged)
    }
}

/// Email address with optional display name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailAddress {
    /// Display name, possibly still RFC 2047 encoded
    pub name: Option<String>,
    /// Email address (e.g., "john@example.com")
    pub address: String,
}

impl EmailAddress {
    pub fn new(name: Option<String>, address: String) -> Self {
        Self { name, address }
    }
}

/// Envelope data from IMAP FETCH
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    /// Message-ID header
    pub message_id: Option<String>,
    /// Subject line as sent by the server (may contain encoded-words)
    pub subject: Option<String>,
    /// From addresses
    pub from: Vec<EmailAddress>,
    /// To addresses
    pub to: Vec<EmailAddress>,
    /// Date sent
    pub date: Option<String>,
    /// In-Reply-To header
    pub in_reply_to: Option<String>,
}

/// Metadata for one message, as fetched during reconciliation
#[derive(Debug, Clone, Default)]
pub struct MessageHeader {
    /// Server-assigned UID
    pub uid: u32,
    /// Envelope data
    pub envelope: Envelope,
    /// Message flags
    pub flags: MessageFlags,
    /// Size in bytes
    pub size: u32,
    /// Derived from BODYSTRUCTURE
    pub has_attachments: bool,
    /// Raw header block (`BODY.PEEK[HEADER]`), undecoded
    pub raw_header: Vec<u8>,
}
