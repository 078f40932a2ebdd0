//! IMAP client implementation

use crate::message::{EmailAddress, Envelope, MessageFlags, MessageHeader};
use crate::{Folder, ImapError, ImapResult};
use async_imap::types::{Fetch, Flag};
use async_imap::Session;
use async_native_tls::TlsStream;
use async_std::net::TcpStream;
use futures::TryStreamExt;
use imap_proto::types::{Address, BodyStructure, NameAttribute};
use tracing::{debug, info, warn};

// Type alias for our TLS stream
type ImapStream = TlsStream<TcpStream>;

/// Query used to pull everything the cache stores for a new message
const METADATA_QUERY: &str = "(UID FLAGS ENVELOPE RFC822.SIZE BODYSTRUCTURE BODY.PEEK[HEADER])";

/// IMAP client for one user's mailbox
pub struct ImapClient {
    session: Option<Session<ImapStream>>,
    host: String,
    port: u16,
    selected: Option<Folder>,
}

impl ImapClient {
    /// Create a new IMAP client
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            session: None,
            host: host.into(),
            port,
            selected: None,
        }
    }

    /// Connect over implicit TLS and authenticate using LOGIN
    pub async fn authenticate_login(&mut self, username: &str, password: &str) -> ImapResult<()> {
        info!("Connecting to {}:{}", self.host, self.port);

        let tcp_stream = TcpStream::connect(format!("{}:{}", self.host, self.port))
            .await
            .map_err(|e| ImapError::ConnectionFailed(e.to_string()))?;

        let tls_connector = async_native_tls::TlsConnector::new();
        let tls_stream = tls_connector
            .connect(&self.host, tcp_stream)
            .await
            .map_err(|e| ImapError::TlsError(e.to_string()))?;

        debug!("TLS connection established");

        let client = async_imap::Client::new(tls_stream);

        info!("Authenticating with LOGIN for {}", username);

        let session = client
            .login(username, password)
            .await
            .map_err(|(e, _)| ImapError::AuthenticationFailed(e.to_string()))?;

        self.session = Some(session);
        info!("LOGIN authentication successful");
        Ok(())
    }

    /// Get the session, returning an error if not connected
    fn session_mut(&mut self) -> ImapResult<&mut Session<ImapStream>> {
        self.session.as_mut().ok_or(ImapError::NotConnected)
    }

    /// List all folders/mailboxes
    pub async fn list_folders(&mut self) -> ImapResult<Vec<Folder>> {
        let session = self.session_mut()?;

        let names: Vec<_> = session
            .list(None, Some("*"))
            .await
            .map_err(|e| ImapError::ServerError(e.to_string()))?
            .try_collect()
            .await
            .map_err(|e| ImapError::ServerError(e.to_string()))?;

        let folders: Vec<Folder> = names
            .iter()
            .map(|name| {
                let delimiter = name.delimiter().and_then(|d| d.chars().next());
                let attributes = name.attributes().iter().map(attribute_name).collect();
                Folder::new(name.name().to_string(), delimiter, attributes)
            })
            .collect();

        debug!("Found {} folders", folders.len());
        Ok(folders)
    }

    /// STATUS for a folder without selecting it
    pub async fn folder_status(&mut self, folder_path: &str) -> ImapResult<Folder> {
        let session = self.session_mut()?;

        let mailbox = session
            .status(folder_path, "(MESSAGES UNSEEN UIDNEXT UIDVALIDITY)")
            .await
            .map_err(|e| ImapError::FolderNotFound(format!("{}: {}", folder_path, e)))?;

        let mut folder = Folder::new(folder_path.to_string(), None, Vec::new());
        folder.message_count = Some(mailbox.exists);
        folder.unread_count = mailbox.unseen;
        folder.uid_next = mailbox.uid_next;
        folder.uidvalidity = mailbox.uid_validity;
        Ok(folder)
    }

    /// Select a folder read-write. It stays selected until `close` or `logout`.
    pub async fn select_folder(&mut self, folder_path: &str) -> ImapResult<Folder> {
        let session = self.session_mut()?;

        let mailbox = session
            .select(folder_path)
            .await
            .map_err(|e| ImapError::FolderNotFound(format!("{}: {}", folder_path, e)))?;

        let mut folder = Folder::new(folder_path.to_string(), None, Vec::new());
        folder.uidvalidity = mailbox.uid_validity;
        folder.message_count = Some(mailbox.exists);
        folder.unread_count = mailbox.unseen;
        folder.uid_next = mailbox.uid_next;

        debug!(
            "Selected folder {} with {} messages",
            folder_path, mailbox.exists
        );

        self.selected = Some(folder.clone());
        Ok(folder)
    }

    /// UID and flags of every message in the selected folder
    pub async fn fetch_all_flags(&mut self) -> ImapResult<Vec<(u32, MessageFlags)>> {
        let exists = self
            .selected
            .as_ref()
            .ok_or(ImapError::NoFolderSelected)?
            .message_count
            .unwrap_or(0);
        if exists == 0 {
            return Ok(Vec::new());
        }

        let fetches = self.uid_fetch("1:*", "(UID FLAGS)").await?;
        let mut flags = Vec::with_capacity(fetches.len());
        for fetch in &fetches {
            let uid = fetch.uid.ok_or_else(|| {
                ImapError::ParseError("Missing UID in FETCH response".to_string())
            })?;
            flags.push((uid, parse_flags(fetch)));
        }
        Ok(flags)
    }

    /// Envelope, flags, size, body structure and raw header block for a UID set
    pub async fn fetch_metadata(&mut self, uids: &[u32]) -> ImapResult<Vec<MessageHeader>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let uid_set = uids
            .iter()
            .map(|uid| uid.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let fetches = self.uid_fetch(&uid_set, METADATA_QUERY).await?;

        let mut messages = Vec::with_capacity(fetches.len());
        for fetch in &fetches {
            let Some(uid) = fetch.uid else {
                warn!("Skipping FETCH response without UID (seq {})", fetch.message);
                continue;
            };

            messages.push(MessageHeader {
                uid,
                envelope: fetch.envelope().map(parse_envelope).unwrap_or_default(),
                flags: parse_flags(fetch),
                size: fetch.size.unwrap_or(0),
                has_attachments: fetch.bodystructure().map(has_attachments).unwrap_or(false),
                raw_header: fetch.header().map(|h| h.to_vec()).unwrap_or_default(),
            });
        }

        debug!("Fetched metadata for {} messages", messages.len());
        Ok(messages)
    }

    async fn uid_fetch(&mut self, uid_set: &str, query: &str) -> ImapResult<Vec<Fetch>> {
        if self.selected.is_none() {
            return Err(ImapError::NoFolderSelected);
        }
        let session = self.session_mut()?;

        session
            .uid_fetch(uid_set, query)
            .await
            .map_err(|e| ImapError::ServerError(e.to_string()))?
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| ImapError::ParseError(e.to_string()))
    }

    /// Add flags to a message
    pub async fn add_flags(&mut self, uid: u32, flags: &[&str]) -> ImapResult<()> {
        let session = self.session_mut()?;

        let flags_str = flags.join(" ");
        session
            .uid_store(uid.to_string(), format!("+FLAGS ({})", flags_str))
            .await
            .map_err(|e| ImapError::ServerError(e.to_string()))?
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| ImapError::ServerError(e.to_string()))?;

        Ok(())
    }

    /// Move a message to another folder.
    ///
    /// Uses UID MOVE; servers without the MOVE extension get COPY plus
    /// `\Deleted`, and the expunge happens when the folder is closed.
    pub async fn move_message(&mut self, uid: u32, dest_folder: &str) -> ImapResult<()> {
        let moved = {
            let session = self.session_mut()?;
            session.uid_mv(uid.to_string(), dest_folder).await
        };

        match moved {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!("UID MOVE rejected ({}), falling back to COPY", e);
                {
                    let session = self.session_mut()?;
                    session
                        .uid_copy(uid.to_string(), dest_folder)
                        .await
                        .map_err(|e| ImapError::ServerError(e.to_string()))?;
                }
                self.add_flags(uid, &["\\Deleted"]).await
            }
        }
    }

    /// Append a raw message to a folder.
    ///
    /// `internal_date` is an IMAP date-time such as `16-Oct-2026 09:30:00 +0900`.
    pub async fn append(
        &mut self,
        folder_path: &str,
        content: &[u8],
        flags: &[&str],
        internal_date: Option<&str>,
    ) -> ImapResult<()> {
        let session = self.session_mut()?;

        let flags = (!flags.is_empty()).then(|| format!("({})", flags.join(" ")));
        let date = internal_date.map(|d| format!("\"{}\"", d));

        session
            .append(folder_path, flags.as_deref(), date.as_deref(), content)
            .await
            .map_err(|e| ImapError::ServerError(e.to_string()))?;

        debug!("Appended {} bytes to {}", content.len(), folder_path);
        Ok(())
    }

    /// CLOSE the selected folder, expunging `\Deleted` messages
    pub async fn close(&mut self) -> ImapResult<()> {
        if self.selected.take().is_none() {
            return Ok(());
        }
        let session = self.session_mut()?;
        session
            .close()
            .await
            .map_err(|e| ImapError::ServerError(e.to_string()))
    }

    /// Close the connection
    pub async fn logout(&mut self) -> ImapResult<()> {
        self.selected = None;
        if let Some(mut session) = self.session.take() {
            session
                .logout()
                .await
                .map_err(|e| ImapError::ServerError(e.to_string()))?;
        }
        Ok(())
    }
}

fn attribute_name(attr: &NameAttribute<'_>) -> String {
    match attr {
        NameAttribute::NoInferiors => "\\Noinferiors".to_string(),
        NameAttribute::NoSelect => "\\Noselect".to_string(),
        NameAttribute::Marked => "\\Marked".to_string(),
        NameAttribute::Unmarked => "\\Unmarked".to_string(),
        NameAttribute::All => "\\All".to_string(),
        NameAttribute::Archive => "\\Archive".to_string(),
        NameAttribute::Drafts => "\\Drafts".to_string(),
        NameAttribute::Flagged => "\\Flagged".to_string(),
        NameAttribute::Junk => "\\Junk".to_string(),
        NameAttribute::Sent => "\\Sent".to_string(),
        NameAttribute::Trash => "\\Trash".to_string(),
        NameAttribute::Extension(other) => other.to_string(),
        #[allow(unreachable_patterns)]
        other => format!("{:?}", other),
    }
}

fn parse_flags(fetch: &Fetch) -> MessageFlags {
    let mut flags = MessageFlags::default();
    for flag in fetch.flags() {
        match flag {
            Flag::Seen => flags.seen = true,
            Flag::Answered => flags.answered = true,
            Flag::Flagged => flags.flagged = true,
            Flag::Deleted => flags.deleted = true,
            Flag::Draft => flags.draft = true,
            Flag::Custom(name) => {
                flags.custom.insert(name.to_lowercase());
            }
            _ => {}
        }
    }
    flags
}

fn parse_envelope(env: &imap_proto::types::Envelope<'_>) -> Envelope {
    let text = |value: &Option<std::borrow::Cow<'_, [u8]>>| {
        value
            .as_ref()
            .map(|s| String::from_utf8_lossy(s).to_string())
    };

    Envelope {
        message_id: text(&env.message_id),
        subject: text(&env.subject),
        from: parse_addresses(env.from.as_ref()),
        to: parse_addresses(env.to.as_ref()),
        date: text(&env.date),
        in_reply_to: text(&env.in_reply_to),
    }
}

fn parse_addresses(addrs: Option<&Vec<Address<'_>>>) -> Vec<EmailAddress> {
    addrs
        .map(|v| {
            v.iter()
                .filter_map(|a| {
                    let mailbox = a
                        .mailbox
                        .as_ref()
                        .map(|s| String::from_utf8_lossy(s).to_string())?;
                    let address = match a.host.as_ref() {
                        Some(host) if !host.is_empty() => {
                            format!("{}@{}", mailbox, String::from_utf8_lossy(host))
                        }
                        _ => mailbox,
                    };
                    let name = a
                        .name
                        .as_ref()
                        .map(|s| String::from_utf8_lossy(s).to_string());
                    Some(EmailAddress::new(name, address))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// A message "has attachments" when any leaf is a non-text part or carries
/// an attachment disposition.
fn has_attachments(structure: &BodyStructure<'_>) -> bool {
    match structure {
        BodyStructure::Multipart { bodies, .. } => bodies.iter().any(has_attachments),
        BodyStructure::Text { common, .. } => common
            .disposition
            .as_ref()
            .is_some_and(|d| d.ty.eq_ignore_ascii_case("attachment")),
        BodyStructure::Basic { .. } | BodyStructure::Message { .. } => true,
    }
}
