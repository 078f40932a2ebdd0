//! IMAP folder types

/// Type of mail folder, used to bucket folder counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FolderType {
    /// Inbox folder
    Inbox,
    /// Sent messages
    Sent,
    /// Draft messages
    Drafts,
    /// Trash/deleted messages
    Trash,
    /// Spam/junk
    Spam,
    /// Archive
    Archive,
    /// User-created folder
    Other,
}

impl FolderType {
    /// Detect folder type from IMAP special-use attributes only (RFC 6154)
    /// Also matches without backslash prefix (some servers send "Trash" instead of "\Trash")
    pub fn from_attributes(attributes: &[String]) -> Option<Self> {
        attributes.iter().find_map(|attr| {
            let lower = attr.to_lowercase();
            match lower.trim_start_matches('\\') {
                "inbox" => Some(FolderType::Inbox),
                "sent" => Some(FolderType::Sent),
                "drafts" => Some(FolderType::Drafts),
                "trash" => Some(FolderType::Trash),
                "junk" => Some(FolderType::Spam),
                "archive" | "all" => Some(FolderType::Archive),
                _ => None,
            }
        })
    }

    /// Detect folder type from the mailbox path
    pub fn from_name(name: &str) -> Self {
        let name_lower = name.to_lowercase();
        if name_lower == "inbox" {
            FolderType::Inbox
        } else if name_lower.contains("sent") || name_lower.contains("보낸") {
            FolderType::Sent
        } else if name_lower.contains("draft") || name_lower.contains("임시") {
            FolderType::Drafts
        } else if name_lower.contains("trash")
            || name_lower.contains("deleted")
            || name_lower.contains("휴지통")
        {
            FolderType::Trash
        } else if name_lower.contains("spam")
            || name_lower.contains("junk")
            || name_lower.contains("스팸")
        {
            FolderType::Spam
        } else if name_lower.contains("archive") || name_lower.contains("all mail") {
            FolderType::Archive
        } else {
            FolderType::Other
        }
    }

    /// Attributes win over the name heuristic
    pub fn from_attributes_and_name(attributes: &[String], name: &str) -> Self {
        Self::from_attributes(attributes).unwrap_or_else(|| Self::from_name(name))
    }
}

/// Represents an IMAP folder/mailbox
#[derive(Debug, Clone)]
pub struct Folder {
    /// Folder name (last path segment)
    pub name: String,
    /// Full path including hierarchy delimiter
    pub full_path: String,
    /// Folder type
    pub folder_type: FolderType,
    /// Hierarchy delimiter
    pub delimiter: Option<char>,
    /// LIST attributes, rendered as `\Name`
    pub attributes: Vec<String>,
    /// UIDVALIDITY value
    pub uidvalidity: Option<u32>,
    /// Number of messages
    pub message_count: Option<u32>,
    /// Number of unread messages
    pub unread_count: Option<u32>,
    /// Next UID to be assigned
    pub uid_next: Option<u32>,
}

impl Folder {
    /// Create a new folder from a LIST response entry
    pub fn new(full_path: String, delimiter: Option<char>, attributes: Vec<String>) -> Self {
        let name = match delimiter {
            Some(delim) => full_path
                .rsplit(delim)
                .next()
                .unwrap_or(&full_path)
                .to_string(),
            None => full_path.clone(),
        };
        let folder_type = FolderType::from_attributes_and_name(&attributes, &full_path);

        Self {
            name,
            full_path,
            folder_type,
            delimiter,
            attributes,
            uidvalidity: None,
            message_count: None,
            unread_count: None,
            uid_next: None,
        }
    }

    /// Check if this folder can be selected
    pub fn is_selectable(&self) -> bool {
        !self.attributes.iter().any(|a| {
            let lower = a.to_lowercase();
            lower == "\\noselect" || lower == "\\nonexistent"
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_folder_type_detection() {
        assert_eq!(
            FolderType::from_attributes_and_name(&["\\Sent".to_string()], "Outbox"),
            FolderType::Sent
        );
        assert_eq!(
            FolderType::from_attributes_and_name(&[], "[Gmail]/Sent Mail"),
            FolderType::Sent
        );
        assert_eq!(FolderType::from_attributes_and_name(&[], "INBOX"), FolderType::Inbox);
        assert_eq!(FolderType::from_name("휴지통"), FolderType::Trash);
        assert_eq!(FolderType::from_name("Projects/2024"), FolderType::Other);
    }

    #[test]
    fn test_folder_name_and_selectable() {
        let folder = Folder::new(
            "Archive/2023".into(),
            Some('/'),
            vec!["\\HasNoChildren".into()],
        );
        assert_eq!(folder.name, "2023");
        assert_eq!(folder.folder_type, FolderType::Archive);
        assert!(folder.is_selectable());

        let parent = Folder::new("[Gmail]".into(), Some('/'), vec!["\\Noselect".into()]);
        assert!(!parent.is_selectable());
    }
}
