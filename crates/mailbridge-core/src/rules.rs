//! Mail rules: matching and actions
//!
//! Rules belong to a user and are evaluated in ascending `sort_order`. The
//! first rule whose conditions all match runs its actions and evaluation
//! stops there. Rules only ever see newly observed messages.

use crate::database::{CachedMessage, Database};
use crate::session::MailboxSession;
use crate::CoreResult;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One AND-ed condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// `subject`, `from`, `to`, `body`, or any other cached field name
    #[serde(default)]
    pub field: String,
    /// Empty means `contains`
    #[serde(default)]
    pub operator: String,
    #[serde(default)]
    pub value: String,
}

/// One action, run in order when the rule matches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleAction {
    /// `move`, `flag` or `delete`
    #[serde(rename = "type")]
    pub kind: String,
    /// Folder for `move`, flag name for `flag`
    #[serde(default, alias = "value", skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// A user-defined rule
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub id: i64,
    pub user_email: String,
    pub name: String,
    pub conditions: Vec<Condition>,
    pub actions: Vec<RuleAction>,
    pub is_active: bool,
    pub sort_order: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Contains,
    Equals,
    StartsWith,
    EndsWith,
    NotContains,
    Unknown,
}

impl Operator {
    fn parse(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "" | "contains" => Operator::Contains,
            "equals" => Operator::Equals,
            "starts_with" => Operator::StartsWith,
            "ends_with" => Operator::EndsWith,
            "not_contains" => Operator::NotContains,
            _ => Operator::Unknown,
        }
    }

    fn test(self, target: &str, value: &str) -> bool {
        match self {
            Operator::Contains => target.contains(value),
            Operator::Equals => target == value,
            Operator::StartsWith => target.starts_with(value),
            Operator::EndsWith => target.ends_with(value),
            Operator::NotContains => !target.contains(value),
            Operator::Unknown => false,
        }
    }
}

// Stored rows may hold a single object instead of a list
#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> From<OneOrMany<T>> for Vec<T> {
    fn from(value: OneOrMany<T>) -> Self {
        match value {
            OneOrMany::Many(items) => items,
            OneOrMany::One(item) => vec![item],
        }
    }
}

fn parse_list<T: for<'de> Deserialize<'de>>(json: &str) -> Option<Vec<T>> {
    if json.trim().is_empty() {
        return Some(Vec::new());
    }
    serde_json::from_str::<OneOrMany<T>>(json).ok().map(Vec::from)
}

impl Condition {
    pub fn new(field: impl Into<String>, operator: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            operator: operator.into(),
            value: value.into(),
        }
    }

    /// Parse a stored JSON list (or single object); `None` if unreadable
    pub fn parse_list(json: &str) -> Option<Vec<Self>> {
        parse_list(json)
    }

    /// Case-insensitive comparison against the message field
    pub fn matches(&self, message: &CachedMessage) -> bool {
        let target = field_value(message, &self.field.to_lowercase()).to_lowercase();
        Operator::parse(&self.operator).test(&target, &self.value.to_lowercase())
    }
}

impl RuleAction {
    pub fn new(kind: impl Into<String>, target: Option<&str>) -> Self {
        Self {
            kind: kind.into(),
            target: target.map(str::to_string),
        }
    }

    pub fn parse_list(json: &str) -> Option<Vec<Self>> {
        parse_list(json)
    }
}

impl Rule {
    /// An empty, active rule at sort order 0
    pub fn new(user_email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: 0,
            user_email: user_email.into(),
            name: name.into(),
            conditions: Vec::new(),
            actions: Vec::new(),
            is_active: true,
            sort_order: 0,
        }
    }

    /// All conditions must match. Conditions with a blank field are skipped,
    /// and a rule left with none of its own never matches, even when the
    /// stored condition list is non-empty.
    pub fn matches(&self, message: &CachedMessage) -> bool {
        let mut usable = self
            .conditions
            .iter()
            .filter(|c| !c.field.trim().is_empty())
            .peekable();

        usable.peek().is_some() && usable.all(|c| c.matches(message))
    }
}

/// The text a condition field refers to
fn field_value(message: &CachedMessage, field: &str) -> String {
    match field {
        "subject" => message.subject.clone(),
        "from" => message.from_address.clone().unwrap_or_default(),
        "from_name" => message.from_name.clone().unwrap_or_default(),
        "to" => message.to_addresses.clone(),
        // Bodies are not fetched during reconciliation
        "body" => String::new(),
        "message_id" => message.message_id.clone().unwrap_or_default(),
        "in_reply_to" => message.in_reply_to.clone().unwrap_or_default(),
        "mailbox" => message.mailbox.clone(),
        "date" => message.date_sent.clone().unwrap_or_default(),
        _ => String::new(),
    }
}

/// Run the first matching rule against `message` in the live session.
/// Returns true when the message no longer belongs to the current mailbox.
pub async fn apply_rules(
    rules: &[Rule],
    message: &CachedMessage,
    session: &mut dyn MailboxSession,
) -> bool {
    let Some(rule) = rules.iter().find(|r| r.matches(message)) else {
        return false;
    };

    info!(
        "Rule '{}' matched uid {} for {}",
        rule.name, message.uid, message.user_email
    );

    let uid = message.uid as u32;
    let mut removed = false;

    for action in &rule.actions {
        let kind = action.kind.trim().to_lowercase();
        let target = action.target.as_deref().map(str::trim).filter(|t| !t.is_empty());

        let result = match (kind.as_str(), target) {
            ("move", Some(folder)) => {
                debug!("Moving uid {} to {}", uid, folder);
                session.move_message(uid, folder).await.map(|_| true)
            }
            ("flag", Some(flag)) => {
                let imap_flag = match flag {
                    "star" | "starred" => "\\Flagged",
                    _ => "\\Important",
                };
                debug!("Flagging uid {} {}", uid, imap_flag);
                session.add_flags(uid, &[imap_flag]).await.map(|_| false)
            }
            ("delete", _) => {
                // Expunged when the mailbox is closed
                debug!("Marking uid {} deleted", uid);
                session.add_flags(uid, &["\\Deleted"]).await.map(|_| true)
            }
            _ => {
                warn!("Rule '{}': ignoring action {:?}", rule.name, action);
                Ok(false)
            }
        };

        match result {
            Ok(gone) => removed |= gone,
            Err(e) => warn!("Rule '{}': action '{}' failed: {}", rule.name, kind, e),
        }
    }

    removed
}

/// Loads a user's active rules and applies them
pub struct RuleEngine {
    db: Arc<Database>,
}

impl RuleEngine {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub async fn apply(
        &self,
        user_email: &str,
        mailbox: &str,
        message: &CachedMessage,
        session: &mut dyn MailboxSession,
    ) -> CoreResult<bool> {
        let rules = self.db.active_rules(user_email).await?;
        if rules.is_empty() {
            return Ok(false);
        }

        debug!(
            "Evaluating {} rules for uid {} in {}",
            rules.len(),
            message.uid,
            mailbox
        );
        Ok(apply_rules(&rules, message, session).await)
    }
}
