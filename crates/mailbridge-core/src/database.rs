//! Database storage using SQLite

use crate::account::{Account, AccountStatus};
use crate::rules::{Condition, Rule, RuleAction};
use crate::CoreResult;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Row, Sqlite};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// Cached IMAP message row
#[derive(Debug, Clone, Default, sqlx::FromRow)]
pub struct CachedMessage {
    pub id: i64,
    pub user_email: String,
    pub mailbox: String,
    pub uid: i64,
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub from_name: Option<String>,
    pub from_address: Option<String>,
    /// JSON array of `{name, address}`
    pub to_addresses: String,
    pub subject: String,
    pub date_sent: Option<String>,
    /// Unix timestamp for date sorting
    pub date_epoch: Option<i64>,
    pub is_seen: bool,
    pub is_flagged: bool,
    pub has_attachments: bool,
    pub size: i64,
}

/// One aggregate scheduler tick
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SyncEvent {
    pub id: i64,
    pub last_sync_time: String,
    pub status: String,
    pub emails_processed: i64,
}

/// Database connection pool
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Open or create a database at the given path
    pub async fn open(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db_url = format!("sqlite:{}?mode=rwc", path.display());
        info!("Opening database at {}", path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let db = Self { pool };
        db.initialize().await?;

        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub async fn open_memory() -> CoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let db = Self { pool };
        db.initialize().await?;

        Ok(db)
    }

    /// Initialize the database schema
    async fn initialize(&self) -> CoreResult<()> {
        debug!("Initializing database schema");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pop3_accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_email TEXT NOT NULL,
                pop3_host TEXT NOT NULL,
                pop3_port INTEGER NOT NULL DEFAULT 110,
                pop3_tls INTEGER NOT NULL DEFAULT 0,
                pop3_user TEXT NOT NULL,
                pop3_pass TEXT NOT NULL,
                keep_on_server INTEGER NOT NULL DEFAULT 1,
                is_active INTEGER NOT NULL DEFAULT 1,
                last_status TEXT NOT NULL DEFAULT 'PENDING',
                last_error TEXT,
                last_fetched_at TEXT,
                imap_pass TEXT,
                created_at TEXT DEFAULT (datetime('now')),
                UNIQUE(user_email, pop3_host, pop3_user)
            );

            CREATE TABLE IF NOT EXISTS pop3_seen (
                account_id INTEGER NOT NULL,
                message_key TEXT NOT NULL,
                seen_at TEXT DEFAULT (datetime('now')),
                PRIMARY KEY (account_id, message_key)
            );

            CREATE TABLE IF NOT EXISTS email_cache (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_email TEXT NOT NULL,
                mailbox TEXT NOT NULL,
                uid INTEGER NOT NULL,
                message_id TEXT,
                in_reply_to TEXT,
                from_name TEXT,
                from_address TEXT,
                to_addresses TEXT NOT NULL DEFAULT '[]',
                subject TEXT NOT NULL DEFAULT '',
                date_sent TEXT,
                date_epoch INTEGER,
                is_seen INTEGER NOT NULL DEFAULT 0,
                is_flagged INTEGER NOT NULL DEFAULT 0,
                has_attachments INTEGER NOT NULL DEFAULT 0,
                size INTEGER NOT NULL DEFAULT 0,
                created_at TEXT DEFAULT (datetime('now')),
                UNIQUE(user_email, mailbox, uid)
            );

            CREATE INDEX IF NOT EXISTS idx_email_cache_mailbox ON email_cache(user_email, mailbox);
            CREATE INDEX IF NOT EXISTS idx_email_cache_date ON email_cache(date_epoch DESC);
            CREATE INDEX IF NOT EXISTS idx_email_cache_message_id ON email_cache(message_id);

            CREATE TABLE IF NOT EXISTS mailbox_state (
                user_email TEXT NOT NULL,
                mailbox TEXT NOT NULL,
                uidvalidity INTEGER NOT NULL,
                updated_at TEXT DEFAULT (datetime('now')),
                PRIMARY KEY (user_email, mailbox)
            );

            CREATE TABLE IF NOT EXISTS mail_rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_email TEXT NOT NULL,
                name TEXT NOT NULL,
                conditions TEXT NOT NULL DEFAULT '[]',
                actions TEXT NOT NULL DEFAULT '[]',
                is_active INTEGER NOT NULL DEFAULT 1,
                sort_order INTEGER NOT NULL DEFAULT 0,
                created_at TEXT DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_mail_rules_user ON mail_rules(user_email, sort_order);

            CREATE TABLE IF NOT EXISTS sync_state (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                last_sync_time TEXT NOT NULL,
                status TEXT NOT NULL,
                emails_processed INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database schema initialized");
        Ok(())
    }

    // --- accounts ---

    /// Insert a new account or update an existing one; returns the row id
    pub async fn save_account(&self, account: &Account) -> CoreResult<i64> {
        if account.id != 0 {
            sqlx::query(
                r#"
                UPDATE pop3_accounts SET
                    user_email = ?, pop3_host = ?, pop3_port = ?, pop3_tls = ?,
                    pop3_user = ?, pop3_pass = ?, keep_on_server = ?, is_active = ?,
                    imap_pass = ?
                WHERE id = ?
                "#,
            )
            .bind(&account.user_email)
            .bind(&account.pop3_host)
            .bind(account.pop3_port as i64)
            .bind(account.pop3_tls)
            .bind(&account.pop3_user)
            .bind(&account.pop3_pass)
            .bind(account.keep_on_server)
            .bind(account.is_active)
            .bind(&account.imap_pass)
            .bind(account.id)
            .execute(&self.pool)
            .await?;
            return Ok(account.id);
        }

        let row = sqlx::query(
            r#"
            INSERT INTO pop3_accounts (
                user_email, pop3_host, pop3_port, pop3_tls, pop3_user, pop3_pass,
                keep_on_server, is_active, imap_pass
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_email, pop3_host, pop3_user) DO UPDATE SET
                pop3_port = excluded.pop3_port,
                pop3_tls = excluded.pop3_tls,
                pop3_pass = excluded.pop3_pass,
                keep_on_server = excluded.keep_on_server,
                is_active = excluded.is_active,
                imap_pass = excluded.imap_pass
            RETURNING id
            "#,
        )
        .bind(&account.user_email)
        .bind(&account.pop3_host)
        .bind(account.pop3_port as i64)
        .bind(account.pop3_tls)
        .bind(&account.pop3_user)
        .bind(&account.pop3_pass)
        .bind(account.keep_on_server)
        .bind(account.is_active)
        .bind(&account.imap_pass)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get::<i64, _>("id"))
    }

    /// All accounts, active or not
    pub async fn list_accounts(&self) -> CoreResult<Vec<Account>> {
        let rows: Vec<AccountRow> =
            sqlx::query_as(&format!("SELECT {} FROM pop3_accounts ORDER BY id", ACCOUNT_COLUMNS))
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(Account::from).collect())
    }

    /// Accounts the scheduler should fetch
    pub async fn active_accounts(&self) -> CoreResult<Vec<Account>> {
        let rows: Vec<AccountRow> = sqlx::query_as(&format!(
            "SELECT {} FROM pop3_accounts WHERE is_active = 1 ORDER BY id",
            ACCOUNT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Account::from).collect())
    }

    pub async fn get_account(&self, account_id: i64) -> CoreResult<Option<Account>> {
        let row: Option<AccountRow> = sqlx::query_as(&format!(
            "SELECT {} FROM pop3_accounts WHERE id = ?",
            ACCOUNT_COLUMNS
        ))
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Account::from))
    }

    pub async fn mark_account_failed(&self, account_id: i64, error: &str) -> CoreResult<()> {
        sqlx::query("UPDATE pop3_accounts SET last_status = 'FAILED', last_error = ? WHERE id = ?")
            .bind(error)
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Clear the error and stamp the fetch time
    pub async fn mark_account_fetched(&self, account_id: i64) -> CoreResult<()> {
        sqlx::query(
            "UPDATE pop3_accounts SET last_status = 'SUCCESS', last_error = NULL, last_fetched_at = ? WHERE id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(account_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- dedup ledger ---

    pub async fn has_message_key(&self, account_id: i64, key: &str) -> CoreResult<bool> {
        let row = sqlx::query("SELECT 1 FROM pop3_seen WHERE account_id = ? AND message_key = ?")
            .bind(account_id)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Append-only: recording an existing key is a no-op
    pub async fn record_message_key(&self, account_id: i64, key: &str) -> CoreResult<()> {
        sqlx::query("INSERT OR IGNORE INTO pop3_seen (account_id, message_key) VALUES (?, ?)")
            .bind(account_id)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- message cache ---

    /// UID -> (seen, flagged) for every cached row of a mailbox
    pub async fn cached_flags(
        &self,
        user_email: &str,
        mailbox: &str,
    ) -> CoreResult<HashMap<u32, (bool, bool)>> {
        let rows = sqlx::query(
            "SELECT uid, is_seen, is_flagged FROM email_cache WHERE user_email = ? AND mailbox = ?",
        )
        .bind(user_email)
        .bind(mailbox)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| {
                (
                    r.get::<i64, _>("uid") as u32,
                    (r.get::<bool, _>("is_seen"), r.get::<bool, _>("is_flagged")),
                )
            })
            .collect())
    }

    /// Delete rows by UID, `chunk_size` UIDs per statement
    pub async fn delete_cached_uids(
        &self,
        user_email: &str,
        mailbox: &str,
        uids: &[u32],
        chunk_size: usize,
    ) -> CoreResult<u64> {
        let mut deleted = 0;

        for chunk in uids.chunks(chunk_size.max(1)) {
            let placeholders: String = chunk.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            let query = format!(
                "DELETE FROM email_cache WHERE user_email = ? AND mailbox = ? AND uid IN ({})",
                placeholders
            );

            let mut q = sqlx::query(&query).bind(user_email).bind(mailbox);
            for uid in chunk {
                q = q.bind(*uid as i64);
            }

            deleted += q.execute(&self.pool).await?.rows_affected();
        }

        Ok(deleted)
    }

    /// Apply (uid, seen, flagged) updates in one transaction
    pub async fn update_cached_flags(
        &self,
        user_email: &str,
        mailbox: &str,
        updates: &[(u32, bool, bool)],
    ) -> CoreResult<()> {
        if updates.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for (uid, seen, flagged) in updates {
            sqlx::query(
                "UPDATE email_cache SET is_seen = ?, is_flagged = ? WHERE user_email = ? AND mailbox = ? AND uid = ?",
            )
            .bind(*seen)
            .bind(*flagged)
            .bind(user_email)
            .bind(mailbox)
            .bind(*uid as i64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    /// Insert a newly observed message. A re-observed UID only gets its flags updated.
    pub async fn insert_cached_message(&self, msg: &CachedMessage) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO email_cache (
                user_email, mailbox, uid, message_id, in_reply_to, from_name, from_address,
                to_addresses, subject, date_sent, date_epoch, is_seen, is_flagged,
                has_attachments, size
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_email, mailbox, uid) DO UPDATE SET
                is_seen = excluded.is_seen,
                is_flagged = excluded.is_flagged
            "#,
        )
        .bind(&msg.user_email)
        .bind(&msg.mailbox)
        .bind(msg.uid)
        .bind(&msg.message_id)
        .bind(&msg.in_reply_to)
        .bind(&msg.from_name)
        .bind(&msg.from_address)
        .bind(&msg.to_addresses)
        .bind(&msg.subject)
        .bind(&msg.date_sent)
        .bind(msg.date_epoch)
        .bind(msg.is_seen)
        .bind(msg.is_flagged)
        .bind(msg.has_attachments)
        .bind(msg.size)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Listing, newest first
    pub async fn cached_messages(
        &self,
        user_email: &str,
        mailbox: &str,
        limit: i64,
        offset: i64,
    ) -> CoreResult<Vec<CachedMessage>> {
        let messages = sqlx::query_as::<_, CachedMessage>(
            r#"
            SELECT id, user_email, mailbox, uid, message_id, in_reply_to, from_name,
                   from_address, to_addresses, subject, date_sent, date_epoch, is_seen,
                   is_flagged, has_attachments, size
            FROM email_cache
            WHERE user_email = ? AND mailbox = ?
            ORDER BY date_epoch DESC, uid DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(user_email)
        .bind(mailbox)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(messages)
    }

    pub async fn clear_mailbox_cache(&self, user_email: &str, mailbox: &str) -> CoreResult<u64> {
        let result = sqlx::query("DELETE FROM email_cache WHERE user_email = ? AND mailbox = ?")
            .bind(user_email)
            .bind(mailbox)
            .execute(&self.pool)
            .await?;

        info!(
            "Cleared {} cached messages for {} / {}",
            result.rows_affected(),
            user_email,
            mailbox
        );
        Ok(result.rows_affected())
    }

    pub async fn mailbox_uidvalidity(&self, user_email: &str, mailbox: &str) -> CoreResult<Option<u32>> {
        let row = sqlx::query("SELECT uidvalidity FROM mailbox_state WHERE user_email = ? AND mailbox = ?")
            .bind(user_email)
            .bind(mailbox)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("uidvalidity") as u32))
    }

    pub async fn set_mailbox_uidvalidity(
        &self,
        user_email: &str,
        mailbox: &str,
        uidvalidity: u32,
    ) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO mailbox_state (user_email, mailbox, uidvalidity)
            VALUES (?, ?, ?)
            ON CONFLICT(user_email, mailbox) DO UPDATE SET
                uidvalidity = excluded.uidvalidity,
                updated_at = datetime('now')
            "#,
        )
        .bind(user_email)
        .bind(mailbox)
        .bind(uidvalidity as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- rules ---

    pub async fn create_rule(&self, rule: &Rule) -> CoreResult<i64> {
        let conditions = serde_json::to_string(&rule.conditions)?;
        let actions = serde_json::to_string(&rule.actions)?;

        let row = sqlx::query(
            r#"
            INSERT INTO mail_rules (user_email, name, conditions, actions, is_active, sort_order)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&rule.user_email)
        .bind(&rule.name)
        .bind(&conditions)
        .bind(&actions)
        .bind(rule.is_active)
        .bind(rule.sort_order)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get::<i64, _>("id"))
    }

    /// Every rule of a user in evaluation order
    pub async fn list_rules(&self, user_email: &str) -> CoreResult<Vec<Rule>> {
        self.query_rules(
            "SELECT id, user_email, name, conditions, actions, is_active, sort_order FROM mail_rules WHERE user_email = ? ORDER BY sort_order, id",
            user_email,
        )
        .await
    }

    pub async fn active_rules(&self, user_email: &str) -> CoreResult<Vec<Rule>> {
        self.query_rules(
            "SELECT id, user_email, name, conditions, actions, is_active, sort_order FROM mail_rules WHERE user_email = ? AND is_active = 1 ORDER BY sort_order, id",
            user_email,
        )
        .await
    }

    /// Returns whether a rule owned by `user_email` was removed
    pub async fn delete_rule(&self, user_email: &str, rule_id: i64) -> CoreResult<bool> {
        let result = sqlx::query("DELETE FROM mail_rules WHERE id = ? AND user_email = ?")
            .bind(rule_id)
            .bind(user_email)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn query_rules(&self, query: &str, user_email: &str) -> CoreResult<Vec<Rule>> {
        #[derive(sqlx::FromRow)]
        struct RuleRow {
            id: i64,
            user_email: String,
            name: String,
            conditions: String,
            actions: String,
            is_active: bool,
            sort_order: i64,
        }

        let rows: Vec<RuleRow> = sqlx::query_as(query)
            .bind(user_email)
            .fetch_all(&self.pool)
            .await?;

        let mut rules = Vec::with_capacity(rows.len());
        for row in rows {
            let conditions = Condition::parse_list(&row.conditions);
            let actions = RuleAction::parse_list(&row.actions);
            let (Some(conditions), Some(actions)) = (conditions, actions) else {
                warn!("Skipping rule {} ({}): unreadable conditions or actions", row.id, row.name);
                continue;
            };

            rules.push(Rule {
                id: row.id,
                user_email: row.user_email,
                name: row.name,
                conditions,
                actions,
                is_active: row.is_active,
                sort_order: row.sort_order,
            });
        }

        Ok(rules)
    }

    // --- sync log ---

    pub async fn log_sync_event(&self, success: bool, emails_processed: i64) -> CoreResult<()> {
        sqlx::query("INSERT INTO sync_state (last_sync_time, status, emails_processed) VALUES (?, ?, ?)")
            .bind(Utc::now().to_rfc3339())
            .bind(if success { "SUCCESS" } else { "FAILED" })
            .bind(emails_processed)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Most recent first
    pub async fn recent_sync_events(&self, limit: i64) -> CoreResult<Vec<SyncEvent>> {
        let events = sqlx::query_as::<_, SyncEvent>(
            "SELECT id, last_sync_time, status, emails_processed FROM sync_state ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }
}

const ACCOUNT_COLUMNS: &str = "id, user_email, pop3_host, pop3_port, pop3_tls, pop3_user, pop3_pass, \
     keep_on_server, is_active, last_status, last_error, last_fetched_at, imap_pass";

#[derive(sqlx::FromRow)]
struct AccountRow {
    id: i64,
    user_email: String,
    pop3_host: String,
    pop3_port: i64,
    pop3_tls: bool,
    pop3_user: String,
    pop3_pass: String,
    keep_on_server: bool,
    is_active: bool,
    last_status: String,
    last_error: Option<String>,
    last_fetched_at: Option<String>,
    imap_pass: Option<String>,
}

impl From<AccountRow> for Account {
    fn from(row: AccountRow) -> Self {
        Account {
            id: row.id,
            user_email: row.user_email,
            pop3_host: row.pop3_host,
            pop3_port: u16::try_from(row.pop3_port).unwrap_or(110),
            pop3_tls: row.pop3_tls,
            pop3_user: row.pop3_user,
            pop3_pass: row.pop3_pass,
            keep_on_server: row.keep_on_server,
            is_active: row.is_active,
            status: AccountStatus::parse(&row.last_status),
            last_error: row.last_error,
            last_fetched_at: row
                .last_fetched_at
                .as_deref()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            imap_pass: row.imap_pass.filter(|p| !p.is_empty()),
        }
    }
}
