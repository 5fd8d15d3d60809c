use std::collections::HashSet;
use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{SqlitePool, sqlite::SqliteConnectOptions, sqlite::SqlitePoolOptions};

mod audit;

pub use audit::{AccountLog, FileAccountLog, SpamLogEntry};

/// Header spam level at or above which a message is junked when the account
/// does not configure its own threshold.
pub const DEFAULT_SPAM_THRESHOLD: u32 = 5;

const DELETE_CHUNK: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub user_id: UserId,
    pub email: String,
    pub login: String,
    pub password_enc: String,
    pub server: String,
    pub junk_folder: String,
    pub trash_folder: String,
    pub spam_level_threshold: Option<u32>,
    pub classification_enabled: bool,
    pub uid_validity: Option<u32>,
    pub last_seen_uid: Option<u32>,
}

impl Account {
    pub fn spam_threshold(&self) -> u32 {
        match self.spam_level_threshold {
            Some(level) if level > 0 => level,
            _ => DEFAULT_SPAM_THRESHOLD,
        }
    }
}

/// UIDVALIDITY plus the highest UID assigned under it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UidEpoch {
    pub uid_validity: u32,
    pub last_uid: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingAction {
    Spam,
    Deleted,
    Ham,
}

impl PendingAction {
    pub fn as_str(self) -> &'static str {
        match self {
            PendingAction::Spam => "spam",
            PendingAction::Deleted => "deleted",
            PendingAction::Ham => "ham",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "spam" => Some(PendingAction::Spam),
            "deleted" | "delete" => Some(PendingAction::Deleted),
            "ham" => Some(PendingAction::Ham),
            _ => None,
        }
    }
}

/// One message as fetched from the server, parsed once and passed by value
/// through the decision pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchedMessage {
    pub uid: u32,
    pub message_id: Option<String>,
    /// RFC 3339, `None` when missing or implausible.
    pub date: Option<String>,
    pub from: String,
    pub sender_address: String,
    pub to_address: String,
    pub subject: String,
    pub headers: Vec<(String, String)>,
    pub text: String,
    pub html_body: String,
    pub html_raw: String,
    pub raw: String,
}

impl FetchedMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn headers_text(&self) -> String {
        self.headers
            .iter()
            .map(|(key, value)| format!("{}: {}", key, value))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn message_id_or_fallback(&self) -> String {
        match self.message_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => format!("no-id-{}", self.uid),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedMessage {
    pub id: i64,
    pub account_id: i64,
    pub user_id: UserId,
    pub uid: u32,
    pub message_id: String,
    pub date: Option<String>,
    pub sender: String,
    pub subject: String,
    pub headers: String,
    pub body: String,
    pub html_body: String,
    pub html_raw: String,
    pub raw: String,
    pub seen: bool,
    pub pending_action: Option<PendingAction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterRule {
    pub id: i64,
    pub account_id: i64,
    pub field: String,
    pub mode: String,
    pub value: String,
    pub target_folder: Option<String>,
    pub mark_read: bool,
    pub active: bool,
    pub created_at: String,
    pub usage_count: i64,
    pub last_used: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFilterRule {
    pub account_id: i64,
    pub field: String,
    pub mode: String,
    pub value: String,
    pub target_folder: Option<String>,
    pub mark_read: bool,
    pub active: bool,
}

#[async_trait]
pub trait MessageCache: Send + Sync {
    async fn list_accounts(&self) -> Result<Vec<Account>>;
    async fn get_account(&self, account_id: i64) -> Result<Option<Account>>;
    async fn cached_uids(&self, account_id: i64) -> Result<HashSet<u32>>;
    /// Returns false when the (account, uid) row already exists.
    async fn insert_message(&self, account: &Account, message: &FetchedMessage) -> Result<bool>;
    /// Drops rows whose UID is gone remotely and records the highest UID, atomically.
    async fn prune_missing(
        &self,
        account_id: i64,
        present: &HashSet<u32>,
        last_uid: Option<u32>,
    ) -> Result<u64>;
    /// Drops every row of the account and stores the new epoch, atomically.
    async fn reset_epoch(&self, account_id: i64, epoch: UidEpoch) -> Result<u64>;
    async fn pending_actions(&self, account_id: i64) -> Result<Vec<CachedMessage>>;
    async fn delete_message(&self, message_id: i64) -> Result<()>;
    async fn clear_pending_action(&self, message_id: i64) -> Result<()>;
    async fn read_uids(&self, account_id: i64) -> Result<Vec<u32>>;
    async fn active_rules(&self, account_id: i64) -> Result<Vec<FilterRule>>;
    async fn record_rule_hit(&self, rule_id: i64) -> Result<()>;
    async fn whitelist_for(&self, account: &Account) -> Result<Vec<String>>;
    async fn add_whitelist_entry(
        &self,
        user_id: UserId,
        account_id: Option<i64>,
        pattern: &str,
    ) -> Result<bool>;
}

#[derive(Clone)]
pub struct SqliteMessageCache {
    pool: SqlitePool,
}

type AccountRow = (
    i64,
    i64,
    String,
    String,
    String,
    String,
    String,
    String,
    Option<i64>,
    i64,
    Option<i64>,
    Option<i64>,
);

type MessageRow = (
    i64,
    i64,
    i64,
    i64,
    String,
    Option<String>,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    i64,
    Option<String>,
);

const ACCOUNT_COLUMNS: &str = "id, user_id, email, login, password_enc, server, junk_folder, trash_folder,
     spam_level_threshold, classification_enabled, uid_validity, last_seen_uid";

const MESSAGE_COLUMNS: &str = "id, account_id, user_id, uid, message_id, date, sender, subject, headers,
     body, html_body, html_raw, raw, seen, pending_action";

fn account_from_row(row: AccountRow) -> Account {
    Account {
        id: row.0,
        user_id: UserId(row.1),
        email: row.2,
        login: row.3,
        password_enc: row.4,
        server: row.5,
        junk_folder: row.6,
        trash_folder: row.7,
        spam_level_threshold: row.8.map(|v| v.max(0) as u32),
        classification_enabled: row.9 != 0,
        uid_validity: row.10.map(|v| v as u32),
        last_seen_uid: row.11.map(|v| v as u32),
    }
}

fn message_from_row(row: MessageRow) -> CachedMessage {
    CachedMessage {
        id: row.0,
        account_id: row.1,
        user_id: UserId(row.2),
        uid: row.3 as u32,
        message_id: row.4,
        date: row.5,
        sender: row.6,
        subject: row.7,
        headers: row.8,
        body: row.9,
        html_body: row.10,
        html_raw: row.11,
        raw: row.12,
        seen: row.13 != 0,
        pending_action: row.14.as_deref().and_then(PendingAction::parse),
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl SqliteMessageCache {
    pub async fn connect(path: &str) -> Result<Self> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{}", path)
        };
        let options = SqliteConnectOptions::new()
            .filename(url.trim_start_matches("sqlite:"))
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub async fn init(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn upsert_user(&self, user_id: UserId, username: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (id, username) VALUES (?, ?)
             ON CONFLICT(id) DO UPDATE SET username = excluded.username",
        )
        .bind(user_id.0)
        .bind(username)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_account(&self, account: &Account) -> Result<()> {
        sqlx::query(
            "INSERT INTO accounts (id, user_id, email, login, password_enc, server, junk_folder,
               trash_folder, spam_level_threshold, classification_enabled, uid_validity, last_seen_uid)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
               user_id = excluded.user_id,
               email = excluded.email,
               login = excluded.login,
               password_enc = excluded.password_enc,
               server = excluded.server,
               junk_folder = excluded.junk_folder,
               trash_folder = excluded.trash_folder,
               spam_level_threshold = excluded.spam_level_threshold,
               classification_enabled = excluded.classification_enabled",
        )
        .bind(account.id)
        .bind(account.user_id.0)
        .bind(&account.email)
        .bind(&account.login)
        .bind(&account.password_enc)
        .bind(&account.server)
        .bind(&account.junk_folder)
        .bind(&account.trash_folder)
        .bind(account.spam_level_threshold.map(i64::from))
        .bind(account.classification_enabled as i64)
        .bind(account.uid_validity.map(i64::from))
        .bind(account.last_seen_uid.map(i64::from))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn add_rule(&self, rule: &NewFilterRule) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO filters (account_id, field, mode, value, target_folder, mark_read, active)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(rule.account_id)
        .bind(&rule.field)
        .bind(&rule.mode)
        .bind(&rule.value)
        .bind(rule.target_folder.as_deref())
        .bind(rule.mark_read as i64)
        .bind(rule.active as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_rule(&self, rule_id: i64) -> Result<Option<FilterRule>> {
        let row = sqlx::query_as::<
            _,
            (
                i64,
                i64,
                String,
                String,
                String,
                Option<String>,
                i64,
                i64,
                String,
                i64,
                Option<String>,
            ),
        >(
            "SELECT id, account_id, field, mode, value, target_folder, mark_read, active,
                    created_at, usage_count, last_used
             FROM filters WHERE id = ?",
        )
        .bind(rule_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| FilterRule {
            id: r.0,
            account_id: r.1,
            field: r.2,
            mode: r.3,
            value: r.4,
            target_folder: r.5,
            mark_read: r.6 != 0,
            active: r.7 != 0,
            created_at: r.8,
            usage_count: r.9,
            last_used: r.10,
        }))
    }

    pub async fn get_message(&self, message_id: i64) -> Result<Option<CachedMessage>> {
        let query = format!("SELECT {} FROM messages WHERE id = ?", MESSAGE_COLUMNS);
        let row = sqlx::query_as::<_, MessageRow>(&query)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(message_from_row))
    }

    pub async fn message_id_for_uid(&self, account_id: i64, uid: u32) -> Result<Option<i64>> {
        let row = sqlx::query_as::<_, (i64,)>(
            "SELECT id FROM messages WHERE account_id = ? AND uid = ?",
        )
        .bind(account_id)
        .bind(i64::from(uid))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.0))
    }

    pub async fn count_messages(&self, account_id: i64) -> Result<i64> {
        let row = sqlx::query_as::<_, (i64,)>("SELECT COUNT(*) FROM messages WHERE account_id = ?")
            .bind(account_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    /// Records a user decision for the write-back processor.
    pub async fn set_pending_action(
        &self,
        message_id: i64,
        action: Option<PendingAction>,
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE messages SET pending_action = ? WHERE id = ?")
            .bind(action.map(PendingAction::as_str))
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn set_seen(&self, message_id: i64, seen: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE messages SET seen = ? WHERE id = ?")
            .bind(seen as i64)
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

fn placeholders(count: usize) -> String {
    std::iter::repeat("?")
        .take(count)
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait]
impl MessageCache for SqliteMessageCache {
    async fn list_accounts(&self) -> Result<Vec<Account>> {
        let query = format!("SELECT {} FROM accounts ORDER BY id", ACCOUNT_COLUMNS);
        let rows = sqlx::query_as::<_, AccountRow>(&query)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(account_from_row).collect())
    }

    async fn get_account(&self, account_id: i64) -> Result<Option<Account>> {
        let query = format!("SELECT {} FROM accounts WHERE id = ?", ACCOUNT_COLUMNS);
        let row = sqlx::query_as::<_, AccountRow>(&query)
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(account_from_row))
    }

    async fn cached_uids(&self, account_id: i64) -> Result<HashSet<u32>> {
        let rows = sqlx::query_as::<_, (i64,)>("SELECT uid FROM messages WHERE account_id = ?")
            .bind(account_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.0 as u32).collect())
    }

    async fn insert_message(&self, account: &Account, message: &FetchedMessage) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO messages (account_id, user_id, uid, message_id, date, sender, subject,
               headers, body, html_body, html_raw, raw, seen)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
             ON CONFLICT(account_id, uid) DO NOTHING",
        )
        .bind(account.id)
        .bind(account.user_id.0)
        .bind(i64::from(message.uid))
        .bind(message.message_id_or_fallback())
        .bind(message.date.as_deref())
        .bind(&message.from)
        .bind(&message.subject)
        .bind(message.headers_text())
        .bind(&message.text)
        .bind(&message.html_body)
        .bind(&message.html_raw)
        .bind(&message.raw)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn prune_missing(
        &self,
        account_id: i64,
        present: &HashSet<u32>,
        last_uid: Option<u32>,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let cached: Vec<i64> =
            sqlx::query_as::<_, (i64,)>("SELECT uid FROM messages WHERE account_id = ?")
                .bind(account_id)
                .fetch_all(&mut *tx)
                .await?
                .into_iter()
                .map(|r| r.0)
                .collect();
        let missing: Vec<i64> = cached
            .into_iter()
            .filter(|uid| !present.contains(&(*uid as u32)))
            .collect();

        let mut removed = 0u64;
        for chunk in missing.chunks(DELETE_CHUNK) {
            let query = format!(
                "DELETE FROM messages WHERE account_id = ? AND uid IN ({})",
                placeholders(chunk.len())
            );
            let mut delete = sqlx::query(&query).bind(account_id);
            for uid in chunk {
                delete = delete.bind(uid);
            }
            removed += delete.execute(&mut *tx).await?.rows_affected();
        }

        if let Some(last_uid) = last_uid {
            sqlx::query("UPDATE accounts SET last_seen_uid = ? WHERE id = ?")
                .bind(i64::from(last_uid))
                .bind(account_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(removed)
    }

    async fn reset_epoch(&self, account_id: i64, epoch: UidEpoch) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query("DELETE FROM messages WHERE account_id = ?")
            .bind(account_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("UPDATE accounts SET uid_validity = ?, last_seen_uid = ? WHERE id = ?")
            .bind(i64::from(epoch.uid_validity))
            .bind(i64::from(epoch.last_uid))
            .bind(account_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(removed)
    }

    async fn pending_actions(&self, account_id: i64) -> Result<Vec<CachedMessage>> {
        let query = format!(
            "SELECT {} FROM messages
             WHERE account_id = ? AND pending_action IS NOT NULL
             ORDER BY id",
            MESSAGE_COLUMNS
        );
        let rows = sqlx::query_as::<_, MessageRow>(&query)
            .bind(account_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(message_from_row).collect())
    }

    async fn delete_message(&self, message_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear_pending_action(&self, message_id: i64) -> Result<()> {
        sqlx::query("UPDATE messages SET pending_action = NULL WHERE id = ?")
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn read_uids(&self, account_id: i64) -> Result<Vec<u32>> {
        let rows = sqlx::query_as::<_, (i64,)>(
            "SELECT uid FROM messages WHERE account_id = ? AND seen = 1 ORDER BY uid",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0 as u32).collect())
    }

    async fn active_rules(&self, account_id: i64) -> Result<Vec<FilterRule>> {
        let rows = sqlx::query_as::<
            _,
            (
                i64,
                i64,
                String,
                String,
                String,
                Option<String>,
                i64,
                i64,
                String,
                i64,
                Option<String>,
            ),
        >(
            "SELECT id, account_id, field, mode, value, target_folder, mark_read, active,
                    created_at, usage_count, last_used
             FROM filters
             WHERE account_id = ? AND active = 1
             ORDER BY created_at, id",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| FilterRule {
                id: r.0,
                account_id: r.1,
                field: r.2,
                mode: r.3,
                value: r.4,
                target_folder: r.5,
                mark_read: r.6 != 0,
                active: r.7 != 0,
                created_at: r.8,
                usage_count: r.9,
                last_used: r.10,
            })
            .collect())
    }

    async fn record_rule_hit(&self, rule_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE filters SET usage_count = usage_count + 1, last_used = ? WHERE id = ?",
        )
        .bind(now_rfc3339())
        .bind(rule_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn whitelist_for(&self, account: &Account) -> Result<Vec<String>> {
        let rows = sqlx::query_as::<_, (String,)>(
            "SELECT sender_address FROM whitelist
             WHERE user_id = ? AND (account_id IS NULL OR account_id = ?)
             ORDER BY id",
        )
        .bind(account.user_id.0)
        .bind(account.id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    async fn add_whitelist_entry(
        &self,
        user_id: UserId,
        account_id: Option<i64>,
        pattern: &str,
    ) -> Result<bool> {
        let pattern = pattern.trim().to_lowercase();
        if pattern.is_empty() {
            return Ok(false);
        }
        let result = sqlx::query(
            "INSERT INTO whitelist (user_id, account_id, sender_address) VALUES (?, ?, ?)
             ON CONFLICT DO NOTHING",
        )
        .bind(user_id.0)
        .bind(account_id)
        .bind(&pattern)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
