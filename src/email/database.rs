use crate::email::message::{AttachmentRef, Message, Thread};
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use sqlx::migrate::MigrateDatabase;
use sqlx::{sqlite::SqlitePoolOptions, QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::{BTreeSet, HashSet};
use thiserror::Error;

/// Local store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database connection error: {0}")]
    Connection(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Date parsing error: {0}")]
    DateParse(#[from] chrono::ParseError),

    #[error("Attachment decoding error: {0}")]
    AttachmentDecode(#[from] base64::DecodeError),

    #[error("Not found: {0}")]
    NotFound(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence for one or more accounts, partitioned by account key
/// (the account's email address).
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Insert or merge a thread and its messages
    async fn save_thread(&self, thread: &Thread, account_key: &str) -> StoreResult<()>;

    /// All threads of an account in first-seen order
    async fn fetch_threads(&self, account_key: &str) -> StoreResult<Vec<Thread>>;

    async fn fetch_message(&self, id: &str, account_key: &str) -> StoreResult<Option<Message>>;

    async fn update_read_status(&self, id: &str, is_read: bool, account_key: &str) -> StoreResult<()>;

    async fn update_archive_status(&self, id: &str, is_archived: bool, account_key: &str) -> StoreResult<()>;

    /// Threads whose subject contains `query`, ignoring case
    async fn search_threads(&self, query: &str, account_key: &str) -> StoreResult<Vec<Thread>>;

    async fn save_attachment_data(&self, attachment_id: &str, data: &[u8]) -> StoreResult<()>;

    async fn get_attachment_data(&self, attachment_id: &str) -> StoreResult<Option<Vec<u8>>>;

    async fn update_last_sync_date(&self, date: DateTime<Utc>, account_key: &str) -> StoreResult<()>;

    async fn get_last_sync_date(&self, account_key: &str) -> StoreResult<Option<DateTime<Utc>>>;

    /// Remove every thread, message and the sync date of one account
    async fn clear_cache(&self, account_key: &str) -> StoreResult<()>;

    async fn pinned_conversations(&self, account_key: &str) -> StoreResult<HashSet<String>>;

    async fn set_pinned(&self, conversation_id: &str, pinned: bool, account_key: &str) -> StoreResult<()>;

    async fn promoted_threads(&self, account_key: &str) -> StoreResult<HashSet<String>>;

    async fn set_promoted(&self, thread_id: &str, promoted: bool, account_key: &str) -> StoreResult<()>;
}

/// Store statistics for one account
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub thread_count: u32,
    pub message_count: u32,
    pub unread_count: u32,
}

/// SQLite-backed local store
pub struct SqliteStore {
    pub pool: SqlitePool,
    db_path: String,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `db_path`
    pub async fn new(db_path: &str) -> StoreResult<Self> {
        if !sqlx::Sqlite::database_exists(db_path).await.unwrap_or(false) {
            sqlx::Sqlite::create_database(db_path)
                .await
                .map_err(|e| StoreError::Migration(format!("Failed to create database: {}", e)))?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(db_path)
            .await?;

        let store = Self {
            pool,
            db_path: db_path.to_string(),
        };
        store.migrate().await?;

        tracing::debug!("Opened local store at {}", db_path);
        Ok(store)
    }

    /// In-memory store for tests
    pub async fn new_in_memory() -> StoreResult<Self> {
        // A single connection, otherwise every connection gets its own database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(":memory:")
            .await?;

        let store = Self {
            pool,
            db_path: ":memory:".to_string(),
        };
        store.migrate().await?;
        Ok(store)
    }

    pub fn path(&self) -> &str {
        &self.db_path
    }

    async fn migrate(&self) -> StoreResult<()> {
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS threads (
                account_key TEXT NOT NULL,
                id TEXT NOT NULL,
                subject TEXT NOT NULL,
                participants TEXT NOT NULL, -- JSON array
                is_muted BOOLEAN NOT NULL DEFAULT FALSE,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (account_key, id)
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                account_key TEXT NOT NULL,
                id TEXT NOT NULL,
                thread_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                subject TEXT NOT NULL,
                sender TEXT NOT NULL,
                recipients TEXT NOT NULL, -- JSON array
                preview TEXT NOT NULL,
                body TEXT NOT NULL,
                received_at TEXT NOT NULL,
                is_read BOOLEAN NOT NULL DEFAULT FALSE,
                is_archived BOOLEAN NOT NULL DEFAULT FALSE,
                attachments TEXT NOT NULL, -- JSON array
                PRIMARY KEY (account_key, id),
                FOREIGN KEY (account_key, thread_id) REFERENCES threads(account_key, id) ON DELETE CASCADE
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS attachment_data (
                id TEXT PRIMARY KEY,
                data TEXT NOT NULL, -- base64
                updated_at TEXT NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_state (
                account_key TEXT PRIMARY KEY,
                last_sync TEXT NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pinned_conversations (
                account_key TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                PRIMARY KEY (account_key, conversation_id)
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS promoted_threads (
                account_key TEXT NOT NULL,
                thread_id TEXT NOT NULL,
                PRIMARY KEY (account_key, thread_id)
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(account_key, thread_id, position)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_received ON messages(received_at DESC)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_threads_subject ON threads(subject)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Counts for one account
    pub async fn get_stats(&self, account_key: &str) -> StoreResult<StoreStats> {
        let thread_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM threads WHERE account_key = ?1")
            .bind(account_key)
            .fetch_one(&self.pool)
            .await?;

        let message_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE account_key = ?1")
            .bind(account_key)
            .fetch_one(&self.pool)
            .await?;

        let unread_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE account_key = ?1 AND is_read = FALSE")
                .bind(account_key)
                .fetch_one(&self.pool)
                .await?;

        Ok(StoreStats {
            thread_count: thread_count as u32,
            message_count: message_count as u32,
            unread_count: unread_count as u32,
        })
    }

    async fn load_thread_rows(&self, rows: Vec<sqlx::sqlite::SqliteRow>, account_key: &str) -> StoreResult<Vec<Thread>> {
        let mut threads = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            let participants: BTreeSet<String> = serde_json::from_str(row.get("participants"))?;

            let message_rows = sqlx::query(
                r#"
                SELECT id, thread_id, subject, sender, recipients, preview, body,
                       received_at, is_read, is_archived, attachments
                FROM messages
                WHERE account_key = ?1 AND thread_id = ?2
                ORDER BY position ASC
            "#,
            )
            .bind(account_key)
            .bind(&id)
            .fetch_all(&self.pool)
            .await?;

            let mut messages = Vec::with_capacity(message_rows.len());
            for message_row in message_rows {
                messages.push(row_to_message(message_row)?);
            }

            threads.push(Thread {
                id,
                subject: row.get("subject"),
                messages,
                participants,
                is_muted: row.get("is_muted"),
            });
        }
        Ok(threads)
    }

    async fn set_membership(&self, table: Membership, item_id: &str, member: bool, account_key: &str) -> StoreResult<()> {
        let (insert, delete) = match table {
            Membership::Pinned => (
                "INSERT OR IGNORE INTO pinned_conversations (account_key, conversation_id) VALUES (?1, ?2)",
                "DELETE FROM pinned_conversations WHERE account_key = ?1 AND conversation_id = ?2",
            ),
            Membership::Promoted => (
                "INSERT OR IGNORE INTO promoted_threads (account_key, thread_id) VALUES (?1, ?2)",
                "DELETE FROM promoted_threads WHERE account_key = ?1 AND thread_id = ?2",
            ),
        };

        sqlx::query(if member { insert } else { delete })
            .bind(account_key)
            .bind(item_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn membership(&self, table: Membership, account_key: &str) -> StoreResult<HashSet<String>> {
        let query = match table {
            Membership::Pinned => "SELECT conversation_id FROM pinned_conversations WHERE account_key = ?1",
            Membership::Promoted => "SELECT thread_id FROM promoted_threads WHERE account_key = ?1",
        };

        let ids: Vec<String> = sqlx::query_scalar(query)
            .bind(account_key)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().collect())
    }
}

#[derive(Debug, Clone, Copy)]
enum Membership {
    Pinned,
    Promoted,
}

fn row_to_message(row: sqlx::sqlite::SqliteRow) -> StoreResult<Message> {
    let recipients: Vec<String> = serde_json::from_str(row.get("recipients"))?;
    let attachments: Vec<AttachmentRef> = serde_json::from_str(row.get("attachments"))?;
    let received_at: DateTime<Utc> = DateTime::parse_from_rfc3339(row.get("received_at"))?.into();

    Ok(Message {
        id: row.get("id"),
        thread_id: row.get("thread_id"),
        subject: row.get("subject"),
        sender: row.get("sender"),
        recipients,
        preview: row.get("preview"),
        body: row.get("body"),
        received_at,
        is_read: row.get("is_read"),
        is_archived: row.get("is_archived"),
        attachments,
    })
}

/// Escape LIKE wildcards so user input matches literally
fn like_pattern(query: &str) -> String {
    let mut escaped = String::with_capacity(query.len() + 2);
    escaped.push('%');
    for c in query.to_lowercase().chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

#[async_trait]
impl LocalStore for SqliteStore {
    async fn save_thread(&self, thread: &Thread, account_key: &str) -> StoreResult<()> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        // Upsert keeps the rowid, so first-seen order survives re-fetches
        sqlx::query(
            r#"
            INSERT INTO threads (account_key, id, subject, participants, is_muted, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(account_key, id) DO UPDATE SET
                subject = excluded.subject,
                participants = excluded.participants,
                is_muted = excluded.is_muted,
                updated_at = excluded.updated_at
        "#,
        )
        .bind(account_key)
        .bind(&thread.id)
        .bind(&thread.subject)
        .bind(serde_json::to_string(&thread.participants)?)
        .bind(thread.is_muted)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        for (position, message) in thread.messages.iter().enumerate() {
            // Flags set locally are never cleared by a re-fetch
            sqlx::query(
                r#"
                INSERT INTO messages (
                    account_key, id, thread_id, position, subject, sender, recipients,
                    preview, body, received_at, is_read, is_archived, attachments
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                ON CONFLICT(account_key, id) DO UPDATE SET
                    thread_id = excluded.thread_id,
                    position = excluded.position,
                    subject = excluded.subject,
                    sender = excluded.sender,
                    recipients = excluded.recipients,
                    preview = excluded.preview,
                    body = excluded.body,
                    received_at = excluded.received_at,
                    is_read = MAX(messages.is_read, excluded.is_read),
                    is_archived = MAX(messages.is_archived, excluded.is_archived),
                    attachments = excluded.attachments
            "#,
            )
            .bind(account_key)
            .bind(&message.id)
            .bind(&thread.id)
            .bind(position as i64)
            .bind(&message.subject)
            .bind(&message.sender)
            .bind(serde_json::to_string(&message.recipients)?)
            .bind(&message.preview)
            .bind(&message.body)
            .bind(message.received_at.to_rfc3339())
            .bind(message.is_read)
            .bind(message.is_archived)
            .bind(serde_json::to_string(&message.attachments)?)
            .execute(&mut *tx)
            .await?;
        }

        // Messages the provider no longer lists for this thread
        let mut prune = QueryBuilder::<Sqlite>::new("DELETE FROM messages WHERE account_key = ");
        prune.push_bind(account_key);
        prune.push(" AND thread_id = ");
        prune.push_bind(thread.id.as_str());
        if !thread.messages.is_empty() {
            prune.push(" AND id NOT IN (");
            let mut ids = prune.separated(", ");
            for message in &thread.messages {
                ids.push_bind(message.id.as_str());
            }
            prune.push(")");
        }
        let pruned = prune.build().execute(&mut *tx).await?.rows_affected();

        tx.commit().await?;

        if pruned > 0 {
            tracing::debug!("Dropped {} stale messages from thread {}", pruned, thread.id);
        }
        tracing::debug!(
            "Saved thread {} ({} messages) for {}",
            thread.id,
            thread.messages.len(),
            account_key
        );
        Ok(())
    }

    async fn fetch_threads(&self, account_key: &str) -> StoreResult<Vec<Thread>> {
        let rows = sqlx::query(
            r#"
            SELECT id, subject, participants, is_muted
            FROM threads
            WHERE account_key = ?1
            ORDER BY rowid ASC
        "#,
        )
        .bind(account_key)
        .fetch_all(&self.pool)
        .await?;

        self.load_thread_rows(rows, account_key).await
    }

    async fn fetch_message(&self, id: &str, account_key: &str) -> StoreResult<Option<Message>> {
        let row = sqlx::query(
            r#"
            SELECT id, thread_id, subject, sender, recipients, preview, body,
                   received_at, is_read, is_archived, attachments
            FROM messages
            WHERE account_key = ?1 AND id = ?2
        "#,
        )
        .bind(account_key)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(row_to_message(row)?)),
            None => Ok(None),
        }
    }

    async fn update_read_status(&self, id: &str, is_read: bool, account_key: &str) -> StoreResult<()> {
        let result = sqlx::query("UPDATE messages SET is_read = ?1 WHERE account_key = ?2 AND id = ?3")
            .bind(is_read)
            .bind(account_key)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("message {}", id)));
        }
        Ok(())
    }

    async fn update_archive_status(&self, id: &str, is_archived: bool, account_key: &str) -> StoreResult<()> {
        let result = sqlx::query("UPDATE messages SET is_archived = ?1 WHERE account_key = ?2 AND id = ?3")
            .bind(is_archived)
            .bind(account_key)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("message {}", id)));
        }
        Ok(())
    }

    async fn search_threads(&self, query: &str, account_key: &str) -> StoreResult<Vec<Thread>> {
        let rows = sqlx::query(
            r#"
            SELECT id, subject, participants, is_muted
            FROM threads
            WHERE account_key = ?1 AND lower(subject) LIKE ?2 ESCAPE '\'
            ORDER BY rowid ASC
        "#,
        )
        .bind(account_key)
        .bind(like_pattern(query))
        .fetch_all(&self.pool)
        .await?;

        self.load_thread_rows(rows, account_key).await
    }

    async fn save_attachment_data(&self, attachment_id: &str, data: &[u8]) -> StoreResult<()> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(data);

        sqlx::query("INSERT OR REPLACE INTO attachment_data (id, data, updated_at) VALUES (?1, ?2, ?3)")
            .bind(attachment_id)
            .bind(encoded)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_attachment_data(&self, attachment_id: &str) -> StoreResult<Option<Vec<u8>>> {
        let encoded: Option<String> = sqlx::query_scalar("SELECT data FROM attachment_data WHERE id = ?1")
            .bind(attachment_id)
            .fetch_optional(&self.pool)
            .await?;

        match encoded {
            Some(encoded) => Ok(Some(base64::engine::general_purpose::STANDARD.decode(encoded)?)),
            None => Ok(None),
        }
    }

    async fn update_last_sync_date(&self, date: DateTime<Utc>, account_key: &str) -> StoreResult<()> {
        sqlx::query("INSERT OR REPLACE INTO sync_state (account_key, last_sync) VALUES (?1, ?2)")
            .bind(account_key)
            .bind(date.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_last_sync_date(&self, account_key: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let last_sync: Option<String> = sqlx::query_scalar("SELECT last_sync FROM sync_state WHERE account_key = ?1")
            .bind(account_key)
            .fetch_optional(&self.pool)
            .await?;

        match last_sync {
            Some(s) => Ok(Some(DateTime::parse_from_rfc3339(&s)?.into())),
            None => Ok(None),
        }
    }

    async fn clear_cache(&self, account_key: &str) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM messages WHERE account_key = ?1")
            .bind(account_key)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM threads WHERE account_key = ?1")
            .bind(account_key)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM sync_state WHERE account_key = ?1")
            .bind(account_key)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        tracing::info!("Cleared cached mail for {}", account_key);
        Ok(())
    }

    async fn pinned_conversations(&self, account_key: &str) -> StoreResult<HashSet<String>> {
        self.membership(Membership::Pinned, account_key).await
    }

    async fn set_pinned(&self, conversation_id: &str, pinned: bool, account_key: &str) -> StoreResult<()> {
        self.set_membership(Membership::Pinned, conversation_id, pinned, account_key)
            .await
    }

    async fn promoted_threads(&self, account_key: &str) -> StoreResult<HashSet<String>> {
        self.membership(Membership::Promoted, account_key).await
    }

    async fn set_promoted(&self, thread_id: &str, promoted: bool, account_key: &str) -> StoreResult<()> {
        self.set_membership(Membership::Promoted, thread_id, promoted, account_key)
            .await
    }
}
