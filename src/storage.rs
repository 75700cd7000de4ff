use crate::models::{ChatMessage, Conversation, ConversationWithMessages, Message};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Executor, Row, Sqlite, SqlitePool};
use std::str::FromStr;

// Define the database schema using CREATE TABLE IF NOT EXISTS statements
const MIGRATIONS_SQL: &str = "
-- Conversations Table
CREATE TABLE IF NOT EXISTS conversations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    created_at INTEGER NOT NULL, -- Unix Timestamp (milliseconds)
    updated_at INTEGER NOT NULL  -- Unix Timestamp (milliseconds)
);

-- Messages Table
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id INTEGER NOT NULL,
    role TEXT NOT NULL CHECK (role IN ('user', 'assistant', 'system')),
    content TEXT NOT NULL,
    created_at INTEGER NOT NULL, -- Unix Timestamp (milliseconds)
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_messages_conversation_id ON messages(conversation_id);
CREATE INDEX IF NOT EXISTS idx_messages_created_at ON messages(created_at);
";

fn timestamp(millis: i64, column: &str) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .with_context(|| format!("Invalid {} timestamp: {}", column, millis))
}

fn conversation_from_row(row: &SqliteRow) -> Result<Conversation> {
    Ok(Conversation {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        created_at: timestamp(row.try_get("created_at")?, "created_at")?,
        updated_at: timestamp(row.try_get("updated_at")?, "updated_at")?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    let role: String = row.try_get("role")?;
    Ok(Message {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        role: role.parse()?,
        content: row.try_get("content")?,
        created_at: timestamp(row.try_get("created_at")?, "message created_at")?,
    })
}

// Shared by `get_messages` and the transactional read in `get_conversation`.
async fn fetch_messages<'e, E>(executor: E, conversation_id: i64) -> Result<Vec<Message>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(
        r#"
        SELECT id, conversation_id, role, content, created_at
        FROM messages
        WHERE conversation_id = ?
        ORDER BY created_at ASC, id ASC
        "#,
    )
    .bind(conversation_id)
    .fetch_all(executor)
    .await
    .context("Failed to fetch messages from database")?;

    let messages = rows
        .iter()
        .map(message_from_row)
        .collect::<Result<Vec<_>>>()?;
    log::debug!("Fetched {} messages for conversation {}", messages.len(), conversation_id);
    Ok(messages)
}

/// Conversation and message persistence over SQLite. Cloning shares the
/// underlying connection pool.
#[derive(Debug, Clone)]
pub struct StorageManager {
    pool: SqlitePool,
}

impl StorageManager {
    /// Connects to the database (creating the file if needed) and runs migrations.
    pub async fn new(database_url: &str) -> Result<Self> {
        log::info!("Connecting to database: {}", database_url);
        let options = SqliteConnectOptions::from_str(database_url)
            .context("Invalid database URL")?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// A private in-memory database. Every connection to `:memory:` is its
    /// own database, so the pool is pinned to a single long-lived connection.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("Invalid in-memory database URL")?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to open in-memory SQLite database")?;

        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Applies the database schema migrations.
    async fn run_migrations(pool: &SqlitePool) -> Result<()> {
        log::info!("Running database migrations...");
        sqlx::query(MIGRATIONS_SQL)
            .execute(pool)
            .await
            .context("Failed to run database migrations")?;
        log::info!("Database migrations completed.");
        Ok(())
    }

    /// Inserts a new conversation; id and timestamps are assigned here.
    pub async fn create_conversation(&self, title: &str) -> Result<Conversation> {
        let now = Utc::now();
        let now_ts = now.timestamp_millis();

        let result = sqlx::query(
            "INSERT INTO conversations (title, created_at, updated_at) VALUES (?, ?, ?)",
        )
        .bind(title)
        .bind(now_ts)
        .bind(now_ts)
        .execute(&self.pool)
        .await
        .context("Failed to insert new conversation into database")?;

        let conversation = Conversation {
            id: result.last_insert_rowid(),
            title: title.to_string(),
            created_at: timestamp(now_ts, "created_at")?,
            updated_at: timestamp(now_ts, "updated_at")?,
        };
        log::info!("Created conversation with ID: {}", conversation.id);
        Ok(conversation)
    }

    /// Fetches all conversations, ordered by last update ascending.
    pub async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let rows = sqlx::query(
            r#"
            SELECT id, title, created_at, updated_at
            FROM conversations
            ORDER BY updated_at ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch conversations from database")?;

        let conversations = rows
            .iter()
            .map(conversation_from_row)
            .collect::<Result<Vec<_>>>()?;
        log::debug!("Fetched {} conversations", conversations.len());
        Ok(conversations)
    }

    /// Fetches a conversation and its messages. A missing id is `Ok(None)`.
    /// Both reads share one transaction, so the messages always match the
    /// conversation's `updated_at`.
    pub async fn get_conversation(&self, id: i64) -> Result<Option<ConversationWithMessages>> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let row = sqlx::query(
            "SELECT id, title, created_at, updated_at FROM conversations WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to fetch conversation from database")?;

        let Some(row) = row else {
            log::debug!("Conversation {} not found", id);
            return Ok(None);
        };

        let conversation = conversation_from_row(&row)?;
        let messages = fetch_messages(&mut *tx, id).await?;
        tx.commit().await.context("Failed to finish conversation read")?;
        Ok(Some(ConversationWithMessages { conversation, messages }))
    }

    /// Appends a message and advances the owning conversation's `updated_at`
    /// in the same transaction. `updated_at` never moves backwards.
    pub async fn add_message(
        &self,
        conversation_id: i64,
        message: &ChatMessage,
    ) -> Result<Message> {
        let now_ts = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let result = sqlx::query(
            "INSERT INTO messages (conversation_id, role, content, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(conversation_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(now_ts)
        .execute(&mut *tx)
        .await
        .with_context(|| {
            format!("Failed to insert message into conversation {}", conversation_id)
        })?;

        sqlx::query("UPDATE conversations SET updated_at = MAX(updated_at, ?) WHERE id = ?")
            .bind(now_ts)
            .bind(conversation_id)
            .execute(&mut *tx)
            .await
            .context("Failed to update conversation updated_at timestamp")?;

        tx.commit().await.context("Failed to commit message insert")?;

        let saved = Message {
            id: result.last_insert_rowid(),
            conversation_id,
            role: message.role,
            content: message.content.clone(),
            created_at: timestamp(now_ts, "message created_at")?,
        };
        log::debug!(
            "Saved {} message {} to conversation {}",
            saved.role,
            saved.id,
            conversation_id
        );
        Ok(saved)
    }

    /// Overwrites a message's content. Returns false if no such message exists.
    pub async fn update_message(&self, id: i64, content: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE messages SET content = ? WHERE id = ?")
            .bind(content)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to update message content")?;

        if result.rows_affected() == 0 {
            log::warn!("Attempted to update non-existent message: {}", id);
            return Ok(false);
        }
        log::debug!("Updated message {} ({} chars)", id, content.len());
        Ok(true)
    }

    pub async fn get_message(&self, id: i64) -> Result<Option<Message>> {
        let row = sqlx::query(
            "SELECT id, conversation_id, role, content, created_at FROM messages WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch message from database")?;

        row.as_ref().map(message_from_row).transpose()
    }

    /// Fetches all messages for a conversation, oldest first.
    pub async fn get_messages(&self, conversation_id: i64) -> Result<Vec<Message>> {
        fetch_messages(&self.pool, conversation_id).await
    }

    /// Deletes a conversation; `ON DELETE CASCADE` removes its messages.
    /// Returns false if the conversation did not exist.
    pub async fn delete_conversation(&self, id: i64) -> Result<bool> {
        log::warn!("Deleting conversation with ID: {}", id);
        let result = sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete conversation from database")?;

        if result.rows_affected() == 0 {
            log::warn!("Attempted to delete non-existent conversation: {}", id);
            return Ok(false);
        }
        Ok(true)
    }
}
