use std::path::Path;

use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use tracing::info;

use super::error::RepositoryResult;
use super::local_store::{BoxFuture, LocalStore};
use crate::models::{Conversation, Message};

/// Migrations applied in order. Each entry is (version, sql).
/// To add a new migration: append a tuple with the next version number and its SQL.
/// Never edit or remove existing entries. Existing databases depend on them.
const MIGRATIONS: &[(i64, &str)] = &[(
    1,
    "CREATE TABLE IF NOT EXISTS conversations (
        id              TEXT    PRIMARY KEY,
        data            TEXT    NOT NULL,
        last_message_at INTEGER,
        updated_at      INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE IF NOT EXISTS messages (
        id              TEXT    PRIMARY KEY,
        conversation_id TEXT    NOT NULL,
        created_at      INTEGER NOT NULL,
        data            TEXT    NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_messages_conversation
        ON messages (conversation_id, created_at);
    CREATE INDEX IF NOT EXISTS idx_conversations_last_message_at
        ON conversations (last_message_at DESC);",
)];

const UPSERT_MESSAGE: &str = "INSERT INTO messages (id, conversation_id, created_at, data)
     VALUES (?, ?, ?, ?)
     ON CONFLICT(id) DO UPDATE SET
         conversation_id = excluded.conversation_id,
         created_at = excluded.created_at,
         data = excluded.data";

/// SQLite-backed local store.
///
/// Records are stored as JSON alongside the columns used for ordering. Message
/// ties on `created_at` fall back to `rowid`, which an upsert preserves, so the
/// first insertion order wins.
#[derive(Clone)]
pub struct SqliteLocalStore {
    pool: SqlitePool,
}

impl SqliteLocalStore {
    /// Open (or create) the database at `path`.
    pub async fn open(path: &Path) -> RepositoryResult<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::run_migrations(&pool).await?;

        info!(path = %path.display(), "Opened SQLite local store");

        Ok(Self { pool })
    }

    /// Create the schema_version table if absent, then apply any pending migrations.
    async fn run_migrations(pool: &SqlitePool) -> RepositoryResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER NOT NULL
            )",
        )
        .execute(pool)
        .await?;

        // Seed version 0 if the table is empty (fresh database).
        sqlx::query("INSERT INTO schema_version (version) SELECT 0 WHERE NOT EXISTS (SELECT 1 FROM schema_version)")
            .execute(pool)
            .await?;

        let current: i64 = sqlx::query_scalar("SELECT version FROM schema_version")
            .fetch_one(pool)
            .await?;

        for (version, sql) in MIGRATIONS {
            if *version > current {
                info!(version, "Applying schema migration");
                // sqlx doesn't support multiple statements in a single query call,
                // so split on ';' and execute each statement individually.
                for statement in sql.split(';') {
                    let trimmed = statement.trim();
                    if !trimmed.is_empty() {
                        sqlx::query(trimmed).execute(pool).await?;
                    }
                }
                sqlx::query("UPDATE schema_version SET version = ?")
                    .bind(version)
                    .execute(pool)
                    .await?;
            }
        }

        Ok(())
    }

    fn conversation_from_row(row: &SqliteRow) -> RepositoryResult<Conversation> {
        let data: String = row.try_get("data")?;
        Ok(serde_json::from_str(&data)?)
    }

    fn message_from_row(row: &SqliteRow) -> RepositoryResult<Message> {
        let data: String = row.try_get("data")?;
        Ok(serde_json::from_str(&data)?)
    }
}

impl LocalStore for SqliteLocalStore {
    fn list_conversations(&self) -> BoxFuture<'static, RepositoryResult<Vec<Conversation>>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let rows = sqlx::query(
                "SELECT data FROM conversations
                 ORDER BY last_message_at IS NULL, last_message_at DESC",
            )
            .fetch_all(&pool)
            .await?;

            rows.iter().map(Self::conversation_from_row).collect()
        })
    }

    fn get_conversation(
        &self,
        id: &str,
    ) -> BoxFuture<'static, RepositoryResult<Option<Conversation>>> {
        let pool = self.pool.clone();
        let id = id.to_string();
        Box::pin(async move {
            let row = sqlx::query("SELECT data FROM conversations WHERE id = ?")
                .bind(&id)
                .fetch_optional(&pool)
                .await?;

            row.as_ref().map(Self::conversation_from_row).transpose()
        })
    }

    fn put_conversation(
        &self,
        conversation: Conversation,
    ) -> BoxFuture<'static, RepositoryResult<()>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let data = serde_json::to_string(&conversation)?;
            sqlx::query(
                "INSERT INTO conversations (id, data, last_message_at, updated_at)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET
                     data = excluded.data,
                     last_message_at = excluded.last_message_at,
                     updated_at = excluded.updated_at",
            )
            .bind(&conversation.id)
            .bind(&data)
            .bind(conversation.last_message_at.map(|t| t.timestamp_micros()))
            .bind(conversation.updated_at.timestamp_micros())
            .execute(&pool)
            .await?;
            Ok(())
        })
    }

    fn delete_conversation(&self, id: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        let pool = self.pool.clone();
        let id = id.to_string();
        Box::pin(async move {
            let mut tx = pool.begin().await?;
            sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
                .bind(&id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM conversations WHERE id = ?")
                .bind(&id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(())
        })
    }

    fn list_messages(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'static, RepositoryResult<Vec<Message>>> {
        let pool = self.pool.clone();
        let conversation_id = conversation_id.to_string();
        Box::pin(async move {
            let rows = sqlx::query(
                "SELECT data FROM messages
                 WHERE conversation_id = ?
                 ORDER BY created_at ASC, rowid ASC",
            )
            .bind(&conversation_id)
            .fetch_all(&pool)
            .await?;

            rows.iter().map(Self::message_from_row).collect()
        })
    }

    fn get_message(&self, id: &str) -> BoxFuture<'static, RepositoryResult<Option<Message>>> {
        let pool = self.pool.clone();
        let id = id.to_string();
        Box::pin(async move {
            let row = sqlx::query("SELECT data FROM messages WHERE id = ?")
                .bind(&id)
                .fetch_optional(&pool)
                .await?;

            row.as_ref().map(Self::message_from_row).transpose()
        })
    }

    fn put_message(&self, message: Message) -> BoxFuture<'static, RepositoryResult<()>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let data = serde_json::to_string(&message)?;
            sqlx::query(UPSERT_MESSAGE)
                .bind(&message.id)
                .bind(&message.conversation_id)
                .bind(message.created_at.timestamp_micros())
                .bind(&data)
                .execute(&pool)
                .await?;
            Ok(())
        })
    }

    fn delete_message(&self, id: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        let pool = self.pool.clone();
        let id = id.to_string();
        Box::pin(async move {
            sqlx::query("DELETE FROM messages WHERE id = ?")
                .bind(&id)
                .execute(&pool)
                .await?;
            Ok(())
        })
    }

    fn replace_messages(
        &self,
        conversation_id: &str,
        messages: Vec<Message>,
    ) -> BoxFuture<'static, RepositoryResult<()>> {
        let pool = self.pool.clone();
        let conversation_id = conversation_id.to_string();
        Box::pin(async move {
            let mut tx = pool.begin().await?;
            sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
                .bind(&conversation_id)
                .execute(&mut *tx)
                .await?;
            for message in &messages {
                let data = serde_json::to_string(message)?;
                sqlx::query(UPSERT_MESSAGE)
                    .bind(&message.id)
                    .bind(&message.conversation_id)
                    .bind(message.created_at.timestamp_micros())
                    .bind(&data)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
            Ok(())
        })
    }
}
