//! SQLite-backed persistence for sessions and their message transcripts.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::domain::error::BridgeError;
use crate::domain::message::{Message, Role};
use crate::domain::session::{Session, SessionStatus};

/// The session store's on-disk pool is intentionally single-connection:
/// the spec calls for one exclusive writer per session, and WAL mode lets
/// reads proceed without blocking on that writer.
const DB_POOL_MAX_CONNECTIONS: u32 = 1;

#[derive(Clone)]
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    /// Opens (creating if needed) the SQLite database at `db_path` and
    /// runs embedded migrations.
    ///
    /// # Errors
    /// Returns an error if the directory can't be created, the connection
    /// fails, or migrations fail to apply.
    pub async fn open(db_path: &Path) -> Result<Self, BridgeError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|err| BridgeError::ConfigError(format!("failed to create db directory: {err}")))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(DB_POOL_MAX_CONNECTIONS)
            .connect_with(options)
            .await
            .map_err(|err| BridgeError::ConfigError(format!("failed to open database: {err}")))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|err| BridgeError::ConfigError(format!("failed to run migrations: {err}")))?;

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self, BridgeError> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|err| BridgeError::ConfigError(format!("failed to open in-memory database: {err}")))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|err| BridgeError::ConfigError(format!("failed to run migrations: {err}")))?;

        Ok(Self { pool })
    }

    pub async fn create_session(&self, session: &Session) -> Result<(), BridgeError> {
        sqlx::query(
            "INSERT INTO sessions (id, agent_name, south_session_id, status, created_at, last_active_at, message_count) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind(&session.agent_name)
        .bind(&session.south_session_id)
        .bind(session.status.to_string())
        .bind(session.created_at)
        .bind(session.last_active_at)
        .bind(session.message_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<Session>, BridgeError> {
        let row = sqlx::query(
            "SELECT id, agent_name, south_session_id, status, created_at, last_active_at, message_count \
             FROM sessions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_session).transpose()
    }

    pub async fn list_sessions(&self, limit: i64, offset: i64) -> Result<Vec<Session>, BridgeError> {
        let rows = sqlx::query(
            "SELECT id, agent_name, south_session_id, status, created_at, last_active_at, message_count \
             FROM sessions ORDER BY last_active_at DESC LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_session).collect()
    }

    /// Updates the mutable fields of an existing session row.
    ///
    /// # Errors
    /// Returns [`BridgeError::NotFound`] if no row with this id exists.
    pub async fn update_session(&self, session: &Session) -> Result<(), BridgeError> {
        let result = sqlx::query(
            "UPDATE sessions SET south_session_id = ?, status = ?, last_active_at = ?, message_count = ? \
             WHERE id = ?",
        )
        .bind(&session.south_session_id)
        .bind(session.status.to_string())
        .bind(session.last_active_at)
        .bind(session.message_count)
        .bind(&session.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BridgeError::NotFound(format!("session `{}`", session.id)));
        }
        Ok(())
    }

    /// Deletes a session and cascades to its messages. Returns `true` if a
    /// row existed and was deleted.
    pub async fn delete_session(&self, id: &str) -> Result<bool, BridgeError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM messages WHERE session_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    /// Appends a message to a session's transcript, assigning it the next
    /// sequence number, and bumps the session's `message_count`.
    pub async fn append_message(&self, message: &Message) -> Result<i64, BridgeError> {
        let mut tx = self.pool.begin().await?;

        let next_sequence: i64 = sqlx::query(
            "SELECT COALESCE(MAX(sequence), 0) + 1 AS next FROM messages WHERE session_id = ?",
        )
        .bind(&message.session_id)
        .fetch_one(&mut *tx)
        .await?
        .get("next");

        let content_json = serde_json::to_string(&message.content)
            .map_err(|err| BridgeError::Internal(format!("failed to encode message content: {err}")))?;
        let south_blocks_json = serde_json::to_string(&message.south_blocks)
            .map_err(|err| BridgeError::Internal(format!("failed to encode south blocks: {err}")))?;

        sqlx::query(
            "INSERT INTO messages (session_id, sequence, role, content_json, south_blocks_json, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&message.session_id)
        .bind(next_sequence)
        .bind(role_to_str(message.role))
        .bind(&content_json)
        .bind(&south_blocks_json)
        .bind(message.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE sessions SET message_count = message_count + 1, last_active_at = ? WHERE id = ?")
            .bind(message.created_at)
            .bind(&message.session_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(next_sequence)
    }

    pub async fn list_messages(
        &self,
        session_id: &str,
        since_sequence: Option<i64>,
        limit: Option<i64>,
    ) -> Result<Vec<Message>, BridgeError> {
        let since = since_sequence.unwrap_or(0);
        let limit = limit.unwrap_or(i64::MAX);

        let rows = sqlx::query(
            "SELECT session_id, sequence, role, content_json, south_blocks_json, created_at \
             FROM messages WHERE session_id = ? AND sequence > ? ORDER BY sequence ASC LIMIT ?",
        )
        .bind(session_id)
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_message).collect()
    }
}

fn role_to_str(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Agent => "agent",
    }
}

fn row_to_session(row: sqlx::sqlite::SqliteRow) -> Result<Session, BridgeError> {
    let status: String = row.get("status");
    Ok(Session {
        id: row.get("id"),
        agent_name: row.get("agent_name"),
        south_session_id: row.get("south_session_id"),
        created_at: row.get("created_at"),
        last_active_at: row.get("last_active_at"),
        status: status
            .parse::<SessionStatus>()
            .map_err(BridgeError::Internal)?,
        message_count: row.get("message_count"),
    })
}

fn row_to_message(row: sqlx::sqlite::SqliteRow) -> Result<Message, BridgeError> {
    let role: String = row.get("role");
    let content_json: String = row.get("content_json");
    let south_blocks_json: String = row.get("south_blocks_json");

    Ok(Message {
        session_id: row.get("session_id"),
        sequence: row.get("sequence"),
        role: if role == "agent" { Role::Agent } else { Role::User },
        content: serde_json::from_str(&content_json)
            .map_err(|err| BridgeError::Internal(format!("corrupt message content: {err}")))?,
        created_at: row.get("created_at"),
        south_blocks: serde_json::from_str(&south_blocks_json)
            .map_err(|err| BridgeError::Internal(format!("corrupt south blocks: {err}")))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_session(id: &str) -> Session {
        Session {
            id: id.to_string(),
            agent_name: "gemini".into(),
            south_session_id: None,
            created_at: 1_000,
            last_active_at: 1_000,
            status: SessionStatus::Active,
            message_count: 0,
        }
    }

    fn sample_message(session_id: &str, role: Role, text: &str) -> Message {
        Message {
            session_id: session_id.to_string(),
            sequence: 0,
            role,
            content: vec![crate::domain::message::ContentBlock::Text { text: text.into() }],
            created_at: 1_000,
            south_blocks: vec![],
        }
    }

    #[tokio::test]
    async fn create_get_delete_get_round_trips_to_none() {
        // Arrange
        let store = SessionStore::open_in_memory().await.unwrap();
        let session = sample_session("sess-1");

        // Act
        store.create_session(&session).await.unwrap();
        let fetched = store.get_session("sess-1").await.unwrap();
        let deleted = store.delete_session("sess-1").await.unwrap();
        let after_delete = store.get_session("sess-1").await.unwrap();

        // Assert
        assert!(fetched.is_some());
        assert!(deleted);
        assert!(after_delete.is_none());
    }

    #[tokio::test]
    async fn delete_nonexistent_session_returns_false() {
        let store = SessionStore::open_in_memory().await.unwrap();

        let deleted = store.delete_session("does-not-exist").await.unwrap();

        assert!(!deleted);
    }

    #[tokio::test]
    async fn append_message_assigns_increasing_sequence_numbers() {
        // Arrange
        let store = SessionStore::open_in_memory().await.unwrap();
        let session = sample_session("sess-2");
        store.create_session(&session).await.unwrap();

        // Act
        let first = store
            .append_message(&sample_message("sess-2", Role::User, "hi"))
            .await
            .unwrap();
        let second = store
            .append_message(&sample_message("sess-2", Role::Agent, "hello"))
            .await
            .unwrap();

        // Assert
        assert_eq!(first, 1);
        assert_eq!(second, 2);

        let messages = store.list_messages("sess-2", None, None).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].sequence, 1);
        assert_eq!(messages[1].sequence, 2);

        let refreshed = store.get_session("sess-2").await.unwrap().unwrap();
        assert_eq!(refreshed.message_count, 2);
    }

    #[tokio::test]
    async fn deleting_a_session_cascades_its_messages() {
        // Arrange
        let store = SessionStore::open_in_memory().await.unwrap();
        let session = sample_session("sess-3");
        store.create_session(&session).await.unwrap();
        store
            .append_message(&sample_message("sess-3", Role::User, "hi"))
            .await
            .unwrap();

        // Act
        store.delete_session("sess-3").await.unwrap();
        let messages = store.list_messages("sess-3", None, None).await.unwrap();

        // Assert
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn list_messages_respects_since_sequence() {
        // Arrange
        let store = SessionStore::open_in_memory().await.unwrap();
        let session = sample_session("sess-4");
        store.create_session(&session).await.unwrap();
        store
            .append_message(&sample_message("sess-4", Role::User, "one"))
            .await
            .unwrap();
        store
            .append_message(&sample_message("sess-4", Role::Agent, "two"))
            .await
            .unwrap();

        // Act
        let messages = store.list_messages("sess-4", Some(1), None).await.unwrap();

        // Assert
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].sequence, 2);
    }
}
