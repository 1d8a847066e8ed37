use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use agenthost_core::session::{SessionRecord, SessionState};

use crate::backend::{SessionBackend, StoreError};
use crate::migrations;

pub type DbPool = sqlx::SqlitePool;

/// Opens a pool against `database_url`, creating the database file when missing.
///
/// In-memory databases are private to a connection, so they are pinned to a
/// single long-lived connection.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<DbPool, sqlx::Error> {
    let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
    let url = if database_url == ":memory:" { "sqlite::memory:" } else { database_url };
    let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);

    let mut pool = SqlitePoolOptions::new().acquire_timeout(Duration::from_secs(30));
    pool = if in_memory {
        pool.max_connections(1).min_connections(1).idle_timeout(None).max_lifetime(None)
    } else {
        pool.max_connections(max_connections.max(1))
    };

    pool.after_connect(|conn, _meta| {
        Box::pin(async move {
            sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
            sqlx::query("PRAGMA busy_timeout = 5000").execute(&mut *conn).await?;
            Ok(())
        })
    })
    .connect_with(options)
    .await
}

pub struct SqliteSessionBackend {
    pool: DbPool,
}

impl SqliteSessionBackend {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Connects and applies pending migrations.
    pub async fn open(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = connect(database_url, max_connections).await?;
        migrations::run_pending(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl SessionBackend for SqliteSessionBackend {
    fn kind(&self) -> &'static str {
        "sqlite"
    }

    async fn load(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT session_id, state_json, updated_at
             FROM session_record
             WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(record_from_row).transpose()
    }

    async fn save(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let state_json = serde_json::to_string(&record.state).map_err(|source| {
            StoreError::Encode { session_id: record.session_id.clone(), source }
        })?;

        sqlx::query(
            "INSERT INTO session_record (session_id, state_json, updated_at)
             VALUES (?, ?, ?)
             ON CONFLICT(session_id) DO UPDATE SET
                state_json = excluded.state_json,
                updated_at = excluded.updated_at",
        )
        .bind(&record.session_id)
        .bind(state_json)
        .bind(record.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn exists(&self, session_id: &str) -> Result<bool, StoreError> {
        let count: i64 =
            sqlx::query("SELECT COUNT(*) AS count FROM session_record WHERE session_id = ?")
                .bind(session_id)
                .fetch_one(&self.pool)
                .await?
                .try_get("count")?;
        Ok(count > 0)
    }

    async fn delete(&self, session_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM session_record WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.pool.close().await;
        Ok(())
    }
}

fn record_from_row(row: SqliteRow) -> Result<SessionRecord, StoreError> {
    let session_id: String = row.try_get("session_id")?;
    let state_json: String = row.try_get("state_json")?;
    let updated_at: String = row.try_get("updated_at")?;

    let state: SessionState = serde_json::from_str(&state_json).map_err(|error| {
        StoreError::Decode(format!("invalid state_json for session `{session_id}`: {error}"))
    })?;

    Ok(SessionRecord { updated_at: parse_timestamp("updated_at", updated_at)?, session_id, state })
}

fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| StoreError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})")),
    )
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use agenthost_core::session::{SessionRecord, SessionState};

    use super::SqliteSessionBackend;
    use crate::backend::{SessionBackend, StoreError};

    #[tokio::test]
    async fn upsert_load_and_delete_round_trip() {
        let backend = SqliteSessionBackend::open("sqlite::memory:", 1).await.expect("open");

        let mut state = SessionState::new();
        state.insert("memory", json!([{ "role": "user", "content": "hi" }]));
        let first = SessionRecord::new("s1", state.clone());
        backend.save(&first).await.expect("save");

        state.insert("memory", json!([]));
        let second = SessionRecord::new("s1", state);
        backend.save(&second).await.expect("upsert");

        let loaded = backend.load("s1").await.expect("load").expect("record");
        assert_eq!(loaded.state, second.state);
        assert_eq!(loaded.updated_at, second.updated_at);
        assert!(backend.exists("s1").await.expect("exists"));

        assert!(backend.delete("s1").await.expect("delete"));
        assert!(backend.load("s1").await.expect("load").is_none());
    }

    #[tokio::test]
    async fn file_database_is_created_and_survives_reopen() {
        let dir = TempDir::new().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("sessions.db").display());

        let backend = SqliteSessionBackend::open(&url, 2).await.expect("open");
        backend.save(&SessionRecord::new("s1", SessionState::new())).await.expect("save");
        backend.close().await.expect("close");

        let reopened = SqliteSessionBackend::open(&url, 2).await.expect("reopen");
        assert!(reopened.exists("s1").await.expect("exists"));
    }

    #[tokio::test]
    async fn malformed_state_is_a_decode_error() {
        let backend = SqliteSessionBackend::open("sqlite::memory:", 1).await.expect("open");
        sqlx::query(
            "INSERT INTO session_record (session_id, state_json, updated_at) VALUES ('bad', '[1,2]', '2026-01-01T00:00:00Z')",
        )
        .execute(backend.pool())
        .await
        .expect("insert raw row");

        let error = backend.load("bad").await.expect_err("must fail");
        assert!(matches!(error, StoreError::Decode(_)));
    }
}
