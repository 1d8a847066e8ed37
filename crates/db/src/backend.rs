use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use agenthost_core::errors::ErrorCode;
use agenthost_core::session::SessionRecord;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session `{0}` was not found")]
    NotFound(String),
    #[error("session `{0}` is busy with another request")]
    SessionBusy(String),
    #[error("session storage I/O failed at `{path}`: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("could not encode session `{session_id}`: {source}")]
    Encode { session_id: String, source: serde_json::Error },
    #[error("decode error: {0}")]
    Decode(String),
    #[error("session id is not usable by the `{backend}` backend: {reason}")]
    InvalidSessionId { backend: &'static str, reason: String },
}

impl StoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::SessionBusy(_) => ErrorCode::SessionBusy,
            Self::InvalidSessionId { .. } => ErrorCode::InvalidRequest,
            Self::Io { .. }
            | Self::Database(_)
            | Self::Migration(_)
            | Self::Encode { .. }
            | Self::Decode(_) => ErrorCode::StoreError,
        }
    }
}

/// Durable storage for session records, one record per session id.
///
/// Backends do no locking of their own; [`crate::SessionStore`] serializes
/// access per session id.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn load(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError>;

    async fn save(&self, record: &SessionRecord) -> Result<(), StoreError>;

    async fn exists(&self, session_id: &str) -> Result<bool, StoreError>;

    /// Returns whether a record was removed.
    async fn delete(&self, session_id: &str) -> Result<bool, StoreError>;

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
