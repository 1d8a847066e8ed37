//! Per-session access control on top of a [`SessionBackend`].
//!
//! Every load/save pair for a session id runs under a [`SessionLease`]. The
//! store keeps one async mutex per session id that is currently leased or
//! awaited; entries are dropped as soon as nobody references them, so the
//! table only grows with in-flight sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use agenthost_core::config::{SessionBackendKind, SessionConcurrency, SessionConfig};
use agenthost_core::session::{SessionRecord, SessionState};

use crate::backend::{SessionBackend, StoreError};
use crate::file::JsonFileBackend;
use crate::memory::InMemorySessionBackend;
use crate::sqlite::SqliteSessionBackend;

type LockTable = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// Opens the backend selected by `session.backend`.
pub async fn open_backend(config: &SessionConfig) -> Result<Arc<dyn SessionBackend>, StoreError> {
    Ok(match config.backend {
        SessionBackendKind::Json => Arc::new(JsonFileBackend::open(&config.save_dir).await?),
        SessionBackendKind::Sqlite => {
            Arc::new(SqliteSessionBackend::open(&config.url, config.max_connections).await?)
        }
        SessionBackendKind::Memory => Arc::new(InMemorySessionBackend::new()),
    })
}

#[derive(Clone)]
pub struct SessionStore {
    backend: Arc<dyn SessionBackend>,
    policy: SessionConcurrency,
    locks: LockTable,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn SessionBackend>, policy: SessionConcurrency) -> Self {
        Self { backend, policy, locks: Arc::default() }
    }

    pub async fn open(config: &SessionConfig) -> Result<Self, StoreError> {
        Ok(Self::new(open_backend(config).await?, config.concurrency))
    }

    pub fn backend(&self) -> &Arc<dyn SessionBackend> {
        &self.backend
    }

    pub fn policy(&self) -> SessionConcurrency {
        self.policy
    }

    /// Takes exclusive access to `session_id` until the lease is dropped.
    pub async fn acquire(&self, session_id: &str) -> Result<SessionLease, StoreError> {
        let gate = GateRef::checkout(&self.locks, session_id);
        let mutex = gate.mutex();

        let guard = match self.policy {
            SessionConcurrency::Queue => mutex.lock_owned().await,
            SessionConcurrency::Reject => mutex
                .try_lock_owned()
                .map_err(|_| StoreError::SessionBusy(session_id.to_string()))?,
        };

        Ok(SessionLease {
            session_id: session_id.to_string(),
            backend: Arc::clone(&self.backend),
            _guard: guard,
            _gate: gate,
        })
    }

    pub async fn load(
        &self,
        session_id: &str,
        allow_missing: bool,
    ) -> Result<Option<SessionRecord>, StoreError> {
        self.acquire(session_id).await?.load(allow_missing).await
    }

    pub async fn save(
        &self,
        session_id: &str,
        state: &SessionState,
    ) -> Result<SessionRecord, StoreError> {
        self.acquire(session_id).await?.save(state).await
    }

    pub async fn exists(&self, session_id: &str) -> Result<bool, StoreError> {
        self.backend.exists(session_id).await
    }

    pub async fn delete(&self, session_id: &str) -> Result<bool, StoreError> {
        self.acquire(session_id).await?.delete().await
    }

    pub async fn close(&self) -> Result<(), StoreError> {
        self.backend.close().await
    }

    /// Number of session ids currently leased or awaited.
    pub fn tracked_sessions(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Exclusive access to one session's persisted record.
///
/// Fields drop in declaration order: the guard releases the session before
/// the gate reference prunes the lock table.
pub struct SessionLease {
    session_id: String,
    backend: Arc<dyn SessionBackend>,
    _guard: OwnedMutexGuard<()>,
    _gate: GateRef,
}

impl SessionLease {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Fails with [`StoreError::NotFound`] when the record is missing and `allow_missing` is false.
    pub async fn load(&self, allow_missing: bool) -> Result<Option<SessionRecord>, StoreError> {
        match self.backend.load(&self.session_id).await? {
            None if !allow_missing => Err(StoreError::NotFound(self.session_id.clone())),
            record => Ok(record),
        }
    }

    pub async fn save(&self, state: &SessionState) -> Result<SessionRecord, StoreError> {
        let record = SessionRecord::new(self.session_id.clone(), state.clone());
        self.backend.save(&record).await?;
        Ok(record)
    }

    pub async fn delete(&self) -> Result<bool, StoreError> {
        self.backend.delete(&self.session_id).await
    }
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease").field("session_id", &self.session_id).finish()
    }
}

/// A counted reference to a lock table entry. Dropping the last one removes the entry.
struct GateRef {
    table: LockTable,
    session_id: String,
    mutex: Option<Arc<AsyncMutex<()>>>,
}

impl GateRef {
    fn checkout(table: &LockTable, session_id: &str) -> Self {
        let mutex = {
            let mut locks = table.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(session_id.to_string()).or_default())
        };
        Self { table: Arc::clone(table), session_id: session_id.to_string(), mutex: Some(mutex) }
    }

    fn mutex(&self) -> Arc<AsyncMutex<()>> {
        self.mutex.clone().unwrap_or_default()
    }
}

impl Drop for GateRef {
    fn drop(&mut self) {
        drop(self.mutex.take());

        let mut locks = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(&self.session_id).is_some_and(|entry| Arc::strong_count(entry) == 1) {
            locks.remove(&self.session_id);
        }
    }
}
