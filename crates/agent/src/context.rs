use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::{Mutex, MutexGuard};

use agenthost_core::config::RuntimeConfig;
use agenthost_core::registry::RegistryError;
use agenthost_core::session::{SessionRecord, SessionState};
use agenthost_db::{SessionLease, SessionStore, StoreError};

use crate::llm::{ModelClient, ModelRegistry};
use crate::tools::ToolSet;

/// Everything the runtime opened during initialization.
#[derive(Clone)]
pub struct Resources {
    pub config: Arc<RuntimeConfig>,
    pub models: Arc<ModelRegistry>,
    pub tools: Arc<ToolSet>,
    pub sessions: SessionStore,
}

impl Resources {
    pub fn model(&self, name: &str) -> Result<&Arc<dyn ModelClient>, RegistryError> {
        self.models.get(name)
    }
}

/// Per-request view handed to the hosted app.
#[derive(Clone)]
pub struct RequestContext {
    session_id: String,
    metadata: Map<String, Value>,
    state: Arc<Mutex<SessionState>>,
    resources: Resources,
    lease: Arc<SessionLease>,
}

impl RequestContext {
    pub(crate) fn new(
        metadata: Map<String, Value>,
        state: Arc<Mutex<SessionState>>,
        resources: Resources,
        lease: Arc<SessionLease>,
    ) -> Self {
        Self { session_id: lease.session_id().to_string(), metadata, state, resources, lease }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    /// Working copy of the session state, saved when the turn completes.
    pub async fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().await
    }

    pub fn resources(&self) -> &Resources {
        &self.resources
    }

    /// Persists the current working state before the turn ends.
    pub async fn checkpoint(&self) -> Result<SessionRecord, StoreError> {
        let snapshot = self.state.lock().await.clone();
        self.lease.save(&snapshot).await
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("session_id", &self.session_id)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}
