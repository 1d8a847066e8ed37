use std::collections::HashMap;

use tokio::sync::RwLock;

use agenthost_core::session::SessionRecord;

use crate::backend::{SessionBackend, StoreError};

#[derive(Default)]
pub struct InMemorySessionBackend {
    records: RwLock<HashMap<String, SessionRecord>>,
}

impl InMemorySessionBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait::async_trait]
impl SessionBackend for InMemorySessionBackend {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn load(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let records = self.records.read().await;
        Ok(records.get(session_id).cloned())
    }

    async fn save(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        records.insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    async fn exists(&self, session_id: &str) -> Result<bool, StoreError> {
        Ok(self.records.read().await.contains_key(session_id))
    }

    async fn delete(&self, session_id: &str) -> Result<bool, StoreError> {
        Ok(self.records.write().await.remove(session_id).is_some())
    }
}
