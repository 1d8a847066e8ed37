use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Named state modules of one session (`memory`, app-defined keys, ...).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionState(Map<String, Value>);

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, module: &str) -> Option<&Value> {
        self.0.get(module)
    }

    pub fn get_mut(&mut self, module: &str) -> Option<&mut Value> {
        self.0.get_mut(module)
    }

    pub fn insert(&mut self, module: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(module.into(), value)
    }

    pub fn remove(&mut self, module: &str) -> Option<Value> {
        self.0.remove(module)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn modules(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for SessionState {
    fn from(value: Map<String, Value>) -> Self {
        Self(value)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub state: SessionState,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(session_id: impl Into<String>, state: SessionState) -> Self {
        Self { session_id: session_id.into(), state, updated_at: Utc::now() }
    }
}
