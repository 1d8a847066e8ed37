use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

/// A single conversational message exchanged with the hosted application.
///
/// `content` is either a plain string or a list of content blocks
/// (`{"type": "text", "text": ...}` and friends).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Msg {
    #[serde(default = "generate_id")]
    pub id: String,
    pub name: String,
    pub role: Role,
    #[serde(default = "empty_content")]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

fn generate_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn empty_content() -> Value {
    Value::String(String::new())
}

impl Msg {
    pub fn new(name: impl Into<String>, role: Role, content: impl Into<Value>) -> Self {
        Self { id: generate_id(), name: name.into(), role, content: content.into(), metadata: None }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", Role::User, content.into())
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", Role::Assistant, content.into())
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.get_or_insert_with(Map::new).insert(key.into(), value);
        self
    }

    /// Terminal frame emitted after every invoke stream.
    pub fn done_marker() -> Value {
        json!({
            "name": "assistant",
            "role": "assistant",
            "content": "",
            "metadata": { "done": true },
        })
    }

    /// Concatenated text of the message; non-text blocks are skipped.
    pub fn text(&self) -> String {
        match &self.content {
            Value::String(text) => text.clone(),
            Value::Array(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    Value::String(text) => Some(text.as_str()),
                    Value::Object(fields) => {
                        let is_text = fields.get("type").and_then(Value::as_str) == Some("text");
                        is_text.then(|| fields.get("text").and_then(Value::as_str)).flatten()
                    }
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}
