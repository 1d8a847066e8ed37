pub mod anthropic;
pub mod openai;

use std::time::Duration;

use serde_json::{json, Value};

use agenthost_core::message::{Msg, Role};

use crate::llm::ProviderError;

pub(crate) fn http_client(provider: &str, timeout_secs: u64) -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .build()
        .map_err(|source| ProviderError::Http { provider: provider.to_string(), source })
}

/// `{"role", "content"}` pairs with flattened text content.
pub(crate) fn chat_messages<'a>(messages: impl IntoIterator<Item = &'a Msg>) -> Vec<Value> {
    messages
        .into_iter()
        .map(|msg| json!({ "role": msg.role.as_str(), "content": msg.text() }))
        .collect()
}

pub(crate) fn is_system(msg: &Msg) -> bool {
    msg.role == Role::System
}

pub(crate) async fn status_error(provider: &str, response: reqwest::Response) -> ProviderError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    ProviderError::Status { provider: provider.to_string(), status, body }
}
