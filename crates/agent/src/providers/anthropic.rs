use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Map, Value};

use agenthost_core::config::ModelConfig;
use agenthost_core::message::Msg;

use super::{chat_messages, http_client, is_system, status_error};
use crate::llm::{ChunkStream, ModelChunk, ModelClient, ProviderError};
use crate::sse::{parse_sse_stream, SseStream};

const PROVIDER: &str = "anthropic";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u64 = 1024;

/// Client for the `POST {base}/v1/messages` API.
pub struct AnthropicClient {
    model: String,
    endpoint: String,
    api_key: Option<SecretString>,
    stream: bool,
    generate_params: Map<String, Value>,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    delta: Option<StreamDelta>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    stop_reason: Option<String>,
}

impl AnthropicClient {
    pub fn from_config(config: &ModelConfig) -> Result<Self, ProviderError> {
        let base_url = config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL).trim_end_matches('/');

        Ok(Self {
            model: config.model.clone(),
            endpoint: format!("{base_url}/v1/messages"),
            api_key: config.api_key.clone(),
            stream: config.stream,
            generate_params: config.generate_params.clone(),
            http: http_client(PROVIDER, config.timeout_secs)?,
        })
    }

    fn request_body(&self, messages: &[Msg]) -> Value {
        let system: Vec<String> =
            messages.iter().filter(|msg| is_system(msg)).map(Msg::text).collect();

        let mut body = self.generate_params.clone();
        body.entry("max_tokens").or_insert(Value::from(DEFAULT_MAX_TOKENS));
        body.insert("model".to_string(), Value::String(self.model.clone()));
        body.insert(
            "messages".to_string(),
            Value::Array(chat_messages(messages.iter().filter(|msg| !is_system(msg)))),
        );
        body.insert("stream".to_string(), Value::Bool(self.stream));
        if !system.is_empty() {
            body.insert("system".to_string(), Value::String(system.join("\n\n")));
        }
        Value::Object(body)
    }

    fn decode_events(mut events: SseStream) -> ChunkStream {
        async_stream::stream! {
            while let Some(event) = events.next().await {
                let event = match event {
                    Ok(event) => event,
                    Err(error) => {
                        yield Err(ProviderError::Stream { provider: PROVIDER.to_string(), details: error.to_string() });
                        break;
                    }
                };

                let decoded: StreamEvent = match serde_json::from_str(&event.data) {
                    Ok(decoded) => decoded,
                    Err(error) => {
                        yield Err(ProviderError::Decode { provider: PROVIDER.to_string(), details: error.to_string() });
                        break;
                    }
                };

                match decoded.kind.as_str() {
                    "content_block_delta" => {
                        let text = decoded
                            .delta
                            .filter(|delta| delta.kind.as_deref() == Some("text_delta"))
                            .and_then(|delta| delta.text)
                            .unwrap_or_default();
                        if !text.is_empty() {
                            yield Ok(ModelChunk { delta: text, finish_reason: None });
                        }
                    }
                    "message_delta" => {
                        if let Some(reason) = decoded.delta.and_then(|delta| delta.stop_reason) {
                            yield Ok(ModelChunk { delta: String::new(), finish_reason: Some(reason) });
                        }
                    }
                    "message_stop" => break,
                    "error" => {
                        let details = decoded.error.map(|error| error.to_string()).unwrap_or_default();
                        yield Err(ProviderError::Stream { provider: PROVIDER.to_string(), details });
                        break;
                    }
                    _ => {}
                }
            }
        }
        .boxed()
    }
}

#[async_trait]
impl ModelClient for AnthropicClient {
    fn provider(&self) -> &str {
        PROVIDER
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn stream(&self, messages: &[Msg]) -> Result<ChunkStream, ProviderError> {
        let mut request = self
            .http
            .post(&self.endpoint)
            .header("anthropic-version", API_VERSION)
            .json(&self.request_body(messages));
        if let Some(api_key) = &self.api_key {
            request = request.header("x-api-key", api_key.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|source| ProviderError::Http { provider: PROVIDER.to_string(), source })?;
        if !response.status().is_success() {
            return Err(status_error(PROVIDER, response).await);
        }

        if self.stream {
            return Ok(Self::decode_events(parse_sse_stream(response.bytes_stream())));
        }

        let reply: MessagesResponse = response.json().await.map_err(|source| {
            ProviderError::Decode { provider: PROVIDER.to_string(), details: source.to_string() }
        })?;
        let text: String = reply
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect();

        Ok(stream::iter([Ok(ModelChunk { delta: text, finish_reason: reply.stop_reason })]).boxed())
    }
}
