use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use agenthost_core::config::ModelConfig;
use agenthost_core::message::Msg;

use super::{chat_messages, http_client, status_error};
use crate::llm::{ChunkStream, ModelChunk, ModelClient, ProviderError};
use crate::sse::{parse_sse_stream, SseStream};

/// Client for any `POST {base}/chat/completions` endpoint.
pub struct OpenAiCompatibleClient {
    provider: String,
    model: String,
    endpoint: String,
    api_key: Option<SecretString>,
    stream: bool,
    generate_params: Map<String, Value>,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    message: Option<ChoiceContent>,
    #[serde(default)]
    delta: Option<ChoiceContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChoiceContent {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiCompatibleClient {
    pub fn from_config(
        provider: &str,
        default_base_url: &str,
        config: &ModelConfig,
    ) -> Result<Self, ProviderError> {
        let base_url = config.base_url.as_deref().unwrap_or(default_base_url).trim_end_matches('/');

        Ok(Self {
            provider: provider.to_string(),
            model: config.model.clone(),
            endpoint: format!("{base_url}/chat/completions"),
            api_key: config.api_key.clone(),
            stream: config.stream,
            generate_params: config.generate_params.clone(),
            http: http_client(provider, config.timeout_secs)?,
        })
    }

    fn request_body(&self, messages: &[Msg]) -> Value {
        let mut body = self.generate_params.clone();
        body.insert("model".to_string(), Value::String(self.model.clone()));
        body.insert("messages".to_string(), Value::Array(chat_messages(messages)));
        body.insert("stream".to_string(), Value::Bool(self.stream));
        Value::Object(body)
    }

    fn decode_events(provider: String, mut events: SseStream) -> ChunkStream {
        async_stream::stream! {
            while let Some(event) = events.next().await {
                let event = match event {
                    Ok(event) => event,
                    Err(error) => {
                        yield Err(ProviderError::Stream { provider: provider.clone(), details: error.to_string() });
                        break;
                    }
                };

                if event.data.trim() == "[DONE]" {
                    break;
                }

                let chunk: CompletionResponse = match serde_json::from_str(&event.data) {
                    Ok(chunk) => chunk,
                    Err(error) => {
                        debug!(provider = %provider, data = %event.data, "undecodable stream chunk");
                        yield Err(ProviderError::Decode { provider: provider.clone(), details: error.to_string() });
                        break;
                    }
                };

                let Some(choice) = chunk.choices.into_iter().next() else {
                    continue;
                };
                let delta = choice.delta.and_then(|delta| delta.content).unwrap_or_default();
                if !delta.is_empty() || choice.finish_reason.is_some() {
                    yield Ok(ModelChunk { delta, finish_reason: choice.finish_reason });
                }
            }
        }
        .boxed()
    }
}

#[async_trait]
impl ModelClient for OpenAiCompatibleClient {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn stream(&self, messages: &[Msg]) -> Result<ChunkStream, ProviderError> {
        let mut request = self.http.post(&self.endpoint).json(&self.request_body(messages));
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key.expose_secret());
        }

        let response = request.send().await.map_err(|source| ProviderError::Http {
            provider: self.provider.clone(),
            source,
        })?;
        if !response.status().is_success() {
            return Err(status_error(&self.provider, response).await);
        }

        if self.stream {
            let events = parse_sse_stream(response.bytes_stream());
            return Ok(Self::decode_events(self.provider.clone(), events));
        }

        let completion: CompletionResponse = response.json().await.map_err(|source| {
            ProviderError::Decode { provider: self.provider.clone(), details: source.to_string() }
        })?;
        let choice = completion.choices.into_iter().next().ok_or_else(|| ProviderError::Decode {
            provider: self.provider.clone(),
            details: "response has no choices".to_string(),
        })?;

        let chunk = ModelChunk {
            delta: choice.message.and_then(|message| message.content).unwrap_or_default(),
            finish_reason: choice.finish_reason,
        };
        Ok(stream::iter([Ok(chunk)]).boxed())
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use secrecy::SecretString;
    use serde_json::{json, Map};
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use agenthost_core::config::ModelConfig;
    use agenthost_core::message::Msg;

    use super::OpenAiCompatibleClient;
    use crate::llm::{ModelClient, ProviderError};

    fn config(base_url: &str, stream: bool) -> ModelConfig {
        let mut generate_params = Map::new();
        generate_params.insert("temperature".to_string(), json!(0.2));
        ModelConfig {
            name: "main".to_string(),
            provider: "openai".to_string(),
            model: "gpt-test".to_string(),
            api_key: Some(SecretString::from("sk-test")),
            base_url: Some(base_url.to_string()),
            stream,
            timeout_secs: 5,
            generate_params,
        }
    }

    #[tokio::test]
    async fn streaming_response_yields_deltas_until_done() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({ "model": "gpt-test", "stream": true, "temperature": 0.2 })))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let client =
            OpenAiCompatibleClient::from_config("openai", "unused", &config(&format!("{}/v1", server.uri()), true))
                .expect("client");
        let chunks: Vec<_> = client.stream(&[Msg::user("hi")]).await.expect("stream").collect().await;

        let deltas: Vec<String> =
            chunks.into_iter().map(|chunk| chunk.expect("chunk").delta).collect();
        assert_eq!(deltas, vec!["Hel".to_string(), "lo".to_string()]);
    }

    #[tokio::test]
    async fn non_streaming_response_is_a_single_chunk() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(json!({ "stream": false })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "role": "assistant", "content": "whole answer" }, "finish_reason": "stop" }]
            })))
            .mount(&server)
            .await;

        let client = OpenAiCompatibleClient::from_config("ollama", "unused", &config(&server.uri(), false))
            .expect("client");
        let text = client.complete(&[Msg::user("hi")]).await.expect("complete");

        assert_eq!(text, "whole answer");
    }

    #[tokio::test]
    async fn http_errors_carry_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;

        let client = OpenAiCompatibleClient::from_config("openai", "unused", &config(&server.uri(), true))
            .expect("client");
        let error = client.stream(&[Msg::user("hi")]).await.err().expect("must fail");

        assert!(matches!(
            error,
            ProviderError::Status { status: 401, ref body, .. } if body == "bad key"
        ));
    }
}
