use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use thiserror::Error;

use agenthost_core::config::ModelConfig;
use agenthost_core::message::Msg;
use agenthost_core::registry::{Registry, RegistryError};

use crate::providers::{anthropic::AnthropicClient, openai::OpenAiCompatibleClient};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider} request failed: {source}")]
    Http { provider: String, source: reqwest::Error },
    #[error("{provider} returned HTTP {status}: {body}")]
    Status { provider: String, status: u16, body: String },
    #[error("{provider} stream failed: {details}")]
    Stream { provider: String, details: String },
    #[error("{provider} response could not be decoded: {details}")]
    Decode { provider: String, details: String },
    #[error("invalid model configuration: {0}")]
    InvalidConfig(String),
}

/// One increment of model output.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModelChunk {
    pub delta: String,
    pub finish_reason: Option<String>,
}

pub type ChunkStream = BoxStream<'static, Result<ModelChunk, ProviderError>>;

#[async_trait]
pub trait ModelClient: Send + Sync {
    fn provider(&self) -> &str;

    fn model_name(&self) -> &str;

    /// Sends the conversation and streams back output as it is produced.
    async fn stream(&self, messages: &[Msg]) -> Result<ChunkStream, ProviderError>;

    async fn complete(&self, messages: &[Msg]) -> Result<String, ProviderError> {
        let mut chunks = self.stream(messages).await?;
        let mut text = String::new();
        while let Some(chunk) = chunks.next().await {
            text.push_str(&chunk?.delta);
        }
        Ok(text)
    }
}

pub type ModelRegistry = Registry<Arc<dyn ModelClient>>;

pub type ProviderConstructor =
    Arc<dyn Fn(&ModelConfig) -> Result<Arc<dyn ModelClient>, ProviderError> + Send + Sync>;

/// Why a model registry could not be assembled.
#[derive(Debug, Error)]
pub enum ModelSetupError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("model `{name}` could not be constructed: {source}")]
    Provider { name: String, source: ProviderError },
}

/// Provider name to client constructor.
#[derive(Clone, Default)]
pub struct ProviderTable {
    constructors: BTreeMap<String, ProviderConstructor>,
}

const OPENAI_COMPATIBLE: &[(&str, &str)] = &[
    ("openai", "https://api.openai.com/v1"),
    ("ollama", "http://localhost:11434/v1"),
    ("dashscope", "https://dashscope.aliyuncs.com/compatible-mode/v1"),
    ("gemini", "https://generativelanguage.googleapis.com/v1beta/openai"),
];

impl ProviderTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// `openai`, `ollama`, `dashscope`, `gemini` and `anthropic`.
    pub fn builtin() -> Self {
        let mut table = Self::empty();
        for &(provider, default_base_url) in OPENAI_COMPATIBLE {
            table.register(provider, move |config: &ModelConfig| {
                let client = OpenAiCompatibleClient::from_config(provider, default_base_url, config)?;
                Ok(Arc::new(client) as Arc<dyn ModelClient>)
            });
        }
        table.register("anthropic", |config: &ModelConfig| {
            Ok(Arc::new(AnthropicClient::from_config(config)?) as Arc<dyn ModelClient>)
        });
        table
    }

    pub fn register<F>(&mut self, provider: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn(&ModelConfig) -> Result<Arc<dyn ModelClient>, ProviderError> + Send + Sync + 'static,
    {
        self.constructors.insert(provider.into().to_ascii_lowercase(), Arc::new(constructor));
        self
    }

    pub fn supports(&self, provider: &str) -> bool {
        self.constructors.contains_key(&provider.to_ascii_lowercase())
    }

    pub fn supported(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    pub fn construct(&self, config: &ModelConfig) -> Result<Arc<dyn ModelClient>, ModelSetupError> {
        let constructor = self.constructors.get(&config.provider.to_ascii_lowercase()).ok_or_else(
            || RegistryError::UnsupportedProvider {
                name: config.name.clone(),
                provider: config.provider.clone(),
                supported: self.supported().join(", "),
            },
        )?;

        constructor(config)
            .map_err(|source| ModelSetupError::Provider { name: config.name.clone(), source })
    }

    /// Builds every configured model in declaration order; any failure aborts.
    pub fn build_registry(&self, models: &[ModelConfig]) -> Result<ModelRegistry, ModelSetupError> {
        let mut builder = ModelRegistry::builder("model");
        for config in models {
            let client = self.construct(config)?;
            builder.insert(config.name.clone(), config.provider.clone(), client)?;
        }
        Ok(builder.build())
    }
}
