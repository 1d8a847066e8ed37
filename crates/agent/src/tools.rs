use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

use agenthost_core::config::ToolServerConfig;
use agenthost_core::registry::{Registry, RegistryBuilder, RegistryError};

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool server `{server}` request failed: {source}")]
    Http { server: String, source: reqwest::Error },
    #[error("tool server `{server}` could not be reached: {details}")]
    Connect { server: String, details: String },
    #[error("tool server `{server}` protocol error: {details}")]
    Protocol { server: String, details: String },
    #[error("tool server `{server}` rejected `{method}` ({code}): {message}")]
    Rpc { server: String, method: String, code: i64, message: String },
    #[error("tool server `{server}` did not answer `{method}` in time")]
    Timeout { server: String, method: String },
    #[error("tool server `{server}` connection is closed")]
    Closed { server: String },
    #[error("tool `{0}` is not exposed by any connected server")]
    UnknownTool(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// A tool as advertised by `tools/list`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default = "empty_object_schema")]
    pub input_schema: Value,
}

fn empty_object_schema() -> Value {
    json!({ "type": "object" })
}

/// A live connection to one tool server.
#[async_trait]
pub trait ToolClient: Send + Sync {
    fn server_name(&self) -> &str;

    async fn list_tools(&self) -> Result<Vec<ToolSchema>, ToolError>;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ToolError>;

    async fn close(&self) -> Result<(), ToolError>;
}

/// Opens tool server connections; the runtime is generic over how.
#[async_trait]
pub trait ToolConnector: Send + Sync {
    async fn connect(&self, config: &ToolServerConfig) -> Result<Arc<dyn ToolClient>, ToolError>;
}

#[derive(Clone, Debug)]
pub struct ExposedTool {
    pub name: String,
    pub server: String,
    pub original_name: String,
    pub schema: ToolSchema,
}

/// Connected tool servers plus the flat index of tools they expose.
///
/// When two servers offer the same tool name, the later one is exposed as
/// `{server}_{tool}`.
#[derive(Clone)]
pub struct ToolSet {
    servers: Registry<Arc<dyn ToolClient>>,
    tools: Vec<ExposedTool>,
    index: HashMap<String, usize>,
}

impl ToolSet {
    pub fn empty() -> Self {
        ToolSetBuilder::new().build()
    }

    pub fn servers(&self) -> Vec<String> {
        self.servers.list_names()
    }

    pub fn server(&self, name: &str) -> Result<&Arc<dyn ToolClient>, RegistryError> {
        self.servers.get(name)
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|tool| tool.name.as_str()).collect()
    }

    pub fn get(&self, tool: &str) -> Option<&ExposedTool> {
        self.index.get(tool).map(|position| &self.tools[*position])
    }

    /// Schemas under their exposed names.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools
            .iter()
            .map(|tool| ToolSchema { name: tool.name.clone(), ..tool.schema.clone() })
            .collect()
    }

    pub async fn call(&self, tool: &str, arguments: Value) -> Result<Value, ToolError> {
        let exposed = self.get(tool).ok_or_else(|| ToolError::UnknownTool(tool.to_string()))?;
        let client = self.servers.get(&exposed.server)?;
        client.call_tool(&exposed.original_name, arguments).await
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Closes every server connection, last connected first. Failures are logged.
    pub async fn close_all(&self) {
        close_in_reverse(self.servers.entries().iter().map(|entry| Arc::clone(&entry.handle)).collect())
            .await;
    }
}

pub struct ToolSetBuilder {
    servers: RegistryBuilder<Arc<dyn ToolClient>>,
    tools: Vec<ExposedTool>,
    index: HashMap<String, usize>,
}

impl Default for ToolSetBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolSetBuilder {
    pub fn new() -> Self {
        Self { servers: Registry::builder("tool server"), tools: Vec::new(), index: HashMap::new() }
    }

    /// Registers a connected client and indexes the tools it lists.
    pub async fn add_server(
        &mut self,
        config: &ToolServerConfig,
        client: Arc<dyn ToolClient>,
    ) -> Result<(), ToolError> {
        if let Err(error) =
            self.servers.insert(config.name.clone(), config.transport.as_str(), Arc::clone(&client))
        {
            if let Err(failure) = client.close().await {
                warn!(
                    event_name = "tools.server.close_failed",
                    server = %config.name,
                    error = %failure,
                    "failed to close rejected tool server"
                );
            }
            return Err(error.into());
        }
        let listed = client.list_tools().await;

        for schema in listed? {
            let exposed_name = if self.index.contains_key(&schema.name) {
                let renamed = format!("{}_{}", config.name, schema.name);
                warn!(
                    event_name = "tools.name.collision",
                    server = %config.name,
                    tool = %schema.name,
                    exposed_as = %renamed,
                    "tool name already taken, exposing under server-prefixed name"
                );
                renamed
            } else {
                schema.name.clone()
            };

            if self.index.contains_key(&exposed_name) {
                return Err(ToolError::Registry(RegistryError::Duplicate {
                    kind: "tool",
                    name: exposed_name,
                }));
            }

            self.index.insert(exposed_name.clone(), self.tools.len());
            self.tools.push(ExposedTool {
                name: exposed_name,
                server: config.name.clone(),
                original_name: schema.name.clone(),
                schema,
            });
        }
        Ok(())
    }

    /// Closes whatever was registered so far, in reverse order.
    pub async fn abandon(self) {
        close_in_reverse(self.servers.into_handles()).await;
    }

    pub fn build(self) -> ToolSet {
        ToolSet { servers: self.servers.build(), tools: self.tools, index: self.index }
    }
}

/// Connects every configured server in order. On failure, already connected
/// servers are closed in reverse order before the error is returned.
pub async fn connect_all(
    connector: &dyn ToolConnector,
    configs: &[ToolServerConfig],
) -> Result<ToolSet, (String, ToolError)> {
    let mut builder = ToolSetBuilder::new();

    for config in configs {
        let added = match connector.connect(config).await {
            Ok(client) => builder.add_server(config, client).await,
            Err(error) => Err(error),
        };

        if let Err(error) = added {
            builder.abandon().await;
            return Err((config.name.clone(), error));
        }

        info!(
            event_name = "tools.server.connected",
            server = %config.name,
            transport = config.transport.as_str(),
            "tool server connected"
        );
    }

    Ok(builder.build())
}

async fn close_in_reverse(clients: Vec<Arc<dyn ToolClient>>) {
    for client in clients.into_iter().rev() {
        if let Err(error) = client.close().await {
            warn!(
                event_name = "tools.server.close_failed",
                server = %client.server_name(),
                error = %error,
                "failed to close tool server connection"
            );
        }
    }
}
