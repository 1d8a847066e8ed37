//! MCP tool servers reached through the `rmcp` client.
//!
//! `streamable_http` posts every message to one URL; legacy `sse` keeps an
//! event stream open and posts to the endpoint the server announces on it.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use rmcp::model::{CallToolRequestParam, Tool};
use rmcp::service::{RoleClient, RunningService, ServiceError, ServiceExt};
use rmcp::transport::sse_client::SseClientConfig;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::{SseClientTransport, StreamableHttpClientTransport};
use secrecy::ExposeSecret;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use agenthost_core::config::{ToolServerConfig, ToolTransport};

use crate::tools::{ToolClient, ToolConnector, ToolError, ToolSchema};

type McpService = RunningService<RoleClient, ()>;

/// Connects to MCP servers over either supported transport.
#[derive(Clone, Debug, Default)]
pub struct McpConnector;

#[async_trait]
impl ToolConnector for McpConnector {
    async fn connect(&self, config: &ToolServerConfig) -> Result<Arc<dyn ToolClient>, ToolError> {
        let http = http_client(config)?;
        let connect_failed =
            |details: String| ToolError::Connect { server: config.name.clone(), details };

        let handshake = async {
            match config.transport {
                ToolTransport::StreamableHttp => {
                    let transport = StreamableHttpClientTransport::with_client(
                        http,
                        StreamableHttpClientTransportConfig::with_uri(config.url.as_str()),
                    );
                    ().serve(transport).await.map_err(|error| connect_failed(error.to_string()))
                }
                ToolTransport::Sse => {
                    let transport = SseClientTransport::start_with_client(
                        http,
                        SseClientConfig { sse_endpoint: config.url.as_str().into(), ..Default::default() },
                    )
                    .await
                    .map_err(|error| connect_failed(error.to_string()))?;
                    ().serve(transport).await.map_err(|error| connect_failed(error.to_string()))
                }
            }
        };
        let service = with_timeout(config, "initialize", handshake).await?;

        debug!(
            server = %config.name,
            transport = config.transport.as_str(),
            peer = ?service.peer_info(),
            "tool server initialized"
        );
        Ok(Arc::new(McpClient {
            name: config.name.clone(),
            timeout: config.timeout(),
            service: RwLock::new(Some(service)),
        }))
    }
}

/// Headers from the manifest ride on every request, including the SSE stream.
fn http_client(config: &ToolServerConfig) -> Result<reqwest::Client, ToolError> {
    let mut headers = HeaderMap::new();
    for (name, value) in &config.headers {
        let invalid = |details: String| ToolError::Protocol { server: config.name.clone(), details };
        let name = HeaderName::from_str(name)
            .map_err(|error| invalid(format!("invalid header name `{name}`: {error}")))?;
        let value = HeaderValue::from_str(value.expose_secret())
            .map_err(|_| invalid(format!("invalid value for header `{name}`")))?;
        headers.insert(name, value);
    }

    reqwest::Client::builder()
        .default_headers(headers)
        .read_timeout(config.sse_read_timeout())
        .build()
        .map_err(|source| ToolError::Http { server: config.name.clone(), source })
}

async fn with_timeout<T>(
    config: &ToolServerConfig,
    method: &str,
    request: impl std::future::Future<Output = Result<T, ToolError>>,
) -> Result<T, ToolError> {
    tokio::time::timeout(config.timeout(), request).await.map_err(|_| ToolError::Timeout {
        server: config.name.clone(),
        method: method.to_string(),
    })?
}

pub struct McpClient {
    name: String,
    timeout: Duration,
    service: RwLock<Option<McpService>>,
}

impl McpClient {
    fn service_error(&self, method: &str, error: ServiceError) -> ToolError {
        match error {
            ServiceError::McpError(error) => ToolError::Rpc {
                server: self.name.clone(),
                method: method.to_string(),
                code: i64::from(error.code.0),
                message: error.message.to_string(),
            },
            ServiceError::Timeout { .. } => {
                ToolError::Timeout { server: self.name.clone(), method: method.to_string() }
            }
            other => ToolError::Protocol { server: self.name.clone(), details: other.to_string() },
        }
    }

    async fn bounded<T>(
        &self,
        method: &str,
        request: impl std::future::Future<Output = Result<T, ServiceError>>,
    ) -> Result<T, ToolError> {
        match tokio::time::timeout(self.timeout, request).await {
            Ok(result) => result.map_err(|error| self.service_error(method, error)),
            Err(_) => Err(ToolError::Timeout { server: self.name.clone(), method: method.to_string() }),
        }
    }

    fn closed(&self) -> ToolError {
        ToolError::Closed { server: self.name.clone() }
    }
}

fn tool_schema(tool: Tool) -> ToolSchema {
    ToolSchema {
        name: tool.name.to_string(),
        description: tool.description.map(|description| description.to_string()),
        input_schema: Value::Object(tool.input_schema.as_ref().clone()),
    }
}

#[async_trait]
impl ToolClient for McpClient {
    fn server_name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> Result<Vec<ToolSchema>, ToolError> {
        let guard = self.service.read().await;
        let service = guard.as_ref().ok_or_else(|| self.closed())?;
        let tools = self.bounded("tools/list", service.list_all_tools()).await?;
        Ok(tools.into_iter().map(tool_schema).collect())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ToolError> {
        let arguments: Option<Map<String, Value>> = match arguments {
            Value::Null => None,
            Value::Object(arguments) => Some(arguments),
            other => {
                return Err(ToolError::Protocol {
                    server: self.name.clone(),
                    details: format!("arguments for `{name}` must be an object, got {other}"),
                })
            }
        };

        let guard = self.service.read().await;
        let service = guard.as_ref().ok_or_else(|| self.closed())?;
        let request = CallToolRequestParam { name: name.to_string().into(), arguments };
        let result = self.bounded("tools/call", service.call_tool(request)).await?;

        serde_json::to_value(result).map_err(|error| ToolError::Protocol {
            server: self.name.clone(),
            details: format!("`{name}` result could not be encoded: {error}"),
        })
    }

    async fn close(&self) -> Result<(), ToolError> {
        let Some(service) = self.service.write().await.take() else {
            return Ok(());
        };
        match service.cancel().await {
            Ok(reason) => {
                debug!(server = %self.name, reason = ?reason, "tool server connection closed");
                Ok(())
            }
            Err(error) => {
                warn!(server = %self.name, error = %error, "tool server task ended abnormally");
                Err(ToolError::Protocol { server: self.name.clone(), details: error.to_string() })
            }
        }
    }
}
