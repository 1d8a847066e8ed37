//! Agent runtime host.
//!
//! This crate owns everything a hosted agent application touches while it runs:
//! - Model clients built from configuration through a provider table (`llm`)
//! - MCP tool-server connections and the tool index they expose (`tools`, `mcp`)
//! - The runtime orchestrator with its lifecycle and per-session dispatch (`runtime`)
//!
//! # Key Types
//!
//! - `AgentRuntime` - initializes resources, dispatches turns, shuts down
//! - `AgentApp` - the application being hosted
//! - `RequestContext` - per-turn session state and resource access

pub mod app;
pub mod context;
pub mod llm;
pub mod mcp;
pub mod providers;
pub mod runtime;
pub mod sse;
pub mod tools;

pub use app::{AgentApp, AppFactory, MessageStream};
pub use context::{RequestContext, Resources};
pub use llm::{ModelClient, ModelRegistry, ProviderTable};
pub use runtime::{AgentRuntime, ConfigSource, DispatchOptions, DispatchStream, RuntimeError};
pub use tools::{ToolConnector, ToolSet};
