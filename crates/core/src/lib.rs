pub mod config;
pub mod errors;
pub mod lifecycle;
pub mod message;
pub mod platform;
pub mod registry;
pub mod session;

pub use config::{
    ConfigError, ConfigOverrides, LoadOptions, LogFormat, ModelConfig, RuntimeConfig,
    SessionBackendKind, SessionConcurrency, SessionConfig, ToolServerConfig, ToolTransport,
};
pub use errors::{ErrorCode, InterfaceError};
pub use lifecycle::LifecycleState;
pub use message::{Msg, Role};
pub use platform::{
    ConfigUpdate, Directive, HealthResponse, HeartbeatReport, HeartbeatStatus, MetricsSnapshot,
};
pub use registry::{Registry, RegistryBuilder, RegistryEntry, RegistryError};
pub use session::{SessionRecord, SessionState};
