use std::collections::BTreeMap;
use std::env;
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

pub const DEFAULT_MANIFEST_NAMES: &[&str] = &["agentapp.yaml", "agentapp.yml", "agentapp.toml"];

#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub models: Vec<ModelConfig>,
    pub tool_servers: Vec<ToolServerConfig>,
    pub session: SessionConfig,
    pub platform: PlatformConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct ModelConfig {
    pub name: String,
    pub provider: String,
    pub model: String,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub stream: bool,
    pub timeout_secs: u64,
    pub generate_params: Map<String, Value>,
}

#[derive(Clone, Debug)]
pub struct ToolServerConfig {
    pub name: String,
    pub url: String,
    pub transport: ToolTransport,
    pub headers: BTreeMap<String, SecretString>,
    pub timeout_secs: f64,
    pub sse_read_timeout_secs: f64,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub backend: SessionBackendKind,
    pub save_dir: PathBuf,
    pub url: String,
    pub max_connections: u32,
    pub concurrency: SessionConcurrency,
}

#[derive(Clone, Debug)]
pub struct PlatformConfig {
    pub endpoint: Option<String>,
    pub instance_id: Option<String>,
    pub heartbeat_interval_secs: u64,
    pub request_timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolTransport {
    Sse,
    StreamableHttp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionBackendKind {
    Json,
    Sqlite,
    Memory,
}

/// What happens when a request arrives for a session that is already being served.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionConcurrency {
    /// Wait until the in-flight request releases the session.
    #[default]
    Queue,
    /// Fail fast with a busy error.
    Reject,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub bind_address: Option<String>,
    pub port: Option<u16>,
    pub platform_endpoint: Option<String>,
    pub instance_id: Option<String>,
    pub disable_platform: bool,
    pub session_dir: Option<PathBuf>,
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {message}")]
    ParseFile { path: PathBuf, message: String },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable `{var}` referenced at `{path}` is not set")]
    MissingEnvVar { var: String, path: String },
    #[error("unterminated `${{` placeholder at `{path}`")]
    UnterminatedPlaceholder { path: String },
    #[error("missing required field `{path}`")]
    MissingField { path: String },
    #[error("invalid value at `{path}`: {message}")]
    InvalidField { path: String, message: String },
    #[error("invalid value `{value}` at `{path}` (expected one of {allowed})")]
    InvalidEnum { path: String, value: String, allowed: String },
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            models: Vec::new(),
            tool_servers: Vec::new(),
            session: SessionConfig {
                backend: SessionBackendKind::Json,
                save_dir: PathBuf::from("./sessions"),
                url: "sqlite://sessions.db".to_string(),
                max_connections: 5,
                concurrency: SessionConcurrency::Queue,
            },
            platform: PlatformConfig {
                endpoint: None,
                instance_id: None,
                heartbeat_interval_secs: 30,
                request_timeout_secs: 10,
            },
            server: ServerConfig {
                bind_address: "0.0.0.0".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

trait ClosedSet: Sized {
    const ALLOWED: &'static [&'static str];

    fn from_token(token: &str) -> Option<Self>;
}

impl ClosedSet for ToolTransport {
    const ALLOWED: &'static [&'static str] = &["sse", "streamable_http"];

    fn from_token(token: &str) -> Option<Self> {
        match token {
            "sse" => Some(Self::Sse),
            "streamable_http" => Some(Self::StreamableHttp),
            _ => None,
        }
    }
}

impl ClosedSet for SessionBackendKind {
    const ALLOWED: &'static [&'static str] = &["json", "file", "sqlite", "memory"];

    fn from_token(token: &str) -> Option<Self> {
        match token {
            "json" | "file" => Some(Self::Json),
            "sqlite" => Some(Self::Sqlite),
            "memory" => Some(Self::Memory),
            _ => None,
        }
    }
}

impl ClosedSet for SessionConcurrency {
    const ALLOWED: &'static [&'static str] = &["queue", "reject"];

    fn from_token(token: &str) -> Option<Self> {
        match token {
            "queue" => Some(Self::Queue),
            "reject" => Some(Self::Reject),
            _ => None,
        }
    }
}

impl ClosedSet for LogFormat {
    const ALLOWED: &'static [&'static str] = &["compact", "pretty", "json"];

    fn from_token(token: &str) -> Option<Self> {
        match token {
            "compact" => Some(Self::Compact),
            "pretty" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

fn parse_enum<T: ClosedSet>(path: &str, raw: &str) -> Result<T, ConfigError> {
    T::from_token(raw.trim().to_ascii_lowercase().as_str()).ok_or_else(|| {
        ConfigError::InvalidEnum {
            path: path.to_string(),
            value: raw.to_string(),
            allowed: T::ALLOWED.join("|"),
        }
    })
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        parse_enum("logging.format", value)
    }
}

impl ToolTransport {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sse => "sse",
            Self::StreamableHttp => "streamable_http",
        }
    }
}

impl SessionBackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Sqlite => "sqlite",
            Self::Memory => "memory",
        }
    }
}

impl SessionConcurrency {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::Reject => "reject",
        }
    }
}

impl ToolServerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }

    pub fn sse_read_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.sse_read_timeout_secs)
    }
}

impl PlatformConfig {
    /// Heartbeating needs both a platform endpoint and an explicit instance identity.
    pub fn enabled(&self) -> bool {
        self.endpoint.is_some() && self.instance_id.is_some()
    }
}

impl RuntimeConfig {
    /// Resolves an already-parsed manifest tree against the process environment.
    pub fn resolve(raw: Value) -> Result<Self, ConfigError> {
        Self::resolve_with(raw, |name| env::var(name).ok())
    }

    pub fn resolve_with<F>(raw: Value, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = Self::from_tree(raw, &lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        let mut config = if let Some(path) = maybe_path {
            let tree = read_tree(&path)?;
            Self::from_tree(tree, &|name: &str| env::var(name).ok())?
        } else if options.require_file {
            let expected =
                options.config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_MANIFEST_NAMES[0]));
            return Err(ConfigError::MissingConfigFile(expected));
        } else {
            Self::default()
        };

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    pub fn model(&self, name: &str) -> Option<&ModelConfig> {
        self.models.iter().find(|model| model.name == name)
    }

    fn from_tree(raw: Value, lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let manifest: ManifestPatch = match expand_placeholders(raw, "", lookup)? {
            Value::Null => ManifestPatch::default(),
            root @ Value::Object(_) => decode(root, "<root>")?,
            other => {
                return Err(ConfigError::InvalidField {
                    path: "<root>".to_string(),
                    message: format!("expected a mapping, found {}", kind_of(&other)),
                })
            }
        };
        let mut config = Self::default();

        for (name, spec) in manifest.models.unwrap_or_default() {
            let path = join_path("models", &name);
            config.models.push(decode::<ModelPatch>(spec, &path)?.into_config(name, &path)?);
        }
        for (name, spec) in manifest.tool_servers.unwrap_or_default() {
            let path = join_path("tool_servers", &name);
            config.tool_servers.push(decode::<ToolServerPatch>(spec, &path)?.into_config(name, &path)?);
        }
        if let Some(session) = manifest.session {
            decode::<SessionPatch>(session, "session")?.apply(&mut config.session)?;
        }
        if let Some(platform) = manifest.platform {
            decode::<PlatformPatch>(platform, "platform")?.apply(&mut config.platform);
        }
        if let Some(server) = manifest.server {
            decode::<ServerPatch>(server, "server")?.apply(&mut config.server);
        }
        if let Some(logging) = manifest.logging {
            decode::<LoggingPatch>(logging, "logging")?.apply(&mut config.logging)?;
        }

        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("AGENTHOST_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("AGENTHOST_SERVER_PORT") {
            self.server.port = parse_u16("AGENTHOST_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("AGENTHOST_PLATFORM_ENDPOINT") {
            self.platform.endpoint = Some(trim_slash(&value));
        }
        if let Some(value) = read_env("AGENTHOST_PLATFORM_INSTANCE_ID") {
            self.platform.instance_id = Some(value);
        }
        if let Some(value) = read_env("AGENTHOST_SESSION_DIR") {
            self.session.save_dir = PathBuf::from(value);
        }
        if let Some(value) = read_env("AGENTHOST_LOG_LEVEL") {
            self.logging.level = value;
        }
        if let Some(value) = read_env("AGENTHOST_LOG_FORMAT") {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(bind_address) = overrides.bind_address {
            self.server.bind_address = bind_address;
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if let Some(endpoint) = overrides.platform_endpoint {
            self.platform.endpoint = Some(trim_slash(&endpoint));
        }
        if let Some(instance_id) = overrides.instance_id {
            self.platform.instance_id = Some(instance_id);
        }
        if overrides.disable_platform {
            self.platform.endpoint = None;
        }
        if let Some(session_dir) = overrides.session_dir {
            self.session.save_dir = session_dir;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(log_format) = overrides.log_format {
            self.logging.format = log_format;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for model in &self.models {
            validate_model(model)?;
        }
        for server in &self.tool_servers {
            validate_tool_server(server)?;
        }
        validate_session(&self.session)?;
        validate_platform(&self.platform)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }

    /// Effective configuration as JSON with every secret masked.
    pub fn redacted(&self) -> Value {
        let models: Map<String, Value> = self
            .models
            .iter()
            .map(|model| {
                (
                    model.name.clone(),
                    json!({
                        "provider": model.provider,
                        "model": model.model,
                        "api_key": model.api_key.as_ref().map(|_| "***"),
                        "base_url": model.base_url,
                        "stream": model.stream,
                        "timeout_secs": model.timeout_secs,
                        "generate_params": model.generate_params,
                    }),
                )
            })
            .collect();
        let tool_servers: Map<String, Value> = self
            .tool_servers
            .iter()
            .map(|server| {
                let headers: Map<String, Value> =
                    server.headers.keys().map(|key| (key.clone(), json!("***"))).collect();
                (
                    server.name.clone(),
                    json!({
                        "url": server.url,
                        "transport": server.transport.as_str(),
                        "headers": headers,
                        "timeout_secs": server.timeout_secs,
                        "sse_read_timeout_secs": server.sse_read_timeout_secs,
                    }),
                )
            })
            .collect();

        json!({
            "models": models,
            "tool_servers": tool_servers,
            "session": {
                "backend": self.session.backend.as_str(),
                "save_dir": self.session.save_dir.display().to_string(),
                "url": self.session.url,
                "max_connections": self.session.max_connections,
                "concurrency": self.session.concurrency.as_str(),
            },
            "platform": {
                "endpoint": self.platform.endpoint,
                "instance_id": self.platform.instance_id,
                "heartbeat_interval_secs": self.platform.heartbeat_interval_secs,
                "request_timeout_secs": self.platform.request_timeout_secs,
            },
            "server": {
                "bind_address": self.server.bind_address,
                "port": self.server.port,
                "graceful_shutdown_secs": self.server.graceful_shutdown_secs,
            },
            "logging": {
                "level": self.logging.level,
                "format": self.logging.format,
            },
        })
    }
}

fn decode<T: DeserializeOwned>(value: Value, path: &str) -> Result<T, ConfigError> {
    serde_json::from_value(value)
        .map_err(|error| ConfigError::InvalidField { path: path.to_string(), message: error.to_string() })
}

fn required(value: Option<Text>, path: &str, key: &str) -> Result<String, ConfigError> {
    value.map(Lenient::into_inner).ok_or_else(|| ConfigError::MissingField { path: join_path(path, key) })
}

fn closed_set<T: ClosedSet>(value: Option<Text>, path: &str, key: &str) -> Result<Option<T>, ConfigError> {
    value.map(|Lenient(raw)| parse_enum(&join_path(path, key), &raw)).transpose()
}

/// A `T` given directly or as text that parses into one. Placeholder
/// expansion always yields strings, so `port: ${PORT}` lands here as text.
#[derive(Debug)]
struct Lenient<T>(T);

type Text = Lenient<String>;

impl<T> Lenient<T> {
    fn into_inner(self) -> T {
        self.0
    }
}

impl<'de, T> Deserialize<'de> for Lenient<T>
where
    T: Deserialize<'de> + FromStr,
    T::Err: Display,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw<T> {
            Typed(T),
            Text(String),
            Number(serde_json::Number),
        }

        let text = match Raw::<T>::deserialize(deserializer)? {
            Raw::Typed(value) => return Ok(Self(value)),
            Raw::Text(text) => text,
            Raw::Number(number) => number.to_string(),
        };
        text.trim()
            .parse()
            .map(Self)
            .map_err(|error| de::Error::custom(format!("`{text}` is not accepted here: {error}")))
    }
}

#[derive(Debug, Default, Deserialize)]
struct ManifestPatch {
    models: Option<Map<String, Value>>,
    #[serde(alias = "mcp_servers")]
    tool_servers: Option<Map<String, Value>>,
    session: Option<Value>,
    platform: Option<Value>,
    server: Option<Value>,
    logging: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ModelPatch {
    provider: Option<Text>,
    model: Option<Text>,
    api_key: Option<Text>,
    base_url: Option<Text>,
    stream: Option<Lenient<bool>>,
    timeout_secs: Option<Lenient<u64>>,
    #[serde(alias = "generate_kwargs")]
    generate_params: Option<Map<String, Value>>,
}

impl ModelPatch {
    fn into_config(self, name: String, path: &str) -> Result<ModelConfig, ConfigError> {
        Ok(ModelConfig {
            provider: required(self.provider, path, "provider")?,
            model: required(self.model, path, "model")?,
            api_key: self.api_key.map(|Lenient(key)| SecretString::from(key)),
            base_url: self.base_url.map(|Lenient(url)| trim_slash(&url)),
            stream: self.stream.map_or(true, Lenient::into_inner),
            timeout_secs: self.timeout_secs.map_or(60, Lenient::into_inner),
            generate_params: self.generate_params.unwrap_or_default(),
            name,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ToolServerPatch {
    url: Option<Text>,
    transport: Option<Text>,
    headers: Option<BTreeMap<String, Text>>,
    #[serde(alias = "timeout")]
    timeout_secs: Option<Lenient<f64>>,
    #[serde(alias = "sse_read_timeout")]
    sse_read_timeout_secs: Option<Lenient<f64>>,
}

impl ToolServerPatch {
    fn into_config(self, name: String, path: &str) -> Result<ToolServerConfig, ConfigError> {
        let transport = required(self.transport, path, "transport")?;
        Ok(ToolServerConfig {
            transport: parse_enum(&join_path(path, "transport"), &transport)?,
            url: required(self.url, path, "url")?,
            headers: self
                .headers
                .unwrap_or_default()
                .into_iter()
                .map(|(header, Lenient(value))| (header, SecretString::from(value)))
                .collect(),
            timeout_secs: self.timeout_secs.map_or(30.0, Lenient::into_inner),
            sse_read_timeout_secs: self.sse_read_timeout_secs.map_or(300.0, Lenient::into_inner),
            name,
        })
    }
}

#[derive(Debug, Deserialize)]
struct SessionPatch {
    backend: Option<Text>,
    save_dir: Option<Text>,
    url: Option<Text>,
    max_connections: Option<Lenient<u32>>,
    concurrency: Option<Text>,
}

impl SessionPatch {
    fn apply(self, session: &mut SessionConfig) -> Result<(), ConfigError> {
        if let Some(backend) = closed_set(self.backend, "session", "backend")? {
            session.backend = backend;
        }
        if let Some(Lenient(save_dir)) = self.save_dir {
            session.save_dir = PathBuf::from(save_dir);
        }
        if let Some(Lenient(url)) = self.url {
            session.url = url;
        }
        if let Some(Lenient(max_connections)) = self.max_connections {
            session.max_connections = max_connections;
        }
        if let Some(concurrency) = closed_set(self.concurrency, "session", "concurrency")? {
            session.concurrency = concurrency;
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct PlatformPatch {
    endpoint: Option<Text>,
    instance_id: Option<Text>,
    #[serde(alias = "heartbeat_interval")]
    heartbeat_interval_secs: Option<Lenient<u64>>,
    request_timeout_secs: Option<Lenient<u64>>,
}

impl PlatformPatch {
    fn apply(self, platform: &mut PlatformConfig) {
        platform.endpoint = self.endpoint.map(|Lenient(url)| trim_slash(&url));
        platform.instance_id = self.instance_id.map(Lenient::into_inner);
        if let Some(Lenient(interval)) = self.heartbeat_interval_secs {
            platform.heartbeat_interval_secs = interval;
        }
        if let Some(Lenient(timeout)) = self.request_timeout_secs {
            platform.request_timeout_secs = timeout;
        }
    }
}

#[derive(Debug, Deserialize)]
struct ServerPatch {
    bind_address: Option<Text>,
    port: Option<Lenient<u16>>,
    graceful_shutdown_secs: Option<Lenient<u64>>,
}

impl ServerPatch {
    fn apply(self, server: &mut ServerConfig) {
        if let Some(Lenient(bind_address)) = self.bind_address {
            server.bind_address = bind_address;
        }
        if let Some(Lenient(port)) = self.port {
            server.port = port;
        }
        if let Some(Lenient(graceful)) = self.graceful_shutdown_secs {
            server.graceful_shutdown_secs = graceful;
        }
    }
}

#[derive(Debug, Deserialize)]
struct LoggingPatch {
    level: Option<Text>,
    format: Option<Text>,
}

impl LoggingPatch {
    fn apply(self, logging: &mut LoggingConfig) -> Result<(), ConfigError> {
        if let Some(Lenient(level)) = self.level {
            logging.level = level;
        }
        if let Some(format) = closed_set(self.format, "logging", "format")? {
            logging.format = format;
        }
        Ok(())
    }
}

fn join_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}.{key}")
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a mapping",
    }
}

fn trim_slash(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

fn expand_placeholders(
    value: Value,
    path: &str,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<Value, ConfigError> {
    match value {
        Value::String(raw) => expand_string(&raw, path, lookup).map(Value::String),
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(index, item)| expand_placeholders(item, &format!("{path}[{index}]"), lookup))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut expanded = Map::with_capacity(map.len());
            for (key, item) in map {
                let child = join_path(path, &key);
                expanded.insert(key, expand_placeholders(item, &child, lookup)?);
            }
            Ok(Value::Object(expanded))
        }
        scalar => Ok(scalar),
    }
}

fn expand_string(
    input: &str,
    path: &str,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => {
                        return Err(ConfigError::UnterminatedPlaceholder { path: path.to_string() })
                    }
                }
            }

            let value = lookup(&key).filter(|value| !value.is_empty()).ok_or_else(|| {
                ConfigError::MissingEnvVar { var: key.clone(), path: path.to_string() }
            })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

/// The explicit path when it exists, otherwise the first default manifest in the working directory.
pub fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    DEFAULT_MANIFEST_NAMES.iter().map(PathBuf::from).find(|path| path.exists())
}

fn read_tree(path: &Path) -> Result<Value, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;
    let parse_error =
        |message: String| ConfigError::ParseFile { path: path.to_path_buf(), message };

    let is_toml = path.extension().and_then(|ext| ext.to_str()) == Some("toml");
    if is_toml {
        let document = toml::from_str::<toml::Value>(&raw).map_err(|e| parse_error(e.to_string()))?;
        serde_json::to_value(document).map_err(|e| parse_error(e.to_string()))
    } else {
        serde_yaml::from_str::<Value>(&raw).map_err(|e| parse_error(e.to_string()))
    }
}

fn validate_model(model: &ModelConfig) -> Result<(), ConfigError> {
    if model.name.trim().is_empty() {
        return Err(ConfigError::Validation("model names must not be empty".to_string()));
    }
    if model.provider.trim().is_empty() {
        return Err(ConfigError::Validation(format!(
            "models.{}.provider must not be empty",
            model.name
        )));
    }
    if model.model.trim().is_empty() {
        return Err(ConfigError::Validation(format!(
            "models.{}.model must not be empty",
            model.name
        )));
    }
    if model.timeout_secs == 0 || model.timeout_secs > 600 {
        return Err(ConfigError::Validation(format!(
            "models.{}.timeout_secs must be in range 1..=600",
            model.name
        )));
    }
    if let Some(base_url) = &model.base_url {
        validate_http_url(&format!("models.{}.base_url", model.name), base_url)?;
    }
    if model.api_key.as_ref().is_some_and(|key| key.expose_secret().trim().is_empty()) {
        return Err(ConfigError::Validation(format!(
            "models.{}.api_key must not be empty when set",
            model.name
        )));
    }
    Ok(())
}

fn validate_tool_server(server: &ToolServerConfig) -> Result<(), ConfigError> {
    validate_http_url(&format!("tool_servers.{}.url", server.name), &server.url)?;

    let positive = |value: f64| value.is_finite() && value > 0.0;
    if !positive(server.timeout_secs) || !positive(server.sse_read_timeout_secs) {
        return Err(ConfigError::Validation(format!(
            "tool_servers.{} timeouts must be positive numbers of seconds",
            server.name
        )));
    }
    Ok(())
}

fn validate_session(session: &SessionConfig) -> Result<(), ConfigError> {
    match session.backend {
        SessionBackendKind::Json => {
            if session.save_dir.as_os_str().is_empty() {
                return Err(ConfigError::Validation(
                    "session.save_dir must not be empty for the json backend".to_string(),
                ));
            }
        }
        SessionBackendKind::Sqlite => {
            let url = session.url.trim();
            let sqlite_url =
                url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
            if !sqlite_url {
                return Err(ConfigError::Validation(
                    "session.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                        .to_string(),
                ));
            }
            if session.max_connections == 0 {
                return Err(ConfigError::Validation(
                    "session.max_connections must be greater than zero".to_string(),
                ));
            }
        }
        SessionBackendKind::Memory => {}
    }
    Ok(())
}

fn validate_platform(platform: &PlatformConfig) -> Result<(), ConfigError> {
    if let Some(endpoint) = &platform.endpoint {
        validate_http_url("platform.endpoint", endpoint)?;
    }
    if platform.instance_id.as_ref().is_some_and(|id| id.trim().is_empty()) {
        return Err(ConfigError::Validation(
            "platform.instance_id must not be empty when set".to_string(),
        ));
    }
    if platform.heartbeat_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "platform.heartbeat_interval_secs must be greater than zero".to_string(),
        ));
    }
    if platform.request_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "platform.request_timeout_secs must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.bind_address.trim().is_empty() {
        return Err(ConfigError::Validation("server.bind_address must not be empty".to_string()));
    }
    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::InvalidEnum {
            path: "logging.level".to_string(),
            value: logging.level.clone(),
            allowed: "trace|debug|info|warn|error".to_string(),
        }),
    }
}

fn validate_http_url(path: &str, url: &str) -> Result<(), ConfigError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(ConfigError::Validation(format!("{path} must start with http:// or https://")))
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.trim().parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}
