//! Runtime orchestrator: owns every resource the hosted app uses and moves
//! through `uninitialized -> initializing -> ready -> shutting_down -> stopped`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::stream::{BoxStream, StreamExt};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use agenthost_core::config::{ConfigError, LoadOptions, RuntimeConfig};
use agenthost_core::errors::ErrorCode;
use agenthost_core::lifecycle::LifecycleState;
use agenthost_core::message::Msg;
use agenthost_core::platform::MetricsSnapshot;
use agenthost_core::registry::RegistryError;
use agenthost_db::{SessionStore, StoreError};

use crate::app::{AgentApp, AppFactory};
use crate::context::{RequestContext, Resources};
use crate::llm::{ModelSetupError, ProviderError, ProviderTable};
use crate::mcp::McpConnector;
use crate::tools::{connect_all, ToolConnector, ToolError};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("runtime cannot be initialized from state `{0}`")]
    AlreadyInitialized(LifecycleState),
    #[error("runtime is not ready (state `{0}`)")]
    NotReady(LifecycleState),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("model `{name}` could not be constructed: {source}")]
    Provider { name: String, source: ProviderError },
    #[error("tool server `{server}` failed to connect: {source}")]
    ToolConnect { server: String, source: ToolError },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("hosted app failed to start: {0:#}")]
    AppStartup(anyhow::Error),
    #[error("hosted app failed: {0:#}")]
    App(anyhow::Error),
}

impl RuntimeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotReady(_) => ErrorCode::NotReady,
            Self::Store(error) => error.code(),
            Self::App(_) => ErrorCode::AppError,
            Self::Config(_)
            | Self::AlreadyInitialized(_)
            | Self::Registry(_)
            | Self::Provider { .. }
            | Self::ToolConnect { .. }
            | Self::AppStartup(_) => ErrorCode::Internal,
        }
    }
}

impl From<ModelSetupError> for RuntimeError {
    fn from(error: ModelSetupError) -> Self {
        match error {
            ModelSetupError::Registry(error) => Self::Registry(error),
            ModelSetupError::Provider { name, source } => Self::Provider { name, source },
        }
    }
}

/// Where [`AgentRuntime::initialize`] gets its configuration.
#[derive(Debug)]
pub enum ConfigSource {
    /// Manifest file plus environment and explicit overrides.
    File(LoadOptions),
    /// A parsed manifest tree whose `${VAR}` placeholders are still unresolved.
    Tree(Value),
    Resolved(RuntimeConfig),
}

impl ConfigSource {
    fn resolve(self) -> Result<RuntimeConfig, ConfigError> {
        match self {
            Self::File(options) => RuntimeConfig::load(options),
            Self::Tree(tree) => RuntimeConfig::resolve(tree),
            Self::Resolved(config) => {
                config.validate()?;
                Ok(config)
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DispatchOptions {
    /// Start from empty state when the session has no stored record.
    pub allow_missing: bool,
}

impl DispatchOptions {
    pub fn allow_missing() -> Self {
        Self { allow_missing: true }
    }
}

/// Replies of one dispatched turn. Ends with an error element when the app or
/// the final save fails, or when the runtime shuts down mid-turn.
pub type DispatchStream = BoxStream<'static, Result<Msg, RuntimeError>>;

struct Live {
    app: Arc<dyn AgentApp>,
    resources: Resources,
    /// Cancelled when shutdown starts.
    cancel: CancellationToken,
    /// One token per dispatched turn, held until its stream ends or is dropped.
    turns: TaskTracker,
}

impl Live {
    fn new(app: Arc<dyn AgentApp>, resources: Resources) -> Self {
        Self { app, resources, cancel: CancellationToken::new(), turns: TaskTracker::new() }
    }

    /// Cancels open turns and waits up to `grace` for their streams to end.
    async fn drain(&self, grace: Duration) {
        self.turns.close();
        self.cancel.cancel();
        if tokio::time::timeout(grace, self.turns.wait()).await.is_err() {
            warn!(
                event_name = "runtime.shutdown.drain_timeout",
                in_flight = self.turns.len(),
                grace_secs = grace.as_secs(),
                "turns still open after grace period, releasing resources anyway"
            );
        }
    }
}

struct Lifecycle {
    state: LifecycleState,
    instance_id: String,
    live: Option<Arc<Live>>,
}

impl Lifecycle {
    /// Moves to `next` if the state machine allows it, otherwise returns the
    /// current state untouched.
    fn transition(&mut self, next: LifecycleState) -> Result<(), LifecycleState> {
        if !self.state.can_transition_to(next) {
            return Err(self.state);
        }
        debug!(
            event_name = "runtime.lifecycle.transition",
            correlation_id = %self.instance_id,
            from = %self.state,
            to = %next,
            "lifecycle state changed"
        );
        self.state = next;
        Ok(())
    }

    /// Like [`Lifecycle::transition`] for steps the caller already owns; an
    /// illegal step is logged and ignored.
    fn advance(&mut self, next: LifecycleState) {
        if let Err(current) = self.transition(next) {
            error!(
                event_name = "runtime.lifecycle.invalid_transition",
                correlation_id = %self.instance_id,
                from = %current,
                to = %next,
                "lifecycle transition refused"
            );
        }
    }
}

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    failed: AtomicU64,
    active: Mutex<HashMap<String, usize>>,
}

impl Counters {
    fn fail(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Marks a session as in flight for as long as it lives.
struct ActiveSession {
    counters: Arc<Counters>,
    session_id: String,
}

impl ActiveSession {
    fn enter(counters: &Arc<Counters>, session_id: &str) -> Self {
        *counters
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(session_id.to_string())
            .or_default() += 1;
        Self { counters: Arc::clone(counters), session_id: session_id.to_string() }
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        let mut active = self.counters.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = active.get_mut(&self.session_id) {
            *count -= 1;
            if *count == 0 {
                active.remove(&self.session_id);
            }
        }
    }
}

pub struct AgentRuntime {
    factory: Arc<dyn AppFactory>,
    providers: ProviderTable,
    connector: Arc<dyn ToolConnector>,
    started_at: Instant,
    lifecycle: Mutex<Lifecycle>,
    transition: AsyncMutex<()>,
    counters: Arc<Counters>,
}

impl AgentRuntime {
    pub fn new(
        factory: impl AppFactory + 'static,
        providers: ProviderTable,
        connector: Arc<dyn ToolConnector>,
    ) -> Self {
        Self {
            factory: Arc::new(factory),
            providers,
            connector,
            started_at: Instant::now(),
            lifecycle: Mutex::new(Lifecycle {
                state: LifecycleState::Uninitialized,
                instance_id: uuid::Uuid::new_v4().to_string(),
                live: None,
            }),
            transition: AsyncMutex::new(()),
            counters: Arc::default(),
        }
    }

    /// Built-in model providers and MCP tool servers.
    pub fn with_builtin_providers(factory: impl AppFactory + 'static) -> Self {
        Self::new(factory, ProviderTable::builtin(), Arc::new(McpConnector::default()))
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle().state
    }

    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    /// `platform.instance_id` once configured, otherwise a generated id.
    pub fn instance_id(&self) -> String {
        self.lifecycle().instance_id.clone()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn resources(&self) -> Option<Resources> {
        self.lifecycle().live.as_ref().map(|live| live.resources.clone())
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_sessions: self.counters.active.lock().unwrap_or_else(PoisonError::into_inner).len(),
            total_requests: self.counters.total.load(Ordering::Relaxed),
            failed_requests: self.counters.failed.load(Ordering::Relaxed),
            uptime_secs: self.uptime().as_secs(),
        }
    }

    /// Opens every resource in order and starts the hosted app.
    ///
    /// Any failure releases what was already opened and leaves the runtime
    /// `stopped`; the first error is returned unchanged.
    pub async fn initialize(&self, source: ConfigSource) -> Result<(), RuntimeError> {
        let _transition = self.transition.lock().await;
        self.lifecycle()
            .transition(LifecycleState::Initializing)
            .map_err(RuntimeError::AlreadyInitialized)?;
        info!(
            event_name = "runtime.initialize.start",
            correlation_id = %self.instance_id(),
            "initializing runtime"
        );

        match self.open(source).await {
            Ok(live) => {
                let (models, tools) = (live.resources.models.len(), live.resources.tools.len());
                {
                    let mut lifecycle = self.lifecycle();
                    lifecycle.live = Some(Arc::new(live));
                    lifecycle.advance(LifecycleState::Ready);
                }
                info!(
                    event_name = "runtime.initialize.ready",
                    correlation_id = %self.instance_id(),
                    models,
                    tools,
                    "runtime ready"
                );
                Ok(())
            }
            Err(failure) => {
                self.lifecycle().advance(LifecycleState::Stopped);
                error!(
                    event_name = "runtime.initialize.failed",
                    correlation_id = %self.instance_id(),
                    error = %failure,
                    "runtime initialization failed"
                );
                Err(failure)
            }
        }
    }

    async fn open(&self, source: ConfigSource) -> Result<Live, RuntimeError> {
        let config = source.resolve()?;
        if let Some(instance_id) = &config.platform.instance_id {
            self.lifecycle().instance_id = instance_id.clone();
        }

        let models = self.providers.build_registry(&config.models)?;
        let tools = connect_all(self.connector.as_ref(), &config.tool_servers)
            .await
            .map_err(|(server, source)| RuntimeError::ToolConnect { server, source })?;

        let sessions = match SessionStore::open(&config.session).await {
            Ok(sessions) => sessions,
            Err(failure) => {
                tools.close_all().await;
                return Err(failure.into());
            }
        };
        debug!(backend = sessions.backend().kind(), "session store opened");

        let resources = Resources {
            config: Arc::new(config),
            models: Arc::new(models),
            tools: Arc::new(tools),
            sessions,
        };

        let app = match self.factory.create(&resources) {
            Ok(app) => app,
            Err(failure) => {
                release(&resources).await;
                return Err(RuntimeError::AppStartup(failure));
            }
        };
        if let Err(failure) = app.on_startup(&resources).await {
            release(&resources).await;
            return Err(RuntimeError::AppStartup(failure));
        }

        Ok(Live::new(app, resources))
    }

    /// Stops the hosted app and releases resources in reverse order of opening.
    ///
    /// New dispatches are refused from the moment this starts. Turns already
    /// in flight are cancelled and get `server.graceful_shutdown_secs` to end
    /// before the app hook runs and the session store closes. Release
    /// failures are logged, never returned.
    pub async fn shutdown(&self) {
        let _transition = self.transition.lock().await;
        let live = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.transition(LifecycleState::ShuttingDown).is_err() {
                return;
            }
            lifecycle.live.take()
        };
        info!(
            event_name = "runtime.shutdown.start",
            correlation_id = %self.instance_id(),
            "shutting down runtime"
        );

        if let Some(live) = live {
            live.drain(Duration::from_secs(live.resources.config.server.graceful_shutdown_secs)).await;
            if let Err(failure) = live.app.on_shutdown().await {
                warn!(
                    event_name = "runtime.shutdown.app_failed",
                    error = %format!("{failure:#}"),
                    "hosted app shutdown hook failed"
                );
            }
            release(&live.resources).await;
        }

        self.lifecycle().advance(LifecycleState::Stopped);
        info!(
            event_name = "runtime.shutdown.complete",
            correlation_id = %self.instance_id(),
            "runtime stopped"
        );
    }

    /// Runs one turn of the hosted app for `session_id`.
    ///
    /// The session is leased and its state loaded before this returns, so
    /// busy, missing and storage failures surface here. The returned stream
    /// holds the lease; dropping it early discards the turn's mutations.
    /// Shutdown cancels the turn at its next reply and nothing is saved.
    pub async fn dispatch(
        &self,
        session_id: &str,
        msg: Msg,
        metadata: Map<String, Value>,
        options: DispatchOptions,
    ) -> Result<DispatchStream, RuntimeError> {
        let (live, in_flight) = {
            let lifecycle = self.lifecycle();
            match (&lifecycle.live, lifecycle.state) {
                (Some(live), LifecycleState::Ready) => (Arc::clone(live), live.turns.token()),
                (_, state) => return Err(RuntimeError::NotReady(state)),
            }
        };

        self.counters.total.fetch_add(1, Ordering::Relaxed);
        let active = ActiveSession::enter(&self.counters, session_id);

        let leased = async {
            let lease = live.resources.sessions.acquire(session_id).await?;
            let record = lease.load(options.allow_missing).await?;
            Ok::<_, StoreError>((lease, record))
        };
        let leased = tokio::select! {
            biased;
            _ = live.cancel.cancelled() => Err(RuntimeError::NotReady(LifecycleState::ShuttingDown)),
            leased = leased => leased.map_err(RuntimeError::from),
        };
        let (lease, record) = match leased {
            Ok(leased) => leased,
            Err(failure) => {
                self.counters.fail();
                debug!(
                    event_name = "runtime.dispatch.rejected",
                    correlation_id = %session_id,
                    error = %failure,
                    "session could not be opened"
                );
                return Err(failure);
            }
        };

        let lease = Arc::new(lease);
        let state = Arc::new(AsyncMutex::new(record.map(|record| record.state).unwrap_or_default()));
        let ctx = RequestContext::new(
            metadata,
            Arc::clone(&state),
            live.resources.clone(),
            Arc::clone(&lease),
        );
        let mut replies = Arc::clone(&live.app).handle(msg, ctx);
        let counters = Arc::clone(&self.counters);
        let cancel = live.cancel.clone();
        let session_id = session_id.to_string();

        let turn = async_stream::stream! {
            let _in_flight = in_flight;
            let _active = active;
            let mut failed = false;

            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    reply = replies.next() => Some(reply),
                };
                let Some(reply) = next else {
                    failed = true;
                    warn!(
                        event_name = "runtime.dispatch.cancelled",
                        correlation_id = %session_id,
                        "runtime shutting down, session state not saved"
                    );
                    yield Err(RuntimeError::NotReady(LifecycleState::ShuttingDown));
                    break;
                };
                let Some(reply) = reply else { break };
                match reply {
                    Ok(msg) => yield Ok(msg),
                    Err(failure) => {
                        failed = true;
                        warn!(
                            event_name = "runtime.dispatch.app_failed",
                            correlation_id = %session_id,
                            error = %format!("{failure:#}"),
                            "hosted app failed, session state not saved"
                        );
                        yield Err(RuntimeError::App(failure));
                        break;
                    }
                }
            }
            drop(replies);

            if failed {
                counters.fail();
            } else {
                let snapshot = state.lock().await.clone();
                if let Err(failure) = lease.save(&snapshot).await {
                    counters.fail();
                    error!(
                        event_name = "runtime.dispatch.save_failed",
                        correlation_id = %session_id,
                        error = %failure,
                        "session state could not be saved"
                    );
                    yield Err(RuntimeError::Store(failure));
                }
            }
        };

        Ok(turn.boxed())
    }
}

async fn release(resources: &Resources) {
    resources.tools.close_all().await;
    if let Err(failure) = resources.sessions.close().await {
        warn!(
            event_name = "runtime.shutdown.store_close_failed",
            error = %failure,
            "failed to close session store"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::StreamExt;
    use serde_json::{json, Map, Value};
    use tokio::sync::{mpsc, Semaphore};

    use agenthost_core::config::{RuntimeConfig, SessionBackendKind, SessionConcurrency};
    use agenthost_core::lifecycle::LifecycleState;
    use agenthost_core::message::Msg;
    use agenthost_db::StoreError;

    use super::{AgentRuntime, ConfigSource, DispatchOptions, DispatchStream, RuntimeError};
    use crate::app::{AgentApp, MessageStream};
    use crate::context::{RequestContext, Resources};
    use crate::llm::tests::{echo_table, model_config};
    use crate::tools::tests::{server_config, ScriptedConnector};

    /// Counts turns in session state and replies through the `main` model.
    struct CounterApp {
        journal: Arc<Mutex<Vec<String>>>,
        fail_startup: bool,
    }

    impl CounterApp {
        fn note(&self, entry: &str) {
            self.journal.lock().expect("journal").push(entry.to_string());
        }
    }

    #[async_trait]
    impl AgentApp for CounterApp {
        async fn on_startup(&self, resources: &Resources) -> anyhow::Result<()> {
            self.note("app:startup");
            anyhow::ensure!(!self.fail_startup, "startup refused");
            anyhow::ensure!(resources.models.contains("main"), "main model missing");
            Ok(())
        }

        async fn on_shutdown(&self) -> anyhow::Result<()> {
            self.note("app:shutdown");
            Ok(())
        }

        fn handle(self: Arc<Self>, msg: Msg, ctx: RequestContext) -> MessageStream {
            async_stream::stream! {
                let turn = {
                    let mut state = ctx.state().await;
                    let turn = state.get("turns").and_then(Value::as_u64).unwrap_or(0) + 1;
                    state.insert("turns", json!(turn));
                    turn
                };

                match msg.text().as_str() {
                    "fail" => {
                        yield Ok(Msg::assistant("partial"));
                        yield Err(anyhow::anyhow!("model exploded"));
                    }
                    "checkpoint then fail" => match ctx.checkpoint().await {
                        Ok(_) => yield Err(anyhow::anyhow!("failed after checkpoint")),
                        Err(failure) => yield Err(failure.into()),
                    },
                    _ => {
                        let model = match ctx.resources().model("main") {
                            Ok(model) => Arc::clone(model),
                            Err(failure) => {
                                yield Err(failure.into());
                                return;
                            }
                        };
                        match model.complete(&[msg]).await {
                            Ok(text) => yield Ok(Msg::assistant(text.trim().to_string())),
                            Err(failure) => yield Err(failure.into()),
                        }
                        yield Ok(Msg::assistant(format!("turn {turn}")));
                    }
                }
            }
            .boxed()
        }
    }

    /// Bumps `turns`, reports the turn as started, then holds it until a
    /// permit is added to `gate`.
    struct GatedApp {
        journal: Arc<Mutex<Vec<String>>>,
        gate: Arc<Semaphore>,
        started: mpsc::UnboundedSender<String>,
    }

    struct TurnDropped(Arc<Mutex<Vec<String>>>);

    impl Drop for TurnDropped {
        fn drop(&mut self) {
            self.0.lock().expect("journal").push("turn:dropped".to_string());
        }
    }

    #[async_trait]
    impl AgentApp for GatedApp {
        async fn on_shutdown(&self) -> anyhow::Result<()> {
            self.journal.lock().expect("journal").push("app:shutdown".to_string());
            Ok(())
        }

        fn handle(self: Arc<Self>, msg: Msg, ctx: RequestContext) -> MessageStream {
            async_stream::stream! {
                let _dropped = TurnDropped(Arc::clone(&self.journal));
                let turn = {
                    let mut state = ctx.state().await;
                    let turn = state.get("turns").and_then(Value::as_u64).unwrap_or(0) + 1;
                    state.insert("turns", json!(turn));
                    turn
                };
                let _ = self.started.send(msg.text());
                match self.gate.acquire().await {
                    Ok(permit) => permit.forget(),
                    Err(closed) => {
                        yield Err(closed.into());
                        return;
                    }
                }
                yield Ok(Msg::assistant(format!("{} turn {turn}", msg.text())));
            }
            .boxed()
        }
    }

    struct Gated {
        runtime: Arc<AgentRuntime>,
        journal: Arc<Mutex<Vec<String>>>,
        gate: Arc<Semaphore>,
        started: mpsc::UnboundedReceiver<String>,
    }

    async fn gated_runtime(config: RuntimeConfig) -> Gated {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new(Semaphore::new(0));
        let (started_tx, started) = mpsc::unbounded_channel();
        let app: Arc<dyn AgentApp> = Arc::new(GatedApp {
            journal: Arc::clone(&journal),
            gate: Arc::clone(&gate),
            started: started_tx,
        });
        let factory = move |_: &Resources| -> anyhow::Result<Arc<dyn AgentApp>> { Ok(Arc::clone(&app)) };
        let runtime = Arc::new(AgentRuntime::new(factory, echo_table(), Arc::new(ScriptedConnector::default())));
        runtime.initialize(ConfigSource::Resolved(config)).await.expect("initialize");
        Gated { runtime, journal, gate, started }
    }

    fn spawn_turn(
        runtime: &Arc<AgentRuntime>,
        session_id: &str,
        text: &str,
    ) -> tokio::task::JoinHandle<Vec<Result<String, String>>> {
        let runtime = Arc::clone(runtime);
        let (session_id, text) = (session_id.to_string(), text.to_string());
        tokio::spawn(async move {
            match turn(&runtime, &session_id, &text).await {
                Ok(stream) => {
                    stream.map(|reply| reply.map(|msg| msg.text()).map_err(|error| error.to_string())).collect().await
                }
                Err(error) => vec![Err(error.to_string())],
            }
        })
    }

    fn test_config(servers: &[&str], concurrency: SessionConcurrency) -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        config.models = vec![model_config("main", "p")];
        config.tool_servers = servers.iter().map(|name| server_config(name)).collect();
        config.session.backend = SessionBackendKind::Memory;
        config.session.concurrency = concurrency;
        config
    }

    fn runtime_with(connector: ScriptedConnector, fail_startup: bool) -> AgentRuntime {
        let journal = Arc::clone(&connector.journal);
        let factory = move |_: &Resources| -> anyhow::Result<Arc<dyn AgentApp>> {
            Ok(Arc::new(CounterApp { journal: Arc::clone(&journal), fail_startup }))
        };
        AgentRuntime::new(factory, echo_table(), Arc::new(connector))
    }

    async fn ready_runtime(concurrency: SessionConcurrency) -> AgentRuntime {
        let runtime = runtime_with(ScriptedConnector::default(), false);
        runtime
            .initialize(ConfigSource::Resolved(test_config(&[], concurrency)))
            .await
            .expect("initialize");
        runtime
    }

    async fn turn(runtime: &AgentRuntime, session_id: &str, text: &str) -> Result<DispatchStream, RuntimeError> {
        runtime.dispatch(session_id, Msg::user(text), Map::new(), DispatchOptions::allow_missing()).await
    }

    async fn stored_turns(runtime: &AgentRuntime, session_id: &str) -> Option<u64> {
        let resources = runtime.resources().expect("resources");
        let record = resources.sessions.load(session_id, true).await.expect("load")?;
        record.state.get("turns").and_then(Value::as_u64)
    }

    #[tokio::test]
    async fn dispatch_streams_replies_and_persists_state() {
        let runtime = ready_runtime(SessionConcurrency::Queue).await;

        let replies: Vec<_> = turn(&runtime, "s1", "hello there").await.expect("dispatch").collect().await;
        let texts: Vec<String> = replies.into_iter().map(|reply| reply.expect("reply").text()).collect();
        assert_eq!(texts, vec!["hello there", "turn 1"]);

        let second: Vec<_> = turn(&runtime, "s1", "again").await.expect("dispatch").collect().await;
        assert_eq!(second[1].as_ref().expect("reply").text(), "turn 2");
        assert_eq!(stored_turns(&runtime, "s1").await, Some(2));

        let metrics = runtime.metrics();
        assert_eq!(metrics.total_requests, 2);
        assert_eq!(metrics.failed_requests, 0);
        assert_eq!(metrics.active_sessions, 0);
    }

    #[tokio::test]
    async fn initializes_from_manifest_tree() {
        let runtime = runtime_with(ScriptedConnector::default(), false);
        let tree = json!({
            "models": { "main": { "provider": "p", "model": "m" } },
            "session": { "backend": "memory" },
            "platform": { "instance_id": "inst-7" },
        });

        runtime.initialize(ConfigSource::Tree(tree)).await.expect("initialize");

        assert_eq!(runtime.state(), LifecycleState::Ready);
        assert_eq!(runtime.instance_id(), "inst-7");
        let resources = runtime.resources().expect("resources");
        assert_eq!(resources.models.list_names(), vec!["main"]);
    }

    #[tokio::test]
    async fn dispatch_before_initialize_is_not_ready() {
        let runtime = runtime_with(ScriptedConnector::default(), false);

        let error = turn(&runtime, "s1", "hi").await.err().expect("must fail");

        assert!(matches!(error, RuntimeError::NotReady(LifecycleState::Uninitialized)));
        assert_eq!(runtime.metrics().total_requests, 0);
    }

    #[tokio::test]
    async fn second_initialize_is_refused() {
        let runtime = ready_runtime(SessionConcurrency::Queue).await;

        let error = runtime
            .initialize(ConfigSource::Resolved(test_config(&[], SessionConcurrency::Queue)))
            .await
            .err()
            .expect("must fail");

        assert!(matches!(error, RuntimeError::AlreadyInitialized(LifecycleState::Ready)));
        assert!(runtime.is_ready());
    }

    #[tokio::test]
    async fn tool_connect_failure_stops_runtime_and_closes_earlier_servers() {
        let connector = ScriptedConnector { refuse: Some("c".to_string()), ..ScriptedConnector::default() };
        let journal = Arc::clone(&connector.journal);
        let runtime = runtime_with(connector, false);

        let error = runtime
            .initialize(ConfigSource::Resolved(test_config(&["a", "b", "c"], SessionConcurrency::Queue)))
            .await
            .err()
            .expect("must fail");

        assert!(matches!(error, RuntimeError::ToolConnect { ref server, .. } if server == "c"));
        assert_eq!(runtime.state(), LifecycleState::Stopped);
        assert_eq!(*journal.lock().expect("journal"), vec!["connect:a", "connect:b", "close:b", "close:a"]);
    }

    #[tokio::test]
    async fn unknown_provider_fails_initialization() {
        let runtime = runtime_with(ScriptedConnector::default(), false);
        let mut config = test_config(&[], SessionConcurrency::Queue);
        config.models.push(model_config("other", "nope"));

        let error = runtime.initialize(ConfigSource::Resolved(config)).await.err().expect("must fail");

        assert!(matches!(error, RuntimeError::Registry(_)));
        assert_eq!(runtime.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn startup_hook_failure_releases_tools() {
        let connector = ScriptedConnector::default();
        let journal = Arc::clone(&connector.journal);
        let runtime = runtime_with(connector, true);

        let error = runtime
            .initialize(ConfigSource::Resolved(test_config(&["a", "b"], SessionConcurrency::Queue)))
            .await
            .err()
            .expect("must fail");

        assert!(matches!(error, RuntimeError::AppStartup(_)));
        assert_eq!(runtime.state(), LifecycleState::Stopped);
        assert_eq!(
            *journal.lock().expect("journal"),
            vec!["connect:a", "connect:b", "app:startup", "close:b", "close:a"]
        );

        runtime.shutdown().await;
        assert_eq!(runtime.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn shutdown_runs_hook_then_closes_tools_in_reverse() {
        let connector = ScriptedConnector { fail_close: Some("b".to_string()), ..ScriptedConnector::default() };
        let journal = Arc::clone(&connector.journal);
        let runtime = runtime_with(connector, false);
        runtime
            .initialize(ConfigSource::Resolved(test_config(&["a", "b", "c"], SessionConcurrency::Queue)))
            .await
            .expect("initialize");

        runtime.shutdown().await;
        runtime.shutdown().await;

        assert_eq!(runtime.state(), LifecycleState::Stopped);
        assert!(runtime.resources().is_none());
        assert_eq!(
            *journal.lock().expect("journal"),
            vec!["connect:a", "connect:b", "connect:c", "app:startup", "app:shutdown", "close:c", "close:b", "close:a"]
        );
        let error = turn(&runtime, "s1", "hi").await.err().expect("must fail");
        assert!(matches!(error, RuntimeError::NotReady(LifecycleState::Stopped)));
    }

    #[tokio::test]
    async fn shutdown_before_initialize_is_a_no_op() {
        let runtime = runtime_with(ScriptedConnector::default(), false);
        runtime.shutdown().await;
        assert_eq!(runtime.state(), LifecycleState::Uninitialized);
    }

    #[tokio::test]
    async fn app_failure_ends_stream_without_saving() {
        let runtime = ready_runtime(SessionConcurrency::Queue).await;
        let _: Vec<_> = turn(&runtime, "s1", "first").await.expect("dispatch").collect().await;

        let replies: Vec<_> = turn(&runtime, "s1", "fail").await.expect("dispatch").collect().await;

        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].as_ref().expect("partial").text(), "partial");
        assert!(matches!(replies[1], Err(RuntimeError::App(_))));
        assert_eq!(stored_turns(&runtime, "s1").await, Some(1));
        assert_eq!(runtime.metrics().failed_requests, 1);
    }

    #[tokio::test]
    async fn checkpoint_persists_mid_turn() {
        let runtime = ready_runtime(SessionConcurrency::Queue).await;

        let replies: Vec<_> =
            turn(&runtime, "s1", "checkpoint then fail").await.expect("dispatch").collect().await;

        assert!(matches!(replies.last(), Some(Err(RuntimeError::App(_)))));
        assert_eq!(stored_turns(&runtime, "s1").await, Some(1));
    }

    #[tokio::test]
    async fn dropped_stream_discards_mutations_and_releases_session() {
        let runtime = ready_runtime(SessionConcurrency::Reject).await;

        let mut stream = turn(&runtime, "s1", "hello").await.expect("dispatch");
        let first = stream.next().await.expect("first").expect("reply");
        assert_eq!(first.text(), "hello");
        drop(stream);

        assert_eq!(stored_turns(&runtime, "s1").await, None);
        let replies: Vec<_> = turn(&runtime, "s1", "hello").await.expect("dispatch").collect().await;
        assert_eq!(replies.len(), 2);
        assert_eq!(runtime.metrics().active_sessions, 0);
    }

    #[tokio::test]
    async fn reject_policy_reports_busy_session() {
        let runtime = ready_runtime(SessionConcurrency::Reject).await;

        let held = turn(&runtime, "s1", "hello").await.expect("dispatch");
        let error = turn(&runtime, "s1", "hello").await.err().expect("must fail");
        let other = turn(&runtime, "s2", "hello").await;

        assert!(matches!(error, RuntimeError::Store(StoreError::SessionBusy(ref id)) if id == "s1"));
        assert!(other.is_ok());
        assert_eq!(runtime.metrics().active_sessions, 2);
        drop(held);
        drop(other);
        assert_eq!(runtime.metrics().active_sessions, 0);
    }

    #[tokio::test]
    async fn missing_session_fails_unless_allowed() {
        let runtime = ready_runtime(SessionConcurrency::Queue).await;

        let error = runtime
            .dispatch("ghost", Msg::user("hi"), Map::new(), DispatchOptions::default())
            .await
            .err()
            .expect("must fail");

        assert!(matches!(error, RuntimeError::Store(StoreError::NotFound(_))));
        assert_eq!(error.code().as_str(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn shutdown_cancels_held_turn_before_closing_store() {
        let runtime = runtime_with(ScriptedConnector::default(), false);
        let mut config = test_config(&[], SessionConcurrency::Queue);
        config.session.backend = SessionBackendKind::Sqlite;
        config.session.url = "sqlite::memory:".to_string();
        config.server.graceful_shutdown_secs = 1;
        runtime.initialize(ConfigSource::Resolved(config)).await.expect("initialize");

        let mut stream = turn(&runtime, "s1", "hello").await.expect("dispatch");
        let first = stream.next().await.expect("first").expect("reply");
        assert_eq!(first.text(), "hello");

        runtime.shutdown().await;
        assert_eq!(runtime.state(), LifecycleState::Stopped);

        let rest: Vec<_> = stream.collect().await;
        assert_eq!(rest.len(), 1, "no reply may follow shutdown");
        assert!(matches!(rest[0], Err(RuntimeError::NotReady(LifecycleState::ShuttingDown))));
        assert_eq!(runtime.metrics().failed_requests, 1);
        assert_eq!(runtime.metrics().active_sessions, 0);
    }

    #[tokio::test]
    async fn shutdown_waits_for_running_turn_to_unwind() {
        let mut config = test_config(&[], SessionConcurrency::Queue);
        config.server.graceful_shutdown_secs = 30;
        let mut gated = gated_runtime(config).await;

        let running = spawn_turn(&gated.runtime, "s1", "slow");
        assert_eq!(gated.started.recv().await.as_deref(), Some("slow"));

        tokio::time::timeout(Duration::from_secs(5), gated.runtime.shutdown())
            .await
            .expect("shutdown must not wait out the grace period for a cancelled turn");

        let replies = running.await.expect("turn task");
        assert_eq!(replies.len(), 1);
        assert!(replies[0].as_ref().is_err_and(|error| error.contains("shutting_down")));
        assert_eq!(*gated.journal.lock().expect("journal"), vec!["turn:dropped", "app:shutdown"]);
    }

    #[tokio::test]
    async fn concurrent_turns_on_distinct_sessions_stay_isolated() {
        let mut gated = gated_runtime(test_config(&[], SessionConcurrency::Queue)).await;

        let first = spawn_turn(&gated.runtime, "alpha", "from alpha");
        let second = spawn_turn(&gated.runtime, "beta", "from beta");
        let mut started = vec![
            gated.started.recv().await.expect("started"),
            gated.started.recv().await.expect("started"),
        ];
        started.sort();
        assert_eq!(started, vec!["from alpha", "from beta"]);
        assert_eq!(gated.runtime.metrics().active_sessions, 2);

        gated.gate.add_permits(2);

        assert_eq!(first.await.expect("alpha task"), vec![Ok("from alpha turn 1".to_string())]);
        assert_eq!(second.await.expect("beta task"), vec![Ok("from beta turn 1".to_string())]);
        assert_eq!(stored_turns(&gated.runtime, "alpha").await, Some(1));
        assert_eq!(stored_turns(&gated.runtime, "beta").await, Some(1));
        assert_eq!(gated.runtime.metrics().total_requests, 2);
    }

    #[tokio::test]
    async fn queued_turn_loads_state_saved_by_previous_turn() {
        let mut gated = gated_runtime(test_config(&[], SessionConcurrency::Queue)).await;

        let first = spawn_turn(&gated.runtime, "s1", "one");
        assert_eq!(gated.started.recv().await.as_deref(), Some("one"));

        let second = spawn_turn(&gated.runtime, "s1", "two");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(gated.started.try_recv().is_err(), "second turn must wait for the session");
        assert!(!second.is_finished());

        gated.gate.add_permits(2);

        assert_eq!(first.await.expect("first task"), vec![Ok("one turn 1".to_string())]);
        assert_eq!(second.await.expect("second task"), vec![Ok("two turn 2".to_string())]);
        assert_eq!(gated.started.recv().await.as_deref(), Some("two"));
        assert_eq!(stored_turns(&gated.runtime, "s1").await, Some(2));
    }
}
