use std::future::{Future, IntoFuture};
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use agenthost_agent::{AgentRuntime, ConfigSource, RuntimeError};
use agenthost_core::config::RuntimeConfig;

use crate::platform::{self, PlatformClient, PlatformError, ProcessTerminator};
use crate::{health, invoke};

pub struct Application {
    pub config: RuntimeConfig,
    pub runtime: Arc<AgentRuntime>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("failed to bind {address}: {source}")]
    Bind { address: String, source: std::io::Error },
    #[error("http server failed: {0}")]
    Serve(#[source] std::io::Error),
    #[error(transparent)]
    Platform(#[from] PlatformError),
}

pub fn router(runtime: Arc<AgentRuntime>) -> Router {
    Router::new()
        .route("/invoke", post(invoke::invoke))
        .route("/health", get(health::health))
        .with_state(runtime)
}

/// Initializes the runtime from an already loaded configuration.
pub async fn bootstrap(
    config: RuntimeConfig,
    runtime: AgentRuntime,
) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        models = config.models.len(),
        tool_servers = config.tool_servers.len(),
        session_backend = config.session.backend.as_str(),
        "starting application bootstrap"
    );

    runtime.initialize(ConfigSource::Resolved(config.clone())).await?;
    info!(
        event_name = "system.bootstrap.runtime_ready",
        correlation_id = "bootstrap",
        instance_id = %runtime.instance_id(),
        "runtime initialized"
    );

    Ok(Application { config, runtime: Arc::new(runtime) })
}

/// Serves HTTP until `shutdown` resolves, then stops the platform loop and the runtime.
///
/// Open streams get `server.graceful_shutdown_secs` to finish before they are dropped.
pub async fn serve<F>(app: Application, shutdown: F) -> Result<(), BootstrapError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = match tokio::net::TcpListener::bind(&address).await {
        Ok(listener) => listener,
        Err(source) => {
            app.runtime.shutdown().await;
            return Err(BootstrapError::Bind { address, source });
        }
    };

    let platform = match PlatformClient::from_config(&app.config.platform) {
        Ok(Some(client)) => Some(platform::spawn(
            client,
            Arc::clone(&app.runtime),
            Duration::from_secs(app.config.platform.heartbeat_interval_secs.max(1)),
            Arc::new(ProcessTerminator),
        )),
        Ok(None) => {
            info!(
                event_name = "system.platform.disabled",
                correlation_id = "bootstrap",
                "platform endpoint or instance id not configured, heartbeat disabled"
            );
            None
        }
        Err(error) => {
            app.runtime.shutdown().await;
            return Err(error.into());
        }
    };

    info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bind_address = %address,
        "agenthost-server started"
    );

    let stopping = CancellationToken::new();
    let trigger = stopping.clone();
    tokio::spawn(async move {
        shutdown.await;
        trigger.cancel();
    });

    let graceful = stopping.clone();
    let server = axum::serve(listener, router(Arc::clone(&app.runtime)))
        .with_graceful_shutdown(async move { graceful.cancelled().await })
        .into_future();
    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);

    let served = tokio::select! {
        served = server => served,
        _ = async {
            stopping.cancelled().await;
            tokio::time::sleep(grace).await;
        } => {
            warn!(
                event_name = "system.server.drain_timeout",
                correlation_id = "shutdown",
                grace_secs = grace.as_secs(),
                "open connections did not finish in time and were dropped"
            );
            Ok(())
        }
    };

    info!(event_name = "system.server.stopping", correlation_id = "shutdown", "agenthost-server stopping");
    if let Some(platform) = platform {
        platform.stop().await;
    }
    app.runtime.shutdown().await;

    served.map_err(BootstrapError::Serve)
}
