//! Heartbeat and configuration reconciliation against the control platform.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use agenthost_agent::AgentRuntime;
use agenthost_core::config::PlatformConfig;
use agenthost_core::platform::{
    ConfigUpdate, Directive, HeartbeatReport, HeartbeatStatus, MetricsSnapshot,
};

/// Exit code asking the supervisor to start a fresh instance.
pub const RESTART_EXIT_CODE: i32 = 3;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("platform request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("platform returned HTTP {status} for {url}")]
    Status { url: String, status: u16 },
}

/// Acts on a directive received from the platform.
pub trait Terminator: Send + Sync {
    fn terminate(&self, directive: Directive);
}

/// Exits the process with [`RESTART_EXIT_CODE`].
pub struct ProcessTerminator;

impl Terminator for ProcessTerminator {
    fn terminate(&self, directive: Directive) {
        warn!(
            event_name = "platform.directive.exit",
            correlation_id = "platform",
            directive = ?directive,
            exit_code = RESTART_EXIT_CODE,
            "configuration changed, exiting so the supervisor restarts this instance"
        );
        std::process::exit(RESTART_EXIT_CODE);
    }
}

pub struct PlatformClient {
    http: reqwest::Client,
    endpoint: String,
    instance_id: String,
}

impl PlatformClient {
    pub fn new(
        endpoint: &str,
        instance_id: &str,
        request_timeout: Duration,
    ) -> Result<Self, PlatformError> {
        Ok(Self {
            http: reqwest::Client::builder().timeout(request_timeout).build()?,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            instance_id: instance_id.to_string(),
        })
    }

    /// `None` unless both the endpoint and the instance id are configured.
    pub fn from_config(config: &PlatformConfig) -> Result<Option<Self>, PlatformError> {
        match (&config.endpoint, &config.instance_id) {
            (Some(endpoint), Some(instance_id)) if config.enabled() => Ok(Some(Self::new(
                endpoint,
                instance_id,
                Duration::from_secs(config.request_timeout_secs.max(1)),
            )?)),
            _ => Ok(None),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn url(&self, leaf: &str) -> String {
        format!("{}/instances/{}/{leaf}", self.endpoint, self.instance_id)
    }

    pub async fn send_heartbeat(&self, report: &HeartbeatReport) -> Result<(), PlatformError> {
        let url = self.url("heartbeat");
        let response = self.http.post(&url).json(report).send().await?;
        if !response.status().is_success() {
            return Err(PlatformError::Status { url, status: response.status().as_u16() });
        }
        Ok(())
    }

    pub async fn check_config(&self) -> Result<ConfigUpdate, PlatformError> {
        let url = self.url("config");
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(PlatformError::Status { url, status: response.status().as_u16() });
        }
        Ok(response.json().await?)
    }
}

/// `degraded` when requests failed since the previous report.
pub fn heartbeat_status(metrics: &MetricsSnapshot, previously_failed: u64) -> HeartbeatStatus {
    if metrics.failed_requests > previously_failed {
        HeartbeatStatus::Degraded
    } else {
        HeartbeatStatus::Running
    }
}

struct Reconciler {
    client: PlatformClient,
    runtime: Arc<AgentRuntime>,
    reported_failures: u64,
}

impl Reconciler {
    async fn tick(&mut self) -> Option<Directive> {
        let metrics = self.runtime.metrics();
        let report = HeartbeatReport {
            instance_id: self.client.instance_id().to_string(),
            timestamp: Utc::now(),
            status: heartbeat_status(&metrics, self.reported_failures),
            metrics,
        };

        match self.client.send_heartbeat(&report).await {
            Ok(()) => {
                self.reported_failures = metrics.failed_requests;
                debug!(
                    event_name = "platform.heartbeat.sent",
                    status = ?report.status,
                    active_sessions = metrics.active_sessions,
                    "heartbeat sent"
                );
            }
            Err(error) => warn!(
                event_name = "platform.heartbeat.failed",
                correlation_id = "platform",
                error = %error,
                "failed to send heartbeat"
            ),
        }

        match self.client.check_config().await {
            Ok(update) => update.directive(),
            Err(error) => {
                warn!(
                    event_name = "platform.config.failed",
                    correlation_id = "platform",
                    error = %error,
                    "failed to check for configuration updates"
                );
                None
            }
        }
    }
}

pub struct PlatformHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PlatformHandle {
    /// Cancels the loop and waits for it to finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(error) = self.task.await {
            warn!(event_name = "platform.loop.join_failed", error = %error, "platform loop ended abnormally");
        }
        info!(event_name = "platform.loop.stopped", correlation_id = "platform", "platform heartbeat stopped");
    }
}

/// Starts the reconciliation loop. The first heartbeat is sent immediately.
pub fn spawn(
    client: PlatformClient,
    runtime: Arc<AgentRuntime>,
    interval: Duration,
    terminator: Arc<dyn Terminator>,
) -> PlatformHandle {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    info!(
        event_name = "platform.loop.started",
        correlation_id = "platform",
        instance_id = %client.instance_id(),
        interval_secs = interval.as_secs(),
        "starting platform heartbeat"
    );

    let task = tokio::spawn(async move {
        let mut reconciler = Reconciler { client, runtime, reported_failures: 0 };
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = timer.tick() => {}
            }

            let directive = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                directive = reconciler.tick() => directive,
            };

            if let Some(directive) = directive {
                info!(
                    event_name = "platform.directive.received",
                    correlation_id = "platform",
                    directive = ?directive,
                    "platform requested a configuration change"
                );
                terminator.terminate(directive);
                break;
            }
        }
    });

    PlatformHandle { cancel, task }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use agenthost_agent::mcp::McpConnector;
    use agenthost_agent::{AgentApp, AgentRuntime, ProviderTable, Resources};
    use agenthost_core::config::PlatformConfig;
    use agenthost_core::platform::{Directive, HeartbeatStatus, MetricsSnapshot};

    use super::{heartbeat_status, spawn, PlatformClient, Terminator};

    struct ChannelTerminator(mpsc::UnboundedSender<Directive>);

    impl Terminator for ChannelTerminator {
        fn terminate(&self, directive: Directive) {
            let _ = self.0.send(directive);
        }
    }

    fn idle_runtime() -> Arc<AgentRuntime> {
        let factory = |_: &Resources| -> anyhow::Result<Arc<dyn AgentApp>> { anyhow::bail!("not started") };
        Arc::new(AgentRuntime::new(factory, ProviderTable::empty(), Arc::new(McpConnector::default())))
    }

    fn client(server: &MockServer) -> PlatformClient {
        PlatformClient::new(&server.uri(), "inst-1", Duration::from_secs(2)).expect("client")
    }

    #[tokio::test]
    async fn restart_directive_reaches_terminator() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/instances/inst-1/heartbeat"))
            .and(body_partial_json(json!({ "instance_id": "inst-1", "status": "running" })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1..)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/instances/inst-1/config"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "updated": true, "action": "restart" })),
            )
            .mount(&server)
            .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle =
            spawn(client(&server), idle_runtime(), Duration::from_secs(3600), Arc::new(ChannelTerminator(tx)));

        let directive = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("directive in time")
            .expect("directive");
        assert_eq!(directive, Directive::Restart);
        handle.stop().await;
    }

    #[tokio::test]
    async fn failures_do_not_stop_the_loop() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/instances/inst-1/heartbeat"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/instances/inst-1/config"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle =
            spawn(client(&server), idle_runtime(), Duration::from_millis(20), Arc::new(ChannelTerminator(tx)));
        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.stop().await;

        let requests = server.received_requests().await.expect("recording enabled");
        let heartbeats = requests.iter().filter(|request| request.url.path().ends_with("/heartbeat")).count();
        assert!(heartbeats >= 3, "expected repeated heartbeats, saw {heartbeats}");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stale_or_unknown_actions_are_ignored() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "updated": false, "action": "restart" })))
            .mount(&server)
            .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle =
            spawn(client(&server), idle_runtime(), Duration::from_millis(20), Arc::new(ChannelTerminator(tx)));
        tokio::time::sleep(Duration::from_millis(150)).await;
        handle.stop().await;

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stop_returns_promptly_between_ticks() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&server).await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "updated": false })))
            .mount(&server)
            .await;

        let (tx, _rx) = mpsc::unbounded_channel();
        let handle =
            spawn(client(&server), idle_runtime(), Duration::from_secs(3600), Arc::new(ChannelTerminator(tx)));
        tokio::time::sleep(Duration::from_millis(100)).await;

        tokio::time::timeout(Duration::from_secs(2), handle.stop()).await.expect("stopped in time");
    }

    #[test]
    fn status_degrades_only_on_new_failures() {
        let metrics = MetricsSnapshot { failed_requests: 4, ..MetricsSnapshot::default() };

        assert_eq!(heartbeat_status(&metrics, 4), HeartbeatStatus::Running);
        assert_eq!(heartbeat_status(&metrics, 3), HeartbeatStatus::Degraded);
    }

    #[test]
    fn client_requires_endpoint_and_instance_id() {
        let mut config = PlatformConfig {
            endpoint: Some("http://platform.local".to_string()),
            instance_id: None,
            heartbeat_interval_secs: 30,
            request_timeout_secs: 10,
        };
        assert!(PlatformClient::from_config(&config).expect("config").is_none());

        config.instance_id = Some("inst-1".to_string());
        let client = PlatformClient::from_config(&config).expect("config").expect("enabled");
        assert_eq!(client.url("heartbeat"), "http://platform.local/instances/inst-1/heartbeat");
    }
}
