use agenthost_agent::mcp::McpConnector;
use agenthost_agent::tools::ToolConnector;
use agenthost_agent::ProviderTable;
use agenthost_core::config::{LoadOptions, RuntimeConfig, ToolServerConfig};
use agenthost_db::SessionStore;
use serde::Serialize;

use crate::commands::{escape_json, CommandResult, CONFIG_FAILURE_EXIT_CODE};

/// Exit code when the config loads but a later readiness check fails.
pub const CHECK_FAILURE_EXIT_CODE: u8 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

impl DoctorCheck {
    fn pass(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Pass, details: details.into() }
    }

    fn fail(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Fail, details: details.into() }
    }

    fn skipped(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Skipped, details: details.into() }
    }
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

const CHECK_NAMES: [&str; 4] = ["model_providers", "session_backend", "tool_servers", "platform"];

pub fn run(options: LoadOptions, json_output: bool) -> CommandResult {
    let (report, config_loaded) = build_report(options);

    let exit_code = match (report.overall_status, config_loaded) {
        (CheckStatus::Fail, false) => CONFIG_FAILURE_EXIT_CODE,
        (CheckStatus::Fail, true) => CHECK_FAILURE_EXIT_CODE,
        _ => 0,
    };

    let output = if json_output {
        serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        })
    } else {
        render_human(&report)
    };

    CommandResult { exit_code, output }
}

fn build_report(options: LoadOptions) -> (DoctorReport, bool) {
    let mut checks = Vec::new();

    let config_loaded = match RuntimeConfig::load(options) {
        Ok(config) => {
            checks.push(DoctorCheck::pass("config_validation", "configuration loaded and validated"));
            checks.push(check_model_providers(&config));
            checks.extend(run_async_checks(&config));
            checks.push(check_platform(&config));
            true
        }
        Err(error) => {
            checks.push(DoctorCheck::fail("config_validation", error.to_string()));
            for name in CHECK_NAMES {
                checks.push(DoctorCheck::skipped(name, "skipped because configuration did not load"));
            }
            false
        }
    };

    let any_failed = checks.iter().any(|check| check.status == CheckStatus::Fail);
    let overall_status = if any_failed { CheckStatus::Fail } else { CheckStatus::Pass };
    let summary = if any_failed {
        "doctor: one or more readiness checks failed".to_string()
    } else {
        "doctor: all readiness checks passed".to_string()
    };

    (DoctorReport { overall_status, summary, checks }, config_loaded)
}

fn check_model_providers(config: &RuntimeConfig) -> DoctorCheck {
    const NAME: &str = "model_providers";

    if config.models.is_empty() {
        return DoctorCheck::skipped(NAME, "no models configured");
    }

    let table = ProviderTable::builtin();
    let mut problems = Vec::new();
    for model in &config.models {
        if let Err(error) = table.construct(model) {
            problems.push(error.to_string());
        }
    }

    if problems.is_empty() {
        let names: Vec<_> = config
            .models
            .iter()
            .map(|model| format!("{} ({})", model.name, model.provider))
            .collect();
        DoctorCheck::pass(NAME, format!("clients constructed for {}", names.join(", ")))
    } else {
        DoctorCheck::fail(NAME, problems.join("; "))
    }
}

fn run_async_checks(config: &RuntimeConfig) -> Vec<DoctorCheck> {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            let details = format!("failed to initialize async runtime: {error}");
            return vec![
                DoctorCheck::fail("session_backend", details.clone()),
                DoctorCheck::fail("tool_servers", details),
            ];
        }
    };

    runtime.block_on(async {
        vec![check_session_backend(config).await, check_tool_servers(config).await]
    })
}

async fn check_session_backend(config: &RuntimeConfig) -> DoctorCheck {
    const NAME: &str = "session_backend";
    let backend = config.session.backend.as_str();

    let store = match SessionStore::open(&config.session).await {
        Ok(store) => store,
        Err(error) => return DoctorCheck::fail(NAME, format!("failed to open `{backend}` backend: {error}")),
    };

    let lookup = store.exists("agenthost-doctor-check").await;
    let closed = store.close().await;

    match lookup.and(closed) {
        Ok(_) => DoctorCheck::pass(NAME, format!("`{backend}` backend is reachable")),
        Err(error) => DoctorCheck::fail(NAME, format!("`{backend}` backend lookup failed: {error}")),
    }
}

async fn check_tool_servers(config: &RuntimeConfig) -> DoctorCheck {
    const NAME: &str = "tool_servers";

    if config.tool_servers.is_empty() {
        return DoctorCheck::skipped(NAME, "no tool servers configured");
    }

    let connector = McpConnector::default();
    let mut reached = Vec::new();
    let mut problems = Vec::new();

    for server in &config.tool_servers {
        match count_server_tools(&connector, server).await {
            Ok(tools) => reached.push(format!("{} ({tools} tools)", server.name)),
            Err(error) => problems.push(format!("{}: {error}", server.name)),
        }
    }

    if problems.is_empty() {
        DoctorCheck::pass(NAME, format!("listed tools from {}", reached.join(", ")))
    } else {
        DoctorCheck::fail(NAME, problems.join("; "))
    }
}

async fn count_server_tools(
    connector: &McpConnector,
    server: &ToolServerConfig,
) -> Result<usize, String> {
    let client = connector.connect(server).await.map_err(|error| error.to_string())?;
    let listed = client.list_tools().await.map(|tools| tools.len());
    let closed = client.close().await;
    listed.and_then(|count| closed.map(|()| count)).map_err(|error| error.to_string())
}

fn check_platform(config: &RuntimeConfig) -> DoctorCheck {
    const NAME: &str = "platform";

    match (&config.platform.endpoint, &config.platform.instance_id) {
        (Some(endpoint), Some(instance_id)) => DoctorCheck::pass(
            NAME,
            format!(
                "heartbeats go to `{endpoint}` as `{instance_id}` every {}s",
                config.platform.heartbeat_interval_secs
            ),
        ),
        (Some(_), None) => DoctorCheck::skipped(NAME, "endpoint set without an instance id, heartbeat disabled"),
        _ => DoctorCheck::skipped(NAME, "no platform endpoint configured"),
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}
