use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};

use agenthost_agent::AgentRuntime;
use agenthost_core::platform::HealthResponse;

/// `GET /health`: `200 healthy` while the runtime is ready, `503 unhealthy` otherwise.
pub async fn health(State(runtime): State<Arc<AgentRuntime>>) -> (StatusCode, Json<HealthResponse>) {
    let ready = runtime.is_ready();

    let payload = HealthResponse {
        status: if ready { "healthy" } else { "unhealthy" }.to_string(),
        instance_id: runtime.instance_id(),
        uptime: runtime.uptime().as_secs(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}
