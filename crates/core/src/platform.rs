use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatStatus {
    Running,
    Degraded,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub active_sessions: usize,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub uptime_secs: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatReport {
    pub instance_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: HeartbeatStatus,
    pub metrics: MetricsSnapshot,
}

/// Action the platform asks this instance to take.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Directive {
    Reload,
    Restart,
}

/// Body of `GET {endpoint}/instances/{id}/config`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    #[serde(default)]
    pub updated: bool,
    #[serde(default)]
    pub action: Option<String>,
}

impl ConfigUpdate {
    /// The directive to act on, if any. Unknown actions and stale responses yield `None`.
    pub fn directive(&self) -> Option<Directive> {
        if !self.updated {
            return None;
        }

        match self.action.as_deref().map(str::trim) {
            Some(action) if action.eq_ignore_ascii_case("restart") => Some(Directive::Restart),
            Some(action) if action.eq_ignore_ascii_case("reload") => Some(Directive::Reload),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub instance_id: String,
    pub uptime: u64,
}
