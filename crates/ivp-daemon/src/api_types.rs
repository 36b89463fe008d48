//! Request and response types for all ivp-daemon HTTP endpoints.
//!
//! These types are `Serialize` so they can be JSON-encoded by Axum and
//! decoded by tests. No business logic lives here.

use ivp_metrics::MetricsSnapshot;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
}

/// Per-status row of `ivp_claimstore::counts_by_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimStatusCount {
    pub status: String,
    pub count: i64,
}

/// Point-in-time snapshot returned by `GET /v1/status`: the in-process
/// metrics counters plus the authoritative claim-store counts by status,
/// so an operator can cross-check the two without tailing the metrics sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub daemon_uptime_secs: u64,
    pub metrics: MetricsSnapshot,
    pub claims_by_status: Vec<ClaimStatusCount>,
}
