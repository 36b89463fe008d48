//! `ivp replay`: re-enqueues dead-lettered entries matching a status.

use anyhow::{Context, Result};
use ivp_config::Settings;
use ivp_replay::ReplaySummary;

pub async fn run(settings: &Settings, status: &str) -> Result<ReplaySummary> {
    ivp_replay::replay(
        status,
        std::path::Path::new(&settings.dead_letter_path),
        std::path::Path::new(&settings.replay_audit_path),
        &settings.claim_db_path,
        &settings.worker_id,
    )
    .await
    .context("replay dead-letter entries")
}
