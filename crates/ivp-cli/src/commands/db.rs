//! `ivp db status` / `ivp db migrate`: ambient claim-store maintenance.

use anyhow::{Context, Result};
use ivp_config::Settings;

pub struct DbStatus {
    pub claim_db_path: String,
    pub claims_by_status: Vec<(String, i64)>,
}

pub async fn status(settings: &Settings) -> Result<DbStatus> {
    let pool = ivp_claimstore::connect(&settings.claim_db_path).await.context("connect to claim store")?;
    let claims_by_status = ivp_claimstore::counts_by_status(&pool).await.context("read claim counts")?;
    Ok(DbStatus { claim_db_path: settings.claim_db_path.clone(), claims_by_status })
}

pub async fn migrate(settings: &Settings) -> Result<()> {
    let pool = ivp_claimstore::connect(&settings.claim_db_path).await.context("connect to claim store")?;
    ivp_claimstore::migrate(&pool).await.context("run claim store migrations")
}
