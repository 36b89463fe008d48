//! `ivp poll-once`: runs a single inbox poll cycle end to end.

use crate::backends::{FilesystemInbox, JsonlLedger};
use anyhow::{Context, Result};
use ivp_config::Settings;
use ivp_metrics::{MetricsCollector, MetricsSnapshot};
use ivp_pipeline::{InboxSource, Pipeline, PipelineConfig, StorageSink};
use std::sync::Arc;

pub async fn run(settings: &Settings) -> Result<MetricsSnapshot> {
    let claim_pool = ivp_claimstore::connect(&settings.claim_db_path).await.context("connect to claim store")?;
    ivp_claimstore::migrate(&claim_pool).await.context("migrate claim store")?;

    let rules = super::load_rules(settings)?;

    let inbox: Arc<dyn InboxSource> = Arc::new(FilesystemInbox::new(&settings.inbox_dir, &settings.inbox_archive_dir, settings.allowed_mime_types.clone()));
    let storage: Arc<dyn StorageSink> = Arc::new(JsonlLedger::new(&settings.ledger_path));

    let pipeline = Pipeline {
        config: PipelineConfig {
            worker_id: settings.worker_id.clone(),
            tmp_dir: settings.tmp_dir.clone().into(),
            extraction_model: settings.extraction_model.clone(),
            extraction_provider: settings.extraction_provider.clone(),
            extraction_provider_order: settings.extraction_provider_order.clone(),
            review_confidence_threshold: settings.review_confidence_threshold,
            store_review_score_threshold: settings.store_review_score_threshold,
        },
        claim_pool,
        inbox,
        storage,
        rules,
        dead_letter: ivp_audit::DeadLetterLog::new(&settings.dead_letter_path).context("open dead-letter log")?,
        review_queue: ivp_review::ReviewQueue::new(&settings.review_queue_dir).context("open review queue")?,
        metrics: Arc::new(MetricsCollector::new()),
        explicit_vision_client: None,
    };

    pipeline.run_once(std::path::Path::new(&settings.metrics_path)).await.context("run poll cycle")
}
