//! Per-document driver: download -> claim -> extract ->
//! normalize -> validate -> route -> store -> archive. A single document's
//! failure never terminates the poll cycle.

use crate::contracts::{InboxCandidate, InboxSource, StorageSink};
use crate::hash::sha256_file;
use anyhow::{Context, Result};
use chrono::Utc;
use ivp_claimstore::SqlitePool;
use ivp_extract::VisionClient;
use ivp_normalize::NormalizationRules;
use ivp_schemas::{ClaimOutcome, ClaimStatus, DeadLetterEntry, LedgerRecord};
use ivp_validate::ValidationOutcome;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

pub struct PipelineConfig {
    pub worker_id: String,
    pub tmp_dir: PathBuf,
    pub extraction_model: String,
    pub extraction_provider: String,
    pub extraction_provider_order: Vec<String>,
    pub review_confidence_threshold: f64,
    pub store_review_score_threshold: f64,
}

pub struct Pipeline {
    pub config: PipelineConfig,
    pub claim_pool: SqlitePool,
    pub inbox: Arc<dyn InboxSource>,
    pub storage: Arc<dyn StorageSink>,
    pub rules: NormalizationRules,
    pub dead_letter: ivp_audit::DeadLetterLog,
    pub review_queue: ivp_review::ReviewQueue,
    pub metrics: Arc<ivp_metrics::MetricsCollector>,
    pub explicit_vision_client: Option<Arc<dyn VisionClient>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentOutcome {
    Stored,
    ReviewRequired,
    DuplicateSkipped,
    Failed { code: String },
}

impl Pipeline {
    /// Validates `from -> to` against the state machine before persisting it.
    /// A rejection here is a programmer error (see `ivp_statemachine::transition`),
    /// not a runtime condition the caller should route around.
    async fn mark(
        &self,
        candidate: &InboxCandidate,
        content_hash: &str,
        from: ClaimStatus,
        to: ClaimStatus,
    ) -> Result<()> {
        ivp_statemachine::transition(from, to).with_context(|| format!("illegal status transition for {}", candidate.id))?;
        ivp_claimstore::mark_status(&self.claim_pool, &candidate.id, content_hash, to)
            .await
            .with_context(|| format!("mark {to} for {}", candidate.id))
    }

    /// Runs one full poll cycle: lists the inbox, processes each candidate,
    /// emits a metrics snapshot on completion. Never propagates a single
    /// document's error out of the cycle.
    pub async fn run_once(&self, metrics_path: &std::path::Path) -> Result<ivp_metrics::MetricsSnapshot> {
        let candidates = self.inbox.list_inbox().await.context("list inbox")?;
        for candidate in candidates {
            self.metrics.record_processed();
            match self.process_one(&candidate).await {
                Ok(outcome) => self.record_outcome(&outcome),
                Err(e) => {
                    tracing::error!(source_id = %candidate.id, error = %e, "pipeline_error processing candidate");
                    self.metrics.record_failed();
                }
            }
        }
        self.metrics.emit(metrics_path)
    }

    fn record_outcome(&self, outcome: &DocumentOutcome) {
        match outcome {
            DocumentOutcome::Stored => self.metrics.record_stored(),
            DocumentOutcome::ReviewRequired => self.metrics.record_review_required(),
            DocumentOutcome::DuplicateSkipped => self.metrics.record_duplicate_skipped(),
            DocumentOutcome::Failed { .. } => self.metrics.record_failed(),
        }
    }

    /// Processes one candidate end to end. The local download file is
    /// deleted on every exit path.
    pub async fn process_one(&self, candidate: &InboxCandidate) -> Result<DocumentOutcome> {
        let started = std::time::Instant::now();
        let local_path = self.config.tmp_dir.join(format!("{}_{}", Uuid::new_v4(), candidate.name));
        tokio::fs::create_dir_all(&self.config.tmp_dir).await.context("create tmp dir")?;

        let result = self.process_downloaded(candidate, &local_path).await;

        let _ = tokio::fs::remove_file(&local_path).await;
        self.metrics.sample_pipeline_latency(started.elapsed().as_secs_f64() * 1000.0);
        result
    }

    async fn process_downloaded(
        &self,
        candidate: &InboxCandidate,
        local_path: &std::path::Path,
    ) -> Result<DocumentOutcome> {
        self.inbox
            .download(&candidate.id, local_path)
            .await
            .with_context(|| format!("download candidate {}", candidate.id))?;

        let content_hash = sha256_file(local_path).await.context("hash downloaded file")?;

        let claim = ivp_claimstore::claim(&self.claim_pool, &candidate.id, &content_hash, &self.config.worker_id)
            .await
            .context("claim document")?;

        if claim.status != ClaimOutcome::Claimed {
            return Ok(DocumentOutcome::DuplicateSkipped);
        }

        let document_id = Uuid::new_v4();
        let outcome = self.run_claimed(candidate, local_path, &content_hash, document_id).await;

        match &outcome {
            Ok(_) => {}
            Err(e) => {
                self.dead_letter
                    .write_failure(&DeadLetterEntry {
                        recorded_at: Utc::now(),
                        document_id,
                        source_id: candidate.id.clone(),
                        content_hash: content_hash.clone(),
                        status: ClaimStatus::Failed.as_str().to_string(),
                        error_code: "pipeline_error".to_string(),
                        error_message: format!("{e:#}"),
                        used_provider: None,
                    })
                    .context("write dead-letter entry")?;
                // the claim's current status varies by where run_claimed failed;
                // FAILED is reachable from every non-terminal state so this is
                // always a legal transition regardless of which step raised.
                ivp_claimstore::mark_status(&self.claim_pool, &candidate.id, &content_hash, ClaimStatus::Failed)
                    .await
                    .context("mark FAILED after pipeline error")?;
            }
        }

        outcome
    }

    async fn run_claimed(
        &self,
        candidate: &InboxCandidate,
        local_path: &std::path::Path,
        content_hash: &str,
        document_id: Uuid,
    ) -> Result<DocumentOutcome> {
        let extraction_started = std::time::Instant::now();
        let extraction = ivp_extract::extract(
            local_path,
            &self.config.extraction_model,
            &self.config.extraction_provider,
            &self.config.extraction_provider_order,
            self.explicit_vision_client.clone(),
        )
        .await;
        self.metrics.sample_extraction_latency(extraction_started.elapsed().as_secs_f64() * 1000.0);

        let raw_fields = match extraction {
            Ok(fields) => fields,
            Err(e) => {
                self.dead_letter
                    .write_failure(&DeadLetterEntry {
                        recorded_at: Utc::now(),
                        document_id,
                        source_id: candidate.id.clone(),
                        content_hash: content_hash.to_string(),
                        status: ClaimStatus::Failed.as_str().to_string(),
                        error_code: e.code.as_str().to_string(),
                        error_message: e.message.clone(),
                        used_provider: None,
                    })
                    .context("write dead-letter entry for extraction failure")?;
                self.mark(candidate, content_hash, ClaimStatus::Claimed, ClaimStatus::Failed).await?;
                return Ok(DocumentOutcome::Failed { code: e.code.as_str().to_string() });
            }
        };
        self.mark(candidate, content_hash, ClaimStatus::Claimed, ClaimStatus::Extracted).await?;

        let used_provider = raw_fields.get("_provider").and_then(|v| v.as_str()).map(str::to_string);
        let payload = ivp_schemas::ExtractionPayload {
            fields: raw_fields.clone(),
            _ocr_text: raw_fields.get("_ocr_text").and_then(|v| v.as_str()).map(str::to_string),
            _provider: used_provider.clone(),
        };
        let normalized = ivp_normalize::coerce(&payload, &self.rules);

        match ivp_validate::validate_and_score(&normalized, self.rules.amount_tolerance) {
            ValidationOutcome::SchemaInvalid { message } => {
                self.route_to_review(
                    candidate,
                    local_path,
                    content_hash,
                    document_id,
                    ClaimStatus::Extracted,
                    vec!["schema_validation_failed".to_string()],
                    Some(message),
                )
                .await
            }
            ValidationOutcome::Validated(validated) => {
                self.mark(candidate, content_hash, ClaimStatus::Extracted, ClaimStatus::Validated).await?;

                let decision = ivp_routing::decide(
                    validated.is_valid,
                    validated.record.model_confidence,
                    self.config.review_confidence_threshold,
                );

                match decision.status {
                    ivp_routing::RouteStatus::ReviewRequired => {
                        self.route_to_review(
                            candidate,
                            local_path,
                            content_hash,
                            document_id,
                            ClaimStatus::Validated,
                            decision.reason_codes,
                            None,
                        )
                        .await
                    }
                    ivp_routing::RouteStatus::Validated => {
                        let needs_review = validated.validation_score < self.config.store_review_score_threshold;
                        let ledger_record = LedgerRecord {
                            record: validated.record,
                            document_id,
                            source_id: candidate.id.clone(),
                            content_hash: content_hash.to_string(),
                            used_provider,
                            needs_review,
                        };
                        self.storage.append(&ledger_record).await.context("append to storage sink")?;
                        self.mark(candidate, content_hash, ClaimStatus::Validated, ClaimStatus::Stored).await?;

                        let _ = self.inbox.move_to_archive(&candidate.id).await.unwrap_or(None);
                        self.mark(candidate, content_hash, ClaimStatus::Stored, ClaimStatus::Archived).await?;

                        Ok(DocumentOutcome::Stored)
                    }
                }
            }
        }
    }

    async fn route_to_review(
        &self,
        candidate: &InboxCandidate,
        local_path: &std::path::Path,
        content_hash: &str,
        document_id: Uuid,
        from: ClaimStatus,
        reason_codes: Vec<String>,
        schema_error_message: Option<String>,
    ) -> Result<DocumentOutcome> {
        self.review_queue
            .enqueue(document_id, reason_codes.clone(), Some(local_path), None)
            .context("enqueue review record")?;

        self.dead_letter
            .write_failure(&DeadLetterEntry {
                recorded_at: Utc::now(),
                document_id,
                source_id: candidate.id.clone(),
                content_hash: content_hash.to_string(),
                status: ClaimStatus::ReviewRequired.as_str().to_string(),
                error_code: reason_codes.first().cloned().unwrap_or_default(),
                error_message: schema_error_message.unwrap_or_else(|| reason_codes.join(",")),
                used_provider: None,
            })
            .context("write dead-letter entry for review routing")?;

        self.mark(candidate, content_hash, from, ClaimStatus::ReviewRequired).await?;

        Ok(DocumentOutcome::ReviewRequired)
    }
}
