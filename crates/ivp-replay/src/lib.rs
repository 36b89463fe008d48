//! Replay engine: re-enqueues dead-lettered entries filtered by
//! status, skipping anything already terminally processed or structurally
//! malformed. Every per-entry decision is appended to the audit trail.

use anyhow::{Context, Result};
use ivp_audit::AuditWriter;
use ivp_claimstore::SqlitePool;
use ivp_schemas::ClaimOutcome;
use serde_json::Value;
use std::fs;
use std::path::Path;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub queued: usize,
    pub skipped_processed: usize,
    pub skipped_invalid: usize,
}

/// One line from the dead-letter log, read loosely so missing/malformed
/// required fields surface as `skipped_invalid` rather than a hard error.
fn required_fields(entry: &Value) -> Option<(String, String, Uuid)> {
    let source_id = entry.get("source_id")?.as_str()?.to_string();
    let content_hash = entry.get("content_hash")?.as_str()?.to_string();
    let document_id = entry.get("document_id")?.as_str().and_then(|s| Uuid::parse_str(s).ok())?;
    Some((source_id, content_hash, document_id))
}

fn read_lines_filtered_by_status(dead_letter_path: &Path, status: &str) -> Result<Vec<Value>> {
    if !dead_letter_path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(dead_letter_path)
        .with_context(|| format!("read dead-letter log {dead_letter_path:?}"))?;
    let mut out = Vec::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(trimmed).with_context(|| "parse dead-letter line as json")?;
        if value.get("status").and_then(|s| s.as_str()) == Some(status) {
            out.push(value);
        }
    }
    Ok(out)
}

/// Replays every dead-letter entry with the given `status` against an
/// already-open claim store pool and audit writer. This is the core logic;
/// `replay` below is the path-based convenience wrapper matching the documented
/// signature.
pub async fn replay_entries(
    entries: Vec<Value>,
    pool: &SqlitePool,
    audit: &mut AuditWriter,
    owner_id: &str,
) -> Result<ReplaySummary> {
    let mut summary = ReplaySummary::default();

    for entry in entries {
        let Some((source_id, content_hash, document_id)) = required_fields(&entry) else {
            summary.skipped_invalid += 1;
            audit
                .append("replay", "skipped_invalid", entry.clone())
                .context("append skipped_invalid audit line")?;
            continue;
        };

        let claim_result = ivp_claimstore::claim(pool, &source_id, &content_hash, owner_id)
            .await
            .with_context(|| format!("claim during replay for {source_id}"))?;

        let event = serde_json::json!({
            "document_id": document_id,
            "source_id": source_id,
            "content_hash": content_hash,
        });

        if claim_result.status == ClaimOutcome::AlreadyProcessed {
            summary.skipped_processed += 1;
            audit.append("replay", "skipped_processed", event).context("append skipped_processed audit line")?;
        } else {
            summary.queued += 1;
            audit.append("replay", "queued_for_replay", event).context("append queued_for_replay audit line")?;
        }
    }

    Ok(summary)
}

/// Reads the dead-letter log at `dead_letter_path` filtered by `status`,
/// opens the claim store at `claim_db_path` and the audit trail at
/// `audit_path`, and replays every eligible entry.
pub async fn replay(
    status: &str,
    dead_letter_path: &Path,
    audit_path: &Path,
    claim_db_path: &str,
    owner_id: &str,
) -> Result<ReplaySummary> {
    let entries = read_lines_filtered_by_status(dead_letter_path, status)?;
    let pool = ivp_claimstore::connect(claim_db_path).await.context("connect to claim store for replay")?;
    ivp_claimstore::migrate(&pool).await.context("migrate claim store for replay")?;
    let mut audit = AuditWriter::new(audit_path, true).context("open replay audit writer")?;

    replay_entries(entries, &pool, &mut audit, owner_id).await
}
