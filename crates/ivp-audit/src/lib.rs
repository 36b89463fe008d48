//! Append-only JSON-lines writers. `AuditWriter` is the general-purpose
//! hash-chainable event log (used for the replay audit trail);
//! `DeadLetterLog` is a thin, status-queryable wrapper around a plain JSONL
//! file for terminal pipeline failures.

use anyhow::{Context, Result};
use chrono::Utc;
use ivp_schemas::DeadLetterEntry;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Generic append-only audit writer. Writes one JSON object per line.
/// Hash chaining is optional: when enabled, each event carries `hash_prev`
/// (the previous event's `hash_self`) so tampering or truncation of the
/// file is detectable after the fact.
pub struct AuditWriter {
    path: PathBuf,
    hash_chain: bool,
    last_hash: Option<String>,
}

impl AuditWriter {
    pub fn new(path: impl AsRef<Path>, hash_chain: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create_dir_all {parent:?}"))?;
        }
        Ok(Self { path, hash_chain, last_hash: None })
    }

    pub fn set_last_hash(&mut self, last_hash: Option<String>) {
        self.last_hash = last_hash;
    }

    pub fn last_hash(&self) -> Option<String> {
        self.last_hash.clone()
    }

    pub fn append(&mut self, topic: &str, event_type: &str, payload: Value) -> Result<AuditEvent> {
        let mut ev = AuditEvent {
            event_id: Uuid::new_v4(),
            recorded_at_utc: Utc::now(),
            topic: topic.to_string(),
            event_type: event_type.to_string(),
            payload,
            hash_prev: None,
            hash_self: None,
        };

        if self.hash_chain {
            ev.hash_prev = self.last_hash.clone();
            let self_hash = compute_event_hash(&ev)?;
            ev.hash_self = Some(self_hash.clone());
            self.last_hash = Some(self_hash);
        }

        let line = canonical_json_line(&ev)?;
        append_line(&self.path, &line)?;
        Ok(ev)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub recorded_at_utc: chrono::DateTime<Utc>,
    pub topic: String,
    pub event_type: String,
    pub payload: Value,
    pub hash_prev: Option<String>,
    pub hash_self: Option<String>,
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open audit log {path:?}"))?;
    f.write_all(line.as_bytes()).context("write audit line failed")?;
    f.write_all(b"\n").context("write newline failed")?;
    Ok(())
}

fn canonical_json_line<T: Serialize>(v: &T) -> Result<String> {
    let raw = serde_json::to_value(v).context("serialize audit event failed")?;
    let sorted = sort_keys(&raw);
    serde_json::to_string(&sorted).context("json stringify failed")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

pub fn compute_event_hash(ev: &AuditEvent) -> Result<String> {
    let mut clone = ev.clone();
    clone.hash_self = None;
    let canonical = canonical_json_line(&clone)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyResult {
    Valid { lines: usize },
    Broken { line: usize, reason: String },
}

/// Verifies the hash chain of an audit log file written with `hash_chain: true`.
pub fn verify_hash_chain(path: impl AsRef<Path>) -> Result<VerifyResult> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("read audit log {:?}", path.as_ref()))?;
    verify_hash_chain_str(&content)
}

pub fn verify_hash_chain_str(content: &str) -> Result<VerifyResult> {
    let mut prev_hash: Option<String> = None;
    let mut line_count = 0usize;

    for (i, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let ev: AuditEvent =
            serde_json::from_str(trimmed).with_context(|| format!("parse audit event at line {}", i + 1))?;
        line_count += 1;

        if ev.hash_prev != prev_hash {
            return Ok(VerifyResult::Broken {
                line: i + 1,
                reason: format!("hash_prev mismatch: expected {:?}, got {:?}", prev_hash, ev.hash_prev),
            });
        }
        if let Some(ref claimed) = ev.hash_self {
            let recomputed = compute_event_hash(&ev)?;
            if *claimed != recomputed {
                return Ok(VerifyResult::Broken {
                    line: i + 1,
                    reason: format!("hash_self mismatch: claimed {claimed}, recomputed {recomputed}"),
                });
            }
        }
        prev_hash = ev.hash_self.clone();
    }

    Ok(VerifyResult::Valid { lines: line_count })
}

/// Append-only, status-queryable dead-letter log. One `DeadLetterEntry` per
/// line; no hash chain (the replay audit trail, not the dead-letter log
/// itself, is the tamper-evidence surface here).
pub struct DeadLetterLog {
    path: PathBuf,
}

impl DeadLetterLog {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create_dir_all {parent:?}"))?;
        }
        Ok(Self { path })
    }

    pub fn write_failure(&self, entry: &DeadLetterEntry) -> Result<()> {
        let line = serde_json::to_string(entry).context("serialize dead-letter entry")?;
        append_line(&self.path, &line)
    }

    /// Returns all entries, optionally filtered by `status` (exact match).
    pub fn list_failures(&self, status: Option<&str>) -> Result<Vec<DeadLetterEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("read dead-letter log {:?}", self.path))?;
        let mut out = Vec::new();
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let entry: DeadLetterEntry =
                serde_json::from_str(trimmed).context("parse dead-letter entry")?;
            if let Some(s) = status {
                if entry.status != s {
                    continue;
                }
            }
            out.push(entry);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ivp_schemas::DeadLetterEntry;

    fn sample_entry(status: &str) -> DeadLetterEntry {
        DeadLetterEntry {
            recorded_at: Utc::now(),
            document_id: Uuid::new_v4(),
            source_id: "file-1".into(),
            content_hash: "hash-1".into(),
            status: status.to_string(),
            error_code: "all_providers_failed".into(),
            error_message: "boom".into(),
            used_provider: None,
        }
    }

    #[test]
    fn hash_chain_round_trips_and_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let mut w = AuditWriter::new(&path, true).unwrap();
        w.append("replay", "queued_for_replay", serde_json::json!({"n": 1})).unwrap();
        w.append("replay", "skipped_processed", serde_json::json!({"n": 2})).unwrap();

        let result = verify_hash_chain(&path).unwrap();
        assert_eq!(result, VerifyResult::Valid { lines: 2 });
    }

    #[test]
    fn tampered_line_breaks_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let mut w = AuditWriter::new(&path, true).unwrap();
        w.append("replay", "queued_for_replay", serde_json::json!({"n": 1})).unwrap();
        w.append("replay", "queued_for_replay", serde_json::json!({"n": 2})).unwrap();

        let mut content = fs::read_to_string(&path).unwrap();
        content = content.replace("\"n\":1", "\"n\":999");
        fs::write(&path, content).unwrap();

        match verify_hash_chain(&path).unwrap() {
            VerifyResult::Broken { line, .. } => assert_eq!(line, 1),
            VerifyResult::Valid { .. } => panic!("expected a broken chain"),
        }
    }

    #[test]
    fn dead_letter_log_round_trips_and_filters_by_status() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dead_letter.jsonl");
        let log = DeadLetterLog::new(&path).unwrap();
        log.write_failure(&sample_entry("FAILED")).unwrap();
        log.write_failure(&sample_entry("REVIEW_REQUIRED")).unwrap();

        let all = log.list_failures(None).unwrap();
        assert_eq!(all.len(), 2);

        let failed_only = log.list_failures(Some("FAILED")).unwrap();
        assert_eq!(failed_only.len(), 1);
        assert_eq!(failed_only[0].status, "FAILED");
    }

    #[test]
    fn dead_letter_log_missing_file_is_empty_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let log = DeadLetterLog::new(dir.path().join("nope.jsonl")).unwrap();
        assert!(log.list_failures(None).unwrap().is_empty());
    }
}
