//! Startup configuration: environment-driven `Settings`, fatal on
//! misconfiguration, plus the JSON rules-file loader used by the
//! normalization engine. The rules loader reuses this workspace's
//! canonicalize-then-hash pattern so a ruleset snapshot can be logged
//! alongside a poll cycle's metrics for reproducibility.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

fn parse_bool(value: Option<String>, default: bool) -> bool {
    match value {
        None => default,
        Some(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
    }
}

fn require_env(name: &str) -> Result<String> {
    let raw = std::env::var(name).unwrap_or_default();
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        bail!("missing required environment variable: {name}");
    }
    Ok(trimmed.to_string())
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Process-wide settings, loaded once at startup. Validation failures here
/// are configuration errors: fatal, not retried.
#[derive(Debug, Clone)]
pub struct Settings {
    pub ingestion_backend: String,
    pub ledger_backend: String,
    pub allowed_mime_types: Vec<String>,
    pub log_level: String,
    pub extraction_provider: String,
    pub extraction_model: String,
    pub extraction_provider_order: Vec<String>,
    pub review_confidence_threshold: f64,
    pub store_review_score_threshold: f64,
    pub normalization_rules_path: String,
    pub worker_id: String,
    pub claim_db_path: String,
    pub dead_letter_path: String,
    pub replay_audit_path: String,
    pub metrics_path: String,
    pub review_queue_dir: String,
    pub tmp_dir: String,
    /// Directory the local-filesystem inbox adapter polls. Real object-storage
    /// credentials are out of scope for this workspace; this is where the
    /// `drive`/`r2` ingestion backend resolves to in the dev/CLI path.
    pub inbox_dir: String,
    pub inbox_archive_dir: String,
    /// JSONL path the local ledger adapter appends to, standing in for the
    /// `sheets`/`postgres` ledger backend.
    pub ledger_path: String,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let ingestion_backend = env_or("INGESTION_BACKEND", "drive").to_lowercase();
        if !["drive", "r2"].contains(&ingestion_backend.as_str()) {
            bail!("INGESTION_BACKEND must be one of: drive, r2");
        }

        let ledger_backend = env_or("LEDGER_BACKEND", "sheets").to_lowercase();
        if !["sheets", "postgres"].contains(&ledger_backend.as_str()) {
            bail!("LEDGER_BACKEND must be one of: sheets, postgres");
        }

        let mime_raw = env_or("ALLOWED_MIME_TYPES", "image/jpeg,image/png,application/pdf");
        let allowed_mime_types: Vec<String> = mime_raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if allowed_mime_types.is_empty() {
            bail!("ALLOWED_MIME_TYPES must contain at least one mime type");
        }

        let order_raw = env_or("EXTRACTION_PROVIDER_ORDER", "mistral,openrouter,groq");
        let extraction_provider_order: Vec<String> = order_raw
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();

        let review_confidence_threshold: f64 = env_or("REVIEW_CONFIDENCE_THRESHOLD", "0.5")
            .parse()
            .context("REVIEW_CONFIDENCE_THRESHOLD must be a number")?;
        let store_review_score_threshold: f64 = env_or("STORE_REVIEW_SCORE_THRESHOLD", "0.6")
            .parse()
            .context("STORE_REVIEW_SCORE_THRESHOLD must be a number")?;

        let _ = parse_bool(std::env::var("STRICT_STARTUP").ok(), false);

        Ok(Self {
            ingestion_backend,
            ledger_backend,
            allowed_mime_types,
            log_level: env_or("LOG_LEVEL", "INFO").to_uppercase(),
            extraction_provider: env_or("EXTRACTION_PROVIDER", "auto").to_lowercase(),
            extraction_model: env_or("EXTRACTION_MODEL", "auto"),
            extraction_provider_order,
            review_confidence_threshold,
            store_review_score_threshold,
            normalization_rules_path: env_or(
                "NORMALIZATION_RULES_PATH",
                "config/normalization_rules.json",
            ),
            worker_id: env_or("WORKER_ID", "worker-1"),
            claim_db_path: env_or("CLAIM_DB_PATH", "data/metadata.db"),
            dead_letter_path: env_or("DEAD_LETTER_PATH", "logs/dead_letter.jsonl"),
            replay_audit_path: env_or("REPLAY_AUDIT_PATH", "logs/replay_audit.jsonl"),
            metrics_path: env_or("METRICS_PATH", "logs/metrics.jsonl"),
            review_queue_dir: env_or("REVIEW_QUEUE_DIR", "review_queue"),
            tmp_dir: env_or("TMP_DIR", "tmp"),
            inbox_dir: env_or("INBOX_DIR", "inbox"),
            inbox_archive_dir: env_or("INBOX_ARCHIVE_DIR", "inbox/archive"),
            ledger_path: env_or("LEDGER_PATH", "data/ledger.jsonl"),
        })
    }

    /// Fetches a provider API key by name, or `None` if absent/blank —
    /// callers treat an absent key as "skip this provider", never as fatal.
    pub fn provider_api_key(provider: &str) -> Option<String> {
        let var = match provider.to_lowercase().as_str() {
            "mistral" => "MISTRAL_API_KEY",
            "openrouter" => "OPENROUTER_API_KEY",
            "groq" => "GROQ_API_KEY",
            "openai" => "OPENAI_API_KEY",
            "gemini" => "GEMINI_API_KEY",
            _ => return None,
        };
        std::env::var(var).ok().filter(|v| !v.trim().is_empty())
    }
}

/// Optional loader for a required environment variable with a clearer
/// panic-free error than `std::env::var`. A complete CLI wires `.env`
/// loading in via `dotenvy` at the composition root; this is a fallback
/// for environments without `dotenvy`'s file-format assumptions.
pub fn require_env_documented(name: &str) -> Result<String> {
    require_env(name)
}

#[derive(Debug, Clone)]
pub struct LoadedRules {
    pub rules_json: Value,
    pub canonical_json: String,
    pub rules_hash: String,
}

/// Loads the normalization rules JSON file, canonicalizes it (sorted keys,
/// compact), and hashes the canonical form so the active ruleset can be
/// logged alongside metrics for reproducibility.
pub fn load_rules_file(path: impl AsRef<Path>) -> Result<LoadedRules> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path).with_context(|| format!("read rules file: {path:?}"))?;
    let parsed: Value =
        serde_json::from_str(&raw).with_context(|| format!("parse rules json: {path:?}"))?;
    let canonical = canonicalize_json(&parsed);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let rules_hash = hex::encode(hasher.finalize());

    Ok(LoadedRules {
        rules_json: serde_json::from_str(&canonical).context("canonical rules reparse failed")?,
        canonical_json: canonical,
        rules_hash,
    })
}

fn canonicalize_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn with_env<F: FnOnce()>(pairs: &[(&str, &str)], f: F) {
        for (k, v) in pairs {
            std::env::set_var(k, v);
        }
        f();
        for (k, _) in pairs {
            std::env::remove_var(k);
        }
    }

    #[test]
    fn settings_from_env_applies_defaults() {
        with_env(&[], || {
            let s = Settings::from_env().unwrap();
            assert_eq!(s.ingestion_backend, "drive");
            assert_eq!(s.extraction_provider_order, vec!["mistral", "openrouter", "groq"]);
            assert_eq!(s.review_confidence_threshold, 0.5);
        });
    }

    #[test]
    fn settings_rejects_unknown_ingestion_backend() {
        with_env(&[("INGESTION_BACKEND", "ftp")], || {
            assert!(Settings::from_env().is_err());
        });
        std::env::remove_var("INGESTION_BACKEND");
    }

    #[test]
    fn rules_file_hash_is_stable_under_key_reordering() {
        let dir = tempfile::tempdir().unwrap();
        let p1 = dir.path().join("a.json");
        let p2 = dir.path().join("b.json");
        fs::write(&p1, r#"{"b":1,"a":2}"#).unwrap();
        fs::write(&p2, r#"{"a":2,"b":1}"#).unwrap();
        let r1 = load_rules_file(&p1).unwrap();
        let r2 = load_rules_file(&p2).unwrap();
        assert_eq!(r1.rules_hash, r2.rules_hash);
    }

    #[test]
    fn provider_api_key_is_none_when_absent() {
        std::env::remove_var("MISTRAL_API_KEY");
        assert_eq!(Settings::provider_api_key("mistral"), None);
    }

    #[test]
    fn malformed_rules_file_is_a_context_wrapped_error() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "not json").unwrap();
        let err = load_rules_file(f.path()).unwrap_err();
        assert!(format!("{err:#}").contains("parse rules json"));
    }
}
