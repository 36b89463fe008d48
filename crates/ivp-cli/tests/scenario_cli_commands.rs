//! Drives the CLI's command handlers directly against a `Settings` pointed
//! at a scratch directory — no binary invocation, no network credentials.

use ivp_cli::commands;
use ivp_config::Settings;
use std::sync::Mutex;

/// `Settings::from_env` reads process-wide env vars; serialize tests that
/// mutate them so they don't race each other.
static ENV_LOCK: Mutex<()> = Mutex::new(());

fn settings_in(dir: &std::path::Path) -> Settings {
    let vars = [
        ("INBOX_DIR", dir.join("inbox")),
        ("INBOX_ARCHIVE_DIR", dir.join("inbox/archive")),
        ("CLAIM_DB_PATH", dir.join("metadata.db")),
        ("DEAD_LETTER_PATH", dir.join("dead_letter.jsonl")),
        ("REPLAY_AUDIT_PATH", dir.join("replay_audit.jsonl")),
        ("METRICS_PATH", dir.join("metrics.jsonl")),
        ("REVIEW_QUEUE_DIR", dir.join("review_queue")),
        ("LEDGER_PATH", dir.join("ledger.jsonl")),
        ("TMP_DIR", dir.join("tmp")),
        ("NORMALIZATION_RULES_PATH", dir.join("no_such_rules.json")),
    ];
    for (k, v) in &vars {
        std::env::set_var(k, v.to_string_lossy().to_string());
    }
    let settings = Settings::from_env().unwrap();
    for (k, _) in &vars {
        std::env::remove_var(k);
    }
    settings
}

#[tokio::test]
async fn poll_once_on_an_empty_inbox_processes_nothing() {
    let _guard = ENV_LOCK.lock().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let settings = settings_in(dir.path());

    let snapshot = commands::poll::run(&settings).await.unwrap();

    assert_eq!(snapshot.processed, 0);
    assert_eq!(snapshot.stored, 0);
}

#[tokio::test]
async fn db_status_and_migrate_round_trip_on_a_fresh_store() {
    let _guard = ENV_LOCK.lock().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let settings = settings_in(dir.path());

    commands::db::migrate(&settings).await.unwrap();
    let status = commands::db::status(&settings).await.unwrap();

    assert_eq!(status.claims_by_status.len(), 0);
}

#[tokio::test]
async fn replay_with_no_dead_letter_log_yet_is_a_no_op() {
    let _guard = ENV_LOCK.lock().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let settings = settings_in(dir.path());

    let summary = commands::replay::run(&settings, "FAILED").await.unwrap();

    assert_eq!(summary.queued, 0);
    assert_eq!(summary.skipped_processed, 0);
    assert_eq!(summary.skipped_invalid, 0);
}

#[tokio::test]
async fn replay_queues_a_dead_lettered_entry() {
    let _guard = ENV_LOCK.lock().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let settings = settings_in(dir.path());

    let entry = serde_json::json!({
        "recorded_at": "2026-01-01T00:00:00Z",
        "document_id": uuid::Uuid::new_v4().to_string(),
        "source_id": "invoice-1.png",
        "content_hash": "deadbeef",
        "status": "FAILED",
        "error_code": "all_providers_failed",
        "error_message": "boom",
        "used_provider": serde_json::Value::Null,
    });
    std::fs::write(&settings.dead_letter_path, format!("{entry}\n")).unwrap();

    let summary = commands::replay::run(&settings, "FAILED").await.unwrap();

    assert_eq!(summary.queued, 1);
}
