//! End-to-end driver behavior over fake inbox/storage backends and a
//! scripted vision client: one document through each of the documented exit
//! paths (stored, review-required, duplicate-skip, extraction failure).

use async_trait::async_trait;
use ivp_extract::{ExtractionError, ExtractionErrorCode, VisionClient};
use ivp_pipeline::{
    DocumentOutcome, InboxCandidate, InboxSource, Pipeline, PipelineConfig, StorageAppendResult,
    StorageAppendStatus, StorageSink,
};
use ivp_schemas::LedgerRecord;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

struct SingleFileInbox {
    candidate: InboxCandidate,
    content: &'static [u8],
}

#[async_trait]
impl InboxSource for SingleFileInbox {
    async fn list_inbox(&self) -> anyhow::Result<Vec<InboxCandidate>> {
        Ok(vec![self.candidate.clone()])
    }

    async fn download(&self, _id: &str, out_path: &Path) -> anyhow::Result<std::path::PathBuf> {
        tokio::fs::write(out_path, self.content).await?;
        Ok(out_path.to_path_buf())
    }
}

#[derive(Default)]
struct RecordingStorage {
    appended: Mutex<Vec<LedgerRecord>>,
}

#[async_trait]
impl StorageSink for RecordingStorage {
    async fn append(&self, record: &LedgerRecord) -> anyhow::Result<StorageAppendResult> {
        self.appended.lock().unwrap().push(record.clone());
        Ok(StorageAppendResult { status: StorageAppendStatus::Appended, row_id_or_range: Some("1".into()) })
    }
}

struct ScriptedVisionClient {
    response: Result<String, ExtractionError>,
    calls: AtomicUsize,
}

#[async_trait]
impl VisionClient for ScriptedVisionClient {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn extract_json(&self, _file_path: &Path, _model: &str, _prompt: &str) -> Result<String, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.response.clone()
    }
}

fn make_candidate(name: &str) -> InboxCandidate {
    InboxCandidate { id: name.to_string(), name: name.to_string(), mime_type: "image/png".to_string(), size: None, modified_at: None }
}

async fn make_pipeline(
    client: Arc<dyn VisionClient>,
    storage: Arc<RecordingStorage>,
    inbox: Arc<dyn InboxSource>,
    tmp_dir: std::path::PathBuf,
) -> (Pipeline, std::path::PathBuf) {
    let pool = ivp_claimstore::connect_in_memory().await.unwrap();
    ivp_claimstore::migrate(&pool).await.unwrap();

    let review_dir = tmp_dir.join("review");
    let dead_letter_path = tmp_dir.join("dead_letter.jsonl");

    let pipeline = Pipeline {
        config: PipelineConfig {
            worker_id: "test-worker".to_string(),
            tmp_dir: tmp_dir.clone(),
            extraction_model: "auto".to_string(),
            extraction_provider: "explicit".to_string(),
            extraction_provider_order: vec![],
            review_confidence_threshold: 0.5,
            store_review_score_threshold: 0.0,
        },
        claim_pool: pool,
        inbox,
        storage,
        rules: ivp_normalize::NormalizationRules::builtin_defaults(),
        dead_letter: ivp_audit::DeadLetterLog::new(&dead_letter_path).unwrap(),
        review_queue: ivp_review::ReviewQueue::new(&review_dir).unwrap(),
        metrics: Arc::new(ivp_metrics::MetricsCollector::new()),
        explicit_vision_client: Some(client),
    };
    (pipeline, dead_letter_path)
}

#[tokio::test]
async fn clean_document_is_stored_and_archived() {
    let tmp = tempfile::tempdir().unwrap();
    let candidate = make_candidate("invoice-1.png");
    let inbox: Arc<dyn InboxSource> = Arc::new(SingleFileInbox { candidate: candidate.clone(), content: b"fake bytes" });
    let storage = Arc::new(RecordingStorage::default());
    let client: Arc<dyn VisionClient> = Arc::new(ScriptedVisionClient {
        response: Ok(r#"{"vendor_name":"Acme","total":110.0,"subtotal":100.0,"tax":10.0,"currency":"USD","model_confidence":0.95}"#.to_string()),
        calls: AtomicUsize::new(0),
    });

    let (pipeline, _dl) = make_pipeline(client, Arc::clone(&storage), inbox, tmp.path().to_path_buf()).await;
    let outcome = pipeline.process_one(&candidate).await.unwrap();

    assert_eq!(outcome, DocumentOutcome::Stored);
    assert_eq!(storage.appended.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn low_confidence_document_routes_to_review() {
    let tmp = tempfile::tempdir().unwrap();
    let candidate = make_candidate("invoice-2.png");
    let inbox: Arc<dyn InboxSource> = Arc::new(SingleFileInbox { candidate: candidate.clone(), content: b"fake bytes" });
    let storage = Arc::new(RecordingStorage::default());
    let client: Arc<dyn VisionClient> = Arc::new(ScriptedVisionClient {
        response: Ok(r#"{"vendor_name":"Acme","total":110.0,"subtotal":100.0,"tax":10.0,"currency":"USD","model_confidence":0.1}"#.to_string()),
        calls: AtomicUsize::new(0),
    });

    let (pipeline, dead_letter_path) = make_pipeline(client, storage, inbox, tmp.path().to_path_buf()).await;
    let outcome = pipeline.process_one(&candidate).await.unwrap();

    assert_eq!(outcome, DocumentOutcome::ReviewRequired);
    let entries = ivp_audit::DeadLetterLog::new(&dead_letter_path).unwrap().list_failures(Some("REVIEW_REQUIRED")).unwrap();
    assert_eq!(entries.len(), 1);
}

#[tokio::test]
async fn extraction_failure_is_dead_lettered_as_failed() {
    let tmp = tempfile::tempdir().unwrap();
    let candidate = make_candidate("invoice-3.png");
    let inbox: Arc<dyn InboxSource> = Arc::new(SingleFileInbox { candidate: candidate.clone(), content: b"fake bytes" });
    let storage = Arc::new(RecordingStorage::default());
    let client: Arc<dyn VisionClient> =
        Arc::new(ScriptedVisionClient { response: Err(ExtractionError::new(ExtractionErrorCode::EmptyResponse, "empty")), calls: AtomicUsize::new(0) });

    let (pipeline, dead_letter_path) = make_pipeline(client, storage, inbox, tmp.path().to_path_buf()).await;
    let outcome = pipeline.process_one(&candidate).await.unwrap();

    match outcome {
        DocumentOutcome::Failed { code } => assert_eq!(code, "empty_response"),
        other => panic!("expected Failed, got {other:?}"),
    }
    let entries = ivp_audit::DeadLetterLog::new(&dead_letter_path).unwrap().list_failures(Some("FAILED")).unwrap();
    assert_eq!(entries.len(), 1);
}

#[tokio::test]
async fn second_claim_on_same_content_is_skipped_as_duplicate() {
    let tmp = tempfile::tempdir().unwrap();
    let candidate = make_candidate("invoice-4.png");
    let inbox: Arc<dyn InboxSource> = Arc::new(SingleFileInbox { candidate: candidate.clone(), content: b"identical bytes" });
    let storage = Arc::new(RecordingStorage::default());
    let client: Arc<dyn VisionClient> = Arc::new(ScriptedVisionClient {
        response: Ok(r#"{"vendor_name":"Acme","total":10.0,"subtotal":10.0,"tax":0.0,"currency":"USD","model_confidence":0.95}"#.to_string()),
        calls: AtomicUsize::new(0),
    });

    let (pipeline, _dl) = make_pipeline(client, storage, inbox, tmp.path().to_path_buf()).await;
    let first = pipeline.process_one(&candidate).await.unwrap();
    assert_eq!(first, DocumentOutcome::Stored);

    let second = pipeline.process_one(&candidate).await.unwrap();
    assert_eq!(second, DocumentOutcome::DuplicateSkipped);
}
