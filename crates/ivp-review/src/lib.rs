//! Human-review queue: persists one JSON record per review event, optionally
//! moving the source artifact alongside it. Filenames are document-id-unique,
//! but repeated calls for the same document are not deduplicated — only the
//! callers (the pipeline, driven by the state machine) prevent that.

use anyhow::{Context, Result};
use chrono::Utc;
use ivp_schemas::ReviewRecord;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub struct ReviewQueue {
    dir: PathBuf,
}

impl ReviewQueue {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).with_context(|| format!("create_dir_all {dir:?}"))?;
        Ok(Self { dir })
    }

    /// Writes a review record for `document_id`, optionally moving
    /// `source_path` into the queue directory (moved, not copied).
    pub fn enqueue(
        &self,
        document_id: Uuid,
        reason_codes: Vec<String>,
        source_path: Option<&Path>,
        metadata: Option<Value>,
    ) -> Result<ReviewRecord> {
        let source_file_moved_to = match source_path {
            Some(src) if src.exists() => Some(self.move_into_queue(document_id, src)?),
            _ => None,
        };

        let record = ReviewRecord {
            document_id,
            status: "REVIEW_REQUIRED".to_string(),
            reason_codes,
            created_at: Utc::now(),
            source_file_moved_to: source_file_moved_to.map(|p| p.to_string_lossy().into_owned()),
            metadata,
        };

        let path = self.record_path(document_id);
        let line = serde_json::to_string_pretty(&record).context("serialize review record")?;
        fs::write(&path, line).with_context(|| format!("write review record {path:?}"))?;

        Ok(record)
    }

    fn record_path(&self, document_id: Uuid) -> PathBuf {
        self.dir.join(format!("{document_id}.json"))
    }

    fn move_into_queue(&self, document_id: Uuid, src: &Path) -> Result<PathBuf> {
        let file_name = src.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let dest = self.dir.join(format!("{document_id}_{file_name}"));
        match fs::rename(src, &dest) {
            Ok(()) => Ok(dest),
            Err(_) => {
                // cross-filesystem rename fails with EXDEV; fall back to copy+remove.
                fs::copy(src, &dest).with_context(|| format!("copy {src:?} -> {dest:?}"))?;
                fs::remove_file(src).with_context(|| format!("remove original {src:?} after copy"))?;
                Ok(dest)
            }
        }
    }

    pub fn read(&self, document_id: Uuid) -> Result<Option<ReviewRecord>> {
        let path = self.record_path(document_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path).with_context(|| format!("read review record {path:?}"))?;
        Ok(Some(serde_json::from_str(&raw).context("parse review record")?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn enqueue_writes_a_document_id_named_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let queue = ReviewQueue::new(dir.path()).unwrap();
        let id = Uuid::new_v4();

        let record = queue
            .enqueue(id, vec!["low_confidence".to_string()], None, Some(json!({"note": "x"})))
            .unwrap();

        assert_eq!(record.document_id, id);
        assert!(dir.path().join(format!("{id}.json")).exists());
    }

    #[test]
    fn enqueue_moves_the_source_file_not_copies_it() {
        let dir = tempfile::tempdir().unwrap();
        let src_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("doc.png");
        fs::write(&src, b"fake image bytes").unwrap();

        let queue = ReviewQueue::new(dir.path()).unwrap();
        let id = Uuid::new_v4();
        let record = queue.enqueue(id, vec![], Some(&src), None).unwrap();

        assert!(!src.exists());
        let moved_to = record.source_file_moved_to.unwrap();
        assert!(Path::new(&moved_to).exists());
    }

    #[test]
    fn read_round_trips_a_written_record() {
        let dir = tempfile::tempdir().unwrap();
        let queue = ReviewQueue::new(dir.path()).unwrap();
        let id = Uuid::new_v4();
        queue.enqueue(id, vec!["schema_validation_failed".to_string()], None, None).unwrap();

        let read_back = queue.read(id).unwrap().unwrap();
        assert_eq!(read_back.reason_codes, vec!["schema_validation_failed".to_string()]);
    }

    #[test]
    fn read_missing_document_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let queue = ReviewQueue::new(dir.path()).unwrap();
        assert!(queue.read(Uuid::new_v4()).unwrap().is_none());
    }
}
