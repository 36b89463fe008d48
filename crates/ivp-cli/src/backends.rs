//! Local-filesystem stand-ins for the inbox and ledger contracts.
//!
//! The real object-storage inbox and spreadsheet/relational ledger sinks
//! are out of scope for this workspace (non-goals: credential
//! acquisition and the raw backend SDKs). These adapters satisfy the same
//! trait seam against a plain directory and a JSONL file, the same way a
//! paper-trading adapter stands in for a real broker behind one contract,
//! so `poll-once` has something runnable without cloud credentials.

use anyhow::{Context, Result};
use async_trait::async_trait;
use ivp_pipeline::{InboxCandidate, InboxSource, StorageAppendResult, StorageAppendStatus, StorageSink};
use ivp_schemas::LedgerRecord;
use std::path::{Path, PathBuf};

pub struct FilesystemInbox {
    inbox_dir: PathBuf,
    archive_dir: PathBuf,
    allowed_mime_types: Vec<String>,
}

impl FilesystemInbox {
    pub fn new(inbox_dir: impl Into<PathBuf>, archive_dir: impl Into<PathBuf>, allowed_mime_types: Vec<String>) -> Self {
        Self { inbox_dir: inbox_dir.into(), archive_dir: archive_dir.into(), allowed_mime_types }
    }
}

fn mime_for_extension(path: &Path) -> Option<&'static str> {
    match path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()).as_deref() {
        Some("jpg") | Some("jpeg") => Some("image/jpeg"),
        Some("png") => Some("image/png"),
        Some("pdf") => Some("application/pdf"),
        _ => None,
    }
}

#[async_trait]
impl InboxSource for FilesystemInbox {
    async fn list_inbox(&self) -> Result<Vec<InboxCandidate>> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.inbox_dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e).with_context(|| format!("read inbox dir {:?}", self.inbox_dir)),
        };

        while let Some(entry) = entries.next_entry().await.context("read inbox dir entry")? {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(mime_type) = mime_for_extension(&path) else { continue };
            if !self.allowed_mime_types.iter().any(|m| m == mime_type) {
                continue;
            }
            let meta = entry.metadata().await.context("stat inbox entry")?;
            let name = entry.file_name().to_string_lossy().to_string();
            out.push(InboxCandidate {
                id: name.clone(),
                name,
                mime_type: mime_type.to_string(),
                size: Some(meta.len()),
                modified_at: meta.modified().ok().map(chrono::DateTime::<chrono::Utc>::from),
            });
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn download(&self, id: &str, out_path: &Path) -> Result<PathBuf> {
        let src = self.inbox_dir.join(id);
        tokio::fs::copy(&src, out_path).await.with_context(|| format!("copy {src:?} to {out_path:?}"))?;
        Ok(out_path.to_path_buf())
    }

    async fn move_to_archive(&self, id: &str) -> Result<Option<String>> {
        tokio::fs::create_dir_all(&self.archive_dir).await.context("create archive dir")?;
        let src = self.inbox_dir.join(id);
        let dst = self.archive_dir.join(id);
        tokio::fs::rename(&src, &dst).await.with_context(|| format!("archive {src:?} to {dst:?}"))?;
        Ok(Some(dst.to_string_lossy().to_string()))
    }
}

/// Append-only JSONL ledger, deduplicated on `content_hash`.
pub struct JsonlLedger {
    path: PathBuf,
}

impl JsonlLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn contains_hash(&self, content_hash: &str) -> Result<bool> {
        if !self.path.exists() {
            return Ok(false);
        }
        let content = std::fs::read_to_string(&self.path).with_context(|| format!("read ledger {:?}", self.path))?;
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let value: serde_json::Value = serde_json::from_str(trimmed).with_context(|| "parse ledger line as json")?;
            if value.get("content_hash").and_then(|v| v.as_str()) == Some(content_hash) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl StorageSink for JsonlLedger {
    async fn append(&self, record: &LedgerRecord) -> Result<StorageAppendResult> {
        if self.contains_hash(&record.content_hash)? {
            return Ok(StorageAppendResult { status: StorageAppendStatus::SkippedDuplicate, row_id_or_range: None });
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("create_dir_all {parent:?}"))?;
        }
        let mut line = serde_json::to_string(record).context("serialize ledger record")?;
        line.push('\n');
        let mut f = std::fs::OpenOptions::new().create(true).append(true).open(&self.path).with_context(|| format!("open ledger {:?}", self.path))?;
        use std::io::Write;
        f.write_all(line.as_bytes()).context("write ledger line")?;

        Ok(StorageAppendResult { status: StorageAppendStatus::Appended, row_id_or_range: Some(record.document_id.to_string()) })
    }
}
