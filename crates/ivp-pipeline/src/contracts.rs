//! External-collaborator contracts: the inbox lister/downloader,
//! the storage sink. Backends (object storage SDK, spreadsheet/relational
//! sinks) are out of scope for this crate; it only defines the trait seam
//! the driver calls through.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ivp_schemas::LedgerRecord;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct InboxCandidate {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub size: Option<u64>,
    pub modified_at: Option<DateTime<Utc>>,
}

/// Lists and downloads from the document inbox. Two backends implement
/// this in a complete deployment (object storage, local-drive); this crate
/// only consumes the trait.
#[async_trait]
pub trait InboxSource: Send + Sync {
    async fn list_inbox(&self) -> Result<Vec<InboxCandidate>>;
    async fn download(&self, id: &str, out_path: &Path) -> Result<PathBuf>;

    /// Optional: moves the source object into an archive location.
    /// Backends without archival support return `Ok(None)`.
    async fn move_to_archive(&self, _id: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageAppendStatus {
    Appended,
    SkippedDuplicate,
}

#[derive(Debug, Clone)]
pub struct StorageAppendResult {
    pub status: StorageAppendStatus,
    pub row_id_or_range: Option<String>,
}

/// The tabular ledger sink (spreadsheet API / relational table). Responsible
/// for its own dedup on `metadata.file_hash`.
#[async_trait]
pub trait StorageSink: Send + Sync {
    async fn append(&self, record: &LedgerRecord) -> Result<StorageAppendResult>;
}
