//! Wires extraction, normalization, validation, and routing into the
//! per-document driver, plus the external-collaborator
//! contracts (§6) backends implement.

pub mod contracts;
pub mod driver;
pub mod hash;

pub use contracts::{InboxCandidate, InboxSource, StorageAppendResult, StorageAppendStatus, StorageSink};
pub use driver::{DocumentOutcome, Pipeline, PipelineConfig};
pub use hash::sha256_file;
