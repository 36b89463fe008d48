//! Shared data types for the document ingestion pipeline: the durable claim
//! row, the canonical normalized record, transient extraction payloads,
//! business-rule violations, and the dead-letter/review-queue record shapes.
//!
//! These types cross crate boundaries (claimstore, extract, normalize,
//! validate, routing, review, pipeline) so they live in one leaf crate with
//! no dependency on any sibling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle states from the state machine's transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClaimStatus {
    New,
    Claimed,
    Extracted,
    Validated,
    ReviewRequired,
    Stored,
    Archived,
    Failed,
}

impl ClaimStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimStatus::New => "NEW",
            ClaimStatus::Claimed => "CLAIMED",
            ClaimStatus::Extracted => "EXTRACTED",
            ClaimStatus::Validated => "VALIDATED",
            ClaimStatus::ReviewRequired => "REVIEW_REQUIRED",
            ClaimStatus::Stored => "STORED",
            ClaimStatus::Archived => "ARCHIVED",
            ClaimStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NEW" => Some(ClaimStatus::New),
            "CLAIMED" => Some(ClaimStatus::Claimed),
            "EXTRACTED" => Some(ClaimStatus::Extracted),
            "VALIDATED" => Some(ClaimStatus::Validated),
            "REVIEW_REQUIRED" => Some(ClaimStatus::ReviewRequired),
            "STORED" => Some(ClaimStatus::Stored),
            "ARCHIVED" => Some(ClaimStatus::Archived),
            "FAILED" => Some(ClaimStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ClaimStatus::Archived | ClaimStatus::Failed)
    }
}

impl std::fmt::Display for ClaimStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable per-document claim row, primary-keyed on `(source_id, content_hash)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentClaim {
    pub source_id: String,
    pub content_hash: String,
    pub status: ClaimStatus,
    pub owner_id: Option<String>,
    pub claimed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimOutcome {
    Claimed,
    AlreadyClaimed,
    AlreadyProcessed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimResult {
    pub status: ClaimOutcome,
    pub source_id: String,
    pub content_hash: String,
    pub owner_id: Option<String>,
}

/// One line item on an invoice or receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub quantity: f64,
    pub unit_price: f64,
    pub line_total: f64,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentType {
    Invoice,
    Receipt,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Invoice => "invoice",
            DocumentType::Receipt => "receipt",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "invoice" => Some(DocumentType::Invoice),
            "receipt" => Some(DocumentType::Receipt),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Card,
    Cash,
    Bank,
    Unknown,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Card => "card",
            PaymentMethod::Cash => "cash",
            PaymentMethod::Bank => "bank",
            PaymentMethod::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "card" => PaymentMethod::Card,
            "cash" => PaymentMethod::Cash,
            "bank" => PaymentMethod::Bank,
            _ => PaymentMethod::Unknown,
        }
    }
}

/// The typed, schema-checked shape normalization produces, *before* the
/// validator has computed a score. The validator deserializes into this type
/// first (that deserialization failure is the "schema validation failed"
/// outcome) and only then builds a `CanonicalRecord` by attaching the score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub document_type: DocumentType,
    pub vendor_name: String,
    pub vendor_tax_id: Option<String>,
    pub invoice_number: Option<String>,
    pub invoice_date: String,
    pub due_date: Option<String>,
    pub currency: String,
    pub subtotal: f64,
    pub tax_amount: f64,
    pub total_amount: f64,
    pub payment_method: PaymentMethod,
    pub line_items: Vec<LineItem>,
    pub model_confidence: f64,
}

/// The normalized, validated, fully-typed output of the normalization +
/// validation stages. Everything upstream of this type is dynamic JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub document_type: DocumentType,
    pub vendor_name: String,
    pub vendor_tax_id: Option<String>,
    pub invoice_number: Option<String>,
    pub invoice_date: String,
    pub due_date: Option<String>,
    pub currency: String,
    pub subtotal: f64,
    pub tax_amount: f64,
    pub total_amount: f64,
    pub payment_method: PaymentMethod,
    pub line_items: Vec<LineItem>,
    pub model_confidence: f64,
    pub validation_score: f64,
}

impl CanonicalRecord {
    pub fn from_normalized(n: NormalizedRecord, validation_score: f64) -> Self {
        Self {
            document_type: n.document_type,
            vendor_name: n.vendor_name,
            vendor_tax_id: n.vendor_tax_id,
            invoice_number: n.invoice_number,
            invoice_date: n.invoice_date,
            due_date: n.due_date,
            currency: n.currency,
            subtotal: n.subtotal,
            tax_amount: n.tax_amount,
            total_amount: n.total_amount,
            payment_method: n.payment_method,
            line_items: n.line_items,
            model_confidence: n.model_confidence,
            validation_score,
        }
    }
}

/// Transient, pre-normalization extractor output: an untyped JSON object
/// plus the two reserved keys the extractor itself attaches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionPayload {
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
    pub _ocr_text: Option<String>,
    pub _provider: Option<String>,
}

impl ExtractionPayload {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// A single business-rule (or schema) finding produced by the validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub code: String,
    pub severity: Severity,
    pub message: String,
    #[serde(flatten, default)]
    pub context: serde_json::Map<String, Value>,
}

/// A terminal-failure record written to the dead-letter log, replayable by
/// its `(source_id, content_hash)` fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub recorded_at: DateTime<Utc>,
    pub document_id: Uuid,
    pub source_id: String,
    pub content_hash: String,
    pub status: String,
    pub error_code: String,
    pub error_message: String,
    pub used_provider: Option<String>,
}

/// One persisted review-queue record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub document_id: Uuid,
    pub status: String,
    pub reason_codes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub source_file_moved_to: Option<String>,
    pub metadata: Option<Value>,
}

/// Pipeline-attached metadata handed to the storage sink alongside a
/// `CanonicalRecord`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerRecord {
    #[serde(flatten)]
    pub record: CanonicalRecord,
    pub document_id: Uuid,
    pub source_id: String,
    pub content_hash: String,
    pub used_provider: Option<String>,
    pub needs_review: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_status_round_trips_through_str() {
        for s in [
            ClaimStatus::New,
            ClaimStatus::Claimed,
            ClaimStatus::Extracted,
            ClaimStatus::Validated,
            ClaimStatus::ReviewRequired,
            ClaimStatus::Stored,
            ClaimStatus::Archived,
            ClaimStatus::Failed,
        ] {
            assert_eq!(ClaimStatus::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn claim_status_parse_is_case_insensitive() {
        assert_eq!(ClaimStatus::parse("claimed"), Some(ClaimStatus::Claimed));
        assert_eq!(ClaimStatus::parse(" Stored "), Some(ClaimStatus::Stored));
        assert_eq!(ClaimStatus::parse("bogus"), None);
    }

    #[test]
    fn terminal_states_are_archived_and_failed() {
        assert!(ClaimStatus::Archived.is_terminal());
        assert!(ClaimStatus::Failed.is_terminal());
        assert!(!ClaimStatus::Stored.is_terminal());
    }

    #[test]
    fn payment_method_unmatched_text_is_unknown() {
        assert_eq!(PaymentMethod::parse("bitcoin"), PaymentMethod::Unknown);
    }
}
