//! Pure validation: strict schema check against the canonical record shape,
//! then business-rule scoring. No I/O; callers persist whatever this
//! produces.

use ivp_schemas::{CanonicalRecord, NormalizedRecord, Severity, Violation};
use serde_json::Value;

/// Outcome of `validate_and_score`. A schema failure is fatal (see the docs
/// step 1): the caller routes straight to review with `schema_validation_failed`
/// and never sees business-rule violations for that document.
pub enum ValidationOutcome {
    SchemaInvalid { message: String },
    Validated(ValidatedDocument),
}

pub struct ValidatedDocument {
    pub record: CanonicalRecord,
    pub violations: Vec<Violation>,
    pub validation_score: f64,
    pub is_valid: bool,
}

fn violation(code: &str, severity: Severity, message: impl Into<String>) -> Violation {
    Violation { code: code.to_string(), severity, message: message.into(), context: Default::default() }
}

/// Structural invariants beyond what `serde` typing alone enforces:
/// non-empty vendor name, 3-letter currency, non-negative amounts,
/// `[0,1]`-bounded confidence, positive line-item quantities.
fn structural_errors(r: &NormalizedRecord) -> Vec<String> {
    let mut errors = Vec::new();
    if r.vendor_name.trim().is_empty() {
        errors.push("vendor_name must not be empty".to_string());
    }
    if r.currency.chars().count() != 3 || !r.currency.chars().all(|c| c.is_ascii_uppercase()) {
        errors.push(format!("currency must be exactly 3 uppercase letters, got {:?}", r.currency));
    }
    if r.subtotal < 0.0 {
        errors.push("subtotal must be >= 0".to_string());
    }
    if r.tax_amount < 0.0 {
        errors.push("tax_amount must be >= 0".to_string());
    }
    if r.total_amount < 0.0 {
        errors.push("total_amount must be >= 0".to_string());
    }
    if !(0.0..=1.0).contains(&r.model_confidence) {
        errors.push(format!("model_confidence must be in [0,1], got {}", r.model_confidence));
    }
    for (i, item) in r.line_items.iter().enumerate() {
        if item.description.trim().is_empty() {
            errors.push(format!("line_items[{i}].description must not be empty"));
        }
        if !(item.quantity > 0.0) {
            errors.push(format!("line_items[{i}].quantity must be > 0"));
        }
        if item.unit_price < 0.0 {
            errors.push(format!("line_items[{i}].unit_price must be >= 0"));
        }
        if item.line_total < 0.0 {
            errors.push(format!("line_items[{i}].line_total must be >= 0"));
        }
    }
    errors
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn amount_mismatch(r: &NormalizedRecord, tolerance: f64) -> Option<Violation> {
    let lhs = round2(r.subtotal + r.tax_amount);
    let rhs = round2(r.total_amount);
    if (lhs - rhs).abs() > tolerance {
        Some(violation(
            "amount_mismatch",
            Severity::Error,
            format!("subtotal + tax_amount ({lhs}) does not match total_amount ({rhs})"),
        ))
    } else {
        None
    }
}

fn line_item_sum_violation(r: &NormalizedRecord, tolerance: f64) -> Option<Violation> {
    if r.line_items.is_empty() {
        return None;
    }
    let sum: f64 = r.line_items.iter().map(|i| i.line_total).sum();
    let diff = (sum - r.subtotal).abs();
    if diff <= tolerance {
        return None;
    }
    if sum <= tolerance && r.subtotal > tolerance {
        Some(violation(
            "line_items_incomplete",
            Severity::Warning,
            format!("line items sum to {sum} but subtotal is {}", r.subtotal),
        ))
    } else {
        Some(violation(
            "line_item_sum_mismatch",
            Severity::Error,
            format!("line items sum to {sum}, expected subtotal {}", r.subtotal),
        ))
    }
}

fn missing_identifier_violation(r: &NormalizedRecord) -> Option<Violation> {
    use ivp_schemas::DocumentType;
    if r.document_type != DocumentType::Invoice {
        return None;
    }
    let has_invoice_number = r.invoice_number.as_deref().map(|s| !s.trim().is_empty()).unwrap_or(false);
    let has_tax_id = r.vendor_tax_id.as_deref().map(|s| !s.trim().is_empty()).unwrap_or(false);
    if has_invoice_number || has_tax_id {
        None
    } else {
        Some(violation(
            "missing_identifier",
            Severity::Warning,
            "invoice has neither invoice_number nor vendor_tax_id",
        ))
    }
}

/// Validates a normalization-engine-coerced JSON value and scores it.
pub fn validate_and_score(raw: &Value, amount_tolerance: f64) -> ValidationOutcome {
    let normalized: NormalizedRecord = match serde_json::from_value(raw.clone()) {
        Ok(r) => r,
        Err(e) => return ValidationOutcome::SchemaInvalid { message: e.to_string() },
    };

    let errors = structural_errors(&normalized);
    if !errors.is_empty() {
        return ValidationOutcome::SchemaInvalid { message: errors.join("; ") };
    }

    let mut violations = Vec::new();
    violations.extend(amount_mismatch(&normalized, amount_tolerance));
    violations.extend(line_item_sum_violation(&normalized, amount_tolerance));
    violations.extend(missing_identifier_violation(&normalized));

    let error_count = violations.iter().filter(|v| v.severity == Severity::Error).count();
    let is_valid = error_count == 0;
    let validation_score = (((1.0 - violations.len() as f64 / 3.0).max(0.0)) * 10000.0).round() / 10000.0;

    let record = CanonicalRecord::from_normalized(normalized, validation_score);

    ValidationOutcome::Validated(ValidatedDocument { record, violations, validation_score, is_valid })
}
