//! Routing policy: decides `STORED` vs `REVIEW_REQUIRED` from validity and
//! model confidence. Pure function, no I/O.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteStatus {
    Validated,
    ReviewRequired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingDecision {
    pub status: RouteStatus,
    pub reason_codes: Vec<String>,
}

/// `decide(is_valid, model_confidence, confidence_threshold)`.
pub fn decide(is_valid: bool, model_confidence: f64, confidence_threshold: f64) -> RoutingDecision {
    let mut reason_codes = Vec::new();
    if !is_valid {
        reason_codes.push("validation_failed".to_string());
    }
    if model_confidence < confidence_threshold {
        reason_codes.push("low_confidence".to_string());
    }

    let status = if reason_codes.is_empty() { RouteStatus::Validated } else { RouteStatus::ReviewRequired };
    RoutingDecision { status, reason_codes }
}
