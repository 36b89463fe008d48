//! Alias-driven field coercion, OCR-assisted date/line-item recovery, and
//! subset-sum reconciliation against a declared subtotal.
//!
//! `coerce` is the single choke point where untyped model output crosses
//! into the canonical-record shape: everything upstream of it is
//! dynamic JSON, everything downstream (the validator) is typed.

use chrono::{Datelike, NaiveDate, Utc};
use ivp_schemas::{ExtractionPayload, LineItem};
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::OnceLock;

const DATE_FORMATS: &[&str] =
    &["%Y-%m-%d", "%d-%m-%Y", "%d/%m/%Y", "%m/%d/%Y", "%B %d, %Y", "%b %d, %Y"];

fn ocr_date_candidate_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(\d{1,2}[/-]\d{1,2}[/-]\d{2,4}|\d{4}[/-]\d{1,2}[/-]\d{1,2})\b").unwrap()
    })
}

fn ocr_line_item_strict_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?P<desc>.+?) (?P<qty>\d+(?:\.\d+)?) (?P<unit>\$?\d[\d,]*(?:\.\d+)?) (?P<total>\$?\d[\d,]*(?:\.\d+)?)$",
        )
        .unwrap()
    })
}

fn ocr_line_item_relaxed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?P<desc>.+?) (?P<total>\d[\d,]*(?:\.\d+)?)$").unwrap())
}

/// Operator-extensible alias/keyword tables loaded from the normalization
/// rules JSON file. Treated as an immutable snapshot for the
/// lifetime of a poll cycle — see `ivp-config::load_rules_file`.
#[derive(Debug, Clone)]
pub struct NormalizationRules {
    pub field_aliases: HashMap<String, Vec<String>>,
    pub line_item_aliases: HashMap<String, Vec<String>>,
    /// Ordered, not a map: resolution walks this in config-declaration order
    /// and the first method whose keywords match wins (see `coerce`). A
    /// `HashMap` here would make "first match wins" nondeterministic.
    pub payment_method_map: Vec<(String, Vec<String>)>,
    pub line_item_ignore_keywords: Vec<String>,
    pub amount_tolerance: f64,
    pub default_currency: String,
    pub default_document_type: String,
    pub default_confidence: f64,
}

impl NormalizationRules {
    /// Parses a rules object loaded via `ivp_config::load_rules_file`.
    pub fn from_json(v: &Value) -> Self {
        let field_aliases = string_list_map(v.get("field_aliases"));
        let line_item_aliases = string_list_map(v.get("line_item_aliases"));
        let payment_method_map = ordered_string_list_map(v.get("payment_method_map"));
        let line_item_ignore_keywords = v
            .get("line_item_ignore_keywords")
            .and_then(|x| x.as_array())
            .map(|a| a.iter().filter_map(|s| s.as_str().map(str::to_lowercase)).collect())
            .unwrap_or_default();
        let amount_tolerance = v.get("amount_tolerance").and_then(|x| x.as_f64()).unwrap_or(0.01);
        let default_currency = v
            .get("default_currency")
            .and_then(|x| x.as_str())
            .unwrap_or("BDT")
            .to_string();
        let default_document_type = v
            .get("default_document_type")
            .and_then(|x| x.as_str())
            .unwrap_or("invoice")
            .to_string();
        let default_confidence = v.get("default_confidence").and_then(|x| x.as_f64()).unwrap_or(0.8);

        Self {
            field_aliases,
            line_item_aliases,
            payment_method_map,
            line_item_ignore_keywords,
            amount_tolerance,
            default_currency,
            default_document_type,
            default_confidence,
        }
    }

    /// The built-in defaults used when no rules file is configured; mirrors
    /// the shipped `config/normalization_rules.json`.
    pub fn builtin_defaults() -> Self {
        Self::from_json(&default_rules_json())
    }

    fn aliases_for(&self, canonical: &str) -> Vec<String> {
        self.field_aliases.get(canonical).cloned().unwrap_or_else(|| vec![canonical.to_string()])
    }

    fn item_aliases_for(&self, canonical: &str) -> Vec<String> {
        self.line_item_aliases.get(canonical).cloned().unwrap_or_else(|| vec![canonical.to_string()])
    }
}

fn string_list_map(v: Option<&Value>) -> HashMap<String, Vec<String>> {
    let mut out = HashMap::new();
    if let Some(Value::Object(map)) = v {
        for (k, val) in map {
            let list = val
                .as_array()
                .map(|a| a.iter().filter_map(|s| s.as_str().map(str::to_string)).collect())
                .unwrap_or_default();
            out.insert(k.clone(), list);
        }
    }
    out
}

/// Like `string_list_map` but keeps the JSON object's key order. Used for
/// `payment_method_map`, where resolution is a first-match walk rather than
/// a keyed lookup, so the order the operator declared the methods in is
/// load-bearing (serde_json's `preserve_order` feature keeps that order
/// through parsing).
fn ordered_string_list_map(v: Option<&Value>) -> Vec<(String, Vec<String>)> {
    let mut out = Vec::new();
    if let Some(Value::Object(map)) = v {
        for (k, val) in map {
            let list = val
                .as_array()
                .map(|a| a.iter().filter_map(|s| s.as_str().map(str::to_string)).collect())
                .unwrap_or_default();
            out.push((k.clone(), list));
        }
    }
    out
}

/// The shipped default ruleset, embedded so the engine works without an
/// external file and so `builtin_defaults` and the on-disk config agree.
pub fn default_rules_json() -> Value {
    serde_json::json!({
        "field_aliases": {
            "vendor_name": ["vendor_name", "vendor", "vendor.name", "merchant_name", "merchant", "company", "supplier"],
            "vendor_tax_id": ["vendor_tax_id", "tax_id", "vat_number", "vendor.tax_id"],
            "invoice_number": ["invoice_number", "invoice_no", "receipt_number", "receipt_no", "reference"],
            "invoice_date": ["invoice_date", "date", "order_date", "transaction_date"],
            "due_date": ["due_date", "payment_due"],
            "currency": ["currency", "currency_code"],
            "subtotal": ["subtotal", "sub_total", "net_amount"],
            "tax_amount": ["tax_amount", "tax", "vat", "vat_amount"],
            "total_amount": ["total_amount", "total", "grand_total", "amount_due"],
            "payment_method": ["payment_method", "payment_type", "method"],
            "document_type": ["document_type", "type"],
            "model_confidence": ["model_confidence", "confidence"],
            "line_items": ["line_items", "items", "lineItems"]
        },
        "line_item_aliases": {
            "description": ["description", "desc", "name", "item"],
            "quantity": ["quantity", "qty"],
            "unit_price": ["unit_price", "price", "rate"],
            "line_total": ["line_total", "total", "amount"],
            "category": ["category", "type"]
        },
        "payment_method_map": {
            "card": ["card", "credit", "debit", "visa", "mastercard"],
            "cash": ["cash"],
            "bank": ["bank", "transfer", "wire", "ach"]
        },
        "line_item_ignore_keywords": ["subtotal", "discount", "tax", "total", "vat", "service charge"],
        "amount_tolerance": 0.01,
        "default_currency": "BDT",
        "default_document_type": "invoice",
        "default_confidence": 0.8
    })
}

fn is_empty_value(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn resolve_dotted<'a>(obj: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut cur = obj.get(first)?;
    for part in parts {
        cur = cur.as_object()?.get(part)?;
    }
    Some(cur)
}

fn pick_field(obj: &Map<String, Value>, aliases: &[String]) -> Option<Value> {
    for alias in aliases {
        if let Some(v) = resolve_dotted(obj, alias) {
            if !is_empty_value(v) {
                return Some(v.clone());
            }
        }
    }
    None
}

fn parse_amount(v: Option<&Value>) -> Option<f64> {
    match v {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => {
            let cleaned: String =
                s.chars().filter(|c| c.is_ascii_digit() || *c == ',' || *c == '.' || *c == '-').collect();
            let cleaned = cleaned.replace(',', "");
            if cleaned.is_empty() || cleaned == "-" {
                None
            } else {
                cleaned.parse::<f64>().ok()
            }
        }
        _ => None,
    }
}

fn parse_date_strict(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    DATE_FORMATS.iter().find_map(|fmt| NaiveDate::parse_from_str(trimmed, fmt).ok())
}

fn recover_date_from_ocr(ocr_text: &str) -> Option<NaiveDate> {
    for cap in ocr_date_candidate_re().find_iter(ocr_text) {
        if let Some(d) = parse_date_strict(cap.as_str()) {
            return Some(d);
        }
    }
    None
}

fn stringify_vendor(v: &Value) -> String {
    if let Some(obj) = v.as_object() {
        if let Some(name) = obj.get("name").and_then(|n| n.as_str()) {
            return name.trim().to_string();
        }
    }
    match v {
        Value::String(s) => s.trim().to_string(),
        Value::Null => String::new(),
        other => other.to_string().trim_matches('"').to_string(),
    }
}

fn description_is_ignored(description: &str, ignore_keywords: &[String]) -> bool {
    let lower = description.to_lowercase();
    ignore_keywords.iter().any(|kw| lower.contains(kw.as_str()))
}

fn coerce_line_item(obj: &Map<String, Value>, rules: &NormalizationRules) -> LineItem {
    let description = pick_field(obj, &rules.item_aliases_for("description"))
        .map(|v| stringify_vendor(&v))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "Unknown Item".to_string());
    let quantity = parse_amount(pick_field(obj, &rules.item_aliases_for("quantity")).as_ref())
        .unwrap_or(1.0)
        .max(0.0001);
    let unit_price =
        parse_amount(pick_field(obj, &rules.item_aliases_for("unit_price")).as_ref()).unwrap_or(0.0).max(0.0);
    let line_total = parse_amount(pick_field(obj, &rules.item_aliases_for("line_total")).as_ref())
        .unwrap_or(quantity * unit_price)
        .max(0.0);
    let category =
        pick_field(obj, &rules.item_aliases_for("category")).map(|v| stringify_vendor(&v)).filter(|s| !s.is_empty());

    LineItem { description, quantity, unit_price, line_total, category }
}

fn recover_line_items_from_ocr(ocr_text: &str, ignore_keywords: &[String]) -> Vec<LineItem> {
    let mut out = Vec::new();
    for raw_line in ocr_text.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }

        let item = if let Some(caps) = ocr_line_item_strict_re().captures(line) {
            let description = caps.name("desc").unwrap().as_str().trim().to_string();
            let quantity = caps.name("qty").unwrap().as_str().parse::<f64>().unwrap_or(1.0).max(0.0001);
            let unit_price = parse_money_token(caps.name("unit").unwrap().as_str()).unwrap_or(0.0);
            let line_total = parse_money_token(caps.name("total").unwrap().as_str()).unwrap_or(quantity * unit_price);
            Some(LineItem { description, quantity, unit_price, line_total, category: None })
        } else if let Some(caps) = ocr_line_item_relaxed_re().captures(line) {
            let description = caps.name("desc").unwrap().as_str().trim().to_string();
            let total = parse_money_token(caps.name("total").unwrap().as_str()).unwrap_or(0.0);
            Some(LineItem { description, quantity: 1.0, unit_price: total, line_total: total, category: None })
        } else {
            None
        };

        if let Some(item) = item {
            if item.line_total > 0.0 && !description_is_ignored(&item.description, ignore_keywords) {
                out.push(item);
            }
        }
    }
    out
}

fn parse_money_token(raw: &str) -> Option<f64> {
    let cleaned: String = raw.chars().filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',').collect();
    cleaned.replace(',', "").parse::<f64>().ok()
}

/// Subset-sum reconciliation: selects the subset of
/// `items` whose total most closely matches `target`, discarding spurious
/// rows (subtotal lines, discounts, duplicated summaries). Bounded by an
/// item-count cap to keep the DP tractable on adversarial input.
pub fn reconcile_line_items(items: Vec<LineItem>, target: f64, tolerance: f64) -> Vec<LineItem> {
    const MAX_ITEMS_FOR_DP: usize = 50;

    if items.len() <= 1 || target <= 0.0 {
        return items;
    }
    if items.len() > MAX_ITEMS_FOR_DP {
        return items;
    }

    let to_cents = |v: f64| -> i64 { (v * 100.0).round() as i64 };
    let target_cents = to_cents(target);
    let tolerance_cents = to_cents(tolerance).max(0);
    let item_cents: Vec<i64> = items.iter().map(|it| to_cents(it.line_total)).collect();
    let sum_cents: i64 = item_cents.iter().sum();

    if (sum_cents - target_cents).abs() <= tolerance_cents {
        return items;
    }
    if sum_cents < target_cents {
        return items;
    }

    let cap = target_cents + tolerance_cents;
    let mut order: Vec<i64> = vec![0];
    let mut picks: HashMap<i64, Vec<usize>> = HashMap::new();
    picks.insert(0, Vec::new());

    for (idx, &v) in item_cents.iter().enumerate() {
        if v <= 0 {
            continue;
        }
        let snapshot: Vec<(i64, Vec<usize>)> = order.iter().map(|s| (*s, picks[s].clone())).collect();
        for (s, picked) in snapshot {
            let new_sum = s + v;
            if new_sum <= cap && !picks.contains_key(&new_sum) {
                let mut next = picked.clone();
                next.push(idx);
                picks.insert(new_sum, next);
                order.push(new_sum);
            }
        }
    }

    let best_sum = order.iter().copied().max().unwrap_or(0);
    if best_sum == 0 {
        return items;
    }

    let chosen = &picks[&best_sum];
    chosen.iter().map(|&i| items[i].clone()).collect()
}

/// Coerces a raw extractor payload into a canonical-record-shaped JSON
/// object, ready for schema validation.
pub fn coerce(payload: &ExtractionPayload, rules: &NormalizationRules) -> Value {
    let fields = &payload.fields;
    let ocr_text = payload._ocr_text.as_deref();

    let total_amount =
        parse_amount(pick_field(fields, &rules.aliases_for("total_amount")).as_ref()).unwrap_or(0.0).max(0.0);
    let subtotal = parse_amount(pick_field(fields, &rules.aliases_for("subtotal")).as_ref())
        .unwrap_or(total_amount)
        .max(0.0);
    let tax_amount = parse_amount(pick_field(fields, &rules.aliases_for("tax_amount")).as_ref())
        .unwrap_or((total_amount - subtotal).max(0.0))
        .max(0.0);

    let model_confidence = parse_amount(pick_field(fields, &rules.aliases_for("model_confidence")).as_ref())
        .unwrap_or(rules.default_confidence)
        .clamp(0.0, 1.0);

    let invoice_date = pick_field(fields, &rules.aliases_for("invoice_date"))
        .and_then(|v| v.as_str().map(str::to_string))
        .and_then(|s| parse_date_strict(&s))
        .or_else(|| ocr_text.and_then(recover_date_from_ocr))
        .unwrap_or_else(|| Utc::now().date_naive());
    let due_date = pick_field(fields, &rules.aliases_for("due_date"))
        .and_then(|v| v.as_str().map(str::to_string))
        .and_then(|s| parse_date_strict(&s))
        .map(|d| d.format("%Y-%m-%d").to_string());

    let vendor_name = pick_field(fields, &rules.aliases_for("vendor_name"))
        .map(|v| stringify_vendor(&v))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "Unknown Vendor".to_string());
    let vendor_tax_id = pick_field(fields, &rules.aliases_for("vendor_tax_id")).map(|v| stringify_vendor(&v)).filter(|s| !s.is_empty());
    let invoice_number = pick_field(fields, &rules.aliases_for("invoice_number")).map(|v| stringify_vendor(&v)).filter(|s| !s.is_empty());

    let currency = pick_field(fields, &rules.aliases_for("currency"))
        .and_then(|v| v.as_str().map(|s| s.to_uppercase()))
        .filter(|s| s.chars().count() == 3)
        .unwrap_or_else(|| rules.default_currency.clone());

    let document_type = pick_field(fields, &rules.aliases_for("document_type"))
        .and_then(|v| v.as_str().map(str::to_lowercase))
        .filter(|s| s == "invoice" || s == "receipt")
        .unwrap_or_else(|| rules.default_document_type.clone());

    let payment_text = pick_field(fields, &rules.aliases_for("payment_method"))
        .map(|v| stringify_vendor(&v).to_lowercase())
        .unwrap_or_default();
    let payment_method = rules
        .payment_method_map
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|kw| payment_text.contains(kw.as_str())))
        .map(|(method, _)| method.clone())
        .unwrap_or_else(|| "unknown".to_string());

    let raw_items = pick_field(fields, &rules.aliases_for("line_items"));
    let mut line_items: Vec<LineItem> = raw_items
        .as_ref()
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|item| item.as_object())
                .map(|obj| coerce_line_item(obj, rules))
                .filter(|it| !description_is_ignored(&it.description, &rules.line_item_ignore_keywords))
                .collect()
        })
        .unwrap_or_default();

    let needs_ocr_recovery = line_items.is_empty() || line_items.iter().all(|it| it.line_total <= 0.0);
    if needs_ocr_recovery {
        if let Some(text) = ocr_text {
            let recovered = recover_line_items_from_ocr(text, &rules.line_item_ignore_keywords);
            if !recovered.is_empty() {
                line_items = recovered;
            }
        }
    }

    line_items.retain(|it| !description_is_ignored(&it.description, &rules.line_item_ignore_keywords));

    let reconcile_target = if subtotal > 0.0 { subtotal } else { total_amount };
    if line_items.len() > 1 && reconcile_target > 0.0 {
        line_items = reconcile_line_items(line_items, reconcile_target, rules.amount_tolerance);
    }

    serde_json::json!({
        "document_type": document_type,
        "vendor_name": vendor_name,
        "vendor_tax_id": vendor_tax_id,
        "invoice_number": invoice_number,
        "invoice_date": invoice_date.format("%Y-%m-%d").to_string(),
        "due_date": due_date,
        "currency": currency,
        "subtotal": subtotal,
        "tax_amount": tax_amount,
        "total_amount": total_amount,
        "payment_method": payment_method,
        "line_items": line_items,
        "model_confidence": model_confidence,
    })
}

/// `coerce` applied to its own output must be a fixed point:
/// re-running normalization on the already-canonical shape changes nothing.
pub fn coerce_value(raw: &Value, rules: &NormalizationRules) -> Value {
    let fields = raw.as_object().cloned().unwrap_or_default();
    let payload = ExtractionPayload {
        fields,
        _ocr_text: raw.get("_ocr_text").and_then(|v| v.as_str()).map(str::to_string),
        _provider: raw.get("_provider").and_then(|v| v.as_str()).map(str::to_string),
    };
    coerce(&payload, rules)
}
