//! Extraction orchestrator: mime-gated provider-fallback chain over vision
//! clients, with one corrective-prompt retry on malformed JSON output.
//!
//! Provider fallback and the corrective retry are deliberately separate
//! concerns: fallback iterates *across* providers on any failure;
//! the corrective retry loops *within* one provider, only on malformed
//! output.

use anyhow::{Context, Result};
use base64::Engine;
use ivp_config::Settings;
use serde_json::{Map, Value};
use std::fmt;
use std::path::Path;

const SYSTEM_PROMPT: &str = "Return strict JSON only. No markdown or prose.";
const USER_EXTRACTION_PROMPT: &str =
    "Extract invoice/receipt fields into one JSON object. Use null for unknown values.";
const CORRECTIVE_PROMPT: &str =
    "Your previous output was invalid. Return only one valid JSON object with no extra text.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionErrorCode {
    UnsupportedType,
    FileNotFound,
    MissingApiKey,
    UnsupportedProvider,
    InvalidJson,
    InvalidJsonShape,
    EmptyResponse,
    ProviderRequestFailed,
    AllProvidersFailed,
}

impl ExtractionErrorCode {
    pub fn as_str(&self) -> &'static str {
        use ExtractionErrorCode::*;
        match self {
            UnsupportedType => "unsupported_type",
            FileNotFound => "file_not_found",
            MissingApiKey => "missing_api_key",
            UnsupportedProvider => "unsupported_provider",
            InvalidJson => "invalid_json",
            InvalidJsonShape => "invalid_json_shape",
            EmptyResponse => "empty_response",
            ProviderRequestFailed => "provider_request_failed",
            AllProvidersFailed => "all_providers_failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtractionError {
    pub code: ExtractionErrorCode,
    pub message: String,
}

impl ExtractionError {
    pub fn new(code: ExtractionErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

impl fmt::Display for ExtractionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for ExtractionError {}

/// Resolves a file extension to its gated mime type. Centralized so no
/// provider adapter re-detects it.
pub fn mime_for_path(path: &Path) -> Result<&'static str, ExtractionError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => Ok("image/jpeg"),
        "png" => Ok("image/png"),
        "pdf" => Ok("application/pdf"),
        other => Err(ExtractionError::new(
            ExtractionErrorCode::UnsupportedType,
            format!("unsupported file extension: .{other}"),
        )),
    }
}

fn parse_json_payload(raw_text: &str) -> Result<Map<String, Value>, ExtractionError> {
    let value: Value = serde_json::from_str(raw_text)
        .map_err(|_| ExtractionError::new(ExtractionErrorCode::InvalidJson, "model returned invalid JSON"))?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(ExtractionError::new(
            ExtractionErrorCode::InvalidJsonShape,
            "model output must be a JSON object",
        )),
    }
}

/// Shared capability every provider adapter implements: encode the file and
/// return raw model text output intended to be valid JSON.
#[async_trait::async_trait]
pub trait VisionClient: Send + Sync {
    fn name(&self) -> &str;
    async fn extract_json(&self, file_path: &Path, model: &str, prompt: &str) -> Result<String, ExtractionError>;
}

/// Bounded retry around one provider HTTP call: transport failures and 5xx
/// responses get `ivp_retry`'s default backoff; 4xx is a request error, not
/// a transient fault, so it's returned to the caller on the first attempt.
/// This is independent of `MultiProviderClient`'s cross-provider fallback
/// and `finish_extraction`'s within-provider corrective retry — it only
/// covers the network hop underneath a single call to a single provider.
async fn post_json_with_retry<F>(build: F, label: &str) -> Result<(reqwest::StatusCode, Value), ExtractionError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let policy = ivp_retry::RetryPolicy::default();
    ivp_retry::run_with_retry(
        policy,
        || {
            let req = build();
            async move {
                let resp = req.send().await.with_context(|| format!("{label}: transport error"))?;
                let status = resp.status();
                let body: Value = resp.json().await.with_context(|| format!("{label}: decode failed"))?;
                if status.is_server_error() {
                    anyhow::bail!("{label}: http {}: {}", status.as_u16(), body);
                }
                Ok::<_, anyhow::Error>((status, body))
            }
        },
        |_e| true,
    )
    .await
    .map_err(|exhausted| ExtractionError::new(ExtractionErrorCode::ProviderRequestFailed, exhausted.to_string()))
}

fn data_uri(file_path: &Path, mime: &str) -> Result<String, ExtractionError> {
    let bytes = std::fs::read(file_path)
        .map_err(|e| ExtractionError::new(ExtractionErrorCode::FileNotFound, e.to_string()))?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    Ok(format!("data:{mime};base64,{encoded}"))
}

/// OpenAI-compatible chat-completions adapter (covers OpenRouter and Groq):
/// inline image data URI, JSON-object response format.
pub struct OpenAiCompatibleVisionClient {
    provider_name: String,
    base_url: String,
    api_key: String,
    extra_headers: Vec<(String, String)>,
    http: reqwest::Client,
}

impl OpenAiCompatibleVisionClient {
    pub fn new(provider_name: impl Into<String>, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            provider_name: provider_name.into(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            extra_headers: Vec::new(),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push((key.into(), value.into()));
        self
    }
}

#[async_trait::async_trait]
impl VisionClient for OpenAiCompatibleVisionClient {
    fn name(&self) -> &str {
        &self.provider_name
    }

    async fn extract_json(&self, file_path: &Path, model: &str, prompt: &str) -> Result<String, ExtractionError> {
        let mime = mime_for_path(file_path)?;
        let uri = data_uri(file_path, mime)?;

        let (status, body) = post_json_with_retry(
            || {
                let mut req = self
                    .http
                    .post(format!("{}/chat/completions", self.base_url.trim_end_matches('/')))
                    .bearer_auth(&self.api_key)
                    .json(&serde_json::json!({
                        "model": model,
                        "response_format": {"type": "json_object"},
                        "messages": [
                            {"role": "system", "content": SYSTEM_PROMPT},
                            {"role": "user", "content": [
                                {"type": "text", "text": prompt},
                                {"type": "image_url", "image_url": {"url": uri}},
                            ]},
                        ],
                    }));
                for (k, v) in &self.extra_headers {
                    req = req.header(k, v);
                }
                req
            },
            &self.provider_name,
        )
        .await?;
        if !status.is_success() {
            return Err(ExtractionError::new(
                ExtractionErrorCode::ProviderRequestFailed,
                format!("{} http {}: {}", self.provider_name, status.as_u16(), body),
            ));
        }

        let content = body
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str());
        match content {
            Some(text) if !text.trim().is_empty() => Ok(text.to_string()),
            _ => Err(ExtractionError::new(ExtractionErrorCode::EmptyResponse, format!("{} returned empty content", self.provider_name))),
        }
    }
}

/// Mistral's two-step OCR-then-chat adapter. Populates the pipeline's
/// `_ocr_text` slot via its return value's paired OCR text (see
/// `extract_with_ocr_text`).
pub struct MistralVisionClient {
    api_key: String,
    base_url: String,
    http: reqwest::Client,
}

impl MistralVisionClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self { api_key: api_key.into(), base_url: "https://api.mistral.ai/v1".to_string(), http: reqwest::Client::new() }
    }

    async fn ocr_text(&self, file_path: &Path) -> Result<String, ExtractionError> {
        let mime = mime_for_path(file_path)?;
        let uri = data_uri(file_path, mime)?;
        let (doc_type, doc_key) = if mime == "application/pdf" { ("document_url", "document_url") } else { ("image_url", "image_url") };

        let (status, body) = post_json_with_retry(
            || {
                self.http
                    .post(format!("{}/ocr", self.base_url))
                    .bearer_auth(&self.api_key)
                    .json(&serde_json::json!({
                        "model": "mistral-ocr-latest",
                        "document": {"type": doc_type, doc_key: uri},
                    }))
            },
            "mistral ocr",
        )
        .await?;
        if !status.is_success() {
            return Err(ExtractionError::new(ExtractionErrorCode::ProviderRequestFailed, format!("mistral ocr http {}", status.as_u16())));
        }

        let pages = body.get("pages").and_then(|p| p.as_array()).cloned().unwrap_or_default();
        let chunks: Vec<String> = pages
            .iter()
            .filter_map(|p| p.get("markdown").and_then(|m| m.as_str()))
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.to_string())
            .collect();
        if chunks.is_empty() {
            return Err(ExtractionError::new(ExtractionErrorCode::EmptyResponse, "mistral ocr returned no text"));
        }
        Ok(chunks.join("\n\n"))
    }

    /// Runs OCR then chat, returning both the raw model text and the OCR
    /// text so the pipeline can attach `_ocr_text`.
    pub async fn extract_with_ocr_text(&self, file_path: &Path, model: &str, prompt: &str) -> Result<(String, String), ExtractionError> {
        let ocr_text = self.ocr_text(file_path).await?;
        let (status, body) = post_json_with_retry(
            || {
                self.http
                    .post(format!("{}/chat/completions", self.base_url))
                    .bearer_auth(&self.api_key)
                    .json(&serde_json::json!({
                        "model": model,
                        "response_format": {"type": "json_object"},
                        "messages": [
                            {"role": "system", "content": SYSTEM_PROMPT},
                            {"role": "user", "content": format!("{prompt}\n\nExtract fields from this OCR text:\n{ocr_text}")},
                        ],
                    }))
            },
            "mistral chat",
        )
        .await?;
        if !status.is_success() {
            return Err(ExtractionError::new(ExtractionErrorCode::ProviderRequestFailed, format!("mistral chat http {}", status.as_u16())));
        }
        let content = body.get("choices").and_then(|c| c.get(0)).and_then(|c| c.get("message")).and_then(|m| m.get("content")).and_then(|c| c.as_str());
        match content {
            Some(text) if !text.trim().is_empty() => Ok((text.to_string(), ocr_text)),
            _ => Err(ExtractionError::new(ExtractionErrorCode::EmptyResponse, "mistral chat returned empty content")),
        }
    }
}

#[async_trait::async_trait]
impl VisionClient for MistralVisionClient {
    fn name(&self) -> &str {
        "mistral"
    }

    async fn extract_json(&self, file_path: &Path, model: &str, prompt: &str) -> Result<String, ExtractionError> {
        self.extract_with_ocr_text(file_path, model, prompt).await.map(|(text, _)| text)
    }
}

/// Walks an ordered provider list; each provider sees one call, on any
/// error the reason is recorded and the walk moves to the next provider.
pub struct MultiProviderClient {
    providers: Vec<(String, std::sync::Arc<dyn VisionClient>, String)>,
}

impl MultiProviderClient {
    pub fn new(providers: Vec<(String, std::sync::Arc<dyn VisionClient>, String)>) -> Self {
        Self { providers }
    }
}

#[async_trait::async_trait]
impl VisionClient for MultiProviderClient {
    fn name(&self) -> &str {
        "auto"
    }

    async fn extract_json(&self, file_path: &Path, model: &str, prompt: &str) -> Result<String, ExtractionError> {
        let mut errors = Vec::new();
        for (name, client, provider_model) in &self.providers {
            let active_model = if provider_model.is_empty() { model } else { provider_model };
            match client.extract_json(file_path, active_model, prompt).await {
                Ok(text) => return Ok(text),
                Err(e) => errors.push(format!("{name}: {e}")),
            }
        }
        Err(ExtractionError::new(ExtractionErrorCode::AllProvidersFailed, format!("all configured providers failed: {}", errors.join("; "))))
    }
}

fn default_model_for(provider: &str) -> &'static str {
    match provider {
        "mistral" => "pixtral-large-latest",
        "openrouter" => "mistralai/pixtral-12b",
        "groq" => "meta-llama/llama-4-scout-17b-16e-instruct",
        _ => "gpt-4o-mini",
    }
}

fn client_for_provider(provider: &str) -> Result<Option<std::sync::Arc<dyn VisionClient>>, ExtractionError> {
    match provider {
        "mistral" => Ok(Settings::provider_api_key("mistral").map(|k| std::sync::Arc::new(MistralVisionClient::new(k)) as _)),
        "openrouter" => Ok(Settings::provider_api_key("openrouter").map(|k| {
            std::sync::Arc::new(
                OpenAiCompatibleVisionClient::new("openrouter", "https://openrouter.ai/api/v1", k)
                    .with_header("HTTP-Referer", "https://example.invalid"),
            ) as _
        })),
        "groq" => Ok(Settings::provider_api_key("groq").map(|k| std::sync::Arc::new(OpenAiCompatibleVisionClient::new("groq", "https://api.groq.com/openai/v1", k)) as _)),
        "openai" | "gemini" => Ok(None), // no first-party crate for these in this workspace's stack; missing_api_key is correct
        other => Err(ExtractionError::new(ExtractionErrorCode::UnsupportedProvider, format!("unsupported provider: {other}"))),
    }
}

fn build_client(provider: &str, model_hint: &str, order: &[String]) -> Result<(std::sync::Arc<dyn VisionClient>, String), ExtractionError> {
    if matches!(provider, "auto" | "fallback" | "multi") {
        let mut providers = Vec::new();
        for name in order {
            if let Some(client) = client_for_provider(name)? {
                providers.push((name.clone(), client, default_model_for(name).to_string()));
            }
        }
        if providers.is_empty() {
            return Err(ExtractionError::new(ExtractionErrorCode::MissingApiKey, "no provider API key found for configured fallback chain"));
        }
        return Ok((std::sync::Arc::new(MultiProviderClient::new(providers)), "auto".to_string()));
    }

    match client_for_provider(provider)? {
        Some(client) => {
            let model = if model_hint != "auto" && !model_hint.is_empty() { model_hint.to_string() } else { default_model_for(provider).to_string() };
            Ok((client, model))
        }
        None => Err(ExtractionError::new(ExtractionErrorCode::MissingApiKey, format!("missing API key for provider: {provider}"))),
    }
}

/// The extractor's public contract. `_ocr_text` is populated only when the
/// resolved client is (or falls back through) the Mistral OCR-then-chat
/// adapter.
pub async fn extract(
    file_path: &Path,
    model_hint: &str,
    provider_hint: &str,
    provider_order: &[String],
    explicit_client: Option<std::sync::Arc<dyn VisionClient>>,
) -> Result<Map<String, Value>, ExtractionError> {
    if !file_path.exists() {
        return Err(ExtractionError::new(ExtractionErrorCode::FileNotFound, format!("file not found: {file_path:?}")));
    }
    mime_for_path(file_path)?;

    let (client, model, ocr_text) = if let Some(client) = explicit_client {
        (client, model_hint.to_string(), None)
    } else if provider_hint == "mistral" {
        let key = Settings::provider_api_key("mistral").ok_or_else(|| ExtractionError::new(ExtractionErrorCode::MissingApiKey, "missing API key for provider: mistral"))?;
        let mistral = MistralVisionClient::new(key);
        let model = if model_hint != "auto" && !model_hint.is_empty() { model_hint.to_string() } else { default_model_for("mistral").to_string() };
        let (text, ocr) = mistral.extract_with_ocr_text(file_path, &model, USER_EXTRACTION_PROMPT).await?;
        return finish_extraction(&mistral, file_path, &model, text, Some(ocr));
    } else {
        let (client, model) = build_client(provider_hint, model_hint, provider_order)?;
        (client, model, None)
    };

    let first_text = client.extract_json(file_path, &model, USER_EXTRACTION_PROMPT).await?;
    finish_extraction(client.as_ref(), file_path, &model, first_text, ocr_text)
}

async fn finish_extraction(
    client: &dyn VisionClient,
    file_path: &Path,
    model: &str,
    first_text: String,
    ocr_text: Option<String>,
) -> Result<Map<String, Value>, ExtractionError> {
    let parsed = match parse_json_payload(&first_text) {
        Ok(map) => map,
        Err(e) if matches!(e.code, ExtractionErrorCode::InvalidJson | ExtractionErrorCode::InvalidJsonShape) => {
            let corrective_text = client.extract_json(file_path, model, CORRECTIVE_PROMPT).await?;
            parse_json_payload(&corrective_text)?
        }
        Err(e) => return Err(e),
    };

    let mut out = parsed;
    out.insert("_provider".to_string(), Value::String(client.name().to_string()));
    if let Some(ocr) = ocr_text {
        out.insert("_ocr_text".to_string(), Value::String(ocr));
    }
    Ok(out)
}
