use std::env;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result, bail};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::config::ModelSettings;
use crate::telemetry::ServiceTelemetry;

const PROMPT_PREVIEW_LIMIT: usize = 160;

/// Finish reasons that mean the candidate text must not be relayed.
const BLOCKING_FINISH_REASONS: &[&str] = &[
    "SAFETY",
    "RECITATION",
    "BLOCKLIST",
    "PROHIBITED_CONTENT",
    "SPII",
    "OTHER",
];

/// A single piece of content sent to the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentPart {
    Text(String),
    InlineData { mime_type: String, data: Vec<u8> },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text(text.into())
    }

    pub fn inline_data(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        ContentPart::InlineData {
            mime_type: mime_type.into(),
            data,
        }
    }

    fn to_gemini(&self) -> Value {
        match self {
            ContentPart::Text(text) => json!({ "text": text }),
            ContentPart::InlineData { mime_type, data } => json!({
                "inlineData": {
                    "mimeType": mime_type,
                    "data": STANDARD.encode(data),
                }
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Model,
}

impl ChatRole {
    fn as_gemini_role(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Model => "model",
        }
    }
}

impl fmt::Display for ChatRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_gemini_role())
    }
}

/// One turn of dialogue: who spoke and what they sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub parts: Vec<ContentPart>,
}

impl ChatTurn {
    pub fn user(parts: Vec<ContentPart>) -> Self {
        Self {
            role: ChatRole::User,
            parts,
        }
    }

    pub fn model(reply: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Model,
            parts: vec![ContentPart::text(reply)],
        }
    }

    fn to_gemini(&self) -> Value {
        json!({
            "role": self.role.as_gemini_role(),
            "parts": self.parts.iter().map(ContentPart::to_gemini).collect::<Vec<_>>(),
        })
    }
}

/// Accumulated dialogue history handed back to the model on every turn.
///
/// Callers treat this as an opaque handle: it is created by
/// [`GenerativeModel::start_chat`] and advanced by
/// [`GenerativeModel::send_message`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conversation {
    history: Vec<ChatTurn>,
}

impl Conversation {
    pub fn from_history(history: Vec<ChatTurn>) -> Self {
        Self { history }
    }

    pub fn history(&self) -> &[ChatTurn] {
        &self.history
    }

    fn push_exchange(&mut self, user: ChatTurn, reply: &str) {
        self.history.push(user);
        self.history.push(ChatTurn::model(reply));
    }
}

/// Capability surface of the remote generative model.
pub trait GenerativeModel: Send + Sync {
    /// Issue a single request with no prior history and return the reply text.
    fn generate_content(&self, parts: &[ContentPart]) -> Result<String>;

    /// Continue `conversation` with a user message. The conversation only
    /// gains the new exchange when the call succeeds.
    fn send_message(&self, conversation: &mut Conversation, text: &str) -> Result<String>;

    /// Seed a new conversation from an existing history.
    fn start_chat(&self, history: Vec<ChatTurn>) -> Conversation {
        Conversation::from_history(history)
    }

    /// Name of the backing model, for logs and health reports.
    fn model_name(&self) -> &str;

    fn has_credentials(&self) -> bool {
        true
    }

    fn metrics(&self) -> Option<ModelMetricsSnapshot> {
        None
    }
}

/// Gemini `generateContent` client.
pub struct GeminiModel<H: AiHttp = BlockingAiHttp> {
    settings: ModelSettings,
    api_key: Option<String>,
    http: H,
    metrics: Arc<ModelMetrics>,
    telemetry: Option<ServiceTelemetry>,
}

impl GeminiModel<BlockingAiHttp> {
    pub fn from_settings(settings: &ModelSettings) -> Self {
        let http = BlockingAiHttp::new(settings.request_timeout_secs.map(Duration::from_secs));
        Self::with_http(settings, http)
    }
}

impl<H: AiHttp> GeminiModel<H> {
    pub fn with_http(settings: &ModelSettings, http: H) -> Self {
        Self {
            settings: settings.clone(),
            api_key: None,
            http,
            metrics: Arc::new(ModelMetrics::default()),
            telemetry: None,
        }
    }

    /// Use an explicit credential instead of reading `api_key_env` per request.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_telemetry(mut self, telemetry: ServiceTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some() || self.require_api_key().is_ok()
    }

    pub fn metrics_snapshot(&self) -> ModelMetricsSnapshot {
        self.metrics.snapshot()
    }

    fn endpoint_url(&self) -> String {
        let path = self.settings.chat_path.replace("{model}", &self.settings.model);
        join_endpoint(&self.settings.endpoint, &path)
    }

    fn require_api_key(&self) -> Result<String> {
        if let Some(key) = &self.api_key {
            return Ok(key.clone());
        }
        let env_key = &self.settings.api_key_env;
        let value = env::var(env_key)
            .with_context(|| format!("Environment variable {env_key} not found for the model API key"))?;
        if value.trim().is_empty() {
            bail!("Environment variable {env_key} for the model API key is empty");
        }
        Ok(value)
    }

    fn build_payload(&self, contents: &[ChatTurn]) -> Value {
        let mut payload = json!({
            "contents": contents.iter().map(ChatTurn::to_gemini).collect::<Vec<_>>(),
        });

        let mut generation = Map::new();
        if let Some(temperature) = self.settings.temperature {
            generation.insert("temperature".into(), json!(temperature));
        }
        if let Some(max_tokens) = self.settings.max_output_tokens {
            generation.insert("maxOutputTokens".into(), json!(max_tokens));
        }
        if !generation.is_empty() {
            payload["generationConfig"] = Value::Object(generation);
        }
        payload
    }

    fn generate(&self, contents: &[ChatTurn]) -> Result<String> {
        let started = Instant::now();
        let result = self.post_contents(contents);
        let latency_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => {
                self.metrics.record_success(contents, latency_ms);
                self.record_telemetry_success(contents, latency_ms);
            }
            Err(err) => {
                self.metrics.record_error(err);
                self.record_telemetry_error(contents, err);
            }
        }
        result
    }

    fn post_contents(&self, contents: &[ChatTurn]) -> Result<String> {
        let api_key = self.require_api_key()?;
        let url = self.endpoint_url();
        let headers = vec![
            ("content-type".to_string(), "application/json".to_string()),
            ("x-goog-api-key".to_string(), api_key),
        ];
        let payload = self.build_payload(contents);

        debug!(model = %self.settings.model, turns = contents.len(), "Posting generateContent request");
        let response = self.http.post_json(&url, &headers, &payload)?;
        let parsed: GeminiChatResponse = serde_json::from_value(response)
            .with_context(|| "Malformed response from Gemini endpoint".to_string())?;
        parsed.text()
    }

    fn record_telemetry_success(&self, contents: &[ChatTurn], latency_ms: u64) {
        let Some(telemetry) = &self.telemetry else {
            return;
        };
        let details = json!({
            "model": self.settings.model,
            "result": "success",
            "latency_ms": latency_ms,
            "prompt_preview": prompt_preview(contents),
            "history_turns": contents.len().saturating_sub(1),
            "image_parts": image_part_count(contents),
        });
        telemetry.record_metric("model_success", details);
    }

    fn record_telemetry_error(&self, contents: &[ChatTurn], error: &anyhow::Error) {
        let Some(telemetry) = &self.telemetry else {
            return;
        };
        let details = json!({
            "model": self.settings.model,
            "result": "error",
            "error": error.to_string(),
            "prompt_preview": prompt_preview(contents),
            "history_turns": contents.len().saturating_sub(1),
            "image_parts": image_part_count(contents),
        });
        telemetry.record_metric("model_error", details);
    }
}

impl<H: AiHttp + Send + Sync> GenerativeModel for GeminiModel<H> {
    fn generate_content(&self, parts: &[ContentPart]) -> Result<String> {
        if parts.is_empty() {
            bail!("prompt must include text or an image");
        }
        self.generate(&[ChatTurn::user(parts.to_vec())])
    }

    fn send_message(&self, conversation: &mut Conversation, text: &str) -> Result<String> {
        let user = ChatTurn::user(vec![ContentPart::text(text)]);
        let mut contents = conversation.history.clone();
        contents.push(user.clone());
        let reply = self.generate(&contents)?;
        conversation.push_exchange(user, &reply);
        Ok(reply)
    }

    fn model_name(&self) -> &str {
        &self.settings.model
    }

    fn has_credentials(&self) -> bool {
        self.has_api_key()
    }

    fn metrics(&self) -> Option<ModelMetricsSnapshot> {
        Some(self.metrics.snapshot())
    }
}

#[derive(Debug, Default)]
struct ModelMetrics {
    inner: Mutex<ModelMetricsInternal>,
}

#[derive(Debug, Default)]
struct ModelMetricsInternal {
    total_requests: u64,
    success_count: u64,
    error_count: u64,
    total_latency_ms: u64,
    last_latency_ms: Option<u64>,
    last_error: Option<String>,
    last_prompt_preview: Option<String>,
    last_updated: Option<SystemTime>,
}

/// Point-in-time view of model call counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ModelMetricsSnapshot {
    pub total_requests: u64,
    pub success_count: u64,
    pub error_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_prompt_preview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<SystemTime>,
}

impl ModelMetrics {
    fn snapshot(&self) -> ModelMetricsSnapshot {
        let guard = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let average_latency_ms = if guard.success_count > 0 {
            Some(guard.total_latency_ms / guard.success_count)
        } else {
            None
        };
        ModelMetricsSnapshot {
            total_requests: guard.total_requests,
            success_count: guard.success_count,
            error_count: guard.error_count,
            average_latency_ms,
            last_latency_ms: guard.last_latency_ms,
            last_error: guard.last_error.clone(),
            last_prompt_preview: guard.last_prompt_preview.clone(),
            last_updated: guard.last_updated,
        }
    }

    fn record_success(&self, contents: &[ChatTurn], latency_ms: u64) {
        let mut guard = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.total_requests = guard.total_requests.saturating_add(1);
        guard.success_count = guard.success_count.saturating_add(1);
        guard.total_latency_ms = guard.total_latency_ms.saturating_add(latency_ms);
        guard.last_latency_ms = Some(latency_ms);
        guard.last_error = None;
        guard.last_prompt_preview = prompt_preview(contents);
        guard.last_updated = Some(SystemTime::now());
    }

    fn record_error(&self, error: &anyhow::Error) {
        let mut guard = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.total_requests = guard.total_requests.saturating_add(1);
        guard.error_count = guard.error_count.saturating_add(1);
        guard.last_error = Some(error.to_string());
        guard.last_updated = Some(SystemTime::now());
    }
}

fn last_user_text(contents: &[ChatTurn]) -> Option<&str> {
    contents
        .iter()
        .rev()
        .find(|turn| turn.role == ChatRole::User)
        .and_then(|turn| {
            turn.parts.iter().find_map(|part| match part {
                ContentPart::Text(text) => Some(text.as_str()),
                ContentPart::InlineData { .. } => None,
            })
        })
}

fn prompt_preview(contents: &[ChatTurn]) -> Option<String> {
    let trimmed = last_user_text(contents)?.trim();
    if trimmed.is_empty() {
        return None;
    }
    let mut preview = trimmed
        .chars()
        .take(PROMPT_PREVIEW_LIMIT)
        .collect::<String>();
    if trimmed.chars().count() > PROMPT_PREVIEW_LIMIT {
        preview.push('…');
    }
    Some(preview)
}

fn image_part_count(contents: &[ChatTurn]) -> usize {
    contents
        .iter()
        .flat_map(|turn| turn.parts.iter())
        .filter(|part| matches!(part, ContentPart::InlineData { .. }))
        .count()
}

fn join_endpoint(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

pub trait AiHttp {
    fn post_json(&self, url: &str, headers: &[(String, String)], body: &Value) -> Result<Value>;
}

/// Blocking `reqwest` transport. Only call it from blocking worker threads.
///
/// A client is built per request so it never outlives the worker thread.
pub struct BlockingAiHttp {
    timeout: Option<Duration>,
}

impl BlockingAiHttp {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    fn client(&self) -> Result<Client> {
        let mut builder = Client::builder().user_agent(concat!(
            "imagechat/",
            env!("CARGO_PKG_VERSION")
        ));
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        builder.build().context("failed to build model HTTP client")
    }
}

impl Default for BlockingAiHttp {
    fn default() -> Self {
        Self::new(None)
    }
}

impl AiHttp for BlockingAiHttp {
    fn post_json(&self, url: &str, headers: &[(String, String)], body: &Value) -> Result<Value> {
        let mut request = self.client()?.post(url).json(body);
        request = apply_headers(request, headers)?;
        let response = request
            .send()
            .with_context(|| format!("Failed to post generateContent request to {url}"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            match api_error_message(&body) {
                Some(message) => bail!("model endpoint returned status {status}: {message}"),
                None => bail!("model endpoint returned status {status}"),
            }
        }
        response
            .json()
            .context("model endpoint returned non-JSON payload")
    }
}

fn api_error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value
        .get("error")
        .and_then(|error| error.get("message"))
        .and_then(Value::as_str)
        .map(|message| message.trim().to_string())
        .filter(|message| !message.is_empty())
}

fn apply_headers(builder: RequestBuilder, headers: &[(String, String)]) -> Result<RequestBuilder> {
    if headers.is_empty() {
        return Ok(builder);
    }
    let mut map = HeaderMap::new();
    for (key, value) in headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .with_context(|| format!("invalid header name: {key}"))?;
        let header_value = HeaderValue::from_str(value)
            .with_context(|| format!("invalid header value for {key}"))?;
        map.insert(name, header_value);
    }
    Ok(builder.headers(map))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiChatResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    prompt_feedback: Option<GeminiPromptFeedback>,
}

impl GeminiChatResponse {
    fn text(self) -> Result<String> {
        let Some(candidate) = self.candidates.into_iter().next() else {
            let reason = self
                .prompt_feedback
                .and_then(|feedback| feedback.block_reason)
                .unwrap_or_else(|| "no candidates returned".into());
            bail!("model response was blocked: {reason}");
        };

        if let Some(reason) = candidate.finish_reason.as_deref() {
            if BLOCKING_FINISH_REASONS.contains(&reason) {
                bail!("model response was blocked: {reason}");
            }
        }

        Ok(candidate
            .content
            .parts
            .into_iter()
            .filter_map(|part| part.text)
            .collect::<String>())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    #[serde(default)]
    content: GeminiContent,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}
