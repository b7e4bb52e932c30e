//! Two Model Gateway backends (`gemini`, `openai`) behind one synchronous,
//! callback-driven contract. There is no async runtime in this workbench:
//! every streamed chunk arrives via a blocking read on the caller's thread,
//! and `onEvent` is invoked once per [`GatewayEvent`] in order.
//!
//! SDK-specific request/response shapes, auth conventions, and role-name
//! mapping are confined to [`GeminiGateway`] and [`OpenAiGateway`]; callers
//! depend only on the [`ModelGateway`] trait.

use chrono::{DateTime, NaiveDateTime, Utc};
use codeforge_core::{
    CancellationToken, GatewayCallback, GatewayEvent, History, MessageRole, ModelParameters,
    OpenAiParameters, UsageMetadata,
};
use codeforge_errors::{ConfigError, GatewayError};
use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use reqwest::header::RETRY_AFTER;
use serde_json::{Value, json};
use std::io::BufRead;
use std::thread;
use std::time::Duration;

const MAX_RETRIES: u8 = 4;
const RETRY_BASE_MS: u64 = 1000;

pub const GEMINI_API_KEY_VAR: &str = "CODEFORGE_GEMINI_API_KEY";
pub const OPENAI_API_KEY_VAR: &str = "CODEFORGE_OPENAI_API_KEY";

/// Uniform contract every backend implements. `send` never returns a
/// `Result`: failures surface as a `GatewayEvent::Error` through `on_event`
/// so that callers have exactly one place (the callback) to watch for the
/// end of a turn, whether it ended in success, error, or cancellation.
pub trait ModelGateway {
    fn send(
        &self,
        system_prompt: &str,
        history: &History,
        user_prompt: &str,
        streaming: bool,
        cancel: &CancellationToken,
        on_event: GatewayCallback,
    );
}

/// Resolves an API key from the process environment only. Config-file
/// fallback is deliberately unsupported for secrets; see the Open Questions
/// in DESIGN.md.
pub fn api_key_from_env(var: &'static str) -> Result<String, ConfigError> {
    std::env::var(var).map_err(|_| ConfigError::MissingApiKey(var))
}

// ── Gemini backend ──────────────────────────────────────────────────────

pub struct GeminiGateway {
    cfg: ModelParameters,
    api_key: String,
    client: Client,
    endpoint_base: String,
}

impl GeminiGateway {
    pub fn new(cfg: ModelParameters, api_key: String) -> Self {
        Self::with_endpoint_base(
            cfg,
            api_key,
            "https://generativelanguage.googleapis.com/v1beta".to_string(),
        )
    }

    pub fn with_endpoint_base(cfg: ModelParameters, api_key: String, endpoint_base: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("reqwest client");
        Self {
            cfg,
            api_key,
            client,
            endpoint_base,
        }
    }

    fn contents_payload(&self, history: &History, user_prompt: &str) -> Value {
        let mut contents: Vec<Value> = history
            .iter()
            .map(|m| {
                let role = match m.role {
                    MessageRole::User => "user",
                    MessageRole::Model => "model",
                };
                json!({"role": role, "parts": [{"text": m.text}]})
            })
            .collect();
        contents.push(json!({"role": "user", "parts": [{"text": user_prompt}]}));
        json!(contents)
    }

    fn payload(&self, system_prompt: &str, history: &History, user_prompt: &str) -> Value {
        json!({
            "systemInstruction": {"parts": [{"text": system_prompt}]},
            "contents": self.contents_payload(history, user_prompt),
            "generationConfig": {
                "temperature": self.cfg.temperature,
                "topP": self.cfg.top_p,
                "topK": self.cfg.top_k,
            }
        })
    }

    fn url(&self, streaming: bool) -> String {
        let method = if streaming {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        format!(
            "{}/models/{}:{}{}key={}",
            self.endpoint_base,
            self.cfg.model,
            method,
            if method.contains('?') { "&" } else { "?" },
            self.api_key
        )
    }
}

impl ModelGateway for GeminiGateway {
    fn send(
        &self,
        system_prompt: &str,
        history: &History,
        user_prompt: &str,
        streaming: bool,
        cancel: &CancellationToken,
        on_event: GatewayCallback,
    ) {
        let payload = self.payload(system_prompt, history, user_prompt);
        let url = self.url(streaming);

        let response = match send_with_retries(&self.client, &url, &payload, "gemini", cancel) {
            Ok(Some(resp)) => resp,
            Ok(None) => return, // cancelled before any bytes arrived
            Err(err) => {
                on_event(GatewayEvent::Error(err.to_string()));
                return;
            }
        };

        if streaming {
            stream_gemini_sse(response, cancel, &on_event);
        } else {
            let body = match response.text() {
                Ok(b) => b,
                Err(err) => {
                    on_event(GatewayEvent::Error(
                        GatewayError::Decode {
                            provider: "gemini".into(),
                            message: err.to_string(),
                        }
                        .to_string(),
                    ));
                    return;
                }
            };
            if cancel.is_cancelled() {
                return;
            }
            emit_gemini_single_shot(&body, &on_event);
        }
    }
}

fn stream_gemini_sse(response: Response, cancel: &CancellationToken, on_event: &GatewayCallback) {
    let mut usage: Option<UsageMetadata> = None;
    let reader = std::io::BufReader::new(response);
    for line in reader.lines() {
        if cancel.is_cancelled() {
            return;
        }
        let Ok(line) = line else { break };
        let trimmed = line.trim();
        let Some(chunk) = trimmed.strip_prefix("data:") else {
            continue;
        };
        let chunk = chunk.trim();
        if chunk.is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(chunk) else {
            continue;
        };
        if let Some(text) = value
            .pointer("/candidates/0/content/parts/0/text")
            .and_then(|v| v.as_str())
        {
            on_event(GatewayEvent::TextChunk(text.to_string()));
        }
        if let Some(meta) = value.get("usageMetadata") {
            usage = Some(parse_gemini_usage(meta));
        }
    }
    if cancel.is_cancelled() {
        return;
    }
    if let Some(usage) = usage {
        on_event(GatewayEvent::Usage(usage));
    }
}

fn emit_gemini_single_shot(body: &str, on_event: &GatewayCallback) {
    let value: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(err) => {
            on_event(GatewayEvent::Error(
                GatewayError::Decode {
                    provider: "gemini".into(),
                    message: err.to_string(),
                }
                .to_string(),
            ));
            return;
        }
    };
    let text = value
        .pointer("/candidates/0/content/parts/0/text")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    on_event(GatewayEvent::TextChunk(text.to_string()));
    let usage = value
        .get("usageMetadata")
        .map(parse_gemini_usage)
        .unwrap_or_default();
    on_event(GatewayEvent::Usage(usage));
}

fn parse_gemini_usage(meta: &Value) -> UsageMetadata {
    UsageMetadata {
        prompt_tokens: meta
            .get("promptTokenCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        completion_tokens: meta
            .get("candidatesTokenCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        total_tokens: meta
            .get("totalTokenCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
    }
}

// ── OpenAI backend ──────────────────────────────────────────────────────

pub struct OpenAiGateway {
    cfg: OpenAiParameters,
    api_key: String,
    client: Client,
}

impl OpenAiGateway {
    pub fn new(cfg: OpenAiParameters, api_key: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("reqwest client");
        Self {
            cfg,
            api_key,
            client,
        }
    }

    fn messages_payload(&self, system_prompt: &str, history: &History, user_prompt: &str) -> Value {
        let mut messages = vec![json!({"role": "system", "content": system_prompt})];
        for m in history {
            let role = match m.role {
                MessageRole::User => "user",
                MessageRole::Model => "assistant",
            };
            messages.push(json!({"role": role, "content": m.text}));
        }
        messages.push(json!({"role": "user", "content": user_prompt}));
        json!(messages)
    }

    fn payload(
        &self,
        system_prompt: &str,
        history: &History,
        user_prompt: &str,
        streaming: bool,
    ) -> Value {
        let mut body = json!({
            "model": self.cfg.model,
            "messages": self.messages_payload(system_prompt, history, user_prompt),
            "temperature": self.cfg.temperature,
            "top_p": self.cfg.top_p,
            "stream": streaming,
        });
        if streaming {
            body["stream_options"] = json!({"include_usage": true});
        }
        body
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.cfg.base_url.trim_end_matches('/'))
    }
}

impl ModelGateway for OpenAiGateway {
    fn send(
        &self,
        system_prompt: &str,
        history: &History,
        user_prompt: &str,
        streaming: bool,
        cancel: &CancellationToken,
        on_event: GatewayCallback,
    ) {
        let payload = self.payload(system_prompt, history, user_prompt, streaming);
        let url = self.url();

        let response = match send_openai_with_retries(
            &self.client,
            &url,
            &self.api_key,
            &payload,
            cancel,
        ) {
            Ok(Some(resp)) => resp,
            Ok(None) => return,
            Err(err) => {
                on_event(GatewayEvent::Error(err.to_string()));
                return;
            }
        };

        if streaming {
            stream_openai_sse(response, cancel, &on_event);
        } else {
            let body = match response.text() {
                Ok(b) => b,
                Err(err) => {
                    on_event(GatewayEvent::Error(
                        GatewayError::Decode {
                            provider: "openai".into(),
                            message: err.to_string(),
                        }
                        .to_string(),
                    ));
                    return;
                }
            };
            if cancel.is_cancelled() {
                return;
            }
            emit_openai_single_shot(&body, &on_event);
        }
    }
}

fn stream_openai_sse(response: Response, cancel: &CancellationToken, on_event: &GatewayCallback) {
    let mut usage: Option<UsageMetadata> = None;
    let reader = std::io::BufReader::new(response);
    for line in reader.lines() {
        if cancel.is_cancelled() {
            return;
        }
        let Ok(line) = line else { break };
        let trimmed = line.trim();
        let Some(chunk) = trimmed.strip_prefix("data:") else {
            continue;
        };
        let chunk = chunk.trim();
        if chunk.is_empty() {
            continue;
        }
        if chunk == "[DONE]" {
            break;
        }
        let Ok(value) = serde_json::from_str::<Value>(chunk) else {
            continue;
        };
        if let Some(text) = value
            .pointer("/choices/0/delta/content")
            .and_then(|v| v.as_str())
        {
            on_event(GatewayEvent::TextChunk(text.to_string()));
        }
        if let Some(u) = value.get("usage").filter(|u| !u.is_null()) {
            usage = Some(parse_openai_usage(u));
        }
    }
    if cancel.is_cancelled() {
        return;
    }
    if let Some(usage) = usage {
        on_event(GatewayEvent::Usage(usage));
    }
}

fn emit_openai_single_shot(body: &str, on_event: &GatewayCallback) {
    let value: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(err) => {
            on_event(GatewayEvent::Error(
                GatewayError::Decode {
                    provider: "openai".into(),
                    message: err.to_string(),
                }
                .to_string(),
            ));
            return;
        }
    };
    let text = value
        .pointer("/choices/0/message/content")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    on_event(GatewayEvent::TextChunk(text.to_string()));
    let usage = value
        .get("usage")
        .map(parse_openai_usage)
        .unwrap_or_default();
    on_event(GatewayEvent::Usage(usage));
}

fn parse_openai_usage(meta: &Value) -> UsageMetadata {
    UsageMetadata {
        prompt_tokens: meta
            .get("prompt_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        completion_tokens: meta
            .get("completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        total_tokens: meta
            .get("total_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
    }
}

// ── Shared retry machinery ──────────────────────────────────────────────

/// Posts `payload` to `url`, retrying transient failures (429, 5xx, and
/// connect/timeout transport errors) with exponential backoff, honoring
/// `Retry-After` when the server sends one. Returns `Ok(None)` if the
/// caller cancelled before a usable response arrived, so `send` can return
/// without emitting any event.
fn send_with_retries(
    client: &Client,
    url: &str,
    payload: &Value,
    provider: &str,
    cancel: &CancellationToken,
) -> Result<Option<Response>, GatewayError> {
    let mut attempt: u8 = 0;
    loop {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        match client.post(url).json(payload).send() {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    return Ok(Some(resp));
                }
                let retry_after = parse_retry_after(resp.headers().get(RETRY_AFTER));
                let body = resp.text().unwrap_or_default();
                if should_retry_status(status) && attempt < MAX_RETRIES {
                    thread::sleep(retry_delay(RETRY_BASE_MS, attempt, retry_after));
                    attempt += 1;
                    continue;
                }
                return Err(GatewayError::Http {
                    provider: provider.to_string(),
                    status: status.as_u16(),
                    body,
                });
            }
            Err(err) => {
                if should_retry_transport(&err) && attempt < MAX_RETRIES {
                    thread::sleep(retry_delay(RETRY_BASE_MS, attempt, None));
                    attempt += 1;
                    continue;
                }
                return Err(GatewayError::Transport {
                    provider: provider.to_string(),
                    message: err.to_string(),
                });
            }
        }
    }
}

fn send_openai_with_retries(
    client: &Client,
    url: &str,
    api_key: &str,
    payload: &Value,
    cancel: &CancellationToken,
) -> Result<Option<Response>, GatewayError> {
    let mut attempt: u8 = 0;
    loop {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        match client.post(url).bearer_auth(api_key).json(payload).send() {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    return Ok(Some(resp));
                }
                let retry_after = parse_retry_after(resp.headers().get(RETRY_AFTER));
                let body = resp.text().unwrap_or_default();
                if should_retry_status(status) && attempt < MAX_RETRIES {
                    thread::sleep(retry_delay(RETRY_BASE_MS, attempt, retry_after));
                    attempt += 1;
                    continue;
                }
                return Err(GatewayError::Http {
                    provider: "openai".to_string(),
                    status: status.as_u16(),
                    body,
                });
            }
            Err(err) => {
                if should_retry_transport(&err) && attempt < MAX_RETRIES {
                    thread::sleep(retry_delay(RETRY_BASE_MS, attempt, None));
                    attempt += 1;
                    continue;
                }
                return Err(GatewayError::Transport {
                    provider: "openai".to_string(),
                    message: err.to_string(),
                });
            }
        }
    }
}

fn should_retry_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn should_retry_transport(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

fn parse_retry_after(header: Option<&reqwest::header::HeaderValue>) -> Option<u64> {
    let value = header?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }
    let retry_at = DateTime::parse_from_rfc2822(value)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(value, "%a, %d %b %Y %H:%M:%S GMT")
                .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
        })
        .ok()?;
    let delta = retry_at.signed_duration_since(Utc::now()).num_seconds();
    Some(delta.max(0) as u64)
}

fn retry_delay(base_ms: u64, attempt: u8, retry_after_seconds: Option<u64>) -> Duration {
    if let Some(seconds) = retry_after_seconds {
        return Duration::from_millis(seconds.saturating_mul(1000));
    }
    let exponential = base_ms.saturating_mul(2_u64.saturating_pow(u32::from(attempt)));
    Duration::from_millis(exponential.max(base_ms))
}
