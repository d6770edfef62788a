//! OpenRouter chat-completions adapter.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::error::{ErrorContext, ProviderError};
use super::pricing::chat_cost;
use super::types::{ChatRequest, ChatResponse, FinishReason};

/// One chat-completion backend.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;
}

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Wait used for a 429 without a usable `Retry-After` header.
pub const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(30);

const MAX_RESPONSE_BYTES: usize = 1_024 * 1_024;
/// Roughly 125k tokens.
const MAX_PROMPT_CHARS: usize = 500_000;

#[derive(Debug, Clone)]
pub struct OpenRouterAdapter {
    http: reqwest::Client,
    base_url: String,
}

impl OpenRouterAdapter {
    pub fn new(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::with_config(api_key, DEFAULT_BASE_URL, DEFAULT_TIMEOUT, None, None)
    }

    /// Reads `OPENROUTER_API_KEY` (required) plus the optional
    /// `OPENROUTER_BASE_URL`, `OPENROUTER_TIMEOUT_SECONDS`,
    /// `OPENROUTER_REFERER` and `OPENROUTER_APP_TITLE`.
    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .map_err(|_| ProviderError::config("OPENROUTER_API_KEY not set"))?;
        let base_url =
            std::env::var("OPENROUTER_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.into());
        let timeout = std::env::var("OPENROUTER_TIMEOUT_SECONDS")
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT);

        Self::with_config(
            api_key,
            base_url,
            timeout,
            std::env::var("OPENROUTER_REFERER").ok(),
            std::env::var("OPENROUTER_APP_TITLE").ok(),
        )
    }

    pub fn with_config(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
        referer: Option<String>,
        app_title: Option<String>,
    ) -> Result<Self, ProviderError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let bearer = HeaderValue::from_str(&format!("Bearer {}", api_key.into()))
            .map_err(|_| ProviderError::config("API key is not a valid header value"))?;
        headers.insert(AUTHORIZATION, bearer);

        let optional = [("HTTP-Referer", referer), ("X-Title", app_title)];
        for (name, value) in optional {
            if let Some(value) = value.and_then(|v| HeaderValue::from_str(&v).ok()) {
                headers.insert(name, value);
            }
        }

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| ProviderError::config(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

// =============================================================================
// Wire format
// =============================================================================

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

impl<'a> WireRequest<'a> {
    fn from_request(req: &'a ChatRequest) -> Self {
        Self {
            model: &req.model,
            messages: req
                .messages
                .iter()
                .map(|m| WireMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            temperature: req.temperature,
            max_tokens: req.max_tokens,
        }
    }
}

#[derive(Deserialize)]
struct WireResponse {
    choices: Option<Vec<WireChoice>>,
    usage: Option<WireUsage>,
    error: Option<WireError>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: Option<WireReply>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireReply {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Deserialize)]
struct WireToolCall {
    function: Option<WireFunction>,
}

#[derive(Deserialize)]
struct WireFunction {
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
    cost_details: Option<WireCost>,
}

#[derive(Deserialize)]
struct WireCost {
    upstream_inference_cost: Option<f64>,
}

#[derive(Deserialize)]
struct WireError {
    message: Option<String>,
    code: Option<serde_json::Value>,
}

impl WireError {
    fn code(&self) -> Option<String> {
        self.code.as_ref().map(|c| match c {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

// =============================================================================
// Call
// =============================================================================

struct RawReply {
    status: StatusCode,
    request_id: Option<String>,
    retry_after: Option<Duration>,
    body: String,
}

impl OpenRouterAdapter {
    async fn send(&self, req: &ChatRequest) -> Result<RawReply, ProviderError> {
        let mut response = self
            .http
            .post(self.endpoint())
            .json(&WireRequest::from_request(req))
            .send()
            .await?;

        let status = response.status();
        let request_id = response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let retry_after = parse_retry_after(response.headers());

        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if bytes.len() + chunk.len() > MAX_RESPONSE_BYTES {
                return Err(ProviderError::upstream(
                    format!("response exceeds {MAX_RESPONSE_BYTES} bytes"),
                    false,
                ));
            }
            bytes.extend_from_slice(&chunk);
        }

        Ok(RawReply {
            status,
            request_id,
            retry_after,
            body: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }
}

#[async_trait]
impl ChatProvider for OpenRouterAdapter {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let prompt_chars = req.prompt_chars();
        if prompt_chars > MAX_PROMPT_CHARS {
            return Err(ProviderError::rejected(format!(
                "prompt is {prompt_chars} chars (max {MAX_PROMPT_CHARS})"
            )));
        }

        let started = Instant::now();
        let reply = self.send(req).await?;
        if !reply.status.is_success() {
            return Err(http_failure(reply));
        }

        let parsed: WireResponse = serde_json::from_str(&reply.body)
            .map_err(|e| ProviderError::upstream(format!("invalid JSON body: {e}"), false))?;
        if let Some(error) = parsed.error {
            let message = error.message.unwrap_or_default();
            return Err(if looks_like_refusal(&message) {
                ProviderError::Refused(message)
            } else {
                ProviderError::upstream(message, false)
            });
        }

        let choice = parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .ok_or_else(|| ProviderError::upstream("no choices in response", false))?;
        let content = choice.message.map(completion_text).unwrap_or_default();
        if content.trim().is_empty() {
            return Err(ProviderError::upstream("empty completion", true));
        }
        if looks_like_refusal(&content) {
            return Err(ProviderError::Refused(content));
        }

        let usage = parsed
            .usage
            .ok_or_else(|| ProviderError::upstream("response has no usage block", false))?;
        let input_tokens = usage.prompt_tokens.unwrap_or(0);
        let output_tokens = usage.completion_tokens.unwrap_or(0);

        Ok(ChatResponse {
            content,
            input_tokens,
            output_tokens,
            cost_nanodollars: chat_cost(&req.model, input_tokens, output_tokens),
            upstream_cost_nanodollars: usage
                .cost_details
                .and_then(|d| d.upstream_inference_cost)
                .map(usd_to_nanos),
            latency: started.elapsed(),
            finish_reason: FinishReason::from(choice.finish_reason),
        })
    }
}

fn http_failure(reply: RawReply) -> ProviderError {
    let status = reply.status.as_u16();
    let error = serde_json::from_str::<WireResponse>(&reply.body)
        .ok()
        .and_then(|r| r.error);
    let code = error.as_ref().and_then(WireError::code);
    let message = error
        .and_then(|e| e.message)
        .unwrap_or_else(|| format!("HTTP {status}"));
    let context = ErrorContext::http(status, reply.request_id).with_code(code);

    match reply.status {
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited {
            retry_after: reply.retry_after.unwrap_or(DEFAULT_RATE_LIMIT_WAIT),
            context,
        },
        s if s.is_server_error() => ProviderError::Upstream {
            message,
            retryable: true,
            context: Some(context),
        },
        s if s.is_client_error() => ProviderError::Rejected {
            message,
            context: Some(context),
        },
        _ => ProviderError::Upstream {
            message,
            retryable: false,
            context: Some(context),
        },
    }
}

/// Message content, or the first non-blank tool-call argument string for
/// models that answer through a tool call.
fn completion_text(reply: WireReply) -> String {
    match reply.content {
        Some(content) if !content.trim().is_empty() => content,
        _ => reply
            .tool_calls
            .into_iter()
            .filter_map(|call| call.function.and_then(|f| f.arguments))
            .find(|args| !args.trim().is_empty())
            .unwrap_or_default(),
    }
}

/// Only the first line counts, so a JSON answer with a refusal-like phrase
/// deeper in a notes field is not misread.
fn looks_like_refusal(text: &str) -> bool {
    const OPENERS: &[&str] = &[
        "refus",
        "i cannot",
        "i can't",
        "i won't",
        "i will not",
        "i am unable to",
        "i'm unable to",
        "unable to comply",
        "unable to assist",
    ];
    let first_line = text.trim_start().lines().next().unwrap_or("").to_lowercase();
    OPENERS.iter().any(|o| first_line.starts_with(o))
}

/// Delay-seconds form only; HTTP-date values fall back to the default.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn usd_to_nanos(usd: f64) -> i64 {
    ((usd * 1e9).round() as i64).max(0)
}
