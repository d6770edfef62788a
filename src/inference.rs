//! Inference backend seam.
//!
//! The engine only depends on `InferenceClient`; `GatewayInferenceClient`
//! is the chat-completion implementation used by the CLI.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::gateway::{ChatGateway, ChatRequest, ProviderError};
use crate::prompts::render_batch_prompt;
use crate::types::{BatchRequest, BatchResponse, ModelTier};

#[derive(Debug, Error)]
pub enum InferenceError {
    /// Network, rate-limit or provider failure.
    #[error("transport error: {0}")]
    Transport(#[from] ProviderError),
    /// The backend answered, but not with a list of payloads.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl InferenceError {
    pub fn is_retryable(&self) -> bool {
        match self {
            InferenceError::Transport(err) => err.is_retryable(),
            InferenceError::Malformed(_) => false,
        }
    }

    /// Wait requested by the provider, if any.
    pub fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            InferenceError::Transport(err) => err.retry_after(),
            InferenceError::Malformed(_) => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            InferenceError::Transport(err) => err.code(),
            InferenceError::Malformed(_) => "malformed_response",
        }
    }
}

#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Produce one raw payload per requirement in `request`, in order.
    async fn map(
        &self,
        request: &BatchRequest,
        tier: &ModelTier,
    ) -> Result<BatchResponse, InferenceError>;
}

// =============================================================================
// Chat-completion backend
// =============================================================================

const DEFAULT_MAX_TOKENS: u32 = 8_192;

pub struct GatewayInferenceClient<G: ChatGateway> {
    gateway: Arc<G>,
    caller: &'static str,
    max_tokens: u32,
}

impl<G: ChatGateway> GatewayInferenceClient<G> {
    pub fn new(gateway: Arc<G>) -> Self {
        Self {
            gateway,
            caller: "inference::map_batch",
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    /// Caller label attached to usage records.
    pub fn with_caller(mut self, caller: &'static str) -> Self {
        self.caller = caller;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

#[async_trait]
impl<G: ChatGateway> InferenceClient for GatewayInferenceClient<G> {
    async fn map(
        &self,
        request: &BatchRequest,
        tier: &ModelTier,
    ) -> Result<BatchResponse, InferenceError> {
        let prompt = render_batch_prompt(request);
        let req = ChatRequest::new(tier.model_id(), prompt.to_messages(), self.caller)
            .max_tokens(self.max_tokens);

        let response = self.gateway.chat(req).await?;
        tracing::debug!(
            tier = %tier,
            template = prompt.template_slug,
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            "batch completion received"
        );
        parse_batch_response(&response.content).map_err(|err| match err {
            InferenceError::Malformed(detail) if response.is_truncated() => {
                InferenceError::Malformed(format!("{detail} (completion hit max_tokens)"))
            }
            other => other,
        })
    }
}

// =============================================================================
// Response parsing
// =============================================================================

/// Strip a surrounding Markdown code fence, with or without a language tag.
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}

/// The balanced JSON array or object that `raw` starts with.
fn balanced_prefix(raw: &str) -> Option<&str> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in raw.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '[' | '{' => depth += 1,
            ']' | '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Every balanced group in `raw`, in order of where it starts.
fn json_candidates(raw: &str) -> impl Iterator<Item = &str> {
    raw.char_indices()
        .filter(|(_, c)| *c == '[' || *c == '{')
        .filter_map(move |(start, _)| balanced_prefix(&raw[start..]))
}

const WRAPPER_KEYS: [&str; 3] = ["results", "mappings", "requirements"];

/// An array of objects, or an object wrapping one.
fn looks_like_batch(value: &Value) -> bool {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(obj) => match WRAPPER_KEYS.iter().find_map(|k| obj.get(*k)) {
            Some(Value::Array(items)) => items,
            _ => return false,
        },
        _ => return false,
    };
    !items.is_empty() && items.iter().all(Value::is_object)
}

/// Turn completion text into per-requirement payloads. Accepts a bare array
/// or an object wrapping the array under `results`, `mappings` or
/// `requirements`. Prose around the JSON may itself contain brackets, so the
/// first group shaped like a batch wins; failing that, the first group found
/// is parsed and reported.
pub fn parse_batch_response(raw: &str) -> Result<BatchResponse, InferenceError> {
    let body = strip_code_fences(raw);
    let batch = json_candidates(body)
        .filter_map(|text| serde_json::from_str::<Value>(text).ok())
        .find(looks_like_batch);
    let value = match batch {
        Some(value) => value,
        None => {
            let json = json_candidates(body).next().ok_or_else(|| {
                InferenceError::Malformed("no JSON found in completion".to_string())
            })?;
            serde_json::from_str(json)
                .map_err(|e| InferenceError::Malformed(format!("invalid JSON: {e}")))?
        }
    };

    match value {
        Value::Array(payloads) => Ok(BatchResponse::new(payloads)),
        Value::Object(mut obj) => {
            for key in WRAPPER_KEYS {
                if let Some(Value::Array(payloads)) = obj.remove(key) {
                    return Ok(BatchResponse::new(payloads));
                }
            }
            Err(InferenceError::Malformed(
                "object response without a results array".to_string(),
            ))
        }
        other => Err(InferenceError::Malformed(format!(
            "expected array, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn strips_fences_with_and_without_language() {
        assert_eq!(strip_code_fences("```json\n[1]\n```"), "[1]");
        assert_eq!(strip_code_fences("```\n[2]\n```\n"), "[2]");
        assert_eq!(strip_code_fences("  [3]  "), "[3]");
    }

    #[test]
    fn parses_bare_array() {
        let resp = parse_batch_response(r#"[{"coverage": 5}, {"coverage": 7}]"#).unwrap();
        assert_eq!(resp.payloads.len(), 2);
    }

    #[test]
    fn parses_wrapped_results_with_prose() {
        let raw = "Here is the mapping:\n```json\n{\"results\": [{\"notes\": \"a ] tricky } string\"}]}\n```";
        let resp = parse_batch_response(raw).unwrap();
        assert_eq!(resp.payloads.len(), 1);
        assert_eq!(resp.payloads[0]["notes"], "a ] tricky } string");
    }

    #[test]
    fn skips_bracketed_prose_before_the_batch() {
        let raw = "Mapping for [2] items:\n[{\"coverage\": 5}, {\"coverage\": 7}]";
        let resp = parse_batch_response(raw).unwrap();
        assert_eq!(resp.payloads.len(), 2);
        assert_eq!(resp.payloads[1]["coverage"], 7);

        let raw = "See {section 3}. {\"results\": [{\"coverage\": 4}]}";
        assert_eq!(parse_batch_response(raw).unwrap().payloads.len(), 1);
    }

    #[test]
    fn empty_array_still_parses_when_nothing_better_exists() {
        assert!(parse_batch_response("[]").unwrap().payloads.is_empty());
    }

    #[test]
    fn rejects_non_json_and_unwrapped_objects() {
        assert!(matches!(
            parse_batch_response("I could not do this."),
            Err(InferenceError::Malformed(_))
        ));
        assert!(matches!(
            parse_batch_response(r#"{"coverage": 5}"#),
            Err(InferenceError::Malformed(_))
        ));
        assert!(matches!(
            parse_batch_response("[{\"coverage\": 5}"),
            Err(InferenceError::Malformed(_))
        ));
    }

    #[test]
    fn only_transport_errors_can_be_retried() {
        let transport = InferenceError::Transport(ProviderError::upstream("overloaded", true));
        assert!(transport.is_retryable());
        assert_eq!(transport.code(), "upstream_error");
        assert!(!InferenceError::Malformed("x".into()).is_retryable());
    }
}
