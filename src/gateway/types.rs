//! Chat request and response shapes shared by the gateway and its adapters.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Provider model id, e.g. "anthropic/claude-3-5-haiku".
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// Code path that issued the call, for usage records.
    pub caller: &'static str,
}

impl ChatRequest {
    /// Deterministic sampling and no token cap.
    pub fn new(model: impl Into<String>, messages: Vec<Message>, caller: &'static str) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: 0.0,
            max_tokens: None,
            caller,
        }
    }

    pub fn max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    pub fn prompt_chars(&self) -> usize {
        self.messages.iter().map(|m| m.content.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
    Unknown(String),
}

impl From<Option<String>> for FinishReason {
    fn from(s: Option<String>) -> Self {
        match s.as_deref() {
            Some("stop") => FinishReason::Stop,
            Some("length") => FinishReason::Length,
            Some("content_filter") => FinishReason::ContentFilter,
            Some("tool_calls") => FinishReason::ToolCalls,
            Some(other) => FinishReason::Unknown(other.to_string()),
            None => FinishReason::Unknown("none".to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Estimated from the price table, in nanodollars.
    pub cost_nanodollars: i64,
    /// Cost reported by the provider, when it sends one.
    pub upstream_cost_nanodollars: Option<i64>,
    pub latency: Duration,
    pub finish_reason: FinishReason,
}

impl ChatResponse {
    /// A completion cut off by the token cap usually holds truncated JSON.
    pub fn is_truncated(&self) -> bool {
        self.finish_reason == FinishReason::Length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_request_is_deterministic_and_uncapped() {
        let req = ChatRequest::new(
            "anthropic/claude-3-5-haiku",
            vec![Message::system("rules"), Message::user("batch")],
            "test",
        );

        assert_eq!(req.temperature, 0.0);
        assert!(req.max_tokens.is_none());
        assert_eq!(req.prompt_chars(), 10);
    }

    #[test]
    fn finish_reason_keeps_unknown_values() {
        assert_eq!(FinishReason::from(Some("length".into())), FinishReason::Length);
        assert_eq!(
            FinishReason::from(Some("weird".into())),
            FinishReason::Unknown("weird".into())
        );
        assert_eq!(FinishReason::from(None), FinishReason::Unknown("none".into()));
    }
}
