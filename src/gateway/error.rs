//! Failures reported by the chat provider.

use std::time::Duration;
use thiserror::Error;

/// HTTP details of a failed call, kept for logs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub http_status: Option<u16>,
    /// Provider error code from the body, e.g. "rate_limit_exceeded".
    pub provider_code: Option<String>,
    /// `x-request-id` response header.
    pub request_id: Option<String>,
}

impl ErrorContext {
    pub fn http(status: u16, request_id: Option<String>) -> Self {
        Self {
            http_status: Some(status),
            provider_code: None,
            request_id,
        }
    }

    pub fn with_code(mut self, code: Option<String>) -> Self {
        self.provider_code = code;
        self
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    /// HTTP 429. `retry_after` comes from the response header when present.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        retry_after: Duration,
        context: ErrorContext,
    },

    /// The request itself is unacceptable (4xx, oversized prompt).
    #[error("request rejected: {message}")]
    Rejected {
        message: String,
        context: Option<ErrorContext>,
    },

    /// The model declined to answer.
    #[error("model refused: {0}")]
    Refused(String),

    /// Anything else the provider returned; 5xx and blank completions are
    /// retryable.
    #[error("upstream error: {message}")]
    Upstream {
        message: String,
        retryable: bool,
        context: Option<ErrorContext>,
    },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Missing API key or an unusable client setting.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    pub fn upstream(message: impl Into<String>, retryable: bool) -> Self {
        Self::Upstream {
            message: message.into(),
            retryable,
            context: None,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
            context: None,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Upstream { retryable, .. } => *retryable,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::Rejected { .. } | Self::Refused(_) | Self::Config(_) => false,
        }
    }

    /// Short stable code for usage records and traces.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Rejected { .. } => "rejected",
            Self::Refused(_) => "refused",
            Self::Upstream { .. } => "upstream_error",
            Self::Http(e) if e.is_timeout() => "timeout",
            Self::Http(_) => "http_error",
            Self::Config(_) => "config_error",
        }
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::RateLimited { context, .. } => Some(context),
            Self::Rejected { context, .. } | Self::Upstream { context, .. } => context.as_ref(),
            Self::Refused(_) | Self::Http(_) | Self::Config(_) => None,
        }
    }

    /// Provider-requested wait before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}
