//! Per-call usage reporting.
//!
//! The gateway hands one `CallRecord` per provider call to a `UsageSink`.
//! The CLI uses `TracingUsageSink`, which logs every call and keeps run
//! totals; tests use `NoopUsageSink`.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::error::ProviderError;
use super::types::{ChatRequest, ChatResponse};

#[derive(Debug, Clone)]
pub struct CallRecord {
    pub model: String,
    pub caller: &'static str,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_nanodollars: i64,
    pub upstream_cost_nanodollars: Option<i64>,
    pub latency: Duration,
    /// `None` on success.
    pub error_code: Option<&'static str>,
    pub at: DateTime<Utc>,
}

impl CallRecord {
    pub fn succeeded(req: &ChatRequest, resp: &ChatResponse) -> Self {
        Self {
            model: req.model.clone(),
            caller: req.caller,
            input_tokens: resp.input_tokens,
            output_tokens: resp.output_tokens,
            cost_nanodollars: resp.cost_nanodollars,
            upstream_cost_nanodollars: resp.upstream_cost_nanodollars,
            latency: resp.latency,
            error_code: None,
            at: Utc::now(),
        }
    }

    pub fn failed(req: &ChatRequest, err: &ProviderError, latency: Duration) -> Self {
        Self {
            model: req.model.clone(),
            caller: req.caller,
            input_tokens: 0,
            output_tokens: 0,
            cost_nanodollars: 0,
            upstream_cost_nanodollars: None,
            latency,
            error_code: Some(err.code()),
            at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error_code.is_none()
    }
}

#[async_trait]
pub trait UsageSink: Send + Sync {
    /// Never fails; sinks log their own problems.
    async fn record(&self, record: CallRecord);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _record: CallRecord) {}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageTotals {
    pub calls: u64,
    pub failed_calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_nanodollars: i64,
}

impl UsageTotals {
    pub fn add(&mut self, record: &CallRecord) {
        self.calls += 1;
        if !record.is_success() {
            self.failed_calls += 1;
        }
        self.input_tokens += u64::from(record.input_tokens);
        self.output_tokens += u64::from(record.output_tokens);
        self.cost_nanodollars += record
            .upstream_cost_nanodollars
            .unwrap_or(record.cost_nanodollars);
    }

    pub fn cost_usd(&self) -> f64 {
        self.cost_nanodollars as f64 / 1e9
    }
}

/// One structured `tracing` event per call, plus running totals.
#[derive(Debug, Default)]
pub struct TracingUsageSink {
    totals: Mutex<UsageTotals>,
}

impl TracingUsageSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn totals(&self) -> UsageTotals {
        *self.totals.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl UsageSink for TracingUsageSink {
    async fn record(&self, record: CallRecord) {
        let latency_ms = record.latency.as_millis() as u64;
        match record.error_code {
            None => tracing::info!(
                target: "control_mapper::usage",
                model = %record.model,
                caller = record.caller,
                input_tokens = record.input_tokens,
                output_tokens = record.output_tokens,
                cost_nanos = record.cost_nanodollars,
                upstream_cost_nanos = ?record.upstream_cost_nanodollars,
                latency_ms,
                "provider call"
            ),
            Some(code) => tracing::warn!(
                target: "control_mapper::usage",
                model = %record.model,
                caller = record.caller,
                error_code = code,
                latency_ms,
                "provider call failed"
            ),
        }
        self.totals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .add(&record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::types::{FinishReason, Message};

    fn request() -> ChatRequest {
        ChatRequest::new("tier/a", vec![Message::user("batch")], "test")
    }

    #[tokio::test]
    async fn totals_prefer_provider_reported_cost() {
        let sink = TracingUsageSink::new();
        let resp = ChatResponse {
            content: "[]".into(),
            input_tokens: 100,
            output_tokens: 20,
            cost_nanodollars: 5_000,
            upstream_cost_nanodollars: Some(3_000),
            latency: Duration::from_millis(12),
            finish_reason: FinishReason::Stop,
        };

        sink.record(CallRecord::succeeded(&request(), &resp)).await;
        sink.record(CallRecord::failed(
            &request(),
            &ProviderError::upstream("502", true),
            Duration::from_millis(3),
        ))
        .await;

        let totals = sink.totals();
        assert_eq!(totals.calls, 2);
        assert_eq!(totals.failed_calls, 1);
        assert_eq!(totals.input_tokens, 100);
        assert_eq!(totals.output_tokens, 20);
        assert_eq!(totals.cost_nanodollars, 3_000);
    }

    #[test]
    fn failed_record_carries_the_error_code() {
        let record = CallRecord::failed(
            &request(),
            &ProviderError::rejected("too large"),
            Duration::ZERO,
        );
        assert!(!record.is_success());
        assert_eq!(record.error_code, Some("rejected"));
        assert_eq!(record.caller, "test");
    }
}
