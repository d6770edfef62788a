//! Chat-completion gateway.
//!
//! `ProviderGateway` wraps one `ChatProvider`, reports every call to a
//! `UsageSink` and can retry transient failures itself. The mapper drives
//! retries per tier from the dispatcher, so it builds the gateway with
//! `max_retries: 0`.

pub mod error;
pub mod openrouter;
pub mod pricing;
pub mod types;
pub mod usage;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;

use openrouter::{ChatProvider, OpenRouterAdapter};

pub use error::{ErrorContext, ProviderError};
pub use pricing::{chat_cost, price_for, TokenPrice};
pub use types::{ChatRequest, ChatResponse, FinishReason, Message, Role};
pub use usage::{CallRecord, NoopUsageSink, TracingUsageSink, UsageSink, UsageTotals};

#[async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

pub struct ProviderGateway<U: UsageSink, P: ChatProvider = OpenRouterAdapter> {
    provider: P,
    usage: Arc<U>,
    config: GatewayConfig,
}

impl<U: UsageSink> ProviderGateway<U> {
    /// OpenRouter adapter configured from `OPENROUTER_*` variables.
    pub fn from_env(usage: Arc<U>, config: GatewayConfig) -> Result<Self, ProviderError> {
        Ok(Self::with_config(OpenRouterAdapter::from_env()?, usage, config))
    }
}

impl<U: UsageSink, P: ChatProvider> ProviderGateway<U, P> {
    pub fn with_config(provider: P, usage: Arc<U>, config: GatewayConfig) -> Self {
        Self {
            provider,
            usage,
            config,
        }
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let mut retry = 0;
        loop {
            let started = Instant::now();
            let result = self.provider.chat(&req).await;
            let record = match &result {
                Ok(resp) => CallRecord::succeeded(&req, resp),
                Err(err) => CallRecord::failed(&req, err, started.elapsed()),
            };
            self.usage.record(record).await;

            match result {
                Err(err) if err.is_retryable() && retry < self.config.max_retries => {
                    let delay = backoff_delay(self.config.retry_base_delay, retry)
                        .max(err.retry_after().unwrap_or_default());
                    tracing::debug!(
                        model = %req.model,
                        retry,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying provider call"
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl<U: UsageSink, P: ChatProvider> ChatGateway for ProviderGateway<U, P> {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        ProviderGateway::chat(self, req).await
    }
}

/// `base * 2^attempt` (exponent capped at 5) plus up to 25% jitter.
/// Saturates at `Duration::MAX`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let delay = base.saturating_mul(1 << attempt.min(5));
    let jitter_ms = u64::try_from(delay.as_millis() / 4).unwrap_or(u64::MAX);
    if jitter_ms == 0 {
        return delay;
    }
    delay.saturating_add(Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn backoff_doubles_within_jitter_bounds() {
        let base = Duration::from_millis(100);
        for attempt in 0..4u32 {
            let floor = base * 2u32.pow(attempt);
            let delay = backoff_delay(base, attempt);
            assert!(delay >= floor, "attempt {attempt}: {delay:?} < {floor:?}");
            assert!(delay <= floor + floor / 4, "attempt {attempt}: {delay:?} too large");
        }
    }

    #[test]
    fn backoff_is_exact_for_zero_base_and_caps_the_exponent() {
        assert_eq!(backoff_delay(Duration::ZERO, 3), Duration::ZERO);
        let base = Duration::from_millis(10);
        assert!(backoff_delay(base, 30) <= base * 32 + base * 8);
    }

    #[test]
    fn backoff_saturates_instead_of_overflowing() {
        let huge = Duration::from_millis(u64::MAX);
        assert!(backoff_delay(huge, 5) >= huge);
        assert_eq!(backoff_delay(Duration::MAX, 3), Duration::MAX);
    }

    /// Fails with a fixed error a set number of times, then answers.
    struct Flaky {
        failures: usize,
        retryable: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChatProvider for Flaky {
        async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(ProviderError::upstream("flaky", self.retryable));
            }
            Ok(ChatResponse {
                content: format!("answer from {}", req.model),
                input_tokens: 10,
                output_tokens: 5,
                cost_nanodollars: 1,
                upstream_cost_nanodollars: None,
                latency: Duration::ZERO,
                finish_reason: FinishReason::Stop,
            })
        }
    }

    fn gateway(failures: usize, retryable: bool, max_retries: u32) -> ProviderGateway<TracingUsageSink, Flaky> {
        ProviderGateway::with_config(
            Flaky {
                failures,
                retryable,
                calls: AtomicUsize::new(0),
            },
            Arc::new(TracingUsageSink::new()),
            GatewayConfig {
                max_retries,
                retry_base_delay: Duration::ZERO,
            },
        )
    }

    fn request() -> ChatRequest {
        ChatRequest::new("tier/a", vec![Message::user("batch")], "test")
    }

    #[tokio::test]
    async fn retries_transient_failures_and_records_every_call() {
        let gw = gateway(2, true, 2);
        let resp = gw.chat(request()).await.unwrap();
        assert_eq!(resp.content, "answer from tier/a");

        let totals = gw.usage.totals();
        assert_eq!(totals.calls, 3);
        assert_eq!(totals.failed_calls, 2);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let gw = gateway(1, false, 3);
        assert!(gw.chat(request()).await.is_err());
        assert_eq!(gw.provider.calls.load(Ordering::SeqCst), 1);
    }
}
