//! Tier escalation for a single batch.
//!
//! A batch starts on the cheapest tier. A rejected response, a response the
//! backend could not deliver after its transport retries, or (optionally) an
//! accepted response with low coverage moves it one tier up. Once the
//! strongest tier is reached it is reused until the attempt budget runs out.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::gateway::backoff_delay;
use crate::types::ModelTier;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    /// Cheapest first.
    pub tiers: Vec<ModelTier>,
    /// Attempts per batch across all tiers.
    pub max_attempts: usize,
    /// Escalate an accepted batch whose lowest coverage score is below this.
    pub low_coverage_threshold: Option<u8>,
    /// Transport retries per attempt, on the same tier.
    pub transport_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            tiers: vec![
                ModelTier::new("anthropic/claude-3-5-haiku"),
                ModelTier::new("anthropic/claude-3-5-sonnet"),
                ModelTier::new("anthropic/claude-opus-4.5"),
            ],
            max_attempts: 3,
            low_coverage_threshold: Some(4),
            transport_retries: 2,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 30_000,
        }
    }
}

/// Where a batch is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscalationState {
    Initial,
    Validating { attempt: usize, tier: ModelTier },
    EscalatingTier { from_attempt: usize, reason: EscalationReason },
    Accepted { attempt: usize, cached: bool },
    Exhausted { attempts: usize },
    Cancelled { attempts: usize },
}

impl EscalationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EscalationState::Accepted { .. }
                | EscalationState::Exhausted { .. }
                | EscalationState::Cancelled { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    Rejected,
    LowCoverage,
    Transport,
}

/// What happened on one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Every payload passed; `min_coverage` is the lowest numeric score.
    Accepted { min_coverage: Option<u8> },
    Rejected,
    /// Transport retries on this tier were used up, or the error was fatal.
    TransportFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Escalate(EscalationReason),
    GiveUp,
}

/// Chooses tiers and decides what follows each attempt.
pub trait EscalationPolicy: Send + Sync {
    /// Tier for a zero-based attempt number.
    fn tier_for_attempt(&self, attempt: usize) -> &ModelTier;

    fn max_attempts(&self) -> usize;

    fn transport_retries(&self) -> u32;

    /// Wait before transport retry number `retry` (zero-based).
    fn retry_delay(&self, retry: u32) -> Duration;

    fn decide(&self, attempt: usize, outcome: AttemptOutcome) -> Decision;

    /// Upper bound on backend calls for one batch.
    fn max_calls(&self) -> usize {
        self.max_attempts() * (self.transport_retries() as usize + 1)
    }

    fn describe(&self) -> Option<String> {
        None
    }
}

/// Ordered tier ladder, cheapest first.
#[derive(Debug, Clone)]
pub struct TierLadderPolicy {
    tiers: Vec<ModelTier>,
    max_attempts: usize,
    low_coverage_threshold: Option<u8>,
    transport_retries: u32,
    retry_base_delay: Duration,
    retry_max_delay: Duration,
}

impl TierLadderPolicy {
    /// Expects a config that passed `MapperConfig::validate`; an empty tier
    /// list is replaced by the default ladder.
    pub fn from_config(config: &EscalationConfig) -> Self {
        let tiers = if config.tiers.is_empty() {
            EscalationConfig::default().tiers
        } else {
            config.tiers.clone()
        };
        Self {
            tiers,
            max_attempts: config.max_attempts.max(1),
            low_coverage_threshold: config.low_coverage_threshold,
            transport_retries: config.transport_retries,
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    pub fn tiers(&self) -> &[ModelTier] {
        &self.tiers
    }

    fn is_strongest(&self, attempt: usize) -> bool {
        attempt + 1 >= self.tiers.len()
    }
}

impl EscalationPolicy for TierLadderPolicy {
    fn tier_for_attempt(&self, attempt: usize) -> &ModelTier {
        &self.tiers[attempt.min(self.tiers.len() - 1)]
    }

    fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    fn transport_retries(&self) -> u32 {
        self.transport_retries
    }

    fn retry_delay(&self, retry: u32) -> Duration {
        backoff_delay(self.retry_base_delay, retry).min(self.retry_max_delay)
    }

    fn decide(&self, attempt: usize, outcome: AttemptOutcome) -> Decision {
        let has_next = attempt + 1 < self.max_attempts;
        match outcome {
            AttemptOutcome::Accepted { min_coverage } => {
                let low = matches!(
                    (self.low_coverage_threshold, min_coverage),
                    (Some(threshold), Some(score)) if score < threshold
                );
                if low && has_next && !self.is_strongest(attempt) {
                    Decision::Escalate(EscalationReason::LowCoverage)
                } else {
                    Decision::Accept
                }
            }
            AttemptOutcome::Rejected if has_next => {
                Decision::Escalate(EscalationReason::Rejected)
            }
            AttemptOutcome::TransportFailed if has_next => {
                Decision::Escalate(EscalationReason::Transport)
            }
            AttemptOutcome::Rejected | AttemptOutcome::TransportFailed => Decision::GiveUp,
        }
    }

    fn describe(&self) -> Option<String> {
        Some(self.to_string())
    }
}

impl fmt::Display for TierLadderPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ladder: Vec<&str> = self.tiers.iter().map(ModelTier::model_id).collect();
        write!(
            f,
            "TierLadder({}; attempts={}, transport_retries={}, low_coverage<{})",
            ladder.join(" -> "),
            self.max_attempts,
            self.transport_retries,
            self.low_coverage_threshold
                .map(|t| t.to_string())
                .unwrap_or_else(|| "off".to_string())
        )
    }
}
