//! Batch dispatch: split, look up, call, validate, escalate.
//!
//! Every batch of a run validates against the catalog snapshot taken when the
//! run starts. Catalog writes happen afterwards in the aggregator, in input
//! order, so a batch's outcome never depends on which worker finished first.

use std::collections::HashSet;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregator::aggregate;
use crate::cache::{BatchCache, BatchCacheKey, CacheError};
use crate::catalog::{Catalog, SharedCatalog};
use crate::config::{ConfigError, MapperConfig};
use crate::escalation::{
    AttemptOutcome, Decision, EscalationPolicy, EscalationReason, EscalationState,
    TierLadderPolicy,
};
use crate::inference::{InferenceClient, InferenceError};
use crate::trace::{BatchTrace, TraceOutcome, TraceSink};
use crate::types::{BatchRequest, BatchResponse, MappingRun, ModelTier, Requirement};
use crate::validator::{
    interpret_cached, validate_batch, BatchValidation, RejectionReason, ValidatedPayload,
    ValidationResult,
};

/// Errors that abort a run. Both are detected before any batch is sent.
#[derive(Debug, Error)]
pub enum MappingError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("duplicate requirement id {0}")]
    DuplicateRequirement(String),
}

pub const CANCELLED_BEFORE_DISPATCH: &str = "mapping cancelled before dispatch";

pub fn exhausted_note(attempts: usize) -> String {
    format!("automatic mapping failed validation after {attempts} attempts")
}

fn cancelled_note(attempts: usize) -> String {
    format!("automatic mapping cancelled after {attempts} attempts")
}

// =============================================================================
// Batch planning
// =============================================================================

/// Consecutive index ranges of at most `batch_size` requirements.
pub fn plan_batches(total: usize, batch_size: usize) -> Vec<Range<usize>> {
    let size = batch_size.max(1);
    (0..total)
        .step_by(size)
        .map(|start| start..(start + size).min(total))
        .collect()
}

/// Build the request for one batch.
///
/// With `sample_limit > 0` and a larger catalog, names are ranked by how many
/// of their `_` segments appear as words in the batch text. Names the
/// requirements already carry always make the cut. The sample is sorted so
/// the cache key does not depend on ranking ties.
pub fn build_batch_request(
    requirements: &[Requirement],
    catalog: &Catalog,
    sample_limit: usize,
) -> BatchRequest {
    let mut names: Vec<String> = catalog.canonical_names().map(str::to_string).collect();

    if sample_limit > 0 && names.len() > sample_limit {
        let hinted: HashSet<&str> = requirements
            .iter()
            .flat_map(|r| r.existing_function_names.iter())
            .filter_map(|n| catalog.resolve(n))
            .collect();
        let words: HashSet<String> = requirements
            .iter()
            .flat_map(|r| {
                r.search_text()
                    .split(|c: char| !c.is_ascii_alphanumeric())
                    .filter(|w| !w.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .collect();

        let mut ranked: Vec<(usize, String)> = names
            .into_iter()
            .map(|name| {
                let score = if hinted.contains(name.as_str()) {
                    usize::MAX
                } else {
                    name.split('_').filter(|seg| words.contains(*seg)).count()
                };
                (score, name)
            })
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        ranked.truncate(sample_limit);
        names = ranked.into_iter().map(|(_, name)| name).collect();
    }

    names.sort();
    BatchRequest {
        requirements: requirements.to_vec(),
        catalog_names: names,
    }
}

// =============================================================================
// Outcomes
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum RequirementOutcome {
    Mapped(ValidatedPayload),
    /// Mapping gave up; the string becomes the result's notes.
    ManualReview(String),
}

#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub batch_index: usize,
    /// Indices into the run's requirement list.
    pub range: Range<usize>,
    /// One per requirement in `range`, in order.
    pub outcomes: Vec<RequirementOutcome>,
    pub state: EscalationState,
    pub cached: bool,
    pub inference_calls: usize,
    pub escalations: usize,
}

impl BatchOutcome {
    fn all_manual(batch_index: usize, range: Range<usize>, state: EscalationState, note: &str) -> Self {
        let outcomes = range
            .clone()
            .map(|_| RequirementOutcome::ManualReview(note.to_string()))
            .collect();
        Self {
            batch_index,
            range,
            outcomes,
            state,
            cached: false,
            inference_calls: 0,
            escalations: 0,
        }
    }
}

/// Accepted payloads kept in case the ladder runs out.
struct Fallback {
    payloads: Vec<ValidatedPayload>,
    response: BatchResponse,
    tier: ModelTier,
}

struct CallResult {
    result: Result<BatchResponse, InferenceError>,
    retries: u32,
    calls: usize,
}

// =============================================================================
// Dispatcher
// =============================================================================

pub struct BatchDispatcher<'a> {
    client: &'a dyn InferenceClient,
    policy: &'a dyn EscalationPolicy,
    config: &'a MapperConfig,
    cache: Option<&'a dyn BatchCache>,
    trace: Option<&'a dyn TraceSink>,
    cancel_flag: Option<&'a AtomicBool>,
    limiter: Semaphore,
}

impl<'a> BatchDispatcher<'a> {
    pub fn new(
        client: &'a dyn InferenceClient,
        policy: &'a dyn EscalationPolicy,
        config: &'a MapperConfig,
    ) -> Self {
        Self {
            client,
            policy,
            config,
            cache: None,
            trace: None,
            cancel_flag: None,
            limiter: Semaphore::new(config.inference_concurrency.max(1)),
        }
    }

    pub fn with_cache(mut self, cache: Option<&'a dyn BatchCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_trace(mut self, trace: Option<&'a dyn TraceSink>) -> Self {
        self.trace = trace;
        self
    }

    pub fn with_cancel_flag(mut self, cancel_flag: Option<&'a AtomicBool>) -> Self {
        self.cancel_flag = cancel_flag;
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel_flag
            .map(|flag| flag.load(AtomicOrdering::Relaxed))
            .unwrap_or(false)
    }

    fn emit(&self, event: BatchTrace) {
        if let Some(trace) = self.trace {
            if let Err(err) = trace.record(event) {
                warn!(error = %err, "failed to record batch trace");
            }
        }
    }

    /// Run every batch and return their outcomes in input order.
    pub async fn dispatch(&self, requirements: &[Requirement], snapshot: &Catalog) -> Vec<BatchOutcome> {
        let plan = plan_batches(requirements.len(), self.config.batch_size);
        let mut outcomes = stream::iter(
            plan.into_iter()
                .enumerate()
                .map(|(batch_index, range)| self.run_batch(batch_index, range, requirements, snapshot)),
        )
        .buffer_unordered(self.config.worker_concurrency.max(1))
        .collect::<Vec<_>>()
        .await;
        outcomes.sort_by_key(|o| o.batch_index);
        outcomes
    }

    async fn run_batch(
        &self,
        batch_index: usize,
        range: Range<usize>,
        all: &[Requirement],
        snapshot: &Catalog,
    ) -> BatchOutcome {
        let requirements = &all[range.clone()];
        let ids: Vec<String> = requirements.iter().map(|r| r.id.clone()).collect();
        let request = build_batch_request(requirements, snapshot, self.config.catalog_sample_limit);
        let key = BatchCacheKey::new(&request);
        let trace = |outcome: TraceOutcome| {
            BatchTrace::new(batch_index, ids.clone(), key.key_hash.clone(), snapshot.version(), outcome)
        };

        if self.cancelled() {
            debug!(batch_index, "run cancelled; batch not dispatched");
            self.emit(trace(TraceOutcome::Cancelled));
            return BatchOutcome::all_manual(
                batch_index,
                range,
                EscalationState::Cancelled { attempts: 0 },
                CANCELLED_BEFORE_DISPATCH,
            );
        }

        if let Some(cached) = self.lookup_cached(batch_index, requirements, &key).await {
            debug!(batch_index, key_hash = %key.key_hash, "cache hit");
            self.emit(trace(TraceOutcome::Accepted).cached());
            return BatchOutcome {
                batch_index,
                range,
                outcomes: cached.into_iter().map(RequirementOutcome::Mapped).collect(),
                state: EscalationState::Accepted {
                    attempt: 0,
                    cached: true,
                },
                cached: true,
                inference_calls: 0,
                escalations: 0,
            };
        }

        let mut state = EscalationState::Initial;
        let mut inference_calls = 0usize;
        let mut escalations = 0usize;
        let mut attempts = 0usize;
        let mut last_validation: Option<BatchValidation> = None;
        let mut fallback: Option<Fallback> = None;

        for attempt in 0..self.policy.max_attempts() {
            if attempt > 0 && self.cancelled() {
                info!(batch_index, attempts, "run cancelled; stopping escalation");
                break;
            }
            let tier = self.policy.tier_for_attempt(attempt).clone();
            advance(
                batch_index,
                &mut state,
                EscalationState::Validating {
                    attempt,
                    tier: tier.clone(),
                },
            );
            attempts = attempt + 1;

            let call = self.call_with_retries(batch_index, &request, &tier).await;
            inference_calls += call.calls;
            let retries = call.retries;
            let event = |outcome: TraceOutcome| {
                trace(outcome)
                    .tier(tier.model_id())
                    .attempt(attempt)
                    .transport_retries(retries)
            };

            let (outcome, response) = match call.result {
                Ok(response) => {
                    let validation = validate_batch(requirements, &response, snapshot);
                    if validation.is_accepted() {
                        self.emit(event(TraceOutcome::Accepted));
                        let outcome = AttemptOutcome::Accepted {
                            min_coverage: validation.min_coverage(),
                        };
                        last_validation = Some(validation);
                        (outcome, Some(response))
                    } else {
                        let reasons = validation.reasons();
                        info!(
                            batch_index,
                            tier = %tier,
                            attempt,
                            rejections = reasons.len(),
                            "batch rejected by validator"
                        );
                        self.emit(event(TraceOutcome::Rejected).reasons(&reasons));
                        last_validation = Some(validation);
                        (AttemptOutcome::Rejected, None)
                    }
                }
                Err(InferenceError::Malformed(detail)) => {
                    info!(batch_index, tier = %tier, attempt, detail = %detail, "malformed batch response");
                    let reason = RejectionReason::MalformedResponse { detail };
                    self.emit(event(TraceOutcome::Rejected).reasons(std::slice::from_ref(&reason)));
                    last_validation = Some(BatchValidation::rejected(reason));
                    (AttemptOutcome::Rejected, None)
                }
                Err(err) => {
                    warn!(batch_index, tier = %tier, attempt, error = %err, "inference call failed");
                    self.emit(event(TraceOutcome::TransportError).error(err.to_string()));
                    last_validation = None;
                    (AttemptOutcome::TransportFailed, None)
                }
            };

            match self.policy.decide(attempt, outcome) {
                Decision::Accept => {
                    let Some(response) = response else {
                        break;
                    };
                    let payloads = accepted_payloads(last_validation.take());
                    self.store(batch_index, &key, &tier, &response).await;
                    advance(
                        batch_index,
                        &mut state,
                        EscalationState::Accepted {
                            attempt,
                            cached: false,
                        },
                    );
                    return BatchOutcome {
                        batch_index,
                        range,
                        outcomes: payloads.into_iter().map(RequirementOutcome::Mapped).collect(),
                        state,
                        cached: false,
                        inference_calls,
                        escalations,
                    };
                }
                Decision::Escalate(reason) => {
                    escalations += 1;
                    if reason == EscalationReason::LowCoverage {
                        if let Some(response) = response {
                            fallback = Some(Fallback {
                                payloads: accepted_payloads(last_validation.take()),
                                response,
                                tier: tier.clone(),
                            });
                        }
                    }
                    advance(
                        batch_index,
                        &mut state,
                        EscalationState::EscalatingTier {
                            from_attempt: attempt,
                            reason,
                        },
                    );
                    info!(
                        batch_index,
                        from = %tier,
                        to = %self.policy.tier_for_attempt(attempt + 1),
                        reason = ?reason,
                        "escalating tier"
                    );
                }
                Decision::GiveUp => break,
            }
        }

        let cancelled = self.cancelled() && attempts < self.policy.max_attempts();

        if let Some(fallback) = fallback {
            info!(
                batch_index,
                tier = %fallback.tier,
                "keeping earlier low-coverage answer"
            );
            self.store(batch_index, &key, &fallback.tier, &fallback.response).await;
            advance(
                batch_index,
                &mut state,
                EscalationState::Accepted {
                    attempt: attempts.saturating_sub(1),
                    cached: false,
                },
            );
            return BatchOutcome {
                batch_index,
                range,
                outcomes: fallback
                    .payloads
                    .into_iter()
                    .map(RequirementOutcome::Mapped)
                    .collect(),
                state,
                cached: false,
                inference_calls,
                escalations,
            };
        }

        let (note, next, outcome) = if cancelled {
            (cancelled_note(attempts), EscalationState::Cancelled { attempts }, TraceOutcome::Cancelled)
        } else {
            (exhausted_note(attempts), EscalationState::Exhausted { attempts }, TraceOutcome::Exhausted)
        };
        advance(batch_index, &mut state, next);
        warn!(batch_index, attempts, state = ?state, "batch falls back to manual review");
        self.emit(trace(outcome).attempt(attempts));

        let outcomes = match last_validation {
            Some(validation) if validation.outcomes.len() == requirements.len() => validation
                .outcomes
                .into_iter()
                .map(|o| match o {
                    ValidationResult::Accepted(payload) => RequirementOutcome::Mapped(payload),
                    ValidationResult::Rejected(_) => RequirementOutcome::ManualReview(note.clone()),
                })
                .collect(),
            _ => requirements
                .iter()
                .map(|_| RequirementOutcome::ManualReview(note.clone()))
                .collect(),
        };

        BatchOutcome {
            batch_index,
            range,
            outcomes,
            state,
            cached: false,
            inference_calls,
            escalations,
        }
    }

    /// Cached answers skip validation but must still line up with the batch.
    /// An entry that does not is evicted so this run's answer replaces it.
    async fn lookup_cached(
        &self,
        batch_index: usize,
        requirements: &[Requirement],
        key: &BatchCacheKey,
    ) -> Option<Vec<ValidatedPayload>> {
        let cache = self.cache?;
        let entry = match cache.get(key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                debug!(batch_index, key_hash = %key.key_hash, "cache miss");
                return None;
            }
            Err(CacheError::Corrupt(_)) => {
                warn!(batch_index, key_hash = %key.key_hash, "corrupt cache entry; evicting");
                self.evict(batch_index, cache, key).await;
                return None;
            }
            Err(err) => {
                warn!(batch_index, key_hash = %key.key_hash, error = %err, "cache read failed; treating as miss");
                return None;
            }
        };

        let payloads: Option<Vec<ValidatedPayload>> = if entry.response.payloads.len() == requirements.len() {
            requirements
                .iter()
                .zip(&entry.response.payloads)
                .map(|(req, raw)| interpret_cached(req, raw))
                .collect()
        } else {
            None
        };
        if payloads.is_none() {
            warn!(batch_index, key_hash = %key.key_hash, "cached response unreadable; evicting");
            self.evict(batch_index, cache, key).await;
        }
        payloads
    }

    async fn evict(&self, batch_index: usize, cache: &dyn BatchCache, key: &BatchCacheKey) {
        if let Err(err) = cache.evict(key).await {
            warn!(batch_index, key_hash = %key.key_hash, error = %err, "failed to evict cache entry");
        }
    }

    async fn store(&self, batch_index: usize, key: &BatchCacheKey, tier: &ModelTier, response: &BatchResponse) {
        if let Some(cache) = self.cache {
            if let Err(err) = cache.put(key, tier, response).await {
                warn!(batch_index, key_hash = %key.key_hash, error = %err, "failed to write cache entry");
            }
        }
    }

    /// One attempt on one tier: the call plus its transport retries.
    async fn call_with_retries(&self, batch_index: usize, request: &BatchRequest, tier: &ModelTier) -> CallResult {
        let mut retries = 0u32;
        let mut calls = 0usize;
        loop {
            let result = {
                let _permit = self.limiter.acquire().await.ok();
                self.client.map(request, tier).await
            };
            calls += 1;

            match result {
                Err(err)
                    if err.is_retryable()
                        && retries < self.policy.transport_retries()
                        && !self.cancelled() =>
                {
                    let delay = self.policy.retry_delay(retries);
                    let delay = err.retry_after().map_or(delay, |after| after.max(delay));
                    warn!(
                        batch_index,
                        tier = %tier,
                        retry = retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transport error; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    retries += 1;
                }
                result => {
                    return CallResult {
                        result,
                        retries,
                        calls,
                    }
                }
            }
        }
    }
}

fn advance(batch_index: usize, state: &mut EscalationState, next: EscalationState) {
    debug!(batch_index, from = ?state, to = ?next, "batch state");
    *state = next;
}

fn accepted_payloads(validation: Option<BatchValidation>) -> Vec<ValidatedPayload> {
    validation
        .map(|v| {
            v.outcomes
                .into_iter()
                .filter_map(|o| match o {
                    ValidationResult::Accepted(payload) => Some(payload),
                    ValidationResult::Rejected(_) => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

// =============================================================================
// Run entry point
// =============================================================================

/// Optional collaborators for a run.
#[derive(Clone, Default)]
pub struct RunOptions<'a> {
    pub cache: Option<&'a dyn BatchCache>,
    pub trace: Option<&'a dyn TraceSink>,
    pub cancel_flag: Option<&'a AtomicBool>,
    /// Defaults to a `TierLadderPolicy` built from the config.
    pub policy: Option<Arc<dyn EscalationPolicy>>,
}

/// Map every requirement and fold the accepted results into `catalog`.
///
/// Only configuration problems and duplicate requirement ids fail the run;
/// every other failure ends as a manual-review result.
pub async fn map_requirements(
    client: &dyn InferenceClient,
    catalog: &SharedCatalog,
    requirements: &[Requirement],
    config: &MapperConfig,
    options: RunOptions<'_>,
) -> Result<MappingRun, MappingError> {
    config.validate()?;
    let mut seen: HashSet<&str> = HashSet::with_capacity(requirements.len());
    for req in requirements {
        if !seen.insert(req.id.as_str()) {
            return Err(MappingError::DuplicateRequirement(req.id.clone()));
        }
    }

    let ladder;
    let policy: &dyn EscalationPolicy = match options.policy.as_deref() {
        Some(policy) => policy,
        None => {
            ladder = TierLadderPolicy::from_config(&config.escalation);
            &ladder
        }
    };

    let run_id = Uuid::new_v4();
    let snapshot = catalog.snapshot();
    info!(
        run_id = %run_id,
        requirements = requirements.len(),
        batch_size = config.batch_size,
        catalog_version = snapshot.version(),
        policy = policy.describe().unwrap_or_default(),
        "mapping run started"
    );

    let dispatcher = BatchDispatcher::new(client, policy, config)
        .with_cache(options.cache)
        .with_trace(options.trace)
        .with_cancel_flag(options.cancel_flag);
    let outcomes = dispatcher.dispatch(requirements, &snapshot).await;
    let (results, summary) = aggregate(catalog, requirements, outcomes);

    let catalog_version = catalog.snapshot().version();
    info!(
        run_id = %run_id,
        batches = summary.batches,
        cache_hits = summary.cache_hits,
        inference_calls = summary.inference_calls,
        new_functions = summary.new_functions_accepted,
        needs_review = summary.needs_review,
        cancelled = summary.cancelled,
        "mapping run finished"
    );

    Ok(MappingRun {
        run_id,
        results,
        summary,
        catalog_version,
    })
}
