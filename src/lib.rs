#![forbid(unsafe_code)]

//! # control-mapper
//!
//! Maps compliance requirements (CIS benchmarks, PCI DSS, NIST controls) onto
//! a catalog of automatable check functions.
//!
//! Requirements are sent to an inference backend in small batches. Each
//! answer is checked against the catalog and the naming rules before it is
//! accepted; rejected or weak answers are retried on a stronger model tier,
//! and batches that never pass come back as manual-review items instead of
//! failing the run. Accepted answers are cached by content so a rerun over
//! the same input costs nothing.

pub mod aggregator;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod dispatcher;
pub mod escalation;
pub mod gateway;
pub mod inference;
pub mod prompts;
pub mod trace;
pub mod types;
pub mod validator;

pub use aggregator::aggregate;
pub use cache::{BatchCache, BatchCacheKey, CacheError, JsonlBatchCache, SqliteBatchCache};
pub use catalog::{Catalog, CatalogError, SharedCatalog};
pub use config::{load_config_from_path, ConfigError, MapperConfig};
pub use dispatcher::{
    map_requirements, BatchDispatcher, BatchOutcome, MappingError, RequirementOutcome, RunOptions,
};
pub use escalation::{EscalationConfig, EscalationPolicy, EscalationState, TierLadderPolicy};
pub use gateway::{ChatGateway, ProviderGateway, UsageSink};
pub use inference::{GatewayInferenceClient, InferenceClient, InferenceError};
pub use trace::{BatchTrace, JsonlTraceSink, MemoryTraceSink, TraceError, TraceSink, TraceWorker};
pub use types::{
    AssessmentKind, BatchRequest, BatchResponse, CatalogEntry, Coverage, MappingResult,
    MappingRun, ModelTier, NewFunctionProposal, Requirement, RunSummary,
};
pub use validator::{validate, validate_batch, RejectionReason, ValidationResult};
