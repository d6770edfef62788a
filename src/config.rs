//! Run configuration: JSON file, environment overrides, validation.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::escalation::EscalationConfig;
use crate::types::ModelTier;

pub const ENV_BATCH_SIZE: &str = "CONTROL_MAPPER_BATCH_SIZE";
pub const ENV_TIERS: &str = "CONTROL_MAPPER_TIERS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("invalid value for {var}: {value:?}")]
    Env { var: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapperConfig {
    /// Requirements per backend call.
    pub batch_size: usize,
    /// Batches processed concurrently.
    pub worker_concurrency: usize,
    /// Backend calls in flight across all workers.
    pub inference_concurrency: usize,
    /// Catalog names offered per request; 0 offers the whole catalog.
    pub catalog_sample_limit: usize,
    pub escalation: EscalationConfig,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            worker_concurrency: 4,
            inference_concurrency: 2,
            catalog_sample_limit: 300,
            escalation: EscalationConfig::default(),
        }
    }
}

impl MapperConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.batch_size == 0 {
            return invalid("batch_size must be >= 1");
        }
        if self.worker_concurrency == 0 {
            return invalid("worker_concurrency must be >= 1");
        }
        if self.inference_concurrency == 0 {
            return invalid("inference_concurrency must be >= 1");
        }

        let esc = &self.escalation;
        if esc.tiers.is_empty() {
            return invalid("escalation.tiers must list at least one model");
        }
        if esc.tiers.iter().any(|t| t.model_id().trim().is_empty()) {
            return invalid("escalation.tiers must not contain blank model ids");
        }
        if esc.max_attempts == 0 {
            return invalid("escalation.max_attempts must be >= 1");
        }
        if let Some(t) = esc.low_coverage_threshold {
            if !(1..=10).contains(&t) {
                return invalid("escalation.low_coverage_threshold must be in 1..=10");
            }
        }
        if esc.retry_max_delay_ms < esc.retry_base_delay_ms {
            return invalid("escalation.retry_max_delay_ms must be >= retry_base_delay_ms");
        }
        Ok(())
    }

    /// Apply `CONTROL_MAPPER_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|var| std::env::var(var).ok())
    }

    /// Apply overrides from an arbitrary lookup, one variable at a time.
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(raw) = lookup(ENV_BATCH_SIZE) {
            self.batch_size = raw.trim().parse().map_err(|_| ConfigError::Env {
                var: ENV_BATCH_SIZE,
                value: raw.clone(),
            })?;
        }
        if let Some(raw) = lookup(ENV_TIERS) {
            let tiers: Vec<ModelTier> = raw
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(ModelTier::new)
                .collect();
            if tiers.is_empty() {
                return Err(ConfigError::Env {
                    var: ENV_TIERS,
                    value: raw,
                });
            }
            self.escalation.tiers = tiers;
        }
        Ok(self)
    }
}

/// Read, parse and validate a JSON config. Missing fields take defaults.
pub fn load_config_from_path(path: impl AsRef<Path>) -> Result<MapperConfig, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let config: MapperConfig =
        serde_json::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
    config.validate()?;
    Ok(config)
}
