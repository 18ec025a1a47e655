//! Coordinator configuration.
//!
//! Every field has a serde default so partial YAML documents are accepted.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Tunables for the coordination services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Default wait used by `Coordinator::request_resource` (milliseconds).
    #[serde(default = "default_request_timeout_ms")]
    pub default_request_timeout_ms: u64,
    /// Maximum messages delivered per delivery-loop tick.
    #[serde(default = "default_delivery_batch_size")]
    pub delivery_batch_size: usize,
    /// Delivery-loop tick interval (milliseconds).
    #[serde(default = "default_delivery_interval_ms")]
    pub delivery_interval_ms: u64,
    /// Agents without a heartbeat for this long are marked dead (milliseconds).
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    /// Weight of the latest outcome in the agent performance moving average.
    #[serde(default = "default_performance_smoothing")]
    pub performance_smoothing: f64,
    /// Maximum counter-offers per bilateral negotiation.
    #[serde(default = "default_negotiation_max_rounds")]
    pub negotiation_max_rounds: u32,
    /// Close a vote as soon as every eligible voter has cast a ballot.
    #[serde(default = "default_true")]
    pub vote_close_when_complete: bool,
    /// Contributions required before a topic can be aggregated.
    #[serde(default = "default_min_contributions")]
    pub default_min_contributions: usize,
    /// Relative standard deviation below which numeric consensus holds.
    #[serde(default = "default_consensus_tolerance")]
    pub consensus_tolerance: f64,
    /// Mean quality above which a collaborating pair is high-performing.
    #[serde(default = "default_high_performance_threshold")]
    pub high_performance_threshold: f64,
    /// Relative confidence boost applied by ensemble aggregation.
    #[serde(default = "default_ensemble_confidence_boost")]
    pub ensemble_confidence_boost: f64,
}

fn default_request_timeout_ms() -> u64 { 5_000 }
fn default_delivery_batch_size() -> usize { 32 }
fn default_delivery_interval_ms() -> u64 { 10 }
fn default_heartbeat_timeout_ms() -> u64 { 30_000 }
fn default_performance_smoothing() -> f64 { 0.1 }
fn default_negotiation_max_rounds() -> u32 { 10 }
fn default_true() -> bool { true }
fn default_min_contributions() -> usize { 1 }
fn default_consensus_tolerance() -> f64 { 0.1 }
fn default_high_performance_threshold() -> f64 { 0.8 }
fn default_ensemble_confidence_boost() -> f64 { 0.1 }

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_request_timeout_ms: default_request_timeout_ms(),
            delivery_batch_size: default_delivery_batch_size(),
            delivery_interval_ms: default_delivery_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            performance_smoothing: default_performance_smoothing(),
            negotiation_max_rounds: default_negotiation_max_rounds(),
            vote_close_when_complete: default_true(),
            default_min_contributions: default_min_contributions(),
            consensus_tolerance: default_consensus_tolerance(),
            high_performance_threshold: default_high_performance_threshold(),
            ensemble_confidence_boost: default_ensemble_confidence_boost(),
        }
    }
}

impl CoordinatorConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Reject values the services cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.delivery_batch_size == 0 {
            return Err(invalid("delivery_batch_size", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.performance_smoothing) {
            return Err(invalid("performance_smoothing", "must be within [0, 1]"));
        }
        if self.consensus_tolerance <= 0.0 {
            return Err(invalid("consensus_tolerance", "must be positive"));
        }
        if !(0.0..=1.0).contains(&self.high_performance_threshold) {
            return Err(invalid("high_performance_threshold", "must be within [0, 1]"));
        }
        if self.ensemble_confidence_boost < 0.0 {
            return Err(invalid("ensemble_confidence_boost", "must not be negative"));
        }
        Ok(())
    }

    pub fn default_request_timeout(&self) -> Duration {
        Duration::from_millis(self.default_request_timeout_ms)
    }

    pub fn delivery_interval(&self) -> Duration {
        Duration::from_millis(self.delivery_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}
