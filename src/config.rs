//! Pipeline configuration.
//!
//! All knobs live in [`PipelineConfig`], deserializable from JSON with
//! per-field defaults so a partial config file stays forward-compatible.

use serde::{Deserialize, Serialize};

use crate::error::CascadeError;
use crate::version::Granularity;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Master enable/disable switch for background scheduling.
    pub enabled: bool,

    /// Scheduler wake interval in milliseconds.
    pub scheduler_interval_ms: u64,

    /// Default lower bound for dictionary refresh intervals, seconds.
    pub dictionary_refresh_lower_secs: u64,

    /// Default upper bound for dictionary refresh intervals, seconds.
    pub dictionary_refresh_upper_secs: u64,

    /// Maximum consecutive refresh errors before a dictionary's scheduled
    /// refresh is auto-suspended.
    pub max_consecutive_errors: u32,

    /// Interval between opportunistic table compactions, seconds.
    pub compaction_interval_secs: u64,

    /// Partition granularity for the backfill driver.
    pub backfill_granularity: Granularity,

    /// Sample capacity for quantile sketches built by rollup rules.
    pub quantile_sketch_capacity: usize,

    /// Sentinel path used when a hierarchical owner cannot be resolved.
    pub fallback_path: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            enabled: true,
            scheduler_interval_ms: 1_000,
            dictionary_refresh_lower_secs: 60,
            dictionary_refresh_upper_secs: 300,
            max_consecutive_errors: 3,
            compaction_interval_secs: 300,
            backfill_granularity: Granularity::Month,
            quantile_sketch_capacity: 256,
            fallback_path: "0/".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Load from a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, CascadeError> {
        serde_json::from_str(json)
            .map_err(|e| CascadeError::InvalidArgument(format!("invalid config: {e}")))
    }

    pub fn validate(&self) -> Result<(), CascadeError> {
        if self.scheduler_interval_ms == 0 {
            return Err(CascadeError::InvalidArgument(
                "scheduler_interval_ms must be positive".into(),
            ));
        }
        if self.dictionary_refresh_lower_secs == 0
            || self.dictionary_refresh_lower_secs > self.dictionary_refresh_upper_secs
        {
            return Err(CascadeError::InvalidArgument(format!(
                "dictionary refresh bounds must satisfy 0 < lower <= upper, got {}..{}",
                self.dictionary_refresh_lower_secs, self.dictionary_refresh_upper_secs
            )));
        }
        if self.quantile_sketch_capacity == 0 {
            return Err(CascadeError::InvalidArgument(
                "quantile_sketch_capacity must be positive".into(),
            ));
        }
        Ok(())
    }
}
