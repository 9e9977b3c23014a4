//! Engine Configuration
//!
//! All knobs for a chunked batch run. Deserializable from the pipeline YAML/JSON
//! layer; validated up front so a bad run never touches a chunk.

use crate::error::{EngineError, Result};
use crate::stage::StageRegistry;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How chunks are driven through the stage operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Sequential,
    Parallel,
    Adaptive,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        ExecutionMode::Sequential
    }
}

/// What a single chunk failure does to the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Abort the whole run on the first chunk failure
    Fail,
    /// Record the failure and continue; the chunk's rows are excluded from output
    Skip,
    /// Re-attempt the chunk up to `max_retries` times, then degrade to skip
    Retry,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        FailurePolicy::Fail
    }
}

/// How per-chunk result tables are combined into the final table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationStrategy {
    Concat,
    Merge,
    Custom,
}

impl Default for AggregationStrategy {
    fn default() -> Self {
        AggregationStrategy::Concat
    }
}

fn default_input_key() -> String {
    "input".to_string()
}

fn default_output_key() -> String {
    "output".to_string()
}

fn default_max_memory_per_chunk_mb() -> usize {
    512
}

fn default_max_workers() -> usize {
    4
}

fn default_chunk_timeout_seconds() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_seconds() -> f64 {
    1.0
}

/// Configuration for one chunked batch run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Name of the stage operation in the registry
    pub stage_operation: String,
    /// Opaque parameters handed to the stage operation unchanged
    pub stage_params: serde_json::Value,
    /// Key under which the stage operation expects its input chunk
    pub input_key: String,
    /// Key at which the stage operation places its output table
    pub output_key: String,

    /// Fixed chunk size in rows; when absent the profiler derives one
    pub chunk_size: Option<usize>,
    /// Derive chunk size from the memory budget instead of a fixed row count
    pub chunk_by_memory: bool,
    /// Memory budget per chunk in MB, used when `chunk_by_memory` is set
    pub max_memory_per_chunk_mb: usize,
    /// Rows shared between adjacent chunks (sliding-window stages)
    pub overlap_rows: usize,

    pub execution_mode: ExecutionMode,
    pub max_workers: usize,
    /// Per-chunk timeout in parallel mode
    pub chunk_timeout_seconds: u64,

    pub failure_policy: FailurePolicy,
    pub max_retries: u32,
    pub retry_delay_seconds: f64,

    pub checkpoint_enabled: bool,
    pub checkpoint_directory: Option<PathBuf>,

    pub aggregation_strategy: AggregationStrategy,
    /// Join keys for the `merge` strategy; required when that strategy is selected
    pub merge_columns: Option<Vec<String>>,
    /// Dedup keys for the `concat` strategy; first occurrence wins
    pub dedup_columns: Option<Vec<String>>,

    /// Rewrite column storage (narrow ints, intern low-cardinality text) before chunking
    pub optimize_storage: bool,
    /// Drop each chunk's working set before starting the next (sequential mode)
    pub release_after_chunk: bool,
    pub show_progress: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stage_operation: String::new(),
            stage_params: serde_json::Value::Null,
            input_key: default_input_key(),
            output_key: default_output_key(),
            chunk_size: None,
            chunk_by_memory: false,
            max_memory_per_chunk_mb: default_max_memory_per_chunk_mb(),
            overlap_rows: 0,
            execution_mode: ExecutionMode::default(),
            max_workers: default_max_workers(),
            chunk_timeout_seconds: default_chunk_timeout_seconds(),
            failure_policy: FailurePolicy::default(),
            max_retries: default_max_retries(),
            retry_delay_seconds: default_retry_delay_seconds(),
            checkpoint_enabled: false,
            checkpoint_directory: None,
            aggregation_strategy: AggregationStrategy::default(),
            merge_columns: None,
            dedup_columns: None,
            optimize_storage: false,
            release_after_chunk: false,
            show_progress: false,
        }
    }
}

impl EngineConfig {
    /// Fail-fast validation, run before any chunk is touched
    pub fn validate(&self, registry: &StageRegistry) -> Result<()> {
        if self.stage_operation.is_empty() {
            return Err(EngineError::Configuration(
                "No stage operation configured".to_string(),
            ));
        }
        if registry.get(&self.stage_operation).is_none() {
            return Err(EngineError::Configuration(format!(
                "Unknown stage operation '{}'; registered: {}",
                self.stage_operation,
                registry.names().join(", ")
            )));
        }
        if let Some(size) = self.chunk_size {
            if size == 0 {
                return Err(EngineError::Configuration(
                    "chunk_size must be positive".to_string(),
                ));
            }
            if self.overlap_rows >= size {
                return Err(EngineError::Configuration(format!(
                    "overlap_rows ({}) must be strictly less than chunk_size ({})",
                    self.overlap_rows, size
                )));
            }
        }
        if self.chunk_by_memory && self.max_memory_per_chunk_mb == 0 {
            return Err(EngineError::Configuration(
                "max_memory_per_chunk_mb must be positive when chunk_by_memory is set".to_string(),
            ));
        }
        if self.max_workers == 0 {
            return Err(EngineError::Configuration(
                "max_workers must be positive".to_string(),
            ));
        }
        if self.aggregation_strategy == AggregationStrategy::Merge
            && self
                .merge_columns
                .as_ref()
                .map(|c| c.is_empty())
                .unwrap_or(true)
        {
            return Err(EngineError::Configuration(
                "merge aggregation requires merge_columns".to_string(),
            ));
        }
        if self.checkpoint_enabled && self.checkpoint_directory.is_none() {
            return Err(EngineError::Configuration(
                "checkpoint_enabled requires checkpoint_directory".to_string(),
            ));
        }
        if self.retry_delay_seconds < 0.0 {
            return Err(EngineError::Configuration(
                "retry_delay_seconds must be non-negative".to_string(),
            ));
        }
        Ok(())
    }
}
