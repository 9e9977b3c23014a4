//! Engine Front Door
//!
//! Wires the profiler, partitioner, scheduler, checkpoint store, monitor and
//! aggregator into one chunked batch run over a table. The engine owns no
//! dataset I/O: the caller supplies the input table and consumes the final
//! aggregated table from the report.

use crate::aggregator::{CombineFn, ResultAggregator};
use crate::checkpoint::{dataset_fingerprint, CheckpointStore};
use crate::config::{AggregationStrategy, EngineConfig};
use crate::error::{EngineError, Result};
use crate::monitor::{ChunkStatistics, ProgressMonitor};
use crate::partitioner::{ChunkPartitioner, ChunkSpec};
use crate::profiler;
use crate::scheduler::ExecutionScheduler;
use crate::stage::StageRegistry;
use polars::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Run report handed back to the caller. The aggregated output table rides
/// along (not serialized); the surrounding pipeline persists it.
#[derive(Debug, Serialize)]
pub struct ProcessingReport {
    pub success: bool,
    pub total_rows_processed: usize,
    pub chunks_processed: usize,
    pub chunks_failed: usize,
    pub processing_time_seconds: f64,
    pub peak_memory_mb: f64,
    pub average_chunk_time: f64,
    pub per_chunk_statistics: Vec<ChunkStatistics>,
    pub aggregation_strategy_used: AggregationStrategy,
    pub failed_chunk_indices: Vec<usize>,
    #[serde(skip)]
    pub output: Option<DataFrame>,
}

pub struct ChunkEngine {
    registry: Arc<StageRegistry>,
    combine_fn: Option<CombineFn>,
    cancel: Option<watch::Receiver<bool>>,
}

impl ChunkEngine {
    /// The registry is built by the process entry point and passed in
    /// explicitly; the engine never consults ambient global state.
    pub fn new(registry: Arc<StageRegistry>) -> Self {
        Self {
            registry,
            combine_fn: None,
            cancel: None,
        }
    }

    /// Install the combination rule used by the `custom` aggregation strategy
    pub fn with_combine_fn(mut self, f: CombineFn) -> Self {
        self.combine_fn = Some(f);
        self
    }

    /// Subscribe the run to an external shutdown signal. Sending `true` on
    /// the paired `watch::Sender` interrupts retry delays and aborts the run
    /// with `EngineError::Cancelled`; completed chunks stay checkpointed.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Run one chunked batch over `input`.
    ///
    /// Configuration errors surface before any chunk is processed. A run that
    /// skipped some chunks still reports `success: true` with a non-zero
    /// `chunks_failed`; only fail-policy aborts and aggregation-impossible
    /// runs are terminal errors.
    pub async fn run(&self, config: EngineConfig, input: DataFrame) -> Result<ProcessingReport> {
        config.validate(&self.registry)?;
        let op = self
            .registry
            .get(&config.stage_operation)
            .ok_or_else(|| {
                EngineError::Configuration(format!(
                    "unknown stage operation '{}'",
                    config.stage_operation
                ))
            })?;

        let input = if config.optimize_storage {
            profiler::optimize_storage(&input)?
        } else {
            input
        };

        let chunk_size = match config.chunk_size {
            Some(size) => size,
            None if config.chunk_by_memory => {
                profiler::estimate_chunk_size(&input, config.max_memory_per_chunk_mb)
            }
            None => profiler::DEFAULT_CHUNK_SIZE,
        };

        let partitioner = ChunkPartitioner::new(chunk_size, config.overlap_rows)?;
        let specs = partitioner.specs(input.height());
        info!(
            rows = input.height(),
            chunk_size,
            chunks = specs.len(),
            "starting chunked run"
        );

        let monitor = ProgressMonitor::new(specs.len(), config.show_progress);
        let store = self.open_store(&config, &input)?;

        // Resume: replay every readable checkpoint record and recompute the
        // rest. A chunk whose record is missing (a gap left by a skip-policy
        // run) or unreadable (an interrupted write) is processed again rather
        // than silently dropped from the output.
        let mut frames: BTreeMap<usize, DataFrame> = BTreeMap::new();
        if let Some(store) = &store {
            match store.load_results(specs.len()) {
                Ok(replayed) => {
                    for (index, df) in replayed {
                        monitor.record_replayed(index, df.height());
                        frames.insert(index, df);
                    }
                }
                Err(e) => warn!("checkpoint replay failed, starting from chunk 0: {}", e),
            }
            if !frames.is_empty() {
                info!(
                    replayed = frames.len(),
                    "resuming with checkpointed chunk results"
                );
            }
        }
        let to_process: Vec<ChunkSpec> = specs
            .iter()
            .filter(|spec| !frames.contains_key(&spec.index))
            .copied()
            .collect();

        // An internal sender keeps the channel open when no external
        // cancellation signal was installed
        let (_internal_tx, cancel_rx) = match &self.cancel {
            Some(rx) => (None, rx.clone()),
            None => {
                let (tx, rx) = watch::channel(false);
                (Some(tx), rx)
            }
        };
        let scheduler = ExecutionScheduler::new(op, Arc::new(config.clone()), cancel_rx);
        let outcomes = match scheduler
            .run(&input, &to_process, &monitor, store.as_ref())
            .await
        {
            Ok(outcomes) => outcomes,
            Err(e) => {
                monitor.abort();
                return Err(e);
            }
        };
        monitor.finish();

        for outcome in outcomes {
            if let Some(df) = outcome.output {
                frames.insert(outcome.chunk_index, df);
            } else if outcome.released {
                // Output was checkpointed and dropped from memory; reload it
                if let Some(store) = &store {
                    match store.load(outcome.chunk_index) {
                        Ok(df) => {
                            frames.insert(outcome.chunk_index, df);
                        }
                        Err(e) => {
                            return Err(EngineError::Aggregation(format!(
                                "released chunk {} could not be reloaded: {}",
                                outcome.chunk_index, e
                            )))
                        }
                    }
                }
            }
        }

        let output = if specs.is_empty() {
            // Zero chunks is a valid empty run, not an aggregation failure
            input.clear()
        } else {
            ResultAggregator::aggregate(
                frames.into_values().collect(),
                config.aggregation_strategy,
                config.merge_columns.as_deref(),
                config.dedup_columns.as_deref(),
                self.combine_fn.as_ref(),
            )?
        };

        let summary = monitor.summary();
        Ok(ProcessingReport {
            success: true,
            total_rows_processed: summary.total_rows,
            chunks_processed: summary.total_chunks - summary.chunks_failed,
            chunks_failed: summary.chunks_failed,
            processing_time_seconds: summary.elapsed_seconds,
            peak_memory_mb: summary.peak_memory_mb,
            average_chunk_time: summary.average_chunk_time,
            per_chunk_statistics: summary.per_chunk,
            aggregation_strategy_used: config.aggregation_strategy,
            failed_chunk_indices: summary.failed_chunk_indices,
            output: Some(output),
        })
    }

    /// A manifest mismatch (different dataset) is terminal; checkpoint I/O
    /// trouble degrades to running without checkpoints.
    fn open_store(&self, config: &EngineConfig, input: &DataFrame) -> Result<Option<CheckpointStore>> {
        if !config.checkpoint_enabled {
            return Ok(None);
        }
        let dir = config.checkpoint_directory.as_ref().ok_or_else(|| {
            EngineError::Configuration("checkpoint_enabled requires checkpoint_directory".to_string())
        })?;
        match CheckpointStore::open(dir, &dataset_fingerprint(input)) {
            Ok(store) => Ok(Some(store)),
            Err(e @ EngineError::Configuration(_)) => Err(e),
            Err(e) => {
                warn!("checkpointing disabled for this run: {}", e);
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::IdentityStage;

    fn engine() -> ChunkEngine {
        let mut registry = StageRegistry::new();
        registry.register("identity", Arc::new(IdentityStage));
        ChunkEngine::new(Arc::new(registry))
    }

    #[tokio::test]
    async fn test_unknown_stage_fails_before_processing() {
        let config = EngineConfig {
            stage_operation: "missing".to_string(),
            ..Default::default()
        };
        let input = df! ["id" => [1i64]].unwrap();
        let err = engine().run(config, input).await.unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_empty_input_yields_empty_output() {
        let config = EngineConfig {
            stage_operation: "identity".to_string(),
            chunk_size: Some(100),
            ..Default::default()
        };
        let input = DataFrame::empty();
        let report = engine().run(config, input).await.unwrap();
        assert!(report.success);
        assert_eq!(report.chunks_processed, 0);
        assert_eq!(report.total_rows_processed, 0);
        assert_eq!(report.output.unwrap().height(), 0);
    }

    #[tokio::test]
    async fn test_memory_derived_chunk_size() {
        let config = EngineConfig {
            stage_operation: "identity".to_string(),
            chunk_by_memory: true,
            max_memory_per_chunk_mb: 64,
            ..Default::default()
        };
        let input = df! ["id" => (0..500i64).collect::<Vec<_>>()].unwrap();
        let report = engine().run(config, input.clone()).await.unwrap();
        assert!(report.success);
        assert_eq!(report.total_rows_processed, 500);
        assert!(report.output.unwrap().equals(&input));
    }
}
