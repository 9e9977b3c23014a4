//! Execution Scheduler
//!
//! Drives the partitioner and stage invoker under the selected concurrency
//! mode, applying the configured failure policy per chunk. In parallel mode
//! completions arrive out of order, so outcomes are buffered and committed
//! (checkpoint + statistics) in submission order; under the fail policy
//! nothing past the first failure is ever committed.

use crate::checkpoint::CheckpointStore;
use crate::config::{EngineConfig, ExecutionMode, FailurePolicy};
use crate::error::{EngineError, Result};
use crate::invoker::StageInvoker;
use crate::monitor::ProgressMonitor;
use crate::partitioner::{slice_chunk, ChunkSpec};
use crate::stage::StageOperation;
use polars::prelude::*;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Chunk counts below this stay sequential under adaptive mode
const ADAPTIVE_PARALLEL_THRESHOLD: usize = 4;

/// Final retained result of one chunk (one per spec; retries collapse into it)
#[derive(Debug)]
pub struct ChunkOutcome {
    pub chunk_index: usize,
    pub rows_in: usize,
    /// Present on success unless the output was checkpointed and released
    pub output: Option<DataFrame>,
    pub error: Option<String>,
    pub elapsed: Duration,
    pub attempts: u32,
    /// Output persisted to the checkpoint store and dropped from memory
    pub released: bool,
}

impl ChunkOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Clone)]
pub struct ExecutionScheduler {
    op: Arc<dyn StageOperation>,
    config: Arc<EngineConfig>,
    cancel: watch::Receiver<bool>,
}

impl ExecutionScheduler {
    pub fn new(
        op: Arc<dyn StageOperation>,
        config: Arc<EngineConfig>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self { op, config, cancel }
    }

    /// Process every spec against `df`, returning outcomes ordered by chunk index.
    ///
    /// Under the `fail` policy the first chunk failure aborts the run: the
    /// progress indicator is closed and the stage error propagates. Under
    /// `skip`/`retry` failures are recorded in the outcomes and the run
    /// continues.
    pub async fn run(
        &self,
        df: &DataFrame,
        specs: &[ChunkSpec],
        monitor: &ProgressMonitor,
        checkpoint: Option<&CheckpointStore>,
    ) -> Result<Vec<ChunkOutcome>> {
        if specs.is_empty() {
            return Ok(Vec::new());
        }

        if self.effective_mode(specs.len()) == ExecutionMode::Parallel {
            self.run_parallel(df, specs, monitor, checkpoint).await
        } else {
            self.run_sequential(df, specs, monitor, checkpoint).await
        }
    }

    /// Deterministic mode choice: adaptive goes parallel only when there are
    /// enough chunks to amortize worker startup and more than one worker.
    fn effective_mode(&self, chunk_count: usize) -> ExecutionMode {
        match self.config.execution_mode {
            ExecutionMode::Adaptive => {
                if chunk_count >= ADAPTIVE_PARALLEL_THRESHOLD && self.worker_count() > 1 {
                    ExecutionMode::Parallel
                } else {
                    ExecutionMode::Sequential
                }
            }
            mode => mode,
        }
    }

    fn worker_count(&self) -> usize {
        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        self.config.max_workers.min(available).max(1)
    }

    async fn run_sequential(
        &self,
        df: &DataFrame,
        specs: &[ChunkSpec],
        monitor: &ProgressMonitor,
        checkpoint: Option<&CheckpointStore>,
    ) -> Result<Vec<ChunkOutcome>> {
        debug!(chunks = specs.len(), "running sequentially");
        let mut outcomes = Vec::with_capacity(specs.len());

        for spec in specs {
            let chunk = slice_chunk(df, spec);
            let mut outcome = self.process_chunk(*spec, chunk, false).await?;
            self.commit(&mut outcome, monitor, checkpoint);

            if !outcome.succeeded() && self.config.failure_policy == FailurePolicy::Fail {
                monitor.abort();
                return Err(EngineError::ChunkProcessing {
                    chunk_index: outcome.chunk_index,
                    message: outcome.error.unwrap_or_default(),
                });
            }
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn run_parallel(
        &self,
        df: &DataFrame,
        specs: &[ChunkSpec],
        monitor: &ProgressMonitor,
        checkpoint: Option<&CheckpointStore>,
    ) -> Result<Vec<ChunkOutcome>> {
        let workers = self.worker_count();
        info!(chunks = specs.len(), workers, "running in parallel");

        let semaphore = Arc::new(Semaphore::new(workers));
        let mut join_set: JoinSet<Result<ChunkOutcome>> = JoinSet::new();
        let mut pending: BTreeMap<usize, ChunkOutcome> = BTreeMap::new();
        let mut outcomes = Vec::with_capacity(specs.len());
        // Resumed runs can hand us non-contiguous indices; commit follows
        // submission order, not index arithmetic
        let mut expected: VecDeque<usize> = specs.iter().map(|s| s.index).collect();
        let mut abort: Option<EngineError> = None;

        // Submission stays in index order; a permit bounds in-flight chunks
        for spec in specs {
            if abort.is_some() {
                break;
            }
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| EngineError::Cancelled(format!("worker pool closed: {}", e)))?;

            while let Some(joined) = join_set.try_join_next() {
                self.collect_completed(
                    joined,
                    &mut pending,
                    &mut outcomes,
                    &mut expected,
                    &mut abort,
                    monitor,
                    checkpoint,
                )?;
            }

            let scheduler = self.clone();
            let spec = *spec;
            let chunk = slice_chunk(df, &spec);
            join_set.spawn(async move {
                let _permit = permit;
                scheduler.process_chunk(spec, chunk, true).await
            });
        }

        // No cross-chunk cancellation: in-flight chunks run to completion
        while let Some(joined) = join_set.join_next().await {
            self.collect_completed(
                joined,
                &mut pending,
                &mut outcomes,
                &mut expected,
                &mut abort,
                monitor,
                checkpoint,
            )?;
        }

        if let Some(err) = abort {
            monitor.abort();
            return Err(err);
        }
        Ok(outcomes)
    }

    /// Fold one finished worker task into the in-order commit stream
    #[allow(clippy::too_many_arguments)]
    fn collect_completed(
        &self,
        joined: std::result::Result<Result<ChunkOutcome>, tokio::task::JoinError>,
        pending: &mut BTreeMap<usize, ChunkOutcome>,
        outcomes: &mut Vec<ChunkOutcome>,
        expected: &mut VecDeque<usize>,
        abort: &mut Option<EngineError>,
        monitor: &ProgressMonitor,
        checkpoint: Option<&CheckpointStore>,
    ) -> Result<()> {
        let outcome = joined
            .map_err(|e| EngineError::Cancelled(format!("worker task failed: {}", e)))??;
        pending.insert(outcome.chunk_index, outcome);

        while let Some(mut outcome) = expected
            .front()
            .and_then(|index| pending.remove(index))
        {
            if abort.is_some() {
                // Nothing past the failure point is committed or checkpointed
                break;
            }
            if !outcome.succeeded() && self.config.failure_policy == FailurePolicy::Fail {
                monitor.record_failure(
                    outcome.chunk_index,
                    outcome.rows_in,
                    outcome.elapsed,
                    outcome.attempts,
                    outcome.error.as_deref().unwrap_or(""),
                );
                *abort = Some(EngineError::ChunkProcessing {
                    chunk_index: outcome.chunk_index,
                    message: outcome.error.unwrap_or_default(),
                });
                break;
            }
            self.commit(&mut outcome, monitor, checkpoint);
            outcomes.push(outcome);
            expected.pop_front();
        }
        Ok(())
    }

    /// Record a committed outcome: checkpoint on success (write failures are
    /// warnings, never fatal), then update statistics.
    fn commit(
        &self,
        outcome: &mut ChunkOutcome,
        monitor: &ProgressMonitor,
        checkpoint: Option<&CheckpointStore>,
    ) {
        match &outcome.output {
            Some(output) => {
                if let Some(store) = checkpoint {
                    match store.save(outcome.chunk_index, output) {
                        Ok(()) => {
                            if self.config.release_after_chunk {
                                // Working set released; aggregation reloads from the store
                                outcome.output = None;
                                outcome.released = true;
                            }
                        }
                        Err(e) => warn!(
                            chunk_index = outcome.chunk_index,
                            "checkpoint write failed, continuing without checkpoint: {}", e
                        ),
                    }
                }
                monitor.record_success(
                    outcome.chunk_index,
                    outcome.rows_in,
                    outcome.elapsed,
                    outcome.attempts,
                );
            }
            None => monitor.record_failure(
                outcome.chunk_index,
                outcome.rows_in,
                outcome.elapsed,
                outcome.attempts,
                outcome.error.as_deref().unwrap_or(""),
            ),
        }
    }

    /// Run one chunk to its final outcome, applying the retry policy.
    /// Returns `Err` only when the run itself is cancelled.
    async fn process_chunk(
        &self,
        spec: ChunkSpec,
        chunk: DataFrame,
        apply_timeout: bool,
    ) -> Result<ChunkOutcome> {
        let started = Instant::now();
        let mut attempts = 0;

        loop {
            attempts += 1;
            let result = self
                .attempt(spec, chunk.clone(), apply_timeout)
                .await;

            match result {
                Ok(output) => {
                    return Ok(ChunkOutcome {
                        chunk_index: spec.index,
                        rows_in: spec.row_count,
                        output: Some(output),
                        error: None,
                        elapsed: started.elapsed(),
                        attempts,
                        released: false,
                    })
                }
                Err(e) => {
                    warn!(chunk_index = spec.index, attempts, "chunk attempt failed: {}", e);
                    let retries_left = self.config.failure_policy == FailurePolicy::Retry
                        && attempts <= self.config.max_retries;
                    if retries_left {
                        self.retry_delay().await?;
                        continue;
                    }
                    return Ok(ChunkOutcome {
                        chunk_index: spec.index,
                        rows_in: spec.row_count,
                        output: None,
                        error: Some(e.to_string()),
                        elapsed: started.elapsed(),
                        attempts,
                        released: false,
                    });
                }
            }
        }
    }

    async fn attempt(
        &self,
        spec: ChunkSpec,
        chunk: DataFrame,
        apply_timeout: bool,
    ) -> Result<DataFrame> {
        let invocation = StageInvoker::invoke(
            self.op.clone(),
            chunk,
            self.config.stage_params.clone(),
            spec.index,
            &self.config.input_key,
            &self.config.output_key,
        );

        if apply_timeout {
            let limit = Duration::from_secs(self.config.chunk_timeout_seconds);
            match tokio::time::timeout(limit, invocation).await {
                Ok(result) => result,
                Err(_) => Err(EngineError::ChunkTimeout {
                    chunk_index: spec.index,
                    seconds: self.config.chunk_timeout_seconds,
                }),
            }
        } else {
            invocation.await
        }
    }

    /// Fixed delay between retry attempts, raced against the run's
    /// cancellation signal so shutdown is never blocked by a sleeping retry.
    async fn retry_delay(&self) -> Result<()> {
        let delay = Duration::from_secs_f64(self.config.retry_delay_seconds.max(0.0));
        let mut cancel = self.cancel.clone();
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = cancel.changed() => Err(EngineError::Cancelled(
                "run cancelled during retry delay".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{IdentityStage, StageContext};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails deterministically on one chunk index
    struct FailOnIndexStage {
        fail_index: usize,
    }

    #[async_trait]
    impl StageOperation for FailOnIndexStage {
        async fn run(&self, ctx: &mut StageContext) -> Result<()> {
            if ctx.chunk_index == self.fail_index {
                return Err(EngineError::Polars("poison chunk".to_string()));
            }
            let out = ctx.input()?.clone();
            ctx.set_output(out);
            Ok(())
        }
    }

    /// Fails the first N attempts across all chunks, then succeeds
    struct FlakyStage {
        failures_remaining: AtomicU32,
    }

    #[async_trait]
    impl StageOperation for FlakyStage {
        async fn run(&self, ctx: &mut StageContext) -> Result<()> {
            let before = self.failures_remaining.fetch_update(
                Ordering::SeqCst,
                Ordering::SeqCst,
                |n| if n > 0 { Some(n - 1) } else { None },
            );
            if before.is_ok() {
                return Err(EngineError::Polars("transient".to_string()));
            }
            let out = ctx.input()?.clone();
            ctx.set_output(out);
            Ok(())
        }
    }

    fn sample(rows: usize) -> DataFrame {
        df! ["id" => (0..rows as i64).collect::<Vec<_>>()].unwrap()
    }

    fn scheduler(
        op: Arc<dyn StageOperation>,
        config: EngineConfig,
    ) -> (ExecutionScheduler, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        (ExecutionScheduler::new(op, Arc::new(config), rx), tx)
    }

    fn specs(total: usize, chunk_size: usize) -> Vec<ChunkSpec> {
        crate::partitioner::ChunkPartitioner::new(chunk_size, 0)
            .unwrap()
            .specs(total)
    }

    #[tokio::test]
    async fn test_sequential_processes_in_index_order() {
        let df = sample(100);
        let config = EngineConfig::default();
        let (sched, _cancel) = scheduler(Arc::new(IdentityStage), config);
        let monitor = ProgressMonitor::new(4, false);

        let outcomes = sched
            .run(&df, &specs(100, 25), &monitor, None)
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 4);
        for (i, outcome) in outcomes.iter().enumerate() {
            assert_eq!(outcome.chunk_index, i);
            assert!(outcome.succeeded());
        }
    }

    #[tokio::test]
    async fn test_skip_policy_records_failure_and_continues() {
        let df = sample(100);
        let config = EngineConfig {
            failure_policy: FailurePolicy::Skip,
            ..Default::default()
        };
        let (sched, _cancel) = scheduler(Arc::new(FailOnIndexStage { fail_index: 1 }), config);
        let monitor = ProgressMonitor::new(4, false);

        let outcomes = sched
            .run(&df, &specs(100, 25), &monitor, None)
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 4);
        assert!(!outcomes[1].succeeded());
        assert_eq!(outcomes.iter().filter(|o| o.succeeded()).count(), 3);
    }

    #[tokio::test]
    async fn test_fail_policy_aborts_run() {
        let df = sample(100);
        let config = EngineConfig::default();
        let (sched, _cancel) = scheduler(Arc::new(FailOnIndexStage { fail_index: 2 }), config);
        let monitor = ProgressMonitor::new(4, false);

        let err = sched
            .run(&df, &specs(100, 25), &monitor, None)
            .await
            .unwrap_err();
        match err {
            EngineError::ChunkProcessing { chunk_index, .. } => assert_eq!(chunk_index, 2),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_retry_policy_recovers_transient_failures() {
        let df = sample(50);
        let config = EngineConfig {
            failure_policy: FailurePolicy::Retry,
            max_retries: 3,
            retry_delay_seconds: 0.0,
            ..Default::default()
        };
        let (sched, _cancel) = scheduler(
            Arc::new(FlakyStage {
                failures_remaining: AtomicU32::new(2),
            }),
            config,
        );
        let monitor = ProgressMonitor::new(1, false);

        let outcomes = sched
            .run(&df, &specs(50, 50), &monitor, None)
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].succeeded());
        assert_eq!(outcomes[0].attempts, 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_degrades_to_skip() {
        let df = sample(50);
        let config = EngineConfig {
            failure_policy: FailurePolicy::Retry,
            max_retries: 2,
            retry_delay_seconds: 0.0,
            ..Default::default()
        };
        let (sched, _cancel) = scheduler(
            Arc::new(FlakyStage {
                failures_remaining: AtomicU32::new(100),
            }),
            config,
        );
        let monitor = ProgressMonitor::new(1, false);

        let outcomes = sched
            .run(&df, &specs(50, 50), &monitor, None)
            .await
            .unwrap();
        assert!(!outcomes[0].succeeded());
        assert_eq!(outcomes[0].attempts, 3); // first attempt + 2 retries
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_outcomes_are_index_ordered() {
        let df = sample(1000);
        let config = EngineConfig {
            execution_mode: ExecutionMode::Parallel,
            max_workers: 4,
            ..Default::default()
        };
        let (sched, _cancel) = scheduler(Arc::new(IdentityStage), config);
        let monitor = ProgressMonitor::new(10, false);

        let outcomes = sched
            .run(&df, &specs(1000, 100), &monitor, None)
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 10);
        for (i, outcome) in outcomes.iter().enumerate() {
            assert_eq!(outcome.chunk_index, i);
        }
    }

    #[tokio::test]
    async fn test_adaptive_mode_is_deterministic() {
        let config = EngineConfig {
            execution_mode: ExecutionMode::Adaptive,
            max_workers: 4,
            ..Default::default()
        };
        let (sched, _cancel) = scheduler(Arc::new(IdentityStage), config);
        assert_eq!(sched.effective_mode(2), ExecutionMode::Sequential);
        let many = sched.effective_mode(100);
        assert_eq!(many, sched.effective_mode(100));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_retry_delay() {
        let df = sample(50);
        let config = EngineConfig {
            failure_policy: FailurePolicy::Retry,
            max_retries: 5,
            retry_delay_seconds: 30.0,
            ..Default::default()
        };
        let (sched, cancel) = scheduler(
            Arc::new(FlakyStage {
                failures_remaining: AtomicU32::new(100),
            }),
            config,
        );

        let started = Instant::now();
        let handle = tokio::spawn(async move {
            let monitor = ProgressMonitor::new(1, false);
            sched.run(&df, &specs(50, 50), &monitor, None).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.send(true).unwrap();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, EngineError::Cancelled(_)));
        // the 30s retry sleep must not run to completion
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_commits_non_contiguous_specs_in_order() {
        let df = sample(1000);
        let config = EngineConfig {
            execution_mode: ExecutionMode::Parallel,
            max_workers: 4,
            ..Default::default()
        };
        let (sched, _cancel) = scheduler(Arc::new(IdentityStage), config);
        let monitor = ProgressMonitor::new(4, false);

        // a resumed run hands over only the chunks that still need work
        let all = specs(1000, 100);
        let remaining: Vec<ChunkSpec> = [1usize, 4, 5, 8]
            .iter()
            .map(|&i| all[i])
            .collect();

        let outcomes = sched.run(&df, &remaining, &monitor, None).await.unwrap();
        let indices: Vec<usize> = outcomes.iter().map(|o| o.chunk_index).collect();
        assert_eq!(indices, vec![1, 4, 5, 8]);
        assert!(outcomes.iter().all(|o| o.succeeded()));
    }
}
