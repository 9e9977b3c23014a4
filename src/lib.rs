//! Chunked batch-processing engine for the identifier mapping toolkit.
//!
//! Splits an arbitrarily large table into memory- or row-bounded chunks, runs
//! a pluggable stage operation over each chunk sequentially or in parallel,
//! checkpoints completed chunks for resumability, retries or skips failed
//! chunks per policy, and aggregates partial results back into one table.

pub mod aggregator;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod invoker;
pub mod monitor;
pub mod partitioner;
pub mod profiler;
pub mod scheduler;
pub mod stage;

pub use aggregator::{CombineFn, ResultAggregator};
pub use config::{AggregationStrategy, EngineConfig, ExecutionMode, FailurePolicy};
pub use engine::{ChunkEngine, ProcessingReport};
pub use error::{EngineError, Result};
pub use stage::{IdentityStage, StageContext, StageOperation, StageRegistry};
