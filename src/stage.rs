//! Stage Operations
//!
//! The pluggable transformation applied to each chunk. Stage operations are
//! resolved through an explicit registry owned by the process entry point and
//! passed into the engine; there is no ambient global registration.

use crate::error::{EngineError, Result};
use async_trait::async_trait;
use polars::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

/// Isolated sub-context a stage operation runs in.
///
/// Exposes only the current chunk (under `input_key`) plus chunk metadata;
/// a stage never observes other chunks or the full dataset. A stage produces
/// output either by inserting a frame at `output_key`, by inserting a plain
/// JSON value at `output_key` (coerced to a table by the invoker), or by
/// mutating the input frame in place.
pub struct StageContext {
    pub frames: HashMap<String, DataFrame>,
    pub values: HashMap<String, serde_json::Value>,
    /// Opaque stage parameters, passed through from the run configuration
    pub params: serde_json::Value,
    pub chunk_index: usize,
    pub chunk_size: usize,
    pub input_key: String,
    pub output_key: String,
}

impl StageContext {
    pub fn new(
        chunk: DataFrame,
        params: serde_json::Value,
        chunk_index: usize,
        input_key: &str,
        output_key: &str,
    ) -> Self {
        let chunk_size = chunk.height();
        let mut frames = HashMap::new();
        frames.insert(input_key.to_string(), chunk);
        Self {
            frames,
            values: HashMap::new(),
            params,
            chunk_index,
            chunk_size,
            input_key: input_key.to_string(),
            output_key: output_key.to_string(),
        }
    }

    /// The chunk this stage was handed
    pub fn input(&self) -> Result<&DataFrame> {
        self.frames.get(&self.input_key).ok_or_else(|| {
            EngineError::ChunkProcessing {
                chunk_index: self.chunk_index,
                message: format!("input frame '{}' missing from context", self.input_key),
            }
        })
    }

    /// Place the stage's result table at the configured output key
    pub fn set_output(&mut self, df: DataFrame) {
        self.frames.insert(self.output_key.clone(), df);
    }
}

/// One pluggable chunk transformation
#[async_trait]
pub trait StageOperation: Send + Sync {
    async fn run(&self, ctx: &mut StageContext) -> Result<()>;
}

/// Explicit lookup table from stage name to operation.
///
/// Built once by the process entry point and handed to the engine as a
/// constructor argument.
#[derive(Default)]
pub struct StageRegistry {
    stages: HashMap<String, Arc<dyn StageOperation>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self {
            stages: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: &str, op: Arc<dyn StageOperation>) {
        self.stages.insert(name.to_string(), op);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StageOperation>> {
        self.stages.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stages.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Copies the input chunk to the output key unchanged.
/// The baseline stage for wiring tests and pass-through pipelines.
pub struct IdentityStage;

#[async_trait]
impl StageOperation for IdentityStage {
    async fn run(&self, ctx: &mut StageContext) -> Result<()> {
        let out = ctx.input()?.clone();
        ctx.set_output(out);
        Ok(())
    }
}
