//! Stage Invoker
//!
//! Executes one stage operation against one chunk inside an isolated
//! sub-context and resolves its output table. Stages that mutate their input
//! in place instead of writing an output key still produce their chunk back,
//! not an empty table.

use crate::error::{EngineError, Result};
use crate::stage::{StageContext, StageOperation};
use polars::prelude::*;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

pub struct StageInvoker;

impl StageInvoker {
    /// Run `op` over `chunk` and return its output table.
    ///
    /// Output resolution order: a frame at the output key is returned as-is;
    /// a JSON value at the output key is coerced to a single-column (or
    /// single-row record) table; otherwise the input frame is returned,
    /// carrying any in-place mutation the stage made. Errors raised by the
    /// stage are annotated with the chunk index.
    pub async fn invoke(
        op: Arc<dyn StageOperation>,
        chunk: DataFrame,
        params: Value,
        chunk_index: usize,
        input_key: &str,
        output_key: &str,
    ) -> Result<DataFrame> {
        let mut ctx = StageContext::new(chunk, params, chunk_index, input_key, output_key);

        op.run(&mut ctx)
            .await
            .map_err(|e| e.for_chunk(chunk_index))?;

        if let Some(out) = ctx.frames.remove(output_key) {
            return Ok(out);
        }

        match ctx.values.remove(output_key) {
            Some(Value::Null) | None => {}
            Some(value) => {
                debug!(chunk_index, "coercing non-table stage output to a table");
                return value_to_frame(output_key, value).map_err(|e| e.for_chunk(chunk_index));
            }
        }

        // Stage mutated (or ignored) its input; hand the chunk back rather
        // than silently producing empty output
        ctx.frames
            .remove(input_key)
            .ok_or_else(|| EngineError::ChunkProcessing {
                chunk_index,
                message: format!(
                    "stage produced no output at '{}' and consumed the input frame",
                    output_key
                ),
            })
    }
}

/// Coerce a JSON value to a table: arrays become one column, objects become a
/// one-row record, scalars become a one-cell column.
fn value_to_frame(key: &str, value: Value) -> Result<DataFrame> {
    match value {
        Value::Array(items) => Ok(DataFrame::new(vec![values_to_series(key, &items)])?),
        Value::Object(map) => {
            let mut columns = Vec::with_capacity(map.len());
            for (name, v) in map {
                columns.push(values_to_series(&name, std::slice::from_ref(&v)));
            }
            Ok(DataFrame::new(columns)?)
        }
        scalar => Ok(DataFrame::new(vec![values_to_series(
            key,
            std::slice::from_ref(&scalar),
        )])?),
    }
}

fn values_to_series(name: &str, items: &[Value]) -> Series {
    if !items.is_empty() && items.iter().all(|v| v.is_i64()) {
        let vals: Vec<i64> = items.iter().filter_map(|v| v.as_i64()).collect();
        return Series::new(name, vals);
    }
    if !items.is_empty() && items.iter().all(|v| v.is_number()) {
        let vals: Vec<f64> = items.iter().filter_map(|v| v.as_f64()).collect();
        return Series::new(name, vals);
    }
    if !items.is_empty() && items.iter().all(|v| v.is_boolean()) {
        let vals: Vec<bool> = items.iter().filter_map(|v| v.as_bool()).collect();
        return Series::new(name, vals);
    }
    let vals: Vec<String> = items
        .iter()
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect();
    Series::new(name, vals)
}
