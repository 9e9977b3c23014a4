//! Result Aggregator
//!
//! Combines ordered per-chunk result tables into the final output table:
//! ordered concatenation (optionally de-duplicated), key-based outer merge,
//! or a caller-supplied combination rule.

use crate::config::AggregationStrategy;
use crate::error::{EngineError, Result};
use polars::prelude::*;
use std::sync::Arc;
use tracing::debug;

/// Caller-supplied combination rule for the `custom` strategy
pub type CombineFn = Arc<dyn Fn(Vec<DataFrame>) -> Result<DataFrame> + Send + Sync>;

pub struct ResultAggregator;

impl ResultAggregator {
    /// Combine chunk results, ordered by chunk index.
    ///
    /// Fails with an aggregation error when there is nothing to combine
    /// (every chunk failed). `custom` without a supplied rule falls back to
    /// plain concatenation.
    pub fn aggregate(
        results: Vec<DataFrame>,
        strategy: AggregationStrategy,
        merge_columns: Option<&[String]>,
        dedup_columns: Option<&[String]>,
        combine_fn: Option<&CombineFn>,
    ) -> Result<DataFrame> {
        if results.is_empty() {
            return Err(EngineError::Aggregation(
                "no successful chunk results to aggregate".to_string(),
            ));
        }
        debug!(chunks = results.len(), ?strategy, "aggregating chunk results");

        match strategy {
            AggregationStrategy::Concat => concat_results(results, dedup_columns),
            AggregationStrategy::Merge => {
                let columns = merge_columns.filter(|c| !c.is_empty()).ok_or_else(|| {
                    EngineError::Configuration(
                        "merge aggregation requires merge_columns".to_string(),
                    )
                })?;
                merge_results(results, columns)
            }
            AggregationStrategy::Custom => match combine_fn {
                Some(f) => f(results),
                None => concat_results(results, dedup_columns),
            },
        }
    }
}

/// Row-wise union preserving chunk order; with dedup keys, later duplicate
/// rows are removed and the first occurrence kept.
fn concat_results(results: Vec<DataFrame>, dedup_columns: Option<&[String]>) -> Result<DataFrame> {
    let mut iter = results.into_iter();
    let mut combined = iter
        .next()
        .ok_or_else(|| EngineError::Aggregation("no results".to_string()))?;
    for df in iter {
        combined = combined
            .vstack(&df)
            .map_err(|e| EngineError::Aggregation(format!("concat failed: {}", e)))?;
    }

    match dedup_columns {
        Some(columns) if !columns.is_empty() => {
            let subset: Vec<String> = columns.to_vec();
            combined
                .unique_stable(Some(&subset), UniqueKeepStrategy::First, None)
                .map_err(|e| EngineError::Aggregation(format!("dedup failed: {}", e)))
        }
        _ => Ok(combined),
    }
}

/// Repeated outer join over the merge keys; unmatched keys survive on either side
fn merge_results(results: Vec<DataFrame>, merge_columns: &[String]) -> Result<DataFrame> {
    let on: Vec<Expr> = merge_columns.iter().map(|c| col(c)).collect();

    let mut iter = results.into_iter();
    let mut combined = iter
        .next()
        .ok_or_else(|| EngineError::Aggregation("no results".to_string()))?
        .lazy();
    for df in iter {
        combined = combined.join(
            df.lazy(),
            on.clone(),
            on.clone(),
            JoinArgs::new(JoinType::Outer).with_coalesce(JoinCoalesce::CoalesceColumns),
        );
    }

    combined
        .collect()
        .map_err(|e| EngineError::Aggregation(format!("merge failed: {}", e)))
}
