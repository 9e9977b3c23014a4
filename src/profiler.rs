//! Table Memory Profiler
//!
//! Estimates per-row memory cost of a table and derives a row-count chunk size
//! that keeps each chunk under a memory budget. Also rewrites column storage
//! (narrower integer widths, interned low-cardinality text) to shrink the
//! working set before chunking.

use crate::error::Result;
use polars::prelude::*;
use tracing::debug;

/// Chunk size used when the table is empty and no cost can be measured
pub const DEFAULT_CHUNK_SIZE: usize = 10_000;
/// Lower clamp: below this, per-chunk overhead dominates
pub const MIN_CHUNK_SIZE: usize = 100;
/// Upper clamp: above this, a single chunk stops bounding memory usefully
pub const MAX_CHUNK_SIZE: usize = 100_000;
/// Headroom left for stage-operation overhead on top of raw row storage
const SAFETY_BUFFER: f64 = 0.8;

/// Distinct-value ratio below which a text column is interned
const INTERN_RATIO: f64 = 0.5;

/// Derive a row-count chunk size that keeps each chunk under `max_memory_mb`.
///
/// Always returns a value in `[MIN_CHUNK_SIZE, MAX_CHUNK_SIZE]`;
/// an empty table gets `DEFAULT_CHUNK_SIZE`.
pub fn estimate_chunk_size(df: &DataFrame, max_memory_mb: usize) -> usize {
    let rows = df.height();
    if rows == 0 {
        return DEFAULT_CHUNK_SIZE;
    }

    let total_bytes = df.estimated_size().max(1);
    let bytes_per_row = (total_bytes as f64 / rows as f64).max(1.0);
    // Buffered per-row cost leaves headroom for the stage operation itself
    let buffered_bytes_per_row = bytes_per_row / SAFETY_BUFFER;
    let budget_bytes = (max_memory_mb as f64) * 1024.0 * 1024.0;

    let chunk_size = (budget_bytes / buffered_bytes_per_row) as usize;
    let clamped = chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);

    debug!(
        rows,
        total_bytes, chunk_size, clamped, "estimated chunk size from memory profile"
    );
    clamped
}

/// Rewrite column storage to shrink the table without changing values or order.
///
/// Integer columns are narrowed to the smallest width that holds the observed
/// min/max; text columns whose distinct-value ratio is below 0.5 are converted
/// to a categorical (interned) representation. Idempotent by construction:
/// already-narrow and already-categorical columns are left untouched.
pub fn optimize_storage(df: &DataFrame) -> Result<DataFrame> {
    let rows = df.height();
    let mut columns = Vec::with_capacity(df.width());

    for series in df.get_columns() {
        let optimized = match series.dtype() {
            DataType::Int64 | DataType::Int32 | DataType::Int16 => {
                narrow_signed(series)?
            }
            DataType::UInt64 | DataType::UInt32 | DataType::UInt16 => {
                narrow_unsigned(series)?
            }
            DataType::String => {
                if should_intern(series, rows)? {
                    series.cast(&DataType::Categorical(None, Default::default()))?
                } else {
                    series.clone()
                }
            }
            // Floats are never narrowed: f64 -> f32 loses precision
            _ => series.clone(),
        };
        columns.push(optimized);
    }

    Ok(DataFrame::new(columns)?)
}

fn narrow_signed(series: &Series) -> Result<Series> {
    let as_i64 = series.cast(&DataType::Int64)?;
    let ca = as_i64.i64()?;
    let (min, max) = match (ca.min(), ca.max()) {
        (Some(min), Some(max)) => (min, max),
        // All-null column: nothing to narrow
        _ => return Ok(series.clone()),
    };

    let target = if min >= i8::MIN as i64 && max <= i8::MAX as i64 {
        DataType::Int8
    } else if min >= i16::MIN as i64 && max <= i16::MAX as i64 {
        DataType::Int16
    } else if min >= i32::MIN as i64 && max <= i32::MAX as i64 {
        DataType::Int32
    } else {
        DataType::Int64
    };

    if &target == series.dtype() {
        Ok(series.clone())
    } else {
        Ok(series.cast(&target)?)
    }
}

fn narrow_unsigned(series: &Series) -> Result<Series> {
    let as_u64 = series.cast(&DataType::UInt64)?;
    let ca = as_u64.u64()?;
    let max = match ca.max() {
        Some(max) => max,
        None => return Ok(series.clone()),
    };

    let target = if max <= u8::MAX as u64 {
        DataType::UInt8
    } else if max <= u16::MAX as u64 {
        DataType::UInt16
    } else if max <= u32::MAX as u64 {
        DataType::UInt32
    } else {
        DataType::UInt64
    };

    if &target == series.dtype() {
        Ok(series.clone())
    } else {
        Ok(series.cast(&target)?)
    }
}

fn should_intern(series: &Series, rows: usize) -> Result<bool> {
    if rows == 0 {
        return Ok(false);
    }
    let distinct = series.n_unique()?;
    Ok((distinct as f64 / rows as f64) < INTERN_RATIO)
}
