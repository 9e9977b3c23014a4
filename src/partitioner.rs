//! Chunk Partitioner
//!
//! Splits a table's row range into an ordered sequence of chunk specs and
//! materializes chunk tables lazily, one slice at a time. Slices are zero-copy
//! views over the source table's column buffers, so memory stays bounded by
//! the chunks actually in flight.

use crate::error::{EngineError, Result};
use polars::prelude::*;

/// One contiguous (optionally overlapping) row range of the source table.
/// Immutable once produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpec {
    pub index: usize,
    pub start_offset: usize,
    pub row_count: usize,
}

pub struct ChunkPartitioner {
    chunk_size: usize,
    overlap_rows: usize,
}

impl ChunkPartitioner {
    /// Fails fast when `chunk_size` is zero or `overlap_rows >= chunk_size`
    /// (a non-positive stride would never terminate).
    pub fn new(chunk_size: usize, overlap_rows: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(EngineError::Configuration(
                "chunk_size must be positive".to_string(),
            ));
        }
        if overlap_rows >= chunk_size {
            return Err(EngineError::Configuration(format!(
                "overlap_rows ({}) must be strictly less than chunk_size ({})",
                overlap_rows, chunk_size
            )));
        }
        Ok(Self {
            chunk_size,
            overlap_rows,
        })
    }

    /// Index-ordered chunk specs covering `[0, total_rows)`.
    ///
    /// With overlap, each chunk after the first starts `overlap_rows` before
    /// the previous chunk's end (stride `chunk_size - overlap_rows`);
    /// generation stops once a chunk's end reaches `total_rows`.
    /// Zero rows yields zero chunks, not one empty chunk.
    pub fn specs(&self, total_rows: usize) -> Vec<ChunkSpec> {
        let mut specs = Vec::new();
        if total_rows == 0 {
            return specs;
        }

        let stride = self.chunk_size - self.overlap_rows;
        let mut index = 0;
        let mut start = 0;
        loop {
            let end = (start + self.chunk_size).min(total_rows);
            specs.push(ChunkSpec {
                index,
                start_offset: start,
                row_count: end - start,
            });
            if end == total_rows {
                break;
            }
            index += 1;
            start += stride;
        }
        specs
    }

    /// Lazy sequence of `(start_offset, chunk_table)` pairs.
    /// Chunk tables are materialized on demand, never all at once.
    pub fn iter<'a>(
        &self,
        df: &'a DataFrame,
    ) -> impl Iterator<Item = (usize, DataFrame)> + 'a {
        self.specs(df.height())
            .into_iter()
            .map(move |spec| (spec.start_offset, slice_chunk(df, &spec)))
    }
}

/// Materialize one chunk as a zero-copy slice of the source table
pub fn slice_chunk(df: &DataFrame, spec: &ChunkSpec) -> DataFrame {
    df.slice(spec.start_offset as i64, spec.row_count)
}
