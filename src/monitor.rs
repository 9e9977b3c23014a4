//! Progress & Resource Monitor
//!
//! Tracks wall-clock time, sampled resident memory, and per-chunk statistics
//! across a run. Rendering is purely observational: the progress bar never
//! influences scheduling or results. Counters sit behind a mutex because
//! parallel workers commit chunks concurrently.

use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use sysinfo::{Pid, System};
use tracing::debug;

/// Detail captured for one committed chunk attempt
#[derive(Debug, Clone, Serialize)]
pub struct ChunkStatistics {
    pub chunk_index: usize,
    pub rows: usize,
    pub elapsed_seconds: f64,
    pub memory_mb: f64,
    pub attempts: u32,
    pub failed: bool,
    pub error: Option<String>,
    /// Replayed from a checkpoint rather than processed this run
    pub replayed: bool,
}

/// Run-level aggregate handed back to the caller
#[derive(Debug, Clone, Serialize)]
pub struct MonitorSummary {
    pub total_chunks: usize,
    pub chunks_failed: usize,
    pub total_rows: usize,
    pub peak_memory_mb: f64,
    pub average_chunk_time: f64,
    pub throughput_chunks_per_sec: f64,
    pub elapsed_seconds: f64,
    pub per_chunk: Vec<ChunkStatistics>,
    pub failed_chunk_indices: Vec<usize>,
}

struct MonitorState {
    chunks: Vec<ChunkStatistics>,
    peak_memory_mb: f64,
    sys: System,
}

pub struct ProgressMonitor {
    started: Instant,
    state: Mutex<MonitorState>,
    pid: Option<Pid>,
    bar: Option<ProgressBar>,
}

impl ProgressMonitor {
    pub fn new(total_chunks: usize, show_progress: bool) -> Self {
        let bar = if show_progress {
            let pb = ProgressBar::new(total_chunks as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template(
                        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} chunks ({eta}) {msg}",
                    )
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );
            Some(pb)
        } else {
            None
        };

        Self {
            started: Instant::now(),
            state: Mutex::new(MonitorState {
                chunks: Vec::new(),
                peak_memory_mb: 0.0,
                sys: System::new(),
            }),
            pid: sysinfo::get_current_pid().ok(),
            bar,
        }
    }

    /// Sample current resident memory in MB and fold it into the running peak
    fn sample_memory_mb(&self, state: &mut MonitorState) -> f64 {
        let sampled = match self.pid {
            Some(pid) => {
                state.sys.refresh_process(pid);
                state
                    .sys
                    .process(pid)
                    .map(|p| p.memory() as f64 / (1024.0 * 1024.0))
                    .unwrap_or(0.0)
            }
            None => 0.0,
        };
        if sampled > state.peak_memory_mb {
            state.peak_memory_mb = sampled;
        }
        sampled
    }

    pub fn record_success(&self, chunk_index: usize, rows: usize, elapsed: Duration, attempts: u32) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let memory_mb = self.sample_memory_mb(&mut state);
        state.chunks.push(ChunkStatistics {
            chunk_index,
            rows,
            elapsed_seconds: elapsed.as_secs_f64(),
            memory_mb,
            attempts,
            failed: false,
            error: None,
            replayed: false,
        });
        drop(state);
        debug!(chunk_index, rows, "chunk committed");
        if let Some(bar) = &self.bar {
            bar.inc(1);
        }
    }

    pub fn record_failure(
        &self,
        chunk_index: usize,
        rows: usize,
        elapsed: Duration,
        attempts: u32,
        error: &str,
    ) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let memory_mb = self.sample_memory_mb(&mut state);
        state.chunks.push(ChunkStatistics {
            chunk_index,
            rows,
            elapsed_seconds: elapsed.as_secs_f64(),
            memory_mb,
            attempts,
            failed: true,
            error: Some(error.to_string()),
            replayed: false,
        });
        drop(state);
        if let Some(bar) = &self.bar {
            bar.inc(1);
            bar.set_message(format!("chunk {} failed", chunk_index));
        }
    }

    /// Account for a chunk restored from a checkpoint instead of processed
    pub fn record_replayed(&self, chunk_index: usize, rows: usize) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.chunks.push(ChunkStatistics {
            chunk_index,
            rows,
            elapsed_seconds: 0.0,
            memory_mb: 0.0,
            attempts: 0,
            failed: false,
            error: None,
            replayed: true,
        });
        drop(state);
        if let Some(bar) = &self.bar {
            bar.inc(1);
        }
    }

    /// Close the progress indicator normally
    pub fn finish(&self) {
        if let Some(bar) = &self.bar {
            bar.finish_with_message("done");
        }
    }

    /// Close the progress indicator on abort, before the error propagates
    pub fn abort(&self) {
        if let Some(bar) = &self.bar {
            bar.abandon_with_message("aborted");
        }
    }

    pub fn summary(&self) -> MonitorSummary {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let elapsed_seconds = self.started.elapsed().as_secs_f64();

        let total_chunks = state.chunks.len();
        let chunks_failed = state.chunks.iter().filter(|c| c.failed).count();
        let total_rows: usize = state
            .chunks
            .iter()
            .filter(|c| !c.failed)
            .map(|c| c.rows)
            .sum();

        let processed: Vec<&ChunkStatistics> =
            state.chunks.iter().filter(|c| !c.replayed).collect();
        let average_chunk_time = if processed.is_empty() {
            0.0
        } else {
            processed.iter().map(|c| c.elapsed_seconds).sum::<f64>() / processed.len() as f64
        };
        let throughput = if elapsed_seconds > 0.0 {
            total_chunks as f64 / elapsed_seconds
        } else {
            0.0
        };

        let mut failed_chunk_indices: Vec<usize> = state
            .chunks
            .iter()
            .filter(|c| c.failed)
            .map(|c| c.chunk_index)
            .collect();
        failed_chunk_indices.sort_unstable();

        MonitorSummary {
            total_chunks,
            chunks_failed,
            total_rows,
            peak_memory_mb: state.peak_memory_mb,
            average_chunk_time,
            throughput_chunks_per_sec: throughput,
            elapsed_seconds,
            per_chunk: state.chunks.clone(),
            failed_chunk_indices,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_counts_successes_and_failures() {
        let monitor = ProgressMonitor::new(3, false);
        monitor.record_success(0, 100, Duration::from_millis(10), 1);
        monitor.record_failure(1, 100, Duration::from_millis(5), 2, "boom");
        monitor.record_success(2, 100, Duration::from_millis(10), 1);

        let summary = monitor.summary();
        assert_eq!(summary.total_chunks, 3);
        assert_eq!(summary.chunks_failed, 1);
        assert_eq!(summary.total_rows, 200);
        assert_eq!(summary.failed_chunk_indices, vec![1]);
    }

    #[test]
    fn test_replayed_chunks_count_rows_but_not_timing() {
        let monitor = ProgressMonitor::new(2, false);
        monitor.record_replayed(0, 500);
        monitor.record_success(1, 500, Duration::from_millis(20), 1);

        let summary = monitor.summary();
        assert_eq!(summary.total_rows, 1000);
        assert_eq!(summary.total_chunks, 2);
        // replayed chunks must not drag the average to zero
        assert!(summary.average_chunk_time > 0.0);
    }

    #[test]
    fn test_peak_memory_is_running_maximum() {
        let monitor = ProgressMonitor::new(2, false);
        monitor.record_success(0, 10, Duration::from_millis(1), 1);
        let first_peak = monitor.summary().peak_memory_mb;
        monitor.record_success(1, 10, Duration::from_millis(1), 1);
        assert!(monitor.summary().peak_memory_mb >= first_peak);
    }
}
