//! Checkpoint Store
//!
//! Persists one durable parquet record per completed chunk so an interrupted
//! run can resume from the lowest unprocessed chunk. A manifest ties the
//! checkpoint directory to the dataset it was written for; a directory left
//! over from a different dataset is refused rather than silently resumed.

use crate::error::{EngineError, Result};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    run_id: String,
    dataset_fingerprint: String,
    created_at: String,
}

/// Schema + row-count digest used to guard resumption against a mismatched dataset
pub fn dataset_fingerprint(df: &DataFrame) -> String {
    let mut hasher = DefaultHasher::new();
    for field in df.schema().iter_fields() {
        field.name().as_str().hash(&mut hasher);
        format!("{:?}", field.data_type()).hash(&mut hasher);
    }
    df.height().hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[derive(Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Open (or initialize) a checkpoint directory for a dataset.
    ///
    /// An existing manifest with a different fingerprint is a configuration
    /// error: resuming against mismatched data would corrupt the output, so
    /// the caller must clear the directory explicitly.
    pub fn open(dir: &Path, fingerprint: &str) -> Result<Self> {
        fs::create_dir_all(dir)
            .map_err(|e| EngineError::CheckpointIo(format!("create {}: {}", dir.display(), e)))?;

        let manifest_path = dir.join(MANIFEST_FILE);
        if manifest_path.exists() {
            let raw = fs::read_to_string(&manifest_path)
                .map_err(|e| EngineError::CheckpointIo(format!("read manifest: {}", e)))?;
            let manifest: Manifest = serde_json::from_str(&raw)
                .map_err(|e| EngineError::CheckpointIo(format!("parse manifest: {}", e)))?;
            if manifest.dataset_fingerprint != fingerprint {
                return Err(EngineError::Configuration(format!(
                    "checkpoint directory {} belongs to a different dataset \
                     (found fingerprint {}, expected {}); clear it before reuse",
                    dir.display(),
                    manifest.dataset_fingerprint,
                    fingerprint
                )));
            }
            info!(run_id = %manifest.run_id, "resuming against existing checkpoint manifest");
        } else {
            let manifest = Manifest {
                run_id: uuid::Uuid::new_v4().to_string(),
                dataset_fingerprint: fingerprint.to_string(),
                created_at: chrono::Utc::now().to_rfc3339(),
            };
            let raw = serde_json::to_string_pretty(&manifest)
                .map_err(|e| EngineError::CheckpointIo(format!("encode manifest: {}", e)))?;
            fs::write(&manifest_path, raw)
                .map_err(|e| EngineError::CheckpointIo(format!("write manifest: {}", e)))?;
        }

        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn record_path(&self, chunk_index: usize) -> PathBuf {
        // zero-padded so a lexicographic sort of records is chunk order
        self.dir.join(format!("chunk_{:06}.parquet", chunk_index))
    }

    /// Persist one completed chunk's output table.
    ///
    /// Writes to a temp file and renames it into place: an interrupted or
    /// failed write must never leave a half-written record that a later
    /// resume would count as a completed chunk.
    pub fn save(&self, chunk_index: usize, df: &DataFrame) -> Result<()> {
        let path = self.record_path(chunk_index);
        let tmp = self.dir.join(format!("chunk_{:06}.parquet.tmp", chunk_index));
        let mut file = fs::File::create(&tmp)
            .map_err(|e| EngineError::CheckpointIo(format!("create {}: {}", tmp.display(), e)))?;
        let mut out = df.clone();
        if let Err(e) = ParquetWriter::new(&mut file).finish(&mut out) {
            let _ = fs::remove_file(&tmp);
            return Err(EngineError::CheckpointIo(format!(
                "write {}: {}",
                tmp.display(),
                e
            )));
        }
        fs::rename(&tmp, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            EngineError::CheckpointIo(format!("rename {}: {}", path.display(), e))
        })?;
        Ok(())
    }

    fn saved_indices(&self) -> Result<Vec<usize>> {
        let mut indices = Vec::new();
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| EngineError::CheckpointIo(format!("scan {}: {}", self.dir.display(), e)))?;
        for entry in entries {
            let entry =
                entry.map_err(|e| EngineError::CheckpointIo(format!("scan entry: {}", e)))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(index) = name
                .strip_prefix("chunk_")
                .and_then(|s| s.strip_suffix(".parquet"))
                .and_then(|s| s.parse::<usize>().ok())
            {
                indices.push(index);
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }

    /// Lowest unprocessed chunk index: `max(saved) + 1`, or 0 with no records
    pub fn resume_offset(&self) -> Result<usize> {
        Ok(self
            .saved_indices()?
            .last()
            .map(|last| last + 1)
            .unwrap_or(0))
    }

    /// Read back one saved chunk record
    pub fn load(&self, chunk_index: usize) -> Result<DataFrame> {
        let path = self.record_path(chunk_index);
        let file = fs::File::open(&path)
            .map_err(|e| EngineError::CheckpointIo(format!("open {}: {}", path.display(), e)))?;
        ParquetReader::new(file)
            .finish()
            .map_err(|e| EngineError::CheckpointIo(format!("read {}: {}", path.display(), e)))
    }

    /// Replay saved results for chunks below `limit`, in chunk order.
    /// A record that fails to read is logged and skipped rather than aborting.
    pub fn load_results(&self, limit: usize) -> Result<Vec<(usize, DataFrame)>> {
        let mut results = Vec::new();
        for index in self.saved_indices()? {
            if index >= limit {
                continue;
            }
            match self.load(index) {
                Ok(df) => results.push((index, df)),
                Err(e) => warn!("skipping unreadable checkpoint record: {}", e),
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> DataFrame {
        df! ["id" => [1i64, 2, 3], "name" => ["a", "b", "c"]].unwrap()
    }

    #[test]
    fn test_empty_directory_resumes_at_zero() {
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::open(tmp.path(), "fp").unwrap();
        assert_eq!(store.resume_offset().unwrap(), 0);
    }

    #[test]
    fn test_save_and_resume_offset() {
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::open(tmp.path(), "fp").unwrap();
        let df = sample();
        store.save(0, &df).unwrap();
        store.save(1, &df).unwrap();
        store.save(2, &df).unwrap();
        assert_eq!(store.resume_offset().unwrap(), 3);
    }

    #[test]
    fn test_load_results_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::open(tmp.path(), "fp").unwrap();
        let df = sample();
        store.save(0, &df).unwrap();
        store.save(1, &df).unwrap();

        let results = store.load_results(2).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, 0);
        assert!(results[0].1.equals(&df));
    }

    #[test]
    fn test_reopen_with_same_fingerprint_keeps_records() {
        let tmp = TempDir::new().unwrap();
        {
            let store = CheckpointStore::open(tmp.path(), "fp").unwrap();
            store.save(0, &sample()).unwrap();
        }
        let store = CheckpointStore::open(tmp.path(), "fp").unwrap();
        assert_eq!(store.resume_offset().unwrap(), 1);
    }

    #[test]
    fn test_temp_files_are_not_counted_as_records() {
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::open(tmp.path(), "fp").unwrap();
        store.save(0, &sample()).unwrap();
        // a leftover temp file from an interrupted write is not a record
        fs::write(tmp.path().join("chunk_000005.parquet.tmp"), b"partial").unwrap();

        assert_eq!(store.resume_offset().unwrap(), 1);
        assert_eq!(store.load_results(10).unwrap().len(), 1);
    }

    #[test]
    fn test_unreadable_record_skipped_on_replay() {
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::open(tmp.path(), "fp").unwrap();
        store.save(0, &sample()).unwrap();
        store.save(2, &sample()).unwrap();
        fs::write(tmp.path().join("chunk_000001.parquet"), b"not parquet").unwrap();

        let indices: Vec<usize> = store
            .load_results(3)
            .unwrap()
            .into_iter()
            .map(|(i, _)| i)
            .collect();
        assert_eq!(indices, vec![0, 2]);
    }

    #[test]
    fn test_save_overwrites_existing_record() {
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::open(tmp.path(), "fp").unwrap();
        fs::write(tmp.path().join("chunk_000000.parquet"), b"not parquet").unwrap();
        store.save(0, &sample()).unwrap();

        assert!(store.load(0).unwrap().equals(&sample()));
    }

    #[test]
    fn test_mismatched_fingerprint_refused() {
        let tmp = TempDir::new().unwrap();
        CheckpointStore::open(tmp.path(), "fp-one").unwrap();
        let err = CheckpointStore::open(tmp.path(), "fp-two").unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[test]
    fn test_fingerprint_sensitive_to_schema_and_rows() {
        let a = sample();
        let b = df! ["id" => [1i64, 2, 3]].unwrap();
        let c = df! ["id" => [1i64, 2, 3, 4], "name" => ["a", "b", "c", "d"]].unwrap();
        assert_ne!(dataset_fingerprint(&a), dataset_fingerprint(&b));
        assert_ne!(dataset_fingerprint(&a), dataset_fingerprint(&c));
        assert_eq!(dataset_fingerprint(&a), dataset_fingerprint(&sample()));
    }
}
