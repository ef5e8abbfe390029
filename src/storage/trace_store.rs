//! Batched trace persistence.

use super::format::{artifact_path, list_artifacts, write_capture_artifact};
use super::RawTrace;
use crate::config::StorageConfig;
use crate::error::{DaqError, DaqResult};
use std::path::PathBuf;

/// Accumulates captured traces into size-capped batches and flushes each batch
/// as one numbered artifact.
///
/// A flush is all-or-nothing: on failure the batch stays in memory and no
/// artifact appears on disk. The artifact counter resumes after the highest
/// artifact already present, so a rerun into the same directory never
/// overwrites earlier captures.
#[derive(Debug)]
pub struct TraceStore {
    dir: PathBuf,
    prefix: String,
    capacity: usize,
    batch: Vec<RawTrace>,
    sample_len: Option<usize>,
    next_index: usize,
    written: Vec<PathBuf>,
}

impl TraceStore {
    /// Open (creating if needed) the output directory.
    pub fn new(cfg: &StorageConfig) -> DaqResult<Self> {
        if cfg.traces_per_file == 0 {
            return Err(DaqError::Configuration(
                "traces_per_file must be at least 1".into(),
            ));
        }
        std::fs::create_dir_all(&cfg.output_dir)?;
        let next_index = list_artifacts(&cfg.output_dir, &cfg.file_prefix)?
            .last()
            .map_or(0, |(index, _)| index + 1);
        if next_index > 0 {
            tracing::info!(
                dir = %cfg.output_dir.display(),
                next_index,
                "Resuming artifact numbering after existing captures"
            );
        }

        Ok(Self {
            dir: cfg.output_dir.clone(),
            prefix: cfg.file_prefix.clone(),
            capacity: cfg.traces_per_file,
            batch: Vec::with_capacity(cfg.traces_per_file.min(4096)),
            sample_len: None,
            next_index,
            written: Vec::new(),
        })
    }

    /// Add a trace to the current batch.
    ///
    /// Every trace of a store must have the same sample length.
    pub fn append(&mut self, trace: RawTrace) -> DaqResult<()> {
        match self.sample_len {
            Some(expected) if trace.wave.len() != expected => {
                return Err(DaqError::LengthMismatch {
                    expected,
                    actual: trace.wave.len(),
                })
            }
            Some(_) => {}
            None => self.sample_len = Some(trace.wave.len()),
        }
        self.batch.push(trace);
        Ok(())
    }

    /// Flush the batch when it is full, or whenever `force` is set.
    ///
    /// Returns the path of the artifact written, if any. An empty batch is never
    /// written.
    pub fn flush(&mut self, force: bool) -> DaqResult<Option<PathBuf>> {
        if self.batch.is_empty() || (!force && self.batch.len() < self.capacity) {
            return Ok(None);
        }

        let path = artifact_path(&self.dir, &self.prefix, self.next_index);
        write_capture_artifact(&path, &self.batch)?;

        tracing::info!(
            path = %path.display(),
            traces = self.batch.len(),
            "Batch flushed"
        );
        self.batch.clear();
        self.next_index += 1;
        self.written.push(path.clone());
        Ok(Some(path))
    }

    /// Traces waiting in the current batch.
    pub fn pending(&self) -> usize {
        self.batch.len()
    }

    /// Common sample length, once the first trace has been appended.
    pub fn sample_len(&self) -> Option<usize> {
        self.sample_len
    }

    /// Artifacts written by this store, in order.
    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::read_capture_artifact;

    fn cfg(dir: &std::path::Path, capacity: usize) -> StorageConfig {
        StorageConfig {
            output_dir: dir.to_path_buf(),
            traces_per_file: capacity,
            file_prefix: "traces".into(),
        }
    }

    fn trace(tag: u8) -> RawTrace {
        RawTrace {
            wave: vec![f32::from(tag); 6],
            input: vec![tag; 16],
            key: vec![0; 16],
            output: vec![tag; 16],
            activity_count: Some(u64::from(tag)),
        }
    }

    #[test]
    fn flushes_at_capacity_and_on_force() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = TraceStore::new(&cfg(dir.path(), 2)).unwrap();

        store.append(trace(0)).unwrap();
        assert_eq!(store.flush(false).unwrap(), None);
        store.append(trace(1)).unwrap();
        let first = store.flush(false).unwrap().unwrap();
        assert_eq!(store.pending(), 0);

        store.append(trace(2)).unwrap();
        let second = store.flush(true).unwrap().unwrap();
        assert_eq!(store.flush(true).unwrap(), None);

        assert!(first.ends_with("traces_0.arrow"));
        assert!(second.ends_with("traces_1.arrow"));
        assert_eq!(read_capture_artifact(&first).unwrap().len(), 2);
        assert_eq!(read_capture_artifact(&second).unwrap().len(), 1);
    }

    #[test]
    fn numbering_resumes_after_existing_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = TraceStore::new(&cfg(dir.path(), 10)).unwrap();
            store.append(trace(0)).unwrap();
            store.flush(true).unwrap();
        }
        let mut store = TraceStore::new(&cfg(dir.path(), 10)).unwrap();
        store.append(trace(1)).unwrap();
        let path = store.flush(true).unwrap().unwrap();
        assert!(path.ends_with("traces_1.arrow"));
    }

    #[test]
    fn length_mismatch_is_rejected_before_batching() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = TraceStore::new(&cfg(dir.path(), 10)).unwrap();
        store.append(trace(0)).unwrap();

        let mut short = trace(1);
        short.wave.truncate(3);
        assert!(store.append(short).is_err());
        assert_eq!(store.pending(), 1);
    }

    #[test]
    fn failed_flush_keeps_batch() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = TraceStore::new(&cfg(dir.path(), 10)).unwrap();
        store.append(trace(0)).unwrap();

        // occupy the next artifact name so persisting fails
        std::fs::create_dir(dir.path().join("traces_0.arrow")).unwrap();

        assert!(store.flush(true).is_err());
        assert_eq!(store.pending(), 1);
        assert!(store.written().is_empty());
    }
}
