//! Arrow IPC artifact format.
//!
//! | Column           | Type                          | Nullable |
//! |------------------|-------------------------------|----------|
//! | `wave`           | FixedSizeList<Float32>(L)     | no       |
//! | `input`          | Binary                        | no       |
//! | `key`            | Binary                        | no       |
//! | `output`         | Binary                        | no       |
//! | `activity_count` | UInt64                        | yes      |
//!
//! Schema metadata: `stage` (`capture` or `aligned`), `format_version`,
//! `created_at` (RFC 3339), and for aligned artifacts `window_start`,
//! `window_end`, `reference` and `dropped`.
//!
//! Writes go to a temporary file in the destination directory which is synced
//! and then renamed into place, so a failed write never leaves a partial artifact.

use super::{RawTrace, TraceSet};
use crate::alignment::{AlignedDataset, AlignmentWindow};
use crate::error::{DaqError, DaqResult};
use arrow::array::{
    Array, ArrayRef, BinaryArray, FixedSizeListArray, Float32Array, UInt64Array,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::ipc::reader::FileReader;
use arrow::ipc::writer::{FileWriter, IpcWriteOptions};
use arrow::ipc::CompressionType;
use arrow::record_batch::RecordBatch;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;

/// Version written to the `format_version` schema metadata key.
pub const FORMAT_VERSION: &str = "1";
/// Stage tag of raw capture artifacts.
pub const STAGE_CAPTURE: &str = "capture";
/// Stage tag of aligned artifacts.
pub const STAGE_ALIGNED: &str = "aligned";

const ARTIFACT_EXTENSION: &str = "arrow";

/// Path of artifact number `index` for `prefix` in `dir`.
pub fn artifact_path(dir: &Path, prefix: &str, index: usize) -> PathBuf {
    dir.join(format!("{prefix}_{index}.{ARTIFACT_EXTENSION}"))
}

/// Artifact number encoded in `path`, if it belongs to `prefix`.
fn artifact_index(path: &Path, prefix: &str) -> Option<usize> {
    if path.extension()? != ARTIFACT_EXTENSION {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .strip_prefix(prefix)?
        .strip_prefix('_')?
        .parse()
        .ok()
}

/// Artifacts of `prefix` in `dir`, sorted by artifact number.
pub fn list_artifacts(dir: &Path, prefix: &str) -> DaqResult<Vec<(usize, PathBuf)>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(index) = artifact_index(&path, prefix) {
            found.push((index, path));
        }
    }
    found.sort_by_key(|(index, _)| *index);
    Ok(found)
}

fn wave_item_field() -> Arc<Field> {
    Arc::new(Field::new("item", DataType::Float32, false))
}

fn schema(sample_len: usize, metadata: HashMap<String, String>) -> DaqResult<SchemaRef> {
    let width = i32::try_from(sample_len)
        .map_err(|_| DaqError::Storage(format!("waveform length {sample_len} too large")))?;
    let fields = vec![
        Field::new("wave", DataType::FixedSizeList(wave_item_field(), width), false),
        Field::new("input", DataType::Binary, false),
        Field::new("key", DataType::Binary, false),
        Field::new("output", DataType::Binary, false),
        Field::new("activity_count", DataType::UInt64, true),
    ];
    Ok(Arc::new(Schema::new_with_metadata(fields, metadata)))
}

fn base_metadata(stage: &str) -> HashMap<String, String> {
    HashMap::from([
        ("stage".to_string(), stage.to_string()),
        ("format_version".to_string(), FORMAT_VERSION.to_string()),
        ("created_at".to_string(), chrono::Utc::now().to_rfc3339()),
    ])
}

fn to_record_batch(
    waves: &[Vec<f32>],
    inputs: &[Vec<u8>],
    keys: &[Vec<u8>],
    outputs: &[Vec<u8>],
    activity_counts: &[Option<u64>],
    sample_len: usize,
    metadata: HashMap<String, String>,
) -> DaqResult<RecordBatch> {
    let schema = schema(sample_len, metadata)?;

    let mut flat = Vec::with_capacity(waves.len() * sample_len);
    for wave in waves {
        if wave.len() != sample_len {
            return Err(DaqError::LengthMismatch {
                expected: sample_len,
                actual: wave.len(),
            });
        }
        flat.extend_from_slice(wave);
    }
    let wave = FixedSizeListArray::try_new(
        wave_item_field(),
        sample_len as i32,
        Arc::new(Float32Array::from(flat)),
        None,
    )?;

    let columns: Vec<ArrayRef> = vec![
        Arc::new(wave),
        Arc::new(BinaryArray::from_iter_values(inputs.iter())),
        Arc::new(BinaryArray::from_iter_values(keys.iter())),
        Arc::new(BinaryArray::from_iter_values(outputs.iter())),
        Arc::new(UInt64Array::from(activity_counts.to_vec())),
    ];
    Ok(RecordBatch::try_new(schema, columns)?)
}

/// Write `batch` to `path` through a synced temporary file.
///
/// With `overwrite` unset an existing file at `path` is an error.
fn write_atomic(path: &Path, batch: &RecordBatch, overwrite: bool) -> DaqResult<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    {
        let options =
            IpcWriteOptions::default().try_with_compression(Some(CompressionType::ZSTD))?;
        let mut writer =
            FileWriter::try_new_with_options(tmp.as_file_mut(), &batch.schema(), options)?;
        writer.write(batch)?;
        writer.finish()?;
    }
    tmp.as_file().sync_all()?;

    let persisted = if overwrite {
        tmp.persist(path)
    } else {
        tmp.persist_noclobber(path)
    };
    persisted.map_err(|e| {
        DaqError::Storage(format!("failed to persist {}: {}", path.display(), e.error))
    })?;
    Ok(())
}

/// Serialize captured traces into artifact `path`.
pub(crate) fn write_capture_artifact(path: &Path, traces: &[RawTrace]) -> DaqResult<()> {
    let sample_len = traces.first().map_or(0, |t| t.wave.len());
    let waves: Vec<Vec<f32>> = traces.iter().map(|t| t.wave.clone()).collect();
    let inputs: Vec<Vec<u8>> = traces.iter().map(|t| t.input.clone()).collect();
    let keys: Vec<Vec<u8>> = traces.iter().map(|t| t.key.clone()).collect();
    let outputs: Vec<Vec<u8>> = traces.iter().map(|t| t.output.clone()).collect();
    let counts: Vec<Option<u64>> = traces.iter().map(|t| t.activity_count).collect();

    let batch = to_record_batch(
        &waves,
        &inputs,
        &keys,
        &outputs,
        &counts,
        sample_len,
        base_metadata(STAGE_CAPTURE),
    )?;
    write_atomic(path, &batch, false)
}

/// Write an aligned dataset, replacing any existing file at `path`.
pub fn write_aligned_artifact(path: &Path, dataset: &AlignedDataset) -> DaqResult<()> {
    let set = &dataset.traces;
    let sample_len = set.sample_len().unwrap_or(dataset.window.width());

    let mut metadata = base_metadata(STAGE_ALIGNED);
    metadata.insert("window_start".into(), dataset.window.start.to_string());
    metadata.insert("window_end".into(), dataset.window.end.to_string());
    metadata.insert("dropped".into(), dataset.dropped.to_string());
    if let Some(reference) = dataset.reference {
        metadata.insert("reference".into(), reference.to_string());
    }

    let batch = to_record_batch(
        &set.waves,
        &set.inputs,
        &set.keys,
        &set.outputs,
        &set.activity_counts,
        sample_len,
        metadata,
    )?;
    write_atomic(path, &batch, true)?;
    tracing::info!(path = %path.display(), traces = set.len(), "Aligned artifact written");
    Ok(())
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> DaqResult<&'a T> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .ok_or_else(|| DaqError::Storage(format!("missing or mistyped column '{name}'")))
}

fn read_file(path: &Path) -> DaqResult<(SchemaRef, TraceSet)> {
    let reader = FileReader::try_new(BufReader::new(File::open(path)?), None)?;
    let schema = reader.schema();
    let mut set = TraceSet::default();

    for batch in reader {
        let batch = batch?;
        let waves = column::<FixedSizeListArray>(&batch, "wave")?;
        let inputs = column::<BinaryArray>(&batch, "input")?;
        let keys = column::<BinaryArray>(&batch, "key")?;
        let outputs = column::<BinaryArray>(&batch, "output")?;
        let counts = column::<UInt64Array>(&batch, "activity_count")?;

        for row in 0..batch.num_rows() {
            let values = waves.value(row);
            let wave = values
                .as_any()
                .downcast_ref::<Float32Array>()
                .ok_or_else(|| DaqError::Storage("wave items are not Float32".into()))?
                .values()
                .to_vec();
            set.push(RawTrace {
                wave,
                input: inputs.value(row).to_vec(),
                key: keys.value(row).to_vec(),
                output: outputs.value(row).to_vec(),
                activity_count: (!counts.is_null(row)).then(|| counts.value(row)),
            })?;
        }
    }
    Ok((schema, set))
}

fn expect_stage(schema: &Schema, path: &Path, stage: &str) -> DaqResult<()> {
    match schema.metadata().get("stage").map(String::as_str) {
        Some(found) if found == stage => Ok(()),
        found => Err(DaqError::Storage(format!(
            "{} is not a {stage} artifact (stage: {})",
            path.display(),
            found.unwrap_or("missing")
        ))),
    }
}

fn metadata_usize(schema: &Schema, key: &str) -> DaqResult<usize> {
    schema
        .metadata()
        .get(key)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| DaqError::Storage(format!("missing or invalid schema metadata '{key}'")))
}

/// Read one capture artifact.
pub fn read_capture_artifact(path: &Path) -> DaqResult<TraceSet> {
    let (schema, set) = read_file(path)?;
    expect_stage(&schema, path, STAGE_CAPTURE)?;
    Ok(set)
}

/// Read every capture artifact of `prefix` in `dir`, concatenated in artifact order.
pub fn read_capture_run(dir: &Path, prefix: &str) -> DaqResult<TraceSet> {
    let artifacts = list_artifacts(dir, prefix)?;
    if artifacts.is_empty() {
        return Err(DaqError::Storage(format!(
            "no '{prefix}' artifacts in {}",
            dir.display()
        )));
    }
    let mut run = TraceSet::default();
    for (_, path) in &artifacts {
        run.extend(read_capture_artifact(path)?)?;
    }
    tracing::info!(
        artifacts = artifacts.len(),
        traces = run.len(),
        "Capture run loaded"
    );
    Ok(run)
}

/// Read an aligned artifact.
pub fn read_aligned_artifact(path: &Path) -> DaqResult<AlignedDataset> {
    let (schema, traces) = read_file(path)?;
    expect_stage(&schema, path, STAGE_ALIGNED)?;
    let reference = match schema.metadata().get("reference") {
        Some(_) => Some(metadata_usize(&schema, "reference")?),
        None => None,
    };
    Ok(AlignedDataset {
        traces,
        window: AlignmentWindow {
            start: metadata_usize(&schema, "window_start")?,
            end: metadata_usize(&schema, "window_end")?,
        },
        reference,
        dropped: metadata_usize(&schema, "dropped")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn traces(n: usize, len: usize) -> Vec<RawTrace> {
        (0..n)
            .map(|i| RawTrace {
                wave: (0..len).map(|j| (i * len + j) as f32).collect(),
                input: vec![i as u8; 4],
                key: Vec::new(),
                output: vec![!(i as u8); 4],
                activity_count: if i % 2 == 0 { Some(i as u64) } else { None },
            })
            .collect()
    }

    #[test]
    fn artifact_names_parse_back() {
        let dir = Path::new("/tmp/run");
        let path = artifact_path(dir, "traces", 12);
        assert_eq!(path, PathBuf::from("/tmp/run/traces_12.arrow"));
        assert_eq!(artifact_index(&path, "traces"), Some(12));
        assert_eq!(artifact_index(&path, "other"), None);
        assert_eq!(artifact_index(Path::new("traces_1.tmp"), "traces"), None);
    }

    #[test]
    fn capture_artifact_preserves_columns_and_nulls() {
        let dir = tempfile::tempdir().unwrap();
        let path = artifact_path(dir.path(), "traces", 0);
        let written = traces(3, 5);
        write_capture_artifact(&path, &written).unwrap();

        let set = read_capture_artifact(&path).unwrap();
        assert_eq!(set.len(), 3);
        assert!(set.is_consistent());
        assert_eq!(set.waves[2], written[2].wave);
        assert_eq!(set.outputs[1], written[1].output);
        assert_eq!(set.activity_counts, vec![Some(0), None, Some(2)]);
    }

    #[test]
    fn existing_artifacts_are_never_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = artifact_path(dir.path(), "traces", 0);
        write_capture_artifact(&path, &traces(2, 4)).unwrap();

        assert!(write_capture_artifact(&path, &traces(1, 4)).is_err());
        assert_eq!(read_capture_artifact(&path).unwrap().len(), 2);
        // no temporary files left behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn ragged_waveforms_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = artifact_path(dir.path(), "traces", 0);
        let mut ragged = traces(2, 4);
        ragged[1].wave.pop();

        assert!(matches!(
            write_capture_artifact(&path, &ragged),
            Err(DaqError::LengthMismatch { .. })
        ));
        assert!(!path.exists());
    }

    #[test]
    fn capture_run_concatenates_in_numeric_order() {
        let dir = tempfile::tempdir().unwrap();
        let all = traces(5, 3);
        write_capture_artifact(&artifact_path(dir.path(), "run", 10), &all[3..]).unwrap();
        write_capture_artifact(&artifact_path(dir.path(), "run", 2), &all[..3]).unwrap();

        let set = read_capture_run(dir.path(), "run").unwrap();
        assert_eq!(set.len(), 5);
        assert_eq!(set.inputs[4], vec![4; 4]);
        assert!(read_capture_run(dir.path(), "missing").is_err());
    }

    #[test]
    fn aligned_artifact_round_trips_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aligned.arrow");
        let mut set = TraceSet::default();
        for t in traces(2, 6) {
            set.push(t).unwrap();
        }
        let dataset = AlignedDataset {
            traces: set,
            window: AlignmentWindow { start: 10, end: 16 },
            reference: Some(12),
            dropped: 1,
        };
        write_aligned_artifact(&path, &dataset).unwrap();

        let back = read_aligned_artifact(&path).unwrap();
        assert_eq!(back, dataset);
        assert!(read_capture_artifact(&path).is_err());
    }
}
