//! Parquet dataset store.
//!
//! Layout: `{root}/{symbol}_{data_type}_{timeframe}.parquet`, one file per
//! dataset, zstd-compressed.
//!
//! Writes are staged: the new file is written to `{file}.tmp` next to the
//! target and renamed over it on publish. A crash or an early return between
//! the two steps leaves the previous file untouched.

use polars::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::schema::{dataframe_to_records, records_to_dataframe};
use crate::domain::{DatasetKey, RecordSet, TimePoint};
use crate::sync::coverage::normalize_time_value;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parquet I/O error: {0}")]
    Parquet(String),

    #[error("column '{column}' has conflicting value types: {detail}")]
    ColumnTypeConflict { column: String, detail: String },

    #[error("dataset {path} has rows but no '{column}' column")]
    MissingTimeColumn { path: PathBuf, column: String },

    #[error("cannot interpret '{value}' in column '{column}' as a time point")]
    UnparseableTime { column: String, value: String },
}

fn io_err(path: &Path) -> impl Fn(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Read a dataset file into a frame. `None` when the file does not exist.
pub fn read_frame(path: &Path) -> Result<Option<DataFrame>, StoreError> {
    let file = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(path)(e)),
    };
    let df = ParquetReader::new(file)
        .finish()
        .map_err(|e| StoreError::Parquet(format!("read {}: {e}", path.display())))?;
    Ok(Some(df))
}

/// Read a dataset file into records. `None` when the file does not exist.
pub fn read_dataset(path: &Path) -> Result<Option<RecordSet>, StoreError> {
    read_frame(path)?
        .map(|df| dataframe_to_records(&df))
        .transpose()
}

fn write_parquet(df: &mut DataFrame, path: &Path) -> Result<(), StoreError> {
    let file = fs::File::create(path).map_err(io_err(path))?;
    let level =
        ZstdLevel::try_new(3).map_err(|e| StoreError::Parquet(format!("zstd level: {e}")))?;
    ParquetWriter::new(file)
        .with_compression(ParquetCompression::Zstd(Some(level)))
        .finish(df)
        .map_err(|e| StoreError::Parquet(format!("write {}: {e}", path.display())))?;
    Ok(())
}

/// A fully written temporary file waiting to replace its target.
///
/// Dropping without [`publish`](Self::publish) removes the temporary file.
#[derive(Debug)]
pub struct StagedWrite {
    tmp_path: PathBuf,
    target: PathBuf,
    published: bool,
}

impl StagedWrite {
    /// Write `records` to the temporary sibling of `target`.
    pub fn stage(target: &Path, records: &RecordSet) -> Result<Self, StoreError> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        let mut tmp_name = target.as_os_str().to_os_string();
        tmp_name.push(".tmp");
        let staged = Self {
            tmp_path: PathBuf::from(tmp_name),
            target: target.to_path_buf(),
            published: false,
        };

        let mut df = records_to_dataframe(records)?;
        write_parquet(&mut df, &staged.tmp_path)?;
        Ok(staged)
    }

    pub fn tmp_path(&self) -> &Path {
        &self.tmp_path
    }

    /// Atomically replace the target with the staged file.
    pub fn publish(mut self) -> Result<(), StoreError> {
        fs::rename(&self.tmp_path, &self.target).map_err(io_err(&self.target))?;
        self.published = true;
        Ok(())
    }
}

impl Drop for StagedWrite {
    fn drop(&mut self) {
        if !self.published {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

/// Summary of one dataset file on disk.
#[derive(Debug, Clone)]
pub struct DatasetInfo {
    pub key: DatasetKey,
    pub path: PathBuf,
    pub rows: usize,
    pub first: Option<TimePoint>,
    pub last: Option<TimePoint>,
    pub size_bytes: u64,
    /// BLAKE3 of the file bytes.
    pub content_hash: String,
}

/// Directory of dataset files.
#[derive(Debug, Clone)]
pub struct DatasetStore {
    root: PathBuf,
}

impl DatasetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dataset_path(&self, key: &DatasetKey) -> PathBuf {
        self.root.join(key.file_name())
    }

    /// Describe every dataset file under the root, sorted by key.
    ///
    /// Files whose names do not follow the dataset naming scheme (including
    /// leftover `.tmp` files) are ignored.
    pub fn list(&self) -> Result<Vec<DatasetInfo>, StoreError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut infos = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(io_err(&self.root))? {
            let entry = entry.map_err(io_err(&self.root))?;
            let path = entry.path();
            let Some(key) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(DatasetKey::parse_file_name)
            else {
                continue;
            };
            infos.push(self.describe(key, path)?);
        }

        infos.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(infos)
    }

    fn describe(&self, key: DatasetKey, path: PathBuf) -> Result<DatasetInfo, StoreError> {
        let bytes = fs::read(&path).map_err(io_err(&path))?;
        let content_hash = blake3::hash(&bytes).to_hex().to_string();

        let records = read_dataset(&path)?.unwrap_or_default();
        let column = key.timeframe.time_column();
        let mut points = Vec::with_capacity(records.len());
        for row in records.rows() {
            if let Some(p) = normalize_time_value(column, row.get(column), key.timeframe)? {
                points.push(p);
            }
        }

        Ok(DatasetInfo {
            rows: records.len(),
            first: points.iter().min().copied(),
            last: points.iter().max().copied(),
            size_bytes: bytes.len() as u64,
            content_hash,
            key,
            path,
        })
    }
}
