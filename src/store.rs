//! Append-only persistence
//!
//! Two primitives back every component:
//! - [`JsonlLog`]: one JSON record per line, appended and flushed before the
//!   mutating call returns, with periodic compaction that preserves exact
//!   last-N retention. Corrupt lines are skipped on replay, not fatal.
//! - [`save_snapshot`]/[`load_snapshot`]: whole-value JSON written through a
//!   temp file and renamed into place, so a crash never leaves a torn
//!   snapshot.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};

/// Compaction kicks in once a bounded log grows past this multiple of its
/// retention.
const COMPACT_FACTOR: usize = 4;

/// Root directory holding every log and snapshot for one engine instance.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Create (if needed) and open the directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Append-only JSONL log.
pub struct JsonlLog<T> {
    path: PathBuf,
    writer: BufWriter<File>,
    lines: usize,
    retention: Option<usize>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> JsonlLog<T> {
    /// Open or create an unbounded log.
    pub fn open(path: PathBuf) -> Result<Self> {
        Self::open_inner(path, None)
    }

    /// Open or create a log that keeps (at least) the last `keep_last`
    /// records, compacting once it grows past `COMPACT_FACTOR` times that.
    pub fn with_retention(path: PathBuf, keep_last: usize) -> Result<Self> {
        Self::open_inner(path, Some(keep_last))
    }

    fn open_inner(path: PathBuf, retention: Option<usize>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let lines = if path.exists() {
            BufReader::new(File::open(&path)?).lines().count()
        } else {
            0
        };
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            lines,
            retention,
            _marker: PhantomData,
        })
    }

    /// Serialize one record, write it as a line, and flush before returning.
    pub fn append(&mut self, item: &T) -> Result<()> {
        let json = serde_json::to_string(item)?;
        writeln!(self.writer, "{json}")?;
        self.writer.flush()?;
        self.lines += 1;

        if let Some(keep) = self.retention {
            if keep > 0 && self.lines > keep.saturating_mul(COMPACT_FACTOR) {
                self.compact(keep)?;
            }
        }
        Ok(())
    }

    /// Read every intact record back, in insertion order.
    pub fn replay(&self) -> Result<Vec<T>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&self.path)?);
        let mut out = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(item) => out.push(item),
                Err(e) => warn!(
                    path = %self.path.display(),
                    line = lineno + 1,
                    error = %e,
                    "skipping corrupt log line"
                ),
            }
        }
        Ok(out)
    }

    /// Rewrite the log keeping only the last `keep_last` records.
    pub fn compact(&mut self, keep_last: usize) -> Result<()> {
        let records = self.replay()?;
        let start = records.len().saturating_sub(keep_last);
        let kept = &records[start..];

        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let mut w = BufWriter::new(File::create(&tmp)?);
            for item in kept {
                writeln!(w, "{}", serde_json::to_string(item)?)?;
            }
            w.flush()?;
        }
        // Swap in the compacted file, then reopen the append handle.
        self.writer.flush()?;
        fs::rename(&tmp, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.lines = kept.len();
        debug!(
            path = %self.path.display(),
            kept = kept.len(),
            dropped = start,
            "compacted log"
        );
        Ok(())
    }

    /// Records currently in the file.
    pub fn len(&self) -> usize {
        self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines == 0
    }
}

impl<T> std::fmt::Debug for JsonlLog<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonlLog")
            .field("path", &self.path)
            .field("lines", &self.lines)
            .field("retention", &self.retention)
            .finish()
    }
}

/// Write a whole-value JSON snapshot atomically (temp file + rename).
pub fn save_snapshot<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    {
        let mut w = BufWriter::new(File::create(&tmp)?);
        serde_json::to_writer(&mut w, value)?;
        w.flush()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Load a snapshot if one exists. A corrupt snapshot is an error: the caller
/// decides whether to start fresh.
pub fn load_snapshot<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let reader = BufReader::new(File::open(path)?);
    let value = serde_json::from_reader(reader)
        .map_err(|e| EngineError::Persistence(format!("{}: {e}", path.display())))?;
    Ok(Some(value))
}
