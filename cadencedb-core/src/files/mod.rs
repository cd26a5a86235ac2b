//! On-disk datapoint file formats
//!
//! Every series directory holds a sorted set of non-overlapping files, each in
//! one of three encodings:
//!
//! - **Dense** (`<min>@<duration>`): one f64 per tick of a fixed cadence
//! - **Sparse** (`<min>-<max>[.opt]`): raw 24-byte records in write order
//! - **Constant** (`<min>@<duration>x<count>=<value>`): an empty file whose name
//!   describes a run of identical values
//!
//! A file's name carries everything needed to place it in the directory, so a
//! directory listing is the only index.

mod constant;
mod dense;
pub(crate) mod io;
mod sparse;

pub use constant::ConstantFile;
pub use dense::DenseFile;
pub use sparse::SparseFile;

use crate::ops::{ReadOperation, WriteOperation};
use crate::storage::StorageConfig;
use crate::{Result, Timestamp};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::warn;

/// File encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Dense,
    Sparse,
    Constant,
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileKind::Dense => f.pad("dense"),
            FileKind::Sparse => f.pad("sparse"),
            FileKind::Constant => f.pad("constant"),
        }
    }
}

/// Summary of one file, for inspection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileInfo {
    pub kind: FileKind,
    pub file_name: String,
    pub min_timestamp: Timestamp,
    /// Exclusive end of the range the file covers
    pub end_timestamp: Timestamp,
}

/// A datapoint file in one of the supported encodings
#[derive(Debug, Clone, PartialEq)]
pub enum DatapointFile {
    Dense(DenseFile),
    Sparse(SparseFile),
    Constant(ConstantFile),
}

impl DatapointFile {
    /// Recognize a directory entry by its name.
    ///
    /// Returns `None` for names no format recognizes, and for names that parse
    /// but are not spelled the way this crate writes them (`+5@10`, `05-10`).
    /// Two spellings of one file would otherwise both load, overlapping.
    pub fn from_filename(dir: &Path, name: &str) -> Result<Option<Self>> {
        let file = if let Some((min, duration)) = DenseFile::parse_filename(name) {
            Self::Dense(DenseFile::open(dir, min, duration)?)
        } else if let Some((min, max, optimized)) = SparseFile::parse_filename(name) {
            Self::Sparse(SparseFile::open(dir, min, max, optimized)?)
        } else if let Some((min, duration, count, value)) = ConstantFile::parse_filename(name) {
            Self::Constant(ConstantFile::new(min, duration, count, value))
        } else {
            return Ok(None);
        };

        if file.file_name() != name {
            warn!(
                "Ignoring {} in {}: not the canonical spelling {}",
                name,
                dir.display(),
                file.file_name()
            );
            return Ok(None);
        }
        Ok(Some(file))
    }

    pub fn kind(&self) -> FileKind {
        match self {
            Self::Dense(_) => FileKind::Dense,
            Self::Sparse(_) => FileKind::Sparse,
            Self::Constant(_) => FileKind::Constant,
        }
    }

    pub fn min_timestamp(&self) -> Timestamp {
        match self {
            Self::Dense(f) => f.min_timestamp(),
            Self::Sparse(f) => f.min_timestamp(),
            Self::Constant(f) => f.min_timestamp(),
        }
    }

    /// Exclusive end of the timestamps this file holds
    pub fn end_timestamp(&self) -> Timestamp {
        match self {
            Self::Dense(f) => f.max_timestamp(),
            Self::Sparse(f) => f.max_timestamp().saturating_add(1),
            Self::Constant(f) => f.max_timestamp(),
        }
    }

    pub fn file_name(&self) -> String {
        match self {
            Self::Dense(f) => f.file_name(),
            Self::Sparse(f) => f.file_name(),
            Self::Constant(f) => f.file_name(),
        }
    }

    pub fn path(&self, dir: &Path) -> PathBuf {
        dir.join(self.file_name())
    }

    /// Append datapoints from `[op.next_time(), op.end_time())` to the read buffer
    pub fn read(&self, dir: &Path, op: &mut ReadOperation, config: &StorageConfig) -> Result<()> {
        match self {
            Self::Dense(f) => f.read(dir, op),
            Self::Sparse(f) => f.read(dir, op, config),
            Self::Constant(f) => {
                f.read(op);
                Ok(())
            }
        }
    }

    /// Write from the operation's cursor; returns how many datapoints were consumed.
    ///
    /// Zero means this file cannot take the next datapoint. A constant run
    /// whose values are revised is first rewritten as a dense file, and this
    /// entry becomes that file.
    pub fn write(
        &mut self,
        dir: &Path,
        op: &WriteOperation<'_>,
        config: &StorageConfig,
    ) -> Result<usize> {
        match self {
            Self::Dense(f) => f.write(dir, op, config),
            Self::Sparse(f) => f.write(dir, op, config),
            Self::Constant(f) if f.needs_revision(op) => {
                let mut dense = f.materialize(dir, config)?;
                let written = dense.write(dir, op, config);
                *self = Self::Dense(dense);
                written
            }
            Self::Constant(f) => f.write(dir, op),
        }
    }

    /// Datapoints that can still be added before the file is full
    pub fn remaining_capacity(&self, config: &StorageConfig) -> usize {
        match self {
            Self::Sparse(f) => f.remaining_writable_datapoints(config),
            Self::Dense(_) | Self::Constant(_) => usize::MAX,
        }
    }

    pub fn info(&self) -> FileInfo {
        FileInfo {
            kind: self.kind(),
            file_name: self.file_name(),
            min_timestamp: self.min_timestamp(),
            end_timestamp: self.end_timestamp(),
        }
    }
}

/// Round `timestamp` up onto the cadence `origin + k * step`
pub(crate) fn align_up(timestamp: Timestamp, origin: Timestamp, step: i64) -> Option<Timestamp> {
    let offset = timestamp.checked_sub(origin)?;
    match offset.rem_euclid(step) {
        0 => Some(timestamp),
        rem => timestamp.checked_add(step - rem),
    }
}

/// Left-to-right filename scanner; any unexpected character fails the parse
pub(crate) struct NameParser<'a> {
    rest: &'a str,
}

impl<'a> NameParser<'a> {
    pub(crate) fn new(name: &'a str) -> Self {
        Self { rest: name }
    }

    /// Optional sign followed by at least one digit
    pub(crate) fn int(&mut self) -> Option<i64> {
        let bytes = self.rest.as_bytes();
        let mut end = usize::from(matches!(bytes.first(), Some(b'-' | b'+')));
        let digits = end;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
        if end == digits {
            return None;
        }
        let value = self.rest[..end].parse().ok()?;
        self.rest = &self.rest[end..];
        Some(value)
    }

    /// Everything that is left, as a float
    pub(crate) fn float(&mut self) -> Option<f64> {
        let value = self.rest.parse().ok()?;
        self.rest = "";
        Some(value)
    }

    pub(crate) fn expect(&mut self, c: char) -> Option<()> {
        self.rest = self.rest.strip_prefix(c)?;
        Some(())
    }

    pub(crate) fn rest(&self) -> &'a str {
        self.rest
    }

    pub(crate) fn finish(&self) -> Option<()> {
        self.rest.is_empty().then_some(())
    }
}
