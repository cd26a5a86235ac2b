//! Core types for CadenceDB

use crate::{CadenceError, Result};
use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Timestamp in ticks. The tick unit is chosen by the caller.
pub type Timestamp = i64;

/// Size of one datapoint record on disk
pub const DATAPOINT_SIZE: usize = std::mem::size_of::<Datapoint>();

/// A single sample: the value observed at `timestamp`, asserted to hold for
/// `duration` ticks.
///
/// The in-memory layout is the sparse file record layout, so slices of
/// datapoints are written to and read from disk with a byte cast.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable, Serialize, Deserialize)]
pub struct Datapoint {
    pub timestamp: Timestamp,
    pub value: f64,
    pub duration: i64,
}

impl Datapoint {
    /// Create a new datapoint
    pub fn new(timestamp: Timestamp, value: f64, duration: i64) -> Self {
        Self {
            timestamp,
            value,
            duration,
        }
    }

    /// First timestamp after the span this datapoint covers
    pub fn next_timestamp(&self) -> Timestamp {
        let step = if self.duration > 0 { self.duration } else { 1 };
        self.timestamp.saturating_add(step)
    }
}

// Ordering only looks at the timestamp.
impl PartialEq for Datapoint {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp
    }
}

impl Eq for Datapoint {}

impl PartialOrd for Datapoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Datapoint {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp.cmp(&other.timestamp)
    }
}

/// Labels identifying a series
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeriesKey {
    /// Sorted label name/value pairs
    pub labels: BTreeMap<String, String>,
}

impl SeriesKey {
    /// Create an empty series key
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a label to the series key
    pub fn with_label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(name.into(), value.into());
        self
    }

    /// Check that the labels can form a canonical key
    pub fn validate(&self) -> Result<()> {
        if self.labels.is_empty() {
            return Err(CadenceError::InvalidSeries(
                "at least one label is required".into(),
            ));
        }
        for (name, value) in &self.labels {
            if name.is_empty() {
                return Err(CadenceError::InvalidSeries("empty label name".into()));
            }
            if name.contains(['=', ';']) || value.contains(['=', ';']) {
                return Err(CadenceError::InvalidSeries(format!(
                    "label {name}={value} contains a reserved character"
                )));
            }
        }
        Ok(())
    }

    /// Canonical key string: `name=value;` for each label in name order
    pub fn canonical(&self) -> String {
        let mut key = String::with_capacity(self.size());
        for (name, value) in &self.labels {
            key.push_str(name);
            key.push('=');
            key.push_str(value);
            key.push(';');
        }
        key
    }

    /// Get the size in bytes of the canonical key
    pub fn size(&self) -> usize {
        self.labels
            .iter()
            .map(|(k, v)| k.len() + v.len() + 2)
            .sum()
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for SeriesKey {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            labels: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Stable 64-bit content hash of a canonical series key.
///
/// This decides where a series lives on disk, so it must never change
/// between releases.
pub fn series_hash(canonical: &str) -> u64 {
    let high = crc32fast::hash(canonical.as_bytes());
    let mut low = crc32fast::Hasher::new_with_initial(0x9e37_79b9);
    low.update(canonical.as_bytes());
    (u64::from(high) << 32) | u64::from(low.finalize())
}

/// Relative directory holding a series' datapoint files, e.g. `1a2b/3c4d5e6f7a8b`
pub fn series_dir(hash: u64) -> PathBuf {
    let hex = format!("{hash:016x}");
    let (outer, inner) = hex.split_at(4);
    PathBuf::from(outer).join(inner)
}
