//! Write cursor over a sorted datapoint buffer

use crate::{Datapoint, Timestamp};

/// A sorted, random-access sequence of datapoints that may live in several
/// discontiguous allocations.
pub trait DatapointBuffer {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize) -> Datapoint;

    /// Contiguous spans covering positions `[start, end)`, in order
    fn spans(&self, start: usize, end: usize) -> Vec<&[Datapoint]>;
}

/// A single contiguous slice of datapoints
#[derive(Debug, Clone, Copy)]
pub struct RawBuffer<'a>(pub &'a [Datapoint]);

impl DatapointBuffer for RawBuffer<'_> {
    fn len(&self) -> usize {
        self.0.len()
    }

    fn get(&self, index: usize) -> Datapoint {
        self.0[index]
    }

    fn spans(&self, start: usize, end: usize) -> Vec<&[Datapoint]> {
        if start >= end {
            return Vec::new();
        }
        vec![&self.0[start..end]]
    }
}

/// State of one write of a sorted buffer into a directory of files.
///
/// `max_writable_timestamp` is the inclusive ceiling the file currently being
/// written may accept, normally one tick below the next file's start.
pub struct WriteOperation<'a> {
    buffer: &'a dyn DatapointBuffer,
    cursor: usize,
    max_writable_timestamp: Timestamp,
}

impl<'a> WriteOperation<'a> {
    /// Create a write over the whole buffer, which must be sorted by timestamp
    pub fn new(buffer: &'a dyn DatapointBuffer) -> Self {
        Self {
            buffer,
            cursor: 0,
            max_writable_timestamp: Timestamp::MAX,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.cursor >= self.buffer.len()
    }

    /// Position of the next datapoint to write
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Next datapoint to write
    pub fn current(&self) -> Option<Datapoint> {
        if self.is_complete() {
            None
        } else {
            Some(self.buffer.get(self.cursor))
        }
    }

    /// Skip past datapoints a file has consumed
    pub fn advance(&mut self, count: usize) {
        self.cursor = (self.cursor + count).min(self.buffer.len());
    }

    pub fn max_writable_timestamp(&self) -> Timestamp {
        self.max_writable_timestamp
    }

    pub fn set_max_writable_timestamp(&mut self, timestamp: Timestamp) {
        self.max_writable_timestamp = timestamp;
    }

    /// Number of datapoints from the cursor at or below `max_writable_timestamp`
    pub fn writable_datapoints(&self) -> usize {
        let (mut lo, mut hi) = (self.cursor, self.buffer.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.buffer.get(mid).timestamp <= self.max_writable_timestamp {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo - self.cursor
    }

    /// The next `count` datapoints from the cursor
    pub fn points(&self, count: usize) -> impl Iterator<Item = Datapoint> + '_ {
        let end = (self.cursor + count).min(self.buffer.len());
        (self.cursor..end).map(move |i| self.buffer.get(i))
    }

    /// The next `count` datapoints as contiguous spans, ready for a vectored write
    pub fn spans(&self, count: usize) -> Vec<&'a [Datapoint]> {
        let end = (self.cursor + count).min(self.buffer.len());
        self.buffer.spans(self.cursor, end)
    }
}
