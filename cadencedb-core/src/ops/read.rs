//! Resumable read cursor

use crate::{Datapoint, Timestamp};

/// State of one chunked read.
///
/// A read fills a fixed-capacity buffer and can be resumed from `next_time`
/// once the caller has drained the buffer, so a large read never needs more
/// than one buffer of memory and never pins a worker for long.
#[derive(Debug)]
pub struct ReadOperation {
    start_time: Timestamp,
    next_time: Timestamp,
    end_time: Timestamp,
    remaining_limit: Option<u64>,
    prefer_latest: bool,
    buffer: Vec<Datapoint>,
    capacity: usize,
}

impl ReadOperation {
    /// Create a read over `[start, end)` with room for `capacity` datapoints per chunk.
    ///
    /// `limit` caps the total number of datapoints returned across all chunks.
    /// When `prefer_latest` is set the limit is applied by the caller to the tail
    /// of the range instead, so the cursor itself does not stop early.
    pub fn new(
        start: Timestamp,
        end: Timestamp,
        limit: Option<u64>,
        prefer_latest: bool,
        capacity: usize,
    ) -> Self {
        Self {
            start_time: start,
            next_time: start,
            end_time: end,
            remaining_limit: limit,
            prefer_latest,
            buffer: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Lower bound of all timestamps to read
    pub fn start_time(&self) -> Timestamp {
        self.start_time
    }

    /// Lower bound of the next timestamp to read
    pub fn next_time(&self) -> Timestamp {
        self.next_time
    }

    /// Exclusive upper bound of the read
    pub fn end_time(&self) -> Timestamp {
        self.end_time
    }

    pub fn prefer_latest(&self) -> bool {
        self.prefer_latest
    }

    /// Datapoints still allowed by the limit, if there is one
    pub fn remaining_limit(&self) -> Option<u64> {
        self.remaining_limit
    }

    /// Emit a datapoint and move `next_time` past the span it covers
    pub fn append(&mut self, point: Datapoint) {
        debug_assert!(self.space_left() > 0);
        self.next_time = point.next_timestamp();
        self.buffer.push(point);
        if !self.prefer_latest {
            if let Some(remaining) = self.remaining_limit.as_mut() {
                *remaining = remaining.saturating_sub(1);
            }
        }
    }

    pub fn datapoints_in_buffer(&self) -> usize {
        self.buffer.len()
    }

    pub fn space_left(&self) -> usize {
        self.capacity - self.buffer.len()
    }

    /// Datapoints gathered by the current chunk
    pub fn buffer(&self) -> &[Datapoint] {
        &self.buffer
    }

    /// Drop the current chunk so the read can resume
    pub fn clear_buffer(&mut self) {
        self.buffer.clear();
    }

    /// True once every timestamp in range has been visited or the limit is used up
    pub fn is_complete(&self) -> bool {
        self.next_time >= self.end_time || self.remaining_limit == Some(0)
    }

    /// Force completion when no further data can exist
    pub fn finish(&mut self) {
        self.next_time = self.end_time;
    }

    /// True when the cursor can accept another datapoint
    pub fn wants_more(&self) -> bool {
        self.space_left() > 0 && !self.is_complete()
    }
}
