//! Per-series write buffer
//!
//! Incoming datapoints are appended to fixed-size page allocations so the
//! buffer can grow without ever copying what it already holds. The buffer is
//! only sorted when something needs to read it in order.

mod merge;

use crate::ops::DatapointBuffer;
use crate::{Datapoint, DATAPOINT_SIZE};

/// Allocation granularity the write buffer page size is a multiple of
pub const SYSTEM_PAGE_SIZE: usize = 4096;

/// Append-only staging area for datapoints that have not been flushed yet
#[derive(Debug)]
pub struct WriteBuffer {
    pages: Vec<Box<[Datapoint]>>,
    per_page: usize,
    len: usize,
    sorted: bool,
}

impl WriteBuffer {
    /// Create a buffer that grows by `pages_per_alloc` system pages at a time
    pub fn new(pages_per_alloc: usize) -> Self {
        Self::with_datapoints_per_page(pages_per_alloc * SYSTEM_PAGE_SIZE / DATAPOINT_SIZE)
    }

    pub(crate) fn with_datapoints_per_page(per_page: usize) -> Self {
        Self {
            pages: Vec::new(),
            per_page: per_page.max(1),
            len: 0,
            sorted: true,
        }
    }

    /// Append datapoints, silently dropping NaN values.
    ///
    /// Returns how many datapoints were stored.
    pub fn append(&mut self, points: &[Datapoint]) -> usize {
        let before = self.len;
        for point in points.iter().filter(|p| !p.value.is_nan()) {
            if self.sorted && self.len > 0 && point.timestamp < self.get(self.len - 1).timestamp {
                self.sorted = false;
            }

            let (page, offset) = (self.len / self.per_page, self.len % self.per_page);
            if page == self.pages.len() {
                self.pages
                    .push(vec![Datapoint::default(); self.per_page].into_boxed_slice());
            }
            self.pages[page][offset] = *point;
            self.len += 1;
        }
        self.len - before
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True when the datapoints are known to be in non-decreasing timestamp order
    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    /// Number of page allocations currently held
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn get(&self, index: usize) -> Datapoint {
        self.pages[index / self.per_page][index % self.per_page]
    }

    /// Stable sort by timestamp; datapoints sharing a timestamp keep their write order
    pub fn sort(&mut self) {
        if self.sorted {
            return;
        }

        for (i, page) in self.pages.iter_mut().enumerate() {
            let used = self.per_page.min(self.len - i * self.per_page);
            page[..used].sort();
        }
        if self.pages.len() > 1 {
            self.pages = merge::merge_pages(&self.pages, self.len, self.per_page);
        }
        self.sorted = true;
    }

    /// Release every page
    pub fn clear(&mut self) {
        self.pages = Vec::new();
        self.len = 0;
        self.sorted = true;
    }

    pub fn iter(&self) -> impl Iterator<Item = Datapoint> + '_ {
        (0..self.len).map(move |i| self.get(i))
    }

    /// Index of the first datapoint with a timestamp `>= timestamp`; requires a sorted buffer
    pub fn lower_bound(&self, timestamp: i64) -> usize {
        let (mut lo, mut hi) = (0, self.len);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.get(mid).timestamp < timestamp {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }
}

impl Default for WriteBuffer {
    fn default() -> Self {
        Self::new(crate::config::WRITE_BUFFER_PAGES_PER_ALLOC)
    }
}

impl DatapointBuffer for WriteBuffer {
    fn len(&self) -> usize {
        self.len
    }

    fn get(&self, index: usize) -> Datapoint {
        WriteBuffer::get(self, index)
    }

    fn spans(&self, start: usize, end: usize) -> Vec<&[Datapoint]> {
        let end = end.min(self.len);
        let mut spans = Vec::new();
        let mut i = start;
        while i < end {
            let (page, offset) = (i / self.per_page, i % self.per_page);
            let usable = (end - i).min(self.per_page - offset);
            spans.push(&self.pages[page][offset..offset + usable]);
            i += usable;
        }
        spans
    }
}
