//! Stable k-way merge of individually sorted pages

use crate::Datapoint;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Merge pages whose used regions are each sorted into a fresh set of pages.
///
/// Ties are broken by page index and then by offset, and pages are in write
/// order, so datapoints sharing a timestamp keep the order they were written in.
pub(super) fn merge_pages(
    pages: &[Box<[Datapoint]>],
    len: usize,
    per_page: usize,
) -> Vec<Box<[Datapoint]>> {
    let used = |page: usize| per_page.min(len - page * per_page);

    let mut heap = BinaryHeap::with_capacity(pages.len());
    for (page, data) in pages.iter().enumerate() {
        if page * per_page < len {
            heap.push(Reverse((data[0].timestamp, page, 0usize)));
        }
    }

    let mut merged: Vec<Box<[Datapoint]>> = Vec::with_capacity(pages.len());
    let mut written = 0;
    while let Some(Reverse((_, page, offset))) = heap.pop() {
        if written % per_page == 0 {
            merged.push(vec![Datapoint::default(); per_page].into_boxed_slice());
        }
        merged[written / per_page][written % per_page] = pages[page][offset];
        written += 1;

        let next = offset + 1;
        if next < used(page) {
            heap.push(Reverse((pages[page][next].timestamp, page, next)));
        }
    }

    merged
}
