//! Splits an ordered item list into contiguous shard ranges.
//!
//! Ranges are half-open, cover `[0, total)` exactly once and differ in size
//! by at most one item. Leading shards take the remainder, so re-runs that
//! name the same shard index always cover the same items.

use std::ops::Range;

use serde::Serialize;

use crate::error::{Error, Result};

/// One shard's slice of the item list, as reported by `gridchain partition`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardRange {
    pub index: usize,
    pub start: usize,
    pub end: usize,
}

pub fn partition(total_items: usize, num_shards: usize) -> Result<Vec<Range<usize>>> {
    if num_shards < 1 {
        return Err(Error::validation_invalid_argument(
            "num_shards",
            "Shard count must be at least 1",
            Some(num_shards.to_string()),
            None,
        ));
    }

    let shards = num_shards.min(total_items);
    if shards == 0 {
        return Ok(Vec::new());
    }

    let base = total_items / shards;
    let remainder = total_items % shards;

    let mut ranges = Vec::with_capacity(shards);
    let mut start = 0;
    for index in 0..shards {
        let len = base + usize::from(index < remainder);
        ranges.push(start..start + len);
        start += len;
    }

    Ok(ranges)
}

/// Range for a single shard index.
///
/// `None` means the shard index lies past the clamped shard count (more
/// shards were scheduled than there are items), so the shard has no work.
pub fn shard_range(total_items: usize, index: usize, num_shards: usize) -> Result<Option<Range<usize>>> {
    Ok(partition(total_items, num_shards)?.into_iter().nth(index))
}

pub fn describe(total_items: usize, num_shards: usize) -> Result<Vec<ShardRange>> {
    Ok(partition(total_items, num_shards)?
        .into_iter()
        .enumerate()
        .map(|(index, range)| ShardRange {
            index,
            start: range.start,
            end: range.end,
        })
        .collect())
}
