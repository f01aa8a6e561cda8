//! In-memory set of free block ranges
//!
//! `CatalogBlockIndices` holds closed ranges `[start, stop]` sorted ascending.
//! Ranges never overlap and never touch: inserting a range contiguous with a
//! neighbor merges them, so the representation of a given set is unique.

use tessera_core::{Error, Result};

/// Sorted, coalesced set of closed block ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogBlockIndices {
    ranges: Vec<(u64, u64)>,
    length: u64,
}

fn range_len(start: u64, stop: u64) -> u64 {
    stop - start + 1
}

impl CatalogBlockIndices {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Set holding the single range `[start, stop]`
    pub fn from_range(start: u64, stop: u64) -> Result<Self> {
        let mut set = Self::new();
        set.add(start, stop)?;
        Ok(set)
    }

    /// Set holding every index yielded by `indices`. Duplicates are rejected.
    pub fn from_indices(indices: impl IntoIterator<Item = u64>) -> Result<Self> {
        let mut sorted: Vec<u64> = indices.into_iter().collect();
        sorted.sort_unstable();
        let mut set = Self::new();
        let mut iter = sorted.into_iter().peekable();
        while let Some(start) = iter.next() {
            let mut stop = start;
            while let Some(&next) = iter.peek() {
                if Some(next) == stop.checked_add(1) {
                    stop = next;
                    iter.next();
                } else {
                    break;
                }
            }
            set.add(start, stop)?;
        }
        Ok(set)
    }

    /// Number of individual indices in the set
    pub fn len(&self) -> u64 {
        self.length
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// The stored ranges, ascending
    pub fn ranges(&self) -> &[(u64, u64)] {
        &self.ranges
    }

    /// Position of the first range whose stop is at or after `index`
    fn locate(&self, index: u64) -> usize {
        self.ranges.partition_point(|&(_, stop)| stop < index)
    }

    /// Add `[start, stop]`. Any overlap with stored indices is a structural violation.
    pub fn add(&mut self, start: u64, stop: u64) -> Result<()> {
        if start > stop {
            return Err(Error::invalid_argument(format!(
                "range [{}, {}] is inverted",
                start, stop
            )));
        }
        let pos = self.locate(start);
        if pos < self.ranges.len() && self.ranges[pos].0 <= stop {
            return Err(Error::corruption(format!(
                "blocks already in catalog: [{}, {}] overlaps [{}, {}]",
                start, stop, self.ranges[pos].0, self.ranges[pos].1
            )));
        }

        let merge_left = pos > 0 && self.ranges[pos - 1].1 + 1 == start;
        let merge_right = pos < self.ranges.len() && stop.checked_add(1) == Some(self.ranges[pos].0);

        match (merge_left, merge_right) {
            (true, true) => {
                self.ranges[pos - 1].1 = self.ranges[pos].1;
                self.ranges.remove(pos);
            }
            (true, false) => self.ranges[pos - 1].1 = stop,
            (false, true) => self.ranges[pos].0 = start,
            (false, false) => self.ranges.insert(pos, (start, stop)),
        }
        self.length += range_len(start, stop);
        Ok(())
    }

    /// Add every range of `other`.
    pub fn add_set(&mut self, other: &CatalogBlockIndices) -> Result<()> {
        for &(start, stop) in &other.ranges {
            self.add(start, stop)?;
        }
        Ok(())
    }

    /// Remove `[start, stop]`, which must lie entirely inside one stored range.
    pub fn remove(&mut self, start: u64, stop: u64) -> Result<()> {
        if start > stop {
            return Err(Error::invalid_argument(format!(
                "range [{}, {}] is inverted",
                start, stop
            )));
        }
        let pos = self.locate(start);
        if pos >= self.ranges.len() || self.ranges[pos].0 > start || self.ranges[pos].1 < stop {
            return Err(Error::corruption(format!(
                "blocks [{}, {}] not in catalog",
                start, stop
            )));
        }
        let (first, last) = self.ranges[pos];
        match (first == start, last == stop) {
            (true, true) => {
                self.ranges.remove(pos);
            }
            (true, false) => self.ranges[pos].0 = stop + 1,
            (false, true) => self.ranges[pos].1 = start - 1,
            (false, false) => {
                self.ranges[pos].1 = start - 1;
                self.ranges.insert(pos + 1, (stop + 1, last));
            }
        }
        self.length -= range_len(start, stop);
        Ok(())
    }

    /// Remove whatever part of `other` is present. Returns the part that was not.
    pub fn remove_set(&mut self, other: &CatalogBlockIndices) -> Result<CatalogBlockIndices> {
        let mut missing = CatalogBlockIndices::new();
        for &(start, stop) in &other.ranges {
            let mut current = start;
            loop {
                let pos = self.locate(current);
                let segment_stop = if pos < self.ranges.len() && self.ranges[pos].0 <= current {
                    let end = self.ranges[pos].1.min(stop);
                    self.remove(current, end)?;
                    end
                } else {
                    let end = if pos < self.ranges.len() {
                        (self.ranges[pos].0 - 1).min(stop)
                    } else {
                        stop
                    };
                    missing.add(current, end)?;
                    end
                };
                match segment_stop.checked_add(1) {
                    Some(next) if next <= stop => current = next,
                    _ => break,
                }
            }
        }
        Ok(missing)
    }

    /// Take `count` indices off the high end of the set.
    pub fn extract(&mut self, count: u64) -> Result<CatalogBlockIndices> {
        if count > self.length {
            return Err(Error::invalid_argument(format!(
                "cannot extract {} indices from a set of {}",
                count, self.length
            )));
        }
        let mut out = CatalogBlockIndices::new();
        let mut remaining = count;
        while remaining > 0 {
            let Some(last) = self.ranges.last_mut() else {
                break;
            };
            let size = range_len(last.0, last.1);
            if size <= remaining {
                let (start, stop) = *last;
                self.ranges.pop();
                out.add(start, stop)?;
                remaining -= size;
            } else {
                let start = last.1 - remaining + 1;
                out.add(start, last.1)?;
                last.1 = start - 1;
                remaining = 0;
            }
        }
        self.length -= count;
        Ok(out)
    }

    /// Whether `index` is in the set
    pub fn contains(&self, index: u64) -> bool {
        let pos = self.locate(index);
        pos < self.ranges.len() && self.ranges[pos].0 <= index
    }

    /// Whether any index of `[start, stop]` is in the set
    pub fn intersects(&self, start: u64, stop: u64) -> bool {
        let pos = self.locate(start);
        pos < self.ranges.len() && self.ranges[pos].0 <= stop
    }

    /// Ascending iterator over individual indices
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.ranges.iter().flat_map(|&(start, stop)| start..=stop)
    }

    /// Drop every range
    pub fn clear(&mut self) {
        self.ranges.clear();
        self.length = 0;
    }
}
