// Copyright (C) 2024, the quince authors.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright notice,
//       this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above copyright
//       notice, this list of conditions and the following disclaimer in the
//       documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS
// IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO,
// THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR
// PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR
// CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::ops::Range;

/// A set of non-overlapping `u64` ranges.
///
/// Ranges are stored as a map from start offset to (exclusive) end offset,
/// and are merged on insertion. This backs ACK ranges, the set of received
/// packet numbers, and acknowledged send offsets.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd)]
pub struct RangeSet {
    inner: BTreeMap<u64, u64>,
}

impl RangeSet {
    /// Inserts `item` into the set, merging it with any range it touches
    /// or overlaps.
    pub fn insert(&mut self, item: Range<u64>) {
        if item.start >= item.end {
            return;
        }

        let mut start = item.start;
        let mut end = item.end;

        // Absorb the closest range starting at or before the new one, if it
        // reaches the new range.
        if let Some((&s, &e)) = self
            .inner
            .range((Bound::Unbounded, Bound::Included(start)))
            .next_back()
        {
            if e >= start {
                if e >= end {
                    // Already fully covered.
                    return;
                }

                self.inner.remove(&s);

                start = s;
            }
        }

        // Absorb every range that begins inside (or immediately after) the
        // new one.
        while let Some((&s, &e)) = self
            .inner
            .range((Bound::Included(start), Bound::Included(end)))
            .next()
        {
            self.inner.remove(&s);

            end = std::cmp::max(end, e);
        }

        self.inner.insert(start, end);
    }

    /// Inserts the single value `item`.
    pub fn push_item(&mut self, item: u64) {
        self.insert(item..item + 1);
    }

    /// Removes all values up to and including `largest`.
    pub fn remove_until(&mut self, largest: u64) {
        while let Some((&s, &e)) = self.inner.iter().next() {
            if s > largest {
                break;
            }

            self.inner.remove(&s);

            if e > largest + 1 {
                self.inner.insert(largest + 1, e);
                break;
            }
        }
    }

    /// Returns true if `item` is contained in one of the ranges.
    pub fn contains(&self, item: u64) -> bool {
        self.inner
            .range((Bound::Unbounded, Bound::Included(item)))
            .next_back()
            .is_some_and(|(_, &e)| item < e)
    }

    /// Returns the smallest value in the set.
    pub fn first(&self) -> Option<u64> {
        self.inner.keys().next().copied()
    }

    /// Returns the largest value in the set.
    pub fn last(&self) -> Option<u64> {
        self.inner.values().next_back().map(|e| e - 1)
    }

    /// Returns the number of distinct ranges.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if the set holds no ranges.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Removes all ranges from the set.
    pub fn clear(&mut self) {
        self.inner.clear();
    }

    /// Iterates over the ranges in ascending order.
    pub fn iter(&self) -> Iter {
        Iter {
            inner: self.inner.iter(),
        }
    }

    /// Iterates over every value in the set in ascending order.
    pub fn flatten(&self) -> impl DoubleEndedIterator<Item = u64> + '_ {
        self.iter().flatten()
    }
}

impl std::fmt::Debug for RangeSet {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ranges: Vec<Range<u64>> =
            self.iter().map(|r| r.start..r.end - 1).collect();

        write!(f, "{ranges:?}")
    }
}

// A `RangeSet` with a single gapless range compares equal to that range.
impl PartialEq<Range<u64>> for RangeSet {
    fn eq(&self, other: &Range<u64>) -> bool {
        if self.inner.len() != 1 {
            return false;
        }

        let (&s, &e) = self.inner.iter().next().unwrap();

        s == other.start && e == other.end
    }
}

pub struct Iter<'a> {
    inner: btree_map::Iter<'a, u64, u64>,
}

impl Iterator for Iter<'_> {
    type Item = Range<u64>;

    fn next(&mut self) -> Option<Range<u64>> {
        let (&s, &e) = self.inner.next()?;
        Some(s..e)
    }
}

impl DoubleEndedIterator for Iter<'_> {
    fn next_back(&mut self) -> Option<Range<u64>> {
        let (&s, &e) = self.inner.next_back()?;
        Some(s..e)
    }
}

impl ExactSizeIterator for Iter<'_> {
    fn len(&self) -> usize {
        self.inner.len()
    }
}
