//! Range tombstones and their fragmented form.
//!
//! Raw tombstones may overlap arbitrarily. For reads they are fragmented:
//! the key space is cut at every tombstone boundary, and each resulting
//! interval carries the sequence numbers of all tombstones fully covering
//! it, newest first. Point lookups then reduce to one binary search.

use crate::value::{SeqNo, UserKey};
use std::sync::Arc;

/// A tombstone deleting every key in `[start_key, end_key)` with a
/// sequence number at or below `seqno`
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RangeTombstone {
    /// Inclusive start of the covered range
    pub start_key: UserKey,

    /// Exclusive end of the covered range
    pub end_key: UserKey,

    /// Sequence number the tombstone was written at
    pub seqno: SeqNo,
}

#[derive(Debug)]
struct Fragment {
    start: UserKey,
    end: UserKey,

    /// Sequence numbers of all tombstones covering this interval, newest
    /// first
    seqnos: Vec<SeqNo>,
}

/// Non-overlapping view over a set of range tombstones
#[derive(Debug, Default)]
pub struct FragmentedRangeTombstoneList {
    fragments: Vec<Fragment>,
}

impl FragmentedRangeTombstoneList {
    pub(crate) fn from_tombstones(tombstones: Vec<RangeTombstone>) -> Self {
        let mut boundaries: Vec<&[u8]> = tombstones
            .iter()
            .flat_map(|t| [&*t.start_key, &*t.end_key])
            .collect();
        boundaries.sort_unstable();
        boundaries.dedup();

        let mut fragments = Vec::new();

        for window in boundaries.windows(2) {
            let (start, end) = (window[0], window[1]);

            // Boundaries are cut at every endpoint, so a tombstone either
            // covers the whole interval or none of it
            let mut seqnos: Vec<SeqNo> = tombstones
                .iter()
                .filter(|t| &*t.start_key <= start && &*t.end_key >= end)
                .map(|t| t.seqno)
                .collect();

            if seqnos.is_empty() {
                continue;
            }

            seqnos.sort_unstable_by(|a, b| b.cmp(a));
            seqnos.dedup();

            fragments.push(Fragment {
                start: start.into(),
                end: end.into(),
                seqnos,
            });
        }

        Self { fragments }
    }

    /// Whether any fragments exist
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Highest tombstone sequence number covering `user_key` that is
    /// visible at `read_seq`, or 0 if the key is uncovered.
    #[must_use]
    pub fn max_covering_seqno(&self, user_key: &[u8], read_seq: SeqNo) -> SeqNo {
        let idx = self
            .fragments
            .partition_point(|f| &*f.start <= user_key);

        if idx == 0 {
            return 0;
        }

        let fragment = &self.fragments[idx - 1];
        if user_key >= &*fragment.end {
            return 0;
        }

        fragment
            .seqnos
            .iter()
            .copied()
            .find(|&seqno| seqno <= read_seq)
            .unwrap_or(0)
    }

    /// Iterates fragments visible at `read_seq`
    #[must_use]
    pub fn iter_at(self: Arc<Self>, read_seq: SeqNo) -> FragmentedRangeTombstoneIterator {
        FragmentedRangeTombstoneIterator {
            list: self,
            read_seq,
            idx: 0,
        }
    }
}

/// Yields one tombstone per fragment covering the read sequence
pub struct FragmentedRangeTombstoneIterator {
    list: Arc<FragmentedRangeTombstoneList>,
    read_seq: SeqNo,
    idx: usize,
}

impl Iterator for FragmentedRangeTombstoneIterator {
    type Item = RangeTombstone;

    fn next(&mut self) -> Option<Self::Item> {
        while self.idx < self.list.fragments.len() {
            let fragment = &self.list.fragments[self.idx];
            self.idx += 1;

            if let Some(seqno) = fragment
                .seqnos
                .iter()
                .copied()
                .find(|&seqno| seqno <= self.read_seq)
            {
                return Some(RangeTombstone {
                    start_key: fragment.start.clone(),
                    end_key: fragment.end.clone(),
                    seqno,
                });
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn tombstone(start: &[u8], end: &[u8], seqno: SeqNo) -> RangeTombstone {
        RangeTombstone {
            start_key: start.into(),
            end_key: end.into(),
            seqno,
        }
    }

    #[test]
    fn empty_list() {
        let list = FragmentedRangeTombstoneList::from_tombstones(Vec::new());
        assert!(list.is_empty());
        assert_eq!(0, list.max_covering_seqno(b"a", SeqNo::MAX));
    }

    #[test]
    fn single_tombstone_coverage() {
        let list =
            FragmentedRangeTombstoneList::from_tombstones(vec![tombstone(b"b", b"d", 10)]);

        assert_eq!(10, list.max_covering_seqno(b"b", SeqNo::MAX));
        assert_eq!(10, list.max_covering_seqno(b"c", SeqNo::MAX));

        // End is exclusive
        assert_eq!(0, list.max_covering_seqno(b"d", SeqNo::MAX));
        assert_eq!(0, list.max_covering_seqno(b"a", SeqNo::MAX));

        // Not visible below the tombstone's snapshot
        assert_eq!(0, list.max_covering_seqno(b"c", 9));
        assert_eq!(10, list.max_covering_seqno(b"c", 10));
    }

    #[test]
    fn overlapping_tombstones_fragment() {
        let list = FragmentedRangeTombstoneList::from_tombstones(vec![
            tombstone(b"a", b"e", 5),
            tombstone(b"c", b"g", 8),
        ]);

        // [a,c): only seq 5; [c,e): both; [e,g): only seq 8
        assert_eq!(5, list.max_covering_seqno(b"b", SeqNo::MAX));
        assert_eq!(8, list.max_covering_seqno(b"d", SeqNo::MAX));
        assert_eq!(5, list.max_covering_seqno(b"d", 7));
        assert_eq!(8, list.max_covering_seqno(b"f", SeqNo::MAX));
        assert_eq!(0, list.max_covering_seqno(b"f", 7));
    }

    #[test]
    fn iterator_respects_read_seq() {
        let list = Arc::new(FragmentedRangeTombstoneList::from_tombstones(vec![
            tombstone(b"a", b"c", 5),
            tombstone(b"c", b"e", 9),
        ]));

        let all: Vec<_> = Arc::clone(&list).iter_at(SeqNo::MAX).collect();
        assert_eq!(2, all.len());

        let old: Vec<_> = list.iter_at(6).collect();
        assert_eq!(1, old.len());
        assert_eq!(5, old[0].seqno);
    }
}
