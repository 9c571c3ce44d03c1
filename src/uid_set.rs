//! Range-compressed UID sets for search cursors
//!
//! Search results are stored as descending runs of consecutive UIDs rather
//! than one entry per message. Mail arrives mostly in order, so UIDs tend to
//! be dense and a result set of thousands of messages usually collapses into
//! a handful of ranges. Pages are cut directly out of the ranges.

/// Inclusive run of consecutive UIDs, `high >= low`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UidRange {
    pub high: u32,
    pub low: u32,
}

impl UidRange {
    /// Number of UIDs covered by this range
    pub fn len(&self) -> usize {
        (self.high - self.low) as usize + 1
    }
}

/// Compress UIDs into strictly descending, disjoint, non-touching ranges
///
/// Input order does not matter and duplicates are ignored.
pub fn compress(uids: impl IntoIterator<Item = u32>) -> Vec<UidRange> {
    let mut sorted: Vec<u32> = uids.into_iter().collect();
    sorted.sort_unstable_by(|a, b| b.cmp(a));
    sorted.dedup();

    let mut ranges: Vec<UidRange> = Vec::new();
    for uid in sorted {
        if let Some(last) = ranges.last_mut()
            && last.low.checked_sub(1) == Some(uid)
        {
            last.low = uid;
            continue;
        }
        ranges.push(UidRange {
            high: uid,
            low: uid,
        });
    }
    ranges
}

/// Total number of UIDs across all ranges
pub fn total_len(ranges: &[UidRange]) -> usize {
    ranges.iter().map(UidRange::len).sum()
}

/// Iterate every UID in descending order
pub fn expand(ranges: &[UidRange]) -> impl Iterator<Item = u32> + '_ {
    ranges.iter().flat_map(|r| (r.low..=r.high).rev())
}

/// Page `[offset, offset + limit)` of the descending UID sequence
///
/// Ranges wholly before `offset` are skipped without being expanded.
/// An `offset` at or past the end yields an empty page.
pub fn slice(ranges: &[UidRange], offset: usize, limit: usize) -> Vec<u32> {
    let mut skip = offset;
    let mut first = ranges.len();
    for (idx, range) in ranges.iter().enumerate() {
        if skip < range.len() {
            first = idx;
            break;
        }
        skip -= range.len();
    }
    expand(&ranges[first..]).skip(skip).take(limit).collect()
}

/// Render UIDs as a compact IMAP sequence set, e.g. `42,40:38`
///
/// Used to fetch one page with a single `UID FETCH`.
pub fn to_sequence_set(uids: &[u32]) -> String {
    compress(uids.iter().copied())
        .iter()
        .map(|r| {
            if r.high == r.low {
                r.high.to_string()
            } else {
                format!("{}:{}", r.high, r.low)
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::{UidRange, compress, expand, slice, to_sequence_set, total_len};

    fn range(high: u32, low: u32) -> UidRange {
        UidRange { high, low }
    }

    fn sorted_desc(uids: &[u32]) -> Vec<u32> {
        let mut out = uids.to_vec();
        out.sort_unstable_by(|a, b| b.cmp(a));
        out.dedup();
        out
    }

    fn sample_sets() -> Vec<Vec<u32>> {
        vec![
            vec![],
            vec![7],
            vec![0],
            vec![1, 2, 3, 4, 5],
            vec![10, 9, 8, 3, 2, 1],
            vec![1, 3, 5, 7, 9, 11],
            vec![20, 1, 2, 19, 3, 18, 50],
            vec![0, 1, u32::MAX, u32::MAX - 1],
            (100..160).chain(200..205).chain([300, 302]).collect(),
        ]
    }

    #[test]
    fn compresses_runs_into_descending_ranges() {
        assert_eq!(compress([]), Vec::<UidRange>::new());
        assert_eq!(compress([5]), vec![range(5, 5)]);
        assert_eq!(compress([1, 2, 3]), vec![range(3, 1)]);
        assert_eq!(
            compress([1, 2, 3, 7, 8, 10]),
            vec![range(10, 10), range(8, 7), range(3, 1)]
        );
        assert_eq!(
            compress([9, 5, 1]),
            vec![range(9, 9), range(5, 5), range(1, 1)]
        );
    }

    #[test]
    fn duplicates_do_not_split_ranges() {
        assert_eq!(compress([3, 2, 2, 1, 3]), vec![range(3, 1)]);
    }

    #[test]
    fn expansion_reproduces_input_set() {
        for set in sample_sets() {
            let ranges = compress(set.iter().copied());
            let expanded: Vec<u32> = expand(&ranges).collect();
            assert_eq!(expanded, sorted_desc(&set));
            assert_eq!(total_len(&ranges), expanded.len());
            for pair in ranges.windows(2) {
                assert!(pair[0].low > pair[1].high + 1, "ranges touch: {pair:?}");
            }
        }
    }

    #[test]
    fn slice_matches_naive_slicing() {
        for set in sample_sets() {
            let ranges = compress(set.iter().copied());
            let flat = sorted_desc(&set);
            for offset in 0..=flat.len() + 2 {
                for limit in 0..=flat.len() + 2 {
                    let expected: Vec<u32> =
                        flat.iter().skip(offset).take(limit).copied().collect();
                    assert_eq!(
                        slice(&ranges, offset, limit),
                        expected,
                        "set={set:?} offset={offset} limit={limit}"
                    );
                }
            }
        }
    }

    #[test]
    fn slice_straddles_range_boundaries() {
        let ranges = compress([10, 9, 8, 3, 2, 1]);
        assert_eq!(slice(&ranges, 2, 3), vec![8, 3, 2]);
        assert_eq!(slice(&ranges, 1, 10), vec![9, 8, 3, 2, 1]);
    }

    #[test]
    fn slice_past_end_is_empty() {
        let ranges = compress([3, 2, 1]);
        assert!(slice(&ranges, 3, 10).is_empty());
        assert!(slice(&ranges, 100, 1).is_empty());
        assert!(slice(&[], 0, 5).is_empty());
    }

    #[test]
    fn renders_sequence_sets() {
        assert_eq!(to_sequence_set(&[42, 40, 39, 38]), "42,40:38");
        assert_eq!(to_sequence_set(&[5]), "5");
        assert_eq!(to_sequence_set(&[]), "");
    }
}
