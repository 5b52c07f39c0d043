
use crate::Accession;
use core::fmt;

/// An immutable, inclusive interval of accessions.
///
/// Ranges order by `(start, end)`, which is what guarantees that allocator
/// pools always hand out their lowest ids first.
///
/// # Example
/// ```
/// use accession::Range;
///
/// let range = Range::new(0, 9);
/// let (left, right) = range.split(3).unwrap();
/// assert_eq!(left, Range::new(0, 2));
/// assert_eq!(right, Range::new(3, 9));
/// assert_eq!(range.size(), left.size() + right.size());
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Range {
    start: Accession,
    end: Accession,
}

impl Range {
    /// Creates the range `[start, end]`.
    ///
    /// # Panics
    /// Panics if `end < start`.
    pub const fn new(start: Accession, end: Accession) -> Self {
        assert!(end >= start, "range end must not precede its start");
        Self { start, end }
    }

    /// Creates the range holding the single id `id`.
    pub const fn single(id: Accession) -> Self {
        Self { start: id, end: id }
    }

    pub const fn start(&self) -> Accession {
        self.start
    }

    pub const fn end(&self) -> Accession {
        self.end
    }

    /// Number of ids in the range.
    pub const fn size(&self) -> u64 {
        self.end.abs_diff(self.start) + 1
    }

    pub const fn contains(&self, id: Accession) -> bool {
        self.start <= id && id <= self.end
    }

    /// Splits off the first `k` ids.
    ///
    /// Returns `None` unless `0 < k < size()`, since either half would
    /// otherwise be empty.
    pub fn split(&self, k: u64) -> Option<(Self, Self)> {
        if k == 0 || k >= self.size() {
            return None;
        }
        let boundary = self.start + k as Accession;
        Some((
            Self::new(self.start, boundary - 1),
            Self::new(boundary, self.end),
        ))
    }

    /// Returns the parts of `self` not covered by `other`, ascending.
    ///
    /// The result holds zero pieces when `other` covers `self`, one when
    /// they are disjoint or overlap on one side, and two when `other` sits
    /// strictly inside `self`.
    pub fn exclude_intersection(&self, other: &Self) -> Vec<Self> {
        if other.end < self.start || other.start > self.end {
            return vec![*self];
        }
        let mut remainder = Vec::with_capacity(2);
        if other.start > self.start {
            remainder.push(Self::new(self.start, other.start - 1));
        }
        if other.end < self.end {
            remainder.push(Self::new(other.end + 1, self.end));
        }
        remainder
    }

    /// Removes every range of `sorted_others` from `self`.
    ///
    /// `sorted_others` must be ordered ascending. Stops as soon as nothing
    /// remains.
    pub fn exclude_intersections(&self, sorted_others: &[Self]) -> Vec<Self> {
        let mut remaining = vec![*self];
        for other in sorted_others {
            if other.start > self.end {
                break;
            }
            remaining = remaining
                .iter()
                .flat_map(|range| range.exclude_intersection(other))
                .collect();
            if remaining.is_empty() {
                break;
            }
        }
        remaining
    }

    /// Lazily iterates over the ids of the range.
    pub fn ids(&self) -> core::ops::RangeInclusive<Accession> {
        self.start..=self.end
    }

    /// Materializes the ids of the range.
    ///
    /// Only call this on ranges about to be handed out; pooled ranges can be
    /// arbitrarily large.
    pub fn to_ids(&self) -> Vec<Accession> {
        self.ids().collect()
    }

    /// Merges individual ids into the minimal list of disjoint, ascending,
    /// contiguous ranges. Duplicates are ignored.
    ///
    /// # Example
    /// ```
    /// use accession::Range;
    ///
    /// let ranges = Range::coalesce([5, 1, 2, 3, 9, 2]);
    /// assert_eq!(ranges, vec![Range::new(1, 3), Range::new(5, 5), Range::new(9, 9)]);
    /// ```
    pub fn coalesce<I>(ids: I) -> Vec<Self>
    where
        I: IntoIterator<Item = Accession>,
    {
        let mut ids: Vec<Accession> = ids.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();

        let mut ranges: Vec<Self> = Vec::new();
        for id in ids {
            match ranges.last_mut() {
                Some(last) if last.end + 1 == id => last.end = id,
                _ => ranges.push(Self::single(id)),
            }
        }
        ranges
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}
