use crate::{Accession, Range};

/// A contiguous slice of a category's id space leased to one generator
/// instance.
///
/// `start..=end` never changes once the block is reserved. `last_committed`
/// is the watermark: every id in `[start, last_committed]` is durably stored.
/// It starts at `start - 1` and the block is full once it reaches `end`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Block {
    pub category: String,
    pub instance_id: String,
    pub start: Accession,
    pub end: Accession,
    pub last_committed: Accession,
}

impl Block {
    /// Creates an empty block of `size` ids beginning at `start`.
    ///
    /// # Panics
    /// Panics if `size` is zero or the block does not fit the id space; see
    /// [`Self::try_new`].
    pub fn new(
        category: impl Into<String>,
        instance_id: impl Into<String>,
        start: Accession,
        size: u64,
    ) -> Self {
        match Self::try_new(category, instance_id, start, size) {
            Some(block) => block,
            None => panic!("block of {size} ids at {start} does not fit the id space"),
        }
    }

    /// Creates an empty block of `size` ids beginning at `start`.
    ///
    /// Returns `None` if `size` is zero, if the last id would pass
    /// [`Accession::MAX`], or if `start` leaves no room for the initial
    /// watermark `start - 1`.
    pub fn try_new(
        category: impl Into<String>,
        instance_id: impl Into<String>,
        start: Accession,
        size: u64,
    ) -> Option<Self> {
        let span = Accession::try_from(size.checked_sub(1)?).ok()?;
        Some(Self {
            category: category.into(),
            instance_id: instance_id.into(),
            start,
            end: start.checked_add(span)?,
            last_committed: start.checked_sub(1)?,
        })
    }

    pub const fn range(&self) -> Range {
        Range::new(self.start, self.end)
    }

    pub const fn size(&self) -> u64 {
        self.range().size()
    }

    pub const fn is_full(&self) -> bool {
        self.last_committed == self.end
    }

    /// The first id of the block that would follow this one, or `None` if
    /// this block ends at [`Accession::MAX`].
    pub const fn next_start(&self) -> Option<Accession> {
        self.end.checked_add(1)
    }

    /// The ids of this block not yet covered by the watermark, if any.
    pub const fn uncommitted(&self) -> Option<Range> {
        if self.is_full() {
            None
        } else {
            let first = if self.last_committed + 1 > self.start {
                self.last_committed + 1
            } else {
                self.start
            };
            Some(Range::new(first, self.end))
        }
    }
}
