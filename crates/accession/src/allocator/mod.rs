//! Per-instance allocator state.
//!
//! [`AllocatorState`] tracks the blocks an instance owns and, for every id in
//! them, whether it is still available, handed out (pending), confirmed but
//! waiting for earlier ids, or folded into its block's watermark. It is a
//! plain value mutated through `&mut self`; [`MonotonicGenerator`] provides
//! the lock that turns it into a monitor.
//!
//! [`MonotonicGenerator`]: crate::MonotonicGenerator


use crate::{Accession, Block, Error, Range, Result};
use std::collections::{BTreeMap, BTreeSet, HashSet};

#[cfg(feature = "tracing")]
use tracing::instrument;

#[derive(Debug, Default)]
pub struct AllocatorState {
    /// Owned, not yet full blocks keyed by start. The first entry is the
    /// oldest block and the only one whose watermark can advance.
    assigned: BTreeMap<Accession, Block>,
    available: BTreeSet<Range>,
    available_count: u64,
    pending: HashSet<Accession>,
    confirmed: BTreeSet<Accession>,
}

impl AllocatorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly reserved or resumed block.
    ///
    /// Only the ids above the block's watermark become available, so a
    /// resumed block never reissues what it already proved durable. Full
    /// blocks are ignored.
    pub fn add_block(&mut self, block: Block) {
        let Some(uncommitted) = block.uncommitted() else {
            return;
        };
        self.push_available(uncommitted);
        self.assigned.insert(block.start, block);
    }

    /// Whether at least `n` ids can be polled without reserving. O(1).
    pub fn has_capacity(&self, n: u64) -> bool {
        self.available_count >= n
    }

    /// Takes up to `n` ids from the lowest available range.
    ///
    /// A range larger than `n` is split and its remainder requeued. Returned
    /// ids become pending. Fewer than `n` ids are returned when the lowest
    /// range is smaller; poll again for the rest.
    ///
    /// # Errors
    /// Returns [`Error::InsufficientCapacity`] unless [`Self::has_capacity`]
    /// holds for `n`.
    pub fn poll_next(&mut self, n: u64) -> Result<Vec<Accession>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        if !self.has_capacity(n) {
            return Err(Error::InsufficientCapacity {
                requested: n,
                available: self.available_count,
            });
        }

        let Some(lowest) = self.available.pop_first() else {
            return Err(Error::InsufficientCapacity {
                requested: n,
                available: 0,
            });
        };
        let taken = match lowest.split(n) {
            Some((taken, rest)) => {
                self.available.insert(rest);
                taken
            }
            None => lowest,
        };

        self.available_count -= taken.size();
        let ids = taken.to_ids();
        self.pending.extend(ids.iter().copied());
        Ok(ids)
    }

    /// Confirms that `ids` are durably stored.
    ///
    /// The ids join the confirmed set and the oldest block's watermark is
    /// advanced over every contiguous run that now starts right after it.
    /// Confirmations that leave a gap wait until the gap closes. Returns the
    /// blocks whose watermark moved, for the caller to persist.
    ///
    /// # Errors
    /// Returns [`Error::NotPending`] if any id is not pending or appears
    /// twice. Nothing changes in that case.
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip_all, fields(count = ids.len())))]
    pub fn commit(&mut self, ids: &[Accession]) -> Result<Vec<Block>> {
        self.check_pending(ids)?;
        for id in ids {
            self.pending.remove(id);
            self.confirmed.insert(*id);
        }
        Ok(self.fold_confirmed())
    }

    /// Returns `ids` to the pool.
    ///
    /// Released ids are reissued before any higher id that was never handed
    /// out.
    ///
    /// # Errors
    /// Returns [`Error::NotPending`] if any id is not pending or appears
    /// twice. Nothing changes in that case.
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip_all, fields(count = ids.len())))]
    pub fn release(&mut self, ids: &[Accession]) -> Result<()> {
        self.check_pending(ids)?;
        for id in ids {
            self.pending.remove(id);
        }
        for range in Range::coalesce(ids.iter().copied()) {
            self.push_available(range);
        }
        Ok(())
    }

    /// Commits `saved` and releases `failed` as one step.
    ///
    /// Both lists are checked before anything changes, so a rejected call
    /// leaves the state untouched. Returns the blocks whose watermark moved.
    ///
    /// # Errors
    /// Returns [`Error::NotPending`] if any id of either list is not
    /// pending, appears twice, or appears in both lists.
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip_all, fields(saved = saved.len(), failed = failed.len())))]
    pub fn post_save(&mut self, saved: &[Accession], failed: &[Accession]) -> Result<Vec<Block>> {
        self.check_pending(saved.iter().chain(failed))?;
        for id in saved {
            self.pending.remove(id);
            self.confirmed.insert(*id);
        }
        for id in failed {
            self.pending.remove(id);
        }
        for range in Range::coalesce(failed.iter().copied()) {
            self.push_available(range);
        }
        Ok(self.fold_confirmed())
    }

    /// Fast-forwards the state past ids already found in the record store.
    ///
    /// Meant for startup, before anything is handed out. Ids outside the
    /// assigned blocks, or at or below their block's watermark, are ignored.
    /// The rest are removed from the available pool and folded like
    /// [`Self::commit`], which repairs a watermark whose last write was lost
    /// in a crash. Returns the blocks whose watermark moved.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip_all, fields(count = durable_ids.len())))]
    pub fn recover_state(&mut self, durable_ids: &[Accession]) -> Vec<Block> {
        let relevant: Vec<Accession> = durable_ids
            .iter()
            .copied()
            .filter(|id| self.owning_block(*id).is_some_and(|b| *id > b.last_committed))
            .filter(|id| !self.pending.contains(id))
            .collect();
        if relevant.is_empty() {
            return Vec::new();
        }

        let durable = Range::coalesce(relevant.iter().copied());
        let previous = core::mem::take(&mut self.available);
        self.available_count = 0;
        for range in previous {
            for piece in range.exclude_intersections(&durable) {
                self.push_available(piece);
            }
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(recovered = relevant.len(), "excluded durable ids from the pool");

        self.confirmed.extend(relevant);
        self.fold_confirmed()
    }

    /// Available ranges, ascending.
    pub fn available_ranges(&self) -> Vec<Range> {
        self.available.iter().copied().collect()
    }

    pub fn available_count(&self) -> u64 {
        self.available_count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, id: Accession) -> bool {
        self.pending.contains(&id)
    }

    /// Ids confirmed but still waiting for an earlier id.
    pub fn confirmed_waiting(&self) -> Vec<Accession> {
        self.confirmed.iter().copied().collect()
    }

    /// Owned blocks that are not full yet, oldest first.
    pub fn assigned_blocks(&self) -> Vec<Block> {
        self.assigned.values().cloned().collect()
    }

    fn push_available(&mut self, range: Range) {
        self.available_count += range.size();
        self.available.insert(range);
    }

    fn owning_block(&self, id: Accession) -> Option<&Block> {
        self.assigned
            .range(..=id)
            .next_back()
            .map(|(_, block)| block)
            .filter(|block| block.range().contains(id))
    }

    fn check_pending<'a, I>(&self, ids: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a Accession>,
    {
        let mut seen = HashSet::new();
        for id in ids {
            if !self.pending.contains(id) || !seen.insert(*id) {
                return Err(Error::NotPending { id: *id });
            }
        }
        Ok(())
    }

    fn fold_confirmed(&mut self) -> Vec<Block> {
        let mut changed = Vec::new();

        while let Some(mut oldest) = self.assigned.first_entry() {
            let block = oldest.get_mut();
            let mut advanced = false;
            while !block.is_full() && self.confirmed.first() == Some(&(block.last_committed + 1)) {
                self.confirmed.pop_first();
                block.last_committed += 1;
                advanced = true;
            }
            if advanced {
                changed.push(block.clone());
            }
            if !block.is_full() {
                break;
            }

            #[cfg(feature = "tracing")]
            tracing::debug!(start = block.start, end = block.end, "retiring full block");
            oldest.remove();
        }

        changed
    }
}
