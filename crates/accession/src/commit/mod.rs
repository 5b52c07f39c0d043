//! Batch persistence with conflict isolation.
//!
//! A batch of freshly allocated records is inserted all at once. When the
//! record store rejects it on a uniqueness constraint, the batch is bisected
//! until every colliding record is isolated on its own; everything else is
//! saved. The outcome is a [`SaveResponse`] that the generator turns into
//! commits and releases via [`MonotonicGenerator::post_save`].
//!
//! [`MonotonicGenerator::post_save`]: crate::MonotonicGenerator::post_save


use crate::{Accession, Error, Result, store::RecordStore, store::StoreError};
use std::collections::{BTreeSet, HashSet};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// An object together with its accession and content hash.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AccessionRecord<M> {
    pub accession: Accession,
    pub hash: String,
    pub payload: M,
}

impl<M> AccessionRecord<M> {
    pub fn new(accession: Accession, hash: impl Into<String>, payload: M) -> Self {
        Self {
            accession,
            hash: hash.into(),
            payload,
        }
    }
}

/// Outcome of one batch persistence attempt.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SaveResponse {
    saved: BTreeSet<Accession>,
    save_failed: BTreeSet<Accession>,
    attempts: usize,
}

impl SaveResponse {
    pub fn new(
        saved: impl IntoIterator<Item = Accession>,
        save_failed: impl IntoIterator<Item = Accession>,
    ) -> Self {
        Self {
            saved: saved.into_iter().collect(),
            save_failed: save_failed.into_iter().collect(),
            attempts: 0,
        }
    }

    /// Accessions now durably stored.
    pub fn saved(&self) -> &BTreeSet<Accession> {
        &self.saved
    }

    /// Accessions whose record collided with an existing one.
    pub fn save_failed(&self) -> &BTreeSet<Accession> {
        &self.save_failed
    }

    /// Number of insert transactions issued for the batch.
    pub fn attempts(&self) -> usize {
        self.attempts
    }
}

/// Inserts allocated batches into a [`RecordStore`], isolating collisions.
pub struct CommitPipeline<R> {
    store: R,
}

impl<R> CommitPipeline<R> {
    pub const fn new(store: R) -> Self {
        Self { store }
    }

    pub const fn store(&self) -> &R {
        &self.store
    }

    /// Persists `batch`, bisecting around uniqueness failures.
    ///
    /// Sub-ranges are tried from an explicit work-stack, lowest half first.
    /// A sub-range that inserts is saved as a whole; one that collides is
    /// split at its midpoint, down to single records which are then marked
    /// failed. With `C` collisions among `N` records this takes
    /// `O(C * log(N / C) + N)` inserts in the worst case: every node of the
    /// bisection tree is tried once, `2N - 1` when all records collide.
    ///
    /// Every insert must be atomic: a rejected sub-range has to leave no
    /// partial writes, or retrying an overlapping half would double insert.
    ///
    /// # Errors
    /// Any store failure other than [`StoreError::DuplicateKey`] aborts the
    /// batch. Some sub-ranges may already be saved at that point; the caller
    /// decides what to do with the allocated ids.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip_all, fields(size = batch.len())))]
    pub fn save<M>(&self, batch: &[AccessionRecord<M>]) -> Result<SaveResponse>
    where
        R: RecordStore<M>,
    {
        let mut response = SaveResponse::default();
        if batch.is_empty() {
            return Ok(response);
        }

        let mut work = vec![(0, batch.len())];
        while let Some((lo, hi)) = work.pop() {
            let slice = &batch[lo..hi];
            response.attempts += 1;
            match self.store.insert_all(slice) {
                Ok(()) => response.saved.extend(slice.iter().map(|r| r.accession)),
                Err(StoreError::DuplicateKey { .. }) if slice.len() > 1 => {
                    let mid = lo + (hi - lo) / 2;
                    work.push((mid, hi));
                    work.push((lo, mid));
                }
                Err(StoreError::DuplicateKey { .. }) => {
                    response.save_failed.insert(slice[0].accession);
                }
                Err(e) => return Err(e.into()),
            }
        }

        #[cfg(feature = "tracing")]
        {
            if !response.save_failed.is_empty() {
                tracing::debug!(
                    saved = response.saved.len(),
                    failed = response.save_failed.len(),
                    attempts = response.attempts,
                    "isolated colliding records"
                );
            }
        }

        Ok(response)
    }

    /// Finds the stored records that made each failed element collide.
    ///
    /// A failed element means another writer already stored an object with
    /// the same hash, so that row is the answer for it.
    ///
    /// # Errors
    /// Returns [`Error::IntegrityFault`] if any failed hash has no stored
    /// record. That is fatal and must not be retried.
    pub fn resolve_failures<M>(
        &self,
        batch: &[AccessionRecord<M>],
        response: &SaveResponse,
    ) -> Result<Vec<AccessionRecord<M>>>
    where
        R: RecordStore<M>,
    {
        let failed: Vec<&str> = batch
            .iter()
            .filter(|r| response.save_failed.contains(&r.accession))
            .map(|r| r.hash.as_str())
            .collect();
        if failed.is_empty() {
            return Ok(Vec::new());
        }

        let existing = self.store.find_by_hashes(&failed)?;
        let found: HashSet<&str> = existing.iter().map(|r| r.hash.as_str()).collect();
        let missing: Vec<String> = failed
            .iter()
            .filter(|hash| !found.contains(*hash))
            .map(|hash| (*hash).to_owned())
            .collect();
        if !missing.is_empty() {
            #[cfg(feature = "tracing")]
            tracing::error!(?missing, "failed records have no stored counterpart");
            return Err(Error::IntegrityFault { hashes: missing });
        }

        Ok(existing)
    }
}
