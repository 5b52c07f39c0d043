//! Persistence seams of the allocator.
//!
//! The allocator core owns no storage. It talks to two collaborators:
//!
//! - a [`BlockStore`], the only point of cross-instance coordination, which
//!   appends blocks to a category's id space and keeps their watermarks;
//! - a [`RecordStore`], which holds accessioned objects indexed by hash and
//!   is only consulted by the commit pipeline and by startup recovery.
//!
//! In-memory implementations of both live in this module. They honour the
//! same isolation and atomicity contracts a database-backed store must.

mod memory;

pub use memory::*;

use crate::{Accession, Block, Range, commit::AccessionRecord};
use std::sync::Arc;

/// Failures reported by a [`BlockStore`] or [`RecordStore`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    /// A serializable transaction was aborted because a concurrent
    /// transaction touched the same data. Safe to retry.
    #[error("serialization conflict while reserving a block for `{category}`")]
    SerializationConflict { category: String },

    /// A uniqueness constraint rejected the write. Nothing was written.
    #[error("duplicate key: {key}")]
    DuplicateKey { key: String },

    /// The category's id space has no room for another block of `size`
    /// ids. Retrying does not help.
    #[error("no room for a block of {size} ids left in `{category}`")]
    CategoryExhausted { category: String, size: u64 },

    /// A watermark update referenced a block the store does not hold.
    #[error("unknown block starting at {start} in `{category}`")]
    UnknownBlock { category: String, start: Accession },

    /// Any other backend failure.
    #[error("backend failure: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether the failure is a transient serialization conflict.
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::SerializationConflict { .. })
    }
}

/// Shared, durable registry of leased blocks.
pub trait BlockStore {
    /// Appends a block of `size` ids directly after the category's highest
    /// block, or at `first_value` if the category has none.
    ///
    /// Must run under serializable isolation: two instances reading the same
    /// tail concurrently would otherwise append overlapping blocks. A lost
    /// race is reported as [`StoreError::SerializationConflict`]; a block
    /// that would run past [`Accession::MAX`] as
    /// [`StoreError::CategoryExhausted`].
    fn reserve_next_block(
        &self,
        category: &str,
        instance_id: &str,
        size: u64,
        first_value: Accession,
    ) -> Result<Block, StoreError>;

    /// Returns the instance's blocks whose watermark has not reached their
    /// end, ordered by start.
    fn find_unfinished_blocks(
        &self,
        category: &str,
        instance_id: &str,
    ) -> Result<Vec<Block>, StoreError>;

    /// Saves watermark changes of already reserved blocks.
    fn persist(&self, blocks: &[Block]) -> Result<(), StoreError>;
}

/// Durable storage of accessioned objects.
pub trait RecordStore<M> {
    /// Inserts every record or none of them.
    ///
    /// A uniqueness violation on hash or accession must be reported as
    /// [`StoreError::DuplicateKey`] and leave zero partial writes.
    fn insert_all(&self, records: &[AccessionRecord<M>]) -> Result<(), StoreError>;

    /// Returns the stored records matching any of `hashes`.
    fn find_by_hashes(&self, hashes: &[&str]) -> Result<Vec<AccessionRecord<M>>, StoreError>;

    /// Returns the stored accessions that fall inside any of `ranges`.
    fn find_accessions_in_ranges(&self, ranges: &[Range]) -> Result<Vec<Accession>, StoreError>;
}

macro_rules! forward_block_store {
    ($($ty:ty),*) => {$(
        impl<T: BlockStore + ?Sized> BlockStore for $ty {
            fn reserve_next_block(
                &self,
                category: &str,
                instance_id: &str,
                size: u64,
                first_value: Accession,
            ) -> Result<Block, StoreError> {
                (**self).reserve_next_block(category, instance_id, size, first_value)
            }

            fn find_unfinished_blocks(
                &self,
                category: &str,
                instance_id: &str,
            ) -> Result<Vec<Block>, StoreError> {
                (**self).find_unfinished_blocks(category, instance_id)
            }

            fn persist(&self, blocks: &[Block]) -> Result<(), StoreError> {
                (**self).persist(blocks)
            }
        }
    )*};
}

macro_rules! forward_record_store {
    ($($ty:ty),*) => {$(
        impl<M, T: RecordStore<M> + ?Sized> RecordStore<M> for $ty {
            fn insert_all(&self, records: &[AccessionRecord<M>]) -> Result<(), StoreError> {
                (**self).insert_all(records)
            }

            fn find_by_hashes(
                &self,
                hashes: &[&str],
            ) -> Result<Vec<AccessionRecord<M>>, StoreError> {
                (**self).find_by_hashes(hashes)
            }

            fn find_accessions_in_ranges(
                &self,
                ranges: &[Range],
            ) -> Result<Vec<Accession>, StoreError> {
                (**self).find_accessions_in_ranges(ranges)
            }
        }
    )*};
}

forward_block_store!(&T, Arc<T>);
forward_record_store!(&T, Arc<T>);
