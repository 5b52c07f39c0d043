use crate::{Accession, store::StoreError};

/// A result type defaulting to the crate's [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// All error variants that `accession` can emit.
///
/// Transient serialization conflicts raised by a [`BlockStore`] during block
/// reservation are retried internally and never reach this type.
///
/// [`BlockStore`]: crate::store::BlockStore
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// `commit` or `release` was called with an id that is not currently
    /// pending.
    ///
    /// This covers double confirmation, double release and operating on an
    /// id that was never issued. It means the allocator and the record store
    /// disagree, so the whole call is rejected and no state changes.
    #[error("accession {id} is not pending")]
    NotPending { id: Accession },

    /// `poll_next` was asked for more ids than the allocator holds.
    ///
    /// The generator always reserves before polling, so observing this
    /// outside of direct allocator use indicates a reservation loop bug.
    #[error("insufficient capacity: requested {requested}, available {available}")]
    InsufficientCapacity { requested: u64, available: u64 },

    /// No block size / first value is configured for the category.
    #[error("category `{category}` is not configured")]
    CategoryNotConfigured { category: String },

    /// A failed save could not be matched to a pre-existing record.
    ///
    /// The element collided on insert yet no row with its hash exists, so
    /// data vanished between two supposedly atomic steps. Never retried.
    #[error("integrity fault: no stored record for failed hashes {hashes:?}")]
    IntegrityFault { hashes: Vec<String> },

    /// A configuration value is out of range.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// A non-transient failure reported by a block or record store.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The generator lock was **poisoned** by a panicking thread.
    ///
    /// When the `parking-lot` feature is enabled, mutexes do **not** poison,
    /// so this variant is not available.
    #[cfg_attr(docsrs, doc(cfg(not(feature = "parking-lot"))))]
    #[cfg(not(feature = "parking-lot"))]
    #[error("generator lock poisoned")]
    LockPoisoned,
}

#[cfg(not(feature = "parking-lot"))]
use crate::mutex::{MutexGuard, PoisonError};
#[cfg(not(feature = "parking-lot"))]
impl<T> From<PoisonError<MutexGuard<'_, T>>> for Error {
    fn from(_: PoisonError<MutexGuard<'_, T>>) -> Self {
        Self::LockPoisoned
    }
}
