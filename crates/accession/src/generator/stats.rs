use portable_atomic::{AtomicU64, Ordering};

/// Counters describing how a generator's reservations went.
///
/// Readable without taking the generator lock.
#[derive(Debug, Default)]
pub struct GeneratorStats {
    reservations: AtomicU64,
    conflicts: AtomicU64,
    exhausted_backoffs: AtomicU64,
}

impl GeneratorStats {
    /// Blocks successfully reserved by this instance.
    pub fn reservations(&self) -> u64 {
        self.reservations.load(Ordering::Relaxed)
    }

    /// Reservation attempts that lost a serialization race.
    pub fn conflicts(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }

    /// Backoff rounds that ran out before a reservation succeeded.
    pub fn exhausted_backoffs(&self) -> u64 {
        self.exhausted_backoffs.load(Ordering::Relaxed)
    }

    pub(crate) fn record_reservation(&self) {
        self.reservations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_exhausted_backoff(&self) {
        self.exhausted_backoffs.fetch_add(1, Ordering::Relaxed);
    }
}
