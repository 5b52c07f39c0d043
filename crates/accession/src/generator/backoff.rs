use crate::BackoffConfig;
use core::time::Duration;
use rand::Rng;

/// Abstracts how the generator waits between contended reservation
/// attempts.
///
/// This lets tests observe backoff without real sleeps.
pub trait Sleeper {
    fn sleep(&self, dur: Duration);
}

/// Blocks the calling thread for the whole delay.
///
/// This is the default used by [`MonotonicGenerator::new`].
///
/// [`MonotonicGenerator::new`]: crate::MonotonicGenerator::new
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadSleep;

impl Sleeper for ThreadSleep {
    fn sleep(&self, dur: Duration) {
        std::thread::sleep(dur);
    }
}

/// Yields to the OS scheduler instead of sleeping.
///
/// Retries faster at the cost of a tighter polling loop, which only pays off
/// when few instances contend for the same category.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadYield;

impl Sleeper for ThreadYield {
    fn sleep(&self, _dur: Duration) {
        std::thread::yield_now();
    }
}

impl<T: Sleeper + ?Sized> Sleeper for &T {
    fn sleep(&self, dur: Duration) {
        (**self).sleep(dur);
    }
}

/// One round of exponential backoff with jitter.
#[derive(Debug)]
pub(crate) struct Backoff {
    next_ms: u64,
    max_ms: u64,
}

impl Backoff {
    pub(crate) const fn new(config: &BackoffConfig) -> Self {
        Self {
            next_ms: config.initial_delay_ms,
            max_ms: config.max_delay_ms,
        }
    }

    /// Delay before the next attempt, or `None` once the window is used up.
    ///
    /// The base delay doubles on every call. Up to half a millisecond per
    /// base millisecond of jitter is added so contending instances drift
    /// apart.
    pub(crate) fn next_delay(&mut self) -> Option<Duration> {
        if self.next_ms == 0 || self.next_ms > self.max_ms {
            return None;
        }
        let base = self.next_ms;
        self.next_ms = base.saturating_mul(2);

        let jitter_us = rand::rng().random_range(0..base.saturating_mul(500));
        Some(Duration::from_millis(base) + Duration::from_micros(jitter_us))
    }
}
