mod backoff;
mod monotonic;
mod stats;
#[cfg(test)]
mod tests;

pub use backoff::*;
pub use monotonic::*;
pub use stats::*;
