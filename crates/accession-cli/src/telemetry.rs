//! Structured logging for the simulation driver.
//!
//! Filtering rules come from `RUST_LOG` and default to `info`. Without the
//! `tracing` feature this is a no-op and the binary only prints its summary.

pub fn init_tracing() {
    #[cfg(feature = "tracing")]
    {
        use tracing_subscriber::{EnvFilter, fmt};

        fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
            .with_target(false)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_timer(fmt::time::ChronoLocal::rfc_3339())
            .init();
    }
}
