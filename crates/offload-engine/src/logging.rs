//! Process-wide `tracing` subscriber.
//!
//! Library code only emits events; binaries and tests call
//! `ensure_initialized()` to see them. The filter comes from `OFFLOAD_LOG`
//! (same syntax as `RUST_LOG`), falling back to `info`.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

pub const LOG_ENV: &str = "OFFLOAD_LOG";

pub fn ensure_initialized() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
        // Another subscriber may already be installed by the host binary.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_thread_names(true)
            .with_writer(std::io::stderr)
            .try_init();
    });
}
