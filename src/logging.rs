//! Logging setup.
//!
//! The teacher crate gates a handful of `println!` calls behind a
//! `verbose` feature. We give the allocator core a real `tracing`
//! subscriber instead, configured from the two environment variables the
//! spec calls out in §6 ("log-level, log-file"): `PMALLOC_LOG` (an
//! `EnvFilter` directive string, e.g. `debug` or
//! `pmalloc_core::backend=trace`) and `PMALLOC_LOG_FILE` (a path; stderr
//! when unset).
//!
//! `init()` is idempotent and safe to call from every `Pool::open` — only
//! the first call installs a subscriber.

use std::fs::OpenOptions;
use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

const LOG_ENV: &str = "PMALLOC_LOG";
const LOG_FILE_ENV: &str = "PMALLOC_LOG_FILE";

/// Installs a global `tracing` subscriber on first call. Later calls are
/// no-ops, matching how a library should behave when the host application
/// has already installed its own subscriber.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));

        let file = std::env::var(LOG_FILE_ENV).ok().and_then(|path| {
            OpenOptions::new().create(true).append(true).open(&path).ok()
        });

        let installed = match file {
            Some(file) => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(move || file.try_clone().expect("log file clone"))
                .try_init(),
            None => tracing_subscriber::fmt().with_env_filter(filter).try_init(),
        };

        // A subscriber set up by the host application wins; we don't
        // consider that an error.
        let _ = installed;
    });
}
