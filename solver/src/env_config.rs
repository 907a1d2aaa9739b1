//! Shared environment configuration for the engine's binaries.
//!
//! Consolidates the `SDDP_LOG`, `SDDP_THREADS` (fallback `RAYON_NUM_THREADS`)
//! and `SDDP_OUTPUT` reads.

use std::path::PathBuf;

use tracing_subscriber::EnvFilter;

/// Install a compact `tracing` subscriber filtered by `SDDP_LOG`
/// (default `info`). Safe to call more than once.
pub fn init_logging() {
    let filter = EnvFilter::try_from_env("SDDP_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
}

/// Thread count from `SDDP_THREADS` (fallback `RAYON_NUM_THREADS`), if set.
pub fn thread_count() -> Option<usize> {
    std::env::var("SDDP_THREADS")
        .or_else(|_| std::env::var("RAYON_NUM_THREADS"))
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|&n| n > 0)
}

/// Build the rayon global pool from [`thread_count`] (rayon's default when
/// unset). Tolerates an already-initialized pool. Returns the thread count.
pub fn init_rayon_threads() -> usize {
    let mut builder = rayon::ThreadPoolBuilder::new();
    if let Some(n) = thread_count() {
        builder = builder.num_threads(n);
    }
    if builder.build_global().is_err() {
        tracing::debug!("rayon pool already initialized");
    }
    let threads = rayon::current_num_threads();
    tracing::info!(threads, "rayon threads");
    threads
}

/// Export path from `SDDP_OUTPUT`, or `default`.
pub fn output_path(default: &str) -> PathBuf {
    std::env::var("SDDP_OUTPUT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}
