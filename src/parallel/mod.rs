//! Parallel processing helpers for sharded flow reconstruction
//!
//! Uses rayon when the `parallel` feature is enabled and falls back to a
//! sequential loop otherwise. Callers get the same results either way.

use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Actual number of workers for a configured count (0 = auto-detect)
pub fn resolve_workers(configured: usize) -> usize {
    if configured == 0 {
        #[cfg(feature = "parallel")]
        {
            num_cpus::get().max(1)
        }
        #[cfg(not(feature = "parallel"))]
        {
            1
        }
    } else {
        configured
    }
}

/// Thread-safe counters shared by the shard workers
#[derive(Debug, Default)]
pub struct ParallelStats {
    /// Total packets dispatched across all shards
    pub packets_dispatched: AtomicU64,
    /// Total batches processed
    pub batches_processed: AtomicU64,
    /// Shard runs that received no packets but still swept
    pub idle_shard_runs: AtomicU64,
}

impl ParallelStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add_packets(&self, count: u64) {
        self.packets_dispatched.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_batches(&self) {
        self.batches_processed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_idle(&self) {
        self.idle_shard_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_packets(&self) -> u64 {
        self.packets_dispatched.load(Ordering::Relaxed)
    }

    pub fn get_batches(&self) -> u64 {
        self.batches_processed.load(Ordering::Relaxed)
    }

    pub fn get_idle(&self) -> u64 {
        self.idle_shard_runs.load(Ordering::Relaxed)
    }
}

/// Map items in parallel, preserving input order in the output
#[cfg(feature = "parallel")]
pub fn parallel_map<T, F, R>(items: Vec<T>, map_fn: F) -> Vec<R>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Send + Sync,
{
    items.into_par_iter().map(map_fn).collect()
}

/// Map items in order (non-parallel fallback)
#[cfg(not(feature = "parallel"))]
pub fn parallel_map<T, F, R>(items: Vec<T>, map_fn: F) -> Vec<R>
where
    F: Fn(T) -> R,
{
    items.into_iter().map(map_fn).collect()
}
