//! Shard workers for flow reconstruction
//!
//! ## Architecture
//!
//! - `WorkerPool`: owns N `ShardWorker`s and routes each packet by a hash of
//!   its connection key, so every packet of a flow lands on the same shard
//! - `ShardWorker`: a `FlowTracker` behind its own lock
//!
//! Shards share nothing while a batch is processed. The only cross-shard
//! step is merging drained flows into one `(start_time, id)` ordered list.

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::core::flow::{ConnectionKey, Flow};
use crate::core::packet::Packet;
use crate::flow::{FlowConfig, FlowTracker, TrackerStats};
use crate::parallel::{parallel_map, ParallelStats};

/// One disjoint slice of the flow table
pub struct ShardWorker {
    index: usize,
    tracker: Mutex<FlowTracker>,
}

impl ShardWorker {
    fn new(index: usize, config: &FlowConfig, table_size: usize) -> Self {
        Self {
            index,
            tracker: Mutex::new(FlowTracker::with_table_size(config, table_size)),
        }
    }

    /// Process this shard's part of a batch, then sweep against the global
    /// watermark. Runs even with an empty bucket so every shard sweeps.
    fn run(&self, packets: Vec<Packet>, watermark: Option<i64>) -> usize {
        let mut tracker = self.tracker.lock();
        for pkt in &packets {
            tracker.process(pkt);
        }
        let swept = watermark.map_or(0, |now| tracker.sweep(now));
        trace!(shard = self.index, packets = packets.len(), swept, "shard batch done");
        packets.len()
    }

    pub fn active_flows(&self) -> usize {
        self.tracker.lock().active_flows()
    }
}

/// Worker pool that partitions the key space across shards
pub struct WorkerPool {
    shards: Vec<ShardWorker>,
    stats: ParallelStats,
}

impl WorkerPool {
    /// Create a pool of `workers` shards (at least one). The table limit is
    /// split evenly between them.
    pub fn new(config: &FlowConfig, workers: usize) -> Self {
        let workers = workers.max(1);
        let table_size = config.shard_table_size(workers);
        let shards = (0..workers)
            .map(|i| ShardWorker::new(i, config, table_size))
            .collect();

        debug!("Worker pool ready (shards={}, table_size_per_shard={})", workers, table_size);

        Self {
            shards,
            stats: ParallelStats::new(),
        }
    }

    /// Number of shards
    pub fn num_workers(&self) -> usize {
        self.shards.len()
    }

    /// Process an ordered batch. Per-key order is preserved because the
    /// partition keeps packets in their batch order within each bucket.
    pub fn process_batch(&self, packets: Vec<Packet>, watermark: Option<i64>) {
        let n = self.shards.len();
        let mut buckets: Vec<Vec<Packet>> = (0..n).map(|_| Vec::new()).collect();
        for pkt in packets {
            let (key, _) = ConnectionKey::resolve(&pkt);
            buckets[key.shard(n)].push(pkt);
        }

        let work: Vec<(&ShardWorker, Vec<Packet>)> = self.shards.iter().zip(buckets).collect();
        let stats = &self.stats;
        let processed: Vec<usize> = parallel_map(work, |(shard, bucket)| {
            if bucket.is_empty() {
                stats.inc_idle();
            }
            shard.run(bucket, watermark)
        });

        self.stats.add_packets(processed.iter().sum::<usize>() as u64);
        self.stats.inc_batches();
    }

    /// Finalize every remaining flow in every shard
    pub fn finish(&self) -> usize {
        let shards: Vec<&ShardWorker> = self.shards.iter().collect();
        parallel_map(shards, |shard| shard.tracker.lock().finish())
            .into_iter()
            .sum()
    }

    /// Drain finalized flows from all shards, merged by `(start_time, id)`
    pub fn drain_completed(&self) -> Vec<Flow> {
        let mut flows: Vec<Flow> = self
            .shards
            .iter()
            .flat_map(|shard| shard.tracker.lock().drain_completed())
            .collect();
        flows.sort_by_key(|f| (f.start_time, f.id));
        flows
    }

    /// Finalized flows waiting to be drained
    pub fn pending_completed(&self) -> usize {
        self.shards.iter().map(|s| s.tracker.lock().pending_completed()).sum()
    }

    /// Active flows across all shards
    pub fn active_flows(&self) -> usize {
        self.shards.iter().map(|s| s.active_flows()).sum()
    }

    /// Tracker statistics summed across shards
    pub fn stats(&self) -> TrackerStats {
        let mut total = TrackerStats::default();
        for shard in &self.shards {
            total.merge(shard.tracker.lock().stats());
        }
        total
    }

    /// Dispatch counters
    pub fn parallel_stats(&self) -> &ParallelStats {
        &self.stats
    }
}
