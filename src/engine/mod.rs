//! Flow reconstruction engine
//!
//! Batches ingested packets, fans them out to the shard workers and collects
//! finalized flows.
//!
//! # Architecture
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌──────────────┐
//! │   Ingest    │────▶│    Batch     │────▶│   Workers    │
//! │  (filters)  │     │ (sort, ids)  │     │  (N shards)  │
//! └─────────────┘     └──────────────┘     └──────────────┘
//!                                                │
//!                                                ▼
//!                                         ┌──────────────┐
//!                                         │    Drain     │
//!                                         │(merge, chunk)│
//!                                         └──────────────┘
//! ```

pub mod pipeline;
pub mod stream;
pub mod workers;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::{CloseType, FlowRecord, InvalidReason, Packet, RawPacketRecord};
use crate::flow::{AggregateReport, FlowConfig, TrafficAggregates};
use crate::parallel::resolve_workers;

pub use pipeline::{FilterConfig, IngestCounters, IngestPipeline, IpMap};
pub use stream::{run_stream, StreamOutcome};
pub use workers::{ShardWorker, WorkerPool};

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of shard workers (0 = one per CPU)
    pub workers: usize,
    /// Packets per processed batch
    pub batch_size: usize,
    /// Flow records per emitted chunk
    pub chunk_size: usize,
    /// Bounded input channel depth, in batches
    pub channel_depth: usize,
    /// Collect per-IP and per-pair traffic aggregates
    pub collect_aggregates: bool,
    /// Streaming only: flush a partial batch and drain after this long
    pub flush_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 0, // Auto-detect
            batch_size: 10_000,
            chunk_size: 1_000,
            channel_depth: 16,
            collect_aggregates: false,
            flush_interval_ms: 1_000,
        }
    }
}

/// One unit of engine input
#[derive(Debug, Clone)]
pub enum Ingest {
    /// Typed packet
    Packet(Packet),
    /// Loosely typed row
    Record(RawPacketRecord),
    /// JSON object on one line
    Line(String),
}

/// End-of-run summary, the one place anomalies surface
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub rows_read: u64,
    pub malformed: u64,
    pub non_tcp: u64,
    pub unkeyed: u64,
    pub filtered: u64,
    pub over_limit: u64,
    pub packets_processed: u64,
    pub bytes_processed: u64,
    pub flows_created: u64,
    pub flows_completed: u64,
    pub flows_active: usize,
    pub flows_expired: u64,
    pub flows_evicted: u64,
    pub out_of_order: u64,
    pub batches: u64,
    pub workers: usize,
    pub close_types: BTreeMap<CloseType, u64>,
    pub invalid_reasons: BTreeMap<InvalidReason, u64>,
    /// Earliest and latest packet timestamp processed
    pub first_timestamp: Option<i64>,
    pub last_timestamp: Option<i64>,
}

/// Main flow reconstruction engine
pub struct FlowEngine {
    config: EngineConfig,
    pipeline: IngestPipeline,
    pool: WorkerPool,
    /// Current, not yet processed batch
    pending: Vec<Packet>,
    aggregates: Option<TrafficAggregates>,
    /// Largest timestamp processed
    watermark: Option<i64>,
    first_timestamp: Option<i64>,
    close_types: BTreeMap<CloseType, u64>,
    invalid_reasons: BTreeMap<InvalidReason, u64>,
    flows_emitted: u64,
}

impl FlowEngine {
    /// Create a new engine
    pub fn new(flow: FlowConfig, engine: EngineConfig, filter: FilterConfig) -> Self {
        let workers = resolve_workers(engine.workers);
        info!(
            "Initializing flow engine (workers={}, batch_size={}, timeout={}s, table_size={})",
            workers, engine.batch_size, flow.flow_timeout_seconds, flow.table_size
        );

        Self {
            pool: WorkerPool::new(&flow, workers),
            pipeline: IngestPipeline::new(filter),
            pending: Vec::with_capacity(engine.batch_size.min(100_000)),
            aggregates: engine.collect_aggregates.then(TrafficAggregates::new),
            watermark: None,
            first_timestamp: None,
            close_types: BTreeMap::new(),
            invalid_reasons: BTreeMap::new(),
            flows_emitted: 0,
            config: engine,
        }
    }

    /// Engine with default settings and a fixed worker count
    pub fn with_workers(workers: usize) -> Self {
        let engine = EngineConfig { workers, ..Default::default() };
        Self::new(FlowConfig::default(), engine, FilterConfig::default())
    }

    /// Map integer-encoded addresses back through `map`
    pub fn with_ip_map(mut self, map: IpMap) -> Self {
        self.pipeline.set_ip_map(map);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Feed one input. Processes a batch when `batch_size` packets are pending.
    pub fn push(&mut self, input: Ingest) {
        let admitted = match input {
            Ingest::Packet(pkt) => self.pipeline.admit_packet(pkt),
            Ingest::Record(raw) => self.pipeline.admit_record(raw),
            Ingest::Line(line) => self.pipeline.admit_line(&line),
        };
        if let Some(pkt) = admitted {
            self.pending.push(pkt);
            if self.pending.len() >= self.config.batch_size.max(1) {
                self.process_batch();
            }
        }
    }

    pub fn push_packet(&mut self, pkt: Packet) {
        self.push(Ingest::Packet(pkt));
    }

    pub fn push_line(&mut self, line: &str) {
        self.push(Ingest::Line(line.to_string()));
    }

    /// Feed many packets
    pub fn extend<I: IntoIterator<Item = Packet>>(&mut self, packets: I) {
        for pkt in packets {
            self.push_packet(pkt);
        }
    }

    /// The row limit has been reached, further input is only counted
    pub fn input_exhausted(&self) -> bool {
        self.pipeline.exhausted()
    }

    /// Process the pending partial batch, if any
    pub fn flush(&mut self) {
        if !self.pending.is_empty() {
            self.process_batch();
        }
    }

    /// Order, dispatch and sweep the pending batch
    fn process_batch(&mut self) {
        let mut batch = std::mem::take(&mut self.pending);
        self.pipeline.order_batch(&mut batch);

        if let (Some(first), Some(last)) = (batch.first(), batch.last()) {
            self.first_timestamp = Some(self.first_timestamp.map_or(first.timestamp, |t| t.min(first.timestamp)));
            self.watermark = Some(self.watermark.map_or(last.timestamp, |w| w.max(last.timestamp)));
        }

        if let Some(aggregates) = self.aggregates.as_mut() {
            for pkt in &batch {
                aggregates.record(pkt);
            }
        }

        debug!(packets = batch.len(), watermark = ?self.watermark, "processing batch");
        self.pool.process_batch(batch, self.watermark);
    }

    /// Take all finalized flows, ordered by `(start_time, id)`
    pub fn drain_completed(&mut self) -> Vec<FlowRecord> {
        let records: Vec<FlowRecord> = self
            .pool
            .drain_completed()
            .iter()
            .map(|flow| flow.to_record())
            .collect();

        for record in &records {
            *self.close_types.entry(record.close_type).or_default() += 1;
            if let Some(reason) = record.invalid_reason {
                *self.invalid_reasons.entry(reason).or_default() += 1;
            }
        }
        self.flows_emitted += records.len() as u64;
        if !records.is_empty() {
            debug!(flows = records.len(), "drained completed flows");
        }
        records
    }

    /// Drain finalized flows split into chunks of `chunk_size`
    pub fn drain_chunks(&mut self) -> Vec<Vec<FlowRecord>> {
        let records = self.drain_completed();
        into_chunks(records, self.config.chunk_size)
    }

    /// End of stream: process what is pending, finalize every open flow and
    /// return everything not yet drained
    pub fn finish(&mut self) -> Vec<FlowRecord> {
        self.flush();
        let finalized = self.pool.finish();
        let records = self.drain_completed();
        info!(
            "Flow engine finished ({} flows finalized at end of stream, {} flows total)",
            finalized, self.flows_emitted
        );
        records
    }

    /// [`finish`](Self::finish), split into chunks of `chunk_size`
    pub fn finish_chunks(&mut self) -> Vec<Vec<FlowRecord>> {
        let records = self.finish();
        into_chunks(records, self.config.chunk_size)
    }

    /// Run a whole input through the engine
    pub fn run<I: IntoIterator<Item = Packet>>(mut self, packets: I) -> (Vec<FlowRecord>, RunSummary) {
        let mut out = Vec::new();
        for pkt in packets {
            self.push_packet(pkt);
            out.extend(self.drain_completed());
        }
        out.extend(self.finish());
        let summary = self.summary();
        (out, summary)
    }

    /// Largest timestamp processed
    pub fn watermark(&self) -> Option<i64> {
        self.watermark
    }

    /// Flows still open
    pub fn active_flows(&self) -> usize {
        self.pool.active_flows()
    }

    /// Aggregate snapshot, when collection is enabled
    pub fn aggregates(&self) -> Option<AggregateReport> {
        self.aggregates.as_ref().map(TrafficAggregates::report)
    }

    /// Counters so far
    pub fn summary(&self) -> RunSummary {
        let ingest = self.pipeline.counters();
        let tracker = self.pool.stats();
        RunSummary {
            rows_read: ingest.rows_read,
            malformed: ingest.malformed,
            non_tcp: ingest.non_tcp,
            unkeyed: ingest.unkeyed,
            filtered: ingest.filtered,
            over_limit: ingest.over_limit,
            packets_processed: tracker.packets_processed,
            bytes_processed: tracker.bytes_processed,
            flows_created: tracker.flows_created,
            flows_completed: self.flows_emitted,
            flows_active: tracker.active_flows,
            flows_expired: tracker.flows_expired,
            flows_evicted: tracker.flows_evicted,
            out_of_order: tracker.out_of_order,
            batches: self.pool.parallel_stats().get_batches(),
            workers: self.pool.num_workers(),
            close_types: self.close_types.clone(),
            invalid_reasons: self.invalid_reasons.clone(),
            first_timestamp: self.first_timestamp,
            last_timestamp: self.watermark,
        }
    }
}

/// Split records into consecutive chunks of at most `chunk_size`
fn into_chunks(mut records: Vec<FlowRecord>, chunk_size: usize) -> Vec<Vec<FlowRecord>> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::with_capacity(records.len().div_ceil(chunk_size));
    while !records.is_empty() {
        let rest = records.split_off(records.len().min(chunk_size));
        chunks.push(std::mem::replace(&mut records, rest));
    }
    chunks
}
