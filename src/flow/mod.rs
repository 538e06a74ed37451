//! Flow reconstruction
//!
//! Rebuilds bidirectional TCP connections from packet digests, runs each one
//! through the connection state machine and classifies how it ended.
//!
//! # Example
//!
//! ```
//! use flowrecon::core::Packet;
//! use flowrecon::flow::{FlowConfig, FlowTracker};
//!
//! let mut tracker = FlowTracker::new(FlowConfig::default());
//! tracker.process(&Packet::new(0, ("10.0.0.1", 40000), ("10.0.0.2", 80), 0x02, 60));
//! tracker.finish();
//!
//! let flows = tracker.drain_completed();
//! assert_eq!(flows[0].close_type.map(|c| c.as_str()), Some("invalid"));
//! ```

pub mod aggregates;
pub mod classifier;
pub mod state_machine;
pub mod stats;
pub mod sweeper;
pub mod table;
pub mod tracker;

pub use aggregates::{AggregateReport, TrafficAggregates};
pub use state_machine::{transition, Segment, Transition};
pub use sweeper::TimeoutSweeper;
pub use table::{FinalizeCause, FlowTable};
pub use tracker::FlowTracker;

use serde::{Deserialize, Serialize};

// Re-export core flow types
pub use crate::core::{CloseType, Direction, Flow, FlowRecord, FlowState, InvalidReason};

/// Microseconds per second, the unit of packet timestamps
pub const MICROS_PER_SECOND: i64 = 1_000_000;

/// Configuration for flow tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Idle time after which a flow is force-finalized (seconds)
    pub flow_timeout_seconds: u64,

    /// Maximum concurrent flows, split across shards. 0 disables the limit.
    pub table_size: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            flow_timeout_seconds: 300,         // 5 minutes
            table_size: 1_000_000,
        }
    }
}

impl FlowConfig {
    /// Flow timeout in packet-timestamp units
    pub fn timeout_us(&self) -> i64 {
        i64::try_from(self.flow_timeout_seconds)
            .unwrap_or(i64::MAX)
            .saturating_mul(MICROS_PER_SECOND)
    }

    /// Per-shard slice of the table limit
    pub fn shard_table_size(&self, shards: usize) -> usize {
        if self.table_size == 0 {
            return 0;
        }
        self.table_size.div_ceil(shards.max(1))
    }
}

/// Flow tracking statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerStats {
    /// Packets processed
    pub packets_processed: u64,
    /// Bytes processed
    pub bytes_processed: u64,
    /// Total flows created
    pub flows_created: u64,
    /// Flows drained after finalization
    pub flows_completed: u64,
    /// Flows finalized by the timeout sweep
    pub flows_expired: u64,
    /// Flows finalized because the table was full
    pub flows_evicted: u64,
    /// Packets older than their flow's last activity
    pub out_of_order: u64,
    /// Current active flows
    pub active_flows: usize,
}

impl TrackerStats {
    /// Sum counters from another shard
    pub fn merge(&mut self, other: &TrackerStats) {
        self.packets_processed += other.packets_processed;
        self.bytes_processed += other.bytes_processed;
        self.flows_created += other.flows_created;
        self.flows_completed += other.flows_completed;
        self.flows_expired += other.flows_expired;
        self.flows_evicted += other.flows_evicted;
        self.out_of_order += other.out_of_order;
        self.active_flows += other.active_flows;
    }
}
