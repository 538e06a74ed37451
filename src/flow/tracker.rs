//! Flow tracker - single-shard reconstruction engine
//!
//! Coordinates the flow table, state machine, stats and timeout sweep for
//! one disjoint slice of the key space.
//!
//! A flow that closes or aborts stays in the table so trailing packets (data
//! in flight behind a RST, duplicate final ACKs) still land in it. It leaves
//! when it goes idle past the timeout, at end of stream, or when a new SYN
//! reuses the key.

use tracing::{debug, info, trace};

use crate::core::flow::{ConnectionKey, Flow};
use crate::core::packet::{FlagKind, Packet};
use super::state_machine::{self, Segment};
use super::sweeper::TimeoutSweeper;
use super::table::{FinalizeCause, FlowTable};
use super::{stats, FlowConfig, TrackerStats};

/// Main flow tracking engine
pub struct FlowTracker {
    /// Flow table
    table: FlowTable,
    sweeper: TimeoutSweeper,
    /// Tracker statistics
    stats: TrackerStats,
}

impl FlowTracker {
    /// Create a tracker that owns the whole key space
    pub fn new(config: FlowConfig) -> Self {
        info!(
            "Initializing flow tracker (table_size={}, timeout={}s)",
            config.table_size, config.flow_timeout_seconds
        );
        Self::with_table_size(&config, config.table_size)
    }

    /// Create a tracker for one shard with its own table limit
    pub fn with_table_size(config: &FlowConfig, table_size: usize) -> Self {
        Self {
            table: FlowTable::new(table_size),
            sweeper: TimeoutSweeper::new(config.timeout_us()),
            stats: TrackerStats::default(),
        }
    }

    /// Feed one packet. Returns the id of the flow it was attributed to.
    ///
    /// The packet always counts towards exactly one flow, even when it
    /// violates the expected sequence.
    pub fn process(&mut self, pkt: &Packet) -> u64 {
        self.stats.packets_processed += 1;
        self.stats.bytes_processed += u64::from(pkt.length);

        let (key, side) = ConnectionKey::resolve(pkt);
        self.retire_stale(&key, pkt);

        let (flow, is_new) = self.table.lookup_or_create(key, side, pkt.id, pkt.timestamp);
        if is_new {
            self.stats.flows_created += 1;
        }
        let last_activity = flow.last_activity;

        let direction = flow.direction(side);
        let seg = Segment::new(pkt.kind(), direction, pkt.length > 0);

        let t = if pkt.timestamp < flow.last_activity {
            self.stats.out_of_order += 1;
            debug!(
                flow_id = flow.id,
                ts = pkt.timestamp,
                last_activity = flow.last_activity,
                "out-of-order packet"
            );
            state_machine::out_of_order(flow.state, &seg)
        } else {
            state_machine::transition(flow.state, flow.first_closer, &seg)
        };

        stats::record(flow, pkt, direction, t.effects.phase);

        let fx = t.effects;
        flow.establishment_complete |= fx.establish;
        flow.data_transfer_started |= fx.data;
        flow.closing_started |= fx.closing_started;
        if flow.first_closer.is_none() {
            flow.first_closer = fx.first_closer;
        }
        if flow.violation.is_none() {
            flow.violation = fx.violation;
        }

        if flow.state != t.next {
            trace!(flow_id = flow.id, from = %flow.state, to = %t.next, kind = %seg.kind, "transition");
        }
        flow.state = t.next;

        let (id, touched) = (flow.id, flow.last_activity);
        self.table.touch(id, last_activity, touched);
        self.refresh_stats();
        id
    }

    /// Finalize the flow under `key` if `pkt` cannot continue it: the flow
    /// was idle past the timeout, or it is over and `pkt` opens a new
    /// connection.
    fn retire_stale(&mut self, key: &ConnectionKey, pkt: &Packet) {
        let Some(flow) = self.table.get(key) else {
            return;
        };
        let cause = if self.sweeper.is_expired(flow, pkt.timestamp) {
            TimeoutSweeper::cause_for(Some(flow))
        } else if flow.state.is_terminal() && pkt.kind() == FlagKind::Syn {
            FinalizeCause::Terminal
        } else {
            return;
        };
        debug!(flow_id = flow.id, state = %flow.state, ?cause, ts = pkt.timestamp, "retiring flow before new packet");
        self.table.finalize(key, cause);
    }

    /// Finalize flows idle past the timeout relative to `now`
    pub fn sweep(&mut self, now: i64) -> usize {
        let swept = self.sweeper.sweep(&mut self.table, now);
        self.refresh_stats();
        swept
    }

    /// End of stream: finalize every remaining flow
    pub fn finish(&mut self) -> usize {
        let count = self.table.finalize_all(FinalizeCause::EndOfStream);
        if count > 0 {
            debug!("Finalized {} flows at end of stream", count);
        }
        self.refresh_stats();
        count
    }

    /// Take finalized flows (for export)
    pub fn drain_completed(&mut self) -> Vec<Flow> {
        let completed = self.table.drain_completed();
        self.stats.flows_completed += completed.len() as u64;
        completed
    }

    /// Get active flow count
    pub fn active_flows(&self) -> usize {
        self.table.len()
    }

    /// Finalized flows not yet drained
    pub fn pending_completed(&self) -> usize {
        self.table.completed_len()
    }

    /// Get tracker statistics
    pub fn stats(&self) -> &TrackerStats {
        &self.stats
    }

    fn refresh_stats(&mut self) {
        self.stats.active_flows = self.table.len();
        self.stats.flows_expired = self.table.stats.expired;
        self.stats.flows_evicted = self.table.stats.evictions;
    }
}
