//! Idle-flow timeout sweep
//!
//! Time is the stream watermark (largest packet timestamp processed), never
//! the wall clock, so replays sweep identically.

use tracing::debug;

use crate::core::Flow;
use super::table::{FinalizeCause, FlowTable};

/// Finalizes flows idle for longer than the configured timeout
#[derive(Debug, Clone, Copy)]
pub struct TimeoutSweeper {
    /// Timeout in microseconds
    timeout_us: i64,
}

impl TimeoutSweeper {
    pub fn new(timeout_us: i64) -> Self {
        Self { timeout_us: timeout_us.max(0) }
    }

    /// Strictly older than the timeout
    pub fn is_expired(&self, flow: &Flow, now: i64) -> bool {
        flow.idle(now) > self.timeout_us
    }

    /// Finalize every expired flow. Returns how many were finalized.
    /// Sweeping an already swept table is a no-op.
    ///
    /// Flows that already closed or aborted are released as `Terminal`, only
    /// flows cut off mid-conversation count as expired.
    pub fn sweep(&self, table: &mut FlowTable, now: i64) -> usize {
        let cutoff = now.saturating_sub(self.timeout_us);
        let expired = table.idle_before(cutoff);
        let count = expired
            .iter()
            .filter(|key| {
                let cause = Self::cause_for(table.get(key));
                table.finalize(key, cause)
            })
            .count();

        if count > 0 {
            debug!(expired = count, active = table.len(), watermark = now, "timeout sweep");
        }
        count
    }

    /// How an idle flow leaves the table
    pub fn cause_for(flow: Option<&Flow>) -> FinalizeCause {
        match flow {
            Some(flow) if flow.state.is_terminal() => FinalizeCause::Terminal,
            _ => FinalizeCause::Timeout,
        }
    }
}
