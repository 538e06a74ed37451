//! Flow hash table with finalization
//!
//! Owns in-progress flows keyed by connection key plus the set of finalized
//! flows waiting to be drained. A flow leaves the active map exactly once,
//! through [`FlowTable::finalize`].
//!
//! An activity index ordered by `(last_activity, id)` sits next to the map, so
//! both eviction and the timeout sweep start from the idlest flow instead of
//! scanning the table.

use std::collections::{BTreeMap, HashMap};

use tracing::trace;

use crate::core::flow::{ConnectionKey, Flow, KeySide};
use super::classifier;

/// Why a flow was finalized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeCause {
    /// Closed or aborted, released once nothing more can belong to it
    Terminal,
    /// Idle past the flow timeout
    Timeout,
    /// Input exhausted
    EndOfStream,
    /// Table full, least recently active flow pushed out
    Evicted,
}

/// Table statistics
#[derive(Debug, Clone, Default)]
pub struct TableStats {
    pub evictions: u64,
    pub expired: u64,
}

/// Hash table for flow storage
pub struct FlowTable {
    /// Active flows
    flows: HashMap<ConnectionKey, Flow>,
    /// `(last_activity, id)` of every active flow
    activity: BTreeMap<(i64, u64), ConnectionKey>,
    /// Finalized, not yet drained
    completed: Vec<Flow>,
    /// Maximum active flows, 0 for unbounded
    max_size: usize,
    pub stats: TableStats,
}

impl FlowTable {
    /// Create a new flow table
    pub fn new(max_size: usize) -> Self {
        let capacity = if max_size == 0 { 1024 } else { max_size.min(100_000) };
        Self {
            flows: HashMap::with_capacity(capacity),
            activity: BTreeMap::new(),
            completed: Vec::new(),
            max_size,
            stats: TableStats::default(),
        }
    }

    /// Get the flow for `key` or create it with the sender as initiator.
    /// Returns the flow and whether it was newly created.
    ///
    /// Callers that move a flow's `last_activity` must report it through
    /// [`touch`](Self::touch).
    pub fn lookup_or_create(
        &mut self,
        key: ConnectionKey,
        side: KeySide,
        id: u64,
        timestamp: i64,
    ) -> (&mut Flow, bool) {
        let is_new = !self.flows.contains_key(&key);
        if is_new {
            if self.max_size > 0 && self.flows.len() >= self.max_size {
                self.evict_oldest();
            }
            self.activity.insert((timestamp, id), key.clone());
        }

        let flow = self
            .flows
            .entry(key)
            .or_insert_with_key(|k| Flow::new(id, k.clone(), side, timestamp));
        (flow, is_new)
    }

    /// Get a flow by key
    pub fn get(&self, key: &ConnectionKey) -> Option<&Flow> {
        self.flows.get(key)
    }

    /// Re-index a flow whose last activity moved from `before` to `after`
    pub fn touch(&mut self, id: u64, before: i64, after: i64) {
        if before == after {
            return;
        }
        if let Some(key) = self.activity.remove(&(before, id)) {
            self.activity.insert((after, id), key);
        }
    }

    /// Classify the flow and move it to the completed set.
    /// Returns false if no active flow has this key.
    pub fn finalize(&mut self, key: &ConnectionKey, cause: FinalizeCause) -> bool {
        let Some(mut flow) = self.flows.remove(key) else {
            return false;
        };
        self.activity.remove(&(flow.last_activity, flow.id));
        classifier::finalize(&mut flow);

        match cause {
            FinalizeCause::Timeout => self.stats.expired += 1,
            FinalizeCause::Evicted => self.stats.evictions += 1,
            FinalizeCause::Terminal | FinalizeCause::EndOfStream => {}
        }

        trace!(
            flow_id = flow.id,
            key = %flow.key,
            state = %flow.state,
            close_type = ?flow.close_type,
            ?cause,
            "flow finalized"
        );
        self.completed.push(flow);
        true
    }

    /// Finalize every active flow. Returns how many were finalized.
    pub fn finalize_all(&mut self, cause: FinalizeCause) -> usize {
        let keys: Vec<ConnectionKey> = self.flows.keys().cloned().collect();
        keys.iter().filter(|key| self.finalize(key, cause)).count()
    }

    /// Keys of flows last active strictly before `cutoff`, idlest first
    pub fn idle_before(&self, cutoff: i64) -> Vec<ConnectionKey> {
        self.activity
            .range(..(cutoff, 0))
            .map(|(_, key)| key.clone())
            .collect()
    }

    /// Take all finalized flows
    pub fn drain_completed(&mut self) -> Vec<Flow> {
        std::mem::take(&mut self.completed)
    }

    /// Current active flow count
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Finalized flows waiting to be drained
    pub fn completed_len(&self) -> usize {
        self.completed.len()
    }

    /// Force-finalize the least recently active flow
    fn evict_oldest(&mut self) {
        let oldest = self.activity.values().next().cloned();
        if let Some(key) = oldest {
            self.finalize(&key, FinalizeCause::Evicted);
        }
    }
}
