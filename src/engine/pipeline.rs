//! Ingest pipeline
//!
//! Turns raw input rows into packets the flow engine accepts:
//!
//! 1. Decode - JSON line or `RawPacketRecord` into a `Packet` (malformed rows skipped)
//! 2. Limit - optional cap on rows read
//! 3. Protocol - only TCP is tracked
//! 4. Addresses - integer-encoded addresses mapped back through an optional [`IpMap`]
//! 5. Keying - both ports and both addresses must be known
//! 6. Selection - optional IP allow-set, both endpoints must be selected
//!
//! Every rejected row bumps exactly one counter. Accepted packets are later
//! stable-sorted per batch and given their ingestion ordinals.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::{Packet, RawPacketRecord, RecordError};

/// Malformed rows logged at warn level before dropping to debug
const MALFORMED_WARN_LIMIT: u64 = 10;

/// Input filtering configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Skip rows whose protocol is present and not TCP
    pub tcp_only: bool,
    /// Keep only packets between these addresses (active with 2 or more)
    pub selected_ips: Vec<String>,
    /// Stop accepting after this many rows
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_records: Option<u64>,
    /// JSON file mapping addresses to the integers they are encoded as
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_map: Option<PathBuf>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            tcp_only: true,
            selected_ips: Vec::new(),
            max_records: None,
            ip_map: None,
        }
    }
}

/// Reverse lookup for integer-encoded addresses.
///
/// The file is a JSON object of `"address": integer` pairs. Purely numeric
/// addresses in the input are replaced by the matching address; numbers
/// without an entry are kept as they are.
#[derive(Debug, Clone, Default)]
pub struct IpMap {
    by_value: HashMap<u64, String>,
}

impl IpMap {
    /// Load a mapping file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read IP map: {}", path.display()))?;
        let forward: HashMap<String, u64> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse IP map: {}", path.display()))?;

        info!("Loaded {} IP mappings from {}", forward.len(), path.display());
        Ok(Self::from_pairs(forward))
    }

    /// Build from `(address, integer)` pairs
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (String, u64)>,
    {
        Self {
            by_value: pairs.into_iter().map(|(addr, value)| (value, addr)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.by_value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_value.is_empty()
    }

    /// Address for a purely numeric input address, if mapped
    pub fn resolve(&self, addr: &str) -> Option<&str> {
        if addr.is_empty() || !addr.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let value = addr.parse::<u64>().ok()?;
        self.by_value.get(&value).map(String::as_str)
    }

    fn apply(&self, addr: &mut String) {
        if let Some(mapped) = self.resolve(addr) {
            *addr = mapped.to_string();
        }
    }
}

/// Row counters, one bucket per outcome
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestCounters {
    pub rows_read: u64,
    pub accepted: u64,
    pub malformed: u64,
    pub non_tcp: u64,
    pub unkeyed: u64,
    pub filtered: u64,
    pub over_limit: u64,
}

impl IngestCounters {
    /// Rows dropped for any reason
    pub fn skipped(&self) -> u64 {
        self.malformed + self.non_tcp + self.unkeyed + self.filtered + self.over_limit
    }
}

/// Converts and filters input rows
pub struct IngestPipeline {
    filter: FilterConfig,
    selected: Option<HashSet<String>>,
    ip_map: Option<IpMap>,
    counters: IngestCounters,
    next_id: u64,
}

impl IngestPipeline {
    pub fn new(filter: FilterConfig) -> Self {
        let selected = (filter.selected_ips.len() >= 2)
            .then(|| filter.selected_ips.iter().map(|ip| ip.trim().to_string()).collect());
        Self {
            filter,
            selected,
            ip_map: None,
            counters: IngestCounters::default(),
            next_id: 0,
        }
    }

    /// Map integer-encoded addresses of every admitted packet
    pub fn set_ip_map(&mut self, map: IpMap) {
        self.ip_map = Some(map);
    }

    /// Decode and admit one JSON line. Blank lines are ignored without
    /// being counted as rows.
    pub fn admit_line(&mut self, line: &str) -> Option<Packet> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        if !self.take_row() {
            return None;
        }
        match RawPacketRecord::from_json(line).and_then(Packet::try_from) {
            Ok(pkt) => self.filter_packet(pkt),
            Err(e) => {
                self.malformed(&e);
                None
            }
        }
    }

    /// Admit one loosely typed record
    pub fn admit_record(&mut self, raw: RawPacketRecord) -> Option<Packet> {
        if !self.take_row() {
            return None;
        }
        match Packet::try_from(raw) {
            Ok(pkt) => self.filter_packet(pkt),
            Err(e) => {
                self.malformed(&e);
                None
            }
        }
    }

    /// Admit an already typed packet
    pub fn admit_packet(&mut self, pkt: Packet) -> Option<Packet> {
        if !self.take_row() {
            return None;
        }
        self.filter_packet(pkt)
    }

    /// Stable-sort a batch by timestamp and assign ingestion ordinals.
    /// Equal timestamps keep their arrival order.
    pub fn order_batch(&mut self, batch: &mut [Packet]) {
        batch.sort_by_key(|p| p.timestamp);
        for pkt in batch.iter_mut() {
            pkt.id = self.next_id;
            self.next_id += 1;
        }
    }

    /// The row limit has been reached
    pub fn exhausted(&self) -> bool {
        self.filter
            .max_records
            .is_some_and(|max| self.counters.rows_read >= max)
    }

    pub fn counters(&self) -> &IngestCounters {
        &self.counters
    }

    fn take_row(&mut self) -> bool {
        if self.exhausted() {
            self.counters.over_limit += 1;
            return false;
        }
        self.counters.rows_read += 1;
        true
    }

    fn malformed(&mut self, err: &RecordError) {
        self.counters.malformed += 1;
        if self.counters.malformed <= MALFORMED_WARN_LIMIT {
            warn!(row = self.counters.rows_read, "Skipping malformed row: {}", err);
        } else {
            debug!(row = self.counters.rows_read, "Skipping malformed row: {}", err);
        }
    }

    fn filter_packet(&mut self, mut pkt: Packet) -> Option<Packet> {
        if self.filter.tcp_only && !pkt.is_tcp() {
            self.counters.non_tcp += 1;
            return None;
        }
        if let Some(map) = &self.ip_map {
            map.apply(&mut pkt.src_ip);
            map.apply(&mut pkt.dst_ip);
        }
        if !pkt.is_keyable() {
            self.counters.unkeyed += 1;
            debug!(src = %pkt.src_ip, dst = %pkt.dst_ip, "Skipping row without full 4-tuple");
            return None;
        }
        if let Some(selected) = &self.selected {
            if !(selected.contains(&pkt.src_ip) && selected.contains(&pkt.dst_ip)) {
                self.counters.filtered += 1;
                return None;
            }
        }
        self.counters.accepted += 1;
        Some(pkt)
    }
}
