//! Traffic aggregates over all flow-bound packets
//!
//! Per-IP and per-IP-pair volume plus a flag-label histogram. Independent of
//! flow state, so it can be fed from the ingest path in arrival order.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::core::Packet;

/// Traffic sent and received by one address
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpStats {
    pub ip: String,
    pub sent_packets: u64,
    pub recv_packets: u64,
    pub sent_bytes: u64,
    pub recv_bytes: u64,
    pub first_ts: i64,
    pub last_ts: i64,
}

/// Traffic between two addresses, `ip1 < ip2`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpPairStats {
    pub ip1: String,
    pub ip2: String,
    pub packet_count: u64,
    /// ip1 -> ip2
    pub a_to_b_packets: u64,
    pub b_to_a_packets: u64,
    pub a_to_b_bytes: u64,
    pub b_to_a_bytes: u64,
    pub first_ts: i64,
    pub last_ts: i64,
}

/// Accumulates traffic aggregates
#[derive(Debug, Default)]
pub struct TrafficAggregates {
    ips: HashMap<String, IpStats>,
    pairs: HashMap<(String, String), IpPairStats>,
    flags: BTreeMap<String, u64>,
    packets: u64,
}

fn touch_window(first: &mut i64, last: &mut i64, ts: i64, fresh: bool) {
    if fresh {
        *first = ts;
        *last = ts;
    } else {
        *first = (*first).min(ts);
        *last = (*last).max(ts);
    }
}

impl TrafficAggregates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account one packet
    pub fn record(&mut self, pkt: &Packet) {
        self.packets += 1;
        let bytes = u64::from(pkt.length);
        let ts = pkt.timestamp;

        let fresh = !self.ips.contains_key(&pkt.src_ip);
        let src = self.ips.entry(pkt.src_ip.clone()).or_insert_with(|| IpStats {
            ip: pkt.src_ip.clone(),
            ..Default::default()
        });
        src.sent_packets += 1;
        src.sent_bytes += bytes;
        touch_window(&mut src.first_ts, &mut src.last_ts, ts, fresh);

        let fresh = !self.ips.contains_key(&pkt.dst_ip);
        let dst = self.ips.entry(pkt.dst_ip.clone()).or_insert_with(|| IpStats {
            ip: pkt.dst_ip.clone(),
            ..Default::default()
        });
        dst.recv_packets += 1;
        dst.recv_bytes += bytes;
        touch_window(&mut dst.first_ts, &mut dst.last_ts, ts, fresh);

        let forward = pkt.src_ip <= pkt.dst_ip;
        let (ip1, ip2) = if forward {
            (pkt.src_ip.clone(), pkt.dst_ip.clone())
        } else {
            (pkt.dst_ip.clone(), pkt.src_ip.clone())
        };
        let pair_key = (ip1, ip2);
        let fresh = !self.pairs.contains_key(&pair_key);
        let pair = self.pairs.entry(pair_key).or_insert_with_key(|(ip1, ip2)| IpPairStats {
            ip1: ip1.clone(),
            ip2: ip2.clone(),
            ..Default::default()
        });
        pair.packet_count += 1;
        if forward {
            pair.a_to_b_packets += 1;
            pair.a_to_b_bytes += bytes;
        } else {
            pair.b_to_a_packets += 1;
            pair.b_to_a_bytes += bytes;
        }
        touch_window(&mut pair.first_ts, &mut pair.last_ts, ts, fresh);

        *self.flags.entry(pkt.flags.label()).or_default() += 1;
    }

    /// Packets accounted so far
    pub fn packets(&self) -> u64 {
        self.packets
    }

    pub fn ip(&self, ip: &str) -> Option<&IpStats> {
        self.ips.get(ip)
    }

    pub fn pair(&self, a: &str, b: &str) -> Option<&IpPairStats> {
        let key = if a <= b {
            (a.to_string(), b.to_string())
        } else {
            (b.to_string(), a.to_string())
        };
        self.pairs.get(&key)
    }

    /// Flag-label histogram
    pub fn flag_histogram(&self) -> &BTreeMap<String, u64> {
        &self.flags
    }

    /// Snapshot in a stable order: IPs by total packets descending, pairs by
    /// packet count descending, ties broken by address.
    pub fn report(&self) -> AggregateReport {
        let mut ips: Vec<IpStats> = self.ips.values().cloned().collect();
        ips.sort_by(|a, b| {
            (b.sent_packets + b.recv_packets)
                .cmp(&(a.sent_packets + a.recv_packets))
                .then_with(|| a.ip.cmp(&b.ip))
        });

        let mut pairs: Vec<IpPairStats> = self.pairs.values().cloned().collect();
        pairs.sort_by(|a, b| {
            b.packet_count
                .cmp(&a.packet_count)
                .then_with(|| (&a.ip1, &a.ip2).cmp(&(&b.ip1, &b.ip2)))
        });

        AggregateReport {
            total_packets: self.packets,
            ip_stats: ips,
            ip_pairs: pairs,
            flag_stats: self.flags.clone(),
        }
    }
}

/// Serializable aggregate snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateReport {
    pub total_packets: u64,
    pub ip_stats: Vec<IpStats>,
    pub ip_pairs: Vec<IpPairStats>,
    pub flag_stats: BTreeMap<String, u64>,
}
