//! End-to-end flow reconstruction properties

use flowrecon::core::{ConnectionKey, TcpFlags};
use flowrecon::engine::{EngineConfig, FilterConfig, FlowEngine, Ingest, IpMap};
use flowrecon::flow::FlowConfig;
use flowrecon::{CloseType, FlowRecord, FlowState, InvalidReason, Packet, RunSummary};

const SECOND: i64 = 1_000_000;
const TIMEOUT_S: u64 = 300;

const SYN: u8 = TcpFlags::SYN;
const SYN_ACK: u8 = TcpFlags::SYN | TcpFlags::ACK;
const ACK: u8 = TcpFlags::ACK;
const PSH_ACK: u8 = TcpFlags::PSH | TcpFlags::ACK;
const FIN: u8 = TcpFlags::FIN;
const FIN_ACK: u8 = TcpFlags::FIN | TcpFlags::ACK;
const RST: u8 = TcpFlags::RST;

fn engine(workers: usize, batch_size: usize) -> FlowEngine {
    let config = EngineConfig {
        workers,
        batch_size,
        ..Default::default()
    };
    let flow = FlowConfig {
        flow_timeout_seconds: TIMEOUT_S,
        ..Default::default()
    };
    FlowEngine::new(flow, config, FilterConfig::default())
}

fn run(workers: usize, batch_size: usize, packets: Vec<Packet>) -> (Vec<FlowRecord>, RunSummary) {
    engine(workers, batch_size).run(packets)
}

/// Packets for one connection, `true` means client to server
fn conversation(client: (&str, u16), server: (&str, u16), start: i64, steps: &[(u8, bool, u32)]) -> Vec<Packet> {
    steps
        .iter()
        .enumerate()
        .map(|(i, &(flags, from_client, len))| {
            let ts = start + i as i64 * 1_000;
            if from_client {
                Packet::new(ts, client, server, flags, len)
            } else {
                Packet::new(ts, server, client, flags, len)
            }
        })
        .collect()
}

fn happy_path(client: (&str, u16), server: (&str, u16), start: i64) -> Vec<Packet> {
    conversation(
        client,
        server,
        start,
        &[
            (SYN, true, 60),
            (SYN_ACK, false, 60),
            (ACK, true, 52),
            (PSH_ACK, true, 400),
            (FIN, true, 52),
            (FIN_ACK, false, 52),
            (ACK, true, 52),
        ],
    )
}

/// Deterministic mixed workload
fn workload(connections: u32, seed: u64) -> Vec<Packet> {
    let mut state = seed;
    let mut next = move || {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        state >> 33
    };

    let mut packets = Vec::new();
    for i in 0..connections {
        let client_ip = format!("10.0.{}.{}", (i / 250) % 250, i % 250 + 1);
        let client = (client_ip.as_str(), 20000 + (i % 40000) as u16);
        let server = ("172.16.0.1", [80u16, 443, 22, 8080][(next() % 4) as usize]);
        let start = (next() % 600) as i64 * SECOND + (next() % 1000) as i64;

        let steps: &[(u8, bool, u32)] = match next() % 7 {
            0 => &[(SYN, true, 60), (SYN_ACK, false, 60), (ACK, true, 52), (PSH_ACK, false, 900), (FIN, false, 52), (FIN_ACK, true, 52), (ACK, false, 52)],
            1 => &[(SYN, true, 60), (SYN_ACK, false, 60), (ACK, true, 52), (PSH_ACK, true, 200), (RST, false, 40)],
            2 => &[(SYN, true, 60)],
            3 => &[(SYN, true, 60), (RST, false, 40)],
            4 => &[(SYN, true, 60), (SYN_ACK, false, 60)],
            5 => &[(ACK, true, 52), (PSH_ACK, false, 1400), (ACK, true, 52)],
            _ => &[(SYN, true, 60), (SYN_ACK, false, 60), (ACK, true, 52), (PSH_ACK, true, 300), (ACK, false, 52)],
        };
        packets.extend(conversation(client, server, start, steps));
    }
    packets
}

#[test]
fn key_is_symmetric() {
    let fwd = Packet::new(0, ("192.168.1.7", 51515), ("93.184.216.34", 443), SYN, 60);
    let rev = Packet::new(1, ("93.184.216.34", 443), ("192.168.1.7", 51515), SYN_ACK, 60);

    let (k1, s1) = ConnectionKey::resolve(&fwd);
    let (k2, s2) = ConnectionKey::resolve(&rev);
    assert_eq!(k1, k2);
    assert_ne!(s1, s2);
    assert_eq!(k1.to_string(), k2.to_string());
}

#[test]
fn happy_path_is_graceful() {
    let (flows, summary) = run(4, 1000, happy_path(("10.0.0.1", 40000), ("10.0.0.2", 80), 0));

    assert_eq!(flows.len(), 1);
    let flow = &flows[0];
    assert_eq!(flow.state, FlowState::Closed);
    assert_eq!(flow.close_type, CloseType::Graceful);
    assert_eq!(flow.invalid_reason, None);
    assert!(flow.establishment_complete);
    assert!(flow.data_transfer_started);
    assert!(flow.closing_started);
    assert_eq!(flow.total_packets, 7);
    assert_eq!(flow.total_bytes, 60 + 60 + 52 + 400 + 52 + 52 + 52);
    assert_eq!(flow.initiator, "10.0.0.1");
    assert_eq!(flow.initiator_port, 40000);
    assert_eq!(flow.responder_port, 80);
    assert_eq!(flow.per_flag_counts["SYN+ACK"].received, 1);
    assert_eq!(flow.per_flag_counts["ACK"].sent, 2);
    assert_eq!(summary.close_types[&CloseType::Graceful], 1);
}

#[test]
fn reset_after_handshake_is_abortive() {
    let client = ("10.0.0.1", 40001);
    let server = ("10.0.0.2", 80);

    let plain = conversation(client, server, 0, &[(SYN, true, 60), (SYN_ACK, false, 60), (ACK, true, 52), (RST, false, 40)]);
    let (flows, _) = run(1, 100, plain);
    assert_eq!(flows[0].close_type, CloseType::Abortive);
    assert_eq!(flows[0].state, FlowState::Aborted);

    // A pending FIN does not make it graceful
    let with_fin = conversation(
        client,
        server,
        0,
        &[(SYN, true, 60), (SYN_ACK, false, 60), (ACK, true, 52), (FIN, true, 52), (RST | ACK, false, 40)],
    );
    let (flows, _) = run(1, 100, with_fin);
    assert_eq!(flows.len(), 1);
    assert_eq!(flows[0].close_type, CloseType::Abortive);
    assert!(flows[0].closing_started);
}

#[test]
fn orphan_syn_is_incomplete_no_synack() {
    let syn = vec![Packet::new(0, ("10.0.0.1", 40002), ("10.0.0.2", 80), SYN, 60)];
    let (flows, _) = run(2, 100, syn);

    assert_eq!(flows.len(), 1);
    assert_eq!(flows[0].close_type, CloseType::Invalid);
    assert_eq!(flows[0].invalid_reason, Some(InvalidReason::IncompleteNoSynack));
}

#[test]
fn orphan_syn_swept_by_timeout() {
    let mut packets = vec![Packet::new(0, ("10.0.0.1", 40003), ("10.0.0.2", 80), SYN, 60)];
    // Unrelated traffic moves the watermark past the timeout
    packets.push(Packet::new((TIMEOUT_S as i64 + 1) * SECOND, ("10.9.0.1", 1234), ("10.9.0.2", 53), ACK, 52));

    let mut engine = engine(2, 1);
    engine.extend(packets);
    let swept = engine.drain_completed();

    assert_eq!(swept.len(), 1);
    assert_eq!(swept[0].invalid_reason, Some(InvalidReason::IncompleteNoSynack));
    assert_eq!(engine.summary().flows_expired, 1);
    assert_eq!(engine.active_flows(), 1);
    assert_eq!(engine.watermark(), Some((TIMEOUT_S as i64 + 1) * SECOND));
}

#[test]
fn rst_during_handshake() {
    for steps in [
        &[(SYN, true, 60), (RST, false, 40)][..],
        &[(SYN, true, 60), (SYN_ACK, false, 60), (RST | ACK, true, 40)][..],
        &[(RST, true, 40)][..],
    ] {
        let (flows, _) = run(1, 100, conversation(("10.0.0.1", 40004), ("10.0.0.2", 80), 0, steps));
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].state, FlowState::Invalid);
        assert_eq!(flows[0].invalid_reason, Some(InvalidReason::RstDuringHandshake));
    }
}

#[test]
fn handshake_violations() {
    let client = ("10.0.0.1", 40005);
    let server = ("10.0.0.2", 80);

    let (flows, _) = run(1, 100, conversation(client, server, 0, &[(SYN_ACK, false, 60)]));
    assert_eq!(flows[0].invalid_reason, Some(InvalidReason::InvalidSynack));

    let (flows, _) = run(1, 100, conversation(client, server, 0, &[(SYN, true, 60), (ACK, true, 52)]));
    assert_eq!(flows[0].invalid_reason, Some(InvalidReason::InvalidAck));

    let (flows, _) = run(1, 100, conversation(client, server, 0, &[(SYN, true, 60), (SYN_ACK, false, 60)]));
    assert_eq!(flows[0].invalid_reason, Some(InvalidReason::IncompleteNoAck));

    let (flows, _) = run(1, 100, conversation(client, server, 0, &[(ACK, true, 52), (PSH_ACK, false, 100)]));
    assert_eq!(flows[0].close_type, CloseType::Incomplete);
    assert_eq!(flows[0].invalid_reason, None);
}

#[test]
fn every_valid_packet_lands_in_exactly_one_flow() {
    let packets = workload(2_000, 7);
    let total = packets.len() as u64;

    let (flows, summary) = run(4, 257, packets);

    let counted: u64 = flows.iter().map(|f| f.total_packets).sum();
    assert_eq!(counted, total);
    assert_eq!(summary.packets_processed, total);
    assert_eq!(summary.flows_created, flows.len() as u64);
    assert_eq!(summary.flows_completed, flows.len() as u64);
    assert_eq!(summary.flows_active, 0);

    let mut ids: Vec<u64> = flows.iter().map(|f| f.id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), flows.len());
}

#[test]
fn replay_is_identical_across_runs_and_worker_counts() {
    let packets = workload(1_500, 42);

    let (baseline, _) = run(1, 333, packets.clone());
    let (again, _) = run(1, 333, packets.clone());
    assert_eq!(baseline, again);

    for workers in [2, 4, 7] {
        let (sharded, _) = run(workers, 333, packets.clone());
        assert_eq!(baseline, sharded, "output differs with {} workers", workers);
    }
}

#[test]
fn output_is_ordered_by_start_time_then_id() {
    let (flows, _) = run(3, 10_000, workload(500, 3));
    assert!(flows
        .windows(2)
        .all(|w| (w[0].start_time, w[0].id) <= (w[1].start_time, w[1].id)));
}

/// Established flow at t=0, then unrelated traffic `idle` after its last
/// packet, then one more packet on the first flow at the same instant.
/// Returns how many flows the first key produced and how many expired.
fn flows_after_idle(idle: i64) -> (usize, u64) {
    let client = ("10.0.0.1", 40006);
    let server = ("10.0.0.2", 80);
    let mut packets = conversation(client, server, 0, &[(SYN, true, 60), (SYN_ACK, false, 60), (ACK, true, 52)]);
    let last = packets[2].timestamp;
    packets.push(Packet::new(last + idle, ("10.9.0.1", 1234), ("10.9.0.2", 53), ACK, 52));
    packets.push(Packet::new(last + idle, server, client, ACK, 52));

    let mut engine = engine(2, 1);
    engine.extend(packets);
    let flows = engine.finish();
    let expired = engine.summary().flows_expired;
    let count = flows.iter().filter(|f| f.responder_port == 80 || f.initiator_port == 80).count();
    (count, expired)
}

#[test]
fn timeout_boundary() {
    let timeout = TIMEOUT_S as i64 * SECOND;

    // Idle for timeout + 1 s: swept, the late packet opens a second flow
    assert_eq!(flows_after_idle(timeout + SECOND), (2, 1));
    // Idle for timeout - 1 s: still the same flow
    assert_eq!(flows_after_idle(timeout - SECOND), (1, 0));
    // Exactly at the timeout is not yet expired
    assert_eq!(flows_after_idle(timeout), (1, 0));
    assert_eq!(flows_after_idle(timeout + 1).1, 1);
}

#[test]
fn swept_established_flow_is_open() {
    let client = ("10.0.0.1", 40007);
    let server = ("10.0.0.2", 80);
    let mut packets = conversation(client, server, 0, &[(SYN, true, 60), (SYN_ACK, false, 60), (ACK, true, 52)]);
    packets.push(Packet::new(400 * SECOND, ("10.9.0.1", 1), ("10.9.0.2", 2), SYN, 60));

    let mut engine = engine(1, 1);
    engine.extend(packets);
    let swept = engine.drain_completed();
    assert_eq!(swept.len(), 1);
    assert_eq!(swept[0].close_type, CloseType::Open);
    assert_eq!(swept[0].state, FlowState::Established);
}

#[test]
fn inversion_across_batches_is_invalid() {
    let client = ("10.0.0.1", 40008);
    let server = ("10.0.0.2", 80);
    let mut packets = conversation(client, server, 10 * SECOND, &[(SYN, true, 60), (SYN_ACK, false, 60), (ACK, true, 52)]);
    // Arrives after its batch was processed, timestamped before the handshake ended
    packets.push(Packet::new(10 * SECOND + 1_500, client, server, PSH_ACK, 100));

    let (flows, summary) = run(2, 3, packets);
    assert_eq!(flows.len(), 1);
    assert_eq!(flows[0].total_packets, 4);
    assert_eq!(flows[0].invalid_reason, Some(InvalidReason::UnknownInvalid));
    assert_eq!(summary.out_of_order, 1);
}

#[test]
fn json_lines_input() {
    let mut engine = engine(2, 100);
    let lines = [
        r#"{"timestamp": 1000, "src_ip": "10.0.0.1", "dst_ip": "10.0.0.2", "src_port": 5555, "dst_port": 80, "flags": 2, "length": 60, "protocol": 6}"#,
        r#"{"timestamp": "2000", "src_ip": "10.0.0.2", "dst_ip": "10.0.0.1", "src_port": "80", "dst_port": "5555", "flags": "18", "length": "60"}"#,
        r#"{"timestamp": 3000, "src_ip": "10.0.0.1", "dst_ip": "10.0.0.2", "src_port": 5555, "dst_port": 80, "flags": 16, "length": -5}"#,
        r#"{"timestamp": "soon", "flags": 2}"#,
        r#"{"timestamp": 4000, "src_ip": "10.0.0.1", "dst_ip": "10.0.0.2", "src_port": 5555, "dst_port": 80, "flags": 2, "protocol": "UDP"}"#,
    ];
    for line in lines {
        engine.push(Ingest::Line(line.to_string()));
    }
    let flows = engine.finish();
    let summary = engine.summary();

    assert_eq!(flows.len(), 1);
    assert_eq!(flows[0].state, FlowState::Established);
    assert_eq!(flows[0].close_type, CloseType::Open);
    assert_eq!(flows[0].total_bytes, 120);
    assert_eq!(summary.rows_read, 5);
    assert_eq!(summary.malformed, 1);
    assert_eq!(summary.non_tcp, 1);
}

#[test]
fn aggregates_cover_all_flow_packets() {
    let config = EngineConfig {
        workers: 3,
        collect_aggregates: true,
        ..Default::default()
    };
    let mut engine = FlowEngine::new(FlowConfig::default(), config, FilterConfig::default());
    let packets = workload(300, 11);
    let total = packets.len() as u64;
    engine.extend(packets);
    engine.finish();

    let report = engine.aggregates().expect("aggregates enabled");
    assert_eq!(report.total_packets, total);
    assert_eq!(report.flag_stats.values().sum::<u64>(), total);
    let pair_total: u64 = report.ip_pairs.iter().map(|p| p.packet_count).sum();
    assert_eq!(pair_total, total);
}

#[test]
fn trailing_packets_after_reset_stay_in_one_flow() {
    let steps = [
        (SYN, true, 60),
        (SYN_ACK, false, 60),
        (ACK, true, 52),
        (RST, false, 40),
        (PSH_ACK, true, 300),
        (RST, false, 40),
    ];
    for batch_size in [1, 100] {
        let (flows, summary) = run(2, batch_size, conversation(("10.0.0.1", 40010), ("10.0.0.2", 80), 0, &steps));

        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].state, FlowState::Aborted);
        assert_eq!(flows[0].close_type, CloseType::Abortive);
        assert_eq!(flows[0].invalid_reason, None);
        assert_eq!(flows[0].total_packets, 6);
        assert!(summary.invalid_reasons.is_empty());
    }
}

#[test]
fn duplicate_final_ack_stays_in_closed_flow() {
    let mut packets = happy_path(("10.0.0.1", 40011), ("10.0.0.2", 80), 0);
    let last = packets.last().map(|p| p.timestamp).unwrap_or_default();
    packets.push(Packet::new(last + 500, ("10.0.0.1", 40011), ("10.0.0.2", 80), ACK, 52));

    let (flows, summary) = run(2, 1, packets);
    assert_eq!(flows.len(), 1);
    assert_eq!(flows[0].state, FlowState::Closed);
    assert_eq!(flows[0].close_type, CloseType::Graceful);
    assert_eq!(flows[0].total_packets, 8);
    assert!(!summary.close_types.contains_key(&CloseType::Incomplete));
}

#[test]
fn new_syn_after_close_starts_second_flow() {
    let client = ("10.0.0.1", 40012);
    let server = ("10.0.0.2", 80);
    let mut packets = happy_path(client, server, 0);
    packets.extend(happy_path(client, server, 5 * SECOND));

    let (flows, summary) = run(3, 4, packets);
    assert_eq!(flows.len(), 2);
    assert!(flows.iter().all(|f| f.close_type == CloseType::Graceful && f.total_packets == 7));
    assert_eq!(summary.flows_expired, 0);
}

#[test]
fn own_packet_after_timeout_starts_new_flow() {
    let client = ("10.0.0.1", 40013);
    let server = ("10.0.0.2", 80);
    let mut packets = conversation(client, server, 0, &[(SYN, true, 60), (SYN_ACK, false, 60), (ACK, true, 52)]);
    packets.push(Packet::new(3600 * SECOND, client, server, PSH_ACK, 200));

    for batch_size in [1, 100] {
        let (flows, summary) = run(2, batch_size, packets.clone());
        assert_eq!(flows.len(), 2, "batch_size {}", batch_size);
        assert_eq!(flows[0].close_type, CloseType::Open);
        assert_eq!(flows[0].total_packets, 3);
        assert_eq!(flows[1].close_type, CloseType::Incomplete);
        assert_eq!(summary.flows_expired, 1);
    }
}

#[test]
fn classification_does_not_depend_on_batch_size() {
    let client = ("10.0.0.1", 40014);
    let server = ("10.0.0.2", 80);
    let mut packets = conversation(client, server, 0, &[(SYN, true, 60), (SYN_ACK, false, 60), (ACK, true, 52)]);
    packets.push(Packet::new(301 * SECOND, ("10.9.0.1", 1234), ("10.9.0.2", 53), ACK, 52));
    packets.push(Packet::new(301 * SECOND + 5, client, server, ACK, 52));

    let by_start = |mut flows: Vec<FlowRecord>| {
        flows.sort_by_key(|f| (f.start_time, f.id));
        flows
    };
    let (small, small_summary) = run(2, 1, packets.clone());
    let (large, large_summary) = run(2, 100, packets);

    assert_eq!(by_start(small.clone()), by_start(large));
    assert_eq!(small_summary.flows_expired, large_summary.flows_expired);
    assert_eq!(small.len(), 3);
}

#[test]
fn integer_addresses_mapped_through_ip_map() {
    let map = IpMap::from_pairs([
        ("192.168.7.1".to_string(), 3232237313),
        ("192.168.7.2".to_string(), 3232237314),
    ]);
    let mut engine = engine(1, 10).with_ip_map(map);
    engine.push_line(r#"{"timestamp": 1, "src_ip": 3232237313, "dst_ip": 3232237314, "src_port": 5000, "dst_port": 22, "flags": 2, "length": 60}"#);
    engine.push_line(r#"{"timestamp": 2, "src_ip": "3232237314", "dst_ip": "3232237313", "src_port": 22, "dst_port": 5000, "flags": 18, "length": 60}"#);
    engine.push_line(r#"{"timestamp": 3, "src_ip": 99, "dst_ip": 3232237314, "src_port": 5001, "dst_port": 22, "flags": 2, "length": 60}"#);

    let flows = engine.finish();
    assert_eq!(flows.len(), 2);
    assert_eq!(flows[0].key, "192.168.7.1:5000<->192.168.7.2:22");
    assert_eq!(flows[0].total_packets, 2);
    assert_eq!(flows[1].initiator, "99");
    assert_eq!(flows[1].responder, "192.168.7.2");
}
