//! Per-flow packet accounting
//!
//! Counts are direction-aware: `sent` means from the initiator, `received`
//! means towards it.

use crate::core::{Direction, Flow, Packet, Phase};

/// Account one packet against a flow
pub fn record(flow: &mut Flow, pkt: &Packet, direction: Direction, phase: Phase) {
    flow.total_packets += 1;
    flow.total_bytes += u64::from(pkt.length);

    let count = flow.flag_counts.entry(pkt.flags.label()).or_default();
    match direction {
        Direction::ToServer => count.sent += 1,
        Direction::ToClient => count.received += 1,
    }

    flow.phase_counts.bump(phase);

    // Out-of-order packets must not move the window backwards
    flow.start_time = flow.start_time.min(pkt.timestamp);
    flow.end_time = flow.end_time.max(pkt.timestamp);
    flow.last_activity = flow.last_activity.max(pkt.timestamp);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ConnectionKey;

    fn make_packet(ts: i64, flags: u8, len: u32, reverse: bool) -> Packet {
        let (a, b) = (("192.168.1.10", 50000), ("10.0.0.1", 80));
        if reverse {
            Packet::new(ts, b, a, flags, len)
        } else {
            Packet::new(ts, a, b, flags, len)
        }
    }

    #[test]
    fn test_direction_aware_counts() {
        let first = make_packet(1_000, 2, 60, false);
        let (key, side) = ConnectionKey::resolve(&first);
        let mut flow = Flow::new(0, key, side, first.timestamp);

        record(&mut flow, &first, Direction::ToServer, Phase::Establishment);
        record(&mut flow, &make_packet(2_000, 18, 60, true), Direction::ToClient, Phase::Establishment);
        record(&mut flow, &make_packet(3_000, 24, 500, false), Direction::ToServer, Phase::DataTransfer);
        record(&mut flow, &make_packet(4_000, 24, 1500, true), Direction::ToClient, Phase::DataTransfer);

        assert_eq!(flow.total_packets, 4);
        assert_eq!(flow.total_bytes, 2120);
        assert_eq!(flow.flag_counts["SYN"].sent, 1);
        assert_eq!(flow.flag_counts["SYN+ACK"].received, 1);
        assert_eq!(flow.flag_counts["PSH+ACK"].sent, 1);
        assert_eq!(flow.flag_counts["PSH+ACK"].received, 1);
        assert_eq!(flow.phase_counts.establishment, 2);
        assert_eq!(flow.phase_counts.data_transfer, 2);
        assert_eq!(flow.end_time, 4_000);
    }

    #[test]
    fn test_window_never_shrinks() {
        let first = make_packet(5_000, 16, 0, false);
        let (key, side) = ConnectionKey::resolve(&first);
        let mut flow = Flow::new(0, key, side, first.timestamp);

        record(&mut flow, &first, Direction::ToServer, Phase::DataTransfer);
        record(&mut flow, &make_packet(4_000, 16, 0, true), Direction::ToClient, Phase::DataTransfer);

        assert_eq!(flow.start_time, 4_000);
        assert_eq!(flow.end_time, 5_000);
        assert_eq!(flow.last_activity, 5_000);
    }
}
