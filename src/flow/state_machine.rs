//! TCP connection state machine
//!
//! A pure function from `(state, segment)` to the next state plus the side
//! effects the tracker applies. Nothing here touches counters or the table,
//! which keeps the rules testable one transition at a time.
//!
//! ```text
//! NEW -SYN-> INIT -SYN+ACK-> SYN_RCVD -ACK-> ESTABLISHED
//! ESTABLISHED -FIN-> FIN_1 -FIN(other)-> FIN_2 -ACK(first closer)-> CLOSING
//! RST: handshake -> INVALID(rst_during_handshake), later -> ABORTED
//! ```

use crate::core::{Direction, FlagKind, FlowState, Phase, Violation};

/// What the state machine needs to know about one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub kind: FlagKind,
    pub direction: Direction,
    pub has_payload: bool,
}

impl Segment {
    pub fn new(kind: FlagKind, direction: Direction, has_payload: bool) -> Self {
        Self { kind, direction, has_payload }
    }

    fn from_initiator(&self) -> bool {
        self.direction.is_from_initiator()
    }
}

/// Side effects of one transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Effects {
    /// Final handshake ACK observed
    pub establish: bool,
    /// Packet counts as data transfer
    pub data: bool,
    /// Packet carries FIN
    pub closing_started: bool,
    /// Records the side that sent the first FIN
    pub first_closer: Option<Direction>,
    pub violation: Option<Violation>,
    pub phase: Phase,
}

impl Effects {
    fn in_phase(phase: Phase) -> Self {
        Self {
            establish: false,
            data: false,
            closing_started: false,
            first_closer: None,
            violation: None,
            phase,
        }
    }
}

/// Result of feeding one segment to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: FlowState,
    pub effects: Effects,
}

impl Transition {
    fn to(next: FlowState, phase: Phase) -> Self {
        Self { next, effects: Effects::in_phase(phase) }
    }

    fn invalid(violation: Violation, phase: Phase) -> Self {
        let mut t = Self::to(FlowState::Invalid, phase);
        t.effects.violation = Some(violation);
        t
    }

    fn with_data(mut self) -> Self {
        self.effects.data = true;
        self
    }
}

/// Phase a packet is attributed to while the flow sits in `state`
fn phase_of(state: FlowState, seg: &Segment) -> Phase {
    match seg.kind {
        FlagKind::Fin | FlagKind::FinAck | FlagKind::Rst => Phase::Closing,
        _ => match state {
            FlowState::New | FlowState::Init | FlowState::SynRcvd => Phase::Establishment,
            FlowState::Established => Phase::DataTransfer,
            _ => Phase::Closing,
        },
    }
}

/// Apply one segment to a flow in `state`.
///
/// `first_closer` is the side that sent the first FIN, if any. The returned
/// transition is total: unexpected input yields `INVALID` with a violation
/// instead of an error.
pub fn transition(state: FlowState, first_closer: Option<Direction>, seg: &Segment) -> Transition {
    use FlagKind::*;

    let phase = phase_of(state, seg);

    if state.is_terminal() {
        return Transition::to(state, phase);
    }

    // RST pre-empts every other rule
    if seg.kind == Rst {
        return if state.is_handshake() {
            Transition::invalid(Violation::RstDuringHandshake, phase)
        } else {
            Transition::to(FlowState::Aborted, phase)
        };
    }

    let mut t = match state {
        FlowState::New => match seg.kind {
            Syn if seg.from_initiator() => Transition::to(FlowState::Init, phase),
            Syn => Transition::invalid(Violation::Unexpected, phase),
            SynAck => Transition::invalid(Violation::SynAckWithoutSyn, phase),
            // Picked up mid-stream
            _ => Transition::to(FlowState::New, phase),
        },

        FlowState::Init => match seg.kind {
            Syn if seg.from_initiator() => Transition::to(FlowState::Init, phase),
            SynAck if !seg.from_initiator() => Transition::to(FlowState::SynRcvd, phase),
            SynAck => Transition::invalid(Violation::SynAckWithoutSyn, phase),
            Ack | PshAck => Transition::invalid(Violation::AckBeforeSynAck, phase),
            _ => Transition::invalid(Violation::Unexpected, phase),
        },

        FlowState::SynRcvd => match seg.kind {
            Ack if seg.from_initiator() => {
                let mut t = Transition::to(FlowState::Established, phase);
                t.effects.establish = true;
                t
            }
            PshAck if seg.from_initiator() => {
                let mut t = Transition::to(FlowState::Established, phase).with_data();
                t.effects.establish = true;
                t
            }
            Ack | PshAck => Transition::invalid(Violation::AckBeforeSynAck, phase),
            SynAck if !seg.from_initiator() => Transition::to(FlowState::SynRcvd, phase),
            Syn if seg.from_initiator() => Transition::to(FlowState::SynRcvd, phase),
            SynAck => Transition::invalid(Violation::SynAckWithoutSyn, phase),
            _ => Transition::invalid(Violation::Unexpected, phase),
        },

        FlowState::Established => match seg.kind {
            Ack if seg.has_payload => Transition::to(FlowState::Established, phase).with_data(),
            Ack => Transition::to(FlowState::Established, phase),
            PshAck => Transition::to(FlowState::Established, phase).with_data(),
            Fin | FinAck => {
                let mut t = Transition::to(FlowState::Fin1, phase);
                t.effects.first_closer = Some(seg.direction);
                t
            }
            Syn if seg.from_initiator() => Transition::to(FlowState::Established, phase),
            SynAck if !seg.from_initiator() => Transition::to(FlowState::Established, phase),
            _ => Transition::invalid(Violation::Unexpected, phase),
        },

        FlowState::Fin1 => {
            let from_closer = first_closer == Some(seg.direction);
            match seg.kind {
                Fin | FinAck if from_closer => Transition::to(FlowState::Fin1, phase),
                Fin | FinAck => Transition::to(FlowState::Fin2, phase),
                Ack => Transition::to(FlowState::Fin1, phase),
                // The other side may keep sending after a half-close
                PshAck if !from_closer => {
                    Transition::to(FlowState::Fin1, Phase::DataTransfer).with_data()
                }
                _ => Transition::invalid(Violation::Unexpected, phase),
            }
        }

        FlowState::Fin2 => match seg.kind {
            Ack if first_closer == Some(seg.direction) => Transition::to(FlowState::Closing, phase),
            Ack | Fin | FinAck => Transition::to(FlowState::Fin2, phase),
            _ => Transition::invalid(Violation::Unexpected, phase),
        },

        // Terminal states returned above
        FlowState::Closing | FlowState::Closed | FlowState::Aborted | FlowState::Invalid => {
            Transition::to(state, phase)
        }
    };

    if matches!(seg.kind, Fin | FinAck) {
        t.effects.closing_started = true;
    }
    t
}

/// Transition for a packet timestamped before the flow's last activity.
/// Terminal flows are left alone; anything else goes INVALID.
pub fn out_of_order(state: FlowState, seg: &Segment) -> Transition {
    let phase = phase_of(state, seg);
    if state.is_terminal() {
        Transition::to(state, phase)
    } else {
        Transition::invalid(Violation::OutOfOrder, phase)
    }
}
