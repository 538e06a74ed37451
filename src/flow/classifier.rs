//! Close-type classification at finalization

use crate::core::{CloseType, Flow, FlowState, InvalidReason, Violation};

/// Map a recorded violation to the reported reason
pub fn reason_for(violation: Violation) -> InvalidReason {
    match violation {
        Violation::SynAckWithoutSyn => InvalidReason::InvalidSynack,
        Violation::AckBeforeSynAck => InvalidReason::InvalidAck,
        Violation::RstDuringHandshake => InvalidReason::RstDuringHandshake,
        Violation::OutOfOrder | Violation::Unexpected => InvalidReason::UnknownInvalid,
    }
}

/// Classify a flow from its final state.
///
/// Returns the state to report alongside the close type: a flow that ended
/// in CLOSING has seen its last ACK and is reported CLOSED.
pub fn classify(state: FlowState, violation: Option<Violation>) -> (FlowState, CloseType, Option<InvalidReason>) {
    match state {
        FlowState::Closing | FlowState::Closed => (FlowState::Closed, CloseType::Graceful, None),
        // Half-close at timeout or end of stream still counts as graceful
        FlowState::Fin1 | FlowState::Fin2 => (state, CloseType::Graceful, None),
        FlowState::Aborted => (state, CloseType::Abortive, None),
        FlowState::Invalid => (
            state,
            CloseType::Invalid,
            Some(violation.map_or(InvalidReason::UnknownInvalid, reason_for)),
        ),
        FlowState::Established => (state, CloseType::Open, None),
        // Earliest missing handshake step wins
        FlowState::SynRcvd => (state, CloseType::Invalid, Some(InvalidReason::IncompleteNoAck)),
        FlowState::Init => (state, CloseType::Invalid, Some(InvalidReason::IncompleteNoSynack)),
        FlowState::New => (state, CloseType::Incomplete, None),
    }
}

/// Stamp the classification onto a flow. A no-op if already finalized.
pub fn finalize(flow: &mut Flow) {
    if flow.is_finalized() {
        return;
    }
    let (state, close_type, reason) = classify(flow.state, flow.violation);
    flow.state = state;
    flow.close_type = Some(close_type);
    flow.invalid_reason = reason;
}
