//! Reconstructed TCP flows
//!
//! A flow is keyed by the unordered endpoint pair and remembers which side
//! opened it. It is mutated in place by the tracker until finalization, then
//! converted into an immutable [`FlowRecord`].

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use super::packet::{Direction, Packet};

/// One side of a connection
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub addr: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(addr: impl Into<String>, port: u16) -> Self {
        Self { addr: addr.into(), port }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// Which canonical endpoint of a [`ConnectionKey`] sent a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeySide {
    /// The smaller endpoint
    A,
    /// The larger endpoint
    B,
}

impl KeySide {
    pub fn other(self) -> Self {
        match self {
            KeySide::A => KeySide::B,
            KeySide::B => KeySide::A,
        }
    }
}

/// Direction-independent identifier for a flow
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    /// Lexicographically smaller `(addr, port)`
    pub a: Endpoint,
    pub b: Endpoint,
}

impl ConnectionKey {
    /// Normalize a packet's 4-tuple so the smaller endpoint is always first,
    /// and report which side the source landed on.
    pub fn resolve(pkt: &Packet) -> (Self, KeySide) {
        let src = Endpoint::new(pkt.src_ip.as_str(), pkt.src_port);
        let dst = Endpoint::new(pkt.dst_ip.as_str(), pkt.dst_port);
        if src <= dst {
            (Self { a: src, b: dst }, KeySide::A)
        } else {
            (Self { a: dst, b: src }, KeySide::B)
        }
    }

    pub fn endpoint(&self, side: KeySide) -> &Endpoint {
        match side {
            KeySide::A => &self.a,
            KeySide::B => &self.b,
        }
    }

    /// Shard index in `0..shards`. Stable across runs.
    pub fn shard(&self, shards: usize) -> usize {
        if shards <= 1 {
            return 0;
        }
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        (hasher.finish() % shards as u64) as usize
    }
}

impl std::fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}<->{}", self.a, self.b)
    }
}

/// TCP connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FlowState {
    /// Flow created, no SYN seen yet
    #[default]
    #[serde(rename = "NEW")]
    New,
    /// SYN sent
    #[serde(rename = "INIT")]
    Init,
    /// SYN-ACK received
    #[serde(rename = "SYN_RCVD")]
    SynRcvd,
    #[serde(rename = "ESTABLISHED")]
    Established,
    /// First FIN seen
    #[serde(rename = "FIN_1")]
    Fin1,
    /// Both sides sent FIN
    #[serde(rename = "FIN_2")]
    Fin2,
    /// Final ACK of the second FIN
    #[serde(rename = "CLOSING")]
    Closing,
    #[serde(rename = "CLOSED")]
    Closed,
    /// Reset after the handshake
    #[serde(rename = "ABORTED")]
    Aborted,
    #[serde(rename = "INVALID")]
    Invalid,
}

impl FlowState {
    /// No further packet can change the outcome
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FlowState::Closing | FlowState::Closed | FlowState::Aborted | FlowState::Invalid
        )
    }

    /// Handshake not yet complete
    pub fn is_handshake(self) -> bool {
        matches!(self, FlowState::New | FlowState::Init | FlowState::SynRcvd)
    }
}

impl std::fmt::Display for FlowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowState::New => write!(f, "NEW"),
            FlowState::Init => write!(f, "INIT"),
            FlowState::SynRcvd => write!(f, "SYN_RCVD"),
            FlowState::Established => write!(f, "ESTABLISHED"),
            FlowState::Fin1 => write!(f, "FIN_1"),
            FlowState::Fin2 => write!(f, "FIN_2"),
            FlowState::Closing => write!(f, "CLOSING"),
            FlowState::Closed => write!(f, "CLOSED"),
            FlowState::Aborted => write!(f, "ABORTED"),
            FlowState::Invalid => write!(f, "INVALID"),
        }
    }
}

/// Final disposition of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloseType {
    Graceful,
    Abortive,
    Invalid,
    Open,
    Incomplete,
}

impl CloseType {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseType::Graceful => "graceful",
            CloseType::Abortive => "abortive",
            CloseType::Invalid => "invalid",
            CloseType::Open => "open",
            CloseType::Incomplete => "incomplete",
        }
    }
}

impl std::fmt::Display for CloseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a flow was classified `invalid`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidReason {
    IncompleteNoSynack,
    IncompleteNoAck,
    InvalidAck,
    InvalidSynack,
    RstDuringHandshake,
    UnknownInvalid,
}

impl InvalidReason {
    pub fn as_str(self) -> &'static str {
        match self {
            InvalidReason::IncompleteNoSynack => "incomplete_no_synack",
            InvalidReason::IncompleteNoAck => "incomplete_no_ack",
            InvalidReason::InvalidAck => "invalid_ack",
            InvalidReason::InvalidSynack => "invalid_synack",
            InvalidReason::RstDuringHandshake => "rst_during_handshake",
            InvalidReason::UnknownInvalid => "unknown_invalid",
        }
    }
}

impl std::fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sequence violation that moved a flow to INVALID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Violation {
    /// SYN+ACK with no SYN before it, or from the initiator
    SynAckWithoutSyn,
    /// Final ACK out of order relative to the SYN+ACK
    AckBeforeSynAck,
    RstDuringHandshake,
    /// Timestamp earlier than the flow's last activity
    OutOfOrder,
    /// Anything else the state machine does not expect
    Unexpected,
}

/// Per-label packet count split by direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagCount {
    /// From the initiator
    pub sent: u64,
    /// To the initiator
    pub received: u64,
}

/// Connection phase a packet is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Establishment,
    DataTransfer,
    Closing,
}

/// Packets per connection phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseCounts {
    pub establishment: u64,
    pub data_transfer: u64,
    pub closing: u64,
}

impl PhaseCounts {
    pub fn bump(&mut self, phase: Phase) {
        match phase {
            Phase::Establishment => self.establishment += 1,
            Phase::DataTransfer => self.data_transfer += 1,
            Phase::Closing => self.closing += 1,
        }
    }
}

/// Bidirectional TCP flow under reconstruction
#[derive(Debug, Clone)]
pub struct Flow {
    /// Ingestion ordinal of the opening packet
    pub id: u64,
    pub key: ConnectionKey,
    /// Side of `key` that sent the first packet
    pub initiator_side: KeySide,
    pub state: FlowState,

    // Timing (microseconds)
    pub start_time: i64,
    pub end_time: i64,
    pub last_activity: i64,

    pub total_packets: u64,
    pub total_bytes: u64,
    pub flag_counts: BTreeMap<String, FlagCount>,
    pub phase_counts: PhaseCounts,

    pub establishment_complete: bool,
    pub data_transfer_started: bool,
    pub closing_started: bool,
    /// Side that sent the first FIN
    pub first_closer: Option<Direction>,
    /// First violation seen, if the flow went INVALID
    pub violation: Option<Violation>,

    // Set once, at finalization
    pub close_type: Option<CloseType>,
    pub invalid_reason: Option<InvalidReason>,
}

impl Flow {
    /// Create a flow from its first packet. The sender becomes the initiator.
    pub fn new(id: u64, key: ConnectionKey, initiator_side: KeySide, timestamp: i64) -> Self {
        Self {
            id,
            key,
            initiator_side,
            state: FlowState::New,
            start_time: timestamp,
            end_time: timestamp,
            last_activity: timestamp,
            total_packets: 0,
            total_bytes: 0,
            flag_counts: BTreeMap::new(),
            phase_counts: PhaseCounts::default(),
            establishment_complete: false,
            data_transfer_started: false,
            closing_started: false,
            first_closer: None,
            violation: None,
            close_type: None,
            invalid_reason: None,
        }
    }

    /// Direction of a packet sent from `side`
    pub fn direction(&self, side: KeySide) -> Direction {
        if side == self.initiator_side {
            Direction::ToServer
        } else {
            Direction::ToClient
        }
    }

    pub fn initiator(&self) -> &Endpoint {
        self.key.endpoint(self.initiator_side)
    }

    pub fn responder(&self) -> &Endpoint {
        self.key.endpoint(self.initiator_side.other())
    }

    pub fn is_finalized(&self) -> bool {
        self.close_type.is_some()
    }

    /// Idle time relative to the stream watermark
    pub fn idle(&self, now: i64) -> i64 {
        now.saturating_sub(self.last_activity)
    }

    /// Immutable output form
    pub fn to_record(&self) -> FlowRecord {
        let initiator = self.initiator();
        let responder = self.responder();
        FlowRecord {
            id: self.id,
            key: self.key.to_string(),
            initiator: initiator.addr.clone(),
            initiator_port: initiator.port,
            responder: responder.addr.clone(),
            responder_port: responder.port,
            state: self.state,
            start_time: self.start_time,
            end_time: self.end_time,
            total_packets: self.total_packets,
            total_bytes: self.total_bytes,
            close_type: self.close_type.unwrap_or(CloseType::Incomplete),
            invalid_reason: self.invalid_reason,
            establishment_complete: self.establishment_complete,
            data_transfer_started: self.data_transfer_started,
            closing_started: self.closing_started,
            per_flag_counts: self.flag_counts.clone(),
            phase_counts: self.phase_counts,
        }
    }
}

/// One finalized flow, as emitted to downstream consumers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowRecord {
    pub id: u64,
    pub key: String,
    pub initiator: String,
    pub initiator_port: u16,
    pub responder: String,
    pub responder_port: u16,
    pub state: FlowState,
    pub start_time: i64,
    pub end_time: i64,
    pub total_packets: u64,
    pub total_bytes: u64,
    pub close_type: CloseType,
    pub invalid_reason: Option<InvalidReason>,
    pub establishment_complete: bool,
    pub data_transfer_started: bool,
    pub closing_started: bool,
    pub per_flag_counts: BTreeMap<String, FlagCount>,
    pub phase_counts: PhaseCounts,
}
