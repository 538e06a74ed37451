//! Core shared types for flow reconstruction
//!
//! - `Packet`: header digest fed to the engine
//! - `Flow`: connection under reconstruction and its output record
//! - `RecordError`: why an input row was rejected

pub mod error;
pub mod flow;
pub mod packet;

pub use error::RecordError;
pub use flow::{
    CloseType, ConnectionKey, Endpoint, FlagCount, Flow, FlowRecord, FlowState, InvalidReason,
    KeySide, Phase, PhaseCounts, Violation,
};
pub use packet::{Direction, FlagKind, Packet, RawField, RawPacketRecord, TcpFlags, IPPROTO_TCP};
