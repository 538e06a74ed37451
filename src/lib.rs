//! TCP flow reconstruction
//!
//! Ingests packet header records, rebuilds bidirectional TCP connections and
//! classifies how each one ended (graceful, abortive, open, incomplete or
//! invalid). Replays are deterministic: the same input gives the same flows
//! regardless of the number of shard workers.
//!
//! ```
//! use flowrecon::core::{CloseType, Packet, TcpFlags};
//! use flowrecon::engine::FlowEngine;
//!
//! let client = ("10.0.0.1", 40000);
//! let server = ("10.0.0.2", 80);
//! let packets = vec![
//!     Packet::new(0, client, server, TcpFlags::SYN, 60),
//!     Packet::new(1, server, client, TcpFlags::SYN | TcpFlags::ACK, 60),
//!     Packet::new(2, client, server, TcpFlags::ACK, 52),
//!     Packet::new(3, server, client, TcpFlags::RST, 40),
//! ];
//!
//! let (flows, summary) = FlowEngine::with_workers(2).run(packets);
//! assert_eq!(flows.len(), 1);
//! assert_eq!(flows[0].close_type, CloseType::Abortive);
//! assert_eq!(summary.packets_processed, 4);
//! ```

pub mod config;
pub mod core;
pub mod engine;
pub mod flow;
pub mod parallel;

pub use crate::core::{CloseType, FlowRecord, FlowState, InvalidReason, Packet};
pub use config::Config;
pub use engine::{FlowEngine, Ingest, RunSummary};
