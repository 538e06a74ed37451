//! Packet header digest
//!
//! The engine never sees payload bytes: a packet is the timestamp, the
//! 4-tuple, the TCP flag byte and the on-wire length. Flags are decoded once
//! into [`FlagKind`] so the state machine switches on a closed enum.

use serde::{Deserialize, Serialize};

use super::error::{RecordError, Result};

/// IP protocol number for TCP
pub const IPPROTO_TCP: u8 = 6;

/// TCP flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
    pub ece: bool,
    pub cwr: bool,
}

impl TcpFlags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;
    pub const ECE: u8 = 0x40;
    pub const CWR: u8 = 0x80;

    pub fn from_u8(flags: u8) -> Self {
        Self {
            fin: flags & Self::FIN != 0,
            syn: flags & Self::SYN != 0,
            rst: flags & Self::RST != 0,
            psh: flags & Self::PSH != 0,
            ack: flags & Self::ACK != 0,
            urg: flags & Self::URG != 0,
            ece: flags & Self::ECE != 0,
            cwr: flags & Self::CWR != 0,
        }
    }

    pub fn to_u8(&self) -> u8 {
        let mut flags = 0u8;
        if self.fin { flags |= Self::FIN; }
        if self.syn { flags |= Self::SYN; }
        if self.rst { flags |= Self::RST; }
        if self.psh { flags |= Self::PSH; }
        if self.ack { flags |= Self::ACK; }
        if self.urg { flags |= Self::URG; }
        if self.ece { flags |= Self::ECE; }
        if self.cwr { flags |= Self::CWR; }
        flags
    }

    /// Human-readable flag label used for per-flag counters and histograms.
    ///
    /// The four common combinations get fixed names; anything else is the
    /// alphabetically sorted list of set flags joined with `+`.
    pub fn label(&self) -> String {
        let bits = self.to_u8();
        match bits {
            0 => return "NONE".to_string(),
            b if b == Self::SYN | Self::ACK => return "SYN+ACK".to_string(),
            b if b == Self::FIN | Self::ACK => return "FIN+ACK".to_string(),
            b if b == Self::PSH | Self::ACK => return "PSH+ACK".to_string(),
            b if b == Self::RST | Self::ACK => return "RST+ACK".to_string(),
            _ => {}
        }

        // Already in alphabetical order
        let names = [
            (self.ack, "ACK"),
            (self.cwr, "CWR"),
            (self.ece, "ECE"),
            (self.fin, "FIN"),
            (self.psh, "PSH"),
            (self.rst, "RST"),
            (self.syn, "SYN"),
            (self.urg, "URG"),
        ];
        names
            .iter()
            .filter(|(set, _)| *set)
            .map(|(_, name)| *name)
            .collect::<Vec<_>>()
            .join("+")
    }
}

impl From<u8> for TcpFlags {
    fn from(flags: u8) -> Self {
        Self::from_u8(flags)
    }
}

/// Flag combination as seen by the state machine.
///
/// RST wins over every other bit, so RST+ACK is `Rst`. SYN together with FIN
/// or without a consistent meaning falls into `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlagKind {
    Syn,
    SynAck,
    Ack,
    PshAck,
    Fin,
    FinAck,
    Rst,
    Other,
}

impl From<TcpFlags> for FlagKind {
    fn from(flags: TcpFlags) -> Self {
        if flags.rst {
            FlagKind::Rst
        } else if flags.syn && flags.fin {
            FlagKind::Other
        } else if flags.syn {
            if flags.ack { FlagKind::SynAck } else { FlagKind::Syn }
        } else if flags.fin {
            if flags.ack { FlagKind::FinAck } else { FlagKind::Fin }
        } else if flags.ack {
            if flags.psh { FlagKind::PshAck } else { FlagKind::Ack }
        } else {
            FlagKind::Other
        }
    }
}

impl std::fmt::Display for FlagKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FlagKind::Syn => "SYN",
            FlagKind::SynAck => "SYN+ACK",
            FlagKind::Ack => "ACK",
            FlagKind::PshAck => "PSH+ACK",
            FlagKind::Fin => "FIN",
            FlagKind::FinAck => "FIN+ACK",
            FlagKind::Rst => "RST",
            FlagKind::Other => "OTHER",
        };
        write!(f, "{}", s)
    }
}

/// Packet direction relative to the connection initiator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// From client to server (initiator -> responder)
    ToServer,
    /// From server to client (responder -> initiator)
    ToClient,
}

impl Direction {
    pub fn is_from_initiator(self) -> bool {
        self == Direction::ToServer
    }
}

/// One TCP packet header digest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    /// Ingestion ordinal, assigned by the engine after ordering
    #[serde(default)]
    pub id: u64,
    /// Capture time in microseconds
    pub timestamp: i64,
    pub src_ip: String,
    pub dst_ip: String,
    /// 0 means unknown
    pub src_port: u16,
    /// 0 means unknown
    pub dst_port: u16,
    pub flags: TcpFlags,
    /// Bytes on the wire
    pub length: u32,
    /// IP protocol number, when the source provides one
    #[serde(default)]
    pub protocol: Option<u8>,
}

impl Packet {
    /// Create a TCP packet
    pub fn new(
        timestamp: i64,
        src: (&str, u16),
        dst: (&str, u16),
        flags: u8,
        length: u32,
    ) -> Self {
        Self {
            id: 0,
            timestamp,
            src_ip: src.0.to_string(),
            dst_ip: dst.0.to_string(),
            src_port: src.1,
            dst_port: dst.1,
            flags: TcpFlags::from_u8(flags),
            length,
            protocol: None,
        }
    }

    /// Flag combination for the state machine
    pub fn kind(&self) -> FlagKind {
        FlagKind::from(self.flags)
    }

    /// True unless the source explicitly tagged a non-TCP protocol
    pub fn is_tcp(&self) -> bool {
        self.protocol.map_or(true, |p| p == IPPROTO_TCP)
    }

    /// Both endpoints are known well enough to key a flow
    pub fn is_keyable(&self) -> bool {
        self.src_port != 0 && self.dst_port != 0 && !self.src_ip.is_empty() && !self.dst_ip.is_empty()
    }
}

/// A loosely typed field from an input row: numbers may arrive as integers,
/// floats or strings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RawField {
    Int(i64),
    Float(f64),
    Text(String),
}

impl RawField {
    fn as_i64(&self, field: &'static str) -> Result<i64> {
        let unparseable = || RecordError::Unparseable {
            field,
            value: self.as_text(),
        };
        match self {
            RawField::Int(v) => Ok(*v),
            RawField::Float(v) if v.is_finite() => Ok(v.trunc() as i64),
            RawField::Float(_) => Err(unparseable()),
            RawField::Text(s) => {
                let t = s.trim();
                if let Ok(v) = t.parse::<i64>() {
                    return Ok(v);
                }
                t.parse::<f64>()
                    .ok()
                    .filter(|v| v.is_finite())
                    .map(|v| v.trunc() as i64)
                    .ok_or_else(unparseable)
            }
        }
    }

    fn as_text(&self) -> String {
        match self {
            RawField::Int(v) => v.to_string(),
            RawField::Float(v) if v.fract() == 0.0 && v.is_finite() => format!("{}", *v as i64),
            RawField::Float(v) => v.to_string(),
            RawField::Text(s) => s.trim().to_string(),
        }
    }
}

/// One input row before validation
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawPacketRecord {
    #[serde(default)]
    pub timestamp: Option<RawField>,
    #[serde(default)]
    pub src_ip: Option<RawField>,
    #[serde(default)]
    pub dst_ip: Option<RawField>,
    #[serde(default)]
    pub src_port: Option<RawField>,
    #[serde(default)]
    pub dst_port: Option<RawField>,
    #[serde(default)]
    pub flags: Option<RawField>,
    #[serde(default)]
    pub length: Option<RawField>,
    #[serde(default)]
    pub protocol: Option<RawField>,
}

impl RawPacketRecord {
    /// Decode one JSON object
    pub fn from_json(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line)?)
    }
}

/// Ports fail soft: anything absent, unparseable or out of range becomes 0.
fn port_or_zero(field: &Option<RawField>) -> u16 {
    field
        .as_ref()
        .and_then(|f| f.as_i64("port").ok())
        .and_then(|v| u16::try_from(v).ok())
        .unwrap_or(0)
}

fn parse_protocol(field: &RawField) -> Result<u8> {
    if let RawField::Text(s) = field {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => return Ok(IPPROTO_TCP),
            "udp" => return Ok(17),
            "icmp" => return Ok(1),
            _ => {}
        }
    }
    let value = field.as_i64("protocol")?;
    u8::try_from(value).map_err(|_| RecordError::OutOfRange { field: "protocol", value })
}

impl TryFrom<RawPacketRecord> for Packet {
    type Error = RecordError;

    fn try_from(raw: RawPacketRecord) -> Result<Self> {
        let timestamp = raw
            .timestamp
            .as_ref()
            .ok_or(RecordError::MissingField("timestamp"))?
            .as_i64("timestamp")?;

        let flags = raw
            .flags
            .as_ref()
            .ok_or(RecordError::MissingField("flags"))?
            .as_i64("flags")?;
        let flags = u8::try_from(flags).map_err(|_| RecordError::OutOfRange { field: "flags", value: flags })?;

        let protocol = raw.protocol.as_ref().map(parse_protocol).transpose()?;

        let length = raw
            .length
            .as_ref()
            .and_then(|f| f.as_i64("length").ok())
            .map(|v| v.clamp(0, u32::MAX as i64) as u32)
            .unwrap_or(0);

        Ok(Self {
            id: 0,
            timestamp,
            src_ip: raw.src_ip.as_ref().map(RawField::as_text).unwrap_or_default(),
            dst_ip: raw.dst_ip.as_ref().map(RawField::as_text).unwrap_or_default(),
            src_port: port_or_zero(&raw.src_port),
            dst_port: port_or_zero(&raw.dst_port),
            flags: TcpFlags::from_u8(flags),
            length,
            protocol,
        })
    }
}
