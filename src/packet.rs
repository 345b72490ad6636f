//! # Summary
//!
//! Fixed binary framing for the two wire formats: the transport frame
//! (protocol id + sequence number) and the consensus packet it carries
//! (message type + instance + proposal), plus the small body encodings the
//! consensus messages use. Both formats are bounded to a fixed maximum
//! packet size. Decoding rejects truncated or oversized buffers with a typed
//! error; callers drop such packets like network noise instead of crashing.

use serde_derive::{Deserialize, Serialize};

use crate::error::Error;

/// Largest datagram the transport will put on the wire.
pub const MAX_PACKET_SIZE: usize = 1024;

/// Transport frame header: protocol id (1 byte) + sequence number (4 bytes).
pub const FRAME_HEADER_SIZE: usize = 5;

/// Consensus packet header: message type (1) + instance (4) + proposal (4).
pub const PAXOS_HEADER_SIZE: usize = 9;

/// Most payload bytes a transport frame can carry.
pub const MAX_FRAME_PAYLOAD: usize = MAX_PACKET_SIZE - FRAME_HEADER_SIZE;

/// Most body bytes a consensus packet can carry, once nested in a frame.
pub const MAX_PAXOS_BODY: usize = MAX_FRAME_PAYLOAD - PAXOS_HEADER_SIZE;

/// Protocol ids demultiplexed by the transport manager. `ACK` is the
/// transport's own; everything else is delivered upward.
pub mod protocol {
    /// Acknowledgment of a data frame. The frame's sequence number field
    /// names the acknowledged frame; the payload is empty.
    pub const ACK: u8 = 1;

    /// Consensus engine traffic.
    pub const PAXOS: u8 = 20;
}

/// Transport frame: `{protocol:1B, seq:4B, payload}`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub protocol: u8,
    pub seq: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Rejects oversized payloads at construction time.
    pub fn new(protocol: u8, seq: u32, payload: Vec<u8>) -> Result<Self, Error> {
        if payload.len() > MAX_FRAME_PAYLOAD {
            return Err(Error::Oversized {
                len: payload.len(),
                max: MAX_FRAME_PAYLOAD,
            });
        }
        Ok(Frame {
            protocol,
            seq,
            payload,
        })
    }

    /// Acknowledgment frame for the data frame numbered `seq`.
    pub fn ack(seq: u32) -> Self {
        Frame {
            protocol: protocol::ACK,
            seq,
            payload: Vec::new(),
        }
    }

    pub fn pack(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.push(self.protocol);
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn unpack(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < FRAME_HEADER_SIZE {
            return Err(Error::Truncated(bytes.len()));
        }
        if bytes.len() > MAX_PACKET_SIZE {
            return Err(Error::Oversized {
                len: bytes.len(),
                max: MAX_PACKET_SIZE,
            });
        }
        Ok(Frame {
            protocol: bytes[0],
            seq: u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]),
            payload: bytes[FRAME_HEADER_SIZE..].to_vec(),
        })
    }
}

/// The five consensus message phases.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Kind {
    Prepare,
    Promise,
    Accept,
    Accepted,
    Decision,
}

impl Kind {
    fn from_u8(byte: u8) -> Result<Self, Error> {
        match byte {
            0 => Ok(Kind::Prepare),
            1 => Ok(Kind::Promise),
            2 => Ok(Kind::Accept),
            3 => Ok(Kind::Accepted),
            4 => Ok(Kind::Decision),
            unknown => Err(Error::UnknownKind(unknown)),
        }
    }
}

/// Consensus packet: `{kind:1B, instance:4B, proposal:4B, body}`, carried as
/// the payload of a transport frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Paxos {
    pub kind: Kind,
    pub instance: u32,
    pub proposal: u32,
    pub body: Vec<u8>,
}

impl Paxos {
    pub fn new(kind: Kind, instance: u32, proposal: u32, body: Vec<u8>) -> Result<Self, Error> {
        if body.len() > MAX_PAXOS_BODY {
            return Err(Error::Oversized {
                len: body.len(),
                max: MAX_PAXOS_BODY,
            });
        }
        Ok(Paxos {
            kind,
            instance,
            proposal,
            body,
        })
    }

    pub fn pack(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(PAXOS_HEADER_SIZE + self.body.len());
        buf.push(self.kind as u8);
        buf.extend_from_slice(&self.instance.to_be_bytes());
        buf.extend_from_slice(&self.proposal.to_be_bytes());
        buf.extend_from_slice(&self.body);
        buf
    }

    pub fn unpack(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < PAXOS_HEADER_SIZE {
            return Err(Error::Truncated(bytes.len()));
        }
        Ok(Paxos {
            kind: Kind::from_u8(bytes[0])?,
            instance: u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]),
            proposal: u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]),
            body: bytes[PAXOS_HEADER_SIZE..].to_vec(),
        })
    }
}

/// A decided slot holds either an application command or the distinguished
/// gap-fill marker. The marker is its own variant rather than a magic byte
/// string, so it can never collide with application bytes.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Noop,
    Command(Vec<u8>),
}

impl Value {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    pub(crate) fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Value::Noop => buf.push(0),
            Value::Command(bytes) => {
                buf.push(1);
                buf.extend_from_slice(bytes);
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        match bytes.split_first() {
            Some((0, rest)) if rest.is_empty() => Ok(Value::Noop),
            Some((1, rest)) => Ok(Value::Command(rest.to_vec())),
            _ => Err(Error::MalformedValue),
        }
    }
}

/// Body of a PROMISE: the acceptor's previously accepted pair when it has
/// one, otherwise an echo of the proposer's own value as a hint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Promise {
    pub accepted_proposal: Option<u32>,
    pub value: Value,
}

impl Promise {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self.accepted_proposal {
            Some(proposal) => {
                buf.push(1);
                buf.extend_from_slice(&proposal.to_be_bytes());
            }
            None => buf.push(0),
        }
        self.value.encode_into(&mut buf);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        match bytes.split_first() {
            Some((0, rest)) => Ok(Promise {
                accepted_proposal: None,
                value: Value::decode(rest)?,
            }),
            Some((1, rest)) if rest.len() >= 4 => Ok(Promise {
                accepted_proposal: Some(u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]])),
                value: Value::decode(&rest[4..])?,
            }),
            _ => Err(Error::MalformedValue),
        }
    }
}
