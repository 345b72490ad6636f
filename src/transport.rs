//! # Summary
//!
//! The transport manager owns one inbound and one outbound channel per peer,
//! created lazily on first contact, and frames every payload with a protocol
//! id so consumers above it can be demultiplexed. Acknowledgments are
//! generated here for every data frame, duplicate or not; they are
//! fire-and-forget, since a lost ACK just costs one more retransmission.

use std::collections::HashMap as Map;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::Config;
use crate::env::{Env, NodeId};
use crate::error::Error;
use crate::link::{InChannel, OutChannel};
use crate::packet::{protocol, Frame};

/// A payload handed up by the transport, tagged with its origin and
/// protocol id. Delivery is exactly-once and in-order per peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub from: NodeId,
    pub protocol: u8,
    pub payload: Vec<u8>,
}

/// Reliable, in-order messaging over an unreliable datagram network.
pub struct Transport {
    dir: PathBuf,
    timeout: Duration,
    max_attempts: u32,
    inbound: Map<NodeId, InChannel>,
    outbound: Map<NodeId, OutChannel>,
}

impl Transport {
    pub fn new(config: &Config) -> Self {
        Transport {
            dir: config.dir.clone(),
            timeout: config.retransmit_timeout,
            max_attempts: config.max_send_attempts,
            inbound: Map::default(),
            outbound: Map::default(),
        }
    }

    /// Sends `payload` to `to` under `protocol`, reliably and in order.
    pub fn send<E: Env>(
        &mut self,
        env: &mut E,
        to: NodeId,
        protocol: u8,
        payload: Vec<u8>,
    ) -> Result<(), Error> {
        let out = self
            .outbound
            .entry(to)
            .or_insert_with(|| OutChannel::new(&self.dir, to));
        out.send(env, self.timeout, protocol, payload)
    }

    /// Processes one raw datagram from `from`, returning whatever became
    /// deliverable. Malformed input is dropped like network noise.
    pub fn receive<E: Env>(&mut self, env: &mut E, from: NodeId, bytes: &[u8]) -> Vec<Delivery> {
        let frame = match Frame::unpack(bytes) {
            Ok(frame) => frame,
            Err(err) => {
                debug!("dropping malformed frame from {}: {}", from, err);
                return Vec::new();
            }
        };

        if frame.protocol == protocol::ACK {
            if let Some(out) = self.outbound.get_mut(&from) {
                out.ack(frame.seq);
            }
            return Vec::new();
        }

        // Every data frame is acknowledged, whether it is new, buffered,
        // or a duplicate: the sender only stops retrying once an ACK lands.
        env.send(from, Frame::ack(frame.seq).pack());

        let inbound = self
            .inbound
            .entry(from)
            .or_insert_with(|| InChannel::new(&self.dir, from));
        inbound
            .receive(frame)
            .into_iter()
            .map(|frame| Delivery {
                from,
                protocol: frame.protocol,
                payload: frame.payload,
            })
            .collect()
    }

    /// Retransmission timer fired for (`peer`, `seq`).
    pub fn retransmit<E: Env>(&mut self, env: &mut E, peer: NodeId, seq: u32) {
        if let Some(out) = self.outbound.get_mut(&peer) {
            out.retransmit(env, self.timeout, self.max_attempts, seq);
        }
    }
}
