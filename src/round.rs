//! # Summary
//!
//! Per-instance consensus state: one [`Round`] per slot of the replicated
//! log, holding the proposer, acceptor, and learner sides together. A round
//! is only ever mutated by its owning engine (single writer); it is never
//! deleted, only marked decided and then executed.

use std::collections::HashSet as Set;

use serde_derive::{Deserialize, Serialize};

use crate::env::NodeId;
use crate::packet::Value;

/// Ballot number: attempt counter in the high 24 bits, proposing node id in
/// the low 8. Numbers from different nodes can never collide and are always
/// comparable.
#[derive(Serialize, Deserialize)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProposalNumber(u32);

impl ProposalNumber {
    pub fn new(attempt: u32, node: NodeId) -> Self {
        // Attempts above 24 bits would shift into the node byte and break
        // the no-collision guarantee.
        debug_assert!(attempt < 1 << 24, "ballot attempt {} overflows", attempt);
        ProposalNumber((attempt << 8) | u32::from(node))
    }

    /// The first number `node` ever proposes with.
    pub fn first(node: NodeId) -> Self {
        ProposalNumber::new(1, node)
    }

    /// Smallest number owned by `node` that beats `self`.
    pub fn bump(self, node: NodeId) -> Self {
        ProposalNumber::new(self.attempt() + 1, node)
    }

    pub fn attempt(self) -> u32 {
        self.0 >> 8
    }

    pub fn node(self) -> NodeId {
        (self.0 & 0xff) as NodeId
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub fn from_u32(raw: u32) -> Self {
        ProposalNumber(raw)
    }
}

/// One slot of the replicated log.
pub struct Round {
    pub instance: u32,

    // Proposer state.
    /// Ballot this node is currently pushing, if it is proposing.
    pub proposal: Option<ProposalNumber>,
    /// Value the proposer is pushing: its own command, an adopted value, or
    /// the gap-fill marker.
    pub value: Option<Value>,
    /// This node's own submitted payload, kept so it can be resubmitted
    /// under a fresh instance if this slot decides differently.
    pub submitted: Option<Vec<u8>>,
    pub participants: Vec<NodeId>,
    pub promised_by: Set<NodeId>,
    pub accepted_by: Set<NodeId>,
    /// Highest previously-accepted pair revealed by a promise so far.
    pub highest_accepted: Option<(ProposalNumber, Value)>,

    // Acceptor state; durable before any reply leaves the node.
    pub promised: Option<ProposalNumber>,
    pub accepted: Option<(ProposalNumber, Value)>,

    // Learner state; immutable once set.
    pub decided: Option<Value>,
    pub executed: bool,

    /// Multiplier over the configured base delay for the next phase-1
    /// retry; randomized so competing proposers fall out of lockstep.
    pub backoff: f32,
}

impl Round {
    pub fn new(instance: u32) -> Self {
        Round {
            instance,
            proposal: None,
            value: None,
            submitted: None,
            participants: Vec::new(),
            promised_by: Set::default(),
            accepted_by: Set::default(),
            highest_accepted: None,
            promised: None,
            accepted: None,
            decided: None,
            executed: false,
            backoff: 1.0 + rand::random::<f32>(),
        }
    }

    /// Quorum is any subset larger than half the participants, so any two
    /// quorums intersect.
    pub fn quorum(&self) -> usize {
        self.participants.len() / 2 + 1
    }

    /// Classic Paxos safety rule: a proposer must carry forward the most
    /// recent known-accepted value, never override it with its own.
    pub fn observe_accepted(&mut self, number: ProposalNumber, value: Value) {
        match &self.highest_accepted {
            Some((highest, _)) if *highest >= number => (),
            _ => {
                self.value = Some(value.clone());
                self.highest_accepted = Some((number, value));
            }
        }
    }
}
