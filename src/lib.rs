//! # Summary
//!
//! `accord` replicates an ordered log of commands across a set of nodes and
//! applies each command exactly once, in the same order, on every node. Each
//! log slot is agreed upon independently with single-decree Paxos, layered on
//! a reliable, in-order, exactly-once point-to-point transport that absorbs
//! message loss, duplication, and reordering.
//!
//! The protocol core is synchronous, single-writer state machine code: every
//! inbound datagram and timer fire is handled to completion through
//! [`Node::handle`], so no protocol state needs a lock. The host supplies the
//! unreliable network and timer facility through the [`Env`] trait; [`spawn`]
//! provides a tokio/UDP driver implementing it.

#[macro_use]
extern crate log;

mod config;
mod engine;
mod env;
mod error;
mod link;
mod node;
mod packet;
mod round;
mod runtime;
mod storage;
mod transport;

pub use crate::config::Config;
pub use crate::engine::{AcceptorRecord, DecidedRecord, State};
pub use crate::env::{Env, NodeId, Task};
pub use crate::error::Error;
pub use crate::node::{Event, Node};
pub use crate::packet::{protocol, Frame, Kind, Paxos, Value, MAX_PACKET_SIZE};
pub use crate::round::ProposalNumber;
pub use crate::runtime::{spawn, Handle};
pub use crate::transport::{Delivery, Transport};
