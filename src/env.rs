//! # Summary
//!
//! This module defines the lower boundary of the crate: an unreliable
//! datagram network and a single-shot timer facility, supplied by the host.
//! Timers carry a [`Task`], a closed union of the retry kinds the protocol
//! schedules, so a fired timer can be routed without any dynamic dispatch.
//! Stale tasks are expected: handlers early-exit once the state they cover
//! has already advanced.

use std::time::Duration;

/// Network address of a node. Also the low byte of every proposal number,
/// which is what keeps ballots from different nodes from colliding.
pub type NodeId = u8;

/// Retry work scheduled on the host timer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Task {
    /// Retransmit frame `seq` to `peer` unless it has been acknowledged.
    Retransmit { peer: NodeId, seq: u32 },
    /// Re-run phase 1 for `instance` unless it has been decided.
    Propose { instance: u32 },
}

/// Host runtime services consumed by the protocol core.
pub trait Env {
    /// Fire-and-forget datagram send. The network may drop, duplicate,
    /// delay, or reorder it arbitrarily.
    fn send(&mut self, to: NodeId, bytes: Vec<u8>);

    /// Schedules `task` to be handed back through the event loop after
    /// `delay`.
    fn after(&mut self, delay: Duration, task: Task);
}
