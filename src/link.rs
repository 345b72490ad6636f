//! # Summary
//!
//! Per-peer channel state for the reliable, in-order, exactly-once layer,
//! split by direction the way the wire is: an [`OutChannel`] assigns
//! sequence numbers and retransmits until acknowledged, an [`InChannel`]
//! deduplicates and reorders before anything reaches the upper layer.
//!
//! Each channel persists its sequence watermark before the action the
//! watermark covers is considered complete, so a crash between any two
//! writes resumes deterministically: a restarted sender never reuses a
//! sequence number, and a restarted receiver never redelivers one.

use std::collections::HashMap as Map;
use std::path::Path;
use std::time::Duration;

use crate::env::{Env, NodeId, Task};
use crate::error::Error;
use crate::packet::Frame;
use crate::storage::Storage;

/// Outgoing half of a link to one peer.
pub struct OutChannel {
    peer: NodeId,
    last_sent: u32,
    storage: Storage<u32>,
    unacked: Map<u32, Frame>,
    attempts: Map<u32, u32>,
}

impl OutChannel {
    /// Opens the channel to `peer`, reloading the outbound watermark if one
    /// was persisted before a crash. Frames that were unacknowledged at
    /// crash time are gone; the layers above re-initiate their own retries.
    pub fn new(dir: &Path, peer: NodeId) -> Self {
        let storage = Storage::new(dir.join(format!("out-{:>03}.seq", peer)));
        let last_sent = storage.load().unwrap_or(0);
        OutChannel {
            peer,
            last_sent,
            storage,
            unacked: Map::default(),
            attempts: Map::default(),
        }
    }

    /// Assigns the next sequence number, makes it durable, transmits, and
    /// arms the retransmission timer.
    pub fn send<E: Env>(
        &mut self,
        env: &mut E,
        timeout: Duration,
        protocol: u8,
        payload: Vec<u8>,
    ) -> Result<(), Error> {
        let frame = Frame::new(protocol, self.last_sent + 1, payload)?;
        self.last_sent += 1;
        self.storage.save(&self.last_sent);
        trace!("sending seq {} to {}", self.last_sent, self.peer);
        env.send(self.peer, frame.pack());
        self.unacked.insert(self.last_sent, frame);
        self.attempts.insert(self.last_sent, 1);
        env.after(
            timeout,
            Task::Retransmit {
                peer: self.peer,
                seq: self.last_sent,
            },
        );
        Ok(())
    }

    /// The peer acknowledged `seq`; its retransmission timer becomes a
    /// no-op. The watermark was made durable at send time, so nothing else
    /// needs to hit disk here.
    pub fn ack(&mut self, seq: u32) {
        if self.unacked.remove(&seq).is_some() {
            trace!("seq {} to {} acknowledged", seq, self.peer);
        }
        self.attempts.remove(&seq);
    }

    /// Retransmission timer fired for `seq`. Early-exits if the frame has
    /// been acknowledged in the meantime.
    pub fn retransmit<E: Env>(
        &mut self,
        env: &mut E,
        timeout: Duration,
        max_attempts: u32,
        seq: u32,
    ) {
        if !self.unacked.contains_key(&seq) {
            return;
        }
        let attempts = self.attempts.get(&seq).copied().unwrap_or(1);
        if attempts >= max_attempts {
            error!(
                "giving up on seq {} to {} after {} attempts",
                seq, self.peer, attempts
            );
            self.unacked.remove(&seq);
            self.attempts.remove(&seq);
            return;
        }
        self.attempts.insert(seq, attempts + 1);
        trace!(
            "retransmitting seq {} to {} (attempt {})",
            seq,
            self.peer,
            attempts + 1
        );
        env.send(self.peer, self.unacked[&seq].pack());
        env.after(
            timeout,
            Task::Retransmit {
                peer: self.peer,
                seq,
            },
        );
    }

    #[cfg(test)]
    pub fn last_sent(&self) -> u32 {
        self.last_sent
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.unacked.len()
    }
}

/// Incoming half of a link from one peer.
pub struct InChannel {
    peer: NodeId,
    last_delivered: u32,
    storage: Storage<u32>,
    buffered: Map<u32, Frame>,
}

impl InChannel {
    pub fn new(dir: &Path, peer: NodeId) -> Self {
        let storage = Storage::new(dir.join(format!("in-{:>03}.seq", peer)));
        let last_delivered = storage.load().unwrap_or(0);
        InChannel {
            peer,
            last_delivered,
            storage,
            buffered: Map::default(),
        }
    }

    /// Accepts one data frame and returns the frames that become
    /// deliverable: the contiguous run starting at the awaited sequence
    /// number. The watermark advances and is persisted past each frame
    /// before it is handed up, so a redelivery after a crash is impossible.
    /// Duplicates and out-of-order frames return an empty batch.
    pub fn receive(&mut self, frame: Frame) -> Vec<Frame> {
        let mut ready = Vec::new();
        if frame.seq == self.last_delivered + 1 {
            self.advance(frame.seq);
            ready.push(frame);
            while let Some(next) = self.buffered.remove(&(self.last_delivered + 1)) {
                self.advance(next.seq);
                ready.push(next);
            }
        } else if frame.seq > self.last_delivered + 1 {
            trace!("buffering out-of-order seq {} from {}", frame.seq, self.peer);
            self.buffered.insert(frame.seq, frame);
        } else {
            trace!("ignoring duplicate seq {} from {}", frame.seq, self.peer);
        }
        ready
    }

    fn advance(&mut self, seq: u32) {
        self.last_delivered = seq;
        self.storage.save(&self.last_delivered);
    }

    #[cfg(test)]
    pub fn last_delivered(&self) -> u32 {
        self.last_delivered
    }
}
