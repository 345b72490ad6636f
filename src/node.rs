//! # Summary
//!
//! A [`Node`] ties one consensus engine to one reliable transport behind a
//! single event-driven entry point. The owning driver feeds it raw
//! datagrams and expired timer tasks through [`Node::handle`]; the node
//! performs all sends and timer registrations through the [`Env`] passed
//! in, so it never touches a socket or clock itself.
//!
//! Consensus traffic is consumed internally; deliveries under any other
//! protocol come back out for the application.

use crate::config::Config;
use crate::engine::{Engine, State};
use crate::env::{Env, NodeId, Task};
use crate::error::Error;
use crate::packet::protocol;
use crate::transport::{Delivery, Transport};

/// A stimulus for [`Node::handle`].
#[derive(Clone, Debug)]
pub enum Event {
    /// A raw datagram arrived from `from`.
    Packet { from: NodeId, bytes: Vec<u8> },
    /// A timer registered through [`Env::after`] expired.
    Task(Task),
}

pub struct Node<S> {
    id: NodeId,
    peers: Vec<NodeId>,
    engine: Engine<S>,
    transport: Transport,
}

impl<S: State> Node<S> {
    /// Recovers durable state from `config.dir`. Call [`Node::start`] once
    /// before feeding events.
    pub fn new(config: &Config, state: S) -> Self {
        Node {
            id: config.id(),
            peers: config.peers().to_vec(),
            engine: Engine::new(config, state),
            transport: Transport::new(config),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Highest instance the application has executed.
    pub fn highest_executed(&self) -> u32 {
        self.engine.highest_executed()
    }

    /// Resumes where recovery left off: executes any decided-but-unexecuted
    /// prefix and restarts proposals for known gaps.
    pub fn start<E: Env>(&mut self, env: &mut E) {
        info!("node {} starting", self.id);
        self.engine.catch_up(env, &mut self.transport);
    }

    /// Submits `payload` for consensus among the configured cluster.
    pub fn replicate<E: Env>(&mut self, env: &mut E, payload: Vec<u8>) {
        let participants = self.peers.clone();
        self.engine
            .replicate(env, &mut self.transport, participants, payload);
    }

    /// Reliable in-order application-level send to `to` under `protocol`,
    /// which must not be one of the reserved protocol ids.
    pub fn send<E: Env>(
        &mut self,
        env: &mut E,
        to: NodeId,
        protocol: u8,
        payload: Vec<u8>,
    ) -> Result<(), Error> {
        self.transport.send(env, to, protocol, payload)
    }

    /// Processes one event, returning any non-consensus deliveries that
    /// became ready for the application.
    pub fn handle<E: Env>(&mut self, env: &mut E, event: Event) -> Vec<Delivery> {
        match event {
            Event::Packet { from, bytes } => {
                let deliveries = self.transport.receive(env, from, &bytes);
                let mut ready = Vec::new();
                for delivery in deliveries {
                    if delivery.protocol == protocol::PAXOS {
                        self.engine.receive(
                            env,
                            &mut self.transport,
                            delivery.from,
                            &delivery.payload,
                        );
                    } else {
                        ready.push(delivery);
                    }
                }
                ready
            }
            Event::Task(Task::Retransmit { peer, seq }) => {
                self.transport.retransmit(env, peer, seq);
                Vec::new()
            }
            Event::Task(Task::Propose { instance }) => {
                self.engine.retry(env, &mut self.transport, instance);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::packet::Frame;

    #[derive(Default)]
    struct Recorder {
        sent: Vec<(NodeId, Vec<u8>)>,
        timers: Vec<(Duration, Task)>,
    }

    impl Env for Recorder {
        fn send(&mut self, to: NodeId, bytes: Vec<u8>) {
            self.sent.push((to, bytes));
        }

        fn after(&mut self, delay: Duration, task: Task) {
            self.timers.push((delay, task));
        }
    }

    struct Nothing;

    impl State for Nothing {
        fn apply(
            &mut self,
            _instance: u32,
            _command: &[u8],
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Ok(())
        }
    }

    #[test]
    fn application_traffic_passes_through() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let mut a = Node::new(&Config::new(0, vec![0, 1], dir_a.path()), Nothing);
        let mut b = Node::new(&Config::new(1, vec![0, 1], dir_b.path()), Nothing);
        let mut env = Recorder::default();

        a.send(&mut env, 1, 42, b"hello".to_vec()).unwrap();
        let (to, bytes) = env.sent.remove(0);
        assert_eq!(to, 1);

        let ready = b.handle(&mut env, Event::Packet { from: 0, bytes });
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].from, 0);
        assert_eq!(ready[0].protocol, 42);
        assert_eq!(ready[0].payload, b"hello");
    }

    #[test]
    fn stale_timer_tasks_are_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let mut node = Node::new(&Config::new(0, vec![0, 1, 2], dir.path()), Nothing);
        let mut env = Recorder::default();

        // Neither task refers to anything in flight.
        let ready = node.handle(&mut env, Event::Task(Task::Retransmit { peer: 1, seq: 7 }));
        assert!(ready.is_empty());
        let ready = node.handle(&mut env, Event::Task(Task::Propose { instance: 3 }));
        assert!(ready.is_empty());
        assert!(env.sent.is_empty());
    }

    #[test]
    fn retransmit_task_resends_the_pending_frame() {
        let dir = tempfile::tempdir().unwrap();
        let mut node = Node::new(&Config::new(0, vec![0, 1], dir.path()), Nothing);
        let mut env = Recorder::default();

        node.send(&mut env, 1, 42, b"again".to_vec()).unwrap();
        let first = env.sent.remove(0).1;
        let seq = Frame::unpack(&first).unwrap().seq;

        node.handle(&mut env, Event::Task(Task::Retransmit { peer: 1, seq }));
        assert_eq!(env.sent.len(), 1);
        assert_eq!(env.sent[0].1, first, "identical frame on retransmission");
    }
}
