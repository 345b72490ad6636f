//! Deterministic cluster simulator: a virtual clock in milliseconds, a
//! seeded lossy network, and restartable nodes sharing one applied-command
//! ledger per node id so double-application survives restarts.

#![allow(dead_code)]

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::collections::HashMap as Map;
use std::collections::HashSet as Set;
use std::rc::Rc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;

use accord::{Config, Delivery, Env, Event, Node, NodeId, State, Task};

/// Routes crate logs through the test harness when `RUST_LOG` is set.
pub fn logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

enum Stimulus {
    Packet { from: NodeId, bytes: Vec<u8> },
    Task(Task),
}

struct Scheduled {
    at: u64,
    seq: u64,
    to: NodeId,
    stimulus: Stimulus,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        (self.at, self.seq) == (other.at, other.seq)
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

/// The unreliable datagram network plus the virtual clock.
pub struct Net {
    now: u64,
    counter: u64,
    queue: BinaryHeap<Reverse<Scheduled>>,
    rng: StdRng,
    /// Probability an individual datagram is lost.
    pub drop_rate: f64,
    /// Probability an individual datagram is delivered twice.
    pub dup_rate: f64,
    /// Delivery delay is drawn uniformly from `1..=max_delay` ticks.
    pub max_delay: u64,
    blocked: Set<(NodeId, NodeId)>,
    down: Set<NodeId>,
}

impl Net {
    fn new(seed: u64) -> Self {
        Net {
            now: 0,
            counter: 0,
            queue: BinaryHeap::new(),
            rng: StdRng::seed_from_u64(seed),
            drop_rate: 0.0,
            dup_rate: 0.0,
            max_delay: 1,
            blocked: Set::new(),
            down: Set::new(),
        }
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    fn push(&mut self, at: u64, to: NodeId, stimulus: Stimulus) {
        let seq = self.counter;
        self.counter += 1;
        self.queue.push(Reverse(Scheduled {
            at,
            seq,
            to,
            stimulus,
        }));
    }

    fn delay(&mut self) -> u64 {
        if self.max_delay <= 1 {
            1
        } else {
            self.rng.gen_range(1..=self.max_delay)
        }
    }

    fn transmit(&mut self, from: NodeId, to: NodeId, bytes: Vec<u8>) {
        if self.blocked.contains(&(from, to)) {
            return;
        }
        if self.drop_rate > 0.0 && self.rng.gen_bool(self.drop_rate) {
            return;
        }
        let duplicate = self.dup_rate > 0.0 && self.rng.gen_bool(self.dup_rate);
        let at = self.now + self.delay();
        self.push(
            at,
            to,
            Stimulus::Packet {
                from,
                bytes: bytes.clone(),
            },
        );
        if duplicate {
            let at = self.now + self.delay();
            self.push(at, to, Stimulus::Packet { from, bytes });
        }
    }

    fn schedule(&mut self, to: NodeId, delay: Duration, task: Task) {
        let ticks = (delay.as_millis() as u64).max(1);
        let at = self.now + ticks;
        self.push(at, to, Stimulus::Task(task));
    }
}

/// One node's view of the network for the duration of one event.
pub struct SimEnv<'a> {
    id: NodeId,
    net: &'a mut Net,
}

impl Env for SimEnv<'_> {
    fn send(&mut self, to: NodeId, bytes: Vec<u8>) {
        self.net.transmit(self.id, to, bytes);
    }

    fn after(&mut self, delay: Duration, task: Task) {
        self.net.schedule(self.id, delay, task);
    }
}

/// Shared applied-command ledger. The `Rc` survives node restarts, so a
/// restarted node that re-applies an instance shows up as a duplicate.
#[derive(Clone, Default)]
pub struct TestState {
    pub applied: Rc<RefCell<Vec<(u32, Vec<u8>)>>>,
}

impl State for TestState {
    fn apply(
        &mut self,
        instance: u32,
        command: &[u8],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.applied.borrow_mut().push((instance, command.to_vec()));
        Ok(())
    }
}

pub struct Cluster {
    pub net: Net,
    nodes: Map<NodeId, Node<TestState>>,
    dirs: Map<NodeId, tempfile::TempDir>,
    configs: Map<NodeId, Config>,
    applied: Map<NodeId, Rc<RefCell<Vec<(u32, Vec<u8>)>>>>,
    /// Non-consensus deliveries that reached each node's application.
    pub delivered: Map<NodeId, Vec<Delivery>>,
}

impl Cluster {
    pub fn new(ids: &[NodeId], seed: u64) -> Self {
        let mut cluster = Cluster {
            net: Net::new(seed),
            nodes: Map::new(),
            dirs: Map::new(),
            configs: Map::new(),
            applied: Map::new(),
            delivered: Map::new(),
        };
        for &id in ids {
            let dir = tempfile::tempdir().unwrap();
            let config = Config::new(id, ids.to_vec(), dir.path());
            let applied = Rc::new(RefCell::new(Vec::new()));
            let mut node = Node::new(
                &config,
                TestState {
                    applied: applied.clone(),
                },
            );
            node.start(&mut SimEnv {
                id,
                net: &mut cluster.net,
            });
            cluster.nodes.insert(id, node);
            cluster.dirs.insert(id, dir);
            cluster.configs.insert(id, config);
            cluster.applied.insert(id, applied);
            cluster.delivered.insert(id, Vec::new());
        }
        cluster
    }

    /// Processes every scheduled stimulus with a timestamp at or before
    /// `until`, then advances the clock to `until`.
    pub fn run(&mut self, until: u64) {
        loop {
            match self.net.queue.peek() {
                Some(Reverse(next)) if next.at <= until => (),
                _ => break,
            }
            let Reverse(scheduled) = self.net.queue.pop().unwrap();
            self.net.now = scheduled.at;
            if self.net.down.contains(&scheduled.to) {
                continue;
            }
            let node = match self.nodes.get_mut(&scheduled.to) {
                Some(node) => node,
                None => continue,
            };
            let event = match scheduled.stimulus {
                Stimulus::Packet { from, bytes } => Event::Packet { from, bytes },
                Stimulus::Task(task) => Event::Task(task),
            };
            let ready = node.handle(
                &mut SimEnv {
                    id: scheduled.to,
                    net: &mut self.net,
                },
                event,
            );
            self.delivered.get_mut(&scheduled.to).unwrap().extend(ready);
        }
        self.net.now = until;
    }

    pub fn replicate(&mut self, id: NodeId, payload: &[u8]) {
        let node = self.nodes.get_mut(&id).unwrap();
        node.replicate(
            &mut SimEnv {
                id,
                net: &mut self.net,
            },
            payload.to_vec(),
        );
    }

    pub fn send(&mut self, from: NodeId, to: NodeId, protocol: u8, payload: &[u8]) {
        let node = self.nodes.get_mut(&from).unwrap();
        node.send(
            &mut SimEnv {
                id: from,
                net: &mut self.net,
            },
            to,
            protocol,
            payload.to_vec(),
        )
        .unwrap();
    }

    /// Takes the node offline: its in-memory state is discarded, queued
    /// stimuli addressed to it are dropped on arrival, and only its durable
    /// directory survives.
    pub fn crash(&mut self, id: NodeId) {
        self.nodes.remove(&id);
        self.net.down.insert(id);
    }

    /// Brings a crashed node back from its durable directory. The applied
    /// ledger is the same one as before the crash.
    pub fn restart(&mut self, id: NodeId) {
        self.net.down.remove(&id);
        let config = self.configs.get(&id).unwrap().clone();
        let mut node = Node::new(
            &config,
            TestState {
                applied: self.applied.get(&id).unwrap().clone(),
            },
        );
        node.start(&mut SimEnv {
            id,
            net: &mut self.net,
        });
        self.nodes.insert(id, node);
    }

    /// Severs the link in both directions.
    pub fn block(&mut self, a: NodeId, b: NodeId) {
        self.net.blocked.insert((a, b));
        self.net.blocked.insert((b, a));
    }

    pub fn unblock(&mut self, a: NodeId, b: NodeId) {
        self.net.blocked.remove(&(a, b));
        self.net.blocked.remove(&(b, a));
    }

    pub fn applied(&self, id: NodeId) -> Vec<(u32, Vec<u8>)> {
        self.applied.get(&id).unwrap().borrow().clone()
    }

    pub fn node(&self, id: NodeId) -> &Node<TestState> {
        self.nodes.get(&id).unwrap()
    }
}
