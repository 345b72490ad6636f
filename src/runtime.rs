//! # Summary
//!
//! Tokio driver for a [`Node`]: one task owns the node and everything it
//! touches, multiplexing UDP datagrams, expired timers, and client
//! commands. The node performs sends and timer registrations through a
//! buffering [`Env`]; the driver flushes those effects after every event,
//! so the protocol core never blocks on the socket.
//!
//! UDP is the deliberately unreliable layer underneath the transport: a
//! failed `send_to` is just a dropped datagram and is logged at trace.

use std::collections::HashMap as Map;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

use crate::config::Config;
use crate::engine::State;
use crate::env::{Env, NodeId, Task};
use crate::error::Error;
use crate::node::{Event, Node};
use crate::packet::MAX_PACKET_SIZE;
use crate::transport::Delivery;

enum Command {
    Replicate(Vec<u8>),
    Send {
        to: NodeId,
        protocol: u8,
        payload: Vec<u8>,
    },
}

/// Client half of a spawned node. Dropping it shuts the node down.
pub struct Handle {
    commands: mpsc::UnboundedSender<Command>,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
}

impl Handle {
    /// Submits `payload` for consensus among the configured cluster.
    pub fn replicate(&self, payload: Vec<u8>) {
        if self.commands.send(Command::Replicate(payload)).is_err() {
            warn!("replicate after node shutdown");
        }
    }

    /// Reliable in-order application-level send.
    pub fn send(&self, to: NodeId, protocol: u8, payload: Vec<u8>) {
        let command = Command::Send {
            to,
            protocol,
            payload,
        };
        if self.commands.send(command).is_err() {
            warn!("send after node shutdown");
        }
    }

    /// Next non-consensus delivery, or `None` once the node is gone.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.deliveries.recv().await
    }
}

/// Effects accumulated while the node handles one event.
#[derive(Default)]
struct Pending {
    out: Vec<(NodeId, Vec<u8>)>,
    timers: Vec<(Duration, Task)>,
}

impl Env for Pending {
    fn send(&mut self, to: NodeId, bytes: Vec<u8>) {
        self.out.push((to, bytes));
    }

    fn after(&mut self, delay: Duration, task: Task) {
        self.timers.push((delay, task));
    }
}

/// Binds this node's UDP address from `addresses`, recovers durable state
/// from `config.dir`, and spawns the driver task.
pub async fn spawn<S: State + Send + 'static>(
    config: Config,
    addresses: Map<NodeId, SocketAddr>,
    state: S,
) -> Result<Handle, io::Error> {
    let address = addresses.get(&config.id()).copied().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            Error::UnknownPeer(config.id()),
        )
    })?;
    let socket = UdpSocket::bind(address).await?;
    let node = Node::new(&config, state);
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
    tokio::spawn(run(node, socket, addresses, command_rx, delivery_tx));
    Ok(Handle {
        commands: command_tx,
        deliveries: delivery_rx,
    })
}

async fn run<S: State>(
    mut node: Node<S>,
    socket: UdpSocket,
    addresses: Map<NodeId, SocketAddr>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    deliveries: mpsc::UnboundedSender<Delivery>,
) {
    let senders: Map<SocketAddr, NodeId> = addresses
        .iter()
        .map(|(&id, &address)| (address, id))
        .collect();
    let mut timers: Vec<(Instant, Task)> = Vec::new();
    let mut pending = Pending::default();
    let mut buf = [0u8; MAX_PACKET_SIZE];

    node.start(&mut pending);
    flush(&socket, &addresses, &mut pending, &mut timers).await;

    loop {
        let deadline = timers.iter().map(|(at, _)| *at).min();
        tokio::select! {
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                let now = Instant::now();
                let mut due = Vec::new();
                timers.retain(|(at, task)| {
                    if *at <= now {
                        due.push(task.clone());
                        false
                    } else {
                        true
                    }
                });
                for task in due {
                    forward(&deliveries, node.handle(&mut pending, Event::Task(task)));
                }
            }
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((len, address)) => match senders.get(&address) {
                        Some(&from) => {
                            let event = Event::Packet { from, bytes: buf[..len].to_vec() };
                            forward(&deliveries, node.handle(&mut pending, event));
                        }
                        None => trace!("dropping datagram from unknown address {}", address),
                    },
                    Err(err) => warn!("socket receive failed: {}", err),
                }
            }
            command = commands.recv() => {
                match command {
                    Some(Command::Replicate(payload)) => node.replicate(&mut pending, payload),
                    Some(Command::Send { to, protocol, payload }) => {
                        if let Err(err) = node.send(&mut pending, to, protocol, payload) {
                            error!("send to {} failed: {}", to, err);
                        }
                    }
                    None => {
                        info!("node {} shutting down", node.id());
                        return;
                    }
                }
            }
        }
        flush(&socket, &addresses, &mut pending, &mut timers).await;
    }
}

async fn flush(
    socket: &UdpSocket,
    addresses: &Map<NodeId, SocketAddr>,
    pending: &mut Pending,
    timers: &mut Vec<(Instant, Task)>,
) {
    for (to, bytes) in pending.out.drain(..) {
        match addresses.get(&to) {
            // A failed send is indistinguishable from a lost datagram;
            // retransmission covers it.
            Some(address) => {
                if let Err(err) = socket.send_to(&bytes, address).await {
                    trace!("dropped datagram to {}: {}", to, err);
                }
            }
            None => warn!("no address configured for peer {}", to),
        }
    }
    let now = Instant::now();
    for (delay, task) in pending.timers.drain(..) {
        timers.push((now + delay, task));
    }
}

fn forward(deliveries: &mpsc::UnboundedSender<Delivery>, ready: Vec<Delivery>) {
    for delivery in ready {
        if deliveries.send(delivery).is_err() {
            // Handle dropped; the node will exit on the command channel.
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::mpsc as std_mpsc;

    struct Channelled(std_mpsc::Sender<(u32, Vec<u8>)>);

    impl State for Channelled {
        fn apply(
            &mut self,
            instance: u32,
            command: &[u8],
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.0.send((instance, command.to_vec()))?;
            Ok(())
        }
    }

    fn free_address() -> SocketAddr {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap()
    }

    // Multi-threaded so the blocking channel reads below cannot starve the
    // node task.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn single_node_replicates_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(0, vec![0], dir.path());
        let mut addresses = Map::new();
        addresses.insert(0, free_address());

        let (tx, rx) = std_mpsc::channel();
        let handle = spawn(config, addresses, Channelled(tx)).await.unwrap();
        handle.replicate(b"first".to_vec());
        handle.replicate(b"second".to_vec());

        let timeout = Duration::from_secs(5);
        assert_eq!(rx.recv_timeout(timeout).unwrap(), (1, b"first".to_vec()));
        assert_eq!(rx.recv_timeout(timeout).unwrap(), (2, b"second".to_vec()));
    }

    #[tokio::test]
    async fn application_sends_reach_the_peer() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let mut addresses = Map::new();
        addresses.insert(0, free_address());
        addresses.insert(1, free_address());

        let (tx, _rx) = std_mpsc::channel();
        let a = spawn(
            Config::new(0, vec![0, 1], dir_a.path()),
            addresses.clone(),
            Channelled(tx.clone()),
        )
        .await
        .unwrap();
        let mut b = spawn(
            Config::new(1, vec![0, 1], dir_b.path()),
            addresses,
            Channelled(tx),
        )
        .await
        .unwrap();

        a.send(1, 42, b"ping".to_vec());
        let delivery = tokio::time::timeout(Duration::from_secs(5), b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.from, 0);
        assert_eq!(delivery.protocol, 42);
        assert_eq!(delivery.payload, b"ping");
    }
}
