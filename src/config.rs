use std::path::PathBuf;
use std::time::Duration;

use crate::env::NodeId;

/// Per-node settings. Construct with [`Config::new`] and refine with the
/// `with_*` builders.
#[derive(Clone, Debug)]
pub struct Config {
    /// Unique id of this node.
    pub(crate) id: NodeId,

    /// Full cluster membership, including this node. Used as the participant
    /// set for gap-fill proposals.
    pub(crate) peers: Vec<NodeId>,

    /// Directory holding every durable log this node writes.
    pub(crate) dir: PathBuf,

    /// Delay before an unacknowledged frame is retransmitted.
    pub(crate) retransmit_timeout: Duration,

    /// Retransmissions per frame before the transport gives up on it.
    pub(crate) max_send_attempts: u32,

    /// Base delay before an unresolved proposal is retried; the actual delay
    /// is randomized and grows with every retry.
    pub(crate) proposal_delay: Duration,
}

impl Config {
    pub fn new<P: Into<PathBuf>>(id: NodeId, peers: Vec<NodeId>, dir: P) -> Self {
        Config {
            id,
            peers,
            dir: dir.into(),
            retransmit_timeout: Duration::from_millis(500),
            max_send_attempts: u32::MAX,
            proposal_delay: Duration::from_millis(100),
        }
    }

    pub fn with_retransmit_timeout(mut self, timeout: Duration) -> Self {
        self.retransmit_timeout = timeout;
        self
    }

    pub fn with_max_send_attempts(mut self, attempts: u32) -> Self {
        self.max_send_attempts = attempts;
        self
    }

    pub fn with_proposal_delay(mut self, delay: Duration) -> Self {
        self.proposal_delay = delay;
        self
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn peers(&self) -> &[NodeId] {
        &self.peers
    }
}
