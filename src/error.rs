use thiserror::Error;

/// Recoverable faults. Malformed traffic is dropped by the caller like
/// network noise; only durable-storage failures are fatal, and those halt
/// the node inside the storage layer instead of surfacing here.
#[derive(Debug, Error)]
pub enum Error {
    #[error("buffer of {0} bytes is shorter than the packet header")]
    Truncated(usize),

    #[error("payload of {len} bytes exceeds the limit of {max}")]
    Oversized { len: usize, max: usize },

    #[error("unknown consensus message type {0}")]
    UnknownKind(u8),

    #[error("malformed value encoding")]
    MalformedValue,

    #[error("no address configured for node {0}")]
    UnknownPeer(crate::env::NodeId),
}
