use std::net::SocketAddr;

/// Errors that can occur in discovery operations.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] pvwire_transport::TransportError),

    /// Message encode or decode error.
    #[error("frame error: {0}")]
    Frame(#[from] pvwire_frame::FrameError),

    /// Socket or thread I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to send a datagram.
    #[error("failed to send to {addr}: {source}")]
    Send {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// An encoded datagram does not fit the unfragmented send limit.
    #[error("datagram of {size} bytes exceeds {max} bytes")]
    DatagramTooLarge { size: usize, max: usize },

    /// The engine was already stopped.
    #[error("discovery engine stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;
