use std::time::Duration;

/// Errors that can occur in connection operations.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] pvwire_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] pvwire_frame::FrameError),

    /// Thread or socket I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The send queue is full; the item was not queued.
    #[error("send queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// The connection is closed or closing.
    #[error("connection closed")]
    Closed,

    /// The socket has not been established yet.
    #[error("connection not established")]
    NotConnected,

    /// An operation did not complete in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

pub type Result<T> = std::result::Result<T, PeerError>;
