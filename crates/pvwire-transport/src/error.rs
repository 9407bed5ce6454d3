use std::net::SocketAddr;

/// Errors that can occur while provisioning sockets or resolving addresses.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind to the specified address.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// Failed to connect to the specified address.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred on the transport stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An address specification could not be parsed or resolved.
    #[error("invalid address '{spec}': {reason}")]
    InvalidAddress { spec: String, reason: String },

    /// Local network interfaces could not be enumerated.
    #[error("cannot list network interfaces: {0}")]
    Interfaces(std::io::Error),

    /// A secure connection was requested but the factory cannot provide one.
    #[error("secure transport not available for {0}")]
    SecureUnavailable(SocketAddr),

    /// Secure handshake or peer verification failed.
    #[error("secure handshake with {addr} failed: {reason}")]
    Handshake { addr: SocketAddr, reason: String },

    /// The transport has been shut down.
    #[error("transport shut down")]
    Shutdown,
}

impl TransportError {
    pub(crate) fn invalid_address(spec: &str, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            spec: spec.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
