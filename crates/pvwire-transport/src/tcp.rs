use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::traits::PvaStream;

/// Supplies connected sockets to the connection layer.
///
/// Implementations may perform a secure handshake before returning; the
/// resulting stream then carries the peer identity. A failed handshake is
/// reported as an error, never as a half-initialized stream.
pub trait SocketFactory: Send + Sync {
    /// Connect to `addr`, using secure transport when `secure` is set.
    fn connect(&self, addr: SocketAddr, secure: bool) -> Result<PvaStream>;
}

/// Factory for plain TCP connections.
///
/// Secure connections are not provided; requesting one fails with
/// [`TransportError::SecureUnavailable`].
#[derive(Debug, Clone, Default)]
pub struct PlainSocketFactory {
    connect_timeout: Option<Duration>,
}

impl PlainSocketFactory {
    /// Create a factory with an explicit connect timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            connect_timeout: Some(timeout),
        }
    }
}

impl SocketFactory for PlainSocketFactory {
    fn connect(&self, addr: SocketAddr, secure: bool) -> Result<PvaStream> {
        if secure {
            return Err(TransportError::SecureUnavailable(addr));
        }
        TcpTransport::connect(addr, self.connect_timeout)
    }
}

/// TCP listener for accepting PVA client connections.
pub struct TcpTransport {
    listener: TcpListener,
    addr: SocketAddr,
}

impl TcpTransport {
    /// Bind and listen on the given address.
    ///
    /// Port 0 binds an ephemeral port; [`TcpTransport::local_addr`] reports
    /// the one actually assigned.
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let listener =
            TcpListener::bind(addr).map_err(|source| TransportError::Bind { addr, source })?;
        let addr = listener
            .local_addr()
            .map_err(|source| TransportError::Bind { addr, source })?;
        info!(%addr, "listening for tcp connections");
        Ok(Self { listener, addr })
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<(PvaStream, SocketAddr)> {
        let (stream, peer) = self.listener.accept().map_err(TransportError::Accept)?;
        let stream = PvaStream::from_tcp(stream);
        stream.configure_for_pva()?;
        debug!(%peer, "accepted connection");
        Ok((stream, peer))
    }

    /// Connect to a listening PVA server (blocking).
    pub fn connect(addr: SocketAddr, timeout: Option<Duration>) -> Result<PvaStream> {
        let stream = match timeout {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
            None => TcpStream::connect(addr),
        }
        .map_err(|source| TransportError::Connect { addr, source })?;
        let stream = PvaStream::from_tcp(stream);
        stream.configure_for_pva()?;
        debug!(%addr, "connected to tcp server");
        Ok(stream)
    }

    /// The address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Transport name as advertised in search requests and replies.
    pub fn transport_name(&self) -> &'static str {
        "tcp"
    }
}
