use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};

use serde::Serialize;

use crate::error::Result;

/// Identity of the remote end of a secure connection, established by the
/// socket provider after its handshake completed.
///
/// Certificate validation happens entirely on the provider side; the
/// transport only carries the resulting descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerIdentity {
    /// Common name of the authenticated principal.
    pub principal: String,
    /// Host name the peer presented.
    pub host: String,
    /// Channel publishing the status of the peer certificate, if any.
    pub cert_status_channel: Option<String>,
}

/// A connected stream to a PVA peer — implements Read + Write.
///
/// This is the fundamental I/O type returned by transport operations.
/// Plain connections carry no identity; secure connections carry the
/// [`PeerIdentity`] produced by the provider.
pub struct PvaStream {
    inner: PvaStreamInner,
    identity: Option<PeerIdentity>,
}

enum PvaStreamInner {
    Tcp(TcpStream),
}

impl Read for PvaStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            PvaStreamInner::Tcp(stream) => stream.read(buf),
        }
    }
}

impl Write for PvaStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            PvaStreamInner::Tcp(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.inner {
            PvaStreamInner::Tcp(stream) => stream.flush(),
        }
    }
}

impl PvaStream {
    /// Wrap a plain TCP stream.
    pub fn from_tcp(stream: TcpStream) -> Self {
        Self {
            inner: PvaStreamInner::Tcp(stream),
            identity: None,
        }
    }

    /// Wrap a stream whose secure handshake was completed by the provider.
    pub fn secured(stream: TcpStream, identity: PeerIdentity) -> Self {
        Self {
            inner: PvaStreamInner::Tcp(stream),
            identity: Some(identity),
        }
    }

    /// Was the stream provisioned as a secure connection?
    pub fn is_secure(&self) -> bool {
        self.identity.is_some()
    }

    /// Post-handshake identity of the peer, `None` for plain connections.
    pub fn peer_identity(&self) -> Option<&PeerIdentity> {
        self.identity.as_ref()
    }

    /// Address of the remote peer.
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        match &self.inner {
            PvaStreamInner::Tcp(stream) => stream.peer_addr().map_err(Into::into),
        }
    }

    /// Local address of this end of the stream.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        match &self.inner {
            PvaStreamInner::Tcp(stream) => stream.local_addr().map_err(Into::into),
        }
    }

    /// Set read timeout on the underlying stream.
    pub fn set_read_timeout(&self, timeout: Option<std::time::Duration>) -> Result<()> {
        match &self.inner {
            PvaStreamInner::Tcp(stream) => stream.set_read_timeout(timeout).map_err(Into::into),
        }
    }

    /// Set write timeout on the underlying stream.
    pub fn set_write_timeout(&self, timeout: Option<std::time::Duration>) -> Result<()> {
        match &self.inner {
            PvaStreamInner::Tcp(stream) => stream.set_write_timeout(timeout).map_err(Into::into),
        }
    }

    /// Try to clone this stream (creates a new file descriptor).
    ///
    /// The clone shares the connection and its identity.
    pub fn try_clone(&self) -> Result<Self> {
        match &self.inner {
            PvaStreamInner::Tcp(stream) => Ok(Self {
                inner: PvaStreamInner::Tcp(stream.try_clone()?),
                identity: self.identity.clone(),
            }),
        }
    }

    /// Shut down both directions.
    ///
    /// A thread parked in a blocking read on any clone of this stream
    /// returns with end-of-stream or an error.
    pub fn shutdown(&self) -> Result<()> {
        match &self.inner {
            PvaStreamInner::Tcp(stream) => match stream.shutdown(Shutdown::Both) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotConnected => Ok(()),
                Err(err) => Err(err.into()),
            },
        }
    }

    /// Configure the stream for request/response traffic: no Nagle delay,
    /// TCP keep-alive enabled.
    pub fn configure_for_pva(&self) -> Result<()> {
        match &self.inner {
            PvaStreamInner::Tcp(stream) => {
                stream.set_nodelay(true)?;
                set_keepalive(stream)?;
                Ok(())
            }
        }
    }
}

#[cfg(unix)]
fn set_keepalive(stream: &TcpStream) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;

    let enable: libc::c_int = 1;
    // SAFETY: `fd` is an open socket owned by `stream`, and `enable` is a valid
    // readable c_int for the duration of the call.
    let rc = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            (&enable as *const libc::c_int).cast::<libc::c_void>(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn set_keepalive(_stream: &TcpStream) -> std::io::Result<()> {
    Ok(())
}

impl std::fmt::Debug for PvaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut dbg = f.debug_struct("PvaStream");
        match &self.inner {
            PvaStreamInner::Tcp(stream) => {
                dbg.field("type", &"tcp");
                if let Ok(peer) = stream.peer_addr() {
                    dbg.field("peer", &peer);
                }
            }
        }
        dbg.field("secure", &self.is_secure()).finish()
    }
}
