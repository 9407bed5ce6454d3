//! Datagram receive loop and sub-message demultiplexing.
//!
//! One datagram may carry several messages back to back, each with its own
//! header and byte order. A message whose declared payload exceeds what is
//! left of the datagram ends processing of that datagram; there are no
//! partial messages on a connectionless transport.

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use pvwire_frame::{hex_dump, Command, Header, WireReader, HEADER_SIZE};
use tracing::{debug, error, trace, warn};

use crate::error::{DiscoveryError, Result};
use crate::origin::OriginTag;

/// Tuning for a discovery receive loop.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Receive timeout; bounds how long `close` takes to be noticed.
    pub poll_interval: Duration,
    /// Receive buffer size.
    pub max_datagram: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            max_datagram: pvwire_transport::MAX_UDP_PACKET,
        }
    }
}

/// One application message inside a datagram.
#[derive(Debug, Clone, Copy)]
pub struct SubMessage<'a> {
    datagram: &'a [u8],
    start: usize,
    pub header: Header,
}

impl<'a> SubMessage<'a> {
    /// Offset of the header within the datagram.
    pub fn start(&self) -> usize {
        self.start
    }

    pub fn payload_size(&self) -> usize {
        self.header.payload_size as usize
    }

    /// Reader over exactly this message's payload, in its own byte order.
    pub fn payload(&self) -> WireReader<'a> {
        let begin = self.start + HEADER_SIZE;
        WireReader::new(
            &self.datagram[begin..begin + self.payload_size()],
            self.header.order(),
        )
    }

    /// The origin tag immediately preceding this message, if any.
    pub fn origin_tag(&self) -> Option<OriginTag> {
        OriginTag::preceding(self.datagram, self.start)
    }
}

/// Split `datagram` into its messages and pass application messages to
/// `on_message` in order.
///
/// Control messages and origin tags are skipped. Scanning stops at the first
/// bad header, at a payload that overruns the datagram, or when
/// `on_message` returns `false`. Returns the number of messages handed to
/// `on_message`.
pub fn demultiplex<F>(from: SocketAddr, datagram: &[u8], mut on_message: F) -> usize
where
    F: FnMut(&SubMessage<'_>) -> bool,
{
    let mut dispatched = 0;
    let mut pos = 0;
    while datagram.len() - pos >= HEADER_SIZE {
        let header = match Header::decode(&datagram[pos..]) {
            Ok(header) => header,
            Err(err) => {
                warn!(%from, offset = pos, error = %err, "dropping rest of datagram");
                break;
            }
        };
        let payload = if header.is_control() {
            0
        } else {
            header.payload_size as usize
        };
        let remaining = datagram.len() - pos - HEADER_SIZE;
        if payload > remaining {
            warn!(
                %from,
                command = header.command,
                payload,
                remaining,
                "message claims more than the datagram holds, dropping rest"
            );
            break;
        }

        if header.is_control() {
            trace!(%from, command = header.command, "skipping control message");
        } else if header.command == Command::OriginTag.code() {
            trace!(%from, "origin tag");
        } else {
            let message = SubMessage {
                datagram,
                start: pos,
                header,
            };
            dispatched += 1;
            if !on_message(&message) {
                debug!(%from, command = header.command, "handler stopped datagram processing");
                break;
            }
        }
        // Advance by the declared size, whatever the handler consumed.
        pos += HEADER_SIZE + payload;
    }
    dispatched
}

/// Receives the messages of one discovery socket.
pub trait DatagramHandler: Send {
    /// Handle one application message. Return `false` to skip the rest of
    /// the datagram, e.g. after a decode failure.
    fn handle_message(&mut self, from: SocketAddr, message: &SubMessage<'_>) -> bool;
}

/// Receive loop over a shared UDP socket.
///
/// The engine never closes the socket; [`DiscoveryEngine::close`] only stops
/// the loop, which notices within one poll interval.
pub struct DiscoveryEngine {
    socket: Arc<UdpSocket>,
    running: Arc<AtomicBool>,
    config: DiscoveryConfig,
}

impl DiscoveryEngine {
    pub fn new(socket: Arc<UdpSocket>, config: DiscoveryConfig) -> Result<Self> {
        socket.set_read_timeout(Some(config.poll_interval))?;
        Ok(Self {
            socket,
            running: Arc::new(AtomicBool::new(true)),
            config,
        })
    }

    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop the receive loop.
    pub fn close(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Handle that stops this engine from another thread.
    pub fn stopper(&self) -> EngineStopper {
        EngineStopper {
            running: Arc::clone(&self.running),
        }
    }

    /// Run the receive loop on the calling thread until closed.
    pub fn run<H: DatagramHandler + ?Sized>(&self, handler: &mut H) -> Result<()> {
        let local = self.local_addr()?;
        debug!(%local, "discovery receiver started");
        let mut buf = vec![0u8; self.config.max_datagram];
        while self.is_running() {
            let (len, from) = match self.socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    continue
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    if !self.is_running() {
                        break;
                    }
                    return Err(err.into());
                }
            };
            let datagram = &buf[..len];
            trace!(%from, len, "datagram\n{}", hex_dump(datagram));
            demultiplex(from, datagram, |message| handler.handle_message(from, message));
        }
        debug!(%local, "discovery receiver stopped");
        Ok(())
    }

    /// Run the receive loop on a new named thread.
    pub fn spawn<H>(self, mut handler: H) -> Result<(EngineStopper, JoinHandle<()>)>
    where
        H: DatagramHandler + 'static,
    {
        let stopper = self.stopper();
        let name = match self.socket.local_addr() {
            Ok(addr) => format!("udp-{addr}"),
            Err(_) => "udp".to_string(),
        };
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || {
                if let Err(err) = self.run(&mut handler) {
                    error!(error = %err, "discovery receiver failed");
                }
            })
            .map_err(DiscoveryError::Io)?;
        Ok((stopper, handle))
    }
}

/// Stops a [`DiscoveryEngine`] running on another thread.
#[derive(Debug, Clone)]
pub struct EngineStopper {
    running: Arc<AtomicBool>,
}

impl EngineStopper {
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        !self.running.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use pvwire_frame::{ByteOrder, ControlMessage, RawMessage, RequestEncoder, WireWriter};

    use super::*;

    fn from() -> SocketAddr {
        "127.0.0.1:5076".parse().expect("addr")
    }

    fn append(buf: &mut BytesMut, order: ByteOrder, item: &dyn RequestEncoder) {
        let mut w = WireWriter::new(buf, order);
        item.encode_request(2, &mut w).expect("encode");
    }

    #[test]
    fn dispatches_back_to_back_messages_in_order() {
        let mut buf = BytesMut::new();
        append(&mut buf, ByteOrder::Big, &RawMessage::new(Command::Search, &b"first"[..]));
        append(
            &mut buf,
            ByteOrder::Little,
            &RawMessage::new(Command::SearchResponse, &b"second!"[..]),
        );

        let mut seen = Vec::new();
        let count = demultiplex(from(), &buf, |message| {
            seen.push((message.header.command, message.header.order(), message.payload().rest().to_vec()));
            true
        });
        assert_eq!(count, 2);
        assert_eq!(
            seen,
            vec![
                (Command::Search.code(), ByteOrder::Big, b"first".to_vec()),
                (Command::SearchResponse.code(), ByteOrder::Little, b"second!".to_vec()),
            ]
        );
    }

    #[test]
    fn overrunning_message_stops_scan() {
        let mut buf = BytesMut::new();
        append(&mut buf, ByteOrder::Big, &RawMessage::new(Command::Search, &b"ok"[..]));
        append(&mut buf, ByteOrder::Big, &RawMessage::new(Command::Search, &b"truncated"[..]));
        buf.truncate(buf.len() - 3);

        let mut seen = 0;
        let count = demultiplex(from(), &buf, |_| {
            seen += 1;
            true
        });
        assert_eq!(count, 1);
        assert_eq!(seen, 1);
    }

    #[test]
    fn handler_can_stop_scan() {
        let mut buf = BytesMut::new();
        append(&mut buf, ByteOrder::Big, &RawMessage::new(Command::Search, &b"a"[..]));
        append(&mut buf, ByteOrder::Big, &RawMessage::new(Command::Search, &b"b"[..]));
        assert_eq!(demultiplex(from(), &buf, |_| false), 1);
    }

    #[test]
    fn position_advances_by_declared_size() {
        let mut buf = BytesMut::new();
        append(&mut buf, ByteOrder::Big, &RawMessage::new(Command::Search, vec![9u8; 32]));
        append(&mut buf, ByteOrder::Big, &RawMessage::new(Command::Beacon, &b"x"[..]));

        let mut commands = Vec::new();
        demultiplex(from(), &buf, |message| {
            // Consume nothing.
            commands.push(message.header.command);
            true
        });
        assert_eq!(commands, vec![Command::Search.code(), Command::Beacon.code()]);
    }

    #[test]
    fn control_messages_are_skipped() {
        let mut buf = BytesMut::new();
        append(&mut buf, ByteOrder::Big, &ControlMessage { command: 3, data: 0xFFFF });
        append(&mut buf, ByteOrder::Big, &RawMessage::new(Command::Search, &b"a"[..]));
        assert_eq!(demultiplex(from(), &buf, |_| true), 1);
    }

    #[test]
    fn bad_magic_stops_scan() {
        let mut buf = BytesMut::new();
        append(&mut buf, ByteOrder::Big, &RawMessage::new(Command::Search, &b"a"[..]));
        buf.extend_from_slice(&[0x00; 8]);
        assert_eq!(demultiplex(from(), &buf, |_| true), 1);
    }

    #[test]
    fn origin_tag_is_visible_to_following_message() {
        let tag = OriginTag::new("10.0.0.1".parse().expect("ip"));
        let mut buf = BytesMut::new();
        append(&mut buf, ByteOrder::Little, &tag);
        append(&mut buf, ByteOrder::Big, &RawMessage::new(Command::Search, &b"a"[..]));

        let mut tags = Vec::new();
        let count = demultiplex(from(), &buf, |message| {
            tags.push(message.origin_tag());
            true
        });
        assert_eq!(count, 1);
        assert_eq!(tags, vec![Some(tag)]);
    }

    #[test]
    fn engine_close_stops_run() {
        struct Nothing;
        impl DatagramHandler for Nothing {
            fn handle_message(&mut self, _from: SocketAddr, _message: &SubMessage<'_>) -> bool {
                true
            }
        }

        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").expect("bind"));
        let engine = DiscoveryEngine::new(
            socket,
            DiscoveryConfig {
                poll_interval: Duration::from_millis(20),
                ..DiscoveryConfig::default()
            },
        )
        .expect("engine");
        let (stopper, handle) = engine.spawn(Nothing).expect("spawn");
        stopper.stop();
        handle.join().expect("receiver thread should exit");
        assert!(stopper.is_stopped());
    }
}
