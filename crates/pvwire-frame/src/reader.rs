use std::io::{ErrorKind, Read};

use bytes::{Buf, BytesMut};
use pvwire_transport::PvaStream;
use tracing::{info, trace};

use crate::codec::{check_and_get_size, FrameConfig, Header, HEADER_SIZE};
use crate::error::{transport_to_frame_error, FrameError, Result};
use crate::wire::{hex_dump, WireReader};

const INITIAL_BUFFER_CAPACITY: usize = 16 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// One complete message borrowed from the receive buffer.
#[derive(Debug, Clone, Copy)]
pub struct Message<'a> {
    pub header: Header,
    /// Header and payload, clamped to the message boundary.
    pub bytes: &'a [u8],
}

impl<'a> Message<'a> {
    /// Payload bytes; empty for control messages.
    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[HEADER_SIZE..]
    }

    /// Reader over the payload in the message's own byte order.
    pub fn reader(&self) -> WireReader<'a> {
        WireReader::new(self.payload(), self.header.order())
    }
}

/// Reads complete messages from any `Read` stream.
///
/// Handles partial reads internally; callers always get complete messages.
/// The returned [`Message`] borrows the internal buffer until the next call,
/// which then discards it and moves any following bytes to the front.
pub struct FrameReader<T> {
    inner: T,
    buf: BytesMut,
    consumed: usize,
    expect_server: bool,
    config: FrameConfig,
}

impl<T: Read> FrameReader<T> {
    /// Create a reader for messages sent by the given side.
    pub fn new(inner: T, expect_server: bool) -> Self {
        Self::with_config(inner, expect_server, FrameConfig::default())
    }

    /// Create a reader with explicit configuration.
    pub fn with_config(inner: T, expect_server: bool, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            consumed: 0,
            expect_server,
            config,
        }
    }

    /// Read the next complete message (blocking).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached.
    pub fn read_message(&mut self) -> Result<Message<'_>> {
        if self.consumed > 0 {
            self.buf.advance(self.consumed);
            self.consumed = 0;
        }

        loop {
            let size = check_and_get_size(&self.buf, self.expect_server)?;
            if size > self.config.max_message_size {
                return Err(FrameError::PayloadTooLarge {
                    size,
                    max: self.config.max_message_size,
                });
            }
            if self.buf.len() >= size && self.buf.len() >= HEADER_SIZE {
                let header = Header::decode(&self.buf)?;
                self.consumed = size;
                let bytes = &self.buf[..size];
                trace!(
                    command = header.command,
                    size,
                    "received message\n{}",
                    hex_dump(bytes)
                );
                return Ok(Message { header, bytes });
            }

            if size > self.buf.capacity() {
                info!(
                    from = self.buf.capacity(),
                    to = size,
                    "growing receive buffer"
                );
                self.buf.reserve(size - self.buf.len());
            }
            self.fill()?;
        }
    }

    fn fill(&mut self) -> Result<()> {
        let len = self.buf.len();
        self.buf.resize(len + READ_CHUNK_SIZE, 0);
        loop {
            match self.inner.read(&mut self.buf[len..]) {
                Ok(0) => {
                    self.buf.truncate(len);
                    return Err(FrameError::ConnectionClosed);
                }
                Ok(n) => {
                    self.buf.truncate(len + n);
                    return Ok(());
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.buf.truncate(len);
                    return Err(FrameError::Io(err));
                }
            }
        }
    }

    /// Bytes buffered but not yet returned as a message.
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.consumed
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current frame reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl FrameReader<PvaStream> {
    /// Create a frame reader for a `PvaStream` and apply the read timeout
    /// from config.
    pub fn with_config_pva(inner: PvaStream, expect_server: bool, config: FrameConfig) -> Result<Self> {
        inner
            .set_read_timeout(config.read_timeout)
            .map_err(transport_to_frame_error)?;
        Ok(Self::with_config(inner, expect_server, config))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::codec::{flags, ByteOrder, MAGIC};
    use crate::wire::WireWriter;

    fn client_message(order: ByteOrder, command: u8, payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        let mut w = WireWriter::new(&mut buf, order);
        let mark = w.begin_message(command);
        w.put_bytes(payload);
        w.end_message(mark).unwrap();
        buf.to_vec()
    }

    #[test]
    fn read_single_message() {
        let wire = client_message(ByteOrder::Little, 2, b"hello");
        let mut reader = FrameReader::new(Cursor::new(wire), false);
        let msg = reader.read_message().unwrap();

        assert_eq!(msg.header.command, 2);
        assert_eq!(msg.payload(), b"hello");
    }

    #[test]
    fn read_multiple_messages_with_mixed_order() {
        let mut wire = client_message(ByteOrder::Big, 1, b"one");
        wire.extend(client_message(ByteOrder::Little, 2, b"two"));
        wire.extend(client_message(ByteOrder::Big, 3, b"three"));

        let mut reader = FrameReader::new(Cursor::new(wire), false);
        let mut seen = Vec::new();
        for _ in 0..3 {
            let msg = reader.read_message().unwrap();
            seen.push((msg.header.command, msg.header.order(), msg.payload().to_vec()));
        }

        assert_eq!(seen[0], (1, ByteOrder::Big, b"one".to_vec()));
        assert_eq!(seen[1], (2, ByteOrder::Little, b"two".to_vec()));
        assert_eq!(seen[2], (3, ByteOrder::Big, b"three".to_vec()));
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn message_is_clamped_to_its_boundary() {
        let mut wire = client_message(ByteOrder::Little, 1, &[1, 2, 3, 4]);
        wire.extend(client_message(ByteOrder::Little, 1, &[5, 6, 7, 8]));

        let mut reader = FrameReader::new(Cursor::new(wire), false);
        let msg = reader.read_message().unwrap();
        let mut r = msg.reader();
        assert_eq!(r.get_u32().unwrap(), u32::from_le_bytes([1, 2, 3, 4]));
        assert!(r.get_u8().is_err());
    }

    #[test]
    fn large_message_grows_buffer() {
        let payload = vec![0xAB; 64 * 1024];
        let wire = client_message(ByteOrder::Big, 9, &payload);

        let mut reader = FrameReader::new(Cursor::new(wire), false);
        let msg = reader.read_message().unwrap();
        assert_eq!(msg.payload(), payload.as_slice());
    }

    #[test]
    fn partial_read_handling() {
        let wire = client_message(ByteOrder::Little, 4, b"slow");
        let mut reader = FrameReader::new(ByteByByteReader { bytes: wire, pos: 0 }, false);

        let msg = reader.read_message().unwrap();
        assert_eq!(msg.header.command, 4);
        assert_eq!(msg.payload(), b"slow");
    }

    #[test]
    fn control_message_has_no_payload() {
        let mut buf = BytesMut::new();
        WireWriter::new(&mut buf, ByteOrder::Big)
            .with_server_origin(true)
            .put_control(2, 0);
        buf.extend_from_slice(&client_message(ByteOrder::Big, 1, b"x"));
        buf[10] |= flags::SERVER;

        let mut reader = FrameReader::new(Cursor::new(buf.to_vec()), true);
        let msg = reader.read_message().unwrap();
        assert!(msg.header.is_control());
        assert!(msg.payload().is_empty());
        let msg = reader.read_message().unwrap();
        assert_eq!(msg.payload(), b"x");
    }

    #[test]
    fn connection_closed_cleanly() {
        let mut reader = FrameReader::new(Cursor::new(Vec::<u8>::new()), false);
        let err = reader.read_message().unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn connection_closed_mid_message() {
        let mut wire = client_message(ByteOrder::Little, 1, &[0; 16]);
        wire.truncate(12);
        let mut reader = FrameReader::new(Cursor::new(wire), false);
        let err = reader.read_message().unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn invalid_magic_in_stream() {
        let bytes = vec![0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        let mut reader = FrameReader::new(Cursor::new(bytes), false);
        let err = reader.read_message().unwrap_err();
        assert!(matches!(err, FrameError::BadMagic(0)));
    }

    #[test]
    fn wrong_direction_in_stream() {
        let wire = client_message(ByteOrder::Little, 1, b"");
        let mut reader = FrameReader::new(Cursor::new(wire), true);
        let err = reader.read_message().unwrap_err();
        assert!(matches!(err, FrameError::WrongDirection { .. }));
    }

    #[test]
    fn oversized_message_in_stream() {
        let wire = vec![MAGIC, 2, 0, 1, 0, 4, 0, 0];
        let cfg = FrameConfig {
            max_message_size: 16,
            ..FrameConfig::default()
        };
        let mut reader = FrameReader::with_config(Cursor::new(wire), false, cfg);
        let err = reader.read_message().unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { .. }));
    }

    #[derive(Debug)]
    struct ByteByByteReader {
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for ByteByByteReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.bytes.len() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.bytes[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }
}
