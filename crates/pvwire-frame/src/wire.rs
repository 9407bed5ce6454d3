//! Field-level encoding of message payloads.
//!
//! Every multi-byte field honors the byte order of the message it belongs
//! to. Sizes use the compact PVA encoding: one byte below 254, `0xFE`
//! followed by a 4-byte int otherwise, and `0xFF` for null.

use std::fmt::Write as _;

use bytes::{BufMut, BytesMut};

use crate::codec::{encode_header, flags, ByteOrder, HEADER_SIZE, PAYLOAD_SIZE_OFFSET};
use crate::error::{FrameError, Result};

const SIZE_NULL: u8 = 0xFF;
const SIZE_LONG: u8 = 0xFE;

/// Bounded reader over one message payload.
///
/// The reader never sees bytes past the end of its message.
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
    order: ByteOrder,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8], order: ByteOrder) -> Self {
        Self { buf, pos: 0, order }
    }

    pub fn order(&self) -> ByteOrder {
        self.order
    }

    pub fn set_order(&mut self, order: ByteOrder) {
        self.order = order;
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn has_remaining(&self) -> bool {
        self.pos < self.buf.len()
    }

    /// The bytes not read yet.
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.get_bytes(n).map(|_| ())
    }

    pub fn get_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(FrameError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    pub fn get_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.get_bytes(N)?);
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.get_array::<1>()?[0])
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        Ok(self.get_u8()? != 0)
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        let bytes = self.get_array()?;
        Ok(self.order.u16_from(bytes))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let bytes = self.get_array()?;
        Ok(self.order.u32_from(bytes))
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        Ok(self.get_u32()? as i32)
    }

    /// Read a compact size; `None` is the null size.
    pub fn get_size(&mut self) -> Result<Option<usize>> {
        match self.get_u8()? {
            SIZE_NULL => Ok(None),
            SIZE_LONG => {
                let size = self.get_i32()?;
                if size < 0 {
                    return Ok(None);
                }
                Ok(Some(size as usize))
            }
            small => Ok(Some(small as usize)),
        }
    }

    /// Read a size-prefixed UTF-8 string. A null string reads as empty.
    pub fn get_string(&mut self) -> Result<String> {
        let Some(len) = self.get_size()? else {
            return Ok(String::new());
        };
        if len > self.remaining() {
            return Err(FrameError::InvalidSize(len as i64));
        }
        let bytes = self.get_bytes(len)?;
        Ok(std::str::from_utf8(bytes)?.to_owned())
    }
}

/// Position of a message started with [`WireWriter::begin_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageMark {
    start: usize,
}

impl MessageMark {
    /// Offset of the message header in the buffer.
    pub fn start(&self) -> usize {
        self.start
    }
}

/// Appends fields to a send buffer in a fixed byte order.
///
/// Offsets handed out by the writer are relative to the start of the
/// underlying `BytesMut`. Growing the buffer never moves bytes already
/// written relative to that start, so a payload size can always be
/// patched after the body is known.
#[derive(Debug)]
pub struct WireWriter<'a> {
    buf: &'a mut BytesMut,
    order: ByteOrder,
    origin: u8,
}

impl<'a> WireWriter<'a> {
    pub fn new(buf: &'a mut BytesMut, order: ByteOrder) -> Self {
        Self {
            buf,
            order,
            origin: 0,
        }
    }

    /// Mark every message begun by this writer as server-originated.
    pub fn with_server_origin(mut self, server: bool) -> Self {
        self.origin = if server { flags::SERVER } else { 0 };
        self
    }

    pub fn order(&self) -> ByteOrder {
        self.order
    }

    pub fn is_server(&self) -> bool {
        self.origin != 0
    }

    pub fn position(&self) -> usize {
        self.buf.len()
    }

    /// Write a header with a placeholder size.
    pub fn begin_message(&mut self, command: u8) -> MessageMark {
        self.begin_with_flags(0, command)
    }

    /// Write a header with extra flag bits and a placeholder size.
    pub fn begin_with_flags(&mut self, extra_flags: u8, command: u8) -> MessageMark {
        let start = self.buf.len();
        encode_header(self.buf, self.order, self.origin | extra_flags, command, 0);
        MessageMark { start }
    }

    /// Patch the payload size of a message begun at `mark`.
    pub fn end_message(&mut self, mark: MessageMark) -> Result<()> {
        let payload = self.buf.len() - mark.start - HEADER_SIZE;
        let payload = u32::try_from(payload).map_err(|_| FrameError::PayloadTooLarge {
            size: payload,
            max: u32::MAX as usize,
        })?;
        self.patch_u32_at(mark.start + PAYLOAD_SIZE_OFFSET, payload);
        Ok(())
    }

    /// Write a complete control message. `data` fills the size field.
    pub fn put_control(&mut self, command: u8, data: u32) {
        encode_header(
            self.buf,
            self.order,
            self.origin | flags::CONTROL,
            command,
            data,
        );
    }

    pub fn patch_u32_at(&mut self, offset: usize, value: u32) {
        self.buf[offset..offset + 4].copy_from_slice(&self.order.u32_bytes(value));
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn put_bool(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    pub fn put_u16(&mut self, value: u16) {
        match self.order {
            ByteOrder::Big => self.buf.put_u16(value),
            ByteOrder::Little => self.buf.put_u16_le(value),
        }
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.put_slice(&self.order.u32_bytes(value));
    }

    pub fn put_i32(&mut self, value: i32) {
        self.put_u32(value as u32);
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    pub fn put_size(&mut self, size: usize) -> Result<()> {
        if size < SIZE_LONG as usize {
            self.buf.put_u8(size as u8);
            return Ok(());
        }
        let size = i32::try_from(size).map_err(|_| FrameError::InvalidSize(size as i64))?;
        self.buf.put_u8(SIZE_LONG);
        self.put_i32(size);
        Ok(())
    }

    pub fn put_null_size(&mut self) {
        self.buf.put_u8(SIZE_NULL);
    }

    pub fn put_string(&mut self, value: &str) -> Result<()> {
        self.put_size(value.len())?;
        self.buf.put_slice(value.as_bytes());
        Ok(())
    }
}

/// Render bytes as a classic hex dump for trace logging.
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 4);
    for (row, chunk) in bytes.chunks(16).enumerate() {
        let _ = write!(out, "{:04x}:", row * 16);
        for byte in chunk {
            let _ = write!(out, " {byte:02x}");
        }
        out.push('\n');
    }
    out
}
