use std::fmt;

use bytes::{BufMut, BytesMut};

use crate::error::{FrameError, Result};

/// Header: magic (1) + version (1) + flags (1) + command (1) + size (4).
pub const HEADER_SIZE: usize = 8;

/// Offset of the 4-byte payload size within the header.
pub const PAYLOAD_SIZE_OFFSET: usize = 4;

/// First byte of every message.
pub const MAGIC: u8 = 0xCA;

/// Protocol revision written into outgoing headers.
pub const PROTOCOL_REVISION: u8 = 2;

/// Oldest protocol revision accepted from a peer.
pub const MIN_PROTOCOL_REVISION: u8 = 1;

/// Default maximum message size: 16 MiB.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Header flag bits.
pub mod flags {
    /// Control message; the size field carries inline data.
    pub const CONTROL: u8 = 0x01;
    /// Mask of the two segment bits.
    pub const SEGMENT_MASK: u8 = 0x30;
    pub const SEGMENT_FIRST: u8 = 0x10;
    pub const SEGMENT_LAST: u8 = 0x20;
    pub const SEGMENT_MIDDLE: u8 = 0x30;
    /// Sent by a server.
    pub const SERVER: u8 = 0x40;
    /// Multi-byte fields of this message are big-endian.
    pub const BIG_ENDIAN: u8 = 0x80;
}

/// Byte order of the multi-byte fields of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Big,
    Little,
}

impl ByteOrder {
    /// Byte order of the host.
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }

    /// Byte order selected by a header flags byte.
    pub const fn from_flags(flags: u8) -> Self {
        if flags & flags::BIG_ENDIAN != 0 {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }

    /// The endianness flag bit for this order.
    pub const fn flag(self) -> u8 {
        match self {
            ByteOrder::Big => flags::BIG_ENDIAN,
            ByteOrder::Little => 0,
        }
    }

    pub(crate) fn u16_from(self, bytes: [u8; 2]) -> u16 {
        match self {
            ByteOrder::Big => u16::from_be_bytes(bytes),
            ByteOrder::Little => u16::from_le_bytes(bytes),
        }
    }

    pub(crate) fn u32_from(self, bytes: [u8; 4]) -> u32 {
        match self {
            ByteOrder::Big => u32::from_be_bytes(bytes),
            ByteOrder::Little => u32::from_le_bytes(bytes),
        }
    }

    pub(crate) fn u32_bytes(self, value: u32) -> [u8; 4] {
        match self {
            ByteOrder::Big => value.to_be_bytes(),
            ByteOrder::Little => value.to_le_bytes(),
        }
    }
}

/// Segmentation state of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    /// A complete, unsegmented message.
    None,
    First,
    Middle,
    Last,
}

impl Segment {
    pub const fn from_flags(flags: u8) -> Self {
        match flags & flags::SEGMENT_MASK {
            flags::SEGMENT_FIRST => Segment::First,
            flags::SEGMENT_MIDDLE => Segment::Middle,
            flags::SEGMENT_LAST => Segment::Last,
            _ => Segment::None,
        }
    }

    pub const fn flag(self) -> u8 {
        match self {
            Segment::None => 0,
            Segment::First => flags::SEGMENT_FIRST,
            Segment::Middle => flags::SEGMENT_MIDDLE,
            Segment::Last => flags::SEGMENT_LAST,
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Segment::None => "unsegmented",
            Segment::First => "first",
            Segment::Middle => "middle",
            Segment::Last => "last",
        };
        f.write_str(name)
    }
}

/// A decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub flags: u8,
    pub command: u8,
    /// Payload length, or inline data for control messages.
    pub payload_size: u32,
}

impl Header {
    /// Decode the header at the start of `src`.
    ///
    /// Only the magic byte is checked; the size field is read in the byte
    /// order the flags select.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < HEADER_SIZE {
            return Err(FrameError::Truncated {
                needed: HEADER_SIZE,
                remaining: src.len(),
            });
        }
        if src[0] != MAGIC {
            return Err(FrameError::BadMagic(src[0]));
        }
        let flags = src[2];
        let size = [src[4], src[5], src[6], src[7]];
        Ok(Self {
            version: src[1],
            flags,
            command: src[3],
            payload_size: ByteOrder::from_flags(flags).u32_from(size),
        })
    }

    /// Check version and direction.
    pub fn validate(&self, expect_server: bool) -> Result<()> {
        if self.version < MIN_PROTOCOL_REVISION {
            return Err(FrameError::UnsupportedVersion {
                version: self.version,
                minimum: MIN_PROTOCOL_REVISION,
            });
        }
        if self.is_server() != expect_server {
            return Err(FrameError::WrongDirection {
                expected_server: expect_server,
            });
        }
        Ok(())
    }

    pub fn order(&self) -> ByteOrder {
        ByteOrder::from_flags(self.flags)
    }

    pub fn is_control(&self) -> bool {
        self.flags & flags::CONTROL != 0
    }

    pub fn is_server(&self) -> bool {
        self.flags & flags::SERVER != 0
    }

    pub fn segment(&self) -> Segment {
        Segment::from_flags(self.flags)
    }

    /// Total size of the message on the wire.
    pub fn message_size(&self) -> usize {
        if self.is_control() {
            HEADER_SIZE
        } else {
            HEADER_SIZE + self.payload_size as usize
        }
    }
}

/// Append an 8-byte header to `dst`.
///
/// The endianness bit of `flags` is replaced by the one matching `order`, so
/// the header always describes the order the payload is written in.
pub fn encode_header(
    dst: &mut BytesMut,
    order: ByteOrder,
    flags: u8,
    command: u8,
    payload_size: u32,
) {
    let flags = (flags & !flags::BIG_ENDIAN) | order.flag();
    dst.reserve(HEADER_SIZE);
    dst.put_u8(MAGIC);
    dst.put_u8(PROTOCOL_REVISION);
    dst.put_u8(flags);
    dst.put_u8(command);
    dst.put_slice(&order.u32_bytes(payload_size));
}

/// Size of the message starting at `src`, validating its header.
///
/// Returns [`HEADER_SIZE`] while fewer than 8 bytes are available, so the
/// caller reads more. Otherwise the header is validated (any failure is
/// connection-fatal) and the full message size is returned: 8 for control
/// messages, 8 + payload for application messages.
pub fn check_and_get_size(src: &[u8], expect_server: bool) -> Result<usize> {
    if src.len() < HEADER_SIZE {
        return Ok(HEADER_SIZE);
    }
    let header = Header::decode(src)?;
    header.validate(expect_server)?;
    Ok(header.message_size())
}

/// Configuration for message reading.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Largest message, or reassembled segmented message, accepted.
    pub max_message_size: usize,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<std::time::Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            read_timeout: None,
            write_timeout: None,
        }
    }
}
