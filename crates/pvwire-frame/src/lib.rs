//! PVA message framing, segment reassembly and command dispatch.
//!
//! Every message starts with an 8-byte header:
//! - magic byte `0xCA` and protocol revision
//! - flags: control, segment state, server origin, big-endian payload
//! - command code
//! - 4-byte payload size in the byte order the flags select
//!
//! Readers hand out complete messages clamped to their boundary; the segment
//! accumulator merges first/middle/last segments into one message.

pub mod codec;
pub mod command;
pub mod dispatch;
pub mod error;
pub mod reader;
pub mod request;
pub mod segment;
pub mod wire;
pub mod writer;

pub use codec::{
    check_and_get_size, encode_header, flags, ByteOrder, FrameConfig, Header, Segment,
    DEFAULT_MAX_MESSAGE_SIZE, HEADER_SIZE, MAGIC, MIN_PROTOCOL_REVISION, PROTOCOL_REVISION,
};
pub use command::{command_name, Command, ControlCommand};
pub use dispatch::{CommandHandler, CommandHandlers};
pub use error::{ErrorTier, FrameError, Result};
pub use reader::{FrameReader, Message};
pub use request::{ControlMessage, RawMessage, RequestEncoder};
pub use segment::{split_message, SegmentAccumulator};
pub use wire::{hex_dump, MessageMark, WireReader, WireWriter};
pub use writer::FrameWriter;
