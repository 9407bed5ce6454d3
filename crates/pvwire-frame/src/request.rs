use bytes::Bytes;

use crate::error::Result;
use crate::wire::WireWriter;

/// An outbound item that serializes itself into a send buffer.
///
/// `version` is the protocol revision negotiated with the peer. The writer
/// already carries the send byte order and the origin flag of the
/// connection. An encoder writes one or more complete messages; on error the
/// sender discards whatever it wrote and drops the item.
pub trait RequestEncoder: Send {
    fn encode_request(&self, version: u8, w: &mut WireWriter<'_>) -> Result<()>;
}

impl<F> RequestEncoder for F
where
    F: Fn(u8, &mut WireWriter<'_>) -> Result<()> + Send,
{
    fn encode_request(&self, version: u8, w: &mut WireWriter<'_>) -> Result<()> {
        self(version, w)
    }
}

/// An application message with an opaque payload.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub command: u8,
    pub payload: Bytes,
}

impl RawMessage {
    pub fn new(command: impl Into<u8>, payload: impl Into<Bytes>) -> Self {
        Self {
            command: command.into(),
            payload: payload.into(),
        }
    }
}

impl RequestEncoder for RawMessage {
    fn encode_request(&self, _version: u8, w: &mut WireWriter<'_>) -> Result<()> {
        let mark = w.begin_message(self.command);
        w.put_bytes(&self.payload);
        w.end_message(mark)
    }
}

/// A control message; `data` travels in the size field.
#[derive(Debug, Clone, Copy)]
pub struct ControlMessage {
    pub command: u8,
    pub data: u32,
}

impl RequestEncoder for ControlMessage {
    fn encode_request(&self, _version: u8, w: &mut WireWriter<'_>) -> Result<()> {
        w.put_control(self.command, self.data);
        Ok(())
    }
}
