use std::fmt;

use pvwire_frame::{Command, RequestEncoder, Result, WireReader, WireWriter};
use tracing::{error, info, warn};

/// Severity of a text notification.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info = 0,
    Warning = 1,
    Error = 2,
    Fatal = 3,
}

impl Severity {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Severity::Info),
            1 => Some(Severity::Warning),
            2 => Some(Severity::Error),
            3 => Some(Severity::Fatal),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// Generic text notification sent by a peer (`MESSAGE` command).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextMessage {
    pub request_id: i32,
    /// Raw severity code; unknown codes are preserved.
    pub severity: u8,
    pub text: String,
}

impl TextMessage {
    pub fn new(request_id: i32, severity: Severity, text: impl Into<String>) -> Self {
        Self {
            request_id,
            severity: severity as u8,
            text: text.into(),
        }
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            request_id: r.get_i32()?,
            severity: r.get_u8()?,
            text: r.get_string()?,
        })
    }

    pub fn severity(&self) -> Option<Severity> {
        Severity::from_code(self.severity)
    }

    /// Log the notification at the level matching its severity.
    pub fn log(&self, peer: &str) {
        let request_id = self.request_id;
        match self.severity() {
            Some(Severity::Info) => info!(peer, request_id, "{}", self.text),
            Some(Severity::Warning) => warn!(peer, request_id, "{}", self.text),
            Some(Severity::Error) => error!(peer, request_id, "{}", self.text),
            Some(Severity::Fatal) => error!(peer, request_id, fatal = true, "{}", self.text),
            None => warn!(
                peer,
                request_id,
                severity = self.severity,
                "{}",
                self.text
            ),
        }
    }
}

impl RequestEncoder for TextMessage {
    fn encode_request(&self, _version: u8, w: &mut WireWriter<'_>) -> Result<()> {
        let mark = w.begin_message(Command::Message.code());
        w.put_i32(self.request_id);
        w.put_u8(self.severity);
        w.put_string(&self.text)?;
        w.end_message(mark)
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use pvwire_frame::{ByteOrder, Header, HEADER_SIZE};

    use super::*;

    #[test]
    fn encode_then_decode() {
        let msg = TextMessage::new(17, Severity::Warning, "channel limit reached");
        let mut buf = BytesMut::new();
        let mut w = WireWriter::new(&mut buf, ByteOrder::Big);
        msg.encode_request(2, &mut w).expect("encode");

        let header = Header::decode(&buf).expect("header");
        assert_eq!(header.command, Command::Message.code());
        let mut r = WireReader::new(&buf[HEADER_SIZE..], header.order());
        let decoded = TextMessage::decode(&mut r).expect("decode");
        assert_eq!(decoded, msg);
        assert_eq!(decoded.severity(), Some(Severity::Warning));
    }

    #[test]
    fn unknown_severity_is_kept() {
        let bytes = [0, 0, 0, 1, 9, 2, b'h', b'i'];
        let mut r = WireReader::new(&bytes, ByteOrder::Big);
        let msg = TextMessage::decode(&mut r).expect("decode");
        assert_eq!(msg.request_id, 1);
        assert_eq!(msg.severity, 9);
        assert_eq!(msg.severity(), None);
        assert_eq!(msg.text, "hi");
        msg.log("test");
    }
}
