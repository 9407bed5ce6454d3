//! Connection validation exchange.
//!
//! The server opens with its receive buffer size, introspection registry size
//! and the authentication methods it accepts. The client answers with its own
//! sizes, quality of service and the method it picked. The server confirms
//! with a status.

use pvwire_frame::{Command, FrameError, RequestEncoder, Result, WireReader, WireWriter};

/// Introspection registry size both sides advertise.
pub const DEFAULT_REGISTRY_SIZE: u16 = 0x7FFF;

/// Authentication method requiring no credentials.
pub const AUTH_ANONYMOUS: &str = "anonymous";
/// Authentication by user and host name.
pub const AUTH_CA: &str = "ca";

const STATUS_OK_NO_MESSAGE: u8 = 0xFF;

/// Server-to-client validation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationRequest {
    pub buffer_size: i32,
    pub registry_size: u16,
    pub auth_methods: Vec<String>,
}

impl ValidationRequest {
    pub fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let buffer_size = r.get_i32()?;
        let registry_size = r.get_u16()?;
        let count = r.get_size()?.unwrap_or(0);
        if count > r.remaining() {
            return Err(FrameError::InvalidSize(count as i64));
        }
        let auth_methods = (0..count)
            .map(|_| r.get_string())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            buffer_size,
            registry_size,
            auth_methods,
        })
    }

    /// Pick the method a client will use: anonymous when offered, else the
    /// first offered one.
    pub fn choose_auth(&self) -> &str {
        if self.auth_methods.is_empty() || self.auth_methods.iter().any(|m| m == AUTH_ANONYMOUS) {
            AUTH_ANONYMOUS
        } else {
            &self.auth_methods[0]
        }
    }
}

impl RequestEncoder for ValidationRequest {
    fn encode_request(&self, _version: u8, w: &mut WireWriter<'_>) -> Result<()> {
        let mark = w.begin_message(Command::ConnectionValidation.code());
        w.put_i32(self.buffer_size);
        w.put_u16(self.registry_size);
        w.put_size(self.auth_methods.len())?;
        for method in &self.auth_methods {
            w.put_string(method)?;
        }
        w.end_message(mark)
    }
}

/// Client-to-server validation reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReply {
    pub buffer_size: i32,
    pub registry_size: u16,
    pub qos: u16,
    pub auth_method: String,
}

impl ValidationReply {
    /// Decode the reply. Authentication data that follows the method name is
    /// opaque here and skipped.
    pub fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let reply = Self {
            buffer_size: r.get_i32()?,
            registry_size: r.get_u16()?,
            qos: r.get_u16()?,
            auth_method: r.get_string()?,
        };
        r.skip(r.remaining())?;
        Ok(reply)
    }
}

impl RequestEncoder for ValidationReply {
    fn encode_request(&self, _version: u8, w: &mut WireWriter<'_>) -> Result<()> {
        let mark = w.begin_message(Command::ConnectionValidation.code());
        w.put_i32(self.buffer_size);
        w.put_u16(self.registry_size);
        w.put_u16(self.qos);
        w.put_string(&self.auth_method)?;
        // No authentication data.
        w.put_null_size();
        w.end_message(mark)
    }
}

/// Outcome carried by `VALIDATED` and other replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Ok,
    Warning(String),
    Error(String),
    Fatal(String),
}

impl Status {
    pub fn is_success(&self) -> bool {
        matches!(self, Status::Ok | Status::Warning(_))
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let kind = r.get_u8()?;
        if kind == STATUS_OK_NO_MESSAGE {
            return Ok(Status::Ok);
        }
        let message = r.get_string()?;
        // Call tree, unused.
        let _ = r.get_string()?;
        match kind {
            0 => Ok(Status::Ok),
            1 => Ok(Status::Warning(message)),
            2 => Ok(Status::Error(message)),
            3 => Ok(Status::Fatal(message)),
            other => Err(FrameError::malformed(
                "status",
                format!("unknown status type {other}"),
            )),
        }
    }

    pub fn encode(&self, w: &mut WireWriter<'_>) -> Result<()> {
        let (kind, message) = match self {
            Status::Ok => {
                w.put_u8(STATUS_OK_NO_MESSAGE);
                return Ok(());
            }
            Status::Warning(m) => (1, m),
            Status::Error(m) => (2, m),
            Status::Fatal(m) => (3, m),
        };
        w.put_u8(kind);
        w.put_string(message)?;
        w.put_string("")
    }
}

/// Server confirmation that ends validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validated(pub Status);

impl RequestEncoder for Validated {
    fn encode_request(&self, _version: u8, w: &mut WireWriter<'_>) -> Result<()> {
        let mark = w.begin_message(Command::ConnectionValidated.code());
        self.0.encode(w)?;
        w.end_message(mark)
    }
}
