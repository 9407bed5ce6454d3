use crate::codec::Segment;

/// How far the damage of an error reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorTier {
    /// Framing of the byte stream can no longer be trusted; the connection
    /// must be dropped and rebuilt by its owner.
    ConnectionFatal,
    /// Only the current message is affected; processing continues with the
    /// next one.
    MessageLocal,
}

/// Errors that can occur during header, message and segment processing.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The header does not start with the protocol magic byte.
    #[error("invalid header magic 0x{0:02x} (expected 0xca)")]
    BadMagic(u8),

    /// The peer speaks a protocol revision older than the minimum supported.
    #[error("unsupported protocol version {version} (minimum {minimum})")]
    UnsupportedVersion { version: u8, minimum: u8 },

    /// A message arrived from the wrong side (client message on a client,
    /// server message on a server).
    #[error("message direction mismatch (expected_server={expected_server})")]
    WrongDirection { expected_server: bool },

    /// A field read ran past the end of the message.
    #[error("message truncated: need {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    /// A size field holds a negative or otherwise impossible value.
    #[error("invalid size field {0}")]
    InvalidSize(i64),

    /// A string field is not valid UTF-8.
    #[error("invalid string: {0}")]
    InvalidString(#[from] std::str::Utf8Error),

    /// A middle or last segment arrived without a preceding first segment.
    #[error("{segment} segment for command {command} without a first segment")]
    SegmentOutOfOrder { segment: Segment, command: u8 },

    /// A segment continues a different command than the first segment.
    #[error("segment command {actual} does not match first segment command {expected}")]
    SegmentCommandMismatch { expected: u8, actual: u8 },

    /// No handler is registered for the command.
    #[error("unknown command {0}")]
    UnknownCommand(u8),

    /// A handler is already registered for the command.
    #[error("duplicate handler for command {0}")]
    DuplicateHandler(u8),

    /// A message on the stream exceeds the configured maximum size.
    #[error("message too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Reassembling segments would exceed the configured maximum size. The
    /// segments themselves were consumed, so the stream stays in step.
    #[error("segmented message too large ({size} bytes, max {max})")]
    SegmentTooLarge { size: usize, max: usize },

    /// A handler rejected the message contents.
    #[error("malformed {what}: {reason}")]
    Malformed { what: &'static str, reason: String },

    /// An outbound item failed to encode.
    #[error("encode failed: {0}")]
    Encode(String),

    /// An I/O error occurred while reading or writing messages.
    #[error("message I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,
}

impl FrameError {
    /// Classify the error for the receive loop.
    pub fn tier(&self) -> ErrorTier {
        match self {
            FrameError::BadMagic(_)
            | FrameError::UnsupportedVersion { .. }
            | FrameError::WrongDirection { .. }
            | FrameError::PayloadTooLarge { .. }
            | FrameError::Io(_)
            | FrameError::ConnectionClosed => ErrorTier::ConnectionFatal,
            _ => ErrorTier::MessageLocal,
        }
    }

    /// Shorthand for [`FrameError::Malformed`].
    pub fn malformed(what: &'static str, reason: impl Into<String>) -> Self {
        FrameError::Malformed {
            what,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;

pub(crate) fn transport_to_frame_error(err: pvwire_transport::TransportError) -> FrameError {
    use pvwire_transport::TransportError;

    match err {
        TransportError::Io(io) | TransportError::Accept(io) => FrameError::Io(io),
        TransportError::Bind { source, .. } | TransportError::Connect { source, .. } => {
            FrameError::Io(source)
        }
        other => FrameError::Io(std::io::Error::other(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_violations_are_fatal() {
        assert_eq!(FrameError::BadMagic(0).tier(), ErrorTier::ConnectionFatal);
        assert_eq!(
            FrameError::UnsupportedVersion {
                version: 0,
                minimum: 1
            }
            .tier(),
            ErrorTier::ConnectionFatal
        );
        assert_eq!(
            FrameError::WrongDirection {
                expected_server: true
            }
            .tier(),
            ErrorTier::ConnectionFatal
        );
        assert_eq!(FrameError::ConnectionClosed.tier(), ErrorTier::ConnectionFatal);
    }

    #[test]
    fn decode_problems_are_local() {
        assert_eq!(
            FrameError::Truncated {
                needed: 4,
                remaining: 1
            }
            .tier(),
            ErrorTier::MessageLocal
        );
        assert_eq!(FrameError::UnknownCommand(99).tier(), ErrorTier::MessageLocal);
        assert_eq!(
            FrameError::SegmentCommandMismatch {
                expected: 10,
                actual: 11
            }
            .tier(),
            ErrorTier::MessageLocal
        );
        assert_eq!(
            FrameError::SegmentTooLarge { size: 100, max: 64 }.tier(),
            ErrorTier::MessageLocal
        );
    }

    #[test]
    fn oversize_stream_message_is_fatal() {
        assert_eq!(
            FrameError::PayloadTooLarge { size: 100, max: 64 }.tier(),
            ErrorTier::ConnectionFatal
        );
    }

    #[test]
    fn direction_message_names_side() {
        let err = FrameError::WrongDirection {
            expected_server: true,
        };
        assert!(err.to_string().contains("server"));
    }
}
