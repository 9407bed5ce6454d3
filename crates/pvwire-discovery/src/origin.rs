use std::net::IpAddr;

use pvwire_frame::{Command, Header, RequestEncoder, Result, WireReader, WireWriter, HEADER_SIZE};

use crate::address::{decode_address, encode_address, ADDRESS_SIZE};

/// Size of a complete origin tag message, header included.
pub const ORIGIN_TAG_MESSAGE_SIZE: usize = HEADER_SIZE + ADDRESS_SIZE;

/// Marks where a forwarded datagram entered the host.
///
/// A forwarder writes the tag immediately before the one search request it
/// relays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OriginTag {
    pub addr: IpAddr,
}

impl OriginTag {
    pub fn new(addr: IpAddr) -> Self {
        Self { addr }
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            addr: decode_address(r)?,
        })
    }

    /// Find the tag preceding the message that starts at `start`.
    ///
    /// Detection is positional: the message exactly one tag length before
    /// `start` must be an origin tag.
    pub fn preceding(datagram: &[u8], start: usize) -> Option<Self> {
        let tag_start = start.checked_sub(ORIGIN_TAG_MESSAGE_SIZE)?;
        let header = Header::decode(&datagram[tag_start..]).ok()?;
        if header.is_control()
            || header.command != Command::OriginTag.code()
            || header.payload_size as usize != ADDRESS_SIZE
        {
            return None;
        }
        let mut r = WireReader::new(&datagram[tag_start + HEADER_SIZE..start], header.order());
        Self::decode(&mut r).ok()
    }
}

impl RequestEncoder for OriginTag {
    fn encode_request(&self, _version: u8, w: &mut WireWriter<'_>) -> Result<()> {
        let mark = w.begin_message(Command::OriginTag.code());
        encode_address(w, self.addr);
        w.end_message(mark)
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use bytes::BytesMut;
    use pvwire_frame::{ByteOrder, RawMessage};

    use super::*;

    #[test]
    fn tag_is_found_before_next_message() {
        let tag = OriginTag::new(IpAddr::V4(Ipv4Addr::new(172, 16, 0, 1)));
        let mut buf = BytesMut::new();
        let mut w = WireWriter::new(&mut buf, ByteOrder::Big);
        tag.encode_request(2, &mut w).expect("tag");
        RawMessage::new(Command::Search, vec![0u8; 4])
            .encode_request(2, &mut w)
            .expect("search");

        assert_eq!(OriginTag::preceding(&buf, ORIGIN_TAG_MESSAGE_SIZE), Some(tag));
        assert_eq!(OriginTag::preceding(&buf, 0), None);
    }

    #[test]
    fn other_command_is_not_a_tag() {
        let mut buf = BytesMut::new();
        let mut w = WireWriter::new(&mut buf, ByteOrder::Little);
        RawMessage::new(Command::Echo, vec![0u8; ADDRESS_SIZE])
            .encode_request(2, &mut w)
            .expect("echo");
        assert_eq!(OriginTag::preceding(&buf, ORIGIN_TAG_MESSAGE_SIZE), None);
    }
}
