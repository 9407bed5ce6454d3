//! Search request: which server hosts these channels?
//!
//! Payload layout:
//! - sequence id (4 bytes)
//! - flags (1 byte) and 3 reserved bytes
//! - reply address (16 bytes) and port (2 bytes)
//! - size-prefixed list of transport names
//! - channel count (2 bytes), then `(cid, name)` pairs
//!
//! A channel count of zero asks every server to identify itself.

use std::net::SocketAddr;

use pvwire_frame::{Command, FrameError, RequestEncoder, Result, WireReader, WireWriter};

use crate::address::{decode_address, encode_address, resolve_reported, ADDRESS_SIZE};

/// Flag bits of a search request.
pub mod flags {
    /// Servers must answer even when they host none of the channels.
    pub const REPLY_REQUIRED: u8 = 0x01;
    /// Reply to the UDP source port rather than the encoded port.
    pub const REPLY_TO_SOURCE_PORT: u8 = 0x02;
    /// Sent to a unicast address; the receiver forwards it to co-located
    /// servers.
    pub const UNICAST: u8 = 0x80;
}

/// Offset of the flags byte within the payload.
pub const FLAGS_OFFSET: usize = 4;

/// Smallest valid payload: everything up to an empty transport list and a
/// zero channel count.
pub const MIN_PAYLOAD: usize = 4 + 1 + 3 + ADDRESS_SIZE + 2 + 1 + 2;

pub const PROTOCOL_TCP: &str = "tcp";
pub const PROTOCOL_TLS: &str = "tls";

/// One searched channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchedName {
    pub cid: u32,
    pub name: String,
}

impl SearchedName {
    pub fn new(cid: u32, name: impl Into<String>) -> Self {
        Self {
            cid,
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub sequence: u32,
    pub unicast: bool,
    pub reply_required: bool,
    pub reply_to_source_port: bool,
    /// Where servers send their response.
    pub reply_addr: SocketAddr,
    /// Transports the client can use, in preference order.
    pub protocols: Vec<String>,
    /// `None` asks every server to identify itself.
    pub channels: Option<Vec<SearchedName>>,
}

impl SearchRequest {
    /// Search for specific channels. `tls` additionally offers secure
    /// transport.
    pub fn for_channels(
        sequence: u32,
        channels: Vec<SearchedName>,
        reply_addr: SocketAddr,
        tls: bool,
    ) -> Self {
        Self {
            sequence,
            unicast: true,
            reply_required: false,
            reply_to_source_port: false,
            reply_addr,
            protocols: protocols(tls),
            channels: Some(channels),
        }
    }

    /// Ask every server to identify itself.
    pub fn discover_all(reply_addr: SocketAddr) -> Self {
        Self {
            sequence: 0,
            unicast: true,
            reply_required: true,
            reply_to_source_port: false,
            reply_addr,
            protocols: protocols(false),
            channels: None,
        }
    }

    pub fn with_unicast(mut self, unicast: bool) -> Self {
        self.unicast = unicast;
        self
    }

    pub fn is_discover_all(&self) -> bool {
        self.channels.is_none()
    }

    pub fn offers_tcp(&self) -> bool {
        self.protocols.iter().any(|p| p == PROTOCOL_TCP)
    }

    pub fn offers_tls(&self) -> bool {
        self.protocols.iter().any(|p| p == PROTOCOL_TLS)
    }

    fn flag_bits(&self) -> u8 {
        let mut bits = 0;
        if self.unicast {
            bits |= flags::UNICAST;
        }
        if self.reply_required || self.channels.is_none() {
            bits |= flags::REPLY_REQUIRED;
        }
        if self.reply_to_source_port {
            bits |= flags::REPLY_TO_SOURCE_PORT;
        }
        bits
    }

    /// Decode a request received from `from`.
    ///
    /// `relayed` is set when an origin tag preceded the request; the source
    /// port then belongs to the relay, so the reply-to-source-port flag is
    /// ignored.
    pub fn decode(
        from: SocketAddr,
        payload_size: usize,
        relayed: bool,
        r: &mut WireReader<'_>,
    ) -> Result<Self> {
        if payload_size < MIN_PAYLOAD {
            return Err(FrameError::malformed(
                "search request",
                format!("{payload_size} byte payload, need at least {MIN_PAYLOAD}"),
            ));
        }
        let sequence = r.get_u32()?;
        let bits = r.get_u8()?;
        r.skip(3)?;
        let reported = decode_address(r)?;
        let port = r.get_u16()?;

        let count = r.get_size()?.unwrap_or(0);
        if count > r.remaining() {
            return Err(FrameError::InvalidSize(count as i64));
        }
        let protocols = (0..count)
            .map(|_| r.get_string())
            .collect::<Result<Vec<_>>>()?;

        let channel_count = r.get_u16()? as usize;
        let channels = if channel_count == 0 {
            None
        } else {
            let mut channels = Vec::with_capacity(channel_count.min(r.remaining() / 5));
            for _ in 0..channel_count {
                let cid = r.get_u32()?;
                channels.push(SearchedName {
                    cid,
                    name: r.get_string()?,
                });
            }
            Some(channels)
        };

        let reply_to_source_port = bits & flags::REPLY_TO_SOURCE_PORT != 0;
        let port = if reply_to_source_port && !relayed {
            from.port()
        } else {
            port
        };
        let request = Self {
            sequence,
            unicast: bits & flags::UNICAST != 0,
            reply_required: bits & flags::REPLY_REQUIRED != 0 || channels.is_none(),
            reply_to_source_port,
            reply_addr: resolve_reported(reported, port, from),
            protocols,
            channels,
        };
        if !request.is_discover_all() && !request.offers_tcp() && !request.offers_tls() {
            return Err(FrameError::malformed(
                "search request",
                format!("no supported transport in {:?}", request.protocols),
            ));
        }
        Ok(request)
    }
}

impl RequestEncoder for SearchRequest {
    fn encode_request(&self, _version: u8, w: &mut WireWriter<'_>) -> Result<()> {
        let mark = w.begin_message(Command::Search.code());
        w.put_u32(self.sequence);
        w.put_u8(self.flag_bits());
        w.put_bytes(&[0, 0, 0]);
        encode_address(w, self.reply_addr.ip());
        w.put_u16(self.reply_addr.port());

        w.put_size(self.protocols.len())?;
        for protocol in &self.protocols {
            w.put_string(protocol)?;
        }

        let channels = self.channels.as_deref().unwrap_or_default();
        let count = u16::try_from(channels.len()).map_err(|_| {
            FrameError::Encode(format!("{} channels in one search request", channels.len()))
        })?;
        w.put_u16(count);
        for channel in channels {
            w.put_u32(channel.cid);
            w.put_string(&channel.name)?;
        }
        w.end_message(mark)
    }
}

fn protocols(tls: bool) -> Vec<String> {
    if tls {
        vec![PROTOCOL_TLS.to_string(), PROTOCOL_TCP.to_string()]
    } else {
        vec![PROTOCOL_TCP.to_string()]
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use pvwire_frame::{ByteOrder, Header, HEADER_SIZE};

    use super::*;

    const CLIENT: &str = "192.168.10.4:41000";

    fn encode(request: &SearchRequest, order: ByteOrder) -> BytesMut {
        let mut buf = BytesMut::new();
        let mut w = WireWriter::new(&mut buf, order);
        request.encode_request(2, &mut w).expect("encode");
        buf
    }

    fn decode_from(buf: &[u8], from: SocketAddr, relayed: bool) -> Result<SearchRequest> {
        let header = Header::decode(buf)?;
        let mut r = WireReader::new(&buf[HEADER_SIZE..], header.order());
        SearchRequest::decode(from, header.payload_size as usize, relayed, &mut r)
    }

    fn client() -> SocketAddr {
        CLIENT.parse().expect("addr")
    }

    #[test]
    fn channel_search_round_trip() {
        let request =
            SearchRequest::for_channels(42, vec![SearchedName::new(7, "test:pv")], client(), false);
        let buf = encode(&request, ByteOrder::Big);

        let header = Header::decode(&buf).expect("header");
        assert_eq!(header.command, Command::Search.code());
        assert_eq!(header.message_size(), buf.len());

        let decoded = decode_from(&buf, client(), false).expect("decode");
        assert_eq!(decoded.sequence, 42);
        assert_eq!(
            decoded.channels.as_deref(),
            Some(&[SearchedName::new(7, "test:pv")][..])
        );
        assert!(!decoded.offers_tls());
        assert!(decoded.offers_tcp());
        assert!(decoded.unicast);
        assert!(!decoded.reply_required);
        assert_eq!(decoded.reply_addr, client());
    }

    #[test]
    fn discover_all_forces_reply() {
        let mut request = SearchRequest::discover_all(client());
        request.reply_required = false;
        let buf = encode(&request, ByteOrder::Little);

        let decoded = decode_from(&buf, client(), false).expect("decode");
        assert!(decoded.channels.is_none());
        assert!(decoded.reply_required);
    }

    #[test]
    fn tls_is_offered_first() {
        let request =
            SearchRequest::for_channels(1, vec![SearchedName::new(1, "a")], client(), true);
        let decoded = decode_from(&encode(&request, ByteOrder::Big), client(), false).expect("decode");
        assert_eq!(decoded.protocols, vec!["tls", "tcp"]);
    }

    #[test]
    fn rejects_channel_search_without_known_transport() {
        let mut request =
            SearchRequest::for_channels(1, vec![SearchedName::new(1, "a")], client(), false);
        request.protocols = vec!["udp".into()];
        let err = decode_from(&encode(&request, ByteOrder::Big), client(), false)
            .expect_err("transport must be rejected");
        assert!(matches!(err, FrameError::Malformed { .. }));
    }

    #[test]
    fn rejects_short_payload() {
        let mut buf = BytesMut::new();
        let mut w = WireWriter::new(&mut buf, ByteOrder::Big);
        let mark = w.begin_message(Command::Search.code());
        w.put_u32(1);
        w.end_message(mark).expect("end");
        assert!(matches!(
            decode_from(&buf, client(), false),
            Err(FrameError::Malformed { .. })
        ));
    }

    #[test]
    fn source_port_honored_only_when_not_relayed() {
        let mut request =
            SearchRequest::for_channels(3, vec![SearchedName::new(2, "b")], client(), false);
        request.reply_to_source_port = true;
        let buf = encode(&request, ByteOrder::Big);
        let from: SocketAddr = "192.168.10.4:5999".parse().expect("addr");

        let direct = decode_from(&buf, from, false).expect("decode");
        assert_eq!(direct.reply_addr.port(), 5999);

        let relayed = decode_from(&buf, from, true).expect("decode");
        assert_eq!(relayed.reply_addr.port(), 41000);
    }

    #[test]
    fn unspecified_reply_address_uses_sender() {
        let any: SocketAddr = "0.0.0.0:41000".parse().expect("addr");
        let request =
            SearchRequest::for_channels(3, vec![SearchedName::new(2, "b")], any, false);
        let decoded =
            decode_from(&encode(&request, ByteOrder::Little), client(), false).expect("decode");
        assert_eq!(decoded.reply_addr, client());
    }

    #[test]
    fn unicast_bit_sits_at_flags_offset() {
        let request =
            SearchRequest::for_channels(9, vec![SearchedName::new(2, "b")], client(), false);
        let buf = encode(&request, ByteOrder::Big);
        assert_eq!(buf[HEADER_SIZE + FLAGS_OFFSET], flags::UNICAST);
        let decoded = decode_from(&encode(&request.with_unicast(false), ByteOrder::Big), client(), false)
            .expect("decode");
        assert!(!decoded.unicast);
    }
}
