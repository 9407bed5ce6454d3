use std::net::SocketAddr;

use pvwire_frame::{Command, FrameError, RequestEncoder, Result, WireReader, WireWriter};
use tracing::debug;

use crate::address::{decode_address, encode_address, resolve_reported, ADDRESS_SIZE};
use crate::guid::{Guid, GUID_SIZE};
use crate::search::PROTOCOL_TCP;

/// GUID, flags, sequence, change count, address, port, "tcp", status.
pub const MIN_PAYLOAD: usize = GUID_SIZE + 1 + 1 + 2 + ADDRESS_SIZE + 2 + 4 + 1;

/// Type code of an absent server status structure.
const NULL_TYPE_CODE: u8 = 0xFF;

/// Periodic server announcement.
///
/// The change count increments, and rolls over, whenever the set of channels
/// the server hosts changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Beacon {
    pub guid: Guid,
    pub flags: u8,
    pub sequence: u8,
    pub change_count: u16,
    pub server: SocketAddr,
    pub protocol: String,
}

impl Beacon {
    pub fn new(guid: Guid, sequence: u8, change_count: u16, server: SocketAddr) -> Self {
        Self {
            guid,
            flags: 0,
            sequence,
            change_count,
            server,
            protocol: PROTOCOL_TCP.to_string(),
        }
    }

    pub fn decode(from: SocketAddr, payload_size: usize, r: &mut WireReader<'_>) -> Result<Self> {
        if payload_size < MIN_PAYLOAD {
            return Err(FrameError::malformed(
                "beacon",
                format!("{payload_size} byte payload, need at least {MIN_PAYLOAD}"),
            ));
        }
        let guid = Guid::decode(r)?;
        let flags = r.get_u8()?;
        let sequence = r.get_u8()?;
        let change_count = r.get_u16()?;
        let reported = decode_address(r)?;
        let port = r.get_u16()?;
        let protocol = r.get_string()?;
        if protocol != PROTOCOL_TCP {
            return Err(FrameError::malformed(
                "beacon",
                format!("unsupported protocol '{protocol}'"),
            ));
        }
        let status = r.get_u8()?;
        if status != NULL_TYPE_CODE {
            debug!(%from, "beacon carries a server status, ignored");
        }
        Ok(Self {
            guid,
            flags,
            sequence,
            change_count,
            server: resolve_reported(reported, port, from),
            protocol,
        })
    }
}

impl RequestEncoder for Beacon {
    fn encode_request(&self, _version: u8, w: &mut WireWriter<'_>) -> Result<()> {
        let mark = w.begin_message(Command::Beacon.code());
        self.guid.encode(w);
        w.put_u8(self.flags);
        w.put_u8(self.sequence);
        w.put_u16(self.change_count);
        encode_address(w, self.server.ip());
        w.put_u16(self.server.port());
        w.put_string(&self.protocol)?;
        w.put_u8(NULL_TYPE_CODE);
        w.end_message(mark)
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use pvwire_frame::{ByteOrder, Header, HEADER_SIZE};

    use super::*;

    #[test]
    fn beacon_round_trip() {
        let beacon = Beacon::new(
            Guid::random(),
            17,
            300,
            "10.0.0.2:5075".parse().expect("addr"),
        );
        let mut buf = BytesMut::new();
        beacon
            .encode_request(2, &mut WireWriter::new(&mut buf, ByteOrder::Big).with_server_origin(true))
            .expect("encode");
        let header = Header::decode(&buf).expect("header");
        assert_eq!(header.payload_size as usize, MIN_PAYLOAD);

        let mut r = WireReader::new(&buf[HEADER_SIZE..], header.order());
        let decoded = Beacon::decode("10.0.0.2:5076".parse().expect("addr"), MIN_PAYLOAD, &mut r)
            .expect("decode");
        assert_eq!(decoded, beacon);
        assert!(!r.has_remaining());
    }

    #[test]
    fn short_beacon_is_malformed() {
        let err = Beacon::decode(
            "10.0.0.2:5076".parse().expect("addr"),
            MIN_PAYLOAD - 1,
            &mut WireReader::new(&[], ByteOrder::Big),
        )
        .expect_err("too short");
        assert!(matches!(err, FrameError::Malformed { .. }));
    }
}
