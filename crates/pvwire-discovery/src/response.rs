use std::net::SocketAddr;

use pvwire_frame::{Command, FrameError, RequestEncoder, Result, WireReader, WireWriter};

use crate::address::{decode_address, encode_address, resolve_reported, ADDRESS_SIZE};
use crate::guid::{Guid, GUID_SIZE};
use crate::search::PROTOCOL_TCP;

/// GUID, sequence, address, port, "tcp", found flag and channel count.
pub const MIN_PAYLOAD: usize = GUID_SIZE + 4 + ADDRESS_SIZE + 2 + 4 + 1 + 2;

/// A server's answer to a search request.
///
/// `found == false` with no channel ids is the answer to a discover-all
/// request; with channel ids it lists channels the server does not host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResponse {
    pub guid: Guid,
    pub sequence: u32,
    /// TCP address of the server.
    pub server: SocketAddr,
    pub protocol: String,
    pub found: bool,
    pub cids: Vec<u32>,
}

impl SearchResponse {
    pub fn new(guid: Guid, sequence: u32, server: SocketAddr, found: bool, cids: Vec<u32>) -> Self {
        Self {
            guid,
            sequence,
            server,
            protocol: PROTOCOL_TCP.to_string(),
            found,
            cids,
        }
    }

    /// Decode a response received from `from`. An unspecified server address
    /// is replaced by the sender's.
    pub fn decode(from: SocketAddr, payload_size: usize, r: &mut WireReader<'_>) -> Result<Self> {
        if payload_size < MIN_PAYLOAD {
            return Err(FrameError::malformed(
                "search response",
                format!("{payload_size} byte payload, need at least {MIN_PAYLOAD}"),
            ));
        }
        let guid = Guid::decode(r)?;
        let sequence = r.get_u32()?;
        let reported = decode_address(r)?;
        let port = r.get_u16()?;
        let protocol = r.get_string()?;
        if protocol != PROTOCOL_TCP {
            return Err(FrameError::malformed(
                "search response",
                format!("unsupported protocol '{protocol}'"),
            ));
        }
        let found = r.get_bool()?;
        let count = r.get_u16()? as usize;
        let cids = (0..count)
            .map(|_| r.get_u32())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            guid,
            sequence,
            server: resolve_reported(reported, port, from),
            protocol,
            found,
            cids,
        })
    }
}

impl RequestEncoder for SearchResponse {
    fn encode_request(&self, _version: u8, w: &mut WireWriter<'_>) -> Result<()> {
        let mark = w.begin_message(Command::SearchResponse.code());
        self.guid.encode(w);
        w.put_u32(self.sequence);
        encode_address(w, self.server.ip());
        w.put_u16(self.server.port());
        w.put_string(&self.protocol)?;
        w.put_bool(self.found);
        let count = u16::try_from(self.cids.len())
            .map_err(|_| FrameError::Encode(format!("{} channel ids in one response", self.cids.len())))?;
        w.put_u16(count);
        for cid in &self.cids {
            w.put_u32(*cid);
        }
        w.end_message(mark)
    }
}
