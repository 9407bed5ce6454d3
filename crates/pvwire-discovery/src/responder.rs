use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;

use bytes::BytesMut;
use pvwire_frame::{hex_dump, ByteOrder, Command, RequestEncoder, WireWriter, PROTOCOL_REVISION};
use tracing::{debug, trace, warn};

use crate::error::{DiscoveryError, Result};
use crate::guid::Guid;
use crate::response::SearchResponse;
use crate::search::SearchRequest;
use crate::udp::{DatagramHandler, SubMessage};

/// Server side of discovery: answers search requests for the channels a
/// predicate accepts.
pub struct SearchResponder<P> {
    guid: Guid,
    server: SocketAddr,
    socket: Arc<UdpSocket>,
    hosts: P,
}

impl<P> SearchResponder<P>
where
    P: Fn(&str) -> bool + Send,
{
    /// `server` is the TCP address advertised in replies. An unspecified IP
    /// is resolved by the client to the sender of the reply.
    pub fn new(guid: Guid, server: SocketAddr, socket: Arc<UdpSocket>, hosts: P) -> Self {
        Self {
            guid,
            server,
            socket,
            hosts,
        }
    }

    pub fn guid(&self) -> Guid {
        self.guid
    }

    /// The reply for `request`, if one is due.
    pub fn answer(&self, request: &SearchRequest) -> Option<SearchResponse> {
        let channels = match &request.channels {
            None => {
                return Some(SearchResponse::new(
                    self.guid,
                    request.sequence,
                    self.server,
                    false,
                    Vec::new(),
                ))
            }
            Some(channels) => channels,
        };
        if !request.offers_tcp() {
            debug!(sequence = request.sequence, "search offers no tcp, ignored");
            return None;
        }
        let (found, missing): (Vec<_>, Vec<_>) = channels
            .iter()
            .partition(|channel| (self.hosts)(&channel.name));
        if !found.is_empty() {
            let cids = found.iter().map(|channel| channel.cid).collect();
            return Some(SearchResponse::new(
                self.guid,
                request.sequence,
                self.server,
                true,
                cids,
            ));
        }
        if request.reply_required {
            let cids = missing.iter().map(|channel| channel.cid).collect();
            return Some(SearchResponse::new(
                self.guid,
                request.sequence,
                self.server,
                false,
                cids,
            ));
        }
        None
    }

    fn reply(&self, to: SocketAddr, response: &SearchResponse) -> Result<()> {
        let mut buf = BytesMut::new();
        let mut w = WireWriter::new(&mut buf, ByteOrder::native()).with_server_origin(true);
        response.encode_request(PROTOCOL_REVISION, &mut w)?;
        trace!(%to, "search response\n{}", hex_dump(&buf));
        self.socket
            .send_to(&buf, to)
            .map_err(|source| DiscoveryError::Send { addr: to, source })?;
        Ok(())
    }

    fn handle_search(&mut self, from: SocketAddr, message: &SubMessage<'_>) -> bool {
        let relayed = message.origin_tag().is_some();
        let request = match SearchRequest::decode(from, message.payload_size(), relayed, &mut message.payload()) {
            Ok(request) => request,
            Err(err) => {
                warn!(%from, error = %err, "invalid search request");
                return false;
            }
        };
        trace!(
            %from,
            sequence = request.sequence,
            relayed,
            discover_all = request.is_discover_all(),
            "search request"
        );
        if let Some(response) = self.answer(&request) {
            debug!(
                to = %request.reply_addr,
                sequence = response.sequence,
                found = response.found,
                cids = response.cids.len(),
                "answering search"
            );
            if let Err(err) = self.reply(request.reply_addr, &response) {
                warn!(error = %err, "cannot send search response");
            }
        }
        true
    }
}

impl<P> DatagramHandler for SearchResponder<P>
where
    P: Fn(&str) -> bool + Send,
{
    fn handle_message(&mut self, from: SocketAddr, message: &SubMessage<'_>) -> bool {
        match Command::try_from(message.header.command) {
            Ok(Command::Search) => self.handle_search(from, message),
            Ok(Command::Beacon) | Ok(Command::SearchResponse) => {
                trace!(%from, command = message.header.command, "not for a server, ignored");
                true
            }
            _ => {
                warn!(%from, command = message.header.command, "unexpected discovery message");
                false
            }
        }
    }
}
