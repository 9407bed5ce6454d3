use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::Arc;

use bytes::BytesMut;
use pvwire_frame::{hex_dump, ByteOrder, Command, RequestEncoder, WireWriter, PROTOCOL_REVISION};
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::beacon::Beacon;
use crate::guid::Guid;
use crate::origin::OriginTag;
use crate::search::SearchRequest;
use crate::response::SearchResponse;
use crate::udp::{DatagramHandler, SubMessage};

/// A server answering a search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchHit {
    /// Channel the server hosts; `None` for a discover-all answer or a
    /// not-found reply.
    pub cid: Option<u32>,
    pub server: SocketAddr,
    pub guid: Guid,
    pub version: u8,
    pub sequence: u32,
}

/// What a client learns from the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Beacon { from: SocketAddr, beacon: Beacon },
    Found(SearchHit),
}

struct Forwarder {
    socket: Arc<UdpSocket>,
    group: SocketAddr,
    origin: IpAddr,
}

/// Client side of discovery.
///
/// Reports beacons and search responses. Unicast search requests that reach
/// this process are forwarded to the local multicast group, since only the
/// process bound last on a port receives unicast traffic.
pub struct ClientDiscovery<F> {
    on_event: F,
    forward: Option<Forwarder>,
}

impl<F> ClientDiscovery<F>
where
    F: FnMut(DiscoveryEvent) + Send,
{
    pub fn new(on_event: F) -> Self {
        Self {
            on_event,
            forward: None,
        }
    }

    /// Forward unicast search requests to `group` through `socket`, tagged
    /// with `origin`.
    pub fn with_forwarding(mut self, socket: Arc<UdpSocket>, group: SocketAddr, origin: IpAddr) -> Self {
        self.forward = Some(Forwarder {
            socket,
            group,
            origin,
        });
        self
    }

    fn handle_beacon(&mut self, from: SocketAddr, message: &SubMessage<'_>) -> bool {
        match Beacon::decode(from, message.payload_size(), &mut message.payload()) {
            Ok(beacon) => {
                trace!(
                    %from,
                    guid = %beacon.guid,
                    sequence = beacon.sequence,
                    changes = beacon.change_count,
                    "beacon"
                );
                (self.on_event)(DiscoveryEvent::Beacon { from, beacon });
                true
            }
            Err(err) => {
                warn!(%from, error = %err, "invalid beacon");
                false
            }
        }
    }

    fn handle_response(&mut self, from: SocketAddr, message: &SubMessage<'_>) -> bool {
        let response = match SearchResponse::decode(from, message.payload_size(), &mut message.payload()) {
            Ok(response) => response,
            Err(err) => {
                warn!(%from, error = %err, "invalid search response");
                return false;
            }
        };
        debug!(
            %from,
            server = %response.server,
            guid = %response.guid,
            sequence = response.sequence,
            found = response.found,
            "search response"
        );
        let hit = |cid| SearchHit {
            cid,
            server: response.server,
            guid: response.guid,
            version: message.header.version,
            sequence: response.sequence,
        };
        if !response.found {
            (self.on_event)(DiscoveryEvent::Found(hit(None)));
            return true;
        }
        for cid in &response.cids {
            (self.on_event)(DiscoveryEvent::Found(hit(Some(*cid))));
        }
        true
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
        if !request.unicast {
            return true;
        }
        if let Some(forward) = &self.forward {
            if let Err(err) = forward.relay(&request) {
                warn!(%from, error = %err, "cannot forward search request");
            }
        }
        true
    }
}

impl<F> DatagramHandler for ClientDiscovery<F>
where
    F: FnMut(DiscoveryEvent) + Send,
{
    fn handle_message(&mut self, from: SocketAddr, message: &SubMessage<'_>) -> bool {
        match Command::try_from(message.header.command) {
            Ok(Command::Beacon) => self.handle_beacon(from, message),
            Ok(Command::SearchResponse) => self.handle_response(from, message),
            Ok(Command::Search) => self.handle_search(from, message),
            _ => {
                warn!(%from, command = message.header.command, "unexpected discovery message");
                false
            }
        }
    }
}

impl Forwarder {
    /// Re-send `request` to the local group, one channel per request.
    fn relay(&self, request: &SearchRequest) -> crate::Result<()> {
        let relayed: Vec<SearchRequest> = match &request.channels {
            None if request.reply_required => {
                vec![SearchRequest::discover_all(request.reply_addr).with_unicast(false)]
            }
            None => Vec::new(),
            Some(channels) => channels
                .iter()
                .map(|channel| SearchRequest {
                    unicast: false,
                    reply_to_source_port: false,
                    channels: Some(vec![channel.clone()]),
                    ..request.clone()
                })
                .collect(),
        };
        let tag = OriginTag::new(self.origin);
        for item in relayed {
            let mut buf = BytesMut::new();
            let mut w = WireWriter::new(&mut buf, ByteOrder::native());
            tag.encode_request(PROTOCOL_REVISION, &mut w)?;
            item.encode_request(PROTOCOL_REVISION, &mut w)?;
            trace!(group = %self.group, "forwarding search\n{}", hex_dump(&buf));
            self.socket
                .send_to(&buf, self.group)
                .map_err(|source| crate::DiscoveryError::Send {
                    addr: self.group,
                    source,
                })?;
        }
        Ok(())
    }
}
