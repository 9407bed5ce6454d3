//! PVA discovery over UDP.
//!
//! Clients broadcast search requests naming channels; servers answer with
//! their GUID and TCP address, and announce themselves with beacons. A
//! datagram may carry several messages back to back. Search requests sent
//! unicast to a host are relayed to the local multicast group behind an
//! origin tag, so every server on that host sees them.

pub mod access;
pub mod address;
pub mod beacon;
pub mod channel_search;
pub mod client;
pub mod error;
pub mod guid;
pub mod origin;
pub mod responder;
pub mod response;
pub mod search;
pub mod udp;

pub use access::{rights, AccessRightsChange};
pub use address::{decode_address, encode_address, resolve_reported, ADDRESS_SIZE};
pub use beacon::Beacon;
pub use channel_search::{advance_counter, classify, ChannelSearch, Destination, SEARCH_JITTER, SEARCH_PERIOD};
pub use client::{ClientDiscovery, DiscoveryEvent, SearchHit};
pub use error::{DiscoveryError, Result};
pub use guid::{Guid, GUID_SIZE};
pub use origin::{OriginTag, ORIGIN_TAG_MESSAGE_SIZE};
pub use responder::SearchResponder;
pub use response::SearchResponse;
pub use search::{flags, SearchRequest, SearchedName, PROTOCOL_TCP, PROTOCOL_TLS};
pub use udp::{demultiplex, DatagramHandler, DiscoveryConfig, DiscoveryEngine, EngineStopper, SubMessage};
