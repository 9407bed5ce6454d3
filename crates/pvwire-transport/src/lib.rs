//! Socket provisioning and address resolution for pvwire.
//!
//! This is the lowest layer of pvwire. It supplies:
//! - [`PvaStream`], a connected TCP stream that optionally carries the
//!   identity of a securely connected peer
//! - [`SocketFactory`], the boundary through which plain or secure sockets
//!   are obtained
//! - address list parsing, interface enumeration and UDP socket setup
//! - [`PvaSettings`], read from `EPICS_PVA_*` environment variables

pub mod error;
pub mod network;
pub mod settings;
pub mod tcp;
pub mod traits;

pub use error::{Result, TransportError};
pub use network::{
    apply_multicast_options, broadcast_addresses, configure_multicast, create_udp,
    interface_ipv4, interfaces, parse_address, parse_addresses, AddressInfo, NetworkInterface,
    DEFAULT_TTL, LOCAL_MULTICAST_GROUP,
};
pub use settings::{PvaSettings, MAX_UDP_PACKET, MAX_UDP_UNFRAGMENTED_SEND};
pub use tcp::{PlainSocketFactory, SocketFactory, TcpTransport};
pub use traits::{PeerIdentity, PvaStream};
