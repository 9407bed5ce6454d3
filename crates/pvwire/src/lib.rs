//! PVA wire protocol for Rust.
//!
//! pvwire implements the transport layer of the PVA protocol: message
//! framing and segmentation, TCP connections with their validation
//! handshake, and UDP channel discovery.
//!
//! # Crate Structure
//!
//! - [`transport`]: socket provisioning, address lists, `EPICS_PVA_*` settings
//! - [`frame`]: header codec, wire cursors, segment reassembly, command dispatch
//! - [`peer`]: connection engine, client and server roles (behind `peer` feature)
//! - [`discovery`]: search, beacons and the UDP receive loop (behind `discovery` feature)

/// Re-export transport types.
pub mod transport {
    pub use pvwire_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use pvwire_frame::*;
}

/// Re-export connection types (requires `peer` feature).
#[cfg(feature = "peer")]
pub mod peer {
    pub use pvwire_peer::*;
}

/// Re-export discovery types (requires `discovery` feature).
#[cfg(feature = "discovery")]
pub mod discovery {
    pub use pvwire_discovery::*;
}
