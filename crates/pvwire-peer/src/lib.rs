//! Connection engine for PVA peers.
//!
//! One receiver thread per connection reads, reassembles and dispatches
//! messages; one sender thread drains a bounded queue of outbound items.
//! Client and server ends differ only in their [`ConnectionRole`], which
//! drives connection validation and echo handling.

pub mod client;
pub mod config;
pub mod connection;
pub mod control;
pub mod error;
pub mod message;
pub mod pool;
pub mod role;
pub mod server;
pub mod validation;

pub use client::{connect, connect_with, ClientRole};
pub use config::ConnectionConfig;
pub use connection::Connection;
pub use control::{echo_request, echo_response, set_byte_order};
pub use error::{PeerError, Result};
pub use message::{Severity, TextMessage};
pub use pool::{TaskHandle, ThreadPool};
pub use role::{default_application, default_control, ConnectionRole};
pub use server::{PvaListener, ServerRole};
pub use validation::{
    Status, Validated, ValidationReply, ValidationRequest, AUTH_ANONYMOUS, AUTH_CA,
    DEFAULT_REGISTRY_SIZE,
};
