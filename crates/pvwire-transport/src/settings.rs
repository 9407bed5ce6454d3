use std::time::Duration;

use serde::Serialize;
use tracing::warn;

/// Default UDP port for search requests and beacons.
pub const DEFAULT_BROADCAST_PORT: u16 = 5076;
/// Default TCP port of a PVA server.
pub const DEFAULT_SERVER_PORT: u16 = 5075;
/// Default TCP socket buffer size assumed for a peer.
pub const DEFAULT_TCP_BUFFER_SIZE: usize = 16 * 1024;
/// Default capacity of a connection's send queue.
pub const DEFAULT_SEND_QUEUE_SIZE: usize = 1024;
/// Largest UDP datagram received.
pub const MAX_UDP_PACKET: usize = 1500;
/// Largest UDP datagram sent, below the typical path MTU.
pub const MAX_UDP_UNFRAGMENTED_SEND: usize = 1440;

/// Process-level PVA settings, usually read from `EPICS_PVA_*` variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PvaSettings {
    /// Whitespace-separated list of search destinations.
    pub addr_list: String,
    /// Add broadcast addresses of all local interfaces to the search list.
    pub auto_addr_list: bool,
    /// UDP port for searches and beacons.
    pub broadcast_port: u16,
    /// TCP port on which servers listen.
    pub server_port: u16,
    /// Connection timeout; echo requests are sent at half of it.
    #[serde(with = "seconds")]
    pub conn_timeout: Duration,
    /// Socket buffer size assumed for a peer until it reports its own.
    pub tcp_buffer_size: usize,
    /// Capacity of each connection's send queue.
    pub send_queue_size: usize,
}

impl Default for PvaSettings {
    fn default() -> Self {
        Self {
            addr_list: String::new(),
            auto_addr_list: true,
            broadcast_port: DEFAULT_BROADCAST_PORT,
            server_port: DEFAULT_SERVER_PORT,
            conn_timeout: Duration::from_secs(30),
            tcp_buffer_size: DEFAULT_TCP_BUFFER_SIZE,
            send_queue_size: DEFAULT_SEND_QUEUE_SIZE,
        }
    }
}

impl PvaSettings {
    /// Read settings from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through an arbitrary key lookup.
    ///
    /// Missing keys keep their default. Values that fail to parse are logged
    /// and also keep their default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            addr_list: lookup("EPICS_PVA_ADDR_LIST").unwrap_or(defaults.addr_list),
            auto_addr_list: parse_or(
                &lookup,
                "EPICS_PVA_AUTO_ADDR_LIST",
                defaults.auto_addr_list,
                parse_bool,
            ),
            broadcast_port: parse_or(
                &lookup,
                "EPICS_PVA_BROADCAST_PORT",
                defaults.broadcast_port,
                |v| v.parse().ok(),
            ),
            server_port: parse_or(&lookup, "EPICS_PVA_SERVER_PORT", defaults.server_port, |v| {
                v.parse().ok()
            }),
            conn_timeout: parse_or(&lookup, "EPICS_PVA_CONN_TMO", defaults.conn_timeout, |v| {
                v.parse::<f64>()
                    .ok()
                    .filter(|secs| secs.is_finite() && *secs > 0.0)
                    .map(Duration::from_secs_f64)
            }),
            tcp_buffer_size: parse_or(
                &lookup,
                "EPICS_PVA_TCP_BUFFER_SIZE",
                defaults.tcp_buffer_size,
                |v| v.parse().ok().filter(|size| *size >= 1024),
            ),
            send_queue_size: parse_or(
                &lookup,
                "EPICS_PVA_SEND_QUEUE_SIZE",
                defaults.send_queue_size,
                |v| v.parse().ok().filter(|size| *size > 0),
            ),
        }
    }
}

fn parse_or<T, F, P>(lookup: &F, key: &str, default: T, parse: P) -> T
where
    F: Fn(&str) -> Option<String>,
    P: Fn(&str) -> Option<T>,
{
    match lookup(key) {
        None => default,
        Some(raw) => match parse(raw.trim()) {
            Some(value) => value,
            None => {
                warn!(key, value = %raw, "invalid setting, using default");
                default
            }
        },
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "yes" | "true" | "1" | "on" => Some(true),
        "no" | "false" | "0" | "off" => Some(false),
        _ => None,
    }
}

mod seconds {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }
}
