//! Address parsing, interface enumeration and UDP socket setup.
//!
//! Address lists use the form `address[:port][,ttl][@interface]`, for example
//! `10.1.2.255`, `server.example.org:5086`, `[::1]:5076` or
//! `224.0.2.3:5076,16@eth0`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};

use tracing::{debug, warn};

use crate::error::{Result, TransportError};

/// Time-to-live used when an address does not specify one.
pub const DEFAULT_TTL: u32 = 1;

/// Multicast group used to re-distribute unicast searches to all PVA
/// participants on the local host.
pub const LOCAL_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 128);

/// A resolved socket address with its time-to-live and optional interface.
///
/// Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressInfo {
    addr: SocketAddr,
    ttl: u32,
    interface: Option<String>,
}

impl AddressInfo {
    pub fn new(addr: SocketAddr, ttl: u32, interface: Option<String>) -> Self {
        Self {
            addr,
            ttl,
            interface,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn ttl(&self) -> u32 {
        self.ttl
    }

    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    pub fn is_multicast(&self) -> bool {
        self.addr.ip().is_multicast()
    }
}

impl std::fmt::Display for AddressInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.addr)?;
        if self.ttl != DEFAULT_TTL {
            write!(f, ",{}", self.ttl)?;
        }
        if let Some(iface) = &self.interface {
            write!(f, "@{iface}")?;
        }
        Ok(())
    }
}

/// Parse one address specification.
pub fn parse_address(spec: &str, default_port: u16) -> Result<AddressInfo> {
    let trimmed = spec.trim();
    if trimmed.is_empty() {
        return Err(TransportError::invalid_address(spec, "empty"));
    }

    let (rest, interface) = match trimmed.rsplit_once('@') {
        Some((rest, iface)) if !iface.is_empty() => (rest, Some(iface.to_string())),
        Some(_) => return Err(TransportError::invalid_address(spec, "empty interface name")),
        None => (trimmed, None),
    };

    let (host_port, ttl) = match rest.rsplit_once(',') {
        Some((host_port, ttl)) => {
            let ttl = ttl
                .trim()
                .parse::<u32>()
                .map_err(|_| TransportError::invalid_address(spec, "invalid ttl"))?;
            (host_port, ttl)
        }
        None => (rest, DEFAULT_TTL),
    };

    let addr = resolve(spec, host_port, default_port)?;
    Ok(AddressInfo::new(addr, ttl, interface))
}

fn resolve(spec: &str, host_port: &str, default_port: u16) -> Result<SocketAddr> {
    // Bracketed IPv6, with or without port
    if let Some(stripped) = host_port.strip_prefix('[') {
        let (ip, port) = stripped
            .split_once(']')
            .ok_or_else(|| TransportError::invalid_address(spec, "unterminated '['"))?;
        let ip: IpAddr = ip
            .parse()
            .map_err(|_| TransportError::invalid_address(spec, "invalid IPv6 address"))?;
        let port = match port.strip_prefix(':') {
            Some(port) => parse_port(spec, port)?,
            None if port.is_empty() => default_port,
            None => return Err(TransportError::invalid_address(spec, "junk after ']'")),
        };
        return Ok(SocketAddr::new(ip, port));
    }

    // Bare IP address (IPv4, or IPv6 without port)
    if let Ok(ip) = host_port.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }

    let (host, port) = match host_port.rsplit_once(':') {
        Some((host, port)) => (host, parse_port(spec, port)?),
        None => (host_port, default_port),
    };

    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let mut candidates = (host, port)
        .to_socket_addrs()
        .map_err(|err| TransportError::invalid_address(spec, err.to_string()))?
        .collect::<Vec<_>>();
    // Prefer IPv4, which is what most PVA servers listen on
    candidates.sort_by_key(|addr| !addr.is_ipv4());
    candidates
        .into_iter()
        .next()
        .ok_or_else(|| TransportError::invalid_address(spec, "host has no address"))
}

fn parse_port(spec: &str, port: &str) -> Result<u16> {
    port.trim()
        .parse::<u16>()
        .map_err(|_| TransportError::invalid_address(spec, "invalid port"))
}

/// Parse a whitespace-separated address list.
///
/// Entries that cannot be parsed are logged and skipped.
pub fn parse_addresses(list: &str, default_port: u16) -> Vec<AddressInfo> {
    list.split_whitespace()
        .filter_map(|spec| match parse_address(spec, default_port) {
            Ok(info) => Some(info),
            Err(err) => {
                warn!(%err, "ignoring address list entry");
                None
            }
        })
        .collect()
}

/// A local network interface address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterface {
    pub name: String,
    pub index: u32,
    pub addr: IpAddr,
    /// Directed broadcast address (IPv4 interfaces that support broadcast).
    pub broadcast: Option<Ipv4Addr>,
    pub loopback: bool,
    pub multicast: bool,
}

/// Enumerate addresses of local network interfaces that are up.
#[cfg(unix)]
pub fn interfaces() -> Result<Vec<NetworkInterface>> {
    use std::ffi::CStr;
    use std::net::Ipv6Addr;

    let mut head: *mut libc::ifaddrs = std::ptr::null_mut();
    // SAFETY: `head` is a valid writable pointer; on success the list is
    // released below with `freeifaddrs`.
    if unsafe { libc::getifaddrs(&mut head) } != 0 {
        return Err(TransportError::Interfaces(std::io::Error::last_os_error()));
    }

    let mut out = Vec::new();
    let mut cursor = head;
    while !cursor.is_null() {
        // SAFETY: `cursor` is a node of the list returned by getifaddrs, valid
        // until freeifaddrs is called.
        let entry = unsafe { &*cursor };
        cursor = entry.ifa_next;

        let flags = entry.ifa_flags;
        if entry.ifa_addr.is_null() || flags & libc::IFF_UP as libc::c_uint == 0 {
            continue;
        }

        // SAFETY: ifa_addr was checked for null and points to a sockaddr.
        let family = i32::from(unsafe { (*entry.ifa_addr).sa_family });
        let (addr, netmask) = match family {
            libc::AF_INET => {
                // SAFETY: family AF_INET guarantees a sockaddr_in.
                let sin = unsafe { &*(entry.ifa_addr as *const libc::sockaddr_in) };
                let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
                let mask = if entry.ifa_netmask.is_null() {
                    None
                } else {
                    // SAFETY: netmask of an AF_INET entry is a sockaddr_in.
                    let nm = unsafe { &*(entry.ifa_netmask as *const libc::sockaddr_in) };
                    Some(u32::from_be(nm.sin_addr.s_addr))
                };
                (IpAddr::V4(ip), mask)
            }
            libc::AF_INET6 => {
                // SAFETY: family AF_INET6 guarantees a sockaddr_in6.
                let sin6 = unsafe { &*(entry.ifa_addr as *const libc::sockaddr_in6) };
                (IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr)), None)
            }
            _ => continue,
        };

        // SAFETY: ifa_name is a NUL-terminated string owned by the list.
        let name = unsafe { CStr::from_ptr(entry.ifa_name) }
            .to_string_lossy()
            .into_owned();
        // SAFETY: same NUL-terminated name as above.
        let index = unsafe { libc::if_nametoindex(entry.ifa_name) };

        let broadcast = match (addr, netmask) {
            (IpAddr::V4(ip), Some(mask)) if flags & libc::IFF_BROADCAST as libc::c_uint != 0 => {
                Some(Ipv4Addr::from(u32::from(ip) | !mask))
            }
            _ => None,
        };

        out.push(NetworkInterface {
            name,
            index,
            addr,
            broadcast,
            loopback: flags & libc::IFF_LOOPBACK as libc::c_uint != 0,
            multicast: flags & libc::IFF_MULTICAST as libc::c_uint != 0,
        });
    }

    // SAFETY: `head` came from a successful getifaddrs call and is freed once.
    unsafe { libc::freeifaddrs(head) };
    Ok(out)
}

#[cfg(not(unix))]
pub fn interfaces() -> Result<Vec<NetworkInterface>> {
    Ok(Vec::new())
}

/// Broadcast addresses of all local interfaces, combined with `port`.
///
/// Falls back to the limited broadcast address when no interface reports a
/// directed broadcast address.
pub fn broadcast_addresses(port: u16) -> Result<Vec<SocketAddr>> {
    let mut out: Vec<SocketAddr> = Vec::new();
    for iface in interfaces()? {
        if let Some(bcast) = iface.broadcast {
            let addr = SocketAddr::new(IpAddr::V4(bcast), port);
            if !out.contains(&addr) {
                out.push(addr);
            }
        }
    }
    if out.is_empty() {
        out.push(SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), port));
    }
    debug!(addresses = ?out, "local broadcast addresses");
    Ok(out)
}

/// Create an IPv4 UDP socket bound to `port` on all interfaces.
///
/// The address is marked re-usable so several PVA tools on one host can
/// share the well-known broadcast port.
#[cfg(unix)]
pub fn create_udp(broadcast: bool, port: u16) -> Result<UdpSocket> {
    use std::os::fd::{AsRawFd, FromRawFd};

    let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);

    // SAFETY: plain socket(2) call with constant arguments.
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(TransportError::Bind {
            addr: bind_addr,
            source: std::io::Error::last_os_error(),
        });
    }
    // SAFETY: `fd` is a freshly created socket nobody else owns; the UdpSocket
    // closes it on drop, including on the error paths below.
    let socket = unsafe { UdpSocket::from_raw_fd(fd) };

    let reuse = set_int_option(&socket, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1);
    // BSD stacks only share a wildcard UDP port with SO_REUSEPORT
    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    let reuse = reuse.and_then(|()| set_int_option(&socket, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1));
    reuse.map_err(|source| TransportError::Bind {
        addr: bind_addr,
        source,
    })?;

    // SAFETY: all-zero bytes are a valid sockaddr_in.
    let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = port.to_be();
    sin.sin_addr = libc::in_addr {
        s_addr: libc::INADDR_ANY,
    };
    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    {
        sin.sin_len = std::mem::size_of::<libc::sockaddr_in>() as u8;
    }
    // SAFETY: `sin` is an initialized sockaddr_in and the length matches it.
    let rc = unsafe {
        libc::bind(
            socket.as_raw_fd(),
            (&sin as *const libc::sockaddr_in).cast::<libc::sockaddr>(),
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(TransportError::Bind {
            addr: bind_addr,
            source: std::io::Error::last_os_error(),
        });
    }

    socket.set_broadcast(broadcast)?;
    debug!(local = ?socket.local_addr().ok(), broadcast, "created udp socket");
    Ok(socket)
}

#[cfg(unix)]
fn set_int_option(
    socket: &UdpSocket,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;

    // SAFETY: valid socket descriptor and readable c_int option value.
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            name,
            (&value as *const libc::c_int).cast::<libc::c_void>(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
pub fn create_udp(broadcast: bool, port: u16) -> Result<UdpSocket> {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    let socket = UdpSocket::bind(addr).map_err(|source| TransportError::Bind { addr, source })?;
    socket.set_broadcast(broadcast)?;
    Ok(socket)
}

/// First IPv4 address of the named local interface.
pub fn interface_ipv4(name: &str) -> Result<Option<Ipv4Addr>> {
    Ok(interfaces()?.into_iter().find_map(|iface| match iface.addr {
        IpAddr::V4(ip) if iface.name == name => Some(ip),
        _ => None,
    }))
}

/// Prepare `socket` for sending to `info`.
///
/// For an IPv4 multicast destination this sets the time-to-live and, when
/// the address names one, the outgoing interface. Without `@interface` the
/// socket keeps its current outgoing interface. Other destinations leave
/// the socket untouched.
pub fn apply_multicast_options(socket: &UdpSocket, info: &AddressInfo) -> Result<()> {
    if !info.addr.is_ipv4() || !info.is_multicast() {
        return Ok(());
    }
    socket.set_multicast_ttl_v4(info.ttl)?;
    if let Some(name) = info.interface() {
        let ip = interface_ipv4(name)?.ok_or_else(|| {
            TransportError::invalid_address(&info.to_string(), format!("no IPv4 address on {name}"))
        })?;
        socket.set_multicast_if_v4(ip)?;
    }
    Ok(())
}

/// Join the local multicast group on the loopback interface.
///
/// Returns the group address to which searches are forwarded, or `None`
/// when the host does not support multicast on loopback.
pub fn configure_multicast(socket: &UdpSocket, port: u16) -> Option<SocketAddr> {
    let joined = socket
        .join_multicast_v4(&LOCAL_MULTICAST_GROUP, &Ipv4Addr::LOCALHOST)
        .and_then(|()| socket.set_multicast_loop_v4(true))
        .and_then(|()| socket.set_multicast_if_v4(Ipv4Addr::LOCALHOST));
    match joined {
        Ok(()) => {
            let group = SocketAddr::new(IpAddr::V4(LOCAL_MULTICAST_GROUP), port);
            debug!(%group, "joined local multicast group");
            Some(group)
        }
        Err(err) => {
            warn!(%err, "cannot configure local multicast, forwarding disabled");
            None
        }
    }
}

trait SetMulticastIf {
    fn set_multicast_if_v4(&self, iface: Ipv4Addr) -> std::io::Result<()>;
}

impl SetMulticastIf for UdpSocket {
    #[cfg(unix)]
    fn set_multicast_if_v4(&self, iface: Ipv4Addr) -> std::io::Result<()> {
        use std::os::fd::AsRawFd;

        let addr = libc::in_addr {
            s_addr: u32::from(iface).to_be(),
        };
        // SAFETY: valid socket descriptor and readable in_addr option value.
        let rc = unsafe {
            libc::setsockopt(
                self.as_raw_fd(),
                libc::IPPROTO_IP,
                libc::IP_MULTICAST_IF,
                (&addr as *const libc::in_addr).cast::<libc::c_void>(),
                std::mem::size_of::<libc::in_addr>() as libc::socklen_t,
            )
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn set_multicast_if_v4(&self, _iface: Ipv4Addr) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_ipv4_with_default_port() {
        let info = parse_address("10.1.2.255", 5076).unwrap();
        assert_eq!(info.addr(), "10.1.2.255:5076".parse().unwrap());
        assert_eq!(info.ttl(), DEFAULT_TTL);
        assert!(info.interface().is_none());
    }

    #[test]
    fn parses_port_ttl_and_interface() {
        let info = parse_address("224.0.2.3:5086,16@eth0", 5076).unwrap();
        assert_eq!(info.addr(), "224.0.2.3:5086".parse().unwrap());
        assert_eq!(info.ttl(), 16);
        assert_eq!(info.interface(), Some("eth0"));
        assert!(info.is_multicast());
        assert_eq!(info.to_string(), "224.0.2.3:5086,16@eth0");
    }

    #[test]
    fn parses_ipv6_forms() {
        let bracketed = parse_address("[::1]:6000", 5076).unwrap();
        assert_eq!(bracketed.addr(), "[::1]:6000".parse().unwrap());

        let bare = parse_address("::1", 5076).unwrap();
        assert_eq!(bare.addr(), "[::1]:5076".parse().unwrap());
    }

    #[test]
    fn parses_localhost_name() {
        let info = parse_address("localhost:5075", 5076).unwrap();
        assert!(info.addr().ip().is_loopback());
        assert_eq!(info.addr().port(), 5075);
    }

    #[test]
    fn rejects_invalid_specs() {
        assert!(parse_address("", 5076).is_err());
        assert!(parse_address("10.0.0.1:99999", 5076).is_err());
        assert!(parse_address("10.0.0.1,abc", 5076).is_err());
        assert!(parse_address("[::1", 5076).is_err());
        assert!(parse_address("10.0.0.1@", 5076).is_err());
    }

    #[test]
    fn address_list_skips_bad_entries() {
        let list = parse_addresses("127.0.0.1  bad:port:x 127.0.0.2:5999", 5076);
        let addrs: Vec<_> = list.iter().map(AddressInfo::addr).collect();
        assert_eq!(
            addrs,
            vec![
                "127.0.0.1:5076".parse().unwrap(),
                "127.0.0.2:5999".parse().unwrap()
            ]
        );
    }

    #[test]
    fn broadcast_addresses_never_empty() {
        let addrs = broadcast_addresses(5076).unwrap();
        assert!(!addrs.is_empty());
        assert!(addrs.iter().all(|a| a.port() == 5076));
    }

    #[test]
    #[cfg(unix)]
    fn interfaces_include_loopback() {
        let ifaces = interfaces().unwrap();
        assert!(ifaces.iter().any(|i| i.loopback));
    }

    #[test]
    fn udp_sockets_share_a_port() {
        let first = create_udp(false, 0).unwrap();
        let port = first.local_addr().unwrap().port();
        let second = create_udp(true, port).unwrap();
        assert_eq!(second.local_addr().unwrap().port(), port);
    }

    #[test]
    fn multicast_ttl_reaches_socket() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let info = parse_address("224.0.2.3:5076,16", 5076).unwrap();
        apply_multicast_options(&socket, &info).unwrap();
        assert_eq!(socket.multicast_ttl_v4().unwrap(), 16);
    }

    #[test]
    fn unicast_destination_leaves_ttl_alone() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let before = socket.multicast_ttl_v4().unwrap();
        let info = parse_address("127.0.0.1:5076,9", 5076).unwrap();
        apply_multicast_options(&socket, &info).unwrap();
        assert_eq!(socket.multicast_ttl_v4().unwrap(), before);
    }

    #[test]
    fn unknown_multicast_interface_is_rejected() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let info = parse_address("224.0.2.3,4@pvwire-none0", 5076).unwrap();
        let err = apply_multicast_options(&socket, &info).unwrap_err();
        assert!(matches!(err, TransportError::InvalidAddress { .. }));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn multicast_interface_is_resolved_by_name() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let info = parse_address("224.0.2.3,4@lo", 5076).unwrap();
        apply_multicast_options(&socket, &info).unwrap();
        assert_eq!(socket.multicast_ttl_v4().unwrap(), 4);
    }
}
