//! Periodic channel search with exponential backoff.
//!
//! Every tick increments each channel's counter; a search goes out whenever
//! the counter is a power of two, so intervals double until the counter
//! wraps from 256 back to 129. `boost` resets all counters so channels are
//! searched again soon, e.g. after a new server announced itself.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::BytesMut;
use pvwire_frame::{hex_dump, ByteOrder, RequestEncoder, WireWriter, HEADER_SIZE, PROTOCOL_REVISION};
use pvwire_transport::{
    apply_multicast_options, broadcast_addresses, parse_addresses, AddressInfo, PvaSettings,
    DEFAULT_TTL, MAX_UDP_UNFRAGMENTED_SEND,
};
use rand::Rng;
use tracing::{debug, info, trace, warn};

use crate::error::{DiscoveryError, Result};
use crate::search::{flags, SearchRequest, SearchedName, FLAGS_OFFSET};

/// Base interval between search ticks.
pub const SEARCH_PERIOD: Duration = Duration::from_millis(225);
/// Random spread applied once to the period, so clients started together
/// do not search in lockstep.
pub const SEARCH_JITTER: Duration = Duration::from_millis(25);

const BOOST_SEARCH_COUNT: u32 = 1;
const MAX_SEARCH_COUNT: u32 = 256;
const MAX_SEARCH_RESET: u32 = 129;

/// Next value of a channel's search counter.
pub fn advance_counter(counter: u32) -> u32 {
    if counter >= MAX_SEARCH_COUNT {
        MAX_SEARCH_RESET
    } else {
        counter + 1
    }
}

/// How a search destination is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// Reaches only the last process bound on that host; the receiver
    /// forwards it locally.
    Unicast,
    /// Reaches every server on the subnet or group.
    Broadcast,
}

/// Multicast groups, the limited broadcast address and the directed
/// broadcast addresses of local interfaces are broadcast destinations;
/// anything else is assumed to be unicast.
pub fn classify(addr: &SocketAddr, local_broadcasts: &[IpAddr]) -> Destination {
    let ip = addr.ip();
    let broadcast = match ip {
        IpAddr::V4(v4) => v4.is_multicast() || v4.is_broadcast(),
        IpAddr::V6(v6) => v6.is_multicast(),
    };
    if broadcast || local_broadcasts.contains(&ip) {
        Destination::Broadcast
    } else {
        Destination::Unicast
    }
}

struct SearchedChannel {
    name: String,
    counter: u32,
}

/// Searches registered channels until they are unregistered.
pub struct ChannelSearch {
    socket: Arc<UdpSocket>,
    response_addr: SocketAddr,
    unicast: Vec<AddressInfo>,
    broadcast: Vec<AddressInfo>,
    tls: bool,
    sequence: AtomicU32,
    channels: Mutex<BTreeMap<u32, SearchedChannel>>,
    send_buffer: Mutex<BytesMut>,
    running: AtomicBool,
}

impl ChannelSearch {
    /// Search through `socket`, which also receives the responses.
    pub fn new(
        socket: Arc<UdpSocket>,
        destinations: &[SocketAddr],
        local_broadcasts: &[IpAddr],
    ) -> Result<Self> {
        let destinations: Vec<AddressInfo> = destinations
            .iter()
            .map(|addr| AddressInfo::new(*addr, DEFAULT_TTL, None))
            .collect();
        Self::with_addresses(socket, &destinations, local_broadcasts)
    }

    /// Like [`ChannelSearch::new`], keeping the time-to-live and interface
    /// of multicast destinations.
    pub fn with_addresses(
        socket: Arc<UdpSocket>,
        destinations: &[AddressInfo],
        local_broadcasts: &[IpAddr],
    ) -> Result<Self> {
        let response_addr = socket.local_addr()?;
        let mut unicast = Vec::new();
        let mut broadcast = Vec::new();
        for info in destinations {
            match classify(&info.addr(), local_broadcasts) {
                Destination::Unicast => {
                    info!(addr = %info, "sending searches (assume unicast)");
                    unicast.push(info.clone());
                }
                Destination::Broadcast => {
                    info!(addr = %info, "sending searches (broadcast/multicast)");
                    broadcast.push(info.clone());
                }
            }
        }
        Ok(Self {
            socket,
            response_addr,
            unicast,
            broadcast,
            tls: false,
            sequence: AtomicU32::new(0),
            channels: Mutex::new(BTreeMap::new()),
            send_buffer: Mutex::new(BytesMut::with_capacity(MAX_UDP_UNFRAGMENTED_SEND)),
            running: AtomicBool::new(true),
        })
    }

    /// Destinations from `EPICS_PVA_ADDR_LIST`, plus local broadcast
    /// addresses when the auto address list is enabled.
    pub fn from_settings(socket: Arc<UdpSocket>, settings: &PvaSettings) -> Result<Self> {
        let local = broadcast_addresses(settings.broadcast_port)?;
        let mut destinations = parse_addresses(&settings.addr_list, settings.broadcast_port);
        if settings.auto_addr_list {
            for addr in &local {
                if !destinations.iter().any(|info| info.addr() == *addr) {
                    destinations.push(AddressInfo::new(*addr, DEFAULT_TTL, None));
                }
            }
        }
        let local_ips: Vec<IpAddr> = local.iter().map(SocketAddr::ip).collect();
        Self::with_addresses(socket, &destinations, &local_ips)
    }

    /// Also offer secure transport in channel searches.
    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    /// Address servers reply to.
    pub fn response_addr(&self) -> SocketAddr {
        self.response_addr
    }

    pub fn destinations(&self) -> (&[AddressInfo], &[AddressInfo]) {
        (&self.unicast, &self.broadcast)
    }

    /// Start searching for a channel. With `now` a request goes out at once;
    /// otherwise the channel is picked up by the next tick.
    pub fn register(&self, cid: u32, name: impl Into<String>, now: bool) -> Result<()> {
        let name = name.into();
        debug!(cid, name = %name, "register search");
        self.channels().entry(cid).or_insert_with(|| SearchedChannel {
            name: name.clone(),
            counter: 0,
        });
        if now {
            self.search(cid, &name)?;
        }
        Ok(())
    }

    /// Stop searching for a channel, returning its name if it was searched.
    pub fn unregister(&self, cid: u32) -> Option<String> {
        let removed = self.channels().remove(&cid).map(|c| c.name);
        if let Some(name) = &removed {
            debug!(cid, name = %name, "unregister search");
        }
        removed
    }

    /// Channels still being searched.
    pub fn searched(&self) -> Vec<(u32, String)> {
        self.channels()
            .iter()
            .map(|(cid, c)| (*cid, c.name.clone()))
            .collect()
    }

    /// Search every channel again soon.
    pub fn boost(&self) {
        for (cid, channel) in self.channels().iter_mut() {
            trace!(cid, name = %channel.name, "restart search");
            channel.counter = BOOST_SEARCH_COUNT;
        }
    }

    /// Ask every server to identify itself.
    pub fn list(&self) -> Result<()> {
        debug!("list request");
        self.send(&SearchRequest::discover_all(self.response_addr))
    }

    /// One search tick. Returns the number of channels searched.
    pub fn run_searches(&self) -> usize {
        let due: Vec<(u32, String)> = self
            .channels()
            .iter_mut()
            .filter_map(|(cid, channel)| {
                channel.counter = advance_counter(channel.counter);
                channel
                    .counter
                    .is_power_of_two()
                    .then(|| (*cid, channel.name.clone()))
            })
            .collect();
        for (cid, name) in &due {
            if let Err(err) = self.search(*cid, name) {
                warn!(cid, name = %name, error = %err, "search failed");
            }
        }
        due.len()
    }

    /// Tick on a background thread until [`ChannelSearch::close`].
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let jitter = SEARCH_JITTER.as_millis() as i64;
        let offset = rand::thread_rng().gen_range(-jitter..=jitter);
        let period = Duration::from_millis((SEARCH_PERIOD.as_millis() as i64 + offset) as u64);
        debug!(
            first = ?(period * 2),
            longest = ?(period * 128),
            "search intervals"
        );
        let search = Arc::clone(self);
        thread::Builder::new()
            .name("channel-search".into())
            .spawn(move || {
                while search.running.load(Ordering::Acquire) {
                    thread::sleep(period);
                    if !search.running.load(Ordering::Acquire) {
                        break;
                    }
                    search.run_searches();
                }
                debug!("channel search stopped");
            })
            .map_err(DiscoveryError::Io)
    }

    /// Stop ticking and forget all channels.
    pub fn close(&self) {
        self.running.store(false, Ordering::Release);
        self.channels().clear();
    }

    fn search(&self, cid: u32, name: &str) -> Result<()> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        debug!(sequence, cid, name, "search request");
        let request = SearchRequest::for_channels(
            sequence,
            vec![SearchedName::new(cid, name)],
            self.response_addr,
            self.tls,
        );
        self.send(&request)
    }

    /// Send to unicast destinations with the unicast flag, then to
    /// broadcast destinations without it. Individual send failures are
    /// logged.
    fn send(&self, request: &SearchRequest) -> Result<()> {
        let mut buf = self
            .send_buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        buf.clear();
        let mut w = WireWriter::new(&mut buf, ByteOrder::native());
        request.encode_request(PROTOCOL_REVISION, &mut w)?;
        if buf.len() > MAX_UDP_UNFRAGMENTED_SEND {
            return Err(DiscoveryError::DatagramTooLarge {
                size: buf.len(),
                max: MAX_UDP_UNFRAGMENTED_SEND,
            });
        }

        for info in &self.unicast {
            self.send_to(&buf, info);
        }
        buf[HEADER_SIZE + FLAGS_OFFSET] &= !flags::UNICAST;
        for info in &self.broadcast {
            self.send_to(&buf, info);
        }
        Ok(())
    }

    fn send_to(&self, datagram: &[u8], info: &AddressInfo) {
        let addr = info.addr();
        if let Err(err) = apply_multicast_options(&self.socket, info) {
            warn!(addr = %info, error = %err, "cannot apply multicast options");
        }
        trace!(%addr, "sending search\n{}", hex_dump(datagram));
        if let Err(err) = self.socket.send_to(datagram, addr) {
            warn!(%addr, error = %err, "failed to send search request");
        }
    }

    fn channels(&self) -> MutexGuard<'_, BTreeMap<u32, SearchedChannel>> {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use pvwire_frame::{Header, WireReader};

    use super::*;

    fn receiver() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").expect("bind");
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("timeout");
        let addr = socket.local_addr().expect("addr");
        (socket, addr)
    }

    fn sender() -> Arc<UdpSocket> {
        Arc::new(UdpSocket::bind("127.0.0.1:0").expect("bind"))
    }

    fn receive_request(socket: &UdpSocket) -> SearchRequest {
        let mut buf = [0u8; 1500];
        let (len, from) = socket.recv_from(&mut buf).expect("search datagram");
        let header = Header::decode(&buf[..len]).expect("header");
        let mut r = WireReader::new(&buf[HEADER_SIZE..len], header.order());
        SearchRequest::decode(from, header.payload_size as usize, false, &mut r).expect("decode")
    }

    #[test]
    fn counter_backs_off_and_wraps() {
        let mut counter = 0;
        let mut searches = Vec::new();
        for tick in 1..=300 {
            counter = advance_counter(counter);
            if counter.is_power_of_two() {
                searches.push(tick);
            }
        }
        assert_eq!(&searches[..9], &[1, 2, 4, 8, 16, 32, 64, 128, 256]);
        assert_eq!(advance_counter(256), 129);
        assert_eq!(advance_counter(255), 256);
    }

    #[test]
    fn classifies_destinations() {
        let local = [IpAddr::V4(Ipv4Addr::new(192, 168, 1, 255))];
        let dest = |s: &str| s.parse::<SocketAddr>().expect("addr");
        assert_eq!(classify(&dest("224.0.0.128:5076"), &local), Destination::Broadcast);
        assert_eq!(classify(&dest("255.255.255.255:5076"), &local), Destination::Broadcast);
        assert_eq!(classify(&dest("192.168.1.255:5076"), &local), Destination::Broadcast);
        assert_eq!(classify(&dest("192.168.1.20:5076"), &local), Destination::Unicast);
    }

    #[test]
    fn unicast_destination_keeps_flag() {
        let (socket, addr) = receiver();
        let search = ChannelSearch::new(sender(), &[addr], &[]).expect("search");
        search.register(7, "test:pv", true).expect("register");

        let request = receive_request(&socket);
        assert!(request.unicast);
        assert_eq!(request.sequence, 1);
        assert_eq!(request.channels, Some(vec![SearchedName::new(7, "test:pv")]));
        assert_eq!(request.reply_addr, search.response_addr());
    }

    #[test]
    fn broadcast_destination_clears_flag() {
        let (socket, addr) = receiver();
        let search =
            ChannelSearch::new(sender(), &[addr], &[addr.ip()]).expect("search");
        search.list().expect("list");

        let request = receive_request(&socket);
        assert!(!request.unicast);
        assert!(request.is_discover_all());
        assert!(request.reply_required);
    }

    #[test]
    fn register_unregister_and_boost() {
        let search = ChannelSearch::new(sender(), &[], &[]).expect("search");
        search.register(1, "a", false).expect("register");
        search.register(2, "b", false).expect("register");
        search.register(1, "ignored", false).expect("register");
        assert_eq!(search.searched(), vec![(1, "a".to_string()), (2, "b".to_string())]);

        // Counters 1 and 2 search, 3 does not.
        assert_eq!(search.run_searches(), 2);
        assert_eq!(search.run_searches(), 2);
        assert_eq!(search.run_searches(), 0);

        search.boost();
        assert_eq!(search.run_searches(), 2);

        assert_eq!(search.unregister(1), Some("a".to_string()));
        assert_eq!(search.unregister(1), None);
        search.close();
        assert!(search.searched().is_empty());
    }

    #[test]
    fn multicast_destination_sets_ttl() {
        let socket = sender();
        let group = pvwire_transport::parse_address("224.0.2.3:5076,7", 5076).expect("address");
        let search =
            ChannelSearch::with_addresses(Arc::clone(&socket), &[group], &[]).expect("search");
        assert_eq!(search.destinations().1.len(), 1);

        // Sending may fail without a multicast route; the ttl is set first.
        let _ = search.list();
        assert_eq!(socket.multicast_ttl_v4().expect("ttl"), 7);
    }
}
