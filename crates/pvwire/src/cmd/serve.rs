use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use pvwire_discovery::{Beacon, DiscoveryConfig, DiscoveryEngine, Guid, SearchResponder};
use pvwire_frame::{ByteOrder, RequestEncoder, WireWriter, PROTOCOL_REVISION};
use pvwire_peer::{Connection, ConnectionConfig, PvaListener, ThreadPool};
use pvwire_transport::{
    apply_multicast_options, broadcast_addresses, configure_multicast, create_udp,
    parse_addresses, AddressInfo, PvaSettings, DEFAULT_TTL,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cmd::{install_ctrlc_handler, ServeArgs};
use crate::exit::{discovery_error, io_error, peer_error, transport_error, CliResult, SUCCESS};
use crate::output::{print_json, OutputFormat};

const POLL: Duration = Duration::from_millis(100);

#[derive(Serialize)]
struct Serving<'a> {
    guid: String,
    tcp: SocketAddr,
    udp: SocketAddr,
    channels: &'a [String],
}

pub fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let settings = PvaSettings::from_env();
    let tcp_port = args.tcp_port.unwrap_or(settings.server_port);
    let udp_port = args.udp_port.unwrap_or(settings.broadcast_port);
    let running = install_ctrlc_handler()?;

    let pool = ThreadPool::new("serve");
    let listener = PvaListener::bind(
        SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), tcp_port),
        &pool,
        ConnectionConfig::from_settings(&settings),
    )
    .map_err(|err| peer_error("bind failed", err))?;
    let tcp = listener.local_addr();

    let socket = Arc::new(create_udp(true, udp_port).map_err(|err| transport_error("udp socket", err))?);
    let udp = socket
        .local_addr()
        .map_err(|err| io_error("udp socket", err))?;
    configure_multicast(&socket, udp.port());

    let guid = Guid::random();
    // Clients substitute the address the reply came from.
    let advertised = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), tcp.port());
    let patterns = args.channels.clone();
    let responder = SearchResponder::new(guid, advertised, Arc::clone(&socket), move |name: &str| {
        hosts(&patterns, name)
    });
    let engine = DiscoveryEngine::new(Arc::clone(&socket), DiscoveryConfig::default())
        .map_err(|err| discovery_error("discovery receiver", err))?;
    let (stopper, _receiver) = engine
        .spawn(responder)
        .map_err(|err| discovery_error("discovery receiver", err))?;

    let connections: Arc<Mutex<Vec<Connection>>> = Arc::new(Mutex::new(Vec::new()));
    let accepted = Arc::clone(&connections);
    thread::Builder::new()
        .name("accept".into())
        .spawn(move || accept_loop(&listener, &accepted))
        .map_err(|err| io_error("accept thread", err))?;

    let serving = Serving {
        guid: guid.to_string(),
        tcp,
        udp,
        channels: &args.channels,
    };
    match format {
        OutputFormat::Json => print_json(&serving),
        OutputFormat::Table | OutputFormat::Pretty => println!(
            "serving {} on tcp {} udp {} guid {}",
            serving.channels.join(", "),
            serving.tcp,
            serving.udp,
            serving.guid
        ),
    }

    let beacons = if args.no_beacons {
        Vec::new()
    } else {
        beacon_destinations(&settings, udp.port())
    };
    let mut sequence: u8 = 0;
    let mut next_beacon = Instant::now();
    while running.load(Ordering::SeqCst) {
        if !beacons.is_empty() && Instant::now() >= next_beacon {
            let beacon = Beacon::new(guid, sequence, 0, advertised);
            send_beacon(&socket, &beacons, &beacon);
            sequence = sequence.wrapping_add(1);
            next_beacon += args.beacon_period;
        }
        thread::sleep(POLL);
    }

    info!("shutting down");
    stopper.stop();
    let open: Vec<Connection> = lock(&connections).drain(..).collect();
    for conn in open {
        conn.close(false);
    }
    pool.shutdown(Duration::from_secs(2));
    Ok(SUCCESS)
}

/// Whether `name` is served: exact match, or prefix match for patterns
/// ending in `*`.
fn hosts(patterns: &[String], name: &str) -> bool {
    patterns.iter().any(|pattern| match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => pattern == name,
    })
}

fn accept_loop(listener: &PvaListener, connections: &Mutex<Vec<Connection>>) {
    loop {
        match listener.accept() {
            Ok(conn) => {
                info!(peer = %conn.name(), addr = ?conn.peer_addr(), "client connected");
                let mut open = lock(connections);
                open.retain(Connection::is_running);
                open.push(conn);
            }
            Err(err) => {
                warn!(error = %err, "accept failed");
                thread::sleep(POLL);
            }
        }
    }
}

fn beacon_destinations(settings: &PvaSettings, port: u16) -> Vec<AddressInfo> {
    let mut destinations = parse_addresses(&settings.addr_list, port);
    if settings.auto_addr_list {
        match broadcast_addresses(port) {
            Ok(local) => {
                for addr in local {
                    if !destinations.iter().any(|info| info.addr() == addr) {
                        destinations.push(AddressInfo::new(addr, DEFAULT_TTL, None));
                    }
                }
            }
            Err(err) => warn!(error = %err, "cannot list broadcast addresses"),
        }
    }
    debug!(?destinations, "beacon destinations");
    destinations
}

fn send_beacon(socket: &UdpSocket, destinations: &[AddressInfo], beacon: &Beacon) {
    let mut buf = BytesMut::new();
    let mut w = WireWriter::new(&mut buf, ByteOrder::native()).with_server_origin(true);
    if let Err(err) = beacon.encode_request(PROTOCOL_REVISION, &mut w) {
        warn!(error = %err, "cannot encode beacon");
        return;
    }
    for info in destinations {
        if let Err(err) = apply_multicast_options(socket, info) {
            warn!(addr = %info, error = %err, "cannot apply multicast options");
        }
        if let Err(err) = socket.send_to(&buf, info.addr()) {
            debug!(addr = %info, error = %err, "beacon not sent");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
