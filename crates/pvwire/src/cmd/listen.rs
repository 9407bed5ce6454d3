use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use pvwire_discovery::{ClientDiscovery, DiscoveryConfig, DiscoveryEngine};
use pvwire_transport::{configure_multicast, create_udp, PvaSettings};
use tracing::info;

use crate::cmd::{install_ctrlc_handler, ListenArgs};
use crate::exit::{discovery_error, transport_error, CliResult, SUCCESS};
use crate::output::{print_event, OutputFormat};

pub fn run(args: ListenArgs, format: OutputFormat) -> CliResult<i32> {
    let port = args
        .port
        .unwrap_or_else(|| PvaSettings::from_env().broadcast_port);
    let socket = Arc::new(create_udp(true, port).map_err(|err| transport_error("udp socket", err))?);
    let running = install_ctrlc_handler()?;

    let (tx, rx) = mpsc::channel();
    let mut client = ClientDiscovery::new(move |event| {
        let _ = tx.send(event);
    });
    // Unicast searches reaching this port are relayed to the local group.
    if let Some(group) = configure_multicast(&socket, port) {
        if let Ok(local) = socket.local_addr() {
            client = client.with_forwarding(Arc::clone(&socket), group, local.ip());
        }
    }
    let engine = DiscoveryEngine::new(socket, DiscoveryConfig::default())
        .map_err(|err| discovery_error("discovery receiver", err))?;
    let (stopper, _receiver) = engine
        .spawn(client)
        .map_err(|err| discovery_error("discovery receiver", err))?;
    info!(port, "listening for beacons and search responses");

    let mut printed = 0usize;
    while running.load(Ordering::SeqCst) {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(event) => {
                print_event(&event, format);
                printed = printed.saturating_add(1);
                if args.count.is_some_and(|count| printed >= count) {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    stopper.stop();
    Ok(SUCCESS)
}
