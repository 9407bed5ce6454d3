use std::collections::BTreeMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Instant;

use pvwire_discovery::{
    ChannelSearch, ClientDiscovery, DiscoveryConfig, DiscoveryEngine, DiscoveryEvent, Guid,
    SearchHit,
};
use pvwire_transport::create_udp;

use crate::cmd::ListArgs;
use crate::exit::{discovery_error, transport_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_servers, OutputFormat};

pub fn run(args: ListArgs, format: OutputFormat) -> CliResult<i32> {
    let settings = args.net.settings();
    let socket = Arc::new(create_udp(true, 0).map_err(|err| transport_error("udp socket", err))?);
    let search = ChannelSearch::from_settings(Arc::clone(&socket), &settings)
        .map_err(|err| discovery_error("search setup", err))?;
    let (unicast, broadcast) = search.destinations();
    if unicast.is_empty() && broadcast.is_empty() {
        return Err(CliError::new(
            USAGE,
            "no search destinations; set --addr-list or EPICS_PVA_ADDR_LIST",
        ));
    }

    let (tx, rx) = mpsc::channel();
    let engine = DiscoveryEngine::new(socket, DiscoveryConfig::default())
        .map_err(|err| discovery_error("discovery receiver", err))?;
    let (stopper, _receiver) = engine
        .spawn(ClientDiscovery::new(move |event| {
            let _ = tx.send(event);
        }))
        .map_err(|err| discovery_error("discovery receiver", err))?;

    search
        .list()
        .map_err(|err| discovery_error("list request", err))?;

    let deadline = Instant::now() + args.timeout;
    let mut servers: BTreeMap<Guid, SearchHit> = BTreeMap::new();
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            break;
        }
        match rx.recv_timeout(left) {
            Ok(DiscoveryEvent::Found(hit)) => {
                servers.entry(hit.guid).or_insert(hit);
            }
            Ok(DiscoveryEvent::Beacon { .. }) => {}
            Err(_) => break,
        }
    }
    stopper.stop();

    let servers: Vec<&SearchHit> = servers.values().collect();
    print_servers(&servers, format);
    Ok(SUCCESS)
}
