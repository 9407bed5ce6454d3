use std::collections::BTreeMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Instant;

use pvwire_discovery::{
    ChannelSearch, ClientDiscovery, DiscoveryConfig, DiscoveryEngine, DiscoveryEvent, SearchHit,
};
use pvwire_transport::create_udp;
use tracing::debug;

use crate::cmd::SearchArgs;
use crate::exit::{discovery_error, transport_error, CliError, CliResult, NOT_FOUND, SUCCESS, USAGE};
use crate::output::{print_channels, ChannelRow, OutputFormat};

pub fn run(args: SearchArgs, format: OutputFormat) -> CliResult<i32> {
    let settings = args.net.settings();
    let socket = Arc::new(create_udp(true, 0).map_err(|err| transport_error("udp socket", err))?);

    let search = ChannelSearch::from_settings(Arc::clone(&socket), &settings)
        .map_err(|err| discovery_error("search setup", err))?
        .with_tls(args.tls);
    let (unicast, broadcast) = search.destinations();
    if unicast.is_empty() && broadcast.is_empty() {
        return Err(CliError::new(
            USAGE,
            "no search destinations; set --addr-list or EPICS_PVA_ADDR_LIST",
        ));
    }
    let search = Arc::new(search);

    let (tx, rx) = mpsc::channel();
    let engine = DiscoveryEngine::new(socket, DiscoveryConfig::default())
        .map_err(|err| discovery_error("discovery receiver", err))?;
    let (stopper, _receiver) = engine
        .spawn(ClientDiscovery::new(move |event| {
            let _ = tx.send(event);
        }))
        .map_err(|err| discovery_error("discovery receiver", err))?;

    for (cid, name) in args.names.iter().enumerate() {
        search
            .register(cid as u32, name.as_str(), true)
            .map_err(|err| discovery_error("search failed", err))?;
    }
    let ticker = search
        .start()
        .map_err(|err| discovery_error("search scheduler", err))?;

    let deadline = Instant::now() + args.timeout;
    let mut found: BTreeMap<u32, SearchHit> = BTreeMap::new();
    while found.len() < args.names.len() {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            break;
        }
        let Ok(event) = rx.recv_timeout(left) else {
            break;
        };
        if let DiscoveryEvent::Found(hit) = event {
            // First answer wins.
            if let Some(cid) = hit.cid {
                if let Some(name) = search.unregister(cid) {
                    debug!(cid, name = %name, server = %hit.server, "channel found");
                    found.insert(cid, hit);
                }
            }
        }
    }
    search.close();
    stopper.stop();
    let _ = ticker.join();

    let rows: Vec<ChannelRow<'_>> = args
        .names
        .iter()
        .enumerate()
        .map(|(cid, name)| {
            let server = found.get(&(cid as u32));
            ChannelRow {
                name: name.as_str(),
                found: server.is_some(),
                server,
            }
        })
        .collect();
    print_channels(&rows, format);

    if found.len() == args.names.len() {
        Ok(SUCCESS)
    } else {
        Ok(NOT_FOUND)
    }
}
