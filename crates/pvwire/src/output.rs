use std::io::IsTerminal;
use std::net::SocketAddr;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use pvwire_discovery::{Beacon, DiscoveryEvent, SearchHit};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// Result of searching one channel.
#[derive(Debug, Serialize)]
pub struct ChannelRow<'a> {
    pub name: &'a str,
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<&'a SearchHit>,
}

#[derive(Serialize)]
struct BeaconOutput {
    event: &'static str,
    from: SocketAddr,
    guid: String,
    server: SocketAddr,
    sequence: u8,
    change_count: u16,
}

#[derive(Serialize)]
struct HitOutput<'a> {
    event: &'static str,
    #[serde(flatten)]
    hit: &'a SearchHit,
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

fn table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

pub fn print_channels(rows: &[ChannelRow<'_>], format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(rows),
        OutputFormat::Table => {
            let mut out = table(vec!["CHANNEL", "SERVER", "GUID", "VERSION"]);
            for row in rows {
                match row.server {
                    Some(hit) => out.add_row(vec![
                        row.name.to_string(),
                        hit.server.to_string(),
                        hit.guid.to_string(),
                        hit.version.to_string(),
                    ]),
                    None => out.add_row(vec![row.name.to_string(), "(not found)".to_string()]),
                };
            }
            println!("{out}");
        }
        OutputFormat::Pretty => {
            for row in rows {
                match row.server {
                    Some(hit) => println!("{} {} guid={}", row.name, hit.server, hit.guid),
                    None => println!("{} not found", row.name),
                }
            }
        }
    }
}

pub fn print_servers(servers: &[&SearchHit], format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(servers),
        OutputFormat::Table => {
            let mut out = table(vec!["GUID", "SERVER", "VERSION"]);
            for hit in servers {
                out.add_row(vec![
                    hit.guid.to_string(),
                    hit.server.to_string(),
                    hit.version.to_string(),
                ]);
            }
            println!("{out}");
        }
        OutputFormat::Pretty => {
            for hit in servers {
                println!("{} {} version={}", hit.guid, hit.server, hit.version);
            }
        }
    }
}

/// Print one discovery event as it arrives. Table output degrades to one
/// line per event, since rows are not known in advance.
pub fn print_event(event: &DiscoveryEvent, format: OutputFormat) {
    match (event, format) {
        (DiscoveryEvent::Beacon { from, beacon }, OutputFormat::Json) => {
            print_json(&beacon_output(*from, beacon))
        }
        (DiscoveryEvent::Found(hit), OutputFormat::Json) => print_json(&HitOutput {
            event: "search_response",
            hit,
        }),
        (DiscoveryEvent::Beacon { from, beacon }, _) => println!(
            "beacon   {} from={} server={} seq={} changes={}",
            beacon.guid, from, beacon.server, beacon.sequence, beacon.change_count
        ),
        (DiscoveryEvent::Found(hit), _) => match hit.cid {
            Some(cid) => println!("response {} server={} cid={cid}", hit.guid, hit.server),
            None => println!("response {} server={} (no channel)", hit.guid, hit.server),
        },
    }
}

fn beacon_output(from: SocketAddr, beacon: &Beacon) -> BeaconOutput {
    BeaconOutput {
        event: "beacon",
        from,
        guid: beacon.guid.to_string(),
        server: beacon.server,
        sequence: beacon.sequence,
        change_count: beacon.change_count,
    }
}

#[cfg(test)]
mod tests {
    use pvwire_discovery::Guid;

    use super::*;

    #[test]
    fn missing_channel_has_no_server_field() {
        let rows = [ChannelRow {
            name: "ioc:missing",
            found: false,
            server: None,
        }];
        let json = serde_json::to_string(&rows[..]).expect("rows should serialize");
        assert_eq!(json, r#"[{"name":"ioc:missing","found":false}]"#);
    }

    #[test]
    fn found_channel_embeds_hit() {
        let hit = SearchHit {
            cid: Some(0),
            server: "10.0.0.2:5075".parse().expect("addr"),
            guid: Guid::new([0; 12]),
            version: 2,
            sequence: 1,
        };
        let rows = [ChannelRow {
            name: "ioc:temp",
            found: true,
            server: Some(&hit),
        }];
        let value: serde_json::Value =
            serde_json::to_value(&rows[..]).expect("rows should serialize");
        assert_eq!(value[0]["server"]["server"], "10.0.0.2:5075");
        assert_eq!(value[0]["server"]["guid"], "0x000000000000000000000000");
    }
}
