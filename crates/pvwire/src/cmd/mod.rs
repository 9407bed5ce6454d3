use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Subcommand};
use pvwire_transport::PvaSettings;

use crate::exit::{CliError, CliResult, INTERNAL};
use crate::output::OutputFormat;

pub mod echo;
pub mod envinfo;
pub mod list;
pub mod listen;
pub mod search;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Search for channels and print the servers hosting them.
    Search(SearchArgs),
    /// Ask every reachable server to identify itself.
    List(ListArgs),
    /// Answer searches for channel names and accept connections.
    Serve(ServeArgs),
    /// Print beacons and search responses arriving on a UDP port.
    Listen(ListenArgs),
    /// Connect to a server, validate, and round-trip an echo message.
    Echo(EchoArgs),
    /// Show version information.
    Version(VersionArgs),
    /// Print build information and the effective EPICS_PVA_* settings.
    Envinfo(EnvinfoArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Search(args) => search::run(args, format),
        Command::List(args) => list::run(args, format),
        Command::Serve(args) => serve::run(args, format),
        Command::Listen(args) => listen::run(args, format),
        Command::Echo(args) => echo::run(args, format),
        Command::Version(args) => version::run(args),
        Command::Envinfo(args) => envinfo::run(args, format),
    }
}

/// Overrides for the search destinations read from the environment.
#[derive(Args, Debug, Default)]
pub struct NetArgs {
    /// Search destinations, replacing EPICS_PVA_ADDR_LIST.
    #[arg(long, value_name = "ADDRS")]
    pub addr_list: Option<String>,
    /// Do not add local broadcast addresses to the destinations.
    #[arg(long)]
    pub no_auto_addr_list: bool,
    /// UDP port servers listen on, replacing EPICS_PVA_BROADCAST_PORT.
    #[arg(long, value_name = "PORT")]
    pub broadcast_port: Option<u16>,
}

impl NetArgs {
    pub fn settings(&self) -> PvaSettings {
        let mut settings = PvaSettings::from_env();
        if let Some(list) = &self.addr_list {
            settings.addr_list = list.clone();
        }
        if self.no_auto_addr_list {
            settings.auto_addr_list = false;
        }
        if let Some(port) = self.broadcast_port {
            settings.broadcast_port = port;
        }
        settings
    }
}

#[derive(Args, Debug)]
pub struct SearchArgs {
    /// Channel names to search for.
    #[arg(required = true)]
    pub names: Vec<String>,
    /// Give up on channels not found within this time (e.g. 3s, 500ms).
    #[arg(long, default_value = "3s", value_parser = parse_duration)]
    pub timeout: Duration,
    /// Also offer secure transport.
    #[arg(long)]
    pub tls: bool,
    #[command(flatten)]
    pub net: NetArgs,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// How long to collect answers.
    #[arg(long, default_value = "2s", value_parser = parse_duration)]
    pub timeout: Duration,
    #[command(flatten)]
    pub net: NetArgs,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Channel names to answer for; a trailing `*` matches any suffix.
    #[arg(long = "channel", short = 'c', value_name = "NAME", required = true)]
    pub channels: Vec<String>,
    /// TCP port to accept connections on (default: EPICS_PVA_SERVER_PORT).
    #[arg(long)]
    pub tcp_port: Option<u16>,
    /// UDP port to answer searches on (default: EPICS_PVA_BROADCAST_PORT).
    #[arg(long)]
    pub udp_port: Option<u16>,
    /// Interval between beacons.
    #[arg(long, default_value = "15s", value_parser = parse_duration)]
    pub beacon_period: Duration,
    /// Do not send beacons.
    #[arg(long)]
    pub no_beacons: bool,
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    /// UDP port to listen on (default: EPICS_PVA_BROADCAST_PORT).
    #[arg(long)]
    pub port: Option<u16>,
    /// Exit after printing N events.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct EchoArgs {
    /// Server address (host:port).
    pub addr: SocketAddr,
    /// Payload to echo.
    #[arg(long, default_value = "pvwire")]
    pub data: String,
    /// Time allowed for connecting, validating and the echo itself.
    #[arg(long, default_value = "5s", value_parser = parse_duration)]
    pub timeout: Duration,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

#[derive(Args, Debug, Default)]
pub struct EnvinfoArgs {}

/// Parse `250ms`, `3s`, `2m` or a bare number of seconds.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let (number, unit) = match value.find(|c: char| !c.is_ascii_digit()) {
        Some(split) => value.split_at(split),
        None => (value, "s"),
    };
    let amount: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration '{value}'"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(amount)),
        "s" => Ok(Duration::from_secs(amount)),
        "m" => Ok(Duration::from_secs(amount * 60)),
        _ => Err(format!("invalid duration unit in '{value}' (use ms, s or m)")),
    }
}

/// Flag cleared by Ctrl-C.
pub fn install_ctrlc_handler() -> CliResult<Arc<AtomicBool>> {
    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        flag.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))?;
    Ok(running)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_parse_with_units() {
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("3s"), Ok(Duration::from_secs(3)));
        assert_eq!(parse_duration("2m"), Ok(Duration::from_secs(120)));
        assert_eq!(parse_duration("7"), Ok(Duration::from_secs(7)));
    }

    #[test]
    fn durations_reject_garbage() {
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("5h").is_err());
        assert!(parse_duration("").is_err());
    }
}
