use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use pvwire_frame::{Command, Header, RawMessage, WireReader};
use pvwire_peer::{connect_with, ClientRole, Connection, ConnectionConfig, ThreadPool};
use pvwire_transport::{PlainSocketFactory, PvaSettings};
use serde::Serialize;

use crate::cmd::EchoArgs;
use crate::exit::{peer_error, CliError, CliResult, DATA_INVALID, SUCCESS, TIMEOUT};
use crate::output::{print_json, OutputFormat};

#[derive(Serialize)]
struct EchoOutput {
    server: String,
    bytes: usize,
    round_trip_us: u128,
    peer_version: u8,
    peer_buffer_size: usize,
}

pub fn run(args: EchoArgs, format: OutputFormat) -> CliResult<i32> {
    let settings = PvaSettings::from_env();
    let config = ConnectionConfig {
        connect_timeout: args.timeout,
        ..ConnectionConfig::from_settings(&settings)
    };
    let deadline = Instant::now() + args.timeout;

    let (tx, rx) = mpsc::channel();
    let role = ClientRole::new(args.addr, Arc::new(PlainSocketFactory::with_timeout(args.timeout)))
        .with_handler(
            Command::Echo,
            move |_conn: &mut Connection,
                  _header: &Header,
                  payload: &mut WireReader<'_>|
                  -> pvwire_frame::Result<()> {
                let _ = tx.send((Instant::now(), payload.rest().to_vec()));
                Ok(())
            },
        )
        .map_err(|err| peer_error("echo handler", err))?;

    let pool = ThreadPool::new("echo");
    let conn = connect_with(role, args.addr, &pool, config)
        .map_err(|err| peer_error("connect failed", err))?;
    let result = round_trip(&conn, &args, deadline, &rx);
    conn.close(true);
    pool.shutdown(Duration::from_secs(1));
    let (round_trip, echoed) = result?;

    if echoed != args.data.as_bytes() {
        return Err(CliError::new(
            DATA_INVALID,
            format!("echo payload mismatch: sent {} bytes, got {}", args.data.len(), echoed.len()),
        ));
    }

    let output = EchoOutput {
        server: conn.name().to_string(),
        bytes: echoed.len(),
        round_trip_us: round_trip.as_micros(),
        peer_version: conn.peer_version(),
        peer_buffer_size: conn.peer_buffer_size(),
    };
    match format {
        OutputFormat::Json => print_json(&output),
        OutputFormat::Table | OutputFormat::Pretty => println!(
            "{} echoed {} bytes in {:?} (version {}, buffer {})",
            output.server, output.bytes, round_trip, output.peer_version, output.peer_buffer_size
        ),
    }
    Ok(SUCCESS)
}

fn round_trip(
    conn: &Connection,
    args: &EchoArgs,
    deadline: Instant,
    rx: &mpsc::Receiver<(Instant, Vec<u8>)>,
) -> CliResult<(Duration, Vec<u8>)> {
    conn.wait_ready(deadline.saturating_duration_since(Instant::now()))
        .map_err(|err| peer_error("validation failed", err))?;

    let sent = Instant::now();
    conn.submit(RawMessage::new(Command::Echo, args.data.clone().into_bytes()))
        .map_err(|err| peer_error("echo send failed", err))?;
    let (received, echoed) = rx
        .recv_timeout(deadline.saturating_duration_since(Instant::now()))
        .map_err(|_| CliError::new(TIMEOUT, format!("no echo from {} within {:?}", args.addr, args.timeout)))?;
    Ok((received.saturating_duration_since(sent), echoed))
}
