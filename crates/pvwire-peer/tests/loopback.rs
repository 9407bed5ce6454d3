use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pvwire_frame::{Command, Header, RawMessage, WireReader};
use pvwire_peer::{
    connect_with, ClientRole, Connection, ConnectionConfig, PvaListener, ThreadPool,
};
use pvwire_transport::PlainSocketFactory;

fn config(buffer: usize) -> ConnectionConfig {
    ConnectionConfig {
        receive_buffer_size: buffer,
        shutdown_timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(2),
        ..ConnectionConfig::default()
    }
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    done()
}

#[test]
fn validation_negotiates_smaller_buffer_and_echo_round_trips() {
    let pool = ThreadPool::new("loopback");
    let listener = PvaListener::bind("127.0.0.1:0".parse().expect("addr"), &pool, config(16384))
        .expect("listener should bind");
    let addr = listener.local_addr();

    let (echo_tx, echo_rx) = mpsc::channel();
    let role = ClientRole::new(addr, Arc::new(PlainSocketFactory::default()))
        .with_handler(
            Command::Echo,
            move |_conn: &mut Connection,
                  _header: &Header,
                  payload: &mut WireReader<'_>|
                  -> pvwire_frame::Result<()> {
                let _ = echo_tx.send(payload.rest().to_vec());
                Ok(())
            },
        )
        .expect("echo handler should register");
    let client = connect_with(role, addr, &pool, config(4096)).expect("client should start");
    let server = listener.accept().expect("listener should accept");

    client
        .wait_ready(Duration::from_secs(5))
        .expect("client should validate");
    server
        .wait_ready(Duration::from_secs(5))
        .expect("server should validate");

    assert_eq!(client.peer_buffer_size(), 4096);
    assert_eq!(server.peer_buffer_size(), 4096);
    assert_eq!(client.batch_limit(), 2048);
    assert!(!client.is_server());
    assert!(server.is_server());

    client
        .submit(RawMessage::new(Command::Echo, &b"hello"[..]))
        .expect("echo should queue");
    let echoed = echo_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("echo reply should arrive");
    assert_eq!(echoed, b"hello");

    client.close(true);
    server.close(true);
}

#[test]
fn server_close_ends_client() {
    let pool = ThreadPool::new("loopback-close");
    let listener = PvaListener::bind("127.0.0.1:0".parse().expect("addr"), &pool, config(16384))
        .expect("listener should bind");
    let addr = listener.local_addr();

    let (exit_tx, exit_rx) = mpsc::channel();
    let role = ClientRole::new(addr, Arc::new(PlainSocketFactory::default())).on_exit(
        move |_conn, error| {
            let _ = exit_tx.send(error.is_some());
        },
    );
    let client = connect_with(role, addr, &pool, config(16384)).expect("client should start");
    let server = listener.accept().expect("listener should accept");
    client
        .wait_ready(Duration::from_secs(5))
        .expect("client should validate");

    let started = Instant::now();
    server.close(true);
    assert!(started.elapsed() < Duration::from_secs(5));

    let had_error = exit_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("client receiver should exit");
    assert!(!had_error, "peer close is an orderly exit");
    assert!(wait_until(Duration::from_secs(2), || !client.is_running()));
    assert!(client.submit(RawMessage::new(Command::Echo, Vec::<u8>::new())).is_err());
    client.close(true);
}

#[test]
fn connect_failure_stops_connection() {
    let pool = ThreadPool::new("loopback-refused");
    let addr = {
        let listener =
            PvaListener::bind("127.0.0.1:0".parse().expect("addr"), &pool, config(16384))
                .expect("listener should bind");
        listener.local_addr()
    };

    let client = pvwire_peer::connect(addr, &pool, config(16384)).expect("client should start");
    let result = client.wait_ready(Duration::from_secs(5));
    assert!(result.is_err());
    assert!(wait_until(Duration::from_secs(2), || !client.is_running()));
    client.close(true);
}
