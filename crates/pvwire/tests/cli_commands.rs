#![cfg(all(unix, feature = "cli"))]

use std::io::{BufRead, BufReader};
use std::net::UdpSocket;
use std::process::{Child, Command, Stdio};

fn pvwire() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_pvwire"));
    cmd.env_remove("EPICS_PVA_ADDR_LIST")
        .env_remove("EPICS_PVA_AUTO_ADDR_LIST")
        .env_remove("EPICS_PVA_BROADCAST_PORT")
        .env_remove("EPICS_PVA_SERVER_PORT")
        .arg("--log-level")
        .arg("error");
    cmd
}

fn free_udp_port() -> u16 {
    UdpSocket::bind("127.0.0.1:0")
        .and_then(|socket| socket.local_addr())
        .expect("ephemeral udp port")
        .port()
}

struct Server {
    child: Child,
    tcp_port: u16,
    udp_port: u16,
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn start_server(channel: &str) -> Server {
    let udp_port = free_udp_port();
    let mut child = pvwire()
        .args(["--format", "json", "serve", "--no-beacons", "--tcp-port", "0"])
        .arg("--udp-port")
        .arg(udp_port.to_string())
        .arg("--channel")
        .arg(channel)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("serve should start");

    let stdout = child.stdout.take().expect("serve stdout");
    let mut line = String::new();
    BufReader::new(stdout)
        .read_line(&mut line)
        .expect("serve should announce itself");
    let announced: serde_json::Value =
        serde_json::from_str(&line).expect("announcement should be json");
    let tcp = announced["tcp"].as_str().expect("tcp address");
    let tcp_port = tcp
        .rsplit(':')
        .next()
        .and_then(|port| port.parse().ok())
        .expect("tcp port");
    Server {
        child,
        tcp_port,
        udp_port,
    }
}

#[test]
fn version_prints_package_version() {
    let output = pvwire().arg("version").output().expect("version should run");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.trim(), format!("pvwire {}", env!("CARGO_PKG_VERSION")));
}

#[test]
fn envinfo_reports_version_and_settings() {
    let output = pvwire()
        .env("EPICS_PVA_SERVER_PORT", "6075")
        .args(["--format", "json", "envinfo"])
        .output()
        .expect("envinfo should run");

    assert!(output.status.success());
    let payload: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("envinfo should emit json");
    assert_eq!(
        payload.get("version").and_then(|v| v.as_str()),
        Some(env!("CARGO_PKG_VERSION"))
    );
    assert_eq!(payload["settings"]["server_port"], 6075);
    assert_eq!(payload["environment"]["EPICS_PVA_SERVER_PORT"], "6075");
}

#[test]
fn invalid_arguments_exit_with_usage_error() {
    let output = pvwire()
        .args(["search", "x", "--timeout", "later"])
        .output()
        .expect("search should run");
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn search_without_destinations_is_a_usage_error() {
    let output = pvwire()
        .args(["search", "x", "--no-auto-addr-list"])
        .output()
        .expect("search should run");
    assert_eq!(output.status.code(), Some(64));
}

#[test]
fn search_finds_served_channel() {
    let server = start_server("demo:*");
    let output = pvwire()
        .args(["--format", "json", "search", "demo:temp", "--no-auto-addr-list"])
        .arg("--addr-list")
        .arg(format!("127.0.0.1:{}", server.udp_port))
        .output()
        .expect("search should run");

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let rows: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("search should emit json");
    assert_eq!(rows[0]["name"], "demo:temp");
    assert_eq!(rows[0]["found"], true);
    assert_eq!(
        rows[0]["server"]["server"],
        format!("127.0.0.1:{}", server.tcp_port)
    );
}

#[test]
fn search_for_unknown_channel_exits_not_found() {
    let server = start_server("demo:*");
    let output = pvwire()
        .args(["--format", "json", "search", "elsewhere", "--no-auto-addr-list"])
        .args(["--timeout", "600ms"])
        .arg("--addr-list")
        .arg(format!("127.0.0.1:{}", server.udp_port))
        .output()
        .expect("search should run");

    assert_eq!(output.status.code(), Some(4));
    let rows: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("search should emit json");
    assert_eq!(rows[0]["found"], false);
}

#[test]
fn echo_round_trips_through_served_connection() {
    let server = start_server("demo:*");
    let output = pvwire()
        .args(["--format", "json", "echo"])
        .arg(format!("127.0.0.1:{}", server.tcp_port))
        .args(["--data", "ping"])
        .output()
        .expect("echo should run");

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let payload: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("echo should emit json");
    assert_eq!(payload["bytes"], 4);
    assert_eq!(payload["peer_version"], 2);
}
