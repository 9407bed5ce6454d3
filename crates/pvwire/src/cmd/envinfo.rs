use std::collections::BTreeMap;

use pvwire_frame::PROTOCOL_REVISION;
use pvwire_transport::PvaSettings;
use serde::Serialize;

use crate::cmd::EnvinfoArgs;
use crate::exit::{CliResult, SUCCESS};
use crate::output::{print_json, OutputFormat};

/// Variables read by [`PvaSettings::from_env`].
const SETTINGS_VARS: [&str; 7] = [
    "EPICS_PVA_ADDR_LIST",
    "EPICS_PVA_AUTO_ADDR_LIST",
    "EPICS_PVA_BROADCAST_PORT",
    "EPICS_PVA_SERVER_PORT",
    "EPICS_PVA_CONN_TMO",
    "EPICS_PVA_TCP_BUFFER_SIZE",
    "EPICS_PVA_SEND_QUEUE_SIZE",
];

#[derive(Serialize)]
struct PlatformInfo {
    os: String,
    arch: String,
}

#[derive(Serialize)]
struct EnvInfoOutput {
    version: String,
    protocol_revision: u8,
    target: String,
    platform: PlatformInfo,
    features: Vec<String>,
    settings: PvaSettings,
    environment: BTreeMap<String, Option<String>>,
}

pub fn run(_args: EnvinfoArgs, format: OutputFormat) -> CliResult<i32> {
    let mut env = BTreeMap::new();
    for key in SETTINGS_VARS.iter().chain(&["PVWIRE_LOG_LEVEL"]) {
        env.insert(key.to_string(), std::env::var(key).ok());
    }

    let output = EnvInfoOutput {
        version: env!("CARGO_PKG_VERSION").to_string(),
        protocol_revision: PROTOCOL_REVISION,
        target: target_triple(),
        platform: PlatformInfo {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        },
        features: active_features(),
        settings: PvaSettings::from_env(),
        environment: env,
    };

    print_envinfo(&output, format);
    Ok(SUCCESS)
}

fn target_triple() -> String {
    option_env!("PVWIRE_BUILD_TARGET")
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}-{}", std::env::consts::ARCH, std::env::consts::OS))
}

fn print_envinfo(output: &EnvInfoOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(output),
        OutputFormat::Table | OutputFormat::Pretty => {
            let s = &output.settings;
            println!("pvwire environment\n");
            println!("  Version:    {} (protocol {})", output.version, output.protocol_revision);
            println!("  Target:     {}", output.target);
            println!(
                "  Platform:   {} ({})",
                output.platform.os, output.platform.arch
            );
            println!("  Features:   {}", output.features.join(", "));
            println!("\n  Effective settings:");
            let addr_list = if s.addr_list.is_empty() {
                "(empty)"
            } else {
                s.addr_list.as_str()
            };
            println!("    {:<18} {}", "addr list", addr_list);
            println!("    {:<18} {}", "auto addr list", s.auto_addr_list);
            println!("    {:<18} {}", "broadcast port", s.broadcast_port);
            println!("    {:<18} {}", "server port", s.server_port);
            println!("    {:<18} {:?}", "connection timeout", s.conn_timeout);
            println!("    {:<18} {}", "tcp buffer size", s.tcp_buffer_size);
            println!("    {:<18} {}", "send queue size", s.send_queue_size);
            println!("\n  Environment:");
            for (k, v) in &output.environment {
                println!("    {:<26} {}", k, v.as_deref().unwrap_or("(not set)"));
            }
        }
    }
}

fn active_features() -> Vec<String> {
    let mut features = Vec::new();
    if cfg!(feature = "peer") {
        features.push("peer".to_string());
    }
    if cfg!(feature = "discovery") {
        features.push("discovery".to_string());
    }
    if cfg!(feature = "cli") {
        features.push("cli".to_string());
    }
    features
}
