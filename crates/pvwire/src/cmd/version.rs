use pvwire_frame::{MIN_PROTOCOL_REVISION, PROTOCOL_REVISION};

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("pvwire {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: pvwire");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!("protocol_revision: {PROTOCOL_REVISION} (minimum {MIN_PROTOCOL_REVISION})");
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!(
        "target: {}",
        option_env!("PVWIRE_BUILD_TARGET").unwrap_or("unknown")
    );
    println!(
        "features: peer={}, discovery={}, cli=true",
        cfg!(feature = "peer"),
        cfg!(feature = "discovery"),
    );

    Ok(SUCCESS)
}
