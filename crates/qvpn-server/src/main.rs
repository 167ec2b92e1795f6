//! qvpn-server binary entry point.

use clap::Parser;
use tracing::info;

use qvpn_core::logging::{init_logging, verbosity_for_level};
use qvpn_server::cli::Cli;
use qvpn_server::config::ServerConfig;

fn main() {
    let cli = Cli::parse();

    let config = match ServerConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("qvpn-server: {e}");
            std::process::exit(1);
        }
    };

    let verbosity = verbosity_for_level(&config.log_level).saturating_add(cli.verbose);
    if let Err(e) = init_logging(verbosity, cli.log_format.into()) {
        eprintln!("qvpn-server: failed to initialize logging: {e}");
        std::process::exit(1);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "qvpn-server starting"
    );

    run(config);
}

#[cfg(target_os = "linux")]
fn run(config: ServerConfig) {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("qvpn-server: failed to start runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(qvpn_server::server::run(config)) {
        eprintln!("qvpn-server: {e}");
        std::process::exit(1);
    }
}

#[cfg(not(target_os = "linux"))]
fn run(_config: ServerConfig) {
    eprintln!("qvpn-server: no TUN driver for this platform");
    std::process::exit(1);
}
