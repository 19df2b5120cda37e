//! Entry point: parses the CLI, loads configuration, boots the daemon and
//! runs it to completion (§6).
//!
//! Exit codes: 0 normal shutdown, 1 configuration error, 2 runtime/startup
//! error.

use shmbroker::cli::Cli;
use shmbroker::config::Config;
use shmbroker::daemon::Daemon;

fn main() {
    let cli = Cli::parse_args();

    if cli.version {
        println!("shmbrokerd {}", env!("CARGO_PKG_VERSION"));
        std::process::exit(0);
    }

    env_logger::Builder::new()
        .filter_level(cli.log_level.to_level_filter())
        .init();

    let config = match &cli.config_file {
        Some(path) => match Config::load(path, cli.domain_id) {
            Ok(config) => config,
            Err(e) => {
                log::error!("failed to load config from {}: {e}", path.display());
                std::process::exit(1);
            }
        },
        None => Config::default_single_segment(cli.domain_id, "shmbroker"),
    };

    let daemon = match Daemon::bootstrap(&cli, &config, true) {
        Ok(daemon) => daemon,
        Err(e) => {
            log::error!("failed to start: {e}");
            std::process::exit(2);
        }
    };

    log::info!("shmbrokerd listening on domain {}", cli.domain_id);

    if let Err(e) = daemon.run() {
        log::error!("daemon exited with an error: {e}");
        std::process::exit(2);
    }
}
