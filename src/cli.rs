//! Command-line surface for the `shmbrokerd` binary (§6).

use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MonitoringMode {
    On,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevelArg {
    Off,
    Fatal,
    Error,
    Warning,
    Info,
    Debug,
    Trace,
}

impl LogLevelArg {
    /// `Fatal` has no counterpart in `log::LevelFilter`; it maps to `Error`
    /// and callers attach a `fatal: true` marker per §7 themselves.
    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            LogLevelArg::Off => log::LevelFilter::Off,
            LogLevelArg::Fatal | LogLevelArg::Error => log::LevelFilter::Error,
            LogLevelArg::Warning => log::LevelFilter::Warn,
            LogLevelArg::Info => log::LevelFilter::Info,
            LogLevelArg::Debug => log::LevelFilter::Debug,
            LogLevelArg::Trace => log::LevelFilter::Trace,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CompatibilityLevel {
    Off,
    Major,
    Minor,
    Patch,
    CommitId,
    BuildDate,
}

/// Zero-copy shared-memory IPC broker daemon.
#[derive(Debug, Parser)]
#[command(name = "shmbrokerd", version, about, disable_version_flag = true)]
pub struct Cli {
    /// Print version information and exit.
    #[arg(short = 'v', long = "version")]
    pub version: bool,

    /// Logical namespace partition; two daemons on different domains never
    /// see each other's segments or sockets.
    #[arg(short = 'd', long = "domain-id", default_value_t = 0)]
    pub domain_id: u16,

    /// High 16 bits of every Unique Port ID this daemon allocates.
    #[arg(short = 'u', long = "unique-roudi-id")]
    pub unique_roudi_id: Option<u16>,

    #[arg(short = 'm', long = "monitoring-mode", value_enum, default_value_t = MonitoringMode::On)]
    pub monitoring_mode: MonitoringMode,

    #[arg(short = 'l', long = "log-level", value_enum, default_value_t = LogLevelArg::Info)]
    pub log_level: LogLevelArg,

    #[arg(short = 'x', long = "compatibility", value_enum, default_value_t = CompatibilityLevel::Off)]
    pub compatibility: CompatibilityLevel,

    /// Seconds to wait after requesting graceful client exit before SIGTERM.
    #[arg(short = 't', long = "termination-delay", default_value_t = 0)]
    pub termination_delay_seconds: u32,

    /// Seconds to wait after SIGTERM before escalating to SIGKILL.
    #[arg(short = 'k', long = "kill-delay", default_value_t = 0)]
    pub kill_delay_seconds: u32,

    /// Bespoke general/segment/mempool config file; falls back to a
    /// single-segment built-in default when absent.
    #[arg(short = 'c', long = "config-file")]
    pub config_file: Option<std::path::PathBuf>,
}

impl Cli {
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_match_spec() {
        let cli = Cli::parse_from(["shmbrokerd"]);
        assert_eq!(cli.domain_id, 0);
        assert_eq!(cli.monitoring_mode, MonitoringMode::On);
        assert_eq!(cli.log_level, LogLevelArg::Info);
        assert_eq!(cli.compatibility, CompatibilityLevel::Off);
    }

    #[test]
    fn short_flags_parse() {
        let cli = Cli::parse_from(["shmbrokerd", "-d", "7", "-m", "off", "-l", "debug"]);
        assert_eq!(cli.domain_id, 7);
        assert_eq!(cli.monitoring_mode, MonitoringMode::Off);
        assert_eq!(cli.log_level, LogLevelArg::Debug);
    }

    #[test]
    fn fatal_log_level_maps_to_error_filter() {
        assert_eq!(LogLevelArg::Fatal.to_level_filter(), log::LevelFilter::Error);
    }
}
