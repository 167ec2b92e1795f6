//! Command-line interface for the concentrator binary.

use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum};

use qvpn_core::LogFormat;

/// qvpn CONNECT-IP VPN concentrator.
#[derive(Debug, Parser)]
#[command(name = "qvpn-server", version, about)]
pub struct Cli {
    /// Path to the server configuration file.
    #[arg(short, long, default_value = "config.server.toml")]
    pub config: PathBuf,

    /// Increase verbosity over the configured log_level (-v, -vv).
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormatArg::Text)]
    pub log_format: LogFormatArg,
}

/// CLI mirror of [`LogFormat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Text,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Text => LogFormat::Text,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cli = Cli::parse_from(["qvpn-server"]);
        assert_eq!(cli.config, PathBuf::from("config.server.toml"));
        assert_eq!(cli.verbose, 0);
        assert_eq!(cli.log_format, LogFormatArg::Text);
    }

    #[test]
    fn verbosity_accumulates() {
        let cli = Cli::parse_from(["qvpn-server", "-vv"]);
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn config_path_override() {
        let cli = Cli::parse_from(["qvpn-server", "--config", "/etc/qvpn/server.toml"]);
        assert_eq!(cli.config, PathBuf::from("/etc/qvpn/server.toml"));
    }

    #[test]
    fn json_format() {
        let cli = Cli::parse_from(["qvpn-server", "--log-format", "json"]);
        assert_eq!(LogFormat::from(cli.log_format), LogFormat::Json);
    }
}
