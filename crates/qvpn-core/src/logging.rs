//! Tracing integration for structured logging.
//!
//! Provides logging setup for the concentrator binary and tests with
//! configurable verbosity and text or JSON output.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::Result;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// Structured JSON output.
    Json,
}

/// Map a configured level name to a verbosity step.
///
/// Unknown names fall back to `info`.
pub fn verbosity_for_level(level: &str) -> u8 {
    match level {
        "error" => 0,
        "warn" => 1,
        "debug" => 3,
        "trace" => 4,
        _ => 2,
    }
}

/// Initialize the logging system.
///
/// `verbosity` maps 0=error, 1=warn, 2=info, 3=debug, 4+=trace. The
/// `RUST_LOG` environment variable overrides the derived filter.
pub fn init_logging(verbosity: u8, format: LogFormat) -> Result<()> {
    let level = match verbosity {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("qvpn_core={level},qvpn_server={level}"))
    });

    match format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_file(verbosity >= 3)
                        .with_line_number(verbosity >= 3),
                )
                .try_init()
                .map_err(|e| crate::Error::Io(std::io::Error::other(e.to_string())))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .try_init()
                .map_err(|e| crate::Error::Io(std::io::Error::other(e.to_string())))?;
        }
    }

    Ok(())
}

/// Initialize logging with defaults for testing.
///
/// Silently ignores errors (logging may already be initialized).
pub fn init_test_logging() {
    let _ = init_logging(2, LogFormat::Text);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_default() {
        assert_eq!(LogFormat::default(), LogFormat::Text);
    }

    #[test]
    fn level_name_mapping() {
        assert_eq!(verbosity_for_level("error"), 0);
        assert_eq!(verbosity_for_level("warn"), 1);
        assert_eq!(verbosity_for_level("info"), 2);
        assert_eq!(verbosity_for_level("debug"), 3);
        assert_eq!(verbosity_for_level("trace"), 4);
        // Unknown names fall back to info
        assert_eq!(verbosity_for_level("verbose"), 2);
    }

    #[test]
    fn init_is_idempotent_enough_for_tests() {
        init_test_logging();
        init_test_logging();
    }
}
