//! Log setup shared by the binaries

use clap::ValueEnum;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Log level for CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Default)]
pub enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    #[default]
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    /// Parse a level name from the config file, falling back to warn
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Warn,
        }
    }

    /// Pick the effective level: an explicit CLI level wins, `--verbose`
    /// raises the configured level to at least info
    pub fn resolve(cli: Option<LogLevel>, verbose: bool, configured: &str) -> Self {
        if let Some(level) = cli {
            return level;
        }
        let configured = Self::from_name(configured);
        if verbose && configured < LogLevel::Info {
            LogLevel::Info
        } else {
            configured
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Install the global subscriber, logging to stderr. `RUST_LOG`, when set,
/// replaces the level filter.
pub fn init_tracing(level: LogLevel) -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(None, false, "warn", LogLevel::Warn ; "config default")]
    #[test_case(None, true, "warn", LogLevel::Info ; "verbose raises")]
    #[test_case(None, true, "debug", LogLevel::Debug ; "verbose keeps more detail")]
    #[test_case(Some(LogLevel::Error), true, "debug", LogLevel::Error ; "cli wins")]
    #[test_case(None, false, "bogus", LogLevel::Warn ; "unknown name")]
    fn test_resolve(cli: Option<LogLevel>, verbose: bool, configured: &str, expected: LogLevel) {
        assert_eq!(LogLevel::resolve(cli, verbose, configured), expected);
    }
}
