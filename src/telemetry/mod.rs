use clap::ValueEnum;
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Minimum severity written to the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lower")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    /// Prints raw IRC and command-interface line I/O. This will expose any
    /// credentials present on the wire.
    Trace,
}

impl LogLevel {
    fn as_filter(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Option<LogLevel>,
    /// Quiet mode drops the default level to warnings.
    pub quiet: bool,
    /// Silent mode suppresses all output.
    pub silent: bool,
}

impl LogConfig {
    fn effective_level(&self) -> LogLevel {
        match self.level {
            Some(level) => level,
            None if self.quiet => LogLevel::Warn,
            None => LogLevel::Info,
        }
    }
}

#[derive(Debug, Error)]
#[error("failed to initialise logging: {0}")]
pub struct InitError(String);

/// Install the global tracing subscriber. `RUST_LOG` overrides the CLI
/// level when set.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if config.silent {
        return Ok(());
    }
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.effective_level().as_filter()));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init()
        .map_err(|err| InitError(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_defaults_to_warn() {
        let config = LogConfig {
            level: None,
            quiet: true,
            silent: false,
        };
        assert_eq!(config.effective_level(), LogLevel::Warn);
    }

    #[test]
    fn explicit_level_beats_quiet() {
        let config = LogConfig {
            level: Some(LogLevel::Trace),
            quiet: true,
            silent: false,
        };
        assert_eq!(config.effective_level(), LogLevel::Trace);
    }
}
