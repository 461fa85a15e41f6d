use serde::{Deserialize, Serialize};

/// Controls the log format.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect the best format.
    ///
    /// This chooses [`LogFormat::Pretty`] for TTY, otherwise [`LogFormat::Simplified`].
    Auto,

    /// Pretty printing with colors.
    ///
    /// ```text
    ///  INFO  postbus_dispatch::bus > dispatcher pool started
    /// ```
    Pretty,

    /// Simplified plain text output.
    ///
    /// ```text
    /// 2024-12-04T12:10:32.123456Z  INFO postbus_dispatch::bus: dispatcher pool started
    /// ```
    Simplified,

    /// Dump out JSON lines.
    ///
    /// ```text
    /// {"timestamp":"2024-12-04T12:11:08.729716Z","level":"INFO","fields":{"message":"dispatcher pool started"},"target":"postbus_dispatch::bus"}
    /// ```
    Json,
}

/// The maximum level of log messages to emit.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// Disables logging entirely.
    Off,
    /// Only errors.
    Error,
    /// Warnings and errors.
    Warn,
    /// Informational messages and above.
    Info,
    /// Debug messages and above.
    Debug,
    /// Everything.
    Trace,
}

impl Level {
    /// Returns the directive string understood by `tracing` filters.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

impl From<Level> for tracing::level_filters::LevelFilter {
    fn from(level: Level) -> Self {
        match level {
            Level::Off => Self::OFF,
            Level::Error => Self::ERROR,
            Level::Warn => Self::WARN,
            Level::Info => Self::INFO,
            Level::Debug => Self::DEBUG,
            Level::Trace => Self::TRACE,
        }
    }
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// The log level for postbus crates.
    pub level: Level,

    /// Controls the log output format.
    ///
    /// Defaults to [`LogFormat::Auto`], which detects the best format based on the TTY.
    pub format: LogFormat,

    /// When set to `true`, backtraces are forced on.
    ///
    /// Otherwise, backtraces can be enabled by setting the `RUST_BACKTRACE` variable to `full`.
    pub enable_backtraces: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::Info,
            format: LogFormat::Auto,
            enable_backtraces: false,
        }
    }
}

#[cfg(feature = "init")]
mod init {
    use std::env;

    use tracing::Subscriber;
    use tracing_subscriber::registry::LookupSpan;
    use tracing_subscriber::{EnvFilter, Layer, prelude::*};

    use super::{Level, LogConfig, LogFormat};

    // Import CRATE_NAMES, which lists all crates in the workspace.
    include!(concat!(env!("OUT_DIR"), "/constants.gen.rs"));

    /// Builds the default filter: INFO for third-party crates, `level` for workspace crates.
    pub(super) fn default_filter(level: Level) -> String {
        let mut directives = vec!["info".to_owned()];
        for name in CRATE_NAMES {
            directives.push(format!("{name}={}", level.as_str()));
        }
        directives.join(",")
    }

    fn format_layer<S>(format: LogFormat) -> Box<dyn Layer<S> + Send + Sync>
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
    {
        let format = match (format, console::user_attended()) {
            (LogFormat::Auto, true) => LogFormat::Pretty,
            (LogFormat::Auto, false) => LogFormat::Simplified,
            (format, _) => format,
        };

        match format {
            LogFormat::Pretty => tracing_subscriber::fmt::layer()
                .with_target(true)
                .compact()
                .boxed(),
            LogFormat::Json => tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .boxed(),
            LogFormat::Simplified | LogFormat::Auto => tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .boxed(),
        }
    }

    /// Initialize the logging system.
    ///
    /// Honors the `RUST_LOG` environment variable if it is set, otherwise uses
    /// [`LogConfig::level`] for all postbus crates and `INFO` for everything else. Calling this
    /// function more than once has no effect.
    ///
    /// # Example
    ///
    /// ```
    /// let log_config = postbus_log::LogConfig::default();
    /// postbus_log::init(&log_config);
    /// ```
    pub fn init(config: &LogConfig) {
        if config.enable_backtraces {
            // SAFETY: logging is initialized during startup, before any other threads exist.
            unsafe { env::set_var("RUST_BACKTRACE", "full") };
        }

        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_filter(config.level)));

        tracing_subscriber::registry()
            .with(format_layer(config.format).with_filter(filter))
            .try_init()
            .ok();
    }
}

#[cfg(feature = "init")]
pub use init::init;
