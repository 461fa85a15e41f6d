use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use postbus_log::LogConfig;
use serde::{Deserialize, Serialize};

/// Defines the source of a config error.
#[derive(Debug, Default)]
enum ConfigErrorSource {
    /// An error occurring independently.
    #[default]
    None,
    /// An error originating from a configuration file.
    File(PathBuf),
    /// An error originating from a single configuration field.
    Field(&'static str),
}

/// Indicates config related errors.
#[derive(Debug)]
pub struct ConfigError {
    source: ConfigErrorSource,
    kind: ConfigErrorKind,
    inner: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl ConfigError {
    #[inline]
    fn new(kind: ConfigErrorKind) -> Self {
        Self {
            source: ConfigErrorSource::None,
            kind,
            inner: None,
        }
    }

    #[inline]
    fn wrap<E>(inner: E, kind: ConfigErrorKind) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self {
            inner: Some(Box::new(inner)),
            ..Self::new(kind)
        }
    }

    #[inline]
    fn file<P: AsRef<Path>>(mut self, p: P) -> Self {
        self.source = ConfigErrorSource::File(p.as_ref().to_path_buf());
        self
    }

    #[inline]
    fn field(mut self, name: &'static str) -> Self {
        self.source = ConfigErrorSource::Field(name);
        self
    }

    /// Returns the error kind of the error.
    pub fn kind(&self) -> ConfigErrorKind {
        self.kind
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            ConfigErrorSource::None => write!(f, "{}", self.kind),
            ConfigErrorSource::File(file_name) => {
                write!(f, "{} (file {})", self.kind, file_name.display())
            }
            ConfigErrorSource::Field(name) => write!(f, "{} (field {})", self.kind, name),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.inner.as_ref().map(|e| e.as_ref() as &(dyn Error + 'static))
    }
}

/// Indicates config related errors.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ConfigErrorKind {
    /// Failed to open the file.
    #[error("could not open config file")]
    CouldNotOpenFile,
    /// Failed to serialize the configuration.
    #[error("could not write config")]
    CouldNotWrite,
    /// Parsing YAML failed.
    #[error("could not parse yaml config file")]
    BadYaml,
    /// Parsing JSON failed.
    #[error("could not parse json config file")]
    BadJson,
    /// Invalid config value.
    #[error("invalid config value")]
    InvalidValue,
}

/// The on-disk format of a configuration file, derived from its extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConfigFormat {
    Yaml,
    Json,
}

impl ConfigFormat {
    fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::Json,
            _ => Self::Yaml,
        }
    }
}

/// Settings of the asynchronous message dispatch layer.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Number of dispatcher threads taking publications from the pending queue.
    ///
    /// A value of `0` starts no dispatchers. Scheduled publications then stay queued until the
    /// bus is shut down.
    pub dispatchers: usize,

    /// Maximum number of publications waiting in the pending queue.
    ///
    /// `None` creates an unbounded queue, in which case scheduling never blocks.
    pub queue_capacity: Option<usize>,

    /// Prefix for dispatcher thread names, suffixed with the thread index.
    pub thread_name: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            dispatchers: 2,
            queue_capacity: None,
            thread_name: "message-dispatcher".to_owned(),
        }
    }
}

/// Settings of the asynchronous handler invocation layer.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct InvocationConfig {
    /// Creates a handler executor for handlers requesting asynchronous delivery.
    ///
    /// When disabled, such handlers run inline on the dispatching thread.
    pub enabled: bool,

    /// Number of dedicated executor threads.
    pub threads: usize,

    /// Maximum number of handler tasks driven concurrently by a single executor thread.
    pub max_concurrency: usize,

    /// Prefix for executor thread names, suffixed with the thread index.
    pub thread_name: String,
}

impl Default for InvocationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threads: num_cpus::get(),
            max_concurrency: 16,
            thread_name: "handler-executor".to_owned(),
        }
    }
}

/// The full configuration of a message bus.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Logging setup.
    pub logging: LogConfig,
    /// Asynchronous message dispatch.
    pub dispatch: DispatchConfig,
    /// Asynchronous handler invocation.
    pub invocation: InvocationConfig,
}

impl Config {
    /// Parses and validates a configuration from a YAML document.
    pub fn from_yaml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_yaml::from_str(s).map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml))?;
        config.validate()?;
        Ok(config)
    }

    /// Parses and validates a configuration from a JSON document.
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(s).map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadJson))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration file.
    ///
    /// Files ending in `.json` are parsed as JSON, everything else as YAML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let f = fs::File::open(path)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotOpenFile).file(path))?;
        let reader = io::BufReader::new(f);

        let config: Self = match ConfigFormat::from_path(path) {
            ConfigFormat::Yaml => serde_yaml::from_reader(reader)
                .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml).file(path))?,
            ConfigFormat::Json => serde_json::from_reader(reader)
                .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadJson).file(path))?,
        };

        config.validate().map_err(|e| e.file(path))?;
        Ok(config)
    }

    /// Serializes the configuration to YAML.
    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotWrite))
    }

    /// Checks values that deserialize fine but cannot be used to build a bus.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatch.queue_capacity == Some(0) {
            return Err(
                ConfigError::new(ConfigErrorKind::InvalidValue).field("dispatch.queue_capacity")
            );
        }

        if self.invocation.enabled {
            if self.invocation.threads == 0 {
                return Err(
                    ConfigError::new(ConfigErrorKind::InvalidValue).field("invocation.threads")
                );
            }
            if self.invocation.max_concurrency == 0 {
                return Err(ConfigError::new(ConfigErrorKind::InvalidValue)
                    .field("invocation.max_concurrency"));
            }
        }

        Ok(())
    }
}
