//! Configuration for the postbus dispatch engine.
//!
//! The [`Config`] bundles the settings of both concurrency layers of the bus together with the
//! logging setup. All sections implement `serde` traits and fall back to defaults for missing
//! fields, so an empty document is a valid configuration:
//!
//! ```
//! use postbus_config::Config;
//!
//! let config = Config::from_yaml_str("dispatch:\n  dispatchers: 4\n").unwrap();
//! assert_eq!(config.dispatch.dispatchers, 4);
//! assert!(config.invocation.enabled);
//! ```

#![warn(missing_docs)]

mod config;

pub use self::config::*;
