//! # HoloMUSH Runtime
//!
//! Ambient services for embedding the plugin subsystem in a server process:
//!
//! - [`config`] - `holomush.yaml` loading with env expansion and validation
//! - [`logging`] - tracing subscriber setup
//!
//! The plugin plane itself lives in `holomush-plugin`; this crate only
//! carries what every embedding needs to get started.

pub mod config;
pub mod logging;

pub use config::{ConfigError, ConfigLoader, ConfigResult, HoloConfig, LogConfig, PluginsConfig, load_config};
