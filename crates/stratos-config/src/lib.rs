//! Configuration for the Stratos telemetry server.
//!
//! Settings persist to disk as a RON file, can be overridden from the command
//! line via clap, and are validated before the server starts.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    Config, ListenerConfig, LogConfig, SinkConfig, config_file, default_config_dir,
};
pub use error::ConfigError;
