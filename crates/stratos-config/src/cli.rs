//! Command-line argument parsing for the Stratos server.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Stratos telemetry server command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "stratos", about = "Sensor telemetry ingest server")]
pub struct CliArgs {
    /// Listen port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Interface to bind.
    #[arg(long)]
    pub bind: Option<String>,

    /// Maximum concurrent connections.
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Per-connection read buffer size in bytes.
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Directory receiving sensor files.
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Keep files from a previous run instead of clearing the sink directory.
    #[arg(long)]
    pub keep_logs: bool,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(port) = args.port {
            self.server.port = port;
        }
        if let Some(ref bind) = args.bind {
            self.server.bind_address = bind.clone();
        }
        if let Some(max) = args.max_connections {
            self.server.max_connections = max;
        }
        if let Some(size) = args.buffer_size {
            self.server.buffer_size = size;
        }
        if let Some(ref root) = args.root {
            self.sink.root_path = root.clone();
        }
        if let Some(ref level) = args.log_level {
            self.log.log_level = level.clone();
        }
        if args.keep_logs {
            self.sink.clear_on_start = false;
        }
    }
}
