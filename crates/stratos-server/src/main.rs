//! The binary entry point for the Stratos telemetry server.

use std::sync::Arc;

use clap::Parser;
use stratos_config::{CliArgs, Config, ConfigError, config_file, default_config_dir};
use stratos_net::{SessionContext, TelemetryServer};
use stratos_sink::{FileSink, JsonLinesSink, SinkError};

#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error("server error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    if let Err(e) = run(args).await {
        tracing::error!("{e}");
        eprintln!("stratos: {e}");
        std::process::exit(1);
    }
}

async fn run(args: CliArgs) -> Result<(), StartupError> {
    let config_dir = args.config.clone().unwrap_or_else(default_config_dir);
    let mut config = Config::load_or_create(&config_dir)?;
    config.apply_cli_overrides(&args);

    // Config loading runs before the subscriber exists, so report it here.
    stratos_log::init_logging(&config.log);
    tracing::info!("Using config {}", config_file(&config_dir).display());
    let server_config = config.server_config()?;

    let sink = FileSink::create(&config.sink.root_path).await?;
    if config.sink.clear_on_start {
        sink.clear_logs().await?;
    }

    let mut context = SessionContext::new(sink);
    if let Some(path) = &config.sink.records_path {
        let records = JsonLinesSink::open(path)?;
        tracing::info!("Appending records to {}", records.path().display());
        context = context.with_records(Arc::new(records));
    }

    let server = Arc::new(TelemetryServer::new(server_config, context));
    let accept_loop = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.run().await })
    };

    tokio::select! {
        result = accept_loop => {
            // The loop only ends on its own if binding failed.
            result.map_err(std::io::Error::other)??;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupt received");
            server.shutdown();
        }
    }

    Ok(())
}
