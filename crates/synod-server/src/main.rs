//! Entry point for the Synod server.
//!
//! Starts an in-process cluster and serves JSON-line commands on stdin until
//! input ends or a shutdown signal arrives.

use std::time::Duration;

use clap::Parser;
use synod_core::{ClusterService, Configuration};
use synod_server::metrics::init_metrics;
use synod_server::model::{Cli, load_configuration, logging_config};
use synod_server::shell;
use synod_server::startup::{init_logging, run_with_shutdown, wait_for_shutdown_signal};
use tokio::io::BufReader;
use tracing::{error, info};

/// Upper bound on waiting for blocked stdin reads at exit
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

async fn serve(configuration: Configuration) -> anyhow::Result<()> {
    let cluster_config = configuration.cluster_config()?;
    let service = ClusterService::new(cluster_config)?;
    service.start().await?;

    let shutdown = wait_for_shutdown_signal().await;
    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();

    let result = run_with_shutdown(shell::run(&service, stdin, stdout), shutdown.subscribe()).await;

    service.stop().await;

    match result {
        Some(Err(e)) => {
            error!("Command shell failed: {:#}", e);
            Err(e)
        }
        Some(Ok(())) => {
            info!("Input closed, server stopped");
            Ok(())
        }
        None => {
            info!("Server stopped");
            Ok(())
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let configuration = load_configuration(&cli)?;

    let _logging_guard = init_logging(&logging_config(&configuration))?;
    init_metrics();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(serve(configuration));
    // stdin reads block a worker thread that cannot be cancelled
    runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);

    result
}
