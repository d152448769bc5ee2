use std::process::ExitCode;

use tokio_util::sync::CancellationToken;

use jobflow_service::{ServiceConfig, run, shutdown_signal};

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();
    jobflow_observability::init();

    let config = ServiceConfig::from_env();
    tracing::info!(
        role = ?config.role,
        consumer = %config.topology.consumer_name,
        concurrency = config.pipeline.concurrency,
        "starting jobflow service"
    );

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    match run(config, cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "jobflow service failed");
            ExitCode::FAILURE
        }
    }
}
