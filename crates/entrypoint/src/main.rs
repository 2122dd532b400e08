//! SkyFlow step entrypoint binary.

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use skyflow_entrypoint::{sequencer, Args, EntrypointError};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Logs go to stderr, stdout belongs to the step
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,skyflow_entrypoint=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    match sequencer::run(&args).await {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(err @ EntrypointError::CommandFailed { .. }) => {
            tracing::error!(error = %err, "Step failed");
            Ok(ExitCode::from(err.exit_code()))
        }
        Err(err) => {
            tracing::error!(error = %err, "Step failed");
            Err(err.into())
        }
    }
}
