//! SkyFlow controller binary.
//!
//! Watches Workflow resources and drives their tasks as pods.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use skyflow_controller::{controller, ControllerConfig};

/// Initialize tracing/logging.
fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,skyflow_controller=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = ControllerConfig::from_env()?;
    init_tracing(config.log_json);

    tracing::info!(
        entrypoint_image = %config.entrypoint_image,
        requeue_secs = config.requeue_seconds,
        "Controller configuration loaded"
    );

    let client = kube::Client::try_default().await?;
    controller::run(client, config).await;

    Ok(())
}
