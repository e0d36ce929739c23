use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rabbit_exclusive::config;
use rabbit_exclusive::test_runner::{publish_probe, run_exclusivity_test};
use rabbit_exclusive::Rabbit;

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_file(true)
        .with_line_number(true)
        .init();

    let config = config::load_config().context("Error loading config")?;
    let settings = &config.harness;

    // A broker we cannot reach is a bootstrap failure, not something to retry here.
    let rabbit = Rabbit::connect(&config.rabbitmq)
        .await
        .context("Failed to establish RabbitMQ connection")?;

    let run = match run_exclusivity_test(&rabbit, &rabbit, settings).await {
        Ok(run) => run,
        Err(err) => {
            rabbit.close_connection().await;
            return Err(err).context("Exclusivity test could not start");
        }
    };

    if settings.publish_probe {
        if let Err(err) = publish_probe(&rabbit, settings).await {
            error!(error = %err, "Probe message was not published");
        }
    }

    let drain_window = Duration::from_millis(settings.drain_window_ms);
    info!("Draining deliveries for {:?} (Ctrl+C to stop early)", drain_window);
    tokio::select! {
        _ = tokio::time::sleep(drain_window) => {}
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                warn!(error = %err, "Failed to listen for Ctrl+C");
            }
        }
    }

    let received = run.shutdown(Duration::from_secs(5)).await;
    info!(received, "First consumer stopped");

    rabbit.close_connection().await;
    Ok(())
}
