// src/test_runner.rs
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::config::HarnessSettings;
use crate::message::ProbeMessage;
use crate::rabbitmq::{
    spawn_delivery_logger, ChannelCloser, ChannelOf, Dialer, QueueBinding, Rabbit, RabbitMQError,
};

pub const FIRST_CONSUMER: &str = "ch 01";
pub const SECOND_CONSUMER: &str = "ch 02";

/// Whether the broker refused the second consumer.
#[derive(Debug)]
pub enum ExclusivityOutcome {
    /// Second setup failed; carries the broker's rejection.
    Enforced { error: RabbitMQError },
    /// Second setup succeeded, so the queue was not exclusive after all.
    Violated,
}

impl ExclusivityOutcome {
    pub fn is_enforced(&self) -> bool {
        matches!(self, ExclusivityOutcome::Enforced { .. })
    }
}

/// A finished exclusivity check whose first consumer is still draining.
pub struct ExclusivityRun<D: Dialer> {
    pub outcome: ExclusivityOutcome,
    pub first_consumer: ChannelCloser<ChannelOf<D>>,
    pub drain: JoinHandle<usize>,
}

impl<D: Dialer> ExclusivityRun<D> {
    /// Closes the first consumer's channel and waits for its drain loop to
    /// notice. Returns how many deliveries were logged.
    pub async fn shutdown(self, grace: Duration) -> usize {
        self.first_consumer.close().await;
        match timeout(grace, self.drain).await {
            Ok(Ok(received)) => received,
            Ok(Err(err)) => {
                error!(error = %err, "Delivery logger task failed");
                0
            }
            Err(_) => {
                warn!("Delivery logger did not stop within {:?}", grace);
                0
            }
        }
    }
}

pub fn binding_for(settings: &HarnessSettings) -> QueueBinding {
    QueueBinding::new(&settings.queue, &settings.routing_key, &settings.exchange)
        .exclusive(settings.exclusive_queue, settings.exclusive_consumer)
}

/// Attaches a first consumer through `first`, then tries the identical setup
/// through `contender` and records whether the broker refused it.
///
/// `first` and `contender` may be the same client; each attempt gets its own
/// channel either way. The contender's channel is closed whatever the outcome.
pub async fn run_exclusivity_test<D: Dialer>(
    first: &Rabbit<D>,
    contender: &Rabbit<D>,
    settings: &HarnessSettings,
) -> crate::rabbitmq::Result<ExclusivityRun<D>> {
    let binding = binding_for(settings);
    first.create_exchange(&binding.exchange).await?;

    let (deliveries, first_consumer) = match first
        .consume_from_queue(&binding, FIRST_CONSUMER)
        .await
    {
        Ok(consumer) => consumer,
        Err(err) => {
            error!(error = %err, "First connection failed");
            return Err(err);
        }
    };
    info!(queue = %binding.queue, "First consumer connected successfully to the exclusive queue");

    let outcome = match contender.consume_from_queue(&binding, SECOND_CONSUMER).await {
        Err(err) => {
            error!(
                error = %err,
                exclusivity_conflict = err.is_exclusivity_conflict(),
                "Second connection failed as expected"
            );
            ExclusivityOutcome::Enforced { error: err }
        }
        Ok((_deliveries, second_consumer)) => {
            error!(
                queue = %binding.queue,
                "Second consumer connected successfully (unexpected behavior)"
            );
            second_consumer.close().await;
            ExclusivityOutcome::Violated
        }
    };

    if outcome.is_enforced() {
        info!("Exclusivity test passed");
    } else {
        error!("Exclusivity test FAILED: broker accepted a second exclusive consumer");
    }

    let drain = spawn_delivery_logger(FIRST_CONSUMER, deliveries);
    info!("Test completed");

    Ok(ExclusivityRun {
        outcome,
        first_consumer,
        drain,
    })
}

/// Publishes one JSON probe on the harness exchange/routing key.
pub async fn publish_probe<D: Dialer>(
    rabbit: &Rabbit<D>,
    settings: &HarnessSettings,
) -> Result<ProbeMessage> {
    let probe = ProbeMessage::new(&settings.queue, "exclusive consumer probe");
    let publishing = probe
        .to_publishing()
        .context("Failed to serialize probe message")?;

    rabbit
        .publish(&settings.exchange, &settings.routing_key, false, false, &publishing)
        .await
        .context("Failed to publish probe message")?;

    info!(probe_id = %probe.id, "Probe message published");
    Ok(probe)
}
