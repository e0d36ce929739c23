use futures::StreamExt;
use lapin::options::{BasicConsumeOptions, QueueDeclareOptions};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::amqp_client::{AmqpChannel, DeliveryStream, Dialer};
use super::channel_manager::{ChannelCloser, ChannelOf};
use super::client::Rabbit;
use super::errors::{RabbitMQError, Result};

/// Where a consumer's queue lives and how exclusively it is held.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub queue: String,
    pub routing_key: String,
    pub exchange: String,
    /// Only the declaring connection may use the queue.
    pub exclusive_queue: bool,
    /// No other consumer may attach while this one is active.
    pub exclusive_consumer: bool,
}

impl QueueBinding {
    pub fn new(queue: &str, routing_key: &str, exchange: &str) -> Self {
        QueueBinding {
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
            exchange: exchange.to_string(),
            exclusive_queue: false,
            exclusive_consumer: false,
        }
    }

    pub fn exclusive(mut self, exclusive_queue: bool, exclusive_consumer: bool) -> Self {
        self.exclusive_queue = exclusive_queue;
        self.exclusive_consumer = exclusive_consumer;
        self
    }
}

impl<D: Dialer> Rabbit<D> {
    /// Declares and binds the queue, then starts an auto-ack consumer on it.
    ///
    /// Any failure closes the channel before returning, so a rejected setup
    /// (for example an exclusive queue owned by another connection) leaves
    /// nothing open.
    pub async fn consume_from_queue(
        &self,
        binding: &QueueBinding,
        label: &str,
    ) -> Result<(DeliveryStream, ChannelCloser<ChannelOf<D>>)> {
        let (channel, closer) = self.channels.open_channel(label).await?;

        let queue = match channel
            .queue_declare(
                &binding.queue,
                QueueDeclareOptions {
                    durable: false,
                    auto_delete: true,
                    exclusive: binding.exclusive_queue,
                    ..QueueDeclareOptions::default()
                },
            )
            .await
        {
            Ok(queue) => queue,
            Err(source) => {
                closer.close().await;
                return Err(RabbitMQError::QueueDeclareFailed {
                    queue: binding.queue.clone(),
                    source,
                });
            }
        };

        if let Err(source) = channel
            .queue_bind(&queue, &binding.exchange, &binding.routing_key)
            .await
        {
            closer.close().await;
            return Err(RabbitMQError::QueueBindFailed {
                queue,
                exchange: binding.exchange.clone(),
                source,
            });
        }

        let consumer_tag = format!(
            "{}-{}",
            label.replace(' ', "-"),
            &Uuid::new_v4().to_string()[..8]
        );
        let deliveries = match channel
            .basic_consume(
                &queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_ack: true,
                    exclusive: binding.exclusive_consumer,
                    ..BasicConsumeOptions::default()
                },
            )
            .await
        {
            Ok(deliveries) => deliveries,
            Err(source) => {
                closer.close().await;
                return Err(RabbitMQError::ConsumeFailed { queue, source });
            }
        };

        info!(
            label,
            queue = %queue,
            exchange = %binding.exchange,
            routing_key = %binding.routing_key,
            consumer_tag = %consumer_tag,
            "Started consuming from queue"
        );
        Ok((deliveries, closer))
    }
}

/// Logs every delivery until the stream ends, which happens when the
/// consumer's channel is closed.
pub fn spawn_delivery_logger(label: &str, mut deliveries: DeliveryStream) -> JoinHandle<usize> {
    let label = label.to_string();
    tokio::spawn(async move {
        let mut received = 0;
        while let Some(delivery) = deliveries.next().await {
            match delivery {
                Ok(delivery) => {
                    received += 1;
                    info!(
                        name = %label,
                        routing_key = %delivery.routing_key,
                        delivery_tag = delivery.delivery_tag,
                        "Message received: {}",
                        delivery.payload_lossy()
                    );
                }
                Err(err) => error!(name = %label, error = %err, "Error receiving message"),
            }
        }
        warn!(name = %label, received, "Delivery stream closed");
        received
    })
}
