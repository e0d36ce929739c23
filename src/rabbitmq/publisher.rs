use lapin::{
    options::{BasicPublishOptions, ExchangeDeclareOptions},
    ExchangeKind,
};
use tracing::info;

use super::amqp_client::{AmqpChannel, Dialer};
use super::client::Rabbit;
use super::errors::{RabbitMQError, Result};
use crate::message::Publishing;

impl<D: Dialer> Rabbit<D> {
    /// Declares a non-durable topic exchange. Repeating the declaration with
    /// the same parameters is a no-op on the broker.
    pub async fn create_exchange(&self, exchange: &str) -> Result<()> {
        self.channels
            .with_channel("create-exchange", |channel| async move {
                channel
                    .exchange_declare(
                        exchange,
                        ExchangeKind::Topic,
                        ExchangeDeclareOptions {
                            durable: false,
                            auto_delete: false,
                            internal: false,
                            ..ExchangeDeclareOptions::default()
                        },
                    )
                    .await
                    .map_err(|source| RabbitMQError::ExchangeDeclareFailed {
                        exchange: exchange.to_string(),
                        source,
                    })
            })
            .await?;

        info!(exchange, "Exchange declared");
        Ok(())
    }

    /// Publishes one message on a short-lived channel.
    ///
    /// `mandatory` and `immediate` go to the broker unchanged.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        immediate: bool,
        message: &Publishing,
    ) -> Result<()> {
        self.channels
            .with_channel("publish", |channel| async move {
                channel
                    .basic_publish(
                        exchange,
                        routing_key,
                        BasicPublishOptions {
                            mandatory,
                            immediate,
                        },
                        message,
                    )
                    .await
                    .map_err(|source| RabbitMQError::PublishFailed {
                        exchange: exchange.to_string(),
                        routing_key: routing_key.to_string(),
                        source,
                    })
            })
            .await?;

        info!(
            exchange,
            routing_key,
            bytes = message.body.len(),
            "Published message"
        );
        Ok(())
    }
}
