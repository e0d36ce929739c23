// src/rabbitmq/amqp_client.rs
//
// The seam between the lifecycle code and the AMQP client library. The
// production implementations below delegate straight to lapin; tests swap in
// an in-memory broker.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use lapin::{
    options::{
        BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    Channel, Connection, ConnectionProperties, Error as LapinError, ExchangeKind,
};
use tokio::sync::mpsc;

use crate::message::{Delivery, Publishing};

/// Deliveries for one consumer, in broker order. Ends when the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, LapinError>>;

/// Establishes the transport session to the broker.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Connection: AmqpConnection;

    async fn dial(&self) -> Result<Self::Connection, LapinError>;

    /// Broker address for logs, without credentials.
    fn endpoint(&self) -> String;
}

#[async_trait]
pub trait AmqpConnection: Send + Sync + 'static {
    type Channel: AmqpChannel;

    fn is_open(&self) -> bool;

    async fn create_channel(&self) -> Result<Self::Channel, LapinError>;

    async fn close(&self) -> Result<(), LapinError>;
}

/// Operations the harness performs on a single channel.
#[async_trait]
pub trait AmqpChannel: Clone + Send + Sync + 'static {
    fn id(&self) -> u16;

    fn is_open(&self) -> bool;

    /// Feed of errors that closed the channel from the broker side.
    fn close_notifications(&self) -> mpsc::UnboundedReceiver<LapinError>;

    async fn close(&self) -> Result<(), LapinError>;

    /// Returns the queue name the broker settled on.
    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
    ) -> Result<String, LapinError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), LapinError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
    ) -> Result<DeliveryStream, LapinError>;

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
    ) -> Result<(), LapinError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        message: &Publishing,
    ) -> Result<(), LapinError>;
}

/// Dials a real broker with lapin.
#[derive(Debug, Clone)]
pub struct LapinDialer {
    uri: String,
    connection_name: String,
}

impl LapinDialer {
    pub fn new(uri: &str, connection_name: &str) -> Self {
        Self {
            uri: uri.to_string(),
            connection_name: connection_name.to_string(),
        }
    }
}

#[async_trait]
impl Dialer for LapinDialer {
    type Connection = Connection;

    async fn dial(&self) -> Result<Connection, LapinError> {
        let properties = ConnectionProperties::default()
            .with_connection_name(self.connection_name.clone().into());
        Connection::connect(&self.uri, properties).await
    }

    fn endpoint(&self) -> String {
        redact_uri(&self.uri)
    }
}

#[async_trait]
impl AmqpConnection for Connection {
    type Channel = Channel;

    fn is_open(&self) -> bool {
        self.status().connected()
    }

    async fn create_channel(&self) -> Result<Channel, LapinError> {
        Connection::create_channel(self).await
    }

    async fn close(&self) -> Result<(), LapinError> {
        Connection::close(self, 200, "Closing connection").await
    }
}

#[async_trait]
impl AmqpChannel for Channel {
    fn id(&self) -> u16 {
        Channel::id(self)
    }

    fn is_open(&self) -> bool {
        self.status().connected()
    }

    fn close_notifications(&self) -> mpsc::UnboundedReceiver<LapinError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.on_error(move |error| {
            // The monitor may already be gone if the channel was closed by us.
            let _ = tx.send(error);
        });
        rx
    }

    async fn close(&self) -> Result<(), LapinError> {
        Channel::close(self, 200, "Closing channel").await
    }

    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
    ) -> Result<String, LapinError> {
        let declared = Channel::queue_declare(self, queue, options, FieldTable::default()).await?;
        Ok(declared.name().as_str().to_string())
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), LapinError> {
        Channel::queue_bind(
            self,
            queue,
            exchange,
            routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
    ) -> Result<DeliveryStream, LapinError> {
        let consumer =
            Channel::basic_consume(self, queue, consumer_tag, options, FieldTable::default())
                .await?;
        Ok(consumer
            .map(|delivery| delivery.map(Delivery::from))
            .boxed())
    }

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
    ) -> Result<(), LapinError> {
        Channel::exchange_declare(self, exchange, kind, options, FieldTable::default()).await
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        message: &Publishing,
    ) -> Result<(), LapinError> {
        let _confirmation = Channel::basic_publish(
            self,
            exchange,
            routing_key,
            options,
            &message.body,
            message.properties(),
        )
        .await?
        .await?;
        Ok(())
    }
}

/// Strips the password from an AMQP URI so it can be logged.
pub fn redact_uri(uri: &str) -> String {
    let Some((scheme, rest)) = uri.split_once("://") else {
        return uri.to_string();
    };
    let Some((credentials, host)) = rest.rsplit_once('@') else {
        return uri.to_string();
    };
    match credentials.split_once(':') {
        Some((user, _)) => format!("{}://{}:***@{}", scheme, user, host),
        None => format!("{}://{}@{}", scheme, credentials, host),
    }
}
