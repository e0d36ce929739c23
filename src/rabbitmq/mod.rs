// src/rabbitmq/mod.rs
// Connection and channel lifecycle around the lapin client

pub mod amqp_client;
pub mod channel_manager;
pub mod client;
pub mod connection;
pub mod consumer;
pub mod errors;
mod publisher;

#[cfg(test)]
pub(crate) mod mock;

// Re-export specific items to simplify imports elsewhere
pub use amqp_client::{AmqpChannel, AmqpConnection, DeliveryStream, Dialer, LapinDialer};
pub use channel_manager::{ChannelCloser, ChannelManager, ChannelOf};
pub use client::Rabbit;
pub use connection::ConnectionManager;
pub use consumer::{spawn_delivery_logger, QueueBinding};
pub use errors::{RabbitMQError, Result};
