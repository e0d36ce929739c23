//! Exclusive-queue harness for RabbitMQ.
//!
//! Opens one shared connection, hands out a fresh channel per operation, and
//! checks that the broker refuses a second consumer on an exclusive queue.

pub mod config;
pub mod message;
pub mod rabbitmq;
pub mod test_runner;

pub use message::{Delivery, ProbeMessage, Publishing};
pub use rabbitmq::{QueueBinding, Rabbit, RabbitMQError};
