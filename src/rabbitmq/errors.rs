// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use thiserror::Error;

/// Text the broker (or its client) reports when a connection has handed out
/// every channel id it negotiated.
pub const CHANNEL_EXHAUSTED_TEXT: &str = "channel id space exhausted";

#[derive(Debug, Error)]
pub enum RabbitMQError {
    #[error("RabbitMQ connection is not open or was never established")]
    ConnectionUnavailable,

    #[error("Failed to connect to RabbitMQ after {attempts} attempt(s): {source}")]
    DialFailed {
        attempts: u32,
        #[source]
        source: LapinError,
    },

    #[error("Error getting channel: {0}")]
    ChannelAcquisitionFailed(#[source] LapinError),

    #[error("RabbitMQ channel id space exhausted: {0}")]
    ChannelSpaceExhausted(#[source] LapinError),

    #[error("Error declaring queue '{queue}': {source}")]
    QueueDeclareFailed {
        queue: String,
        #[source]
        source: LapinError,
    },

    #[error("Error binding queue '{queue}' to exchange '{exchange}': {source}")]
    QueueBindFailed {
        queue: String,
        exchange: String,
        #[source]
        source: LapinError,
    },

    #[error("Error consuming from queue '{queue}': {source}")]
    ConsumeFailed {
        queue: String,
        #[source]
        source: LapinError,
    },

    #[error("Error declaring exchange '{exchange}': {source}")]
    ExchangeDeclareFailed {
        exchange: String,
        #[source]
        source: LapinError,
    },

    #[error("Error publishing message to '{exchange}' with key '{routing_key}': {source}")]
    PublishFailed {
        exchange: String,
        routing_key: String,
        #[source]
        source: LapinError,
    },
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

impl RabbitMQError {
    /// The broker error underneath a wrapped failure, if any.
    pub fn broker_error(&self) -> Option<&LapinError> {
        match self {
            RabbitMQError::ConnectionUnavailable => None,
            RabbitMQError::DialFailed { source, .. }
            | RabbitMQError::QueueDeclareFailed { source, .. }
            | RabbitMQError::QueueBindFailed { source, .. }
            | RabbitMQError::ConsumeFailed { source, .. }
            | RabbitMQError::ExchangeDeclareFailed { source, .. }
            | RabbitMQError::PublishFailed { source, .. } => Some(source),
            RabbitMQError::ChannelAcquisitionFailed(source)
            | RabbitMQError::ChannelSpaceExhausted(source) => Some(source),
        }
    }

    /// True when the broker refused the operation because a queue or consumer
    /// is held exclusively elsewhere (RESOURCE_LOCKED 405, ACCESS_REFUSED 403).
    pub fn is_exclusivity_conflict(&self) -> bool {
        let Some(source) = self.broker_error() else {
            return false;
        };

        // Use string representation for classification
        let error_text = source.to_string();
        ["RESOURCE_LOCKED", "RESOURCELOCKED", "ACCESS_REFUSED", "ACCESSREFUSED"]
            .iter()
            .any(|marker| error_text.contains(marker))
    }
}

/// Whether a channel-creation error means the connection cannot hand out any
/// more channels.
pub fn is_channel_exhaustion(error: &LapinError) -> bool {
    matches!(error, LapinError::ChannelsLimitReached)
        || error.to_string().contains(CHANNEL_EXHAUSTED_TEXT)
}
