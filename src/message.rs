use chrono::{DateTime, Utc};
use lapin::{types::ShortString, BasicProperties};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One message handed to a consumer. Auto-acknowledged, so it carries no acker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub data: Vec<u8>,
}

impl Delivery {
    /// Payload rendered for logging; invalid UTF-8 is replaced, not rejected.
    pub fn payload_lossy(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        Delivery {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.as_str().to_string(),
            routing_key: delivery.routing_key.as_str().to_string(),
            redelivered: delivery.redelivered,
            data: delivery.data,
        }
    }
}

/// An outgoing message: body plus the few basic properties the harness sets.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Publishing {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
}

impl Publishing {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Publishing {
            body: body.into(),
            ..Publishing::default()
        }
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_string());
        self
    }

    pub fn with_message_id(mut self, message_id: &str) -> Self {
        self.message_id = Some(message_id.to_string());
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn properties(&self) -> BasicProperties {
        let mut properties = BasicProperties::default();
        if let Some(content_type) = &self.content_type {
            properties = properties.with_content_type(ShortString::from(content_type.clone()));
        }
        if let Some(message_id) = &self.message_id {
            properties = properties.with_message_id(ShortString::from(message_id.clone()));
        }
        if let Some(timestamp) = self.timestamp {
            properties = properties.with_timestamp(timestamp);
        }
        properties
    }
}

/// JSON body the harness publishes to show the first consumer is live.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ProbeMessage {
    pub id: Uuid,
    pub sent_at: DateTime<Utc>,
    pub queue: String,
    pub note: String,
}

impl ProbeMessage {
    /// Creates a new probe with the current timestamp and a generated UUID.
    pub fn new(queue: &str, note: &str) -> Self {
        ProbeMessage {
            id: Uuid::new_v4(),
            sent_at: Utc::now(),
            queue: queue.to_string(),
            note: note.to_string(),
        }
    }

    pub fn to_publishing(&self) -> Result<Publishing, serde_json::Error> {
        let body = serde_json::to_vec(self)?;
        Ok(Publishing::new(body)
            .with_content_type("application/json")
            .with_message_id(&self.id.to_string())
            .with_timestamp(self.sent_at.timestamp() as u64))
    }
}
