use std::sync::Arc;

use tracing::info;

use super::amqp_client::{Dialer, LapinDialer};
use super::channel_manager::ChannelManager;
use super::connection::ConnectionManager;
use super::errors::Result;
use crate::config::RabbitSettings;

/// Entry point for the harness: queue/consumer setup, exchange declaration
/// and publishing, all over one shared connection.
///
/// Cloning is cheap; clones share the connection.
pub struct Rabbit<D: Dialer = LapinDialer> {
    pub(super) channels: ChannelManager<D>,
}

impl<D: Dialer> Clone for Rabbit<D> {
    fn clone(&self) -> Self {
        Self {
            channels: self.channels.clone(),
        }
    }
}

impl Rabbit<LapinDialer> {
    /// Builds a client for the configured broker and dials it.
    pub async fn connect(settings: &RabbitSettings) -> Result<Self> {
        let dialer = LapinDialer::new(&settings.uri, &settings.connection_name);
        let connections = ConnectionManager::new(dialer)
            .with_reconnect_policy(settings.dial_attempts, settings.reconnect_delay_ms);
        Self::from_manager(Arc::new(connections)).await
    }
}

impl<D: Dialer> Rabbit<D> {
    /// Wraps an existing manager, establishing its connection if needed.
    pub async fn from_manager(connections: Arc<ConnectionManager<D>>) -> Result<Self> {
        connections.get_connection().await?;
        Ok(Rabbit {
            channels: ChannelManager::new(connections),
        })
    }

    pub fn channels(&self) -> &ChannelManager<D> {
        &self.channels
    }

    /// Closes the shared connection. Safe to call more than once.
    pub async fn close_connection(&self) {
        self.channels.connections().close().await;
        info!("RabbitMQ connection released");
    }
}
