use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OnceCell;
use tokio::time::sleep;
use tracing::{debug, error, info};

use super::amqp_client::{AmqpConnection, Dialer};
use super::errors::{RabbitMQError, Result};

/// Owns the one broker connection shared by every channel the harness opens.
///
/// The connection is dialed lazily on the first `get_connection` call;
/// concurrent callers wait on that single attempt instead of dialing their own.
pub struct ConnectionManager<D: Dialer> {
    dialer: D,
    connection: OnceCell<Arc<D::Connection>>,
    max_dial_attempts: u32,
    reconnect_delay_ms: u64,
}

impl<D: Dialer> ConnectionManager<D> {
    pub fn new(dialer: D) -> Self {
        ConnectionManager {
            dialer,
            connection: OnceCell::new(),
            max_dial_attempts: 5,
            reconnect_delay_ms: 1000,
        }
    }

    pub fn with_reconnect_policy(mut self, max_attempts: u32, initial_delay_ms: u64) -> Self {
        self.max_dial_attempts = max_attempts.max(1);
        self.reconnect_delay_ms = initial_delay_ms;
        self
    }

    /// Returns the shared connection, dialing it if this is the first call.
    pub async fn get_connection(&self) -> Result<Arc<D::Connection>> {
        let connection = self
            .connection
            .get_or_try_init(|| async { self.establish_connection().await.map(Arc::new) })
            .await?;
        Ok(Arc::clone(connection))
    }

    /// The connection if it has been established, without dialing.
    pub fn current(&self) -> Option<Arc<D::Connection>> {
        self.connection.get().cloned()
    }

    async fn establish_connection(&self) -> Result<D::Connection> {
        let mut attempts = 0;
        let mut delay = self.reconnect_delay_ms;

        loop {
            info!(endpoint = %self.dialer.endpoint(), "Attempting to connect to RabbitMQ");

            match self.dialer.dial().await {
                Ok(connection) => {
                    info!("Successfully connected to RabbitMQ");
                    return Ok(connection);
                }
                Err(err) => {
                    attempts += 1;
                    error!(
                        "Failed to connect to RabbitMQ (attempt {}/{}): {}",
                        attempts, self.max_dial_attempts, err
                    );

                    if attempts >= self.max_dial_attempts {
                        error!("Max connection attempts reached. Giving up.");
                        return Err(RabbitMQError::DialFailed {
                            attempts,
                            source: err,
                        });
                    }

                    let sleep_time = jittered(delay);
                    debug!("Waiting {}ms before next connection attempt", sleep_time);
                    sleep(Duration::from_millis(sleep_time)).await;

                    // Exponential backoff, capped at 30 seconds
                    delay = std::cmp::min(delay.saturating_mul(2), 30_000);
                }
            }
        }
    }

    /// Closes the shared connection. Errors are logged, never returned.
    pub async fn close(&self) {
        let Some(connection) = self.connection.get() else {
            debug!("No RabbitMQ connection to close");
            return;
        };

        if !connection.is_open() {
            debug!("RabbitMQ connection already closed");
            return;
        }

        info!("Closing rabbit connection...");
        if let Err(err) = connection.close().await {
            error!(error = %err, "Error closing RabbitMQ connection");
        }
    }
}

// +/-15% so several harnesses restarted together do not dial in lockstep.
fn jittered(delay_ms: u64) -> u64 {
    let jitter = (rand::random::<f64>() * 0.3 - 0.15) * delay_ms as f64;
    (delay_ms as f64 + jitter).max(0.0) as u64
}
