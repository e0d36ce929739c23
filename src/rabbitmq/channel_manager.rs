use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lapin::Error as LapinError;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use super::amqp_client::{AmqpChannel, AmqpConnection, Dialer};
use super::connection::ConnectionManager;
use super::errors::{is_channel_exhaustion, RabbitMQError, Result};

/// Channel type produced by the connection a dialer opens.
pub type ChannelOf<D> = <<D as Dialer>::Connection as AmqpConnection>::Channel;

/// Hands out one fresh channel per logical operation over the shared connection.
pub struct ChannelManager<D: Dialer> {
    connections: Arc<ConnectionManager<D>>,
}

impl<D: Dialer> Clone for ChannelManager<D> {
    fn clone(&self) -> Self {
        Self {
            connections: Arc::clone(&self.connections),
        }
    }
}

impl<D: Dialer> ChannelManager<D> {
    pub fn new(connections: Arc<ConnectionManager<D>>) -> Self {
        Self { connections }
    }

    pub fn connections(&self) -> &Arc<ConnectionManager<D>> {
        &self.connections
    }

    /// Opens a channel and starts watching it for broker-side closure.
    ///
    /// The connection must already be established; this never dials. A
    /// connection that has run out of channel ids is not recoverable and
    /// aborts the process instead of returning.
    pub async fn open_channel(
        &self,
        label: &str,
    ) -> Result<(ChannelOf<D>, ChannelCloser<ChannelOf<D>>)> {
        let connection = self
            .connections
            .current()
            .filter(|connection| connection.is_open())
            .ok_or(RabbitMQError::ConnectionUnavailable)?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(err) if is_channel_exhaustion(&err) => abort_on_channel_exhaustion(label, err),
            Err(err) => return Err(RabbitMQError::ChannelAcquisitionFailed(err)),
        };

        let label: Arc<str> = Arc::from(label);
        let channel_id = channel.id();
        info!(label = %label, channel_id, "channel created");

        let closed_by_broker = Arc::new(AtomicBool::new(false));
        let monitor = spawn_close_monitor(
            Arc::clone(&label),
            channel_id,
            channel.close_notifications(),
            Arc::clone(&closed_by_broker),
        );
        let closer = ChannelCloser {
            channel: channel.clone(),
            label,
            closed: Arc::new(AtomicBool::new(false)),
            closed_by_broker,
            monitor: monitor.abort_handle(),
        };

        Ok((channel, closer))
    }

    /// Runs `operation` on a short-lived channel that is closed on every exit path.
    ///
    /// Dropping the returned future before it completes still releases the
    /// channel: the close is handed to a spawned task.
    pub async fn with_channel<T, F, Fut>(&self, label: &str, operation: F) -> Result<T>
    where
        F: FnOnce(ChannelOf<D>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (channel, closer) = self.open_channel(label).await?;
        let mut guard = CloseOnDrop(Some(closer.clone()));
        let result = operation(channel).await;
        closer.close().await;
        guard.disarm();
        result
    }
}

/// Caller-owned release handle for a channel. Clones share the same state, so
/// only the first `close` does anything.
pub struct ChannelCloser<C: AmqpChannel> {
    channel: C,
    label: Arc<str>,
    closed: Arc<AtomicBool>,
    closed_by_broker: Arc<AtomicBool>,
    monitor: AbortHandle,
}

impl<C: AmqpChannel> Clone for ChannelCloser<C> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
            label: Arc::clone(&self.label),
            closed: Arc::clone(&self.closed),
            closed_by_broker: Arc::clone(&self.closed_by_broker),
            monitor: self.monitor.clone(),
        }
    }
}

impl<C: AmqpChannel> ChannelCloser<C> {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn channel_id(&self) -> u16 {
        self.channel.id()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || !self.channel.is_open()
    }

    /// True once the close monitor has reported a broker-side closure.
    pub fn closed_by_broker(&self) -> bool {
        self.closed_by_broker.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn monitor_finished(&self) -> bool {
        self.monitor.is_finished()
    }

    /// Closes the channel if it is still open. Close errors are logged only.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!(
                label = %self.label,
                channel_id = self.channel.id(),
                "channel close already requested"
            );
            return;
        }

        // Closed by the broker: the monitor reports why, leave it running.
        if !self.channel.is_open() {
            debug!(label = %self.label, channel_id = self.channel.id(), "channel already closed");
            return;
        }

        match self.channel.close().await {
            Ok(()) => info!(label = %self.label, channel_id = self.channel.id(), "channel closed"),
            Err(err) => error!(
                label = %self.label,
                channel_id = self.channel.id(),
                error = %err,
                "error closing channel"
            ),
        }
        self.monitor.abort();
    }
}

/// Closes the channel from a spawned task if `with_channel` is dropped mid-flight.
struct CloseOnDrop<C: AmqpChannel>(Option<ChannelCloser<C>>);

impl<C: AmqpChannel> CloseOnDrop<C> {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl<C: AmqpChannel> Drop for CloseOnDrop<C> {
    fn drop(&mut self) {
        let Some(closer) = self.0.take() else {
            return;
        };
        match Handle::try_current() {
            Ok(runtime) => {
                warn!(
                    label = %closer.label,
                    channel_id = closer.channel_id(),
                    "scoped operation dropped, closing channel"
                );
                runtime.spawn(async move { closer.close().await });
            }
            Err(_) => error!(
                label = %closer.label,
                channel_id = closer.channel_id(),
                "scoped operation dropped outside a runtime, channel left open"
            ),
        }
    }
}

fn spawn_close_monitor(
    label: Arc<str>,
    channel_id: u16,
    mut notifications: mpsc::UnboundedReceiver<LapinError>,
    closed_by_broker: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Some(err) = notifications.recv().await {
            closed_by_broker.store(true, Ordering::SeqCst);
            error!(label = %label, channel_id, error = %err, "channel closed unexpectedly");
        }
    })
}

/// Running out of channel ids means the connection is leaking channels; there
/// is no retry that helps, so this takes the process down. Panicking is not
/// enough here: inside a spawned task it only unwinds that task.
fn abort_on_channel_exhaustion(label: &str, err: LapinError) -> ! {
    let fatal = RabbitMQError::ChannelSpaceExhausted(err);
    error!(label, error = %fatal, "unrecoverable channel exhaustion, aborting");

    // Unit tests observe the abort as a panic carrying the same message.
    #[cfg(test)]
    panic!("{}", fatal);
    #[cfg(not(test))]
    std::process::abort();
}
