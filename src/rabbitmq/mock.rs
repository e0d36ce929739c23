// In-memory broker for unit tests. Enforces the parts of AMQP 0-9-1 the
// harness depends on: exclusive queue ownership per connection, exclusive
// consumers, topic bindings, channel-level errors that close the channel, and
// a limit on how many channels one connection holds open at once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::channel::mpsc as delivery_mpsc;
use futures::stream::StreamExt;
use lapin::{
    options::{
        BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueDeclareOptions,
    },
    Error as LapinError, ExchangeKind,
};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::amqp_client::{AmqpChannel, AmqpConnection, DeliveryStream, Dialer};
use crate::message::{Delivery, Publishing};

pub fn broker_error(text: &str) -> LapinError {
    LapinError::IOError(Arc::new(io::Error::new(io::ErrorKind::Other, text.to_string())))
}

type DeliverySender = delivery_mpsc::UnboundedSender<Result<Delivery, LapinError>>;

struct ChannelEntry {
    connection: u32,
    open: Arc<AtomicBool>,
    notifier: Option<mpsc::UnboundedSender<LapinError>>,
}

struct ConsumerEntry {
    channel: u16,
    exclusive: bool,
    sender: DeliverySender,
}

struct QueueEntry {
    owner: Option<u32>,
    auto_delete: bool,
    bindings: HashSet<(String, String)>,
    consumers: Vec<ConsumerEntry>,
    ready: VecDeque<Delivery>,
}

#[derive(Default)]
struct BrokerState {
    next_connection: u32,
    next_channel: u16,
    next_delivery_tag: u64,
    channels: HashMap<u16, ChannelEntry>,
    exchanges: HashMap<String, String>,
    queues: HashMap<String, QueueEntry>,
    channel_failure: Option<String>,
    // Close feeds of channels closed by the client. lapin keeps the error
    // handler registered after a normal close, so these never fire or hang up.
    retired_notifiers: Vec<mpsc::UnboundedSender<LapinError>>,
}

impl BrokerState {
    /// Drops a channel and everything that lived on it.
    fn release_channel(&mut self, channel: u16) -> Option<ChannelEntry> {
        let entry = self.channels.remove(&channel)?;
        entry.open.store(false, Ordering::SeqCst);

        self.queues.retain(|_, queue| {
            let before = queue.consumers.len();
            queue.consumers.retain(|consumer| consumer.channel != channel);
            let lost_last_consumer = before > 0 && queue.consumers.is_empty();
            !(queue.auto_delete && lost_last_consumer)
        });
        Some(entry)
    }

    fn open_channels_on(&self, connection: u32) -> usize {
        self.channels
            .values()
            .filter(|entry| entry.connection == connection)
            .count()
    }

    fn check_owner(&self, queue: &str, connection: u32) -> Result<(), LapinError> {
        match self.queues.get(queue) {
            Some(QueueEntry { owner: Some(owner), .. }) if *owner != connection => Err(broker_error(
                &format!(
                    "RESOURCE_LOCKED - cannot obtain exclusive access to locked queue '{}'",
                    queue
                ),
            )),
            _ => Ok(()),
        }
    }
}

pub struct MockBroker {
    pub dial_count: AtomicUsize,
    channel_max: u16,
    state: Mutex<BrokerState>,
}

impl MockBroker {
    pub fn new() -> Arc<Self> {
        Self::with_channel_max(2047)
    }

    pub fn with_channel_max(channel_max: u16) -> Arc<Self> {
        Arc::new(MockBroker {
            dial_count: AtomicUsize::new(0),
            channel_max,
            state: Mutex::new(BrokerState::default()),
        })
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The next `create_channel` on any connection fails with `text`.
    pub fn fail_next_channel(&self, text: &str) {
        self.state().channel_failure = Some(text.to_string());
    }

    pub fn open_channels(&self) -> usize {
        self.state().channels.len()
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.state().queues.contains_key(queue)
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map_or(0, |queue| queue.consumers.len())
    }

    pub fn exchange_count(&self) -> usize {
        self.state().exchanges.len()
    }

    /// Simulates a channel exception raised by the broker.
    pub fn close_channel_from_broker(&self, channel: u16, text: &str) {
        self.fail_channel(channel, text);
    }

    fn fail_channel(&self, channel: u16, text: &str) -> LapinError {
        let mut state = self.state();
        if let Some(entry) = state.release_channel(channel) {
            if let Some(notifier) = entry.notifier {
                let _ = notifier.send(broker_error(text));
            }
        }
        broker_error(text)
    }

    fn drop_connection(&self, connection: u32) {
        let mut state = self.state();
        let channels: Vec<u16> = state
            .channels
            .iter()
            .filter(|(_, entry)| entry.connection == connection)
            .map(|(id, _)| *id)
            .collect();
        for channel in channels {
            state.release_channel(channel);
        }
        state.queues.retain(|_, queue| queue.owner != Some(connection));
    }
}

/// Dialer whose connections live on a shared `MockBroker`.
pub struct MockDialer {
    broker: Arc<MockBroker>,
    refuse: bool,
}

impl MockDialer {
    pub fn new(broker: &Arc<MockBroker>) -> Self {
        MockDialer {
            broker: Arc::clone(broker),
            refuse: false,
        }
    }

    pub fn refusing(mut self) -> Self {
        self.refuse = true;
        self
    }
}

#[async_trait]
impl Dialer for MockDialer {
    type Connection = MockConnection;

    async fn dial(&self) -> Result<MockConnection, LapinError> {
        self.broker.dial_count.fetch_add(1, Ordering::SeqCst);
        if self.refuse {
            return Err(broker_error("Connection refused (os error 111)"));
        }

        let id = {
            let mut state = self.broker.state();
            state.next_connection += 1;
            state.next_connection
        };
        Ok(MockConnection {
            id,
            broker: Arc::clone(&self.broker),
            open: AtomicBool::new(true),
            close_calls: AtomicUsize::new(0),
        })
    }

    fn endpoint(&self) -> String {
        "amqp://mock:5672/%2f".to_string()
    }
}

pub struct MockConnection {
    id: u32,
    broker: Arc<MockBroker>,
    open: AtomicBool,
    close_calls: AtomicUsize,
}

impl MockConnection {
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AmqpConnection for MockConnection {
    type Channel = MockChannel;

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn create_channel(&self) -> Result<MockChannel, LapinError> {
        if !self.is_open() {
            return Err(broker_error("connection is closed"));
        }

        let mut state = self.broker.state();
        if let Some(text) = state.channel_failure.take() {
            return Err(broker_error(&text));
        }
        if state.open_channels_on(self.id) >= usize::from(self.broker.channel_max) {
            return Err(LapinError::ChannelsLimitReached);
        }

        state.next_channel += 1;
        let id = state.next_channel;
        let open = Arc::new(AtomicBool::new(true));
        state.channels.insert(
            id,
            ChannelEntry {
                connection: self.id,
                open: Arc::clone(&open),
                notifier: None,
            },
        );

        Ok(MockChannel {
            id,
            connection: self.id,
            broker: Arc::clone(&self.broker),
            open,
            close_calls: Arc::new(AtomicUsize::new(0)),
        })
    }

    async fn close(&self) -> Result<(), LapinError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
        self.broker.drop_connection(self.id);
        Ok(())
    }
}

#[derive(Clone)]
pub struct MockChannel {
    id: u16,
    connection: u32,
    broker: Arc<MockBroker>,
    open: Arc<AtomicBool>,
    close_calls: Arc<AtomicUsize>,
}

impl MockChannel {
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), LapinError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(broker_error("invalid channel state: Closed"))
        }
    }
}

#[async_trait]
impl AmqpChannel for MockChannel {
    fn id(&self) -> u16 {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close_notifications(&self) -> mpsc::UnboundedReceiver<LapinError> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(entry) = self.broker.state().channels.get_mut(&self.id) {
            entry.notifier = Some(tx);
        }
        rx
    }

    async fn close(&self) -> Result<(), LapinError> {
        self.ensure_open()?;
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.broker.state();
        if let Some(notifier) = state.release_channel(self.id).and_then(|entry| entry.notifier) {
            state.retired_notifiers.push(notifier);
        }
        Ok(())
    }

    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
    ) -> Result<String, LapinError> {
        self.ensure_open()?;
        let name = if queue.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            queue.to_string()
        };

        let conflict = self.broker.state().check_owner(&name, self.connection);
        if let Err(err) = conflict {
            return Err(self.broker.fail_channel(self.id, &err.to_string()));
        }

        let owner = options.exclusive.then_some(self.connection);
        self.broker
            .state()
            .queues
            .entry(name.clone())
            .or_insert_with(|| QueueEntry {
                owner,
                auto_delete: options.auto_delete,
                bindings: HashSet::new(),
                consumers: Vec::new(),
                ready: VecDeque::new(),
            });
        Ok(name)
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), LapinError> {
        self.ensure_open()?;
        let failure = {
            let mut state = self.broker.state();
            if let Err(err) = state.check_owner(queue, self.connection) {
                Some(err.to_string())
            } else if !state.exchanges.contains_key(exchange) {
                Some(format!("NOT_FOUND - no exchange '{}' in vhost '/'", exchange))
            } else if let Some(entry) = state.queues.get_mut(queue) {
                entry
                    .bindings
                    .insert((exchange.to_string(), routing_key.to_string()));
                None
            } else {
                Some(format!("NOT_FOUND - no queue '{}' in vhost '/'", queue))
            }
        };

        match failure {
            Some(text) => Err(self.broker.fail_channel(self.id, &text)),
            None => Ok(()),
        }
    }

    async fn basic_consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
        options: BasicConsumeOptions,
    ) -> Result<DeliveryStream, LapinError> {
        self.ensure_open()?;
        let (sender, receiver) = delivery_mpsc::unbounded();
        let failure = {
            let mut state = self.broker.state();
            if let Err(err) = state.check_owner(queue, self.connection) {
                Some(err.to_string())
            } else if let Some(entry) = state.queues.get_mut(queue) {
                let held_exclusively = entry.consumers.iter().any(|consumer| consumer.exclusive);
                if held_exclusively || (options.exclusive && !entry.consumers.is_empty()) {
                    Some(format!(
                        "ACCESS_REFUSED - queue '{}' in vhost '/' in exclusive use",
                        queue
                    ))
                } else {
                    for delivery in entry.ready.drain(..) {
                        let _ = sender.unbounded_send(Ok(delivery));
                    }
                    entry.consumers.push(ConsumerEntry {
                        channel: self.id,
                        exclusive: options.exclusive,
                        sender,
                    });
                    None
                }
            } else {
                Some(format!("NOT_FOUND - no queue '{}' in vhost '/'", queue))
            }
        };

        match failure {
            Some(text) => Err(self.broker.fail_channel(self.id, &text)),
            None => Ok(receiver.boxed()),
        }
    }

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        _options: ExchangeDeclareOptions,
    ) -> Result<(), LapinError> {
        self.ensure_open()?;
        let kind = format!("{:?}", kind);
        let failure = {
            let mut state = self.broker.state();
            match state.exchanges.get(exchange) {
                Some(existing) if *existing != kind => Some(format!(
                    "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{}'",
                    exchange
                )),
                Some(_) => None,
                None => {
                    state.exchanges.insert(exchange.to_string(), kind);
                    None
                }
            }
        };

        match failure {
            Some(text) => Err(self.broker.fail_channel(self.id, &text)),
            None => Ok(()),
        }
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        _options: BasicPublishOptions,
        message: &Publishing,
    ) -> Result<(), LapinError> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        if !exchange.is_empty() && !state.exchanges.contains_key(exchange) {
            drop(state);
            return Err(self.broker.fail_channel(
                self.id,
                &format!("NOT_FOUND - no exchange '{}' in vhost '/'", exchange),
            ));
        }

        let targets: Vec<String> = state
            .queues
            .iter()
            .filter(|(name, queue)| {
                if exchange.is_empty() {
                    name.as_str() == routing_key
                } else {
                    queue
                        .bindings
                        .iter()
                        .any(|(bound, pattern)| {
                            bound == exchange && topic_matches(pattern, routing_key)
                        })
                }
            })
            .map(|(name, _)| name.clone())
            .collect();

        for name in targets {
            state.next_delivery_tag += 1;
            let delivery = Delivery {
                delivery_tag: state.next_delivery_tag,
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                redelivered: false,
                data: message.body.clone(),
            };
            if let Some(queue) = state.queues.get_mut(&name) {
                match queue.consumers.first() {
                    Some(consumer) => {
                        let _ = consumer.sender.unbounded_send(Ok(delivery));
                    }
                    None => queue.ready.push_back(delivery),
                }
            }
        }
        Ok(())
    }
}

/// AMQP topic matching: `*` is one word, `#` is zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(word), Some(part)) if word == part => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("test-key", "test-key"));
        assert!(topic_matches("orders.*", "orders.created"));
        assert!(!topic_matches("orders.*", "orders.created.eu"));
        assert!(topic_matches("orders.#", "orders.created.eu"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(!topic_matches("test-key", "other-key"));
    }
}
