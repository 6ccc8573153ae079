// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker implementing the transport traits for unit tests.

use crate::{
    config::ConnectionTarget,
    errors::AmqpError,
    exchange::{ExchangeKind, ExchangeOptions},
    queue::QueueOptions,
    transport::{AmqpChannel, AmqpConnection, DeliveryStream, FailureListener, InboundMessage, Transport},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::BasicProperties;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

/// Lets spawned tasks run without advancing a paused clock.
pub(crate) async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Connect,
    ExchangeDeclare(String, ExchangeKind),
    QueueDeclare(String),
    QueueBind(String, String, String),
    Qos(u16),
    Publish(String, String, Vec<u8>),
    Consume(String),
    Ack(u64),
    Nack(u64, bool),
    CloseChannel,
    CloseConnection,
}

struct FakeConsumer {
    sender: UnboundedSender<Option<InboundMessage>>,
    channel_live: Arc<AtomicBool>,
    connection_live: Arc<AtomicBool>,
}

impl FakeConsumer {
    fn is_live(&self) -> bool {
        self.channel_live.load(Ordering::SeqCst) && self.connection_live.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct FakeQueue {
    options: QueueOptions,
    pending: VecDeque<InboundMessage>,
    consumers: Vec<FakeConsumer>,
}

#[derive(Default)]
struct BrokerData {
    calls: Vec<Call>,
    exchanges: HashMap<String, (ExchangeKind, ExchangeOptions)>,
    queues: HashMap<String, FakeQueue>,
    bindings: Vec<(String, String, String)>,
    failing_connects: usize,
    refuse_all: bool,
    connect_delay: Duration,
    close_delay: Duration,
    fail_closes: bool,
    fail_declares: HashSet<String>,
    next_tag: u64,
    next_queue: u64,
    connections: Vec<Arc<FakeConnection>>,
}

#[derive(Clone, Default)]
pub(crate) struct FakeBroker {
    data: Arc<Mutex<BrokerData>>,
}

impl FakeBroker {
    pub(crate) fn new() -> FakeBroker {
        init_tracing();
        FakeBroker::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerData> {
        self.data.lock().unwrap()
    }

    fn record(&self, call: Call) {
        self.lock().calls.push(call);
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub(crate) fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| pred(c)).count()
    }

    pub(crate) fn connects(&self) -> usize {
        self.count(|c| *c == Call::Connect)
    }

    /// Ack and nack calls, in order.
    pub(crate) fn settlements(&self) -> Vec<Call> {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c, Call::Ack(_) | Call::Nack(_, _)))
            .cloned()
            .collect()
    }

    pub(crate) fn fail_next_connects(&self, n: usize) {
        self.lock().failing_connects = n;
    }

    pub(crate) fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse_all = refuse;
    }

    pub(crate) fn set_connect_delay(&self, delay: Duration) {
        self.lock().connect_delay = delay;
    }

    pub(crate) fn set_close_delay(&self, delay: Duration) {
        self.lock().close_delay = delay;
    }

    pub(crate) fn fail_closes(&self) {
        self.lock().fail_closes = true;
    }

    pub(crate) fn fail_declares_of(&self, name: &str) {
        self.lock().fail_declares.insert(name.to_owned());
    }

    pub(crate) fn exchange_options(&self, name: &str) -> Option<ExchangeOptions> {
        self.lock().exchanges.get(name).map(|(_, o)| o.clone())
    }

    pub(crate) fn queue_options(&self, name: &str) -> Option<QueueOptions> {
        self.lock().queues.get(name).map(|q| q.options.clone())
    }

    /// (exchange, routing key) pairs bound to `queue`.
    pub(crate) fn bindings_for(&self, queue: &str) -> Vec<(String, String)> {
        self.lock()
            .bindings
            .iter()
            .filter(|(q, _, _)| q == queue)
            .map(|(_, e, k)| (e.clone(), k.clone()))
            .collect()
    }

    pub(crate) fn last_connection(&self) -> Arc<FakeConnection> {
        self.lock().connections.last().cloned().unwrap()
    }

    /// Channel on a standalone live connection.
    pub(crate) fn channel(&self) -> Arc<FakeChannel> {
        Arc::new(FakeChannel {
            broker: self.clone(),
            live: Arc::new(AtomicBool::new(true)),
            connection_live: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Publishes raw bytes as if another client had sent them.
    pub(crate) fn inject(&self, exchange: &str, routing_key: &str, payload: &[u8]) {
        self.route(exchange, routing_key, payload, BasicProperties::default());
    }

    /// Sends a null delivery to every consumer of `queue`.
    pub(crate) fn cancel_consumers(&self, queue: &str) {
        if let Some(q) = self.lock().queues.get_mut(queue) {
            for consumer in q.consumers.iter().filter(|c| c.is_live()) {
                let _ = consumer.sender.send(None);
            }
        }
    }

    /// Polls until `pred` holds on the recorded calls.
    pub(crate) async fn wait_for(&self, pred: impl Fn(&[Call]) -> bool) {
        for _ in 0..10_000 {
            if pred(&self.calls()) {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition not reached, calls: {:?}", self.calls());
    }

    fn route(&self, exchange: &str, routing_key: &str, payload: &[u8], properties: BasicProperties) {
        let mut data = self.lock();

        let targets: Vec<String> = if exchange.is_empty() {
            vec![routing_key.to_owned()]
        } else {
            let fanout = matches!(
                data.exchanges.get(exchange),
                Some((ExchangeKind::Fanout, _))
            );
            data.bindings
                .iter()
                .filter(|(_, e, pattern)| {
                    e == exchange && (fanout || topic_matches(pattern, routing_key))
                })
                .map(|(q, _, _)| q.clone())
                .collect()
        };

        for target in targets {
            data.next_tag += 1;
            let message = InboundMessage {
                delivery_tag: data.next_tag,
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                redelivered: false,
                data: payload.to_vec(),
                properties: properties.clone(),
            };

            let queue = data.queues.entry(target).or_default();
            // dropping the sender ends the stream of a consumer whose channel died
            queue.consumers.retain(|c| c.is_live() && !c.sender.is_closed());
            match queue.consumers.first() {
                Some(consumer) => {
                    let _ = consumer.sender.send(Some(message));
                }
                None => queue.pending.push_back(message),
            }
        }
    }
}

/// AMQP topic matching: `*` is one word, `#` is zero or more words.
fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}

#[async_trait]
impl Transport for FakeBroker {
    async fn connect(&self, _target: &ConnectionTarget) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        self.record(Call::Connect);

        let delay = self.lock().connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut data = self.lock();
        if data.refuse_all {
            return Err(AmqpError::ConnectionError("connection refused".into()));
        }
        if data.failing_connects > 0 {
            data.failing_connects -= 1;
            return Err(AmqpError::ConnectionError("connection refused".into()));
        }

        let connection = Arc::new(FakeConnection {
            broker: self.clone(),
            live: Arc::new(AtomicBool::new(true)),
            listener: Mutex::new(None),
        });
        data.connections.push(connection.clone());
        Ok(connection)
    }
}

pub(crate) struct FakeConnection {
    broker: FakeBroker,
    live: Arc<AtomicBool>,
    listener: Mutex<Option<FailureListener>>,
}

impl FakeConnection {
    /// Simulates the broker dropping the connection.
    pub(crate) fn drop_from_broker(&self) {
        self.live.store(false, Ordering::SeqCst);
        if let Some(listener) = self.listener.lock().unwrap().as_ref() {
            listener(AmqpError::ConnectionLost("closed by remote host".into()));
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AmqpConnection for FakeConnection {
    fn is_live(&self) -> bool {
        self.is_open()
    }

    fn on_failure(&self, listener: FailureListener) {
        *self.listener.lock().unwrap() = Some(listener);
    }

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        if !self.is_open() {
            return Err(AmqpError::ChannelError("connection closed".into()));
        }
        Ok(Arc::new(FakeChannel {
            broker: self.broker.clone(),
            live: Arc::new(AtomicBool::new(true)),
            connection_live: self.live.clone(),
        }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let (delay, fail) = {
            let data = self.broker.lock();
            (data.close_delay, data.fail_closes)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.live.store(false, Ordering::SeqCst);
        self.broker.record(Call::CloseConnection);
        if fail {
            return Err(AmqpError::CloseError("connection already closed".into()));
        }
        Ok(())
    }
}

pub(crate) struct FakeChannel {
    broker: FakeBroker,
    live: Arc<AtomicBool>,
    connection_live: Arc<AtomicBool>,
}

impl FakeChannel {
    fn ensure_live(&self) -> Result<(), AmqpError> {
        if self.is_live() {
            Ok(())
        } else {
            Err(AmqpError::ChannelError("channel closed".into()))
        }
    }
}

#[async_trait]
impl AmqpChannel for FakeChannel {
    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst) && self.connection_live.load(Ordering::SeqCst)
    }

    async fn exchange_declare(
        &self,
        name: &str,
        kind: &ExchangeKind,
        options: &ExchangeOptions,
    ) -> Result<(), AmqpError> {
        self.ensure_live()?;
        self.broker
            .record(Call::ExchangeDeclare(name.to_owned(), kind.clone()));
        let mut data = self.broker.lock();
        if data.fail_declares.contains(name) {
            return Err(AmqpError::DeclareExchangeError(name.to_owned()));
        }
        data.exchanges
            .insert(name.to_owned(), (kind.clone(), options.clone()));
        Ok(())
    }

    async fn queue_declare(&self, name: &str, options: &QueueOptions) -> Result<String, AmqpError> {
        self.ensure_live()?;
        self.broker.record(Call::QueueDeclare(name.to_owned()));
        let mut data = self.broker.lock();
        if data.fail_declares.contains(name) {
            return Err(AmqpError::DeclareQueueError(name.to_owned()));
        }

        let name = if name.is_empty() {
            data.next_queue += 1;
            format!("amq.gen-{}", data.next_queue)
        } else {
            name.to_owned()
        };
        data.queues.entry(name.clone()).or_default().options = options.clone();
        Ok(name)
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), AmqpError> {
        self.ensure_live()?;
        self.broker.record(Call::QueueBind(
            queue.to_owned(),
            exchange.to_owned(),
            routing_key.to_owned(),
        ));
        let binding = (queue.to_owned(), exchange.to_owned(), routing_key.to_owned());
        let mut data = self.broker.lock();
        if !data.bindings.contains(&binding) {
            data.bindings.push(binding);
        }
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.ensure_live()?;
        self.broker.record(Call::Qos(prefetch_count));
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        self.ensure_live()?;
        self.broker.record(Call::Publish(
            exchange.to_owned(),
            routing_key.to_owned(),
            payload.to_vec(),
        ));
        self.broker.route(exchange, routing_key, payload, properties);
        Ok(())
    }

    async fn basic_consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        self.ensure_live()?;
        self.broker.record(Call::Consume(queue.to_owned()));

        let (tx, rx) = unbounded_channel();
        {
            let mut data = self.broker.lock();
            let q = data.queues.entry(queue.to_owned()).or_default();
            while let Some(message) = q.pending.pop_front() {
                let _ = tx.send(Some(message));
            }
            q.consumers.push(FakeConsumer {
                sender: tx,
                channel_live: self.live.clone(),
                connection_live: self.connection_live.clone(),
            });
        }

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        })
        .boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.ensure_live()?;
        self.broker.record(Call::Ack(delivery_tag));
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.ensure_live()?;
        self.broker.record(Call::Nack(delivery_tag, requeue));
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let (delay, fail) = {
            let data = self.broker.lock();
            (data.close_delay, data.fail_closes)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.live.store(false, Ordering::SeqCst);
        self.broker.record(Call::CloseChannel);
        if fail {
            return Err(AmqpError::CloseError("channel already closed".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::topic_matches;

    #[test]
    fn topic_patterns() {
        assert!(topic_matches("order.created", "order.created"));
        assert!(topic_matches("order.*", "order.created"));
        assert!(!topic_matches("order.*", "order.created.eu"));
        assert!(topic_matches("order.#", "order.created.eu"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(!topic_matches("invoice.*", "order.created"));
    }
}
