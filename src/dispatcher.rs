// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! [`RabbitmqConsumer`] registers subscriptions on the consumer-side channel
//! owned by its [`ConnectionManager`]. Each subscription declares and binds
//! its queue, starts a broker consumer and feeds every delivery through
//! [`crate::consumer`].
//!
//! Subscriptions live for the lifetime of the consumer. Whenever the manager
//! creates a fresh channel (first use, or after a reconnect) the configured
//! topology is installed and every subscription registered so far is
//! replayed on it.

use crate::{
    channel::LapinTransport,
    config::ComponentConfig,
    connection::{ChannelSetup, ConnectionEvent, ConnectionManager, WeakConnectionManager},
    consumer::{consume, ConsumerDefinition},
    error_behavior::{self, ErrorBehavior, MessageErrorHandler},
    errors::AmqpError,
    exchange::{ExchangeKind, ExchangeOptions},
    handler::MessageHandler,
    publisher::{send_to_exchange, send_to_queue, Payload},
    queue::{QueueOptions, RoutingKey},
    topology::TopologyInitializer,
    transport::{AmqpChannel, DeliveryStream, Transport},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use opentelemetry::global;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use tokio::sync::broadcast;
use tracing::{debug, error};
use uuid::Uuid;

/// Topology and error handling of a subscription.
#[derive(Clone, Default)]
pub struct SubscriptionMetadata {
    pub exchange: String,
    pub routing_key: RoutingKey,
    /// Empty asks the broker to generate a name.
    pub queue: String,
    pub queue_options: QueueOptions,
    /// Settles messages whose handler failed; wins over `error_behavior`.
    pub error_handler: Option<Arc<dyn MessageErrorHandler>>,
    pub error_behavior: Option<ErrorBehavior>,
    pub allow_non_json_messages: bool,
}

impl SubscriptionMetadata {
    pub fn new(exchange: &str, routing_key: impl Into<RoutingKey>) -> SubscriptionMetadata {
        SubscriptionMetadata {
            exchange: exchange.to_owned(),
            routing_key: routing_key.into(),
            ..SubscriptionMetadata::default()
        }
    }

    pub fn queue(mut self, queue: &str) -> Self {
        self.queue = queue.to_owned();
        self
    }

    pub fn queue_options(mut self, options: QueueOptions) -> Self {
        self.queue_options = options;
        self
    }

    pub fn error_handler(mut self, handler: Arc<dyn MessageErrorHandler>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    pub fn error_behavior(mut self, behavior: ErrorBehavior) -> Self {
        self.error_behavior = Some(behavior);
        self
    }

    pub fn allow_non_json_messages(mut self) -> Self {
        self.allow_non_json_messages = true;
        self
    }
}

enum Source {
    /// Queue bound to an exchange under one or more routing keys.
    Binding {
        exchange: String,
        routing_key: RoutingKey,
        queue: String,
        queue_options: QueueOptions,
    },
    /// Named queue consumed directly.
    Queue {
        queue: String,
        prefetch: Option<u16>,
        durable: bool,
    },
    /// Exclusive broker-named queue receiving everything sent to an exchange.
    Exchange { exchange: String, kind: ExchangeKind },
}

struct Subscription {
    source: Source,
    definition: Arc<ConsumerDefinition>,
    // channel this subscription currently consumes on
    bound: Mutex<Option<Weak<dyn AmqpChannel>>>,
}

impl Subscription {
    fn new(source: Source, definition: ConsumerDefinition) -> Subscription {
        Subscription {
            source,
            definition: Arc::new(definition),
            bound: Mutex::new(None),
        }
    }

    /// Marks the subscription as started on `channel`. Returns `None` when it
    /// already was.
    fn claim(&self, channel: &Arc<dyn AmqpChannel>) -> Option<Claim> {
        let mut bound = self.bound.lock().unwrap_or_else(PoisonError::into_inner);
        let current = Arc::downgrade(channel);
        if bound.as_ref().is_some_and(|b| Weak::ptr_eq(b, &current)) {
            return None;
        }
        Some(Claim {
            previous: bound.replace(current),
        })
    }

    /// Undoes a failed claim on `channel`. A claim made since by another
    /// channel is left in place.
    fn release(&self, channel: &Arc<dyn AmqpChannel>, claim: Claim) {
        let mut bound = self.bound.lock().unwrap_or_else(PoisonError::into_inner);
        if bound
            .as_ref()
            .is_some_and(|b| Weak::ptr_eq(b, &Arc::downgrade(channel)))
        {
            *bound = claim.previous;
        }
    }

    /// Whether it consumes on a channel that is still open.
    fn is_active(&self) -> bool {
        self.bound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|channel| channel.is_live())
    }
}

struct Claim {
    previous: Option<Weak<dyn AmqpChannel>>,
}

/// Every subscription registered so far, replayed on each fresh channel.
struct SubscriptionRegistry {
    config: Arc<ComponentConfig>,
    subscriptions: Mutex<Vec<Arc<Subscription>>>,
    manager: OnceLock<WeakConnectionManager>,
}

impl SubscriptionRegistry {
    fn new(config: Arc<ComponentConfig>) -> SubscriptionRegistry {
        SubscriptionRegistry {
            config,
            subscriptions: Mutex::new(vec![]),
            manager: OnceLock::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<Subscription>>> {
        self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, subscription: Arc<Subscription>) {
        self.lock().push(subscription);
    }

    fn remove(&self, subscription: &Arc<Subscription>) {
        self.lock().retain(|s| !Arc::ptr_eq(s, subscription));
    }

    fn snapshot(&self) -> Vec<Arc<Subscription>> {
        self.lock().clone()
    }

    /// Drops a subscription whose registration failed, unless a channel setup
    /// started it on a live channel in the meantime. Returns whether it was
    /// dropped.
    fn forget_unless_active(&self, subscription: &Arc<Subscription>) -> bool {
        if subscription.is_active() {
            return false;
        }
        self.remove(subscription);
        true
    }

    /// Starts `subscription` on `channel` unless it already consumes there.
    async fn apply(&self, channel: &Arc<dyn AmqpChannel>, subscription: &Arc<Subscription>) -> Result<(), AmqpError> {
        let Some(claim) = subscription.claim(channel) else {
            return Ok(());
        };

        let result = self.start(channel, subscription).await;
        if result.is_err() {
            subscription.release(channel, claim);
        }
        result
    }

    async fn start(&self, channel: &Arc<dyn AmqpChannel>, subscription: &Subscription) -> Result<(), AmqpError> {
        let topology = TopologyInitializer::new(&self.config);

        let queue = match &subscription.source {
            Source::Binding {
                exchange,
                routing_key,
                queue,
                queue_options,
            } => {
                topology
                    .declare_queue_binding(&**channel, exchange, routing_key, queue, queue_options)
                    .await?
            }
            Source::Queue {
                queue,
                prefetch,
                durable,
            } => {
                let name = topology
                    .declare_queue(&**channel, queue, &QueueOptions::durable(*durable))
                    .await?;
                if let Some(prefetch) = prefetch {
                    channel.basic_qos(*prefetch).await?;
                }
                name
            }
            Source::Exchange { exchange, kind } => {
                let transient = ExchangeOptions {
                    durable: Some(false),
                    ..ExchangeOptions::default()
                };
                topology
                    .declare_exchange(&**channel, exchange, kind, &transient)
                    .await?;

                let exclusive = QueueOptions {
                    exclusive: Some(true),
                    ..QueueOptions::default()
                };
                topology
                    .declare_queue_binding(&**channel, exchange, &RoutingKey::default(), "", &exclusive)
                    .await?
            }
        };

        let consumer_tag = Uuid::new_v4().to_string();
        let deliveries = channel.basic_consume(&queue, &consumer_tag).await?;
        debug!(%queue, %consumer_tag, "consumer started");

        tokio::spawn(run_consumer(
            channel.clone(),
            subscription.definition.clone(),
            queue,
            deliveries,
            self.manager.get().cloned(),
        ));

        Ok(())
    }
}

#[async_trait]
impl ChannelSetup for SubscriptionRegistry {
    async fn on_channel_created(&self, channel: &Arc<dyn AmqpChannel>) -> Result<(), AmqpError> {
        TopologyInitializer::new(&self.config).install(&**channel).await?;

        let subscriptions = self.snapshot();
        debug!(count = subscriptions.len(), "replaying subscriptions");
        for subscription in &subscriptions {
            if let Err(err) = self.apply(channel, subscription).await {
                error!(error = err.to_string(), "failure to replay subscription, dropping it");
                self.remove(subscription);
                // the rest are replayed on the next channel
                if !channel.is_live() {
                    return Err(err);
                }
            }
        }

        Ok(())
    }
}

async fn run_consumer(
    channel: Arc<dyn AmqpChannel>,
    definition: Arc<ConsumerDefinition>,
    queue: String,
    mut deliveries: DeliveryStream,
    manager: Option<WeakConnectionManager>,
) {
    let tracer = global::tracer("amqp consumer");

    while let Some(delivery) = deliveries.next().await {
        if let Err(err) = consume(&tracer, &*channel, &definition, &queue, delivery).await {
            error!(error = err.to_string(), "error consume msg");
        }
    }

    debug!(%queue, "consumer stream ended");
    if let Some(manager) = manager.and_then(|m| m.upgrade()) {
        manager.request_recovery().await;
    }
}

/// Consumer side of the client.
///
/// Must be created inside a tokio runtime.
pub struct RabbitmqConsumer {
    config: Arc<ComponentConfig>,
    manager: ConnectionManager,
    registry: Arc<SubscriptionRegistry>,
}

impl RabbitmqConsumer {
    pub fn new(config: Arc<ComponentConfig>, transport: Arc<dyn Transport>) -> RabbitmqConsumer {
        let registry = Arc::new(SubscriptionRegistry::new(config.clone()));
        let manager = ConnectionManager::with_setup(config.clone(), transport, registry.clone());
        // set exactly once, right here
        let _ = registry.manager.set(manager.downgrade());

        RabbitmqConsumer {
            config,
            manager,
            registry,
        }
    }

    /// Creates a consumer talking to the configured broker through `lapin`.
    pub fn lapin(config: Arc<ComponentConfig>) -> RabbitmqConsumer {
        let transport = LapinTransport::new(&config.connection_name);
        Self::new(config, transport)
    }

    pub fn connection_manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Notifies after every successful reconnect, once all subscriptions
    /// were replayed.
    pub fn on_reconnected(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.manager.events()
    }

    /// Connects and installs the configured topology.
    pub async fn start(&self) -> Result<(), AmqpError> {
        self.manager.get_channel().await.map(|_| ())
    }

    /// Subscribes `handler` to the queue described by `metadata`.
    ///
    /// Error handling resolves, in order, to the metadata's handler, the
    /// metadata's behavior, the behavior configured for the same exchange and
    /// queue, then the component's default consumer behavior.
    pub async fn setup_subscriber_channel(
        &self,
        handler: Arc<dyn MessageHandler>,
        metadata: SubscriptionMetadata,
    ) -> Result<(), AmqpError> {
        let configured = self
            .config
            .exchanges
            .iter()
            .filter(|exchange| exchange.name == metadata.exchange)
            .flat_map(|exchange| exchange.queues.iter())
            .find(|binding| !metadata.queue.is_empty() && binding.queue == metadata.queue);

        let error_handler = error_behavior::resolve(
            metadata.error_handler.as_ref(),
            metadata
                .error_behavior
                .or(configured.and_then(|binding| binding.error_behavior)),
            Some(self.config.default_consumer_error_behavior),
        );
        let allow_non_json_messages =
            metadata.allow_non_json_messages || configured.is_some_and(|binding| binding.allow_non_json_messages);

        let source = Source::Binding {
            exchange: metadata.exchange,
            routing_key: metadata.routing_key,
            queue: metadata.queue,
            queue_options: metadata.queue_options,
        };

        self.register(source, handler, error_handler, allow_non_json_messages)
            .await
    }

    /// Consumes `queue` directly. `prefetch` overrides the channel prefetch
    /// when given.
    pub async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        prefetch: Option<u16>,
        durable: bool,
    ) -> Result<(), AmqpError> {
        let source = Source::Queue {
            queue: queue.to_owned(),
            prefetch,
            durable,
        };
        let error_handler = self.config.default_consumer_error_behavior.handler();

        self.register(source, handler, error_handler, false).await
    }

    /// Receives everything published to `exchange` on an exclusive queue.
    pub async fn subscribe(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), AmqpError> {
        let source = Source::Exchange {
            exchange: exchange.to_owned(),
            kind,
        };
        let error_handler = self.config.default_subscribe_error_behavior.handler();

        self.register(source, handler, error_handler, false).await
    }

    /// Sends `payload` to `queue` over the consumer's own channel.
    pub async fn produce(
        &self,
        queue: &str,
        payload: impl Into<Payload>,
        durable: bool,
        persistent: bool,
    ) -> Result<(), AmqpError> {
        let channel = self.manager.get_channel().await?;
        send_to_queue(&*channel, &self.config, queue, &payload.into(), durable, persistent).await
    }

    /// Declares `exchange` as a non-durable exchange of `kind` and publishes
    /// `payload` to it with an empty routing key, over the consumer's own
    /// channel. Counterpart of [`Self::subscribe`].
    pub async fn publish(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        payload: impl Into<Payload>,
    ) -> Result<(), AmqpError> {
        let channel = self.manager.get_channel().await?;
        send_to_exchange(&*channel, &self.config, exchange, &kind, &payload.into()).await
    }

    /// Closes the channel, then the connection. The consumer must not be
    /// used afterwards.
    pub async fn stop(&self) -> Result<(), AmqpError> {
        self.manager.stop().await
    }

    async fn register(
        &self,
        source: Source,
        handler: Arc<dyn MessageHandler>,
        error_handler: Arc<dyn MessageErrorHandler>,
        allow_non_json_messages: bool,
    ) -> Result<(), AmqpError> {
        let subscription = Arc::new(Subscription::new(
            source,
            ConsumerDefinition {
                handler,
                error_handler,
                allow_non_json_messages,
            },
        ));
        self.registry.push(subscription.clone());

        let result = match self.manager.acquire_channel().await {
            // a fresh channel already replayed every registered subscription
            Ok((_, true)) => Ok(()),
            Ok((channel, false)) => self.registry.apply(&channel, &subscription).await,
            Err(err) => Err(err),
        };

        if let Err(err) = &result {
            if !self.registry.forget_unless_active(&subscription) {
                debug!(error = err.to_string(), "subscription already started on a newer channel");
                return Ok(());
            }
            error!(error = err.to_string(), "failure to register subscription");
        }
        result
    }
}
