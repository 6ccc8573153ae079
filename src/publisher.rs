// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Producer
//!
//! [`RabbitmqProducer`] keeps its own connection and channel, separate from
//! the consumer side, and creates them lazily on the first send. Every send
//! re-arms an idle timer; once the producer has been quiet for
//! `producer.idleTimeoutMillis` the channel and then the connection are
//! closed, and the next send transparently opens a fresh pair.
//!
//! Outgoing messages carry a uuid message id and the current OpenTelemetry
//! context in their headers.

use crate::{
    channel::LapinTransport,
    config::ComponentConfig,
    errors::AmqpError,
    exchange::{ExchangeKind, ExchangeOptions},
    otel,
    queue::{QueueOptions, RoutingKey},
    timer::TimerSlot,
    topology::TopologyInitializer,
    transport::{AmqpChannel, AmqpConnection, FailureListener, Transport},
};
use lapin::{
    types::{FieldTable, ShortString},
    BasicProperties,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::{
    runtime::Handle,
    sync::{Mutex, Notify},
};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Body of an outgoing message.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Payload {
    /// Sent unchanged.
    Bytes(Vec<u8>),
    /// Serialized as JSON text.
    Json(Value),
    /// Zero-length body.
    #[default]
    Empty,
}

impl Payload {
    /// Serializes any value into a JSON payload.
    pub fn json<T: Serialize>(value: &T) -> Result<Payload, AmqpError> {
        serde_json::to_value(value)
            .map(Payload::from)
            .map_err(|err| AmqpError::SerializePayloadError(err.to_string()))
    }

    pub fn encode(&self) -> Result<Vec<u8>, AmqpError> {
        match self {
            Payload::Bytes(bytes) => Ok(bytes.clone()),
            Payload::Json(value) => {
                serde_json::to_vec(value).map_err(|err| AmqpError::SerializePayloadError(err.to_string()))
            }
            Payload::Empty => Ok(vec![]),
        }
    }

    fn is_json(&self) -> bool {
        matches!(self, Payload::Json(_))
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Payload::Bytes(bytes.to_vec())
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Payload::Empty,
            value => Payload::Json(value),
        }
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Json(Value::String(text.to_owned()))
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Json(Value::String(text))
    }
}

impl<T: Into<Payload>> From<Option<T>> for Payload {
    fn from(value: Option<T>) -> Self {
        value.map_or(Payload::Empty, Into::into)
    }
}

/// Per-message publish settings.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Ask the broker to store the message on disk.
    pub persistent: bool,
    /// Overrides the content type; JSON payloads default to `application/json`.
    pub content_type: Option<String>,
    pub message_type: Option<String>,
    pub correlation_id: Option<String>,
    pub headers: Option<FieldTable>,
}

fn properties(payload: &Payload, options: &PublishOptions) -> BasicProperties {
    let mut props = BasicProperties::default()
        .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        .with_headers(otel::inject_current(options.headers.as_ref()));

    let content_type = options
        .content_type
        .as_deref()
        .or(payload.is_json().then_some(JSON_CONTENT_TYPE));
    if let Some(content_type) = content_type {
        props = props.with_content_type(ShortString::from(content_type));
    }
    if let Some(kind) = &options.message_type {
        props = props.with_type(ShortString::from(kind.as_str()));
    }
    if let Some(id) = &options.correlation_id {
        props = props.with_correlation_id(ShortString::from(id.as_str()));
    }
    if options.persistent {
        props = props.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    }

    props
}

/// Declares `queue` and sends `payload` straight to it through the default
/// exchange.
pub(crate) async fn send_to_queue(
    channel: &dyn AmqpChannel,
    config: &ComponentConfig,
    queue: &str,
    payload: &Payload,
    durable: bool,
    persistent: bool,
) -> Result<(), AmqpError> {
    TopologyInitializer::new(config)
        .declare_queue(channel, queue, &QueueOptions::durable(durable))
        .await?;

    let body = payload.encode()?;
    let options = PublishOptions {
        persistent,
        ..PublishOptions::default()
    };

    debug!(queue, "sending message to queue");
    channel
        .basic_publish("", queue, &body, properties(payload, &options))
        .await
}

/// Declares a non-durable `exchange` of `kind` and publishes `payload` to it
/// with an empty routing key.
pub(crate) async fn send_to_exchange(
    channel: &dyn AmqpChannel,
    config: &ComponentConfig,
    exchange: &str,
    kind: &ExchangeKind,
    payload: &Payload,
) -> Result<(), AmqpError> {
    let transient = ExchangeOptions {
        durable: Some(false),
        ..ExchangeOptions::default()
    };
    TopologyInitializer::new(config)
        .declare_exchange(channel, exchange, kind, &transient)
        .await?;

    let body = payload.encode()?;

    debug!(exchange, "publishing message to exchange");
    channel
        .basic_publish(exchange, "", &body, properties(payload, &PublishOptions::default()))
        .await
}

#[derive(Default)]
struct Session {
    connection: Option<Arc<dyn AmqpConnection>>,
    channel: Option<Arc<dyn AmqpChannel>>,
    // set while an idle teardown is closing the handles it took
    closing: bool,
    generation: u64,
    // bumped by every send; an idle teardown armed before the latest send
    // leaves the session alone
    activity: u64,
    stopped: bool,
}

struct Inner {
    config: Arc<ComponentConfig>,
    transport: Arc<dyn Transport>,
    session: Mutex<Session>,
    teardown_done: Notify,
    idle_timer: TimerSlot,
    runtime: Handle,
}

/// Outbound side of the client with its own lazily created session.
///
/// Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct RabbitmqProducer {
    inner: Arc<Inner>,
}

impl RabbitmqProducer {
    pub fn new(config: Arc<ComponentConfig>, transport: Arc<dyn Transport>) -> RabbitmqProducer {
        let runtime = Handle::current();

        RabbitmqProducer {
            inner: Arc::new(Inner {
                config,
                transport,
                session: Mutex::new(Session::default()),
                teardown_done: Notify::new(),
                idle_timer: TimerSlot::new(runtime.clone()),
                runtime,
            }),
        }
    }

    /// Creates a producer talking to the configured broker through `lapin`.
    pub fn lapin(config: Arc<ComponentConfig>) -> RabbitmqProducer {
        let transport = LapinTransport::new(&config.connection_name);
        Self::new(config, transport)
    }

    /// Sends `payload` to `queue`, declaring the queue first.
    pub async fn produce(
        &self,
        queue: &str,
        payload: impl Into<Payload>,
        durable: bool,
        persistent: bool,
    ) -> Result<(), AmqpError> {
        let payload = payload.into();
        let channel = self.channel().await?;
        send_to_queue(&*channel, &self.inner.config, queue, &payload, durable, persistent).await
    }

    /// Publishes `payload` to `exchange` once per routing key, in order.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: impl Into<RoutingKey>,
        payload: impl Into<Payload>,
        options: PublishOptions,
    ) -> Result<(), AmqpError> {
        let routing_key = routing_key.into();
        let payload = payload.into();
        let body = payload.encode()?;
        let channel = self.channel().await?;

        for key in routing_key.keys() {
            debug!(exchange, key, "publishing message");
            channel
                .basic_publish(exchange, key, &body, properties(&payload, &options))
                .await?;
        }

        Ok(())
    }

    /// Whether a session is currently open.
    pub async fn is_connected(&self) -> bool {
        let session = self.inner.session.lock().await;
        session.connection.as_ref().is_some_and(|c| c.is_live())
    }

    /// Closes the session for good. Close failures are logged, not returned.
    pub async fn close(&self) {
        self.inner.idle_timer.cancel();

        loop {
            let finished = self.inner.teardown_done.notified();
            {
                let mut session = self.inner.session.lock().await;
                session.stopped = true;
                if !session.closing {
                    break;
                }
            }
            finished.await;
        }

        self.inner.teardown(None).await;
        debug!("producer closed");
    }

    async fn channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let (channel, activity) = loop {
            let finished = self.inner.teardown_done.notified();
            let mut session = self.inner.session.lock().await;

            if session.stopped {
                return Err(AmqpError::Stopped);
            }
            if session.closing {
                drop(session);
                finished.await;
                continue;
            }

            session.activity += 1;
            let activity = session.activity;
            break (self.inner.ensure_channel(&mut session).await?, activity);
        };

        self.inner.touch(activity);
        Ok(channel)
    }
}

impl Inner {
    async fn ensure_channel(self: &Arc<Self>, session: &mut Session) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let connection = match session.connection.clone().filter(|c| c.is_live()) {
            Some(connection) => connection,
            None => {
                session.channel = None;
                let connection = self
                    .transport
                    .connect(&self.config.connection)
                    .await
                    .inspect_err(|err| error!(error = err.to_string(), "failure to connect producer"))?;

                session.generation += 1;
                connection.on_failure(self.failure_listener(session.generation));
                session.connection = Some(connection.clone());
                debug!("producer connection created");
                connection
            }
        };

        if let Some(channel) = session.channel.as_ref().filter(|c| c.is_live()) {
            return Ok(channel.clone());
        }

        let channel = connection.create_channel().await?;
        session.channel = Some(channel.clone());
        debug!("producer channel created");
        Ok(channel)
    }

    fn failure_listener(self: &Arc<Self>, generation: u64) -> FailureListener {
        let weak = Arc::downgrade(self);
        let runtime = self.runtime.clone();

        Box::new(move |err| {
            if let Some(inner) = weak.upgrade() {
                runtime.spawn(async move {
                    let mut session = inner.session.lock().await;
                    if session.generation == generation && session.connection.is_some() {
                        warn!(error = err.to_string(), "producer connection lost");
                        session.connection = None;
                        session.channel = None;
                    }
                });
            }
        })
    }

    fn touch(self: &Arc<Self>, activity: u64) {
        let Some(after) = self.config.idle_timeout() else {
            return;
        };

        let weak = Arc::downgrade(self);
        self.idle_timer.arm(after, async move {
            if let Some(inner) = weak.upgrade() {
                inner.teardown(Some(activity)).await;
            }
        });
    }

    /// Closes the session. With `idle_since`, does nothing if a send happened
    /// after that activity mark.
    async fn teardown(&self, idle_since: Option<u64>) {
        let (channel, connection) = {
            let mut session = self.session.lock().await;
            if session.closing {
                return;
            }
            if let Some(activity) = idle_since {
                if session.activity != activity {
                    debug!("producer used again, keeping session");
                    return;
                }
                debug!("producer idle, closing session");
            }
            session.closing = true;
            (session.channel.take(), session.connection.take())
        };

        if let Some(channel) = channel {
            if let Err(err) = channel.close().await {
                warn!(error = err.to_string(), "failure to close producer channel");
            }
        }
        if let Some(connection) = connection {
            if let Err(err) = connection.close().await {
                warn!(error = err.to_string(), "failure to close producer connection");
            }
        }

        self.session.lock().await.closing = false;
        self.teardown_done.notify_waiters();
    }
}
