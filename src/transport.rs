// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Capability
//!
//! The broker session is consumed through these traits so that the connection
//! lifecycle, topology and dispatch logic never depend on a concrete client.
//! [`crate::channel`] implements them on top of `lapin`.

use crate::{
    config::ConnectionTarget,
    errors::AmqpError,
    exchange::{ExchangeKind, ExchangeOptions},
    queue::QueueOptions,
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::BasicProperties;
use std::sync::Arc;

/// Observer invoked when an established connection errors or is closed by
/// the broker.
pub type FailureListener = Box<dyn Fn(AmqpError) + Send + Sync>;

/// Stream of deliveries for one consumer. `None` means the broker handed
/// over no message, typically because it cancelled the consumer.
pub type DeliveryStream = BoxStream<'static, Option<InboundMessage>>;

/// A message delivered by the broker.
#[derive(Debug, Clone, Default)]
pub struct InboundMessage {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub data: Vec<u8>,
    pub properties: BasicProperties,
}

/// Opens sessions to the broker.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, target: &ConnectionTarget) -> Result<Arc<dyn AmqpConnection>, AmqpError>;
}

/// An established session to the broker.
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    fn is_live(&self) -> bool;

    /// Installs the failure observer, replacing any previous one.
    fn on_failure(&self, listener: FailureListener);

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A channel multiplexed over an [`AmqpConnection`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    fn is_live(&self) -> bool;

    async fn exchange_declare(
        &self,
        name: &str,
        kind: &ExchangeKind,
        options: &ExchangeOptions,
    ) -> Result<(), AmqpError>;

    /// Declares `name`, or a broker-named queue when `name` is empty, and
    /// returns the declared name.
    async fn queue_declare(&self, name: &str, options: &QueueOptions) -> Result<String, AmqpError>;

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), AmqpError>;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}
