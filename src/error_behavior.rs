// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Handler Error Behaviors
//!
//! Maps a named [`ErrorBehavior`] to the error handler that settles a message
//! whose handler failed. The mapping is stateless; the only decision made
//! here is which handler applies to a given subscription.

use crate::{errors::AmqpError, transport::AmqpChannel, transport::InboundMessage};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, error};

/// Named default for settling messages whose handler failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorBehavior {
    /// Acknowledge the message, dropping the error.
    Ack,
    /// Reject the message without requeueing it.
    #[default]
    Nack,
    /// Reject the message and ask the broker to redeliver it.
    Requeue,
}

impl ErrorBehavior {
    pub fn disposition(self) -> Disposition {
        match self {
            ErrorBehavior::Ack => Disposition::Ack,
            ErrorBehavior::Nack => Disposition::Nack { requeue: false },
            ErrorBehavior::Requeue => Disposition::Nack { requeue: true },
        }
    }

    /// Returns the built-in error handler for this behavior.
    pub fn handler(self) -> Arc<dyn MessageErrorHandler> {
        match self {
            ErrorBehavior::Ack => Arc::new(AckErrorHandler),
            ErrorBehavior::Requeue => Arc::new(RequeueErrorHandler),
            ErrorBehavior::Nack => Arc::new(NackErrorHandler),
        }
    }
}

/// How a delivered message is settled on its channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Nack { requeue: bool },
}

impl Disposition {
    /// Sends the ack or nack for `delivery_tag` on `channel`.
    pub async fn apply(self, channel: &dyn AmqpChannel, delivery_tag: u64) -> Result<(), AmqpError> {
        match self {
            Disposition::Ack => channel.basic_ack(delivery_tag).await,
            Disposition::Nack { requeue } => channel.basic_nack(delivery_tag, requeue).await,
        }
    }
}

/// Called when processing of an incoming message fails.
#[async_trait]
pub trait MessageErrorHandler: Send + Sync {
    async fn handle(
        &self,
        channel: &dyn AmqpChannel,
        message: &InboundMessage,
        error: &AmqpError,
    ) -> Result<(), AmqpError>;
}

/// Acks the message which caused an error during processing.
pub struct AckErrorHandler;

#[async_trait]
impl MessageErrorHandler for AckErrorHandler {
    async fn handle(
        &self,
        channel: &dyn AmqpChannel,
        message: &InboundMessage,
        error: &AmqpError,
    ) -> Result<(), AmqpError> {
        debug!(error = error.to_string(), "acking failed message");
        Disposition::Ack.apply(channel, message.delivery_tag).await
    }
}

/// Nacks and requeues the message which caused an error during processing.
pub struct RequeueErrorHandler;

#[async_trait]
impl MessageErrorHandler for RequeueErrorHandler {
    async fn handle(
        &self,
        channel: &dyn AmqpChannel,
        message: &InboundMessage,
        error: &AmqpError,
    ) -> Result<(), AmqpError> {
        debug!(error = error.to_string(), "requeuing failed message");
        Disposition::Nack { requeue: true }
            .apply(channel, message.delivery_tag)
            .await
    }
}

/// Nacks, without requeue, the message which caused an error during processing.
pub struct NackErrorHandler;

#[async_trait]
impl MessageErrorHandler for NackErrorHandler {
    async fn handle(
        &self,
        channel: &dyn AmqpChannel,
        message: &InboundMessage,
        error: &AmqpError,
    ) -> Result<(), AmqpError> {
        error!(error = error.to_string(), "discarding failed message");
        Disposition::Nack { requeue: false }
            .apply(channel, message.delivery_tag)
            .await
    }
}

/// Picks the error handler for a subscription.
///
/// An explicit handler wins, then the subscription's named behavior, then the
/// component default. Without any of these the message is nacked.
pub fn resolve(
    handler: Option<&Arc<dyn MessageErrorHandler>>,
    behavior: Option<ErrorBehavior>,
    component_default: Option<ErrorBehavior>,
) -> Arc<dyn MessageErrorHandler> {
    if let Some(handler) = handler {
        return handler.clone();
    }

    behavior
        .or(component_default)
        .unwrap_or(ErrorBehavior::Nack)
        .handler()
}
