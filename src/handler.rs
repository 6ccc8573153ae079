// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! A handler receives the decoded JSON value of a delivery (absent when the
//! subscription tolerates non-JSON payloads and decoding failed) together with
//! the raw message. Returning [`HandlerReply::Done`] acknowledges the message
//! and [`HandlerReply::Nack`] rejects it; anything else is a contract
//! violation that is settled by the subscription's error handler.

use crate::{errors::HandlerError, transport::InboundMessage};
use async_trait::async_trait;
use serde_json::Value;
use std::{future::Future, marker::PhantomData, sync::Arc};

/// Negative-acknowledge directive returned by a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nack {
    pub requeue: bool,
}

impl Nack {
    pub fn requeue() -> Nack {
        Nack { requeue: true }
    }

    pub fn discard() -> Nack {
        Nack { requeue: false }
    }
}

/// What a handler hands back after processing a message.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerReply {
    /// Processing finished; the message is acknowledged.
    Done,
    /// The message is rejected without going through the error handler.
    Nack(Nack),
    /// Any other value. Always rejected as a contract violation; exists for
    /// handlers bridged from dynamically typed code.
    Value(Value),
}

impl From<()> for HandlerReply {
    fn from(_: ()) -> Self {
        HandlerReply::Done
    }
}

impl From<Nack> for HandlerReply {
    fn from(nack: Nack) -> Self {
        HandlerReply::Nack(nack)
    }
}

impl From<Option<Nack>> for HandlerReply {
    fn from(nack: Option<Nack>) -> Self {
        nack.map_or(HandlerReply::Done, HandlerReply::Nack)
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, value: Option<Value>, message: &InboundMessage) -> Result<HandlerReply, HandlerError>;
}

/// Adapts an async closure into a [`MessageHandler`].
pub struct FnHandler<F, Fut, R> {
    f: F,
    _marker: PhantomData<fn() -> (Fut, R)>,
}

/// Wraps `f` as a shareable handler.
///
/// ```ignore
/// let handler = handler_fn(|value, _msg| async move {
///     println!("{value:?}");
///     Ok::<_, HandlerError>(())
/// });
/// ```
pub fn handler_fn<F, Fut, R>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Option<Value>, InboundMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    R: Into<HandlerReply> + Send + 'static,
{
    Arc::new(FnHandler {
        f,
        _marker: PhantomData,
    })
}

#[async_trait]
impl<F, Fut, R> MessageHandler for FnHandler<F, Fut, R>
where
    F: Fn(Option<Value>, InboundMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    R: Into<HandlerReply> + Send + 'static,
{
    async fn handle(&self, value: Option<Value>, message: &InboundMessage) -> Result<HandlerReply, HandlerError> {
        (self.f)(value, message.clone()).await.map(Into::into)
    }
}
