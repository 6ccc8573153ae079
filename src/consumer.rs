// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Processing
//!
//! Turns one broker delivery into exactly one settlement: the payload is
//! decoded, handed to the subscription's handler and the outcome is acked,
//! nacked or routed through the subscription's error handler. Every delivery
//! runs inside an OpenTelemetry consumer span parented on the context carried
//! by the message headers.

use crate::{
    error_behavior::{Disposition, MessageErrorHandler},
    errors::AmqpError,
    handler::{HandlerReply, MessageHandler},
    otel,
    transport::{AmqpChannel, InboundMessage},
};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use serde_json::Value;
use std::{borrow::Cow, sync::Arc};
use tracing::{debug, error, warn};

/// What a subscription does with each of its deliveries.
pub(crate) struct ConsumerDefinition {
    pub(crate) handler: Arc<dyn MessageHandler>,
    pub(crate) error_handler: Arc<dyn MessageErrorHandler>,
    pub(crate) allow_non_json_messages: bool,
}

/// Processes a single delivery taken from `queue`.
///
/// A `None` delivery is reported and returned as [`AmqpError::NullMessage`]
/// without reaching the error handler, since there is nothing to settle.
/// Handler failures are settled by the error handler; only failures to
/// settle are returned.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    channel: &dyn AmqpChannel,
    def: &ConsumerDefinition,
    queue: &str,
    delivery: Option<InboundMessage>,
) -> Result<(), AmqpError> {
    let Some(message) = delivery else {
        error!(queue, "consumer received a null message");
        return Err(AmqpError::NullMessage);
    };

    let mut span = otel::consumer_span(&message.properties, tracer, queue);

    debug!(
        "received: {} - exchange: {} - tag: {}",
        message.routing_key, message.exchange, message.delivery_tag
    );

    let settled = match dispatch(def, &message).await {
        Ok(disposition) => {
            debug!(?disposition, "message processed");
            disposition.apply(channel, message.delivery_tag).await
        }
        Err(err) => {
            warn!(error = err.to_string(), "failure to process message");
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from(err.to_string()),
            });
            def.error_handler.handle(channel, &message, &err).await
        }
    };

    match settled {
        Ok(()) => {
            span.set_status(Status::Ok);
            Ok(())
        }
        Err(err) => {
            error!(error = err.to_string(), "error settling msg");
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("error to settle msg"),
            });
            Err(err)
        }
    }
}

async fn dispatch(def: &ConsumerDefinition, message: &InboundMessage) -> Result<Disposition, AmqpError> {
    let value = decode(&message.data, def.allow_non_json_messages)?;

    match def.handler.handle(value, message).await? {
        HandlerReply::Done => Ok(Disposition::Ack),
        HandlerReply::Nack(nack) => Ok(Disposition::Nack {
            requeue: nack.requeue,
        }),
        HandlerReply::Value(_) => Err(AmqpError::UnexpectedHandlerReturn),
    }
}

/// Parses a payload as JSON. When non-JSON payloads are allowed, a parse
/// failure yields `None` instead of an error.
pub(crate) fn decode(data: &[u8], allow_non_json: bool) -> Result<Option<Value>, AmqpError> {
    match serde_json::from_slice(data) {
        Ok(value) => Ok(Some(value)),
        Err(_) if allow_non_json => Ok(None),
        Err(err) => Err(AmqpError::ParsePayloadError(err.to_string())),
    }
}
