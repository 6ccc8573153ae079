// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Types describing the exchanges a component declares at startup and the
//! declare-options merged from component defaults and per-exchange overrides.

use crate::queue::QueueBindingSpec;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Constant for the header field used to specify the delayed exchange type
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";
/// Constant for the argument naming an alternate exchange for unroutable messages
pub const AMQP_HEADERS_ALTERNATE_EXCHANGE: &str = "alternate-exchange";

/// Represents the types of exchanges available in RabbitMQ.
///
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
/// - XMessageDelayed: Extension for delayed message delivery (plugin required)
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Fanout,
    #[default]
    Topic,
    Headers,
    #[serde(rename = "x-delayed-message")]
    XMessageDelayed,
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::XMessageDelayed => {
                lapin::ExchangeKind::Custom("x-delayed-message".to_owned())
            }
        }
    }
}

/// Exchange declare-options.
///
/// Every field is optional so the same record serves as the component-wide
/// defaults and as a per-exchange override; [`ExchangeOptions::merge`] layers
/// the latter over the former.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExchangeOptions {
    pub durable: Option<bool>,
    pub auto_delete: Option<bool>,
    pub internal: Option<bool>,
    pub passive: Option<bool>,
    pub alternate_exchange: Option<String>,
    /// Inner routing type of an `x-delayed-message` exchange, e.g. `direct`.
    pub delayed_type: Option<String>,
}

impl ExchangeOptions {
    /// Returns `self` with every field set in `overrides` replaced.
    pub fn merge(&self, overrides: &ExchangeOptions) -> ExchangeOptions {
        ExchangeOptions {
            durable: overrides.durable.or(self.durable),
            auto_delete: overrides.auto_delete.or(self.auto_delete),
            internal: overrides.internal.or(self.internal),
            passive: overrides.passive.or(self.passive),
            alternate_exchange: overrides
                .alternate_exchange
                .clone()
                .or_else(|| self.alternate_exchange.clone()),
            delayed_type: overrides
                .delayed_type
                .clone()
                .or_else(|| self.delayed_type.clone()),
        }
    }

    pub(crate) fn declare_options(&self) -> lapin::options::ExchangeDeclareOptions {
        lapin::options::ExchangeDeclareOptions {
            passive: self.passive.unwrap_or(false),
            durable: self.durable.unwrap_or(false),
            auto_delete: self.auto_delete.unwrap_or(false),
            internal: self.internal.unwrap_or(false),
            nowait: false,
        }
    }

    pub(crate) fn arguments(&self) -> FieldTable {
        let mut args = BTreeMap::<ShortString, AMQPValue>::new();

        if let Some(alternate) = &self.alternate_exchange {
            args.insert(
                ShortString::from(AMQP_HEADERS_ALTERNATE_EXCHANGE),
                AMQPValue::LongString(LongString::from(alternate.as_str())),
            );
        }

        if let Some(delayed) = &self.delayed_type {
            args.insert(
                ShortString::from(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE),
                AMQPValue::LongString(LongString::from(delayed.as_str())),
            );
        }

        FieldTable::from(args)
    }
}

/// An exchange declared on every fresh channel, together with the queues
/// bound to it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExchangeSpec {
    pub name: String,
    /// Falls back to the component's default exchange type when absent.
    #[serde(rename = "type")]
    pub kind: Option<ExchangeKind>,
    pub options: ExchangeOptions,
    pub queues: Vec<QueueBindingSpec>,
}

impl ExchangeSpec {
    pub fn new(name: &str) -> ExchangeSpec {
        ExchangeSpec {
            name: name.to_owned(),
            ..ExchangeSpec::default()
        }
    }

    /// Sets the exchange type.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Sets the per-exchange option overrides.
    pub fn options(mut self, options: ExchangeOptions) -> Self {
        self.options = options;
        self
    }

    /// Creates a delayed exchange routing like `inner` once the delay elapses.
    ///
    /// This requires the x-delayed-message plugin to be installed on the RabbitMQ server.
    pub fn delayed(mut self, inner: &str) -> Self {
        self.kind = Some(ExchangeKind::XMessageDelayed);
        self.options.delayed_type = Some(inner.to_owned());
        self
    }

    /// Adds a queue bound to this exchange.
    pub fn queue(mut self, binding: QueueBindingSpec) -> Self {
        self.queues.push(binding);
        self
    }
}
