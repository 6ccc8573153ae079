// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Queue declare-options, routing keys and the queue bindings nested under a
//! configured exchange.

use crate::error_behavior::ErrorBehavior;
use lapin::types::{AMQPValue, FieldTable, LongInt, LongString, ShortString};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the header field used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Queue declare-options.
///
/// Like [`crate::exchange::ExchangeOptions`], every field is optional: the
/// component defaults and each per-queue override share this shape and are
/// layered with [`QueueOptions::merge`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueOptions {
    pub durable: Option<bool>,
    pub auto_delete: Option<bool>,
    pub exclusive: Option<bool>,
    pub passive: Option<bool>,
    /// Message TTL in milliseconds
    pub message_ttl: Option<i32>,
    pub max_length: Option<i32>,
    pub max_length_bytes: Option<i32>,
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
}

impl QueueOptions {
    /// Shorthand for options that only set durability.
    pub fn durable(durable: bool) -> QueueOptions {
        QueueOptions {
            durable: Some(durable),
            ..QueueOptions::default()
        }
    }

    /// Returns `self` with every field set in `overrides` replaced.
    pub fn merge(&self, overrides: &QueueOptions) -> QueueOptions {
        QueueOptions {
            durable: overrides.durable.or(self.durable),
            auto_delete: overrides.auto_delete.or(self.auto_delete),
            exclusive: overrides.exclusive.or(self.exclusive),
            passive: overrides.passive.or(self.passive),
            message_ttl: overrides.message_ttl.or(self.message_ttl),
            max_length: overrides.max_length.or(self.max_length),
            max_length_bytes: overrides.max_length_bytes.or(self.max_length_bytes),
            dead_letter_exchange: overrides
                .dead_letter_exchange
                .clone()
                .or_else(|| self.dead_letter_exchange.clone()),
            dead_letter_routing_key: overrides
                .dead_letter_routing_key
                .clone()
                .or_else(|| self.dead_letter_routing_key.clone()),
        }
    }

    pub(crate) fn declare_options(&self) -> lapin::options::QueueDeclareOptions {
        lapin::options::QueueDeclareOptions {
            passive: self.passive.unwrap_or(false),
            durable: self.durable.unwrap_or(false),
            exclusive: self.exclusive.unwrap_or(false),
            auto_delete: self.auto_delete.unwrap_or(false),
            nowait: false,
        }
    }

    pub(crate) fn arguments(&self) -> FieldTable {
        let mut args = BTreeMap::<ShortString, AMQPValue>::new();

        let ints = [
            (AMQP_HEADERS_MESSAGE_TTL, self.message_ttl),
            (AMQP_HEADERS_MAX_LENGTH, self.max_length),
            (AMQP_HEADERS_MAX_LENGTH_BYTES, self.max_length_bytes),
        ];
        for (key, value) in ints {
            if let Some(value) = value {
                args.insert(
                    ShortString::from(key),
                    AMQPValue::LongInt(LongInt::from(value)),
                );
            }
        }

        let strings = [
            (AMQP_HEADERS_DEAD_LETTER_EXCHANGE, &self.dead_letter_exchange),
            (
                AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY,
                &self.dead_letter_routing_key,
            ),
        ];
        for (key, value) in strings {
            if let Some(value) = value {
                args.insert(
                    ShortString::from(key),
                    AMQPValue::LongString(LongString::from(value.as_str())),
                );
            }
        }

        FieldTable::from(args)
    }
}

/// One routing key or several.
///
/// Bindings and publishes iterate [`RoutingKey::keys`] in input order without
/// removing duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum RoutingKey {
    One(String),
    Many(Vec<String>),
}

impl RoutingKey {
    pub fn keys(&self) -> Vec<&str> {
        match self {
            RoutingKey::One(key) => vec![key.as_str()],
            RoutingKey::Many(keys) => keys.iter().map(String::as_str).collect(),
        }
    }
}

impl Default for RoutingKey {
    fn default() -> Self {
        RoutingKey::One(String::new())
    }
}

impl From<&str> for RoutingKey {
    fn from(key: &str) -> Self {
        RoutingKey::One(key.to_owned())
    }
}

impl From<String> for RoutingKey {
    fn from(key: String) -> Self {
        RoutingKey::One(key)
    }
}

impl From<Vec<String>> for RoutingKey {
    fn from(keys: Vec<String>) -> Self {
        RoutingKey::Many(keys)
    }
}

impl From<Vec<&str>> for RoutingKey {
    fn from(keys: Vec<&str>) -> Self {
        RoutingKey::Many(keys.into_iter().map(str::to_owned).collect())
    }
}

impl<const N: usize> From<[&str; N]> for RoutingKey {
    fn from(keys: [&str; N]) -> Self {
        RoutingKey::Many(keys.iter().map(|k| (*k).to_owned()).collect())
    }
}

/// A queue declared and bound under a configured exchange.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueBindingSpec {
    pub routing_key: RoutingKey,
    /// Empty asks the broker to generate a name.
    pub queue: String,
    pub queue_options: QueueOptions,
    /// Error behavior for subscriptions consuming this queue that set none.
    pub error_behavior: Option<ErrorBehavior>,
    pub allow_non_json_messages: bool,
}

impl QueueBindingSpec {
    pub fn new(queue: &str, routing_key: impl Into<RoutingKey>) -> QueueBindingSpec {
        QueueBindingSpec {
            routing_key: routing_key.into(),
            queue: queue.to_owned(),
            ..QueueBindingSpec::default()
        }
    }

    pub fn queue_options(mut self, options: QueueOptions) -> Self {
        self.queue_options = options;
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
