// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Initialization
//!
//! Declares the configured exchanges, their queues and bindings on a freshly
//! created channel, then applies the channel prefetch. Declarations are
//! idempotent at the broker, so the whole pass is simply replayed on every
//! new channel.

use crate::{
    config::ComponentConfig,
    errors::AmqpError,
    exchange::{ExchangeKind, ExchangeOptions, ExchangeSpec},
    queue::{QueueOptions, RoutingKey},
    transport::AmqpChannel,
};
use tracing::debug;

pub struct TopologyInitializer<'tp> {
    config: &'tp ComponentConfig,
}

impl<'tp> TopologyInitializer<'tp> {
    pub fn new(config: &'tp ComponentConfig) -> TopologyInitializer<'tp> {
        TopologyInitializer { config }
    }

    /// Installs every configured exchange with its queue bindings, then sets
    /// the channel prefetch.
    pub async fn install(&self, channel: &dyn AmqpChannel) -> Result<(), AmqpError> {
        for exchange in &self.config.exchanges {
            self.install_exchange(channel, exchange).await?;
        }

        debug!(prefetch = self.config.prefetch_count, "configuring qos");
        channel.basic_qos(self.config.prefetch_count).await
    }

    async fn install_exchange(&self, channel: &dyn AmqpChannel, exchange: &ExchangeSpec) -> Result<(), AmqpError> {
        let kind = exchange
            .kind
            .as_ref()
            .unwrap_or(&self.config.default_exchange_type);
        self.declare_exchange(channel, &exchange.name, kind, &exchange.options)
            .await?;

        for binding in &exchange.queues {
            self.declare_queue_binding(
                channel,
                &exchange.name,
                &binding.routing_key,
                &binding.queue,
                &binding.queue_options,
            )
            .await?;
        }

        Ok(())
    }

    /// Declares `name` with the default exchange options overridden by `overrides`.
    pub async fn declare_exchange(
        &self,
        channel: &dyn AmqpChannel,
        name: &str,
        kind: &ExchangeKind,
        overrides: &ExchangeOptions,
    ) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", name);
        let options = self.config.default_exchange_options.merge(overrides);
        channel.exchange_declare(name, kind, &options).await?;
        debug!("exchange: {} was created", name);
        Ok(())
    }

    /// Declares `queue` (broker-named when empty) with the default queue
    /// options overridden by `overrides` and binds it to `exchange` once per
    /// routing key. Returns the declared queue name.
    pub async fn declare_queue_binding(
        &self,
        channel: &dyn AmqpChannel,
        exchange: &str,
        routing_key: &RoutingKey,
        queue: &str,
        overrides: &QueueOptions,
    ) -> Result<String, AmqpError> {
        let name = self.declare_queue(channel, queue, overrides).await?;

        for key in routing_key.keys() {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                name, exchange, key
            );
            channel.queue_bind(&name, exchange, key).await?;
        }

        Ok(name)
    }

    /// Declares `queue` with the default queue options overridden by `overrides`.
    pub async fn declare_queue(
        &self,
        channel: &dyn AmqpChannel,
        queue: &str,
        overrides: &QueueOptions,
    ) -> Result<String, AmqpError> {
        debug!("creating queue: {}", queue);
        let options = self.config.default_queue_options.merge(overrides);
        let name = channel.queue_declare(queue, &options).await?;
        debug!("queue: {} was created", name);
        Ok(name)
    }
}
