// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod consumer;
mod otel;
mod timer;

#[cfg(test)]
mod testing;

pub mod channel;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error_behavior;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod publisher;
pub mod queue;
pub mod topology;
pub mod transport;
