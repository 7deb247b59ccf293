// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Worker
//!
//! Reliability layer over RabbitMQ: supervised named connections, a registry of named
//! channels, task workers with retry queues and a done/fail sink, pub/sub subscribers and
//! JSON publishing with trace propagation.
//!
//! ```no_run
//! use rabbitmq_worker::{
//!     config::RabbitMQConfigs, connection::ConnectionRequest, publisher::TaskOptions,
//!     RabbitMQClient,
//! };
//!
//! # async fn run() -> Result<(), rabbitmq_worker::errors::AmqpError> {
//! let client = RabbitMQClient::lapin(RabbitMQConfigs::from_env()?)?;
//! client.create_connection(ConnectionRequest::default()).await?;
//!
//! let ctx = opentelemetry::Context::current();
//! client
//!     .push_task(&ctx, "emails", &serde_json::json!({"to": "a@b.c"}), TaskOptions::default())
//!     .await?;
//!
//! client.close_connection().await
//! # }
//! ```

mod consumer;
mod otel;
mod registry;
mod subscriber;

#[cfg(test)]
mod testing;

pub mod amqp;
pub mod broker;
pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod message;
pub mod policy;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod topology;

pub use client::RabbitMQClient;
pub use consumer::Disposition;
pub use registry::ConnectionState;
