// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Boundary
//!
//! The protocol operations this crate relies on, expressed as traits so connection
//! supervision, channel bookkeeping and the consumer pipelines never depend on a concrete
//! client. [`crate::amqp::LapinBroker`] is the production implementation.

use crate::{
    config::SocketOptions,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::Message,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::BasicProperties;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Stream of deliveries produced by a consumer. It ends when the channel goes away.
pub type DeliveryStream = BoxStream<'static, Result<Message, AmqpError>>;

/// A freshly dialed connection plus the signal fired when the broker reports it lost.
pub struct BrokerLink {
    pub connection: Arc<dyn BrokerConnection>,
    /// Fires once with the reason the connection was lost. Dropped on a clean close.
    pub lost: oneshot::Receiver<AmqpError>,
}

/// Options used when registering a consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsumeOptions {
    /// Empty lets the layer generate `<target>.<uuid>`.
    pub consumer_tag: String,
    /// The broker considers deliveries settled as soon as they are sent.
    pub no_ack: bool,
    /// No other consumer may read the queue.
    pub exclusive: bool,
}

/// Entry point to the broker: dials connections.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self, url: &str, socket: &SocketOptions) -> Result<BrokerLink, AmqpError>;
}

/// An open broker connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// An open channel. Operations issued on one channel are observed in order.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn basic_qos(&self, prefetch: u16, global: bool) -> Result<(), AmqpError>;

    async fn confirm_select(&self) -> Result<(), AmqpError>;

    /// Declares the queue and returns its name (broker-generated when the definition has none).
    async fn assert_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError>;

    async fn assert_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    /// Publishes to `exchange`. An empty exchange sends straight to the queue named `routing_key`.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}
