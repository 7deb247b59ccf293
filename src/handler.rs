// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Handlers
//!
//! User code plugged into workers and subscribers implements [`ConsumerHandler`]. It receives
//! the decoded payload together with the raw delivery and the channel it arrived on, and
//! reports back an [`Outcome`].

use crate::{
    broker::BrokerChannel,
    errors::HandlerError,
    message::{Message, Outcome, Payload},
};
use async_trait::async_trait;
use lapin::BasicProperties;
use opentelemetry::Context;
use std::sync::Arc;

/// A delivery handed to a [`ConsumerHandler`].
pub struct ConsumerMessage {
    /// Queue the delivery was consumed from.
    pub queue: String,
    /// Body decoded with the message's content type and encoding.
    pub payload: Payload,
    /// The delivery as received.
    pub raw: Message,
    /// Channel the delivery arrived on. Handlers returning [`Outcome::Manual`] settle through it.
    pub channel: Arc<dyn BrokerChannel>,
}

impl ConsumerMessage {
    /// Properties of the delivery.
    pub fn properties(&self) -> &BasicProperties {
        &self.raw.properties
    }

    /// Tag to settle the delivery with when the handler returns [`Outcome::Manual`].
    pub fn delivery_tag(&self) -> u64 {
        self.raw.delivery_tag
    }

    /// Times the task was retried so far, `None` on the first attempt.
    pub fn retry_count(&self) -> Option<i64> {
        self.raw.retry_count()
    }
}

/// Trait for handling messages consumed from RabbitMQ.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    /// Processes one delivery.
    ///
    /// # Parameters
    /// * `ctx` - OpenTelemetry context extracted from the message headers
    /// * `msg` - The delivery with its decoded payload
    ///
    /// # Returns
    /// What to do with the delivery. An `Err` or a panic goes through the failure path of the
    /// pipeline, exactly like [`Outcome::Retry`]
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<Outcome, HandlerError>;
}
