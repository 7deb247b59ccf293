// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Subscriber Pipeline
//!
//! Pub/sub consumers have no retry bookkeeping. The payload is decoded like a worker's and
//! handed to the handler. Deliveries are settled only when the subscriber consumes with
//! acknowledgements: success acks, while an explicit nack and any failure are nacked back to
//! the broker, whose own requeue policy then applies.

use crate::{
    broker::BrokerChannel,
    consumer::panic_reason,
    dispatcher::Pipeline,
    errors::AmqpError,
    handler::{ConsumerHandler, ConsumerMessage},
    message::{Message, Outcome, Payload},
    otel,
    topology::SubscriberTopology,
};
use async_trait::async_trait;
use futures_util::FutureExt;
use opentelemetry::global;
use std::{panic::AssertUnwindSafe, sync::Arc};
use tracing::{debug, warn};

pub(crate) struct SubscriberPipeline {
    channel: Arc<dyn BrokerChannel>,
    topology: SubscriberTopology,
    handler: Arc<dyn ConsumerHandler>,
    encoding: String,
    no_ack: bool,
}

impl SubscriberPipeline {
    pub(crate) fn new(
        channel: Arc<dyn BrokerChannel>,
        topology: SubscriberTopology,
        handler: Arc<dyn ConsumerHandler>,
        encoding: String,
        no_ack: bool,
    ) -> SubscriberPipeline {
        SubscriberPipeline {
            channel,
            topology,
            handler,
            encoding,
            no_ack,
        }
    }

    async fn handle(&self, message: Message) -> Result<(), AmqpError> {
        let (ctx, mut span) = otel::new_span(
            &message.properties,
            &global::tracer("amqp subscriber"),
            &self.topology.routing_key,
        );

        let delivery_tag = message.delivery_tag;
        let verdict = match Payload::decode(&message.data, &message.properties, &self.encoding) {
            Err(err) => Err(err.to_string()),
            Ok(payload) => {
                let msg = ConsumerMessage {
                    queue: self.topology.queue.clone(),
                    payload,
                    raw: message,
                    channel: self.channel.clone(),
                };

                match AssertUnwindSafe(async { self.handler.exec(&ctx, &msg).await })
                    .catch_unwind()
                    .await
                {
                    Ok(Ok(outcome)) => Ok(outcome),
                    Ok(Err(err)) => Err(err.to_string()),
                    Err(panic) => Err(panic_reason(panic.as_ref())),
                }
            }
        };

        let result = match verdict {
            Ok(Outcome::Ack(_)) => self.settle(delivery_tag, true).await,
            Ok(Outcome::Nack) => self.settle(delivery_tag, false).await,
            Ok(outcome) => {
                debug!(
                    exchange = self.topology.exchange,
                    outcome = format!("{outcome:?}"),
                    "outcome left to the subscriber"
                );
                Ok(())
            }
            Err(error) => {
                warn!(
                    exchange = self.topology.exchange,
                    routing_key = self.topology.routing_key,
                    error,
                    "subscriber failure"
                );
                self.settle(delivery_tag, false).await
            }
        };

        otel::finish(&mut span, &result);
        result
    }

    /// Acks, or nacks with requeue. Nothing to do without acknowledgements.
    async fn settle(&self, delivery_tag: u64, ack: bool) -> Result<(), AmqpError> {
        if self.no_ack {
            return Ok(());
        }
        if ack {
            self.channel.ack(delivery_tag).await
        } else {
            self.channel.nack(delivery_tag, true).await
        }
    }
}

#[async_trait]
impl Pipeline for SubscriberPipeline {
    async fn process(&self, message: Message) -> Result<(), AmqpError> {
        self.handle(message).await
    }
}
