// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Worker Pipeline
//!
//! Runs a worker's handler on each delivery and settles it:
//!
//! - success acks, and mirrors the message to the done queue when one is configured
//! - an explicit nack hands the message back to the broker
//! - a rejection acks and forwards to the done/fail queue without retrying
//! - a failure (handler error, panic, retry request, undecodable payload) acks and republishes
//!   to the retry queue with a bumped `x-retry-count`, a growing expiration and a decaying
//!   priority until `max_count` is reached, then forwards to the done/fail queue
//!
//! When no retry queue, no done queue and no retry header exist the failure is left to the
//! broker with a requeueing nack, so its own redelivery and dead-letter policy applies.

use crate::{
    broker::BrokerChannel,
    config::RetryQueueConfigs,
    dispatcher::Pipeline,
    errors::AmqpError,
    handler::{ConsumerHandler, ConsumerMessage},
    message::{
        terminal_properties, Message, Outcome, OutcomeRecord, Payload, AMQP_HEADERS_DONE,
        AMQP_HEADERS_FAIL, AMQP_HEADERS_FAIL_ORIGINAL_PROPERTIES,
        AMQP_HEADERS_ORIGINAL_PROPERTIES, AMQP_HEADERS_RETRY_COUNT,
    },
    otel, retry,
    topology::WorkerTopology,
};
use async_trait::async_trait;
use futures_util::FutureExt;
use lapin::{
    types::{AMQPValue, LongLongInt, ShortString},
    BasicProperties,
};
use opentelemetry::{global, Context};
use serde_json::Value;
use std::{any::Any, panic::AssertUnwindSafe, sync::Arc};
use tracing::{debug, error, warn};

const GENERAL_FAILURE: &str = "General failure";

/// How a delivery was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    Nacked,
    /// The handler settles the delivery itself.
    Manual,
    /// Acked and published again for a later attempt.
    Republished {
        queue: String,
        retry_count: i64,
        expiration: Option<u64>,
        priority: u8,
    },
    /// Acked and forwarded to the done/fail queue.
    Forwarded { queue: String },
    /// Acked with nowhere left to send it.
    Dropped,
}

pub(crate) struct WorkerPipeline {
    channel: Arc<dyn BrokerChannel>,
    topology: WorkerTopology,
    retry: RetryQueueConfigs,
    handler: Arc<dyn ConsumerHandler>,
    encoding: String,
    no_ack: bool,
}

impl WorkerPipeline {
    pub(crate) fn new(
        channel: Arc<dyn BrokerChannel>,
        topology: WorkerTopology,
        retry: RetryQueueConfigs,
        handler: Arc<dyn ConsumerHandler>,
        encoding: String,
        no_ack: bool,
    ) -> WorkerPipeline {
        WorkerPipeline {
            channel,
            topology,
            retry,
            handler,
            encoding,
            no_ack,
        }
    }

    /// Runs the handler on `message` and settles the delivery.
    pub(crate) async fn handle(&self, message: Message) -> Result<Disposition, AmqpError> {
        let (ctx, mut span) = otel::new_span(
            &message.properties,
            &global::tracer("amqp worker"),
            &self.topology.queue,
        );

        debug!(
            queue = self.topology.queue,
            delivery_tag = message.delivery_tag,
            "task received"
        );

        let (message, verdict) = self.run(&ctx, message).await;

        let result = match verdict {
            Ok(Outcome::Ack(result)) => self.succeed(&message, result).await,
            Ok(Outcome::Nack) => self
                .settle_nack(&message)
                .await
                .map(|_| Disposition::Nacked),
            Ok(Outcome::Reject(reason)) => self.reject(&message, reason).await,
            Ok(Outcome::Retry(reason)) => self.fail(&message, reason).await,
            Ok(Outcome::Manual) => Ok(Disposition::Manual),
            Err(error) => self.fail(&message, error).await,
        };

        otel::finish(&mut span, &result);
        result
    }

    /// Decodes the payload and calls the handler. Every failure mode comes back as `Err`.
    async fn run(&self, ctx: &Context, message: Message) -> (Message, Result<Outcome, String>) {
        let fallback = self.encoding.as_str();
        let payload = match Payload::decode(&message.data, &message.properties, fallback) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(
                    queue = self.topology.queue,
                    error = err.to_string(),
                    "undecodable payload"
                );
                return (message, Err(err.to_string()));
            }
        };

        let msg = ConsumerMessage {
            queue: self.topology.queue.clone(),
            payload,
            raw: message,
            channel: self.channel.clone(),
        };

        let verdict = match AssertUnwindSafe(async { self.handler.exec(ctx, &msg).await })
            .catch_unwind()
            .await
        {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(err)) => Err(err.to_string()),
            Err(panic) => {
                let reason = panic_reason(panic.as_ref());
                error!(queue = self.topology.queue, reason, "handler panicked");
                Err(reason)
            }
        };

        (msg.raw, verdict)
    }

    async fn succeed(
        &self,
        message: &Message,
        result: Option<Value>,
    ) -> Result<Disposition, AmqpError> {
        self.settle_ack(message).await?;

        let Some(done) = &self.topology.done_queue else {
            return Ok(Disposition::Acked);
        };

        let record = OutcomeRecord {
            result,
            ..OutcomeRecord::default()
        };
        let properties = terminal_properties(
            &message.properties,
            AMQP_HEADERS_DONE,
            AMQP_HEADERS_ORIGINAL_PROPERTIES,
            &record,
        );
        self.channel
            .publish("", done, &message.data, properties)
            .await?;

        debug!(queue = self.topology.queue, done, "task done");
        Ok(Disposition::Forwarded {
            queue: done.clone(),
        })
    }

    async fn reject(
        &self,
        message: &Message,
        reason: Option<String>,
    ) -> Result<Disposition, AmqpError> {
        self.settle_ack(message).await?;

        let record = OutcomeRecord {
            reason: Some(GENERAL_FAILURE.to_owned()),
            error: reason,
            result: None,
        };
        self.forward_failure(message, record).await
    }

    async fn fail(&self, message: &Message, error: String) -> Result<Disposition, AmqpError> {
        let header = message.retry_count();

        if self.topology.retry_queue.is_none() && self.topology.done_queue.is_none() && header.is_none()
        {
            warn!(
                queue = self.topology.queue,
                error, "handler failure, nothing to retry with"
            );
            self.settle_nack(message).await?;
            return Ok(Disposition::Nacked);
        }

        self.settle_ack(message).await?;

        let retry_count = header.unwrap_or_default();
        if retry::should_retry(retry_count, self.retry.max_count) {
            return self.republish(message, retry_count, &error).await;
        }

        let record = OutcomeRecord {
            reason: Some(retry::exhausted_reason(retry_count, self.retry.max_count)),
            error: Some(error),
            result: None,
        };
        self.forward_failure(message, record).await
    }

    async fn republish(
        &self,
        message: &Message,
        retry_count: i64,
        error: &str,
    ) -> Result<Disposition, AmqpError> {
        let next = retry_count + 1;
        let mut headers = message.properties.headers().clone().unwrap_or_default();
        headers.insert(
            ShortString::from(AMQP_HEADERS_RETRY_COUNT),
            AMQPValue::LongLongInt(LongLongInt::from(next)),
        );

        let (queue, properties, expiration, priority) = match &self.topology.retry_queue {
            Some(retry_queue) => {
                let expiration = retry::next_expiration(
                    &self.retry,
                    retry_count,
                    message.death(),
                    message.expiration(),
                );
                let priority =
                    retry::priority(self.retry.max_priority, retry_count, self.retry.max_count);
                let properties = message
                    .properties
                    .clone()
                    .with_headers(headers)
                    .with_expiration(ShortString::from(expiration.to_string()))
                    .with_priority(priority);
                (retry_queue.clone(), properties, Some(expiration), priority)
            }
            None => {
                let properties = message
                    .properties
                    .clone()
                    .with_headers(headers)
                    .with_priority(0);
                (self.topology.queue.clone(), properties, None, 0)
            }
        };

        self.channel
            .publish("", &queue, &message.data, properties)
            .await?;

        warn!(
            queue = self.topology.queue,
            retry_queue = queue,
            retry_count = next,
            expiration,
            priority,
            error,
            "handler failure, task scheduled for retry"
        );

        Ok(Disposition::Republished {
            queue,
            retry_count: next,
            expiration,
            priority,
        })
    }

    async fn forward_failure(
        &self,
        message: &Message,
        record: OutcomeRecord,
    ) -> Result<Disposition, AmqpError> {
        let Some(done) = &self.topology.done_queue else {
            error!(
                queue = self.topology.queue,
                reason = record.reason.as_deref().unwrap_or_default(),
                error = record.error.as_deref().unwrap_or_default(),
                "task failed, no fail queue configured, dropping"
            );
            return Ok(Disposition::Dropped);
        };

        let properties = terminal_properties(
            &message.properties,
            AMQP_HEADERS_FAIL,
            AMQP_HEADERS_FAIL_ORIGINAL_PROPERTIES,
            &record,
        );
        self.channel
            .publish("", done, &message.data, properties)
            .await?;

        error!(
            queue = self.topology.queue,
            fail_queue = done,
            reason = record.reason.as_deref().unwrap_or_default(),
            "task failed"
        );
        Ok(Disposition::Forwarded {
            queue: done.clone(),
        })
    }

    async fn settle_ack(&self, message: &Message) -> Result<(), AmqpError> {
        if self.no_ack {
            return Ok(());
        }
        self.channel.ack(message.delivery_tag).await
    }

    /// Hands the delivery back to the broker.
    async fn settle_nack(&self, message: &Message) -> Result<(), AmqpError> {
        if self.no_ack {
            return Ok(());
        }
        self.channel.nack(message.delivery_tag, true).await
    }
}

#[async_trait]
impl Pipeline for WorkerPipeline {
    async fn process(&self, message: Message) -> Result<(), AmqpError> {
        self.handle(message).await.map(|_| ())
    }
}

pub(crate) fn panic_reason(panic: &(dyn Any + Send)) -> String {
    if let Some(reason) = panic.downcast_ref::<&str>() {
        (*reason).to_owned()
    } else if let Some(reason) = panic.downcast_ref::<String>() {
        reason.clone()
    } else {
        "handler panicked".to_owned()
    }
}
