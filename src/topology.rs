// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Topology
//!
//! Declares what a worker or a subscriber needs before consuming.
//!
//! A worker owns up to three queues:
//! - the primary queue, shaped by the caller's [`QueueOptions`]
//! - the retry queue `<queue><retry suffix>`: durable, dead-lettering through the default
//!   exchange back to the primary queue, bounded by `max_length` and optionally prioritized
//! - the done/fail queue `<queue><done suffix>`: durable, bounded by `max_length`
//!
//! The three declarations are independent and run concurrently. A subscriber declares its
//! exchange, an anonymous queue, then binds them.

use crate::{
    broker::BrokerChannel,
    config::{DoneQueueConfigs, RetryQueueConfigs},
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeOptions},
    queue::{QueueBinding, QueueDefinition, QueueOptions},
};
use futures_util::future::try_join3;
use tracing::debug;

/// Queues asserted for one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerTopology {
    /// Primary queue the worker consumes.
    pub queue: String,
    /// Dead-letters back into `queue` once a retry expires.
    pub retry_queue: Option<String>,
    /// Sink of done and failed tasks.
    pub done_queue: Option<String>,
}

impl WorkerTopology {
    pub(crate) async fn install(
        channel: &dyn BrokerChannel,
        queue: &str,
        options: &QueueOptions,
        retry: &RetryQueueConfigs,
        done: &DoneQueueConfigs,
    ) -> Result<WorkerTopology, AmqpError> {
        let primary = QueueDefinition::new(queue).options(options);

        let retry_def = retry.queue_name(queue).map(|name| {
            QueueDefinition::new(&name)
                .durable()
                .dead_letter("", queue)
                .max_length(retry.max_length)
                .max_priority(retry.max_priority)
        });

        let done_def = done
            .queue_name(queue)
            .map(|name| QueueDefinition::new(&name).durable().max_length(done.max_length));

        let (queue, retry_queue, done_queue) = try_join3(
            channel.assert_queue(&primary),
            assert_optional(channel, retry_def.as_ref()),
            assert_optional(channel, done_def.as_ref()),
        )
        .await
        .map_err(AmqpError::topology)?;

        debug!(
            queue,
            retry_queue = retry_queue.as_deref().unwrap_or_default(),
            done_queue = done_queue.as_deref().unwrap_or_default(),
            "worker topology asserted"
        );

        Ok(WorkerTopology {
            queue,
            retry_queue,
            done_queue,
        })
    }
}

async fn assert_optional(
    channel: &dyn BrokerChannel,
    def: Option<&QueueDefinition>,
) -> Result<Option<String>, AmqpError> {
    match def {
        Some(def) => channel.assert_queue(def).await.map(Some),
        None => Ok(None),
    }
}

/// Exchange, anonymous queue and binding of one subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberTopology {
    pub exchange: String,
    /// Broker generated name of the subscriber's queue.
    pub queue: String,
    pub routing_key: String,
}

impl SubscriberTopology {
    /// Routing key of a subscription: `<exchange>.<topic>`, or `<exchange>.*` for every topic.
    pub fn routing_key(exchange: &str, topic: Option<&str>) -> String {
        format!("{}.{}", exchange, topic.unwrap_or("*"))
    }

    pub(crate) async fn install(
        channel: &dyn BrokerChannel,
        exchange: &str,
        topic: Option<&str>,
        exchange_options: &ExchangeOptions,
        queue_options: &QueueOptions,
    ) -> Result<SubscriberTopology, AmqpError> {
        let install = async {
            channel
                .assert_exchange(&ExchangeDefinition::new(exchange).options(exchange_options))
                .await?;

            let queue = channel
                .assert_queue(&QueueDefinition::new("").options(queue_options))
                .await?;

            let routing_key = SubscriberTopology::routing_key(exchange, topic);
            channel
                .bind_queue(&QueueBinding::new(&queue).exchange(exchange).routing_key(&routing_key))
                .await?;

            Ok(SubscriberTopology {
                exchange: exchange.to_owned(),
                queue,
                routing_key,
            })
        };

        let topology = install.await.map_err(AmqpError::topology)?;
        debug!(
            exchange,
            queue = topology.queue,
            routing_key = topology.routing_key,
            "subscriber topology asserted"
        );
        Ok(topology)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::MockBrokerChannel,
        queue::{AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY, AMQP_HEADERS_MAX_PRIORITY},
    };
    use lapin::types::{AMQPValue, LongString};
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn worker_asserts_primary_retry_and_done_queues() {
        let declared = Arc::new(Mutex::new(vec![]));
        let mut channel = MockBrokerChannel::new();
        let seen = declared.clone();
        channel.expect_assert_queue().times(3).returning(move |def| {
            seen.lock().unwrap().push(def.clone());
            Ok(def.name().to_owned())
        });

        let retry = RetryQueueConfigs {
            max_priority: 10,
            ..RetryQueueConfigs::default()
        };
        let done = DoneQueueConfigs {
            suffix: Some("_done".to_owned()),
            ..DoneQueueConfigs::default()
        };

        let topology =
            WorkerTopology::install(&channel, "jobs", &QueueOptions::default(), &retry, &done)
                .await
                .unwrap();

        assert_eq!(
            topology,
            WorkerTopology {
                queue: "jobs".to_owned(),
                retry_queue: Some("jobs_retry".to_owned()),
                done_queue: Some("jobs_done".to_owned()),
            }
        );

        let declared = declared.lock().unwrap();
        let retry_def = declared
            .iter()
            .find(|def| def.name() == "jobs_retry")
            .unwrap();
        let args = retry_def.arguments();
        assert_eq!(
            args.inner().get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            Some(&AMQPValue::LongString(LongString::from("jobs")))
        );
        assert!(args.inner().contains_key(AMQP_HEADERS_MAX_PRIORITY));
    }

    #[tokio::test]
    async fn disabled_queues_are_skipped() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_assert_queue()
            .times(1)
            .returning(|def| Ok(def.name().to_owned()));

        let retry = RetryQueueConfigs {
            suffix: None,
            ..RetryQueueConfigs::default()
        };

        let topology = WorkerTopology::install(
            &channel,
            "jobs",
            &QueueOptions::default(),
            &retry,
            &DoneQueueConfigs::default(),
        )
        .await
        .unwrap();

        assert_eq!(topology.retry_queue, None);
        assert_eq!(topology.done_queue, None);
    }

    #[tokio::test]
    async fn failures_surface_as_topology_errors() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_assert_queue()
            .returning(|def| Err(AmqpError::DeclareQueueError(def.name().to_owned())));

        let err = WorkerTopology::install(
            &channel,
            "jobs",
            &QueueOptions::default(),
            &RetryQueueConfigs::default(),
            &DoneQueueConfigs::default(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, AmqpError::TopologyError(_)));
    }

    #[tokio::test]
    async fn subscriber_binds_the_anonymous_queue() {
        let mut channel = MockBrokerChannel::new();
        channel.expect_assert_exchange().times(1).returning(|_| Ok(()));
        channel
            .expect_assert_queue()
            .withf(|def| def.name().is_empty())
            .times(1)
            .returning(|_| Ok("amq.gen-1".to_owned()));
        channel
            .expect_bind_queue()
            .withf(|binding| {
                *binding
                    == QueueBinding::new("amq.gen-1")
                        .exchange("events")
                        .routing_key("events.*")
            })
            .times(1)
            .returning(|_| Ok(()));

        let topology = SubscriberTopology::install(
            &channel,
            "events",
            None,
            &ExchangeOptions::default(),
            &QueueOptions::subscriber(),
        )
        .await
        .unwrap();

        assert_eq!(topology.queue, "amq.gen-1");
        assert_eq!(topology.routing_key, "events.*");
    }
}
