// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Publisher
//!
//! Task and event publishing. Payloads are JSON encoded and carry the caller's trace context
//! in their headers.
//!
//! - [`RabbitMQClient::push_task`] asserts the work queue and sends straight to it, persistent,
//!   with `x-retry-count` set to `0` (`-1` when task retries are disabled)
//! - [`RabbitMQClient::publish_message`] asserts a topic exchange and publishes on
//!   `<exchange>.<topic>`, transient, with the topic as message type
//!
//! Publishing channels are named after the operation and target. When channels are not
//! preserved a channel opened for one publish is closed right after it.

use crate::{
    broker::BrokerChannel,
    channel::{get_channel_name, ChannelRequest, Operation},
    client::RabbitMQClient,
    config::ChannelOptions,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeOptions},
    message::{json_to_amqp, AMQP_HEADERS_RETRY_COUNT, JSON_CONTENT_TYPE, UTF8_CONTENT_ENCODING},
    otel,
    queue::{QueueDefinition, QueueOptions},
    topology::SubscriberTopology,
};
use lapin::{
    types::{AMQPValue, FieldTable, LongLongInt, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use serde::Serialize;
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error, warn};
use uuid::Uuid;

const PERSISTENT: u8 = 2;
const TRANSIENT: u8 = 1;

/// Per-message overrides.
#[derive(Debug, Clone, Default)]
pub struct MessageOptions {
    /// Tasks default to 0, pub/sub messages carry none.
    pub priority: Option<u8>,
    /// Tasks default to persistent, pub/sub messages to transient.
    pub persistent: Option<bool>,
    /// Per-message TTL in milliseconds.
    pub expiration: Option<u64>,
    /// Defaults to a random v4 uuid.
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    /// Extra headers, merged over the ones this layer sets.
    pub headers: BTreeMap<String, Value>,
}

/// Options of [`RabbitMQClient::push_task`].
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    /// Defaults to the default connection.
    pub connection: Option<String>,
    /// Defaults to `push_task.<queue>`.
    pub channel_name: Option<String>,
    pub channel_options: ChannelOptions,
    pub queue_options: QueueOptions,
    /// Message type, defaults to the queue name.
    pub kind: Option<String>,
    pub message: MessageOptions,
}

/// Options of [`RabbitMQClient::publish_message`].
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Defaults to the default connection.
    pub connection: Option<String>,
    /// Defaults to `publish_message.<exchange>`.
    pub channel_name: Option<String>,
    pub channel_options: ChannelOptions,
    pub exchange_options: ExchangeOptions,
    pub message: MessageOptions,
}

/// Where a message went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    /// Channel the message went out on.
    pub channel_name: String,
    /// Empty for tasks, which go through the default exchange.
    pub exchange: String,
    /// The queue of a task, `<exchange>.<topic>` for pub/sub messages.
    pub routing_key: String,
    pub message_id: String,
}

struct Defaults<'a> {
    kind: &'a str,
    persistent: bool,
    priority: Option<u8>,
    retry_count: Option<i64>,
}

fn properties(ctx: &Context, defaults: Defaults<'_>, options: &MessageOptions) -> (BasicProperties, String) {
    let mut headers = FieldTable::default();
    otel::inject(ctx, &mut headers);

    if let Some(retry_count) = defaults.retry_count {
        headers.insert(
            ShortString::from(AMQP_HEADERS_RETRY_COUNT),
            AMQPValue::LongLongInt(LongLongInt::from(retry_count)),
        );
    }

    for (key, value) in &options.headers {
        headers.insert(ShortString::from(key.as_str()), json_to_amqp(value));
    }

    let message_id = options
        .message_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let persistent = options.persistent.unwrap_or(defaults.persistent);
    let mut props = BasicProperties::default()
        .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
        .with_content_encoding(ShortString::from(UTF8_CONTENT_ENCODING))
        .with_type(ShortString::from(defaults.kind))
        .with_message_id(ShortString::from(message_id.as_str()))
        .with_delivery_mode(if persistent { PERSISTENT } else { TRANSIENT })
        .with_headers(headers);

    if let Some(priority) = options.priority.or(defaults.priority) {
        props = props.with_priority(priority);
    }
    if let Some(expiration) = options.expiration {
        props = props.with_expiration(ShortString::from(expiration.to_string()));
    }
    if let Some(correlation_id) = &options.correlation_id {
        props = props.with_correlation_id(ShortString::from(correlation_id.as_str()));
    }

    (props, message_id)
}

fn encode<T: Serialize + ?Sized>(payload: &T) -> Result<Vec<u8>, AmqpError> {
    serde_json::to_vec(payload).map_err(|err| {
        error!(error = err.to_string(), "failure to encode payload");
        AmqpError::PublishingError(err.to_string())
    })
}

impl RabbitMQClient {
    /// Sends `payload` to the work queue `queue`.
    pub async fn push_task<T: Serialize + ?Sized>(
        &self,
        ctx: &Context,
        queue: &str,
        payload: &T,
        options: TaskOptions,
    ) -> Result<Delivered, AmqpError> {
        let data = encode(payload)?;
        let channel_name = options
            .channel_name
            .clone()
            .unwrap_or_else(|| get_channel_name(Operation::PushTask, queue));

        let (channel, reused) = self
            .channel_for(ChannelRequest {
                connection: options.connection.clone(),
                name: channel_name.clone(),
                options: options.channel_options.clone(),
                persist: false,
            })
            .await?;

        let retry_count = if self.shared.configs.task_retry { 0 } else { -1 };
        let (props, message_id) = properties(
            ctx,
            Defaults {
                kind: options.kind.as_deref().unwrap_or(queue),
                persistent: true,
                priority: Some(0),
                retry_count: Some(retry_count),
            },
            &options.message,
        );

        let sent = async {
            channel
                .assert_queue(&QueueDefinition::new(queue).options(&options.queue_options))
                .await?;
            channel.publish("", queue, &data, props).await
        }
        .await;
        self.release(&channel_name, channel, reused).await;
        sent?;

        debug!(queue, message_id, "task pushed");
        Ok(Delivered {
            channel_name,
            exchange: String::new(),
            routing_key: queue.to_owned(),
            message_id,
        })
    }

    /// Publishes `payload` on `exchange` for `topic`.
    pub async fn publish_message<T: Serialize + ?Sized>(
        &self,
        ctx: &Context,
        exchange: &str,
        topic: &str,
        payload: &T,
        options: PublishOptions,
    ) -> Result<Delivered, AmqpError> {
        let data = encode(payload)?;
        let channel_name = options
            .channel_name
            .clone()
            .unwrap_or_else(|| get_channel_name(Operation::PublishMessage, exchange));

        let (channel, reused) = self
            .channel_for(ChannelRequest {
                connection: options.connection.clone(),
                name: channel_name.clone(),
                options: options.channel_options.clone(),
                persist: false,
            })
            .await?;

        let routing_key = SubscriberTopology::routing_key(exchange, Some(topic));
        let (props, message_id) = properties(
            ctx,
            Defaults {
                kind: topic,
                persistent: false,
                priority: None,
                retry_count: None,
            },
            &options.message,
        );

        let sent = async {
            channel
                .assert_exchange(&ExchangeDefinition::new(exchange).options(&options.exchange_options))
                .await?;
            channel.publish(exchange, &routing_key, &data, props).await
        }
        .await;
        self.release(&channel_name, channel, reused).await;
        sent?;

        debug!(exchange, routing_key, message_id, "message published");
        Ok(Delivered {
            channel_name,
            exchange: exchange.to_owned(),
            routing_key,
            message_id,
        })
    }

    /// Closes a channel opened for a single publish.
    async fn release(&self, name: &str, channel: Arc<dyn BrokerChannel>, reused: bool) {
        if reused || self.shared.configs.preserve_channels {
            return;
        }
        if let Err(err) = channel.close().await {
            warn!(channel = name, error = err.to_string(), "failure to close channel");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::RabbitMQConfigs, message::as_i64, testing::FakeBroker};
    use serde_json::json;

    async fn connected(broker: &Arc<FakeBroker>, configs: RabbitMQConfigs) -> RabbitMQClient {
        let client = RabbitMQClient::new(broker.clone(), configs).unwrap();
        client.create_connection(Default::default()).await.unwrap();
        client
    }

    fn retry_header(props: &BasicProperties) -> Option<i64> {
        props
            .headers()
            .as_ref()
            .and_then(|headers| headers.inner().get(AMQP_HEADERS_RETRY_COUNT).and_then(as_i64))
    }

    #[tokio::test]
    async fn push_task_defaults() {
        let broker = FakeBroker::new();
        let client = connected(&broker, RabbitMQConfigs::default()).await;

        let delivered = client
            .push_task(&Context::new(), "emails", &json!({"to": "a@b.c"}), TaskOptions::default())
            .await
            .unwrap();

        assert_eq!(delivered.channel_name, "push_task.emails");
        assert_eq!(delivered.routing_key, "emails");

        let channel = broker.connection(0).channels().remove(0);
        assert_eq!(channel.declared_queues(), vec!["emails".to_owned()]);

        let published = channel.published();
        assert_eq!(published.len(), 1);
        let sent = &published[0];
        assert_eq!(sent.exchange, "");
        assert_eq!(sent.routing_key, "emails");
        assert_eq!(sent.payload, br#"{"to":"a@b.c"}"#.to_vec());
        assert_eq!(sent.properties.delivery_mode(), &Some(PERSISTENT));
        assert_eq!(sent.properties.priority(), &Some(0));
        assert_eq!(
            sent.properties.content_type(),
            &Some(ShortString::from(JSON_CONTENT_TYPE))
        );
        assert_eq!(sent.properties.kind(), &Some(ShortString::from("emails")));
        assert_eq!(retry_header(&sent.properties), Some(0));
    }

    #[tokio::test]
    async fn disabled_task_retry_marks_tasks() {
        let broker = FakeBroker::new();
        let configs = RabbitMQConfigs {
            task_retry: false,
            ..RabbitMQConfigs::default()
        };
        let client = connected(&broker, configs).await;

        client
            .push_task(&Context::new(), "emails", &json!({}), TaskOptions::default())
            .await
            .unwrap();

        let channel = broker.connection(0).channels().remove(0);
        assert_eq!(retry_header(&channel.published()[0].properties), Some(-1));
    }

    #[tokio::test]
    async fn publish_message_routes_on_topic() {
        let broker = FakeBroker::new();
        let client = connected(&broker, RabbitMQConfigs::default()).await;

        let delivered = client
            .publish_message(
                &Context::new(),
                "events",
                "user.created",
                &json!({"id": 3}),
                PublishOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(delivered.routing_key, "events.user.created");
        assert_eq!(delivered.channel_name, "publish_message.events");

        let channel = broker.connection(0).channels().remove(0);
        assert_eq!(channel.declared_exchanges(), vec!["events".to_owned()]);

        let sent = &channel.published()[0];
        assert_eq!(sent.exchange, "events");
        assert_eq!(sent.routing_key, "events.user.created");
        assert_eq!(sent.properties.delivery_mode(), &Some(TRANSIENT));
        assert_eq!(sent.properties.kind(), &Some(ShortString::from("user.created")));
        assert_eq!(retry_header(&sent.properties), None);
    }

    #[tokio::test]
    async fn preserved_channels_are_reused() {
        let broker = FakeBroker::new();
        let client = connected(&broker, RabbitMQConfigs::default()).await;

        for _ in 0..3 {
            client
                .push_task(&Context::new(), "emails", &json!({}), TaskOptions::default())
                .await
                .unwrap();
        }

        let channels = broker.connection(0).channels();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].published().len(), 3);
    }

    #[tokio::test]
    async fn ephemeral_channels_are_closed_after_publish() {
        let broker = FakeBroker::new();
        let configs = RabbitMQConfigs {
            preserve_channels: false,
            ..RabbitMQConfigs::default()
        };
        let client = connected(&broker, configs).await;

        for _ in 0..2 {
            client
                .push_task(&Context::new(), "emails", &json!({}), TaskOptions::default())
                .await
                .unwrap();
        }

        let channels = broker.connection(0).channels();
        assert_eq!(channels.len(), 2);
        assert!(channels.iter().all(|channel| channel.is_closed()));
    }

    #[tokio::test]
    async fn message_options_override_defaults() {
        let broker = FakeBroker::new();
        let client = connected(&broker, RabbitMQConfigs::default()).await;

        let mut headers = BTreeMap::new();
        headers.insert("tenant".to_owned(), json!("acme"));
        let options = TaskOptions {
            kind: Some("welcome".to_owned()),
            message: MessageOptions {
                priority: Some(5),
                persistent: Some(false),
                expiration: Some(30_000),
                message_id: Some("m-1".to_owned()),
                headers,
                ..MessageOptions::default()
            },
            ..TaskOptions::default()
        };

        let delivered = client
            .push_task(&Context::new(), "emails", &json!({}), options)
            .await
            .unwrap();
        assert_eq!(delivered.message_id, "m-1");

        let channel = broker.connection(0).channels().remove(0);
        let props = channel.published()[0].properties.clone();
        assert_eq!(props.priority(), &Some(5));
        assert_eq!(props.delivery_mode(), &Some(TRANSIENT));
        assert_eq!(props.expiration(), &Some(ShortString::from("30000")));
        assert_eq!(props.kind(), &Some(ShortString::from("welcome")));
        assert!(props
            .headers()
            .as_ref()
            .is_some_and(|headers| headers.inner().contains_key("tenant")));
    }

    #[tokio::test]
    async fn publishing_without_connection_fails() {
        let client = RabbitMQClient::new(FakeBroker::new(), RabbitMQConfigs::default()).unwrap();
        let err = client
            .push_task(&Context::new(), "emails", &json!({}), TaskOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AmqpError::PreconditionError(_)));
    }
}
