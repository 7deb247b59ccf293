// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Dispatch
//!
//! Registers workers and subscribers: resolves their persisted channel, installs their
//! topology, starts consuming and spawns the task feeding deliveries to the pipeline one at a
//! time. Each registration is kept as a [`ConsumerRecipe`] on its channel so the connection
//! supervisor can replay it after a reconnection.

use crate::{
    broker::{ConsumeOptions, DeliveryStream},
    channel::{get_channel_name, ChannelRequest, Operation},
    client::RabbitMQClient,
    config::{ChannelOption, ChannelOptions, DoneQueueConfigs, RetryQueueConfigs},
    consumer::WorkerPipeline,
    errors::AmqpError,
    exchange::ExchangeOptions,
    handler::ConsumerHandler,
    message::Message,
    queue::QueueOptions,
    subscriber::SubscriberPipeline,
    topology::{SubscriberTopology, WorkerTopology},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Processes the deliveries of one consumer.
#[async_trait]
pub(crate) trait Pipeline: Send + Sync {
    async fn process(&self, message: Message) -> Result<(), AmqpError>;
}

/// Feeds `stream` to `pipeline` sequentially until the stream ends or `token` is cancelled.
pub(crate) fn spawn_consumer(
    mut stream: DeliveryStream,
    token: CancellationToken,
    pipeline: Arc<dyn Pipeline>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                next = stream.next() => match next {
                    Some(Ok(message)) => {
                        if let Err(err) = pipeline.process(message).await {
                            error!(error = err.to_string(), "error consume msg");
                        }
                    }
                    Some(Err(err)) => error!(error = err.to_string(), "errors consume msg"),
                    None => {
                        debug!("consumer stream ended");
                        break;
                    }
                },
            }
        }
    })
}

/// Options of [`RabbitMQClient::add_worker`].
#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
    /// Defaults to the default connection.
    pub connection: Option<String>,
    /// Defaults to `add_worker.<queue>`.
    pub channel_name: Option<String>,
    /// Applied on top of a prefetch of 1.
    pub channel_options: ChannelOptions,
    pub queue_options: QueueOptions,
    pub consume_options: ConsumeOptions,
    /// Overrides the client wide retry queue settings.
    pub retry_queue: Option<RetryQueueConfigs>,
    /// Overrides the client wide done queue settings.
    pub done_queue: Option<DoneQueueConfigs>,
}

/// Options of [`RabbitMQClient::add_subscriber`].
#[derive(Debug, Clone)]
pub struct SubscriberOptions {
    /// Defaults to the default connection.
    pub connection: Option<String>,
    /// Defaults to `add_subscriber.<exchange>`.
    pub channel_name: Option<String>,
    pub channel_options: ChannelOptions,
    pub exchange_options: ExchangeOptions,
    pub queue_options: QueueOptions,
    pub consume_options: ConsumeOptions,
}

impl Default for SubscriberOptions {
    fn default() -> Self {
        SubscriberOptions {
            connection: None,
            channel_name: None,
            channel_options: ChannelOptions::default(),
            exchange_options: ExchangeOptions::default(),
            queue_options: QueueOptions::subscriber(),
            consume_options: ConsumeOptions {
                consumer_tag: String::new(),
                no_ack: true,
                exclusive: true,
            },
        }
    }
}

/// A running worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHandle {
    pub channel_name: String,
    pub consumer_tag: String,
    pub topology: WorkerTopology,
}

/// A running subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberHandle {
    pub channel_name: String,
    pub consumer_tag: String,
    pub topology: SubscriberTopology,
}

pub(crate) struct WorkerRecipe {
    queue: String,
    handler: Arc<dyn ConsumerHandler>,
    options: WorkerOptions,
}

pub(crate) struct SubscriberRecipe {
    exchange: String,
    topic: Option<String>,
    handler: Arc<dyn ConsumerHandler>,
    options: SubscriberOptions,
}

/// What it takes to start a consumer again.
#[derive(Clone)]
pub(crate) enum ConsumerRecipe {
    Worker(Arc<WorkerRecipe>),
    Subscriber(Arc<SubscriberRecipe>),
}

impl ConsumerRecipe {
    pub(crate) fn same_as(&self, other: &ConsumerRecipe) -> bool {
        match (self, other) {
            (ConsumerRecipe::Worker(a), ConsumerRecipe::Worker(b)) => Arc::ptr_eq(a, b),
            (ConsumerRecipe::Subscriber(a), ConsumerRecipe::Subscriber(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Starts the consumer again on the channels of the current connection.
    pub(crate) async fn install(&self, client: &RabbitMQClient) -> Result<(), AmqpError> {
        match self {
            ConsumerRecipe::Worker(recipe) => client.install_worker(recipe.clone()).await.map(|_| ()),
            ConsumerRecipe::Subscriber(recipe) => {
                client.install_subscriber(recipe.clone()).await.map(|_| ())
            }
        }
    }
}

fn consumer_tag(options: &ConsumeOptions, target: &str) -> ConsumeOptions {
    let mut options = options.clone();
    if options.consumer_tag.is_empty() {
        options.consumer_tag = format!("{}.{}", target, Uuid::new_v4());
    }
    options
}

impl RabbitMQClient {
    /// Consumes `queue` with `handler`, retrying failed tasks through the retry queue.
    pub async fn add_worker(
        &self,
        queue: &str,
        handler: Arc<dyn ConsumerHandler>,
        options: WorkerOptions,
    ) -> Result<WorkerHandle, AmqpError> {
        self.install_worker(Arc::new(WorkerRecipe {
            queue: queue.to_owned(),
            handler,
            options,
        }))
        .await
    }

    /// Consumes every message published on `exchange` for `topic` (every topic when `None`).
    pub async fn add_subscriber(
        &self,
        exchange: &str,
        topic: Option<&str>,
        handler: Arc<dyn ConsumerHandler>,
        options: SubscriberOptions,
    ) -> Result<SubscriberHandle, AmqpError> {
        self.install_subscriber(Arc::new(SubscriberRecipe {
            exchange: exchange.to_owned(),
            topic: topic.map(str::to_owned),
            handler,
            options,
        }))
        .await
    }

    pub(crate) async fn install_worker(
        &self,
        recipe: Arc<WorkerRecipe>,
    ) -> Result<WorkerHandle, AmqpError> {
        let options = &recipe.options;
        let channel_name = options
            .channel_name
            .clone()
            .unwrap_or_else(|| get_channel_name(Operation::AddWorker, &recipe.queue));

        let (channel, _) = self
            .channel_for(ChannelRequest {
                connection: options.connection.clone(),
                name: channel_name.clone(),
                options: ChannelOptions::new()
                    .with(ChannelOption::Prefetch(1))
                    .merge(&options.channel_options),
                persist: true,
            })
            .await?;

        let retry = options
            .retry_queue
            .clone()
            .unwrap_or_else(|| self.shared.configs.retry_queue.clone());
        let done = options
            .done_queue
            .clone()
            .unwrap_or_else(|| self.shared.configs.done_queue.clone());

        let topology = WorkerTopology::install(
            channel.as_ref(),
            &recipe.queue,
            &options.queue_options,
            &retry,
            &done,
        )
        .await?;

        let consume = consumer_tag(&options.consume_options, &recipe.queue);
        let stream = channel.consume(&topology.queue, &consume).await?;

        let pipeline = WorkerPipeline::new(
            channel.clone(),
            topology.clone(),
            retry,
            recipe.handler.clone(),
            self.shared.configs.encoding.clone(),
            consume.no_ack,
        );
        spawn_consumer(stream, self.token().await, Arc::new(pipeline));

        self.attach_consumer(&channel_name, ConsumerRecipe::Worker(recipe.clone()))
            .await;

        info!(
            queue = topology.queue,
            channel = channel_name,
            consumer_tag = consume.consumer_tag,
            "worker added"
        );

        Ok(WorkerHandle {
            channel_name,
            consumer_tag: consume.consumer_tag,
            topology,
        })
    }

    pub(crate) async fn install_subscriber(
        &self,
        recipe: Arc<SubscriberRecipe>,
    ) -> Result<SubscriberHandle, AmqpError> {
        let options = &recipe.options;
        let channel_name = options
            .channel_name
            .clone()
            .unwrap_or_else(|| get_channel_name(Operation::AddSubscriber, &recipe.exchange));

        let (channel, _) = self
            .channel_for(ChannelRequest {
                connection: options.connection.clone(),
                name: channel_name.clone(),
                options: options.channel_options.clone(),
                persist: true,
            })
            .await?;

        let topology = SubscriberTopology::install(
            channel.as_ref(),
            &recipe.exchange,
            recipe.topic.as_deref(),
            &options.exchange_options,
            &options.queue_options,
        )
        .await?;

        let consume = consumer_tag(&options.consume_options, &topology.routing_key);
        let stream = channel.consume(&topology.queue, &consume).await?;

        let pipeline = SubscriberPipeline::new(
            channel.clone(),
            topology.clone(),
            recipe.handler.clone(),
            self.shared.configs.encoding.clone(),
            consume.no_ack,
        );
        spawn_consumer(stream, self.token().await, Arc::new(pipeline));

        self.attach_consumer(&channel_name, ConsumerRecipe::Subscriber(recipe.clone()))
            .await;

        info!(
            exchange = topology.exchange,
            routing_key = topology.routing_key,
            channel = channel_name,
            "subscriber added"
        );

        Ok(SubscriberHandle {
            channel_name,
            consumer_tag: consume.consumer_tag,
            topology,
        })
    }
}
