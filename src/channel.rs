// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Management
//!
//! Opening channels on named connections, applying channel tuning and keeping persisted
//! channels registered by name so every operation on the same queue or exchange shares one
//! channel.

use crate::{
    broker::BrokerChannel,
    client::RabbitMQClient,
    config::{ChannelOption, ChannelOptions},
    dispatcher::ConsumerRecipe,
    errors::AmqpError,
    registry::ChannelEntry,
};
use std::{fmt, sync::Arc};
use tracing::{debug, warn};

/// Operations that derive a channel name when the caller supplies none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    AddWorker,
    PushTask,
    AddSubscriber,
    PublishMessage,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::AddWorker => write!(f, "add_worker"),
            Operation::PushTask => write!(f, "push_task"),
            Operation::AddSubscriber => write!(f, "add_subscriber"),
            Operation::PublishMessage => write!(f, "publish_message"),
        }
    }
}

/// Deterministic channel name: `<operation>.<queue or exchange>`.
pub fn get_channel_name(operation: Operation, target: &str) -> String {
    format!("{operation}.{target}")
}

/// Parameters of [`RabbitMQClient::create_channel`].
#[derive(Debug, Clone, Default)]
pub struct ChannelRequest {
    /// Connection to open the channel on. Falls back to the default connection.
    pub connection: Option<String>,
    pub name: String,
    pub options: ChannelOptions,
    /// Keep the channel registered even when channels are not preserved globally.
    pub persist: bool,
}

impl ChannelOption {
    /// Runs the channel operation this option stands for.
    pub(crate) async fn apply(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        match self {
            ChannelOption::Prefetch(count) => channel.basic_qos(*count, false).await,
            ChannelOption::GlobalPrefetch(count) => channel.basic_qos(*count, true).await,
            ChannelOption::Confirm => channel.confirm_select().await,
        }
    }
}

impl RabbitMQClient {
    /// Opens a channel and, when persisted, registers it under `request.name`.
    ///
    /// A channel already registered under the same name is closed and replaced.
    pub async fn create_channel(
        &self,
        request: ChannelRequest,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let (connection_name, connection) = {
            let registry = self.shared.registry.read().await;
            let name = request
                .connection
                .clone()
                .or_else(|| registry.default_connection.clone())
                .ok_or_else(|| {
                    AmqpError::PreconditionError(
                        "a connection must be created before creating a channel".to_owned(),
                    )
                })?;
            let entry = registry.connections.get(&name).ok_or_else(|| {
                AmqpError::PreconditionError(format!("unknown connection `{name}`"))
            })?;
            (name, entry.connection.clone())
        };

        let channel = connection.create_channel().await?;

        for option in request.options.iter() {
            option.apply(channel.as_ref()).await?;
        }

        if self.shared.configs.preserve_channels || request.persist {
            let replaced = self
                .shared
                .registry
                .write()
                .await
                .register_channel(ChannelEntry {
                    name: request.name.clone(),
                    connection: connection_name.clone(),
                    channel: channel.clone(),
                    options: request.options.clone(),
                    persist: request.persist,
                    consumers: vec![],
                });

            if let Some(old) = replaced {
                if let Err(err) = old.channel.close().await {
                    warn!(
                        channel = request.name,
                        error = err.to_string(),
                        "failure to close replaced channel"
                    );
                }
            }
        }

        debug!(
            channel = request.name,
            connection = connection_name,
            "new channel created"
        );
        Ok(channel)
    }

    /// The channel registered under `name`, if any.
    pub async fn registered_channel(&self, name: &str) -> Option<Arc<dyn BrokerChannel>> {
        self.shared
            .registry
            .read()
            .await
            .channels
            .get(name)
            .map(|entry| entry.channel.clone())
    }

    /// Reuses the channel registered under `request.name` or creates it.
    /// The flag tells whether the channel was reused.
    pub(crate) async fn channel_for(
        &self,
        request: ChannelRequest,
    ) -> Result<(Arc<dyn BrokerChannel>, bool), AmqpError> {
        if let Some(channel) = self.registered_channel(&request.name).await {
            return Ok((channel, true));
        }
        Ok((self.create_channel(request).await?, false))
    }

    /// Remembers that `recipe` consumes on the channel called `channel`.
    pub(crate) async fn attach_consumer(&self, channel: &str, recipe: ConsumerRecipe) {
        let mut registry = self.shared.registry.write().await;
        if let Some(entry) = registry.channels.get_mut(channel) {
            if !entry.consumers.iter().any(|known| known.same_as(&recipe)) {
                entry.consumers.push(recipe);
            }
        }
    }
}
