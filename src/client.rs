// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Client
//!
//! [`RabbitMQClient`] owns the broker, the configuration and the registry of named connections
//! and channels. It is cheap to clone and every clone shares the same state. Operations are
//! grouped by concern in the other modules:
//!
//! - [`crate::connection`]: connecting, supervision and shutdown
//! - [`crate::channel`]: channel creation and naming
//! - [`crate::dispatcher`]: workers and subscribers
//! - [`crate::publisher`]: tasks and pub/sub messages

use crate::{
    amqp::LapinBroker, broker::Broker, config::RabbitMQConfigs, errors::AmqpError,
    registry::{ConnectionState, Registry},
};
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

pub(crate) struct Shared {
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) configs: RabbitMQConfigs,
    pub(crate) registry: RwLock<Registry>,
}

#[derive(Clone)]
pub struct RabbitMQClient {
    pub(crate) shared: Arc<Shared>,
}

impl RabbitMQClient {
    /// Creates a client dialing through `broker`. The configuration is validated first.
    pub fn new(broker: Arc<dyn Broker>, configs: RabbitMQConfigs) -> Result<Self, AmqpError> {
        configs.validate()?;
        Ok(RabbitMQClient {
            shared: Arc::new(Shared {
                broker,
                configs,
                registry: RwLock::new(Registry::default()),
            }),
        })
    }

    /// Creates a client talking to RabbitMQ through lapin.
    pub fn lapin(configs: RabbitMQConfigs) -> Result<Self, AmqpError> {
        RabbitMQClient::new(LapinBroker::new(), configs)
    }

    pub async fn connection_state(&self, name: &str) -> Option<ConnectionState> {
        self.shared
            .registry
            .read()
            .await
            .connections
            .get(name)
            .map(|entry| entry.state)
    }

    pub async fn default_connection(&self) -> Option<String> {
        self.shared.registry.read().await.default_connection.clone()
    }

    /// Names of the registered connections, sorted.
    pub async fn connection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .shared
            .registry
            .read()
            .await
            .connections
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Names of the registered channels, sorted.
    pub async fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .shared
            .registry
            .read()
            .await
            .channels
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Token cancelled when the client shuts down.
    pub(crate) async fn token(&self) -> CancellationToken {
        self.shared.registry.read().await.token.clone()
    }

    pub(crate) fn downgrade(&self) -> Weak<Shared> {
        Arc::downgrade(&self.shared)
    }

    pub(crate) fn upgrade(shared: &Weak<Shared>) -> Option<RabbitMQClient> {
        shared.upgrade().map(|shared| RabbitMQClient { shared })
    }
}
