// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Registry
//!
//! Named connections, the default-connection pointer and named channels, owned by a single
//! [`crate::client::RabbitMQClient`]. Only connection management and channel creation write
//! to it; everything else looks entries up by name.
//!
//! ## Rules
//! - at most one channel per name; registering a name again hands back the replaced entry
//!   so the caller can close it
//! - `reset` drops every entry, clears the default and cancels every background task

use crate::{
    broker::{BrokerChannel, BrokerConnection},
    config::{ChannelOptions, ConnectionConfigs},
    dispatcher::ConsumerRecipe,
};
use std::{collections::HashMap, fmt, sync::Arc};
use tokio_util::sync::CancellationToken;

/// Supervision state of a named connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Reconnecting,
    /// The broker came back but dependent channels could not be rebuilt yet.
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Failed => write!(f, "failed"),
        }
    }
}

pub(crate) struct ConnectionEntry {
    pub(crate) connection: Arc<dyn BrokerConnection>,
    pub(crate) url: String,
    pub(crate) configs: ConnectionConfigs,
    pub(crate) state: ConnectionState,
}

#[derive(Clone)]
pub(crate) struct ChannelEntry {
    pub(crate) name: String,
    pub(crate) connection: String,
    pub(crate) channel: Arc<dyn BrokerChannel>,
    pub(crate) options: ChannelOptions,
    pub(crate) persist: bool,
    /// Consumers running on this channel, replayed after a reconnection.
    pub(crate) consumers: Vec<ConsumerRecipe>,
}

pub(crate) struct Registry {
    pub(crate) default_connection: Option<String>,
    pub(crate) connections: HashMap<String, ConnectionEntry>,
    pub(crate) channels: HashMap<String, ChannelEntry>,
    pub(crate) token: CancellationToken,
}

impl Default for Registry {
    fn default() -> Self {
        Registry {
            default_connection: None,
            connections: HashMap::default(),
            channels: HashMap::default(),
            token: CancellationToken::new(),
        }
    }
}

impl Registry {
    /// Registers `entry`, returning the channel it replaced under the same name.
    pub(crate) fn register_channel(&mut self, entry: ChannelEntry) -> Option<ChannelEntry> {
        self.channels.insert(entry.name.clone(), entry)
    }

    /// Channels that were opened on the connection called `connection`.
    pub(crate) fn channels_of(&self, connection: &str) -> Vec<ChannelEntry> {
        let mut entries: Vec<ChannelEntry> = self
            .channels
            .values()
            .filter(|entry| entry.connection == connection)
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    pub(crate) fn set_state(&mut self, connection: &str, state: ConnectionState) {
        if let Some(entry) = self.connections.get_mut(connection) {
            entry.state = state;
        }
    }

    /// Empties the registry and hands back what was open so it can be closed.
    pub(crate) fn reset(
        &mut self,
    ) -> (Vec<Arc<dyn BrokerChannel>>, Vec<Arc<dyn BrokerConnection>>) {
        self.token.cancel();
        let previous = std::mem::take(self);

        let channels = previous
            .channels
            .into_values()
            .map(|entry| entry.channel)
            .collect();
        let connections = previous
            .connections
            .into_values()
            .map(|entry| entry.connection)
            .collect();

        (channels, connections)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.connections.is_empty() && self.channels.is_empty() && self.default_connection.is_none()
    }
}
