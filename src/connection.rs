// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Management
//!
//! Named connections, dialing with backoff, supervision and shutdown.
//!
//! Each connection gets one supervisor task. When the broker reports the connection lost the
//! supervisor marks it `Reconnecting` (dropping it as the default connection), dials again without an attempt limit, re-opens every
//! channel registered on it under the same name and options, and restarts the consumers that
//! ran on those channels. If the rebuild fails the connection is `Failed`; the fresh connection
//! is closed and the supervisor backs off and tries again. Shutdown cancels every supervisor.

use crate::{
    broker::{Broker, BrokerConnection, BrokerLink},
    channel::ChannelRequest,
    client::{RabbitMQClient, Shared},
    config::{ConnectionConfigs, SocketOptions},
    errors::AmqpError,
    policy::RetryPolicy,
    registry::{ChannelEntry, ConnectionEntry, ConnectionState},
};
use futures_util::future::join_all;
use std::sync::{Arc, Weak};
use tokio::{sync::oneshot, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Parameters of [`RabbitMQClient::create_connection`]. Unset fields use the client configuration.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRequest {
    /// Defaults to a random v4 uuid.
    pub name: Option<String>,
    pub url: Option<String>,
    pub configs: Option<ConnectionConfigs>,
}

/// A registered connection.
#[derive(Clone)]
pub struct NamedConnection {
    pub name: String,
    pub connection: Arc<dyn BrokerConnection>,
}

impl std::fmt::Debug for NamedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedConnection")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Dials `url`, retrying on failure as `policy` allows.
pub(crate) async fn dial(
    broker: &dyn Broker,
    url: &str,
    socket: &SocketOptions,
    policy: &RetryPolicy,
) -> Result<BrokerLink, AmqpError> {
    let mut attempt = 0;
    loop {
        match broker.connect(url, socket).await {
            Ok(link) => return Ok(link),
            Err(err) if policy.allows(attempt) => {
                let delay = policy.delay(attempt);
                warn!(
                    error = err.to_string(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "failure to connect, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                error!(error = err.to_string(), attempt, "failure to connect");
                return Err(match err {
                    AmqpError::ConnectionError(_) => err,
                    other => AmqpError::ConnectionError(other.to_string()),
                });
            }
        }
    }
}

impl RabbitMQClient {
    /// Dials the broker and registers the connection under `request.name`.
    ///
    /// The first connection becomes the default one. With `use_existing_connection` set the
    /// default connection is returned instead of dialing when there is one.
    pub async fn create_connection(
        &self,
        request: ConnectionRequest,
    ) -> Result<NamedConnection, AmqpError> {
        let configs = request
            .configs
            .unwrap_or_else(|| self.shared.configs.connection.clone());
        configs.retry.validate()?;

        if configs.use_existing_connection {
            if let Some(existing) = self.existing_default().await {
                debug!(connection = existing.name, "reusing default connection");
                return Ok(existing);
            }
        }

        let name = request.name.unwrap_or_else(|| Uuid::new_v4().to_string());
        let base = request.url.as_deref().unwrap_or(&self.shared.configs.url);
        let url = configs.tuning.apply(base);

        let link = dial(self.shared.broker.as_ref(), &url, &configs.socket, &configs.retry).await?;

        let (token, replaced) = {
            let mut registry = self.shared.registry.write().await;
            let replaced = registry.connections.insert(
                name.clone(),
                ConnectionEntry {
                    connection: link.connection.clone(),
                    url,
                    configs,
                    state: ConnectionState::Connected,
                },
            );
            if registry.default_connection.is_none() {
                registry.default_connection = Some(name.clone());
            }
            (registry.token.clone(), replaced)
        };

        if let Some(old) = replaced {
            warn!(connection = name, "connection name reused, closing the previous one");
            if let Err(err) = old.connection.close().await {
                warn!(connection = name, error = err.to_string(), "failure to close connection");
            }
        }

        tokio::spawn(supervise(
            self.downgrade(),
            name.clone(),
            Arc::downgrade(&link.connection),
            link.lost,
            token,
        ));

        info!(connection = name, "amqp connection created");
        Ok(NamedConnection {
            name,
            connection: link.connection,
        })
    }

    /// Closes every channel, then every connection, and empties the registry.
    ///
    /// Background consumers and supervisors stop. Calling it again is a no-op.
    pub async fn close_connection(&self) -> Result<(), AmqpError> {
        let (channels, connections) = {
            let mut registry = self.shared.registry.write().await;
            if registry.is_empty() {
                return Ok(());
            }
            registry.reset()
        };

        for result in join_all(channels.iter().map(|channel| channel.close())).await {
            if let Err(err) = result {
                warn!(error = err.to_string(), "failure to close channel");
            }
        }

        for result in join_all(connections.iter().map(|connection| connection.close())).await {
            if let Err(err) = result {
                warn!(error = err.to_string(), "failure to close connection");
            }
        }

        info!(
            channels = channels.len(),
            connections = connections.len(),
            "amqp connections closed"
        );
        Ok(())
    }

    async fn existing_default(&self) -> Option<NamedConnection> {
        let registry = self.shared.registry.read().await;
        let name = registry.default_connection.clone()?;
        let entry = registry.connections.get(&name)?;
        Some(NamedConnection {
            name,
            connection: entry.connection.clone(),
        })
    }

    /// Re-dials the connection called `name` and rebuilds what depended on it.
    ///
    /// Returns the new connection to watch, or `None` once the client shut down or `lost` is
    /// no longer the connection registered under `name`.
    async fn recover(
        &self,
        name: &str,
        lost: &Weak<dyn BrokerConnection>,
        token: &CancellationToken,
    ) -> Option<Watched> {
        let (url, configs, channels) = {
            let mut registry = self.shared.registry.write().await;
            let entry = registry.connections.get_mut(name)?;
            if !same_connection(lost, &entry.connection) {
                debug!(connection = name, "stale connection lost, nothing to recover");
                return None;
            }
            entry.state = ConnectionState::Reconnecting;
            let (url, configs) = (entry.url.clone(), entry.configs.clone());
            if registry.default_connection.as_deref() == Some(name) {
                registry.default_connection = None;
            }
            (url, configs, registry.channels_of(name))
        };

        let policy = configs.retry.unbounded();
        let mut round = 0;

        loop {
            let dialed = tokio::select! {
                _ = token.cancelled() => return None,
                dialed = dial(self.shared.broker.as_ref(), &url, &configs.socket, &policy) => dialed,
            };
            let link = match dialed {
                Ok(link) => link,
                Err(err) => {
                    error!(connection = name, error = err.to_string(), "reconnection failed");
                    return None;
                }
            };

            let registered = {
                let mut registry = self.shared.registry.write().await;
                match registry.connections.get_mut(name) {
                    Some(entry) if !token.is_cancelled() => {
                        entry.connection = link.connection.clone();
                        true
                    }
                    _ => false,
                }
            };
            if !registered {
                let _ = link.connection.close().await;
                return None;
            }

            match self.rebuild(name, &channels).await {
                Ok(()) => {
                    {
                        let mut registry = self.shared.registry.write().await;
                        registry.set_state(name, ConnectionState::Connected);
                        if registry.default_connection.is_none() {
                            registry.default_connection = Some(name.to_owned());
                        }
                    }
                    info!(
                        connection = name,
                        channels = channels.len(),
                        "amqp connection recovered"
                    );
                    return Some((Arc::downgrade(&link.connection), link.lost));
                }
                Err(err) => {
                    error!(
                        connection = name,
                        error = err.to_string(),
                        "failure to rebuild channels"
                    );
                    self.shared
                        .registry
                        .write()
                        .await
                        .set_state(name, ConnectionState::Failed);
                    let _ = link.connection.close().await;

                    tokio::select! {
                        _ = token.cancelled() => return None,
                        _ = sleep(policy.delay(round)) => {}
                    }
                    round += 1;
                    self.shared
                        .registry
                        .write()
                        .await
                        .set_state(name, ConnectionState::Reconnecting);
                }
            }
        }
    }

    /// Re-opens `channels` on the current connection called `name` and restarts their consumers.
    async fn rebuild(&self, name: &str, channels: &[ChannelEntry]) -> Result<(), AmqpError> {
        for entry in channels {
            self.create_channel(ChannelRequest {
                connection: Some(name.to_owned()),
                name: entry.name.clone(),
                options: entry.options.clone(),
                persist: entry.persist,
            })
            .await?;
        }

        for entry in channels {
            for recipe in &entry.consumers {
                recipe.install(self).await?;
            }
        }

        Ok(())
    }
}

type Watched = (Weak<dyn BrokerConnection>, oneshot::Receiver<AmqpError>);

fn same_connection(watched: &Weak<dyn BrokerConnection>, current: &Arc<dyn BrokerConnection>) -> bool {
    std::ptr::eq(
        watched.as_ptr() as *const (),
        Arc::as_ptr(current) as *const (),
    )
}

/// Waits for the connection called `name` to be reported lost and recovers it.
async fn supervise(
    shared: Weak<Shared>,
    name: String,
    mut connection: Weak<dyn BrokerConnection>,
    mut lost: oneshot::Receiver<AmqpError>,
    token: CancellationToken,
) {
    loop {
        let reason = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            reason = &mut lost => match reason {
                Ok(reason) => reason,
                Err(_) => {
                    debug!(connection = name, "connection dropped, supervisor stops");
                    return;
                }
            },
        };

        let Some(client) = RabbitMQClient::upgrade(&shared) else {
            return;
        };

        warn!(
            connection = name,
            error = reason.to_string(),
            "amqp connection lost, reconnecting"
        );

        match client.recover(&name, &connection, &token).await {
            Some((next, signal)) => {
                connection = next;
                lost = signal;
            }
            None => return,
        }
    }
}
