// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the unit tests. It records every call, hands out deliveries
//! pushed with [`FakeChannel::deliver`] and can simulate dial failures and lost connections.

use crate::{
    broker::{Broker, BrokerChannel, BrokerConnection, BrokerLink, ConsumeOptions, DeliveryStream},
    client::RabbitMQClient,
    config::SocketOptions,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::Message,
    queue::{QueueBinding, QueueDefinition},
    registry::{ConnectionEntry, ConnectionState},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::BasicProperties;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::{mpsc, oneshot};

/// Polls `condition` until it holds, failing the test after a while.
pub(crate) async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never met");
}

#[derive(Default)]
struct Faults {
    dials: usize,
    channels: usize,
    queues: Vec<String>,
}

#[derive(Default)]
pub(crate) struct FakeBroker {
    faults: Arc<Mutex<Faults>>,
    urls: Mutex<Vec<String>>,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
}

impl FakeBroker {
    pub(crate) fn new() -> Arc<FakeBroker> {
        Arc::new(FakeBroker::default())
    }

    pub(crate) fn fail_next_dials(&self, count: usize) {
        self.faults.lock().unwrap().dials = count;
    }

    pub(crate) fn fail_next_channels(&self, count: usize) {
        self.faults.lock().unwrap().channels = count;
    }

    pub(crate) fn fail_queue_declarations(&self, queue: &str) {
        self.faults.lock().unwrap().queues.push(queue.to_owned());
    }

    /// Number of dial attempts, failed ones included.
    pub(crate) fn dials(&self) -> usize {
        self.urls.lock().unwrap().len()
    }

    pub(crate) fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }

    /// The `index`-th successfully opened connection.
    pub(crate) fn connection(&self, index: usize) -> Arc<FakeConnection> {
        self.connections.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl Broker for FakeBroker {
    async fn connect(&self, url: &str, _socket: &SocketOptions) -> Result<BrokerLink, AmqpError> {
        self.urls.lock().unwrap().push(url.to_owned());

        {
            let mut faults = self.faults.lock().unwrap();
            if faults.dials > 0 {
                faults.dials -= 1;
                return Err(AmqpError::ConnectionError("connection refused".to_owned()));
            }
        }

        let (tx, lost) = oneshot::channel();
        let connection = Arc::new(FakeConnection {
            faults: self.faults.clone(),
            lost: Mutex::new(Some(tx)),
            channels: Mutex::new(vec![]),
            state: Mutex::new(LinkState::default()),
        });
        self.connections.lock().unwrap().push(connection.clone());

        Ok(BrokerLink { connection, lost })
    }
}

#[derive(Default)]
struct LinkState {
    closed: bool,
    close_calls: usize,
}

pub(crate) struct FakeConnection {
    faults: Arc<Mutex<Faults>>,
    lost: Mutex<Option<oneshot::Sender<AmqpError>>>,
    channels: Mutex<Vec<Arc<FakeChannel>>>,
    state: Mutex<LinkState>,
}

impl FakeConnection {
    pub(crate) fn channels(&self) -> Vec<Arc<FakeChannel>> {
        self.channels.lock().unwrap().clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.state.lock().unwrap().close_calls
    }

    /// Reports the connection lost, ending every consumer stream opened on it.
    pub(crate) fn lose(&self, reason: &str) {
        self.state.lock().unwrap().closed = true;
        for channel in self.channels() {
            channel.drop_consumers();
        }
        if let Some(tx) = self.lost.lock().unwrap().take() {
            let _ = tx.send(AmqpError::ConnectionError(reason.to_owned()));
        }
    }
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if self.is_closed() {
            return Err(AmqpError::ChannelError("connection closed".to_owned()));
        }
        {
            let mut faults = self.faults.lock().unwrap();
            if faults.channels > 0 {
                faults.channels -= 1;
                return Err(AmqpError::ChannelError("channel refused".to_owned()));
            }
        }

        let channel = Arc::new(FakeChannel {
            faults: self.faults.clone(),
            calls: Mutex::new(Calls::default()),
            consumers: Mutex::new(vec![]),
        });
        self.channels.lock().unwrap().push(channel.clone());
        Ok(channel)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        state.close_calls += 1;
        self.lost.lock().unwrap().take();
        Ok(())
    }
}

/// A message published through a [`FakeChannel`].
#[derive(Debug, Clone)]
pub(crate) struct Published {
    pub(crate) exchange: String,
    pub(crate) routing_key: String,
    pub(crate) payload: Vec<u8>,
    pub(crate) properties: BasicProperties,
}

#[derive(Default)]
struct Calls {
    closed: bool,
    qos: Vec<(u16, bool)>,
    queues: Vec<String>,
    exchanges: Vec<String>,
    bindings: Vec<(String, String, String)>,
    consumed: Vec<String>,
    acked: Vec<u64>,
    nacked: Vec<(u64, bool)>,
    published: Vec<Published>,
    anonymous: usize,
}

type DeliverySender = mpsc::UnboundedSender<Result<Message, AmqpError>>;

pub(crate) struct FakeChannel {
    faults: Arc<Mutex<Faults>>,
    calls: Mutex<Calls>,
    consumers: Mutex<Vec<(String, DeliverySender)>>,
}

impl FakeChannel {
    /// A channel that belongs to no connection.
    pub(crate) fn new() -> Arc<FakeChannel> {
        Arc::new(FakeChannel {
            faults: Arc::default(),
            calls: Mutex::new(Calls::default()),
            consumers: Mutex::new(vec![]),
        })
    }

    /// Pushes `message` to the first consumer of `queue`.
    pub(crate) fn deliver(&self, queue: &str, message: Message) {
        let consumers = self.consumers.lock().unwrap();
        if let Some((_, tx)) = consumers.iter().find(|(name, _)| name == queue) {
            let _ = tx.send(Ok(message));
        }
    }

    fn drop_consumers(&self) {
        self.consumers.lock().unwrap().clear();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.calls.lock().unwrap().closed
    }

    pub(crate) fn qos(&self) -> Vec<(u16, bool)> {
        self.calls.lock().unwrap().qos.clone()
    }

    pub(crate) fn declared_queues(&self) -> Vec<String> {
        self.calls.lock().unwrap().queues.clone()
    }

    pub(crate) fn declared_exchanges(&self) -> Vec<String> {
        self.calls.lock().unwrap().exchanges.clone()
    }

    pub(crate) fn bindings(&self) -> Vec<(String, String, String)> {
        self.calls.lock().unwrap().bindings.clone()
    }

    /// Queues consumed on this channel, in registration order.
    pub(crate) fn consumers(&self) -> Vec<String> {
        self.calls.lock().unwrap().consumed.clone()
    }

    pub(crate) fn acked(&self) -> Vec<u64> {
        self.calls.lock().unwrap().acked.clone()
    }

    pub(crate) fn nacked(&self) -> Vec<(u64, bool)> {
        self.calls.lock().unwrap().nacked.clone()
    }

    pub(crate) fn published(&self) -> Vec<Published> {
        self.calls.lock().unwrap().published.clone()
    }
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    async fn basic_qos(&self, prefetch: u16, global: bool) -> Result<(), AmqpError> {
        self.calls.lock().unwrap().qos.push((prefetch, global));
        Ok(())
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        Ok(())
    }

    async fn assert_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        if self.faults.lock().unwrap().queues.iter().any(|q| q == def.name()) {
            return Err(AmqpError::DeclareQueueError(def.name().to_owned()));
        }

        let mut calls = self.calls.lock().unwrap();
        let name = if def.name().is_empty() {
            calls.anonymous += 1;
            format!("amq.gen-{}", calls.anonymous)
        } else {
            def.name().to_owned()
        };
        calls.queues.push(name.clone());
        Ok(name)
    }

    async fn assert_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.calls.lock().unwrap().exchanges.push(def.name().to_owned());
        Ok(())
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.calls.lock().unwrap().bindings.push((
            binding.queue_name.clone(),
            binding.exchange_name.clone(),
            binding.routing_key.clone(),
        ));
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _options: &ConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.consumers.lock().unwrap().push((queue.to_owned(), tx));
        self.calls.lock().unwrap().consumed.push(queue.to_owned());

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        })
        .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.calls.lock().unwrap().acked.push(delivery_tag);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.calls.lock().unwrap().nacked.push((delivery_tag, requeue));
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        self.calls.lock().unwrap().published.push(Published {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            payload: payload.to_vec(),
            properties,
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.calls.lock().unwrap().closed = true;
        self.drop_consumers();
        Ok(())
    }
}

impl RabbitMQClient {
    /// Registers `connection` as if it had been dialed, without a supervisor.
    pub(crate) async fn register_test_connection(
        &self,
        name: &str,
        connection: Arc<dyn BrokerConnection>,
    ) {
        let mut registry = self.shared.registry.write().await;
        registry.connections.insert(
            name.to_owned(),
            ConnectionEntry {
                connection,
                url: self.shared.configs.url.clone(),
                configs: self.shared.configs.connection.clone(),
                state: ConnectionState::Connected,
            },
        );
        if registry.default_connection.is_none() {
            registry.default_connection = Some(name.to_owned());
        }
    }
}
