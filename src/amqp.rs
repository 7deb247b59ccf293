// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # lapin Broker
//!
//! Implementation of the [`crate::broker`] traits on top of `lapin`. Connection errors
//! reported by lapin are forwarded once through the [`BrokerLink::lost`] signal, which is
//! what the connection supervisor waits on.

use crate::{
    broker::{Broker, BrokerChannel, BrokerConnection, BrokerLink, ConsumeOptions, DeliveryStream},
    config::SocketOptions,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::Message,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, error};

const REPLY_SUCCESS: u16 = 200;

/// Dials RabbitMQ through lapin.
#[derive(Debug, Clone, Default)]
pub struct LapinBroker;

impl LapinBroker {
    pub fn new() -> Arc<LapinBroker> {
        Arc::new(LapinBroker)
    }
}

#[async_trait]
impl Broker for LapinBroker {
    async fn connect(&self, url: &str, socket: &SocketOptions) -> Result<BrokerLink, AmqpError> {
        debug!("creating amqp connection...");

        let mut options = ConnectionProperties::default();
        if let Some(name) = &socket.connection_name {
            options = options.with_connection_name(LongString::from(name.as_str()));
        }
        if let Some(locale) = &socket.locale {
            options.locale = locale.clone();
        }

        let conn = match Connection::connect(url, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        let (tx, lost) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        conn.on_error(move |err| {
            error!(error = err.to_string(), "amqp connection error");
            if let Some(tx) = tx.lock().ok().and_then(|mut guard| guard.take()) {
                let _ = tx.send(AmqpError::ConnectionError(err.to_string()));
            }
        });

        Ok(BrokerLink {
            connection: Arc::new(LapinConnection { conn }),
            lost,
        })
    }
}

struct LapinConnection {
    conn: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.conn.status().connected() {
            return Ok(());
        }
        self.conn
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to close connection");
                AmqpError::CloseError(err.to_string())
            })
    }
}

struct LapinChannel {
    channel: Channel,
}

impl From<Delivery> for Message {
    fn from(delivery: Delivery) -> Message {
        Message {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            data: delivery.data,
            properties: delivery.properties,
        }
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn basic_qos(&self, prefetch: u16, global: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions { global })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to enable publisher confirms");
                AmqpError::ChannelError(err.to_string())
            })
    }

    async fn assert_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        debug!("creating queue: {}", def.name);

        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                def.arguments(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = def.name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            Ok(queue) => {
                debug!("queue: {} was created", queue.name());
                Ok(queue.name().to_string())
            }
        }
    }

    async fn assert_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        match self
            .channel
            .exchange_declare(
                &def.name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        self.channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                )
            })
    }

    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &options.consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::ConsumerDeclarationError(queue.to_owned())
            })?;

        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(Message::from)
                    .map_err(|err| AmqpError::ConsumerDeclarationError(err.to_string()))
            })
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                properties,
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                AmqpError::PublishingError(err.to_string())
            })?;

        let confirmation = confirm.await.map_err(|err| {
            error!(error = err.to_string(), "error waiting publisher confirm");
            AmqpError::PublishingError(err.to_string())
        })?;

        if confirmation.is_nack() {
            return Err(AmqpError::PublishingError(
                "publisher confirm nack".to_owned(),
            ));
        }

        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to close channel");
                AmqpError::CloseError(err.to_string())
            })
    }
}
