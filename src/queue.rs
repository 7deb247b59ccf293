// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Builder-style queue definitions plus the translation into broker arguments
//! (`x-max-priority`, `x-max-length`, `x-message-ttl`, dead-letter exchange and routing key).
//! A worker's retry queue is nothing more than a durable queue whose dead-letter target is the
//! default exchange routed back to the primary queue.

use lapin::types::{AMQPValue, FieldTable, LongInt, LongString, ShortShortUInt, ShortString};
use serde::Deserialize;

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the header field used to specify the maximum message priority
pub const AMQP_HEADERS_MAX_PRIORITY: &str = "x-max-priority";

/// Options a caller may tweak when a queue gets asserted.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub max_priority: u8,
    pub max_length: Option<i32>,
    pub message_ttl: Option<i32>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        QueueOptions {
            durable: true,
            exclusive: false,
            auto_delete: false,
            max_priority: 0,
            max_length: None,
            message_ttl: None,
        }
    }
}

impl QueueOptions {
    /// Options of the anonymous queue a subscriber binds to its exchange.
    pub fn subscriber() -> Self {
        QueueOptions {
            durable: false,
            exclusive: true,
            auto_delete: true,
            ..QueueOptions::default()
        }
    }
}

/// Definition of a RabbitMQ queue with its configuration parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) max_priority: Option<u8>,
    pub(crate) dead_letter: Option<(String, String)>,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// An empty name asks the broker to generate one.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..QueueDefinition::default()
        }
    }

    /// Applies caller supplied options on top of the current definition.
    pub fn options(mut self, opts: &QueueOptions) -> Self {
        self.durable = opts.durable;
        self.exclusive = opts.exclusive;
        self.delete = opts.auto_delete;
        if opts.max_priority > 0 {
            self.max_priority = Some(opts.max_priority);
        }
        if let Some(max) = opts.max_length {
            self.max_length = Some(max);
        }
        if let Some(ttl) = opts.message_ttl {
            self.ttl = Some(ttl);
        }
        self
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Enables message priorities up to `max` (0 disables them).
    pub fn max_priority(mut self, max: u8) -> Self {
        self.max_priority = if max > 0 { Some(max) } else { None };
        self
    }

    /// Routes dead-lettered (expired or rejected) messages to `exchange` with `routing_key`.
    pub fn dead_letter(mut self, exchange: &str, routing_key: &str) -> Self {
        self.dead_letter = Some((exchange.to_owned(), routing_key.to_owned()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Broker arguments used when declaring this queue.
    pub fn arguments(&self) -> FieldTable {
        let mut args = FieldTable::default();

        if let Some((exchange, routing_key)) = &self.dead_letter {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from(exchange.as_str())),
            );
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(routing_key.as_str())),
            );
        }

        if let Some(ttl) = self.ttl {
            args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongInt(LongInt::from(ttl)),
            );
        }

        if let Some(max) = self.max_length {
            args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH),
                AMQPValue::LongInt(LongInt::from(max)),
            );
        }

        if let Some(max) = self.max_priority {
            args.insert(
                ShortString::from(AMQP_HEADERS_MAX_PRIORITY),
                AMQPValue::ShortShortUInt(ShortShortUInt::from(max)),
            );
        }

        args
    }
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the routing key for the binding.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_queue_has_no_arguments() {
        let def = QueueDefinition::new("tasks").durable();
        assert!(def.arguments().inner().is_empty());
    }

    #[test]
    fn retry_queue_dead_letters_back_to_primary() {
        let def = QueueDefinition::new("tasks_retry")
            .durable()
            .dead_letter("", "tasks")
            .max_length(10_000)
            .max_priority(10);

        let args = def.arguments();
        let inner = args.inner();

        assert_eq!(
            inner.get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            Some(&AMQPValue::LongString(LongString::from("")))
        );
        assert_eq!(
            inner.get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            Some(&AMQPValue::LongString(LongString::from("tasks")))
        );
        assert_eq!(
            inner.get(AMQP_HEADERS_MAX_LENGTH),
            Some(&AMQPValue::LongInt(10_000))
        );
        assert_eq!(
            inner.get(AMQP_HEADERS_MAX_PRIORITY),
            Some(&AMQPValue::ShortShortUInt(10))
        );
    }

    #[test]
    fn zero_max_priority_disables_priorities() {
        let def = QueueDefinition::new("tasks").options(&QueueOptions::default());
        assert_eq!(def.max_priority, None);
        assert!(def.durable);
    }

    #[test]
    fn subscriber_queue_is_exclusive_and_auto_deleted() {
        let def = QueueDefinition::new("").options(&QueueOptions::subscriber());
        assert!(def.exclusive);
        assert!(def.delete);
        assert!(!def.durable);
    }
}
