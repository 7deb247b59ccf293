// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration
//!
//! Everything the client needs to dial the broker and shape worker topologies. All structs
//! deserialize with `serde` and reject unknown keys, so a typo in a channel option or queue
//! setting fails while loading configuration rather than at runtime.

use crate::{errors::AmqpError, message::decode_text, policy::RetryPolicy};
use serde::Deserialize;
use std::env;
use tracing::error;
use url::form_urlencoded;

/// Broker dialed when no URL is configured
pub const DEFAULT_URL: &str = "amqp://localhost";
/// Encoding assumed for payloads that declare none
pub const DEFAULT_ENCODING: &str = "utf-8";

/// Top level configuration of a [`crate::client::RabbitMQClient`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RabbitMQConfigs {
    /// Default broker URL, used by connections created without one.
    pub url: String,
    /// Keep every channel registered and reuse it by name.
    pub preserve_channels: bool,
    /// Encoding assumed for deliveries that declare none.
    pub encoding: String,
    /// Defaults for connections created without their own settings.
    pub connection: ConnectionConfigs,
    /// Retry queue defaults for workers. Overridable per worker.
    pub retry_queue: RetryQueueConfigs,
    /// Done/fail queue defaults for workers. Overridable per worker.
    #[serde(alias = "fail_queue")]
    pub done_queue: DoneQueueConfigs,
    /// Tasks are pushed with `x-retry-count: 0`. When false they carry `-1` and never retry.
    pub task_retry: bool,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            url: DEFAULT_URL.to_owned(),
            preserve_channels: true,
            encoding: DEFAULT_ENCODING.to_owned(),
            connection: ConnectionConfigs::default(),
            retry_queue: RetryQueueConfigs::default(),
            done_queue: DoneQueueConfigs::default(),
            task_retry: true,
        }
    }
}

impl RabbitMQConfigs {
    /// Parses a JSON document into a validated configuration.
    pub fn from_json(raw: &str) -> Result<RabbitMQConfigs, AmqpError> {
        let cfg: RabbitMQConfigs = serde_json::from_str(raw).map_err(|err| {
            error!(error = err.to_string(), "invalid rabbitmq configuration");
            AmqpError::ConfigError(err.to_string())
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Builds a configuration from the defaults overridden by environment variables.
    ///
    /// Recognized: `RABBITMQ_URL`, `RABBITMQ_PRESERVE_CHANNELS`,
    /// `RABBITMQ_RETRY_QUEUE_SUFFIX` and `RABBITMQ_DONE_QUEUE_SUFFIX`.
    pub fn from_env() -> Result<RabbitMQConfigs, AmqpError> {
        let mut cfg = RabbitMQConfigs::default();

        if let Ok(url) = env::var("RABBITMQ_URL") {
            cfg.url = url;
        }

        if let Ok(raw) = env::var("RABBITMQ_PRESERVE_CHANNELS") {
            cfg.preserve_channels = raw.parse().map_err(|_| {
                AmqpError::ConfigError(format!("RABBITMQ_PRESERVE_CHANNELS `{raw}`"))
            })?;
        }

        if let Ok(suffix) = env::var("RABBITMQ_RETRY_QUEUE_SUFFIX") {
            cfg.retry_queue.suffix = Some(suffix);
        }

        if let Ok(suffix) = env::var("RABBITMQ_DONE_QUEUE_SUFFIX") {
            cfg.done_queue.suffix = Some(suffix);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.url.is_empty() {
            return Err(AmqpError::ConfigError("url must not be empty".to_owned()));
        }
        decode_text(&[], Some(&self.encoding))?;
        self.connection.retry.validate()?;
        self.retry_queue.validate()
    }
}

/// Connection level settings.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionConfigs {
    pub socket: SocketOptions,
    pub tuning: TuningOptions,
    pub retry: RetryPolicy,
    /// Return the default connection instead of dialing when one exists.
    pub use_existing_connection: bool,
}

/// Client properties announced to the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SocketOptions {
    pub connection_name: Option<String>,
    pub locale: Option<String>,
}

/// Connection tuning, carried on the URL query string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TuningOptions {
    pub channel_max: Option<u16>,
    pub frame_max: Option<u32>,
    pub heartbeat: Option<u16>,
    pub connection_timeout: Option<u64>,
}

impl TuningOptions {
    pub fn is_empty(&self) -> bool {
        *self == TuningOptions::default()
    }

    /// Appends the tuning parameters to `url` as a query string.
    pub fn apply(&self, url: &str) -> String {
        if self.is_empty() {
            return url.to_owned();
        }

        let mut query = form_urlencoded::Serializer::new(String::new());
        if let Some(v) = self.channel_max {
            query.append_pair("channel_max", &v.to_string());
        }
        if let Some(v) = self.frame_max {
            query.append_pair("frame_max", &v.to_string());
        }
        if let Some(v) = self.heartbeat {
            query.append_pair("heartbeat", &v.to_string());
        }
        if let Some(v) = self.connection_timeout {
            query.append_pair("connection_timeout", &v.to_string());
        }

        format!("{}?{}", url, query.finish())
    }
}

/// Retry bookkeeping for work queues: retry queue naming plus the backoff/priority curve.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryQueueConfigs {
    /// Retry queue name suffix. No suffix means failed tasks go back to the primary queue.
    pub suffix: Option<String>,
    /// Retries allowed before a task is forwarded to the fail queue.
    pub max_count: i64,
    /// Growth of the retry expiration between two attempts.
    pub factor: f64,
    /// Expiration of the first retry, in milliseconds.
    pub min_timeout: u64,
    /// Expiration cap, in milliseconds.
    pub max_timeout: u64,
    /// `x-max-length` of the retry queue.
    pub max_length: i32,
    /// Priority of the first retry. Later retries get lower priorities, 0 disables them.
    pub max_priority: u8,
}

impl Default for RetryQueueConfigs {
    fn default() -> Self {
        RetryQueueConfigs {
            suffix: Some("_retry".to_owned()),
            max_count: 10,
            factor: 2.0,
            min_timeout: 1000,
            max_timeout: 60 * 1000,
            max_length: 10_000,
            max_priority: 0,
        }
    }
}

impl RetryQueueConfigs {
    /// Name of the retry queue of `queue`, when retry queues are enabled.
    pub fn queue_name(&self, queue: &str) -> Option<String> {
        enabled_suffix(&self.suffix).map(|suffix| format!("{queue}{suffix}"))
    }

    pub(crate) fn validate(&self) -> Result<(), AmqpError> {
        if self.max_count <= 0 {
            return Err(AmqpError::ConfigError(
                "retry_queue max_count must be positive".to_owned(),
            ));
        }
        if self.factor < 1.0 {
            return Err(AmqpError::ConfigError(
                "retry_queue factor must be >= 1".to_owned(),
            ));
        }
        if self.min_timeout > self.max_timeout {
            return Err(AmqpError::ConfigError(
                "retry_queue min_timeout exceeds max_timeout".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Terminal sink recording successes (with history) and permanent failures.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DoneQueueConfigs {
    /// Done queue name suffix. No (or an empty) suffix disables the queue.
    pub suffix: Option<String>,
    /// `x-max-length` of the done queue.
    pub max_length: i32,
}

impl Default for DoneQueueConfigs {
    fn default() -> Self {
        DoneQueueConfigs {
            suffix: None,
            max_length: 10_000,
        }
    }
}

impl DoneQueueConfigs {
    /// Name of the done/fail queue of `queue`, when enabled.
    pub fn queue_name(&self, queue: &str) -> Option<String> {
        enabled_suffix(&self.suffix).map(|suffix| format!("{queue}{suffix}"))
    }
}

fn enabled_suffix(suffix: &Option<String>) -> Option<&str> {
    suffix.as_deref().filter(|s| !s.is_empty())
}

/// Channel level tuning. Each variant maps to exactly one channel operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelOption {
    /// `basic.qos` scoped to each consumer.
    Prefetch(u16),
    /// `basic.qos` shared by the whole channel.
    GlobalPrefetch(u16),
    /// Puts the channel in publisher confirm mode.
    Confirm,
}

/// Ordered set of channel options. Later entries of the same kind replace earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct ChannelOptions(Vec<ChannelOption>);

impl ChannelOptions {
    /// An empty option set.
    pub fn new() -> Self {
        ChannelOptions::default()
    }

    /// Adds `option`, replacing an option of the same kind.
    pub fn with(mut self, option: ChannelOption) -> Self {
        self.0
            .retain(|existing| std::mem::discriminant(existing) != std::mem::discriminant(&option));
        self.0.push(option);
        self
    }

    /// `self` with every option of `overrides` applied on top.
    pub fn merge(&self, overrides: &ChannelOptions) -> ChannelOptions {
        overrides
            .iter()
            .fold(self.clone(), |acc, option| acc.with(*option))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChannelOption> {
        self.0.iter()
    }
}
