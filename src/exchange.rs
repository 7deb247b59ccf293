// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Subscribers and publishers only ever talk through topic exchanges. The definition carries
//! the name plus the flags a caller may set through [`ExchangeOptions`].

use serde::Deserialize;

/// Options a caller may tweak when an exchange gets asserted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExchangeOptions {
    /// Survive broker restarts.
    pub durable: bool,
    /// Delete the exchange once its last binding is gone.
    pub auto_delete: bool,
    /// Only reachable from other exchanges.
    pub internal: bool,
}

/// Definition of a RabbitMQ topic exchange with its configuration parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) delete: bool,
    pub(crate) durable: bool,
    pub(crate) internal: bool,
}

impl ExchangeDefinition {
    /// Creates a new non-durable topic exchange definition with the given name.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            delete: false,
            durable: false,
            internal: false,
        }
    }

    /// Applies caller supplied options on top of the current definition.
    pub fn options(mut self, opts: &ExchangeOptions) -> Self {
        self.durable = opts.durable;
        self.delete = opts.auto_delete;
        self.internal = opts.internal;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
