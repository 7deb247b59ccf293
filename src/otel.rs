// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Trace context travels in the message headers: publishers inject the caller's context and
//! both consumer pipelines extract it to open a consumer span around the handler.

use crate::errors::AmqpError;
use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{Span, SpanKind, Status, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::error;

/// Adapter reading and writing trace context in AMQP headers.
pub(crate) struct RabbitMQTracePropagator<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> RabbitMQTracePropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for RabbitMQTracePropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for RabbitMQTracePropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|header_value| {
            if let AMQPValue::LongString(header_value) = header_value {
                std::str::from_utf8(header_value.as_bytes())
                    .map_err(|e| error!("Error decoding header value {:?}", e))
                    .ok()
            } else {
                None
            }
        })
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Writes the trace context of `ctx` into `headers`.
pub(crate) fn inject(ctx: &Context, headers: &mut FieldTable) {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut RabbitMQTracePropagator::new(&mut btree))
    });

    for (key, value) in btree {
        headers.insert(key, value);
    }
}

/// Extracts the publisher's context from `props` and opens a consumer span named `name`.
pub fn new_span(props: &BasicProperties, tracer: &BoxedTracer, name: &str) -> (Context, BoxedSpan) {
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&RabbitMQTracePropagator::new(
            &mut props.headers().clone().unwrap_or_default().inner().clone(),
        ))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

/// Closes `span` with the status matching `result`.
pub(crate) fn finish<T>(span: &mut BoxedSpan, result: &Result<T, AmqpError>) {
    match result {
        Ok(_) => span.set_status(Status::Ok),
        Err(err) => {
            span.record_error(err);
            span.set_status(Status::Error {
                description: Cow::from(err.to_string()),
            });
        }
    }
    span.end();
}
