// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration for RabbitMQ
//!
//! Trace context travels in the AMQP header table. Outbound messages get the
//! propagation keys of the caller context, deliveries have them extracted to
//! parent the consumer span.

use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, ShortString},
};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::warn;

/// Writes propagation keys into an outbound header table.
pub(crate) struct HeaderInjector<'a>(&'a mut BTreeMap<ShortString, AMQPValue>);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(
            ShortString::from(key.to_lowercase()),
            AMQPValue::LongString(value.into()),
        );
    }
}

/// Reads propagation keys from the headers of a delivery.
pub(crate) struct HeaderExtractor<'a>(Option<&'a FieldTable>);

impl Extractor for HeaderExtractor<'_> {
    /// Only string values are considered, anything else is not a propagation key.
    fn get(&self, key: &str) -> Option<&str> {
        let value = self.0?.inner().get(key)?;

        let bytes = match value {
            AMQPValue::LongString(s) => s.as_bytes(),
            AMQPValue::ShortString(s) => s.as_str().as_bytes(),
            _ => return None,
        };

        std::str::from_utf8(bytes)
            .map_err(|e| warn!(key, "error decoding header value {:?}", e))
            .ok()
    }

    fn keys(&self) -> Vec<&str> {
        self.0
            .map(|headers| headers.inner().keys().map(|k| k.as_str()).collect())
            .unwrap_or_default()
    }
}

/// Writes the propagation keys of `ctx` into the outbound headers.
pub(crate) fn inject_context(ctx: &Context, headers: &mut BTreeMap<ShortString, AMQPValue>) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderInjector(headers))
    });
}

/// Context propagated in the headers of a delivery.
pub(crate) fn extract_context(props: &AMQPProperties) -> Context {
    global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor(props.headers().as_ref()))
    })
}

/// Creates the consumer span of a delivery.
///
/// # Parameters
/// * `props` - Properties of the delivery, carrying the propagated context
/// * `tracer` - OpenTelemetry tracer
/// * `name` - Name for the new span (the queue being consumed)
///
/// # Returns
/// The extracted context and the span started as its child
pub(crate) fn new_span(props: &AMQPProperties, tracer: &BoxedTracer, name: &str) -> (Context, BoxedSpan) {
    let ctx = extract_context(props);

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
