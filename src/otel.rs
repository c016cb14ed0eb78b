// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Propagation
//!
//! Producers inject the current trace context into the headers of every message they
//! publish; consumers extract it from the delivery and handle the message inside a
//! consumer span named after the routing key.

use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, LongString, ShortString},
};
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::warn;

/// Trace context carrier over the header table of a message.
pub(crate) struct HeaderCarrier<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> HeaderCarrier<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        HeaderCarrier { headers }
    }
}

impl Injector for HeaderCarrier<'_> {
    fn set(&mut self, key: &str, value: String) {
        let key = ShortString::from(key.to_ascii_lowercase());
        self.headers
            .insert(key, AMQPValue::LongString(LongString::from(value)));
    }
}

impl Extractor for HeaderCarrier<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        let Some(AMQPValue::LongString(value)) = self.headers.get(key) else {
            return None;
        };

        match std::str::from_utf8(value.as_bytes()) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(header = key, error = err.to_string(), "undecodable trace header");
                None
            }
        }
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(ShortString::as_str).collect()
    }
}

/// Headers carrying the current trace context.
pub(crate) fn context_headers() -> BTreeMap<ShortString, AMQPValue> {
    let mut headers = BTreeMap::<ShortString, AMQPValue>::default();

    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(
            &Context::current(),
            &mut HeaderCarrier::new(&mut headers),
        )
    });

    headers
}

/// Starts a consumer span for a delivery, continuing the trace found in its headers.
pub(crate) fn new_span(props: &AMQPProperties, tracer: &BoxedTracer, name: &str) -> BoxedSpan {
    let mut headers = props
        .headers()
        .as_ref()
        .map(|h| h.inner().clone())
        .unwrap_or_default();

    let ctx = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderCarrier::new(&mut headers))
    });

    tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx)
}
