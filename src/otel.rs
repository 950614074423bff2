// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Propagates trace context through message headers: the publish path
//! injects the caller's context into outgoing headers, the consume path
//! extracts it from delivery headers and opens a consumer span around the
//! handler.

use crate::delivery::{HeaderValue, Headers};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::borrow::Cow;

/// Writes propagation fields into outgoing headers.
///
/// Keys the caller already set are left untouched.
pub(crate) struct HeaderInjector<'a> {
    headers: &'a mut Headers,
}

impl<'a> HeaderInjector<'a> {
    pub(crate) fn new(headers: &'a mut Headers) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers
            .entry(key.to_lowercase())
            .or_insert(HeaderValue::String(value));
    }
}

/// Reads propagation fields from delivery headers.
pub(crate) struct HeaderExtractor<'a> {
    headers: &'a Headers,
}

impl<'a> HeaderExtractor<'a> {
    pub(crate) fn new(headers: &'a Headers) -> Self {
        Self { headers }
    }
}

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        match self.headers.get(key) {
            Some(HeaderValue::String(value)) => Some(value.as_str()),
            Some(HeaderValue::Bytes(value)) => std::str::from_utf8(value).ok(),
            _ => None,
        }
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|key| key.as_str()).collect()
    }
}

/// Injects `ctx` into `headers` through the global propagator.
///
/// # Parameters
/// * `ctx` - Context whose span is propagated
/// * `headers` - Outgoing headers; existing keys win over propagation fields
pub(crate) fn inject(ctx: &Context, headers: &mut Headers) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderInjector::new(headers))
    });
}

/// Extracts the parent context from `headers` and starts a consumer span
/// named `name` under it.
///
/// # Parameters
/// * `headers` - Headers of the received delivery
/// * `tracer` - Tracer the span is started on
/// * `name` - Span name, usually `"<queue> receive"`
///
/// # Returns
/// A tuple of the extracted parent context and the started span. Attach the
/// span with `parent.with_span(span)` to hand it to a handler.
pub fn new_span(headers: &Headers, tracer: &BoxedTracer, name: &str) -> (Context, BoxedSpan) {
    let parent = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor::new(headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &parent);

    (parent, span)
}
