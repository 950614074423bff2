// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Deliveries and Delivery Streams
//!
//! Transport-independent representation of an incoming message. A
//! [`Delivery`] owns its payload and headers and, when it came from a live
//! session, an acknowledgement handle. A [`DeliveryStream`] is the shared,
//! read-only feed of deliveries bound to one consumer session; several
//! consume loops may pull from the same stream concurrently.

use crate::errors::AmqpError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, sync::Arc};
use tokio::sync::{mpsc, Mutex};

/// Header that asks the client to rebuild its connection instead of handling
/// the delivery.
pub const FORCE_RECONNECT_HEADER: &str = "rabbit-force-reconnect";

/// Message headers and queue arguments.
pub type Headers = BTreeMap<String, HeaderValue>;

/// A header or argument value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::String(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

/// Acknowledgement handle of a delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;
    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
    async fn reject(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// A message received from the broker.
#[derive(Clone, Default)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub app_id: Option<String>,
    pub message_id: Option<String>,
    pub headers: Headers,
    pub data: Vec<u8>,
    acker: Option<Arc<dyn Acknowledger>>,
}

impl Delivery {
    /// Creates a delivery carrying `data` and no acknowledgement handle.
    pub fn new(data: impl Into<Vec<u8>>) -> Delivery {
        Delivery {
            data: data.into(),
            ..Default::default()
        }
    }

    pub fn with_routing(mut self, exchange: &str, routing_key: &str) -> Self {
        self.exchange = exchange.to_owned();
        self.routing_key = routing_key.to_owned();
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_delivery_tag(mut self, tag: u64) -> Self {
        self.delivery_tag = tag;
        self
    }

    pub fn with_acknowledger(mut self, acker: Arc<dyn Acknowledger>) -> Self {
        self.acker = Some(acker);
        self
    }

    pub fn has_acknowledger(&self) -> bool {
        self.acker.is_some()
    }

    /// Returns why this delivery must not reach a handler, if it must not.
    pub fn poison_reason(&self) -> Option<&'static str> {
        if self.acker.is_none() {
            Some("nil acknowledger detected - sending reconnect signal")
        } else if self.headers.contains_key(FORCE_RECONNECT_HEADER) {
            Some("force reconnect header detected - sending reconnect signal")
        } else {
            None
        }
    }

    pub async fn ack(&self) -> Result<(), AmqpError> {
        self.acknowledger()?.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acknowledger()?.nack(requeue).await
    }

    pub async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acknowledger()?.reject(requeue).await
    }

    fn acknowledger(&self) -> Result<&Arc<dyn Acknowledger>, AmqpError> {
        self.acker
            .as_ref()
            .ok_or_else(|| AmqpError::PoisonedDelivery("nil acknowledger".to_owned()))
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("headers", &self.headers)
            .field("data_len", &self.data.len())
            .field("acknowledger", &self.acker.is_some())
            .finish()
    }
}

/// Shared receiving end of a consumer session's deliveries.
///
/// Cloning is cheap; all clones pull from the same underlying feed, and each
/// delivery is handed to exactly one reader. The stream ends once every
/// sender is gone, which is how a closed session shows up to readers.
#[derive(Clone)]
pub struct DeliveryStream {
    rx: Arc<Mutex<mpsc::Receiver<Delivery>>>,
}

impl DeliveryStream {
    /// Creates a bounded feed and the sender used to fill it.
    pub fn channel(capacity: usize) -> (mpsc::Sender<Delivery>, DeliveryStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            tx,
            DeliveryStream {
                rx: Arc::new(Mutex::new(rx)),
            },
        )
    }

    /// Waits for the next delivery; `None` once the feed is closed.
    pub async fn next(&self) -> Option<Delivery> {
        self.rx.lock().await.recv().await
    }
}

impl fmt::Debug for DeliveryStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryStream").finish_non_exhaustive()
    }
}
