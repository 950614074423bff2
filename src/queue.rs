// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Describes the single queue a consuming client reads from and the
//! queue-to-exchange bindings derived from its [`Binding`](crate::exchange::Binding)s.

use crate::delivery::{HeaderValue, Headers};
use serde::{Deserialize, Serialize};

/// Definition of the client's queue.
///
/// An empty name lets the broker generate one. Declaration only happens when
/// `declare` is set; otherwise the queue is expected to exist already.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueDefinition {
    pub name: String,
    pub declare: bool,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    /// Extra arguments, passed to the declaration and to every bind
    pub args: Headers,
}

impl QueueDefinition {
    /// Creates a new, undeclared queue definition with the given name.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    /// Declares the queue whenever a consumer session is built.
    pub fn declare(mut self) -> Self {
        self.declare = true;
        self
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    ///
    /// The delivery stream is opened exclusively as well.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the queue to auto-delete once its last consumer goes away.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Adds a single declaration argument.
    pub fn arg(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.args.insert(key.to_owned(), value.into());
        self
    }
}

/// One queue-to-exchange binding, as sent to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueBinding {
    pub queue_name: String,
    pub exchange_name: String,
    pub routing_key: String,
    pub args: Headers,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// The exchange name and routing key start empty and are set with
    /// [`QueueBinding::exchange`] and [`QueueBinding::routing_key`].
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
            args: Headers::new(),
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn args(mut self, args: &Headers) -> Self {
        self.args = args.clone();
        self
    }
}
