// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Bindings
//!
//! A [`Binding`] names the exchange a client talks to, how (and whether) to
//! declare it, and the binding keys used to attach the client's queue to it.
//! Consumers need at least one binding key per binding; a publishing client
//! must have exactly one binding, which is the exchange every publish targets.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Represents the types of exchanges available in RabbitMQ.
///
/// Unknown names are kept as [`ExchangeKind::Custom`] so plugin exchange types
/// (for example `x-delayed-message`) pass straight through to the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    Custom(String),
}

impl From<&str> for ExchangeKind {
    fn from(value: &str) -> Self {
        match value {
            "direct" => ExchangeKind::Direct,
            "fanout" => ExchangeKind::Fanout,
            "topic" => ExchangeKind::Topic,
            "headers" => ExchangeKind::Headers,
            other => ExchangeKind::Custom(other.to_owned()),
        }
    }
}

impl From<String> for ExchangeKind {
    fn from(value: String) -> Self {
        ExchangeKind::from(value.as_str())
    }
}

impl From<ExchangeKind> for String {
    fn from(value: ExchangeKind) -> Self {
        value.to_string()
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Direct => f.write_str("direct"),
            ExchangeKind::Fanout => f.write_str("fanout"),
            ExchangeKind::Topic => f.write_str("topic"),
            ExchangeKind::Headers => f.write_str("headers"),
            ExchangeKind::Custom(name) => f.write_str(name),
        }
    }
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(value: ExchangeKind) -> Self {
        match value {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Custom(name) => lapin::ExchangeKind::Custom(name),
        }
    }
}

/// Association of the client's queue to one exchange.
///
/// Built with the same chaining style as the rest of the topology types:
///
/// ```
/// use rabbit::exchange::{Binding, ExchangeKind};
///
/// let binding = Binding::new("events")
///     .kind(ExchangeKind::Topic)
///     .declare()
///     .durable()
///     .key("orders.#");
/// assert_eq!(binding.binding_keys, vec!["orders.#".to_owned()]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Binding {
    /// Required
    pub exchange_name: String,

    /// Required when `exchange_declare` is set
    pub exchange_type: Option<ExchangeKind>,

    /// Declare the exchange on every (re)connect
    pub exchange_declare: bool,

    /// Survive broker restarts
    pub exchange_durable: bool,

    /// Delete once no longer used; only meaningful when declaring
    pub exchange_auto_delete: bool,

    /// Routing patterns the queue is bound with
    pub binding_keys: Vec<String>,
}

impl Binding {
    /// Creates a binding to the exchange with the given name.
    ///
    /// The exchange is not declared by default and no binding keys are set.
    pub fn new(exchange: &str) -> Binding {
        Binding {
            exchange_name: exchange.to_owned(),
            ..Default::default()
        }
    }

    /// Sets the exchange type.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.exchange_type = Some(kind);
        self
    }

    /// Declares the exchange whenever a session is built.
    pub fn declare(mut self) -> Self {
        self.exchange_declare = true;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.exchange_durable = true;
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn auto_delete(mut self) -> Self {
        self.exchange_auto_delete = true;
        self
    }

    /// Adds a binding key.
    pub fn key(mut self, key: &str) -> Self {
        self.binding_keys.push(key.to_owned());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parses_known_and_custom_names() {
        assert_eq!(ExchangeKind::from("topic"), ExchangeKind::Topic);
        assert_eq!(
            ExchangeKind::from("x-delayed-message"),
            ExchangeKind::Custom("x-delayed-message".to_owned())
        );
        assert_eq!(ExchangeKind::Fanout.to_string(), "fanout");
    }

    #[test]
    fn binding_deserializes_with_defaults() {
        let binding: Binding = serde_json::from_str(
            r#"{"exchange_name":"events","exchange_type":"topic","binding_keys":["a.*"]}"#,
        )
        .unwrap();

        assert_eq!(binding.exchange_type, Some(ExchangeKind::Topic));
        assert!(!binding.exchange_declare);
        assert_eq!(binding.binding_keys, vec!["a.*".to_owned()]);
    }
}
