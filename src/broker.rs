// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Protocol Seam
//!
//! The wire protocol (dialing, TLS, framing, acknowledgement mechanics) is
//! owned by a protocol client library. These traits are the only surface the
//! resilience layer needs from it. [`crate::channel`] implements them on top
//! of lapin; tests implement them in memory.

use crate::{
    delivery::{DeliveryStream, Headers},
    errors::AmqpError,
    exchange::Binding,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tokio::sync::oneshot;

/// Fires once with a reason when the connection is lost.
pub type CloseNotification = oneshot::Receiver<String>;

/// Parameters applied to every dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialSettings {
    /// Deadline for transport plus protocol handshake
    pub timeout: Duration,
    pub use_tls: bool,
    pub skip_verify_tls: bool,
    /// Reported to the broker as the connection name
    pub connection_name: String,
}

/// Options for opening a delivery stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub consumer_tag: String,
    pub auto_ack: bool,
    pub exclusive: bool,
}

/// Properties stamped on a published message.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishProperties {
    pub app_id: String,
    pub message_id: String,
    pub persistent: bool,
    pub headers: Headers,
}

/// Dials a single endpoint.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn dial(
        &self,
        endpoint: &str,
        settings: &DialSettings,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// A live broker connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Opens a new session (channel) on this connection.
    async fn open_session(&self) -> Result<Arc<dyn BrokerSession>, AmqpError>;

    /// Subscribes to the loss of this connection.
    fn notify_close(&self) -> CloseNotification;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A logical channel over a [`BrokerConnection`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerSession: Send + Sync {
    async fn qos(&self, prefetch_count: u16, prefetch_size: u32) -> Result<(), AmqpError>;

    async fn declare_exchange(&self, binding: &Binding) -> Result<(), AmqpError>;

    async fn declare_queue(&self, queue: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}
