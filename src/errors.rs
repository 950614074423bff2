// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Resilient RabbitMQ Client
//!
//! Every failure the client can produce is an [`AmqpError`]. Variants are
//! grouped into the categories returned by [`AmqpError::kind`], which is how
//! callers should decide whether an error is fatal (configuration, initial
//! connection), recovered in the background (session builds), local to one
//! message (consume) or synchronous to one call (publish, shutdown).

use std::time::Duration;
use thiserror::Error;

/// Broad category of an [`AmqpError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid or missing options; fatal at construction.
    Config,
    /// No endpoint could be dialed.
    Connect,
    /// Opening a session or declaring topology failed.
    Build,
    /// A delivery could not be handled.
    Consume,
    /// A publish failed or was cancelled.
    Publish,
    /// The client was closed or stopped.
    Shutdown,
}

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Options failed validation
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// Error establishing a connection to a single endpoint
    #[error("failure to connect to `{endpoint}`: {reason}")]
    ConnectionError { endpoint: String, reason: String },

    /// Dialing an endpoint did not complete the handshake in time
    #[error("timeout connecting to `{0}` after {1:?}")]
    DialTimeout(String, Duration),

    /// Every configured endpoint failed; holds one entry per attempt
    #[error("unable to dial server, all {} endpoint(s) failed", .0.len())]
    AllEndpointsFailed(Vec<AmqpError>),

    /// The TLS client could not be configured
    #[error("tls configuration error: {0}")]
    TlsError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error opening the delivery stream for a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// No connection is available to build a session on
    #[error("no active connection")]
    NotConnected,

    /// The handler failed for a delivery
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// The delivery had no acknowledgement handle or asked for a reconnect
    #[error("poisoned delivery: {0}")]
    PoisonedDelivery(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error rejecting a message
    #[error("failure to reject message")]
    RejectMessageError,

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// The publish was cancelled before the broker accepted it
    #[error("context cancelled")]
    PublishCancelled,

    /// Closing the producer session after a cancelled publish failed
    #[error("failed to close producer channel: {0}")]
    CloseChannelError(String),

    /// The operation is not permitted in the configured mode
    #[error("unable to {0} - library is configured in {1} mode")]
    ModeNotSupported(&'static str, &'static str),

    /// The client has been closed
    #[error("client is shutdown")]
    Shutdown,

    /// In-flight consumers did not exit in time
    #[error("timeout waiting for consumer to stop after '{0:?}'")]
    StopTimeout(Duration),

    /// Closing the underlying connection failed
    #[error("unable to close amqp connection: {0}")]
    CloseConnectionError(String),
}

impl AmqpError {
    /// Returns the category this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AmqpError::InvalidOptions(_) | AmqpError::ModeNotSupported(..) => ErrorKind::Config,
            AmqpError::ConnectionError { .. }
            | AmqpError::DialTimeout(..)
            | AmqpError::AllEndpointsFailed(_)
            | AmqpError::TlsError(_) => ErrorKind::Connect,
            AmqpError::ChannelError(_)
            | AmqpError::QoSDeclarationError(_)
            | AmqpError::DeclareExchangeError(_)
            | AmqpError::DeclareQueueError(_)
            | AmqpError::BindingExchangeToQueueError(..)
            | AmqpError::BindingConsumerError(_)
            | AmqpError::NotConnected => ErrorKind::Build,
            AmqpError::ConsumerError(_)
            | AmqpError::PoisonedDelivery(_)
            | AmqpError::AckMessageError
            | AmqpError::NackMessageError
            | AmqpError::RejectMessageError => ErrorKind::Consume,
            AmqpError::PublishingError(_)
            | AmqpError::PublishCancelled
            | AmqpError::CloseChannelError(_) => ErrorKind::Publish,
            AmqpError::Shutdown
            | AmqpError::StopTimeout(_)
            | AmqpError::CloseConnectionError(_) => ErrorKind::Shutdown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(AmqpError::InvalidOptions("x".into()).kind(), ErrorKind::Config);
        assert_eq!(AmqpError::AllEndpointsFailed(vec![]).kind(), ErrorKind::Connect);
        assert_eq!(
            AmqpError::DeclareQueueError("q".into()).kind(),
            ErrorKind::Build
        );
        assert_eq!(
            AmqpError::PoisonedDelivery("nil acknowledger".into()).kind(),
            ErrorKind::Consume
        );
        assert_eq!(AmqpError::PublishCancelled.kind(), ErrorKind::Publish);
        assert_eq!(AmqpError::Shutdown.kind(), ErrorKind::Shutdown);
    }

    #[test]
    fn binding_error_names_both_sides() {
        let err = AmqpError::BindingExchangeToQueueError("events".into(), "orders".into());
        assert_eq!(
            err.to_string(),
            "failure to bind exchange `events` to queue `orders`"
        );
    }

    #[test]
    fn aggregated_connect_error_counts_attempts() {
        let err = AmqpError::AllEndpointsFailed(vec![
            AmqpError::ConnectionError {
                endpoint: "amqp://a".into(),
                reason: "refused".into(),
            },
            AmqpError::DialTimeout("amqp://b".into(), Duration::from_secs(1)),
        ]);
        assert_eq!(
            err.to_string(),
            "unable to dial server, all 2 endpoint(s) failed"
        );
    }
}
