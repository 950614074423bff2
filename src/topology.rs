// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Session Building
//!
//! Turns a live connection into a ready-to-use session: opens the channel,
//! applies QoS, installs the queue, exchanges and bindings described by the
//! client [`Options`], and for consumer sessions opens the delivery stream.
//!
//! Declarations are idempotent on the broker, so a failed build is simply
//! retried from scratch later; nothing already declared is rolled back.

use crate::{
    broker::{BrokerConnection, BrokerSession, ConsumeOptions},
    delivery::DeliveryStream,
    errors::AmqpError,
    options::{Mode, Options},
    queue::QueueBinding,
};
use std::{fmt, sync::Arc};
use tracing::{debug, error};

/// Which side of the client a session serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Consumer,
    Producer,
}

/// A built session and, for consumers, its delivery stream.
#[derive(Clone)]
pub struct Session {
    pub channel: Arc<dyn BrokerSession>,
    pub deliveries: Option<DeliveryStream>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("deliveries", &self.deliveries.is_some())
            .finish_non_exhaustive()
    }
}

/// Builds sessions according to the client options.
pub struct SessionBuilder<'sb> {
    opts: &'sb Options,
}

impl<'sb> SessionBuilder<'sb> {
    pub fn new(opts: &'sb Options) -> SessionBuilder<'sb> {
        SessionBuilder { opts }
    }

    /// Builds one session on `conn`.
    ///
    /// Steps run in order and the first failure aborts the build:
    /// 1. open the channel
    /// 2. apply QoS
    /// 3. declare the queue (unless producer-only, and only when requested)
    /// 4. declare each exchange when requested, and bind the queue to every
    ///    binding key (unless producer-only)
    /// 5. open the delivery stream (consumer sessions only)
    pub async fn build(
        &self,
        conn: &dyn BrokerConnection,
        kind: SessionKind,
    ) -> Result<Session, AmqpError> {
        debug!(?kind, "creating amqp channel...");
        let channel = conn.open_session().await?;

        if let Err(err) = self.install(channel.as_ref()).await {
            if let Err(close_err) = channel.close().await {
                debug!(error = close_err.to_string(), "failure to close half-built channel");
            }
            return Err(err);
        }

        let deliveries = match kind {
            SessionKind::Consumer => Some(self.open_consumer(channel.as_ref()).await?),
            SessionKind::Producer => None,
        };

        debug!(?kind, "channel created");

        Ok(Session {
            channel,
            deliveries,
        })
    }

    async fn install(&self, channel: &dyn BrokerSession) -> Result<(), AmqpError> {
        channel
            .qos(self.opts.qos_prefetch_count, self.opts.qos_prefetch_size)
            .await?;

        if self.opts.mode != Mode::Producer {
            self.install_queue(channel).await?;
        }

        self.install_exchanges(channel).await
    }

    async fn install_queue(&self, channel: &dyn BrokerSession) -> Result<(), AmqpError> {
        let queue = &self.opts.queue;
        if !queue.declare {
            return Ok(());
        }

        debug!("creating queue: {}", queue.name);
        channel.declare_queue(queue).await.inspect_err(|err| {
            error!(error = err.to_string(), name = queue.name.as_str(), "error to declare the queue");
        })
    }

    async fn install_exchanges(&self, channel: &dyn BrokerSession) -> Result<(), AmqpError> {
        for binding in &self.opts.bindings {
            if binding.exchange_declare {
                debug!("creating exchange: {}", binding.exchange_name);
                channel.declare_exchange(binding).await.inspect_err(|err| {
                    error!(
                        error = err.to_string(),
                        name = binding.exchange_name.as_str(),
                        "error to declare the exchange"
                    );
                })?;
            }

            if self.opts.mode == Mode::Producer {
                continue;
            }

            for key in &binding.binding_keys {
                let queue_binding = QueueBinding::new(&self.opts.queue.name)
                    .exchange(&binding.exchange_name)
                    .routing_key(key)
                    .args(&self.opts.queue.args);

                debug!(
                    "binding queue: {} to the exchange: {} with the key: {}",
                    queue_binding.queue_name, queue_binding.exchange_name, key
                );

                channel.bind_queue(&queue_binding).await.inspect_err(|err| {
                    error!(error = err.to_string(), "error to bind queue to exchange");
                })?;
            }
        }

        Ok(())
    }

    async fn open_consumer(&self, channel: &dyn BrokerSession) -> Result<DeliveryStream, AmqpError> {
        let options = ConsumeOptions {
            consumer_tag: self.opts.consumer_tag.clone(),
            auto_ack: self.opts.auto_ack,
            exclusive: self.opts.queue.exclusive,
        };

        channel
            .consume(&self.opts.queue.name, &options)
            .await
            .inspect_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::{MockBrokerConnection, MockBrokerSession},
        exchange::{Binding, ExchangeKind},
        queue::QueueDefinition,
    };
    use mockall::Sequence;

    fn options(mode: Mode) -> Options {
        Options {
            urls: vec!["amqp://a".to_owned()],
            mode,
            queue: QueueDefinition::new("orders").declare().durable(),
            bindings: vec![Binding::new("events")
                .kind(ExchangeKind::Topic)
                .declare()
                .key("orders.created")
                .key("orders.paid")],
            qos_prefetch_count: 10,
            consumer_tag: "c-rabbit-test".to_owned(),
            ..Default::default()
        }
    }

    fn connection_with(session: MockBrokerSession) -> MockBrokerConnection {
        let session: Arc<dyn BrokerSession> = Arc::new(session);
        let mut conn = MockBrokerConnection::new();
        conn.expect_open_session()
            .times(1)
            .returning(move || Ok(session.clone()));
        conn
    }

    #[tokio::test]
    async fn consumer_session_runs_every_step_in_order() {
        let mut session = MockBrokerSession::new();
        let mut seq = Sequence::new();

        session
            .expect_qos()
            .withf(|count, size| *count == 10 && *size == 0)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        session
            .expect_declare_queue()
            .withf(|queue| queue.name == "orders" && queue.durable)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        session
            .expect_declare_exchange()
            .withf(|binding| binding.exchange_name == "events")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        session
            .expect_bind_queue()
            .withf(|b| b.routing_key == "orders.created" && b.exchange_name == "events")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        session
            .expect_bind_queue()
            .withf(|b| b.routing_key == "orders.paid")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        session
            .expect_consume()
            .withf(|queue, opts| queue.to_string() == "orders" && opts.consumer_tag == "c-rabbit-test")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(DeliveryStream::channel(1).1));

        let opts = options(Mode::Both);
        let conn = connection_with(session);
        let built = SessionBuilder::new(&opts)
            .build(&conn, SessionKind::Consumer)
            .await
            .unwrap();

        assert!(built.deliveries.is_some());
    }

    #[tokio::test]
    async fn producer_only_skips_queue_and_bindings() {
        let mut session = MockBrokerSession::new();
        session.expect_qos().times(1).returning(|_, _| Ok(()));
        session.expect_declare_queue().times(0);
        session
            .expect_declare_exchange()
            .times(1)
            .returning(|_| Ok(()));
        session.expect_bind_queue().times(0);
        session.expect_consume().times(0);

        let opts = options(Mode::Producer);
        let conn = connection_with(session);
        let built = SessionBuilder::new(&opts)
            .build(&conn, SessionKind::Producer)
            .await
            .unwrap();

        assert!(built.deliveries.is_none());
    }

    #[tokio::test]
    async fn undeclared_queue_and_exchange_are_only_bound() {
        let mut session = MockBrokerSession::new();
        session.expect_qos().returning(|_, _| Ok(()));
        session.expect_declare_queue().times(0);
        session.expect_declare_exchange().times(0);
        session.expect_bind_queue().times(2).returning(|_| Ok(()));

        let mut opts = options(Mode::Consumer);
        opts.queue.declare = false;
        opts.bindings[0].exchange_declare = false;

        let conn = connection_with(session);
        assert!(SessionBuilder::new(&opts)
            .build(&conn, SessionKind::Producer)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn failure_aborts_build_and_closes_channel() {
        let mut session = MockBrokerSession::new();
        session.expect_qos().returning(|_, _| Ok(()));
        session
            .expect_declare_queue()
            .returning(|q| Err(AmqpError::DeclareQueueError(q.name.clone())));
        session.expect_declare_exchange().times(0);
        session.expect_consume().times(0);
        session.expect_close().times(1).returning(|| Ok(()));

        let opts = options(Mode::Both);
        let conn = connection_with(session);
        let err = SessionBuilder::new(&opts)
            .build(&conn, SessionKind::Consumer)
            .await
            .unwrap_err();

        assert_eq!(err, AmqpError::DeclareQueueError("orders".to_owned()));
    }

    #[tokio::test]
    async fn open_failure_surfaces_build_error() {
        let mut conn = MockBrokerConnection::new();
        conn.expect_open_session()
            .returning(|| Err(AmqpError::ChannelError("connection closed".to_owned())));

        let opts = options(Mode::Both);
        let err = SessionBuilder::new(&opts)
            .build(&conn, SessionKind::Consumer)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), crate::errors::ErrorKind::Build);
    }
}
