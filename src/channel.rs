// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! lapin-backed implementation of the broker traits in [`crate::broker`]. It
//! dials connections, opens channels on them, translates topology calls and
//! forwards lapin's consumer stream into a [`DeliveryStream`].

use crate::{
    broker::{
        BrokerConnection, BrokerSession, CloseNotification, ConsumeOptions, Connector,
        DialSettings, PublishProperties,
    },
    connection::redact,
    delivery::{Acknowledger, Delivery, DeliveryStream, HeaderValue, Headers},
    errors::AmqpError,
    exchange::Binding,
    queue::{QueueBinding, QueueDefinition},
    tls::{insecure_connect, Transport},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, ByteArray, FieldTable, LongString, ShortString},
    uri::AMQPUri,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

/// Buffer between lapin's consumer and the consume loops.
const DELIVERY_BUFFER: usize = 64;

/// Persistent delivery mode.
const PERSISTENT: u8 = 2;

/// Dials RabbitMQ with lapin.
#[derive(Debug, Default, Clone, Copy)]
pub struct LapinConnector;

#[async_trait]
impl Connector for LapinConnector {
    async fn dial(
        &self,
        endpoint: &str,
        settings: &DialSettings,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let uri = match (settings.use_tls, endpoint.strip_prefix("amqp://")) {
            (true, Some(rest)) => format!("amqps://{rest}"),
            _ => endpoint.to_owned(),
        };
        let connect_error = |reason: String| {
            error!(error = reason.as_str(), "failure to connect");
            AmqpError::ConnectionError {
                endpoint: redact(endpoint),
                reason,
            }
        };

        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(settings.connection_name.clone()));

        let uri: AMQPUri = uri.parse().map_err(connect_error)?;
        let conn = match Transport::select(&uri, settings) {
            Transport::Default => Connection::connect_uri(uri, options).await,
            Transport::InsecureTls => {
                let connect = insecure_connect(settings.timeout)?;
                Connection::connector(uri, connect, options).await
            }
        }
        .map_err(|err| connect_error(err.to_string()))?;
        debug!("amqp connected");

        let closed: Arc<Mutex<Vec<oneshot::Sender<String>>>> = Arc::default();
        conn.on_error({
            let closed = closed.clone();
            move |err| {
                let reason = err.to_string();
                let mut waiters = closed.lock().unwrap_or_else(PoisonError::into_inner);
                for tx in waiters.drain(..) {
                    let _ = tx.send(reason.clone());
                }
            }
        });

        Ok(Arc::new(LapinConnection { conn, closed }))
    }
}

/// A lapin connection.
pub struct LapinConnection {
    conn: Connection,
    closed: Arc<Mutex<Vec<oneshot::Sender<String>>>>,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn open_session(&self) -> Result<Arc<dyn BrokerSession>, AmqpError> {
        match self.conn.create_channel().await {
            Ok(channel) => Ok(Arc::new(LapinSession { channel })),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    fn notify_close(&self) -> CloseNotification {
        let (tx, rx) = oneshot::channel();
        if self.conn.status().connected() {
            self.closed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(tx);
        } else {
            let _ = tx.send("connection is not open".to_owned());
        }
        rx
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.conn.status().connected() {
            return Ok(());
        }

        self.conn.close(200, "OK").await.map_err(|err| {
            error!(error = err.to_string(), "failure to close the connection");
            AmqpError::CloseConnectionError(err.to_string())
        })
    }
}

/// A lapin channel.
pub struct LapinSession {
    channel: Channel,
}

#[async_trait]
impl BrokerSession for LapinSession {
    async fn qos(&self, prefetch_count: u16, prefetch_size: u32) -> Result<(), AmqpError> {
        if prefetch_size != 0 {
            warn!(prefetch_size, "qos prefetch size is not supported by the transport, ignoring");
        }

        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn declare_exchange(&self, binding: &Binding) -> Result<(), AmqpError> {
        let kind = binding.exchange_type.clone().unwrap_or_default();

        self.channel
            .exchange_declare(
                &binding.exchange_name,
                kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: binding.exchange_durable,
                    auto_delete: binding.exchange_auto_delete,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                debug!(error = err.to_string(), "exchange declare rejected");
                AmqpError::DeclareExchangeError(binding.exchange_name.clone())
            })
    }

    async fn declare_queue(&self, queue: &QueueDefinition) -> Result<(), AmqpError> {
        self.channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: queue.durable,
                    exclusive: queue.exclusive,
                    auto_delete: queue.auto_delete,
                    nowait: false,
                },
                field_table(&queue.args),
            )
            .await
            .map(|_| ())
            .map_err(|err| {
                debug!(error = err.to_string(), "queue declare rejected");
                AmqpError::DeclareQueueError(queue.name.clone())
            })
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                field_table(&binding.args),
            )
            .await
            .map_err(|err| {
                debug!(error = err.to_string(), "queue bind rejected");
                AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                )
            })
    }

    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError> {
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                &options.consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: options.auto_ack,
                    exclusive: options.exclusive,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                debug!(error = err.to_string(), "basic consume rejected");
                AmqpError::BindingConsumerError(queue.to_owned())
            })?;

        let (tx, deliveries) = DeliveryStream::channel(DELIVERY_BUFFER);

        tokio::spawn(async move {
            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => {
                        if tx.send(into_delivery(delivery)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        error!(error = err.to_string(), "errors consume msg");
                        break;
                    }
                }
            }
            debug!("consumer stream finished");
        });

        Ok(deliveries)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> Result<(), AmqpError> {
        let mut props = BasicProperties::default()
            .with_app_id(ShortString::from(properties.app_id.clone()))
            .with_message_id(ShortString::from(properties.message_id.clone()))
            .with_headers(field_table(&properties.headers));
        if properties.persistent {
            props = props.with_delivery_mode(PERSISTENT);
        }

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                props,
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                AmqpError::PublishingError(err.to_string())
            })?;

        match confirm.await {
            Ok(confirmation) if confirmation.is_nack() => Err(AmqpError::PublishingError(
                "message was nacked by the broker".to_owned(),
            )),
            Ok(_) => Ok(()),
            Err(err) => Err(AmqpError::PublishingError(err.to_string())),
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.channel.status().connected() {
            return Ok(());
        }

        self.channel
            .close(200, "OK")
            .await
            .map_err(|err| AmqpError::CloseChannelError(err.to_string()))
    }
}

struct LapinAcker(Acker);

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.0
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.0
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling reject msg");
                AmqpError::RejectMessageError
            })
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let props = &delivery.properties;

    let headers: Headers = props
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .filter_map(|(key, value)| Some((key.to_string(), header_value(value)?)))
                .collect()
        })
        .unwrap_or_default();

    let mut out = Delivery::new(delivery.data)
        .with_routing(delivery.exchange.as_str(), delivery.routing_key.as_str())
        .with_headers(headers)
        .with_delivery_tag(delivery.delivery_tag)
        .with_acknowledger(Arc::new(LapinAcker(delivery.acker)));
    out.redelivered = delivery.redelivered;
    out.app_id = props.app_id().as_ref().map(|id| id.to_string());
    out.message_id = props.message_id().as_ref().map(|id| id.to_string());
    out
}

/// Converts crate headers to an AMQP field table.
fn field_table(headers: &Headers) -> FieldTable {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();

    for (key, value) in headers {
        let amqp_value = match value {
            HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
            HeaderValue::Int(v) => AMQPValue::LongLongInt(*v),
            HeaderValue::Float(v) => AMQPValue::Double(*v),
            HeaderValue::String(v) => AMQPValue::LongString(LongString::from(v.clone())),
            HeaderValue::Bytes(v) => AMQPValue::ByteArray(ByteArray::from(v.clone())),
        };

        btree.insert(ShortString::from(key.clone()), amqp_value);
    }

    FieldTable::from(btree)
}

/// Converts one AMQP value; nested tables and arrays are not carried over.
fn header_value(value: &AMQPValue) -> Option<HeaderValue> {
    let value = match value {
        AMQPValue::Boolean(v) => HeaderValue::Bool(*v),
        AMQPValue::ShortShortInt(v) => HeaderValue::Int((*v).into()),
        AMQPValue::ShortShortUInt(v) => HeaderValue::Int((*v).into()),
        AMQPValue::ShortInt(v) => HeaderValue::Int((*v).into()),
        AMQPValue::ShortUInt(v) => HeaderValue::Int((*v).into()),
        AMQPValue::LongInt(v) => HeaderValue::Int((*v).into()),
        AMQPValue::LongUInt(v) => HeaderValue::Int((*v).into()),
        AMQPValue::LongLongInt(v) => HeaderValue::Int(*v),
        AMQPValue::Timestamp(v) => HeaderValue::Int(i64::try_from(*v).ok()?),
        AMQPValue::Float(v) => HeaderValue::Float((*v).into()),
        AMQPValue::Double(v) => HeaderValue::Float(*v),
        AMQPValue::ShortString(v) => HeaderValue::String(v.to_string()),
        AMQPValue::LongString(v) => match std::str::from_utf8(v.as_bytes()) {
            Ok(s) => HeaderValue::String(s.to_owned()),
            Err(_) => HeaderValue::Bytes(v.as_bytes().to_vec()),
        },
        AMQPValue::ByteArray(v) => HeaderValue::Bytes(v.as_slice().to_vec()),
        _ => return None,
    };
    Some(value)
}
