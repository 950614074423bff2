// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer
//!
//! The consume loop behind [`crate::RabbitClient::consume`] and
//! [`crate::RabbitClient::consume_once`]. Each delivery is either poisoned
//! (no acknowledgement handle, or it carries [`FORCE_RECONNECT_HEADER`]), in
//! which case it is reported and a reconnect is requested, or it is handed to
//! the caller's handler inside a consumer span, with the optional
//! [`RetryPolicy`] applied to failures.
//!
//! Failures are reported to the caller's error sink as [`ConsumeError`]s.
//! Reporting never blocks the loop: when the sink is full or gone, the
//! report is dropped after being logged.
//!
//! [`FORCE_RECONNECT_HEADER`]: crate::delivery::FORCE_RECONNECT_HEADER

use crate::{
    client::Shared,
    delivery::Delivery,
    errors::AmqpError,
    handler::DeliveryHandler,
    otel,
    retry::RetryPolicy,
    watcher::ReconnectRequest,
};
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Status, TraceContextExt},
};
use std::borrow::Cow;
use thiserror::Error;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const TRACER_NAME: &str = "amqp consumer";

/// A failure reported by the consume loop.
#[derive(Error, Debug, Clone)]
#[error("{description}")]
pub struct ConsumeError {
    /// The delivery that failed; `None` when the delivery stream itself ended
    pub message: Option<Delivery>,
    pub error: AmqpError,
    /// Handler invocations so far for this delivery (0 when it was never
    /// handed to the handler)
    pub attempt: u32,
    /// No further attempt will be made for this delivery
    pub terminal: bool,
    description: String,
}

impl ConsumeError {
    fn poisoned(message: Option<Delivery>, reason: &str) -> ConsumeError {
        let error = AmqpError::PoisonedDelivery(reason.to_owned());
        ConsumeError {
            description: format!("error during consume: {error}"),
            message,
            error,
            attempt: 0,
            terminal: true,
        }
    }

    fn retrying(message: &Delivery, error: AmqpError, attempt: u32, count: String) -> ConsumeError {
        ConsumeError {
            description: format!("[Retry {count}] error during consume: {error}"),
            message: Some(message.clone()),
            error,
            attempt,
            terminal: false,
        }
    }

    fn terminal(message: &Delivery, error: AmqpError, attempt: u32) -> ConsumeError {
        ConsumeError {
            description: format!("error during consume: {error}"),
            message: Some(message.clone()),
            error,
            attempt,
            terminal: true,
        }
    }
}

/// What the loop pulled from the current session.
enum Next {
    Message { delivery: Delivery, generation: u64 },
    /// The stream closed while still the current one.
    StreamEnded { generation: u64 },
    Stopped,
}

/// Result of handling one delivery.
enum Handled {
    Done,
    Failed { error: AmqpError, attempt: u32 },
    /// Stopped during a retry backoff; carries the last handler failure.
    Interrupted { error: AmqpError, attempt: u32 },
}

/// One consume invocation.
pub(crate) struct ConsumeLoop<'c> {
    shared: &'c Shared,
    cancel: &'c CancellationToken,
    handler: &'c dyn DeliveryHandler,
    retry: Option<&'c RetryPolicy>,
    tracer: BoxedTracer,
}

impl<'c> ConsumeLoop<'c> {
    pub(crate) fn new(
        shared: &'c Shared,
        cancel: &'c CancellationToken,
        handler: &'c dyn DeliveryHandler,
        retry: Option<&'c RetryPolicy>,
    ) -> ConsumeLoop<'c> {
        ConsumeLoop {
            shared,
            cancel,
            handler,
            retry,
            tracer: global::tracer(TRACER_NAME),
        }
    }

    /// Handles deliveries until the caller or the instance is cancelled.
    ///
    /// Poisoned deliveries and closed streams are reported and trigger a
    /// reconnect; the loop then resumes on the rebuilt session.
    ///
    /// # Parameters
    /// * `errors` - Optional sink for failure reports; a full or closed sink
    ///   drops the report instead of blocking
    pub(crate) async fn run(&self, errors: Option<&mpsc::Sender<ConsumeError>>) {
        loop {
            match self.next().await {
                Next::Stopped => break,
                Next::StreamEnded { generation } => {
                    report(errors, ConsumeError::poisoned(None, "delivery stream closed"));
                    self.request_reconnect(generation, "delivery stream closed");
                    if !self.wait_rebuild(generation).await {
                        break;
                    }
                }
                Next::Message {
                    delivery,
                    generation,
                } => {
                    if let Some(reason) = delivery.poison_reason() {
                        report(errors, ConsumeError::poisoned(Some(delivery), reason));
                        self.request_reconnect(generation, reason);
                        continue;
                    }

                    match self.handle(&delivery, errors).await {
                        Handled::Done => {}
                        Handled::Failed { error, attempt } => {
                            report(errors, ConsumeError::terminal(&delivery, error, attempt));
                        }
                        Handled::Interrupted { error, attempt } => {
                            report(errors, ConsumeError::terminal(&delivery, error, attempt));
                            break;
                        }
                    }
                }
            }
        }

        debug!("consume loop stopped");
    }

    /// Handles a single delivery and returns its terminal error, if any.
    ///
    /// # Returns
    /// `Ok(())` when the handler succeeded or the loop was stopped before a
    /// delivery arrived, the last handler error once retries are exhausted,
    /// or [`AmqpError::PoisonedDelivery`] after requesting a reconnect
    pub(crate) async fn run_once(&self) -> Result<(), AmqpError> {
        match self.next().await {
            Next::Stopped => Ok(()),
            Next::StreamEnded { generation } => {
                self.request_reconnect(generation, "delivery stream closed");
                Err(AmqpError::PoisonedDelivery("delivery stream closed".to_owned()))
            }
            Next::Message {
                delivery,
                generation,
            } => {
                if let Some(reason) = delivery.poison_reason() {
                    self.request_reconnect(generation, reason);
                    return Err(AmqpError::PoisonedDelivery(reason.to_owned()));
                }

                match self.handle(&delivery, None).await {
                    Handled::Done => Ok(()),
                    Handled::Failed { error, .. } | Handled::Interrupted { error, .. } => Err(error),
                }
            }
        }
    }

    /// Waits for the next delivery of the current session. A stream replaced
    /// by a rebuild is dropped in favour of the new one.
    async fn next(&self) -> Next {
        loop {
            let snapshot = tokio::select! {
                biased;
                _ = self.stopped() => return Next::Stopped,
                snapshot = self.shared.guard.consumer_snapshot() => snapshot,
            };
            let generation = snapshot.generation;

            let Some(deliveries) = snapshot.deliveries else {
                if !self.wait_rebuild(generation).await {
                    return Next::Stopped;
                }
                continue;
            };

            tokio::select! {
                biased;
                _ = self.stopped() => return Next::Stopped,
                _ = self.shared.guard.rebuilt_since(generation) => continue,
                delivery = deliveries.next() => match delivery {
                    Some(delivery) => return Next::Message { delivery, generation },
                    None if self.shared.guard.generation() > generation => continue,
                    None => return Next::StreamEnded { generation },
                },
            }
        }
    }

    async fn handle(
        &self,
        delivery: &Delivery,
        errors: Option<&mpsc::Sender<ConsumeError>>,
    ) -> Handled {
        let name = format!("{} receive", self.shared.opts.queue.name);
        let (parent, span) = otel::new_span(&delivery.headers, &self.tracer, &name);
        let ctx = parent.with_span(span);
        let span = ctx.span();

        debug!(
            exchange = delivery.exchange.as_str(),
            routing_key = delivery.routing_key.as_str(),
            "received message"
        );

        let mut attempt = 0;
        loop {
            attempt += 1;

            let err = match self.handler.handle(&ctx, delivery).await {
                Ok(()) => {
                    debug!("message successfully processed");
                    span.set_status(Status::Ok);
                    return Handled::Done;
                }
                Err(err) => err,
            };

            span.record_error(&*err);
            let error = AmqpError::ConsumerError(err.to_string());

            let Some(policy) = self.retry.filter(|policy| policy.should_retry(attempt)) else {
                span.set_status(Status::Error {
                    description: Cow::from(error.to_string()),
                });
                return Handled::Failed { error, attempt };
            };

            let count = policy.attempt_count(attempt);
            report(
                errors,
                ConsumeError::retrying(delivery, error.clone(), attempt, count),
            );

            let delay = policy.delay(attempt - 1);
            debug!(attempt, ?delay, "retrying message");

            tokio::select! {
                biased;
                _ = self.stopped() => {
                    span.set_status(Status::Error {
                        description: Cow::from(error.to_string()),
                    });
                    return Handled::Interrupted { error, attempt };
                }
                _ = time::sleep(delay) => {}
            }
        }
    }

    fn request_reconnect(&self, generation: u64, reason: &str) {
        debug!(reason, "requesting reconnect");
        self.shared.signal.raise(ReconnectRequest {
            generation,
            reason: reason.to_owned(),
        });
    }

    /// Waits until a session newer than `generation` is installed. Returns
    /// `false` if stopped first.
    async fn wait_rebuild(&self, generation: u64) -> bool {
        tokio::select! {
            biased;
            _ = self.stopped() => false,
            _ = self.shared.guard.rebuilt_since(generation) => true,
        }
    }

    async fn stopped(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.shared.cancel.cancelled() => {}
        }
    }
}

/// Hands `err` to the sink without waiting. A full or closed sink drops it.
fn report(errors: Option<&mpsc::Sender<ConsumeError>>, err: ConsumeError) {
    warn!(
        error = err.error.to_string(),
        attempt = err.attempt,
        terminal = err.terminal,
        "{}",
        err
    );

    let Some(errors) = errors else {
        return;
    };

    match errors.try_send(err) {
        Ok(()) => {}
        Err(TrySendError::Full(err)) => {
            debug!(error = err.to_string(), "error channel is full, dropping report");
        }
        Err(TrySendError::Closed(_)) => {
            debug!("error channel is closed, dropping report");
        }
    }
}
