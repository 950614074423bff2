// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! The publish path behind [`crate::RabbitClient::publish`]. Messages go to
//! the exchange of the single configured binding, marked persistent and
//! stamped with the configured application id and a fresh message id. The
//! current OpenTelemetry context is propagated in the headers.
//!
//! The producer session is built on first use. A publish that is cancelled
//! before the broker accepted it closes the producer session, and the next
//! publish builds a new one.

use crate::{
    broker::{BrokerSession, PublishProperties},
    client::Shared,
    delivery::Headers,
    errors::AmqpError,
    guard::ProducerState,
    otel,
    topology::{SessionBuilder, SessionKind},
};
use opentelemetry::Context;
use std::sync::Arc;
use tokio::sync::{RwLockReadGuard, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use uuid::Uuid;

/// Publishes one message on the producer session.
///
/// Waiting for the session locks and the broker's confirmation both race
/// against `cancel` and the client's own cancellation. Building a missing
/// producer session does not, so a session the broker already opened is
/// always either installed or closed.
///
/// # Parameters
/// * `shared` - Client state holding the producer session
/// * `cancel` - Caller's cancellation for this publish
/// * `routing_key` - Routing key on the configured exchange
/// * `payload` - Message body
/// * `headers` - Caller headers; trace propagation fields are added without
///   overwriting them
///
/// # Returns
/// `Ok(())` once the broker confirmed the message,
/// [`AmqpError::PublishCancelled`] when cancelled first (after closing the
/// producer session), or the failure of the build or the send
pub(crate) async fn publish(
    shared: &Shared,
    cancel: &CancellationToken,
    routing_key: &str,
    payload: &[u8],
    headers: Option<Headers>,
) -> Result<(), AmqpError> {
    let (state, session) = acquire(shared, cancel).await?;

    let mut headers = headers.unwrap_or_default();
    otel::inject(&Context::current(), &mut headers);

    let properties = PublishProperties {
        app_id: shared.opts.app_id.clone(),
        message_id: Uuid::new_v4().to_string(),
        persistent: true,
        headers,
    };
    let exchange = shared.opts.publish_exchange();

    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        _ = shared.cancel.cancelled() => None,
        result = session.publish(exchange, routing_key, payload, &properties) => Some(result),
    };
    drop(state);

    match result {
        Some(Ok(())) => {
            debug!(exchange, routing_key, "message published");
            Ok(())
        }
        Some(Err(err)) => {
            error!(error = err.to_string(), exchange, routing_key, "error publishing message");
            Err(err)
        }
        None => {
            debug!(exchange, routing_key, "publish cancelled, closing producer channel");
            invalidate(shared, &session).await?;
            Err(AmqpError::PublishCancelled)
        }
    }
}

/// Read access to a producer session, building it first if there is none.
///
/// # Parameters
/// * `shared` - Client state holding the producer session
/// * `cancel` - Caller's cancellation, observed while waiting for a lock
///
/// # Returns
/// The read guard together with the session it protects
async fn acquire<'a>(
    shared: &'a Shared,
    cancel: &CancellationToken,
) -> Result<(RwLockReadGuard<'a, ProducerState>, Arc<dyn BrokerSession>), AmqpError> {
    loop {
        let state = tokio::select! {
            biased;
            state = shared.guard.producer() => state,
            _ = cancel.cancelled() => return Err(AmqpError::PublishCancelled),
            _ = shared.cancel.cancelled() => return Err(AmqpError::PublishCancelled),
        };
        if let Some(session) = state.session.clone() {
            return Ok((state, session));
        }
        drop(state);

        let state = tokio::select! {
            biased;
            state = shared.guard.producer_mut() => state,
            _ = cancel.cancelled() => return Err(AmqpError::PublishCancelled),
            _ = shared.cancel.cancelled() => return Err(AmqpError::PublishCancelled),
        };
        build_producer(shared, state).await?;
    }
}

/// Builds and installs the producer session unless another publish did it
/// while this one waited for the write lock. Runs to completion once
/// started.
async fn build_producer(
    shared: &Shared,
    mut state: RwLockWriteGuard<'_, ProducerState>,
) -> Result<(), AmqpError> {
    if state.session.is_some() {
        return Ok(());
    }

    let conn = shared
        .connections
        .current()
        .await
        .ok_or(AmqpError::NotConnected)?;

    debug!("building producer channel");
    let session = SessionBuilder::new(&shared.opts)
        .build(conn.as_ref(), SessionKind::Producer)
        .await?;
    state.session = Some(session.channel);

    Ok(())
}

/// Forgets and closes `session` unless a rebuild already replaced it.
async fn invalidate(shared: &Shared, session: &Arc<dyn BrokerSession>) -> Result<(), AmqpError> {
    let mut state = shared.guard.producer_mut().await;
    let current = state
        .session
        .as_ref()
        .is_some_and(|installed| Arc::ptr_eq(installed, session));
    if !current {
        return Ok(());
    }
    state.session = None;
    drop(state);

    session.close().await.map_err(|err| {
        error!(error = err.to_string(), "failed to close producer channel");
        match err {
            AmqpError::CloseChannelError(_) => err,
            other => AmqpError::CloseChannelError(other.to_string()),
        }
    })
}
