// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Rabbit Client
//!
//! [`Rabbit`] is the resilient client: it validates its [`Options`], dials
//! the first reachable endpoint, builds the consumer session up front when
//! the mode consumes, and starts the reconnect watcher. After construction,
//! connection loss is recovered in the background and never surfaces as a
//! fatal error.
//!
//! [`RabbitClient`] lists the public operations so callers can substitute a
//! test double.
//!
//! `stop` cancels every in-flight consume call and waits for them to return,
//! bounded by a timeout. A handler that never returns keeps its task alive
//! after the timeout; the wait itself is dropped. `close` also closes the
//! connection and makes every later call fail with [`AmqpError::Shutdown`].

use crate::{
    broker::Connector,
    channel::LapinConnector,
    connection::ConnectionManager,
    consumer::{ConsumeError, ConsumeLoop},
    delivery::Headers,
    errors::AmqpError,
    guard::SessionGuard,
    handler::DeliveryHandler,
    options::{validate_options, Options, DEFAULT_STOP_TIMEOUT},
    publisher,
    retry::RetryPolicy,
    topology::{SessionBuilder, SessionKind},
    watcher::{ReconnectRequest, ReconnectSignal, ReconnectState, ReconnectWatcher, WatcherState},
};
use async_trait::async_trait;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};
use tokio::{sync::mpsc, task::JoinHandle, time};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info};

/// Public operations of the client.
#[async_trait]
pub trait RabbitClient: Send + Sync {
    /// Consumes deliveries until `cancel` fires or the client is stopped.
    ///
    /// Failures are reported to `errors` without blocking. When `retry` is
    /// given, a failing delivery is handed to the handler again per the
    /// policy; otherwise it is reported once and skipped.
    async fn consume(
        &self,
        cancel: CancellationToken,
        errors: Option<mpsc::Sender<ConsumeError>>,
        handler: &dyn DeliveryHandler,
        retry: Option<RetryPolicy>,
    ) -> Result<(), AmqpError>;

    /// Handles exactly one delivery and returns its terminal error. Returns
    /// `Ok(())` when stopped before a delivery arrived.
    async fn consume_once(
        &self,
        cancel: Option<CancellationToken>,
        handler: &dyn DeliveryHandler,
        retry: Option<RetryPolicy>,
    ) -> Result<(), AmqpError>;

    /// Publishes `payload` to the configured exchange under `routing_key`.
    async fn publish(
        &self,
        cancel: &CancellationToken,
        routing_key: &str,
        payload: &[u8],
        headers: Option<Headers>,
    ) -> Result<(), AmqpError>;

    /// Cancels in-flight consume calls and waits up to `timeout` (default
    /// [`DEFAULT_STOP_TIMEOUT`]) for them to return.
    async fn stop(&self, timeout: Option<Duration>) -> Result<(), AmqpError>;

    /// Stops, closes the connection and shuts the client down for good.
    async fn close(&self) -> Result<(), AmqpError>;
}

/// State shared between the client, its consume and publish calls, and the
/// reconnect watcher.
pub(crate) struct Shared {
    pub(crate) opts: Options,
    pub(crate) connections: ConnectionManager,
    pub(crate) guard: SessionGuard,
    pub(crate) reconnect: ReconnectState,
    pub(crate) signal: ReconnectSignal,
    /// Instance-wide cancellation raised by stop and close
    pub(crate) cancel: CancellationToken,
    /// Wait-group of in-flight consume calls
    pub(crate) inflight: TaskTracker,
    pub(crate) shutdown: AtomicBool,
}

impl Shared {
    fn ensure(&self, operation: &'static str, allowed: bool) -> Result<(), AmqpError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(AmqpError::Shutdown);
        }
        if !allowed {
            return Err(AmqpError::ModeNotSupported(operation, self.opts.mode.as_str()));
        }
        Ok(())
    }

    async fn halt(&self, timeout: Duration) -> Result<(), AmqpError> {
        self.cancel.cancel();
        self.inflight.close();

        match time::timeout(timeout, self.inflight.wait()).await {
            Ok(()) => Ok(()),
            Err(_) => {
                error!(?timeout, pending = self.inflight.len(), "timeout waiting for consumers to stop");
                Err(AmqpError::StopTimeout(timeout))
            }
        }
    }
}

/// The resilient RabbitMQ client.
pub struct Rabbit {
    shared: Arc<Shared>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl Rabbit {
    /// Validates `opts`, connects with lapin and starts the reconnect watcher.
    pub async fn new(opts: Options) -> Result<Rabbit, AmqpError> {
        Rabbit::with_connector(opts, Arc::new(LapinConnector)).await
    }

    /// Like [`Rabbit::new`], dialing through `connector`.
    ///
    /// Invalid options fail before any dial is attempted.
    pub async fn with_connector(
        mut opts: Options,
        connector: Arc<dyn Connector>,
    ) -> Result<Rabbit, AmqpError> {
        validate_options(&mut opts)?;

        let connections = ConnectionManager::new(connector, &opts);
        let conn = connections.dial().await?;
        let closed = conn.notify_close();

        let guard = SessionGuard::new();
        if opts.mode.consumes() {
            let built = SessionBuilder::new(&opts)
                .build(conn.as_ref(), SessionKind::Consumer)
                .await;

            match built {
                Ok(session) => {
                    guard.lock_all().await.install(Some(session), None);
                }
                Err(err) => {
                    error!(error = err.to_string(), "unable to build consumer channel");
                    if let Err(close_err) = conn.close().await {
                        debug!(error = close_err.to_string(), "failure to close connection");
                    }
                    return Err(err);
                }
            }
        }
        connections.replace(conn).await;

        let (signal, requests) = ReconnectSignal::new();
        let shared = Arc::new(Shared {
            opts,
            connections,
            guard,
            reconnect: ReconnectState::new(),
            signal,
            cancel: CancellationToken::new(),
            inflight: TaskTracker::new(),
            shutdown: AtomicBool::new(false),
        });

        let watcher = ReconnectWatcher::spawn(shared.clone(), requests, closed);

        info!(mode = shared.opts.mode.as_str(), "rabbit client ready");

        Ok(Rabbit {
            shared,
            watcher: Mutex::new(Some(watcher)),
        })
    }

    /// The options in effect, with defaults applied.
    pub fn options(&self) -> &Options {
        &self.shared.opts
    }

    /// Asks the watcher to rebuild the connection and sessions. Returns
    /// `false` when a request is already pending or the client is stopped.
    pub fn request_reconnect(&self, reason: &str) -> bool {
        self.shared.signal.raise(ReconnectRequest {
            generation: self.shared.guard.generation(),
            reason: reason.to_owned(),
        })
    }

    /// Current state of the reconnect watcher.
    pub fn reconnect_state(&self) -> WatcherState {
        self.shared.reconnect.state()
    }

    /// Number of completed session rebuilds, the initial one included.
    pub fn session_generation(&self) -> u64 {
        self.shared.guard.generation()
    }

    /// Resolves once a rebuild newer than `generation` has completed.
    pub async fn rebuilt_since(&self, generation: u64) {
        self.shared.guard.rebuilt_since(generation).await
    }

    fn take_watcher(&self) -> Option<JoinHandle<()>> {
        self.watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

#[async_trait]
impl RabbitClient for Rabbit {
    async fn consume(
        &self,
        cancel: CancellationToken,
        errors: Option<mpsc::Sender<ConsumeError>>,
        handler: &dyn DeliveryHandler,
        retry: Option<RetryPolicy>,
    ) -> Result<(), AmqpError> {
        let shared = self.shared.as_ref();
        shared.ensure("consume", shared.opts.mode.consumes())?;

        let _token = shared.inflight.token();
        debug!("waiting for messages from rabbit");

        ConsumeLoop::new(shared, &cancel, handler, retry.as_ref())
            .run(errors.as_ref())
            .await;

        Ok(())
    }

    async fn consume_once(
        &self,
        cancel: Option<CancellationToken>,
        handler: &dyn DeliveryHandler,
        retry: Option<RetryPolicy>,
    ) -> Result<(), AmqpError> {
        let shared = self.shared.as_ref();
        shared.ensure("consume", shared.opts.mode.consumes())?;

        let _token = shared.inflight.token();
        let cancel = cancel.unwrap_or_default();

        ConsumeLoop::new(shared, &cancel, handler, retry.as_ref())
            .run_once()
            .await
    }

    async fn publish(
        &self,
        cancel: &CancellationToken,
        routing_key: &str,
        payload: &[u8],
        headers: Option<Headers>,
    ) -> Result<(), AmqpError> {
        let shared = self.shared.as_ref();
        shared.ensure("publish", shared.opts.mode.publishes())?;

        publisher::publish(shared, cancel, routing_key, payload, headers).await
    }

    async fn stop(&self, timeout: Option<Duration>) -> Result<(), AmqpError> {
        self.shared.ensure("stop", true)?;
        self.shared
            .halt(timeout.unwrap_or(DEFAULT_STOP_TIMEOUT))
            .await
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return Err(AmqpError::Shutdown);
        }

        debug!("closing rabbit client");
        let stopped = self.shared.halt(DEFAULT_STOP_TIMEOUT).await;

        if let Some(watcher) = self.take_watcher() {
            if let Err(err) = watcher.await {
                error!(error = err.to_string(), "reconnect watcher failed");
            }
        }

        let closed = self.shared.connections.close().await.map_err(|err| match err {
            AmqpError::CloseConnectionError(_) => err,
            other => AmqpError::CloseConnectionError(other.to_string()),
        });

        stopped.and(closed)
    }
}

impl Drop for Rabbit {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}
