// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reconnect Watcher
//!
//! Background task that rebuilds the connection and its sessions. It reacts
//! to two triggers: the live connection reporting that it closed, and a
//! [`ReconnectRequest`] raised through the [`ReconnectSignal`] (by a consume
//! call that met a poisoned delivery, or by any caller).
//!
//! The watcher is an explicit two-state machine, [`WatcherState::Idle`] and
//! [`WatcherState::Reconnecting`], kept behind its own lock. A trigger that
//! arrives while a rebuild is in progress is ignored and the watcher keeps
//! watching. While reconnecting, it holds both session guard write locks and
//! retries dial plus build forever, sleeping the configured interval between
//! failed attempts, until it succeeds or the client is stopped.

use crate::{
    broker::{BrokerConnection, CloseNotification},
    client::Shared,
    errors::AmqpError,
    topology::{Session, SessionBuilder, SessionKind},
};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, PoisonError,
};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
    time,
};
use tracing::{debug, info, warn};

/// State of the reconnect state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Idle,
    Reconnecting,
}

/// In-progress flag of the watcher, guarded by an exclusive lock.
#[derive(Debug)]
pub struct ReconnectState {
    state: Mutex<WatcherState>,
    completed: AtomicU64,
}

impl Default for ReconnectState {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconnectState {
    pub fn new() -> ReconnectState {
        ReconnectState {
            state: Mutex::new(WatcherState::Idle),
            completed: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> WatcherState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves Idle to Reconnecting. Returns `false`, leaving the state
    /// untouched, when a rebuild is already in progress.
    pub fn try_begin(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            WatcherState::Idle => {
                *state = WatcherState::Reconnecting;
                true
            }
            WatcherState::Reconnecting => false,
        }
    }

    /// Moves back to Idle.
    pub fn finish(&self, rebuilt: bool) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = WatcherState::Idle;
        if rebuilt {
            self.completed.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Number of rebuilds completed so far.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }
}

/// A request to rebuild the connection now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectRequest {
    /// Session generation the requester observed
    pub generation: u64,
    pub reason: String,
}

/// Sending side of the single-slot reconnect request queue.
///
/// Raising never blocks: while a request is already queued, further ones are
/// coalesced into it.
#[derive(Debug, Clone)]
pub struct ReconnectSignal {
    tx: mpsc::Sender<ReconnectRequest>,
}

impl ReconnectSignal {
    pub fn new() -> (ReconnectSignal, mpsc::Receiver<ReconnectRequest>) {
        let (tx, rx) = mpsc::channel(1);
        (ReconnectSignal { tx }, rx)
    }

    /// Queues `request` unless one is already pending. Returns whether it was
    /// queued.
    pub fn raise(&self, request: ReconnectRequest) -> bool {
        match self.tx.try_send(request) {
            Ok(()) => true,
            Err(TrySendError::Full(request)) => {
                debug!(reason = request.reason, "reconnect already requested");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("reconnect watcher is gone");
                false
            }
        }
    }
}

enum Trigger {
    Closed(String),
    Requested(ReconnectRequest),
}

/// Background rebuild task of one client.
pub(crate) struct ReconnectWatcher {
    shared: Arc<Shared>,
    requests: mpsc::Receiver<ReconnectRequest>,
    closed: Option<CloseNotification>,
}

impl ReconnectWatcher {
    pub(crate) fn spawn(
        shared: Arc<Shared>,
        requests: mpsc::Receiver<ReconnectRequest>,
        closed: CloseNotification,
    ) -> JoinHandle<()> {
        let watcher = ReconnectWatcher {
            shared,
            requests,
            closed: Some(closed),
        };
        tokio::spawn(watcher.run())
    }

    async fn run(mut self) {
        while let Some(trigger) = self.next_trigger().await {
            match &trigger {
                Trigger::Closed(reason) => {
                    debug!(reason, "received message on notify close channel (reconnecting)");
                }
                Trigger::Requested(request) => {
                    if request.generation < self.shared.guard.generation() {
                        debug!(
                            reason = request.reason,
                            "ignoring reconnect request for a replaced session"
                        );
                        continue;
                    }
                    debug!(reason = request.reason, "received reconnect signal (reconnecting)");
                }
            }

            if !self.shared.reconnect.try_begin() {
                debug!("received reconnect signal (already reconnecting)");
                continue;
            }

            let rebuilt = self.rebuild().await;
            self.shared.reconnect.finish(rebuilt.is_some());

            match rebuilt {
                Some(closed) => self.closed = Some(closed),
                None => break,
            }
        }

        debug!("reconnect watcher exiting");
    }

    async fn next_trigger(&mut self) -> Option<Trigger> {
        loop {
            tokio::select! {
                biased;

                _ = self.shared.cancel.cancelled() => return None,

                closed = wait_closed(&mut self.closed) => match closed {
                    Some(reason) => return Some(Trigger::Closed(reason)),
                    None => debug!("close notification dropped, watching requests only"),
                },

                request = self.requests.recv() => return request.map(Trigger::Requested),
            }
        }
    }

    /// Rebuilds under both write locks until it succeeds. Returns the close
    /// notification of the new connection, or `None` once the client is
    /// stopped.
    async fn rebuild(&self) -> Option<CloseNotification> {
        let shared = &self.shared;
        let lock = shared.guard.lock_all().await;
        let mut attempts: u64 = 0;

        loop {
            attempts += 1;

            let result = tokio::select! {
                _ = shared.cancel.cancelled() => return None,
                result = rebuild_once(shared) => result,
            };

            match result {
                Ok(rebuilt) => {
                    let previous = shared.connections.replace(rebuilt.connection).await;
                    let replaced = lock.install(rebuilt.consumer, rebuilt.producer);

                    info!(attempts, "successfully reconnected");

                    for session in replaced {
                        if let Err(err) = session.close().await {
                            debug!(error = err.to_string(), "failure to close replaced session");
                        }
                    }
                    if let Some(conn) = previous {
                        if let Err(err) = conn.close().await {
                            debug!(error = err.to_string(), "failure to close replaced connection");
                        }
                    }

                    return Some(rebuilt.closed);
                }
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        attempts,
                        retry_in = ?shared.opts.retry_reconnect_interval,
                        "unable to complete reconnect, retrying..."
                    );

                    tokio::select! {
                        _ = shared.cancel.cancelled() => return None,
                        _ = time::sleep(shared.opts.retry_reconnect_interval) => {}
                    }
                }
            }
        }
    }
}

struct Rebuilt {
    connection: Arc<dyn BrokerConnection>,
    closed: CloseNotification,
    consumer: Option<Session>,
    producer: Option<Session>,
}

async fn rebuild_once(shared: &Shared) -> Result<Rebuilt, AmqpError> {
    let connection = shared.connections.dial().await?;
    let closed = connection.notify_close();

    match build_sessions(shared, connection.as_ref()).await {
        Ok((consumer, producer)) => Ok(Rebuilt {
            connection,
            closed,
            consumer,
            producer,
        }),
        Err(err) => {
            if let Err(close_err) = connection.close().await {
                debug!(error = close_err.to_string(), "failure to close abandoned connection");
            }
            Err(err)
        }
    }
}

async fn build_sessions(
    shared: &Shared,
    connection: &dyn BrokerConnection,
) -> Result<(Option<Session>, Option<Session>), AmqpError> {
    let builder = SessionBuilder::new(&shared.opts);

    let consumer = if shared.opts.mode.consumes() {
        Some(builder.build(connection, SessionKind::Consumer).await?)
    } else {
        None
    };

    let producer = if shared.opts.mode.publishes() {
        match builder.build(connection, SessionKind::Producer).await {
            Ok(session) => Some(session),
            Err(err) => {
                if let Some(consumer) = &consumer {
                    let _ = consumer.channel.close().await;
                }
                return Err(err);
            }
        }
    } else {
        None
    };

    Ok((consumer, producer))
}

/// Waits on the close notification, if one is armed. A notification whose
/// sender went away is disarmed and reported as `None`.
async fn wait_closed(closed: &mut Option<CloseNotification>) -> Option<String> {
    let result = match closed.as_mut() {
        Some(rx) => rx.await,
        None => std::future::pending().await,
    };
    *closed = None;
    result.ok()
}
