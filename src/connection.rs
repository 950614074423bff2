// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Management
//!
//! The [`ConnectionManager`] dials the configured endpoints in order and owns
//! the single live connection of a client. A connection is never reused once
//! replaced: reconnecting always dials a fresh one.

use crate::{
    broker::{BrokerConnection, Connector, DialSettings},
    errors::AmqpError,
    options::Options,
};
use std::sync::Arc;
use tokio::{sync::RwLock, time};
use tracing::{debug, error, info, warn};

/// Tries every endpoint in listed order and returns the first connection that
/// completes its handshake within `settings.timeout`.
///
/// The deadline only covers the dial itself; it does not apply to the
/// connection once it is open.
///
/// # Parameters
/// * `connector` - Transport used to dial each endpoint
/// * `urls` - Candidate endpoints; empty entries are skipped
/// * `settings` - Per-dial deadline, TLS toggles and connection name
///
/// # Returns
/// The first open connection, or [`AmqpError::AllEndpointsFailed`] carrying
/// one error per attempted endpoint
pub async fn connect(
    connector: &dyn Connector,
    urls: &[String],
    settings: &DialSettings,
) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
    let mut failures = vec![];

    for url in urls.iter().filter(|url| !url.is_empty()) {
        debug!(url = redact(url), "trying to dial server");

        let result = match time::timeout(settings.timeout, connector.dial(url, settings)).await {
            Ok(result) => result,
            Err(_) => Err(AmqpError::DialTimeout(redact(url), settings.timeout)),
        };

        match result {
            Ok(conn) => {
                info!(url = redact(url), "successfully connected to server");
                return Ok(conn);
            }
            Err(err) => {
                warn!(
                    url = redact(url),
                    error = err.to_string(),
                    "could not connect to server"
                );
                failures.push(err);
            }
        }
    }

    error!(attempts = failures.len(), "unable to dial server");
    Err(AmqpError::AllEndpointsFailed(failures))
}

/// Strips credentials from an AMQP URI so it can be logged.
pub(crate) fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => {
            format!("{}://***@{}", &url[..scheme], &url[at + 1..])
        }
        _ => url.to_owned(),
    }
}

/// Owner of the client's connection handle.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    urls: Vec<String>,
    settings: DialSettings,
    current: RwLock<Option<Arc<dyn BrokerConnection>>>,
}

impl ConnectionManager {
    /// Creates a manager dialing `opts.urls` through `connector`.
    ///
    /// # Parameters
    /// * `connector` - Transport used for every dial and redial
    /// * `opts` - Validated options; the app id doubles as connection name
    ///
    /// # Returns
    /// A manager with no live connection yet
    pub fn new(connector: Arc<dyn Connector>, opts: &Options) -> ConnectionManager {
        ConnectionManager {
            connector,
            urls: opts.urls.clone(),
            settings: DialSettings {
                timeout: opts.connection_timeout,
                use_tls: opts.use_tls,
                skip_verify_tls: opts.skip_verify_tls,
                connection_name: opts.app_id.clone(),
            },
            current: RwLock::new(None),
        }
    }

    /// Dials a new connection without installing it.
    pub async fn dial(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        connect(self.connector.as_ref(), &self.urls, &self.settings).await
    }

    /// The live connection, if any.
    pub async fn current(&self) -> Option<Arc<dyn BrokerConnection>> {
        self.current.read().await.clone()
    }

    /// Installs `conn` and hands back the connection it replaced.
    ///
    /// # Parameters
    /// * `conn` - The freshly dialed connection
    ///
    /// # Returns
    /// The previous connection, which the caller is expected to close
    pub async fn replace(
        &self,
        conn: Arc<dyn BrokerConnection>,
    ) -> Option<Arc<dyn BrokerConnection>> {
        self.current.write().await.replace(conn)
    }

    /// Closes and forgets the live connection.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let conn = self.current.write().await.take();
        match conn {
            Some(conn) => conn.close().await,
            None => Ok(()),
        }
    }
}
