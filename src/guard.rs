// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Session Guard
//!
//! Holds the consumer-side and producer-side session state behind two
//! independent read/write locks. Consume and publish calls take read access
//! to snapshot or use the current session; a rebuild takes write access to
//! both sides, in consumer-then-producer order, and swaps them together so a
//! reader sees either the complete old state or the complete new one.
//!
//! Every completed rebuild advances a generation counter. Readers use it to
//! tell a stream that ended because it was replaced from one that ended
//! because its session died.

use crate::{
    broker::BrokerSession,
    delivery::DeliveryStream,
    topology::Session,
};
use std::sync::Arc;
use tokio::sync::{watch, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Consumer side: the session and its delivery stream.
#[derive(Default)]
pub struct ConsumerState {
    pub session: Option<Arc<dyn BrokerSession>>,
    pub deliveries: Option<DeliveryStream>,
    pub generation: u64,
}

/// Producer side: the session publishes go through.
#[derive(Default)]
pub struct ProducerState {
    pub session: Option<Arc<dyn BrokerSession>>,
}

/// What a consume call works from until the next rebuild.
#[derive(Clone)]
pub struct ConsumerSnapshot {
    pub deliveries: Option<DeliveryStream>,
    pub generation: u64,
}

/// The pair of locks gating session swap against session use.
pub struct SessionGuard {
    consumer: RwLock<ConsumerState>,
    producer: RwLock<ProducerState>,
    generation: watch::Sender<u64>,
}

impl Default for SessionGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionGuard {
    pub fn new() -> SessionGuard {
        SessionGuard {
            consumer: RwLock::new(ConsumerState::default()),
            producer: RwLock::new(ProducerState::default()),
            generation: watch::Sender::new(0),
        }
    }

    /// Reads the current consumer stream; waits while a rebuild is running.
    pub async fn consumer_snapshot(&self) -> ConsumerSnapshot {
        let state = self.consumer.read().await;
        ConsumerSnapshot {
            deliveries: state.deliveries.clone(),
            generation: state.generation,
        }
    }

    /// Read access to the producer side, held for the duration of a publish.
    pub async fn producer(&self) -> RwLockReadGuard<'_, ProducerState> {
        self.producer.read().await
    }

    /// Exclusive access to the producer side only, for building or
    /// invalidating the producer session outside of a full rebuild.
    pub async fn producer_mut(&self) -> RwLockWriteGuard<'_, ProducerState> {
        self.producer.write().await
    }

    /// Takes write access to both sides.
    pub async fn lock_all(&self) -> RebuildLock<'_> {
        let consumer = self.consumer.write().await;
        let producer = self.producer.write().await;
        RebuildLock {
            consumer,
            producer,
            generation: &self.generation,
        }
    }

    /// Latest completed rebuild.
    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    /// Resolves once a rebuild newer than `seen` has completed.
    pub async fn rebuilt_since(&self, seen: u64) {
        let mut rx = self.generation.subscribe();
        // The sender lives as long as `self`, so this cannot fail while borrowed.
        let _ = rx.wait_for(|current| *current > seen).await;
    }
}

/// Write access to both sides of the guard.
///
/// Dropping it without calling [`RebuildLock::install`] leaves the previous
/// sessions in place.
pub struct RebuildLock<'g> {
    consumer: RwLockWriteGuard<'g, ConsumerState>,
    producer: RwLockWriteGuard<'g, ProducerState>,
    generation: &'g watch::Sender<u64>,
}

impl RebuildLock<'_> {
    /// Swaps in the new sessions, advances the generation and releases both
    /// locks. Returns the sessions that were replaced so the caller can close
    /// them.
    pub fn install(
        mut self,
        consumer: Option<Session>,
        producer: Option<Session>,
    ) -> Vec<Arc<dyn BrokerSession>> {
        let mut replaced = vec![];
        replaced.extend(self.consumer.session.take());
        replaced.extend(self.producer.session.take());

        let (session, deliveries) = match consumer {
            Some(s) => (Some(s.channel), s.deliveries),
            None => (None, None),
        };

        let next = self.consumer.generation + 1;
        self.consumer.session = session;
        self.consumer.deliveries = deliveries;
        self.consumer.generation = next;
        self.producer.session = producer.map(|s| s.channel);
        self.generation.send_replace(next);

        replaced
    }
}
