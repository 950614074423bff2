// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Handler Retry Policy
//!
//! Pure attempt accounting and backoff calculation for re-running a handler
//! on the same in-memory delivery. A [`RetryPolicy`] holds no per-message
//! state: the consume loop keeps the attempt counter for the one delivery it
//! is working on, so a single policy can be shared by every consumer.

use std::{fmt, sync::Arc, time::Duration};

/// Computes the delay before a retry.
pub trait IntervalFunction: Send + Sync {
    /// `retry` is 0 for the delay before the second handler invocation.
    fn next_interval(&self, retry: u32) -> Duration;
}

impl<F> IntervalFunction for F
where
    F: Fn(u32) -> Duration + Send + Sync,
{
    fn next_interval(&self, retry: u32) -> Duration {
        self(retry)
    }
}

/// How the delay grows between attempts.
#[derive(Clone)]
pub enum Backoff {
    /// Always the base delay
    Fixed,
    /// `base * (retry + 1)`
    Linear,
    /// `base * multiplier^retry`
    Exponential { multiplier: f64 },
    Custom(Arc<dyn IntervalFunction>),
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backoff::Fixed => write!(f, "Backoff::Fixed"),
            Backoff::Linear => write!(f, "Backoff::Linear"),
            Backoff::Exponential { multiplier } => {
                write!(f, "Backoff::Exponential({multiplier})")
            }
            Backoff::Custom(_) => write!(f, "Backoff::Custom"),
        }
    }
}

/// Retry policy for a failing handler.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Option<Duration>,
    backoff: Backoff,
}

impl RetryPolicy {
    /// Creates a policy allowing `max_attempts` handler invocations per
    /// delivery (0 means unlimited), with a fixed 1 second delay.
    pub fn new(max_attempts: u32) -> Self {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_secs(1),
            max_delay: None,
            backoff: Backoff::Fixed,
        }
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Caps every computed delay.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    pub fn fixed(mut self) -> Self {
        self.backoff = Backoff::Fixed;
        self
    }

    pub fn linear(mut self) -> Self {
        self.backoff = Backoff::Linear;
        self
    }

    pub fn exponential(mut self, multiplier: f64) -> Self {
        self.backoff = Backoff::Exponential { multiplier };
        self
    }

    pub fn custom(mut self, interval: impl IntervalFunction + 'static) -> Self {
        self.backoff = Backoff::Custom(Arc::new(interval));
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether another invocation is allowed after `attempts` have failed.
    pub fn should_retry(&self, attempts: u32) -> bool {
        self.max_attempts == 0 || attempts < self.max_attempts
    }

    /// Delay to wait before retry number `retry` (0-indexed).
    pub fn delay(&self, retry: u32) -> Duration {
        let delay = match &self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Linear => self.base_delay.saturating_mul(retry.saturating_add(1)),
            Backoff::Exponential { multiplier } => {
                let factor = multiplier.max(1.0).powi(retry.min(i32::MAX as u32) as i32);
                Duration::try_from_secs_f64(self.base_delay.as_secs_f64() * factor)
                    .unwrap_or(Duration::MAX)
            }
            Backoff::Custom(interval) => interval.next_interval(retry),
        };

        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }

    /// Human readable attempt counter, e.g. `2/3` or `2/unlimited`.
    pub fn attempt_count(&self, attempt: u32) -> String {
        if self.max_attempts == 0 {
            format!("{attempt}/unlimited")
        } else {
            format!("{attempt}/{}", self.max_attempts)
        }
    }
}
