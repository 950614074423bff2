// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Handlers
//!
//! The caller-supplied processing function for consumed deliveries. Implement
//! [`DeliveryHandler`] directly, or wrap an async closure with
//! [`handler_fn`].

use crate::delivery::Delivery;
use async_trait::async_trait;
use opentelemetry::Context;
use std::{error::Error, future::Future, marker::PhantomData};

/// Error returned by a handler.
pub type HandlerError = Box<dyn Error + Send + Sync>;

/// Processes one delivery. Returning an error makes the consume loop apply
/// its retry policy and report the failure.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    /// `ctx` carries the consumer span opened for this delivery.
    async fn handle(&self, ctx: &Context, delivery: &Delivery) -> Result<(), HandlerError>;
}

/// A [`DeliveryHandler`] backed by an async closure. Built by [`handler_fn`].
pub struct FnHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

/// Wraps `f` as a handler. The closure receives a clone of each delivery, so
/// it can move it into the returned future.
///
/// ```
/// use rabbit::handler::{handler_fn, HandlerError};
///
/// let handler = handler_fn(|delivery| async move {
///     delivery.ack().await?;
///     Ok::<(), HandlerError>(())
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F, Fut>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler {
        f,
        _fut: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> DeliveryHandler for FnHandler<F, Fut>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, _ctx: &Context, delivery: &Delivery) -> Result<(), HandlerError> {
        (self.f)(delivery.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[tokio::test]
    async fn closure_handler_sees_payload() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = handler_fn({
            let calls = calls.clone();
            move |delivery: Delivery| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if delivery.data == b"bad" {
                        return Err("bad payload".into());
                    }
                    Ok::<(), HandlerError>(())
                }
            }
        });

        let ctx = Context::new();
        assert!(handler.handle(&ctx, &Delivery::new("x")).await.is_ok());

        let err = handler.handle(&ctx, &Delivery::new("bad")).await.unwrap_err();
        assert_eq!(err.to_string(), "bad payload");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
