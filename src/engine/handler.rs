//! Work handlers: the caller-supplied code run once per claimed execution.
//!
//! Executions are at-least-once. A handler may see the same logical unit of
//! work again after a crash or a lost finalize, so it must be idempotent.

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

use crate::model::{Payload, WorkOutcome, WorkRecord};

#[async_trait]
pub trait WorkHandler<P: Payload>: Send + Sync + 'static {
    /// Execute one claimed record.
    async fn handle(&self, record: &WorkRecord<P>) -> WorkOutcome;
}

/// Handler built from an async closure. See [`handler_fn`].
pub struct FnHandler<F, P> {
    f: F,
    _payload: PhantomData<fn(P)>,
}

/// Wrap `Fn(WorkRecord<P>) -> impl Future<Output = WorkOutcome>` as a handler.
pub fn handler_fn<P, F, Fut>(f: F) -> FnHandler<F, P>
where
    P: Payload,
    F: Fn(WorkRecord<P>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = WorkOutcome> + Send + 'static,
{
    FnHandler {
        f,
        _payload: PhantomData,
    }
}

#[async_trait]
impl<P, F, Fut> WorkHandler<P> for FnHandler<F, P>
where
    P: Payload,
    F: Fn(WorkRecord<P>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = WorkOutcome> + Send + 'static,
{
    async fn handle(&self, record: &WorkRecord<P>) -> WorkOutcome {
        (self.f)(record.clone()).await
    }
}
