// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::handler::CancellationHandler;
use futures::{
    future::{BoxFuture, Shared},
    FutureExt, TryFutureExt,
};
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};
use thiserror::Error;
use tokio::{runtime::Handle, sync::oneshot};

/// Failure raised by the future plumbing itself rather than by user code.
/// Error types carried through a [`CancellableFuture`] must absorb it.
#[derive(Clone, Debug, Error)]
pub enum Aborted {
    #[error("task panicked: {0}")]
    Panic(String),
    #[error("task was cancelled before completion")]
    Cancelled,
    #[error("promise dropped before completion")]
    PromiseDropped,
}

type SharedResult<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

/// A cloneable in-flight result paired with a [`CancellationHandler`].
///
/// Every clone observes the same outcome; the result future is shared, so
/// the underlying work runs at most once no matter how many consumers await
/// it.
pub struct CancellableFuture<T, E> {
    result: SharedResult<T, E>,
    handler: CancellationHandler,
}

impl<T, E> Clone for CancellableFuture<T, E> {
    fn clone(&self) -> Self {
        Self {
            result: self.result.clone(),
            handler: self.handler.clone(),
        }
    }
}

impl<T, E> CancellableFuture<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + From<Aborted> + 'static,
{
    pub fn successful(value: T) -> Self {
        Self::uncancellable(futures::future::ready(Ok(value)))
    }

    pub fn failed(error: E) -> Self {
        Self::uncancellable(futures::future::ready(Err(error)))
    }

    /// Pairs `result` with an empty handler: cancellation requests are
    /// acknowledged immediately and the work is left to finish on its own.
    pub fn uncancellable<F>(result: F) -> Self
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self {
            result: result.boxed().shared(),
            handler: CancellationHandler::empty(),
        }
    }

    /// Runs `work` as its own task so that deeply nested compositions keep a
    /// flat poll depth. Panics and runtime-abort of the task surface as
    /// [`Aborted`] failures.
    pub fn spawn<F>(handle: &Handle, work: F) -> Self
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        let join = handle.spawn(work);
        let result = async move {
            match join.await {
                Ok(outcome) => outcome,
                Err(err) if err.is_panic() => {
                    let payload = err.into_panic();
                    let message = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "opaque panic payload".to_string());
                    Err(Aborted::Panic(message).into())
                },
                Err(_) => Err(Aborted::Cancelled.into()),
            }
        };
        Self {
            result: result.boxed().shared(),
            handler: CancellationHandler::empty(),
        }
    }

    /// Replaces the cancellation handler.
    pub fn with_handler(self, handler: CancellationHandler) -> Self {
        Self {
            result: self.result,
            handler,
        }
    }

    pub fn handler(&self) -> &CancellationHandler {
        &self.handler
    }

    /// The shared result future alone, without the handler.
    pub fn result(&self) -> SharedResult<T, E> {
        self.result.clone()
    }

    /// The failure, if this future already resolved to one.
    pub fn peek_failure(&self) -> Option<E> {
        self.result
            .peek()
            .and_then(|outcome| outcome.as_ref().err().cloned())
    }

    /// Lifts a fallible function over the success value; the handler is
    /// preserved.
    pub fn map<U, F>(self, f: F) -> CancellableFuture<U, E>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Result<U, E> + Send + 'static,
    {
        let Self { result, handler } = self;
        CancellableFuture {
            result: result.and_then(|value| futures::future::ready(f(value))).boxed().shared(),
            handler,
        }
    }

    /// Waits for both sides and fails as soon as either side fails, even if
    /// the other is still pending. Both handlers are retained.
    pub fn zip<U>(self, other: CancellableFuture<U, E>) -> CancellableFuture<(T, U), E>
    where
        U: Clone + Send + Sync + 'static,
    {
        CancellableFuture {
            result: futures::future::try_join(self.result, other.result)
                .boxed()
                .shared(),
            handler: CancellationHandler::compose(self.handler, other.handler),
        }
    }

    /// Fail-fast collection: resolves with every value, or with the first
    /// failure as soon as one side fails.
    pub fn sequence(items: Vec<Self>) -> CancellableFuture<Vec<T>, E> {
        let handler =
            CancellationHandler::compose_all(items.iter().map(|item| item.handler.clone()));
        CancellableFuture {
            result: futures::future::try_join_all(items.into_iter().map(|item| item.result))
                .boxed()
                .shared(),
            handler,
        }
    }

    /// An unresolved future plus the [`FuturePromise`] that completes it.
    /// Dropping the promise without completing it fails the future.
    pub fn promise() -> (Self, FuturePromise<T, E>) {
        let (value_tx, value_rx) = oneshot::channel::<CancellableFuture<T, E>>();
        let (handler_tx, handler_rx) = oneshot::channel::<CancellationHandler>();
        let result = async move {
            match value_rx.await {
                Ok(completion) => completion.result.await,
                Err(_) => Err(Aborted::PromiseDropped.into()),
            }
        };
        let handler = CancellationHandler::from_future(async move {
            handler_rx
                .await
                .unwrap_or_else(|_| CancellationHandler::empty())
        });
        (
            Self {
                result: result.boxed().shared(),
                handler,
            },
            FuturePromise {
                value: value_tx,
                handler: handler_tx,
            },
        )
    }
}

impl<T, E> Future for CancellableFuture<T, E>
where
    T: Clone,
    E: Clone,
{
    type Output = Result<T, E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.result.poll_unpin(cx)
    }
}

/// Completes the paired [`CancellableFuture`] with another future's outcome
/// and handler. Every peer holding a clone observes the same result.
pub struct FuturePromise<T, E> {
    value: oneshot::Sender<CancellableFuture<T, E>>,
    handler: oneshot::Sender<CancellationHandler>,
}

impl<T, E> FuturePromise<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + From<Aborted> + 'static,
{
    pub fn complete(self, completion: CancellableFuture<T, E>) {
        // Receivers may be gone if every consumer dropped out; that is fine.
        let _ = self.handler.send(completion.handler.clone());
        let _ = self.value.send(completion);
    }
}
