// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use aptos_infallible::Mutex;
use futures::{
    future::{BoxFuture, Shared},
    stream::FuturesUnordered,
    FutureExt, StreamExt,
};
use once_cell::sync::OnceCell;
use std::{sync::Arc, time::Duration};

type StopFuture = Shared<BoxFuture<'static, ()>>;
type StopFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;
type DeferredHandler = Shared<BoxFuture<'static, CancellationHandler>>;

/// A composable stop hook for in-flight asynchronous work.
///
/// Contracts: `stop` is idempotent, never fails, and resolves once
/// best-effort signalling has been attempted. Stopping work that already
/// completed is a no-op (the leaf stop functions must resolve immediately in
/// that case).
#[derive(Clone)]
pub struct CancellationHandler {
    inner: Arc<Inner>,
}

enum Inner {
    /// Nothing to stop.
    Empty,
    /// A single stop function, invoked at most once; later calls await the
    /// first invocation's result.
    Leaf {
        stop_fn: Mutex<Option<StopFn>>,
        signalled: OnceCell<StopFuture>,
    },
    /// Stop both sides, in parallel.
    Compose(CancellationHandler, CancellationHandler),
    /// A handler only known after an asynchronous decision.
    Deferred(DeferredHandler),
}

impl Default for CancellationHandler {
    fn default() -> Self {
        Self::empty()
    }
}

impl CancellationHandler {
    pub fn empty() -> Self {
        Self {
            inner: Arc::new(Inner::Empty),
        }
    }

    /// A handler backed by a single stop function. The function is invoked
    /// at most once; its returned future is shared with every caller.
    pub fn from_fn<F, Fut>(stop_fn: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        Self {
            inner: Arc::new(Inner::Leaf {
                stop_fn: Mutex::new(Some(Box::new(move || stop_fn().boxed()))),
                signalled: OnceCell::new(),
            }),
        }
    }

    /// A handler that will only be known once `handler` resolves, e.g. when
    /// the work to stop is chosen by an earlier asynchronous stage.
    pub fn from_future<F>(handler: F) -> Self
    where
        F: std::future::Future<Output = CancellationHandler> + Send + 'static,
    {
        Self {
            inner: Arc::new(Inner::Deferred(handler.boxed().shared())),
        }
    }

    pub fn compose(first: Self, second: Self) -> Self {
        Self {
            inner: Arc::new(Inner::Compose(first, second)),
        }
    }

    pub fn compose_all(handlers: impl IntoIterator<Item = Self>) -> Self {
        handlers
            .into_iter()
            .fold(Self::empty(), |acc, h| Self::compose(acc, h))
    }

    /// Requests cancellation of every piece of work reachable from this
    /// handler and resolves once all of them have acknowledged the signal.
    ///
    /// The handler graph is walked iteratively: composed handlers fan out,
    /// deferred handlers are awaited alongside the already-running stop
    /// futures so that a stop which unblocks a deferred decision cannot
    /// deadlock the walk.
    pub fn stop(&self) -> BoxFuture<'static, ()> {
        let root = self.clone();
        async move {
            let mut queue = vec![root];
            let mut deferred: FuturesUnordered<DeferredHandler> = FuturesUnordered::new();
            let mut stops: FuturesUnordered<BoxFuture<'static, ()>> = FuturesUnordered::new();
            loop {
                while let Some(handler) = queue.pop() {
                    match &*handler.inner {
                        Inner::Empty => {},
                        Inner::Compose(first, second) => {
                            queue.push(first.clone());
                            queue.push(second.clone());
                        },
                        Inner::Leaf { .. } => stops.push(handler.leaf_stop()),
                        Inner::Deferred(pending) => deferred.push(pending.clone()),
                    }
                }
                tokio::select! {
                    Some(handler) = deferred.next() => queue.push(handler),
                    Some(()) = stops.next() => {},
                    else => break,
                }
            }
        }
        .boxed()
    }

    /// `stop`, but bounded: resolves after `deadline` even if some stop
    /// signal is still unacknowledged.
    pub fn stop_with_deadline(&self, deadline: Duration) -> BoxFuture<'static, ()> {
        let stop = self.stop();
        async move {
            let _ = tokio::time::timeout(deadline, stop).await;
        }
        .boxed()
    }

    fn leaf_stop(&self) -> BoxFuture<'static, ()> {
        let Inner::Leaf { stop_fn, signalled } = &*self.inner else {
            unreachable!("leaf_stop called on a non-leaf handler")
        };
        let shared = signalled
            .get_or_init(|| {
                let stop_fn = stop_fn
                    .lock()
                    .take()
                    .expect("stop function must be present on first signal");
                // A panicking stop function must not take down the caller;
                // stop() promises to never fail.
                std::panic::AssertUnwindSafe(stop_fn())
                    .catch_unwind()
                    .map(|_| ())
                    .boxed()
                    .shared()
            })
            .clone();
        shared.boxed()
    }
}

impl std::fmt::Debug for CancellationHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &*self.inner {
            Inner::Empty => "Empty",
            Inner::Leaf { .. } => "Leaf",
            Inner::Compose(..) => "Compose",
            Inner::Deferred(_) => "Deferred",
        };
        f.debug_tuple("CancellationHandler").field(&kind).finish()
    }
}
