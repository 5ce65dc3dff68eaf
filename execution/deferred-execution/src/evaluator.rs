// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! The trampolined IR interpreter. Every composed stage is spawned on the
//! caller's executor, so both the synchronous walk (via the trampoline) and
//! the asynchronous result chains (via task-per-stage) stay stack-flat on
//! arbitrarily deep graphs.

use crate::{
    cache::{CacheEntry, EvalCache, EvalFuture, WriteCountersFuture},
    config::JobConfig,
    counters::CountersById,
    error::ExecutionError,
    node::{
        DynVal, EvalOut, FlatMapFn, FlowSpecFn, MapFn, NodeKind, NodeRef, PresentArgs, PresentFn,
        ProducerFn, RecoverFn, SideFn, WithIdFn,
    },
    optimize::optimize,
    pipe::WriteDescriptor,
    writer::Mode,
};
use aptos_cancellable_futures::{CancellableFuture, CancellationHandler, FuturePromise};
use futures::{future::BoxFuture, FutureExt};
use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tokio::{runtime::Handle, sync::oneshot};
use tracing::{debug, error, warn};

/// How long a failed run waits for stop signals to be acknowledged before
/// the writer is torn down.
pub(crate) const CANCELLATION_BUDGET: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub(crate) struct EvalCtx {
    pub handle: Handle,
    pub mode: Mode,
    pub cache: EvalCache,
}

/// One trampoline step. `Bind` pushes a continuation and descends into the
/// sub-step, keeping the interpreter's own stack on the heap so deep
/// `FlatMapped`/`Mapped` chains cannot overflow the native stack.
pub(crate) enum Step {
    Done(EvalFuture),
    Call(Box<dyn FnOnce() -> Step + Send>),
    Bind {
        sub: Box<dyn FnOnce() -> Step + Send>,
        cont: Box<dyn FnOnce(EvalFuture) -> Step + Send>,
    },
}

impl Step {
    fn call(sub: impl FnOnce() -> Step + Send + 'static) -> Self {
        Self::Call(Box::new(sub))
    }

    fn bind(
        sub: impl FnOnce() -> Step + Send + 'static,
        cont: impl FnOnce(EvalFuture) -> Step + Send + 'static,
    ) -> Self {
        Self::Bind {
            sub: Box::new(sub),
            cont: Box::new(cont),
        }
    }
}

pub(crate) fn run_trampoline(step: Step) -> EvalFuture {
    let mut continuations: Vec<Box<dyn FnOnce(EvalFuture) -> Step + Send>> = Vec::new();
    let mut current = step;
    loop {
        current = match current {
            Step::Done(future) => match continuations.pop() {
                Some(cont) => cont(future),
                None => return future,
            },
            Step::Call(sub) => sub(),
            Step::Bind { sub, cont } => {
                continuations.push(cont);
                sub()
            },
        };
    }
}

/// Interprets `node` under `conf`, memoizing through the context's cache.
pub(crate) fn eval(ctx: &EvalCtx, conf: &JobConfig, node: &NodeRef) -> Step {
    match node.kind() {
        NodeKind::FutureConst(producer) => eval_future_const(ctx, producer.clone()),
        NodeKind::FlowSpec(spec_fn) => {
            memoized(ctx, conf, node, eval_flow_spec(ctx, conf, spec_fn.clone()))
        },
        NodeKind::Mapped { prev, map_fn } => memoized(
            ctx,
            conf,
            node,
            eval_mapped(ctx, conf, prev.clone(), map_fn.clone()),
        ),
        NodeKind::FlatMapped { prev, flat_map_fn } => memoized(
            ctx,
            conf,
            node,
            eval_flat_mapped(ctx, conf, prev.clone(), flat_map_fn.clone()),
        ),
        NodeKind::Zipped { left, right } => memoized(
            ctx,
            conf,
            node,
            eval_zipped(ctx, conf, left.clone(), right.clone()),
        ),
        NodeKind::OnComplete { prev, side_fn } => {
            eval_on_complete(ctx, conf, prev.clone(), side_fn.clone())
        },
        NodeKind::RecoverWith { prev, recover_fn } => memoized(
            ctx,
            conf,
            node,
            eval_recover_with(ctx, conf, prev.clone(), recover_fn.clone()),
        ),
        NodeKind::GetCounters { prev } => {
            memoized(ctx, conf, node, eval_get_counters(ctx, conf, prev.clone()))
        },
        NodeKind::ResetCounters { prev } => memoized(
            ctx,
            conf,
            node,
            eval_reset_counters(ctx, conf, prev.clone()),
        ),
        NodeKind::TransformedConfig { prev, config_fn } => {
            let inner_conf = config_fn(conf);
            let sub_ctx = ctx.clone();
            let prev = prev.clone();
            memoized(ctx, conf, node, move || {
                Step::call(move || eval(&sub_ctx, &inner_conf, &prev))
            })
        },
        NodeKind::WithNewCache { prev } => {
            let isolated = EvalCtx {
                cache: ctx.cache.clean_cache(),
                ..ctx.clone()
            };
            let inner_conf = conf.clone();
            let prev = prev.clone();
            memoized(ctx, conf, node, move || {
                Step::call(move || eval(&isolated, &inner_conf, &prev))
            })
        },
        NodeKind::WithId(id_fn) => memoized(ctx, conf, node, eval_with_id(ctx, conf, id_fn.clone())),
        NodeKind::Reader => {
            let value: DynVal = Arc::new((conf.clone(), ctx.mode.clone()));
            memoized(ctx, conf, node, move || {
                Step::Done(CancellableFuture::successful((
                    value,
                    CountersById::empty(),
                )))
            })
        },
        NodeKind::Write {
            head,
            tail,
            present,
        } => eval_write(ctx, conf, head, tail, present.clone()),
    }
}

/// Memoizes `build` under `(conf, node)`: at most one builder runs per key,
/// and every evaluation within the run observes the same shared future.
fn memoized(
    ctx: &EvalCtx,
    conf: &JobConfig,
    node: &NodeRef,
    build: impl FnOnce() -> Step + Send + 'static,
) -> Step {
    match ctx.cache.exec_entry(conf, node) {
        CacheEntry::Existing(future) => Step::Done(future),
        CacheEntry::New(promise, installed) => Step::bind(build, move |future| {
            promise.complete(future);
            Step::Done(installed)
        }),
    }
}

fn eval_future_const(ctx: &EvalCtx, producer: ProducerFn) -> Step {
    let handle = ctx.handle.clone();
    Step::call(move || {
        let work = producer();
        Step::Done(CancellableFuture::spawn(&handle, async move {
            let value = work.await?;
            Ok((value, CountersById::empty()))
        }))
    })
}

fn eval_mapped(
    ctx: &EvalCtx,
    conf: &JobConfig,
    prev: NodeRef,
    map_fn: MapFn,
) -> impl FnOnce() -> Step + Send + 'static {
    let ctx = ctx.clone();
    let conf = conf.clone();
    move || {
        let handle = ctx.handle.clone();
        let sub_ctx = ctx.clone();
        let sub_conf = conf.clone();
        Step::bind(
            move || eval(&sub_ctx, &sub_conf, &prev),
            move |prev_future| {
                let handler = prev_future.handler().clone();
                let result = prev_future.result();
                let mapped = CancellableFuture::spawn(&handle, async move {
                    let (value, counters) = result.await?;
                    Ok((map_fn(value)?, counters))
                })
                .with_handler(handler);
                Step::Done(mapped)
            },
        )
    }
}

fn eval_flat_mapped(
    ctx: &EvalCtx,
    conf: &JobConfig,
    prev: NodeRef,
    flat_map_fn: FlatMapFn,
) -> impl FnOnce() -> Step + Send + 'static {
    let ctx = ctx.clone();
    let conf = conf.clone();
    move || {
        let handle = ctx.handle.clone();
        let sub_ctx = ctx.clone();
        let sub_conf = conf.clone();
        Step::bind(
            move || eval(&sub_ctx, &sub_conf, &prev),
            move |prev_future| {
                let (next_handler, deferred) = deferred_handler();
                // The first stage's handler fires alongside the (deferred)
                // second stage's: whichever is in flight gets the signal.
                let handler =
                    CancellationHandler::compose(prev_future.handler().clone(), deferred);
                let result = prev_future.result();
                let flat_mapped = CancellableFuture::spawn(&handle, async move {
                    let (value, counters) = result.await?;
                    let next = maybe_optimize(&conf, flat_map_fn(value)?);
                    let next_future = run_trampoline(eval(&ctx, &conf, &next));
                    let _ = next_handler.send(next_future.handler().clone());
                    let (next_value, next_counters) = next_future.await?;
                    Ok((next_value, counters.merge(&next_counters)))
                })
                .with_handler(handler);
                Step::Done(flat_mapped)
            },
        )
    }
}

fn eval_zipped(
    ctx: &EvalCtx,
    conf: &JobConfig,
    left: NodeRef,
    right: NodeRef,
) -> impl FnOnce() -> Step + Send + 'static {
    let ctx = ctx.clone();
    let conf = conf.clone();
    move || {
        let handle = ctx.handle.clone();
        let left_ctx = ctx.clone();
        let left_conf = conf.clone();
        Step::bind(
            move || eval(&left_ctx, &left_conf, &left),
            move |left_future| {
                let right_ctx = ctx.clone();
                let right_conf = conf.clone();
                Step::bind(
                    move || eval(&right_ctx, &right_conf, &right),
                    move |right_future| {
                        let zipped = left_future.zip(right_future);
                        let handler = zipped.handler().clone();
                        let result = zipped.result();
                        let combined = CancellableFuture::spawn(&handle, async move {
                            let ((left_value, left_counters), (right_value, right_counters)) =
                                result.await?;
                            let pair: DynVal = Arc::new((left_value, right_value));
                            Ok((pair, left_counters.merge(&right_counters)))
                        })
                        .with_handler(handler);
                        Step::Done(combined)
                    },
                )
            },
        )
    }
}

fn eval_on_complete(ctx: &EvalCtx, conf: &JobConfig, prev: NodeRef, side_fn: SideFn) -> Step {
    let ctx = ctx.clone();
    let conf = conf.clone();
    let handle = ctx.handle.clone();
    Step::bind(
        move || eval(&ctx, &conf, &prev),
        move |prev_future| {
            let handler = prev_future.handler().clone();
            let result = prev_future.result();
            let observed = CancellableFuture::spawn(&handle, async move {
                let outcome = result.await;
                let value_outcome = outcome
                    .as_ref()
                    .map(|(value, _)| value.clone())
                    .map_err(|error| error.clone());
                // The side effect runs to completion before any dependent
                // observes the result; its own failures go to the failure
                // sink and never change the outcome.
                if let Err(panic) =
                    std::panic::catch_unwind(AssertUnwindSafe(|| side_fn(&value_outcome)))
                {
                    error!(panic = ?panic, "on-complete side effect panicked");
                }
                outcome
            })
            .with_handler(handler);
            Step::Done(observed)
        },
    )
}

fn eval_recover_with(
    ctx: &EvalCtx,
    conf: &JobConfig,
    prev: NodeRef,
    recover_fn: RecoverFn,
) -> impl FnOnce() -> Step + Send + 'static {
    let ctx = ctx.clone();
    let conf = conf.clone();
    move || {
        let handle = ctx.handle.clone();
        let sub_ctx = ctx.clone();
        let sub_conf = conf.clone();
        Step::bind(
            move || eval(&sub_ctx, &sub_conf, &prev),
            move |prev_future| {
                let (recovery_handler, deferred) = deferred_handler();
                let handler =
                    CancellationHandler::compose(prev_future.handler().clone(), deferred);
                let result = prev_future.result();
                let recovered = CancellableFuture::spawn(&handle, async move {
                    match result.await {
                        Ok(out) => Ok(out),
                        // The flow-stop signal is re-raised unchanged; a
                        // cancellation must never be recovered into success.
                        Err(error) if error.is_flow_stop() => Err(error),
                        Err(error) => match recover_fn(&error) {
                            Some(recovery) => {
                                let recovery = maybe_optimize(&conf, recovery);
                                let recovery_future =
                                    run_trampoline(eval(&ctx, &conf, &recovery));
                                let _ =
                                    recovery_handler.send(recovery_future.handler().clone());
                                recovery_future.await
                            },
                            None => Err(error),
                        },
                    }
                })
                .with_handler(handler);
                Step::Done(recovered)
            },
        )
    }
}

fn eval_get_counters(
    ctx: &EvalCtx,
    conf: &JobConfig,
    prev: NodeRef,
) -> impl FnOnce() -> Step + Send + 'static {
    let ctx = ctx.clone();
    let conf = conf.clone();
    move || {
        let handle = ctx.handle.clone();
        Step::bind(
            move || eval(&ctx, &conf, &prev),
            move |prev_future| {
                let handler = prev_future.handler().clone();
                let result = prev_future.result();
                let surfaced = CancellableFuture::spawn(&handle, async move {
                    let (value, counters) = result.await?;
                    let paired: DynVal = Arc::new((value, counters.flatten()));
                    // Counters stay attached for outer accumulation.
                    Ok((paired, counters))
                })
                .with_handler(handler);
                Step::Done(surfaced)
            },
        )
    }
}

fn eval_reset_counters(
    ctx: &EvalCtx,
    conf: &JobConfig,
    prev: NodeRef,
) -> impl FnOnce() -> Step + Send + 'static {
    let ctx = ctx.clone();
    let conf = conf.clone();
    move || {
        let handle = ctx.handle.clone();
        Step::bind(
            move || eval(&ctx, &conf, &prev),
            move |prev_future| {
                let handler = prev_future.handler().clone();
                let result = prev_future.result();
                let reset = CancellableFuture::spawn(&handle, async move {
                    let (value, _discarded) = result.await?;
                    Ok((value, CountersById::empty()))
                })
                .with_handler(handler);
                Step::Done(reset)
            },
        )
    }
}

fn eval_with_id(
    ctx: &EvalCtx,
    conf: &JobConfig,
    id_fn: WithIdFn,
) -> impl FnOnce() -> Step + Send + 'static {
    let ctx = ctx.clone();
    let conf = conf.clone();
    move || {
        let (unique_id, conf_with_id) = conf.ensure_unique_id();
        let next = id_fn(unique_id);
        Step::call(move || eval(&ctx, &conf_with_id, &next))
    }
}

fn eval_flow_spec(
    ctx: &EvalCtx,
    conf: &JobConfig,
    spec_fn: FlowSpecFn,
) -> impl FnOnce() -> Step + Send + 'static {
    let ctx = ctx.clone();
    let conf = conf.clone();
    move || {
        let spec = match spec_fn(&conf, &ctx.mode) {
            Ok(spec) => spec,
            Err(error) => return Step::Done(CancellableFuture::failed(error)),
        };
        let submission = match ctx.cache.writer().submit_flow_spec(&conf, spec) {
            Ok(submission) => submission,
            Err(error) => return Step::Done(CancellableFuture::failed(error)),
        };
        let handler = submission.handler().clone();
        let result = submission.result();
        let completed = CancellableFuture::spawn(&ctx.handle, async move {
            let (id, counters) = result.await?;
            let value: DynVal = Arc::new(());
            Ok((value, CountersById::singleton(id, counters)))
        })
        .with_handler(handler);
        Step::Done(completed)
    }
}

/// The write coalescer. Descriptors race for ownership through the write
/// table: winners are bundled into a single `writer.execute` call whose
/// shared future also resolves every peer's entry, so each descriptor is
/// submitted exactly once per run and all observers see the same counters.
fn eval_write(
    ctx: &EvalCtx,
    conf: &JobConfig,
    head: &WriteDescriptor,
    tail: &[WriteDescriptor],
    present: PresentFn,
) -> Step {
    let ctx = ctx.clone();
    let conf = conf.clone();
    let descriptors: Vec<WriteDescriptor> =
        std::iter::once(head.clone()).chain(tail.iter().cloned()).collect();
    Step::call(move || {
        let mut owned: Vec<(WriteDescriptor, FuturePromise<CountersById, ExecutionError>)> =
            Vec::new();
        let mut peers: Vec<WriteCountersFuture> = Vec::new();
        for descriptor in descriptors {
            match ctx.cache.write_entry(&conf, &descriptor) {
                CacheEntry::New(promise, _) => owned.push((descriptor, promise)),
                CacheEntry::Existing(future) => peers.push(future),
            }
        }

        // A peer that already failed fails this node without submitting
        // anything new.
        if let Some(error) = peers.iter().find_map(|future| future.peek_failure()) {
            return Step::Done(CancellableFuture::failed(error));
        }

        let submission: WriteCountersFuture = if owned.is_empty() {
            CancellableFuture::successful(CountersById::empty())
        } else {
            let bundle: Vec<WriteDescriptor> = owned
                .iter()
                .map(|(descriptor, _)| descriptor.clone())
                .collect();
            let executed = ctx.cache.writer().execute(&conf, bundle);
            let by_id = executed
                .map(|(id, counters)| Ok(CountersById::singleton(id, counters)));
            for (_, promise) in owned {
                promise.complete(by_id.clone());
            }
            by_id
        };

        let combined = submission.zip(CancellableFuture::sequence(peers));
        let handler = combined.handler().clone();
        let result = combined.result();
        let args = PresentArgs {
            conf,
            mode: ctx.mode.clone(),
            writer: ctx.cache.writer().clone(),
            handle: ctx.handle.clone(),
        };
        let presented = CancellableFuture::spawn(&ctx.handle, async move {
            let (own_counters, peer_counters) = result.await?;
            let merged = peer_counters
                .iter()
                .fold(own_counters, |acc, counters| acc.merge(counters));
            let value = present(args).await?;
            Ok((value, merged))
        })
        .with_handler(handler);
        Step::Done(presented)
    })
}

fn maybe_optimize(conf: &JobConfig, node: NodeRef) -> NodeRef {
    if conf.optimization_enabled() {
        optimize(&node)
    } else {
        node
    }
}

fn deferred_handler() -> (oneshot::Sender<CancellationHandler>, CancellationHandler) {
    let (sender, receiver) = oneshot::channel();
    let deferred = CancellationHandler::from_future(async move {
        receiver
            .await
            .unwrap_or_else(|_| CancellationHandler::empty())
    });
    (sender, deferred)
}

/// Drives one `run` invocation: optimize, evaluate against a fresh writer
/// and cache, and on failure give the cancellation chain a bounded window
/// before the writer is released.
pub(crate) fn run_root(
    node: NodeRef,
    handle: Handle,
    conf: JobConfig,
    mode: Mode,
) -> BoxFuture<'static, Result<EvalOut, ExecutionError>> {
    async move {
        let conf = conf.with_execution_id(uuid::Uuid::new_v4());
        let node = if conf.optimization_enabled() {
            optimize(&node)
        } else {
            node
        };
        let writer = mode.new_writer(&handle);
        let cache = EvalCache::new(writer.clone());
        let ctx = EvalCtx {
            handle,
            mode,
            cache,
        };

        writer.start();
        let evaluated = run_trampoline(eval(&ctx, &conf, &node));
        let outcome = evaluated.clone().await;
        match &outcome {
            Ok(_) => debug!(execution_id = ?conf.execution_id(), "execution completed"),
            Err(error) => {
                warn!(
                    execution_id = ?conf.execution_id(),
                    error = %error,
                    "execution failed; stopping in-flight work"
                );
                evaluated
                    .handler()
                    .stop_with_deadline(CANCELLATION_BUDGET)
                    .await;
            },
        }
        writer.finished();
        outcome
    }
    .boxed()
}
