// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! The typed combinator surface over the execution IR.
//!
//! An [`Execution`] is only a description: combinators build an immutable
//! graph, and nothing runs until [`run`](Execution::run). Within one run,
//! structurally equal sub-graphs evaluate once. Equality of function
//! positions is by closure identity — cloning an `Execution` (or reusing
//! one) preserves it, while re-constructing a textually identical pipeline
//! builds fresh closures and therefore a distinct graph.

use crate::{
    config::{CachedFile, JobConfig, UniqueId},
    counters::Counters,
    error::ExecutionError,
    evaluator::run_root,
    node::{
        DynVal, ExecNode, FlatMapFn, MapFn, NodeKind, NodeRef, PresentFn, ProducerFn, RecoverFn,
        SideFn, WithIdFn,
    },
    optimize::{map_node, zip_nodes},
    pipe::{FlowSpec, Pipe, Sink, WriteDescriptor},
    writer::{Mode, RecordBatch},
};
use aptos_cancellable_futures::{AsyncSemaphore, PermitSlot};
use futures::{future::BoxFuture, FutureExt};
use std::{marker::PhantomData, sync::Arc};
use tokio::runtime::Handle;

fn erase<T: Send + Sync + 'static>(value: T) -> DynVal {
    Arc::new(value)
}

fn downcast<T: Clone + Send + Sync + 'static>(value: &DynVal) -> T {
    value
        .downcast_ref::<T>()
        .expect("execution value carried an unexpected type")
        .clone()
}

/// A deferred, composable description of asynchronous batch work producing
/// a `T`.
pub struct Execution<T> {
    node: NodeRef,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Execution<T> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Execution<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Execution").field(&self.node).finish()
    }
}

impl<T> Execution<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn from_node(node: NodeRef) -> Self {
        Self {
            node,
            _marker: PhantomData,
        }
    }

    pub(crate) fn node(&self) -> &NodeRef {
        &self.node
    }

    /// An execution that yields `value`.
    pub fn from_value(value: T) -> Self {
        Self::from_fn(move || Ok(value.clone()))
    }

    /// Defers `f` to the run's executor. Panics inside `f` surface as
    /// failures of this execution.
    pub fn from_fn(f: impl Fn() -> Result<T, ExecutionError> + Send + Sync + 'static) -> Self {
        let f = Arc::new(f);
        let producer: ProducerFn = Arc::new(move || {
            let f = f.clone();
            async move { f().map(erase) }.boxed()
        });
        Self::from_node(ExecNode::new(NodeKind::FutureConst(producer)))
    }

    /// Defers an asynchronous producer to the run's executor.
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<T, ExecutionError>> + Send + 'static,
    {
        let producer: ProducerFn = Arc::new(move || {
            let work = f();
            async move { work.await.map(erase) }.boxed()
        });
        Self::from_node(ExecNode::new(NodeKind::FutureConst(producer)))
    }

    pub fn from_result(result: Result<T, ExecutionError>) -> Self {
        match result {
            Ok(value) => Self::from_value(value),
            Err(error) => Self::failed(error),
        }
    }

    pub fn failed(error: ExecutionError) -> Self {
        Self::from_fn(move || Err(error.clone()))
    }

    /// Pure transform of the result. Mapping over a write folds into the
    /// write's result function so the submission stays a single bundle.
    pub fn map<U>(self, f: impl Fn(T) -> U + Send + Sync + 'static) -> Execution<U>
    where
        U: Clone + Send + Sync + 'static,
    {
        let map_fn: MapFn = Arc::new(move |value| Ok(erase(f(downcast::<T>(&value)))));
        Execution::from_node(map_node(&self.node, &map_fn))
    }

    /// Sequential dependent continuation: `f` observes the full value of
    /// this execution before the next stage is planned.
    pub fn flat_map<U>(self, f: impl Fn(T) -> Execution<U> + Send + Sync + 'static) -> Execution<U>
    where
        U: Clone + Send + Sync + 'static,
    {
        let flat_map_fn: FlatMapFn = Arc::new(move |value| Ok(f(downcast::<T>(&value)).node));
        Execution::from_node(ExecNode::new(NodeKind::FlatMapped {
            prev: self.node,
            flat_map_fn,
        }))
    }

    /// Parallel composition. Fails as soon as either side fails; adjacent
    /// writes on the two sides merge into one planner submission.
    pub fn zip<U>(self, other: Execution<U>) -> Execution<(T, U)>
    where
        U: Clone + Send + Sync + 'static,
    {
        let zipped = zip_nodes(&self.node, &other.node);
        let reshape: MapFn = Arc::new(|value| {
            let pair = value
                .downcast_ref::<(DynVal, DynVal)>()
                .expect("zip produces an erased pair");
            Ok(erase((downcast::<T>(&pair.0), downcast::<U>(&pair.1))))
        });
        Execution::from_node(map_node(&zipped, &reshape))
    }

    /// Partial recovery. The handler sees every failure except the
    /// flow-stop signal, which is always re-raised.
    pub fn recover_with(
        self,
        handler: impl Fn(&ExecutionError) -> Option<Execution<T>> + Send + Sync + 'static,
    ) -> Execution<T> {
        let recover_fn: RecoverFn = Arc::new(move |error| handler(error).map(|ex| ex.node));
        Execution::from_node(ExecNode::new(NodeKind::RecoverWith {
            prev: self.node,
            recover_fn,
        }))
    }

    /// Runs `side` once this execution resolves, before any dependent
    /// observes the result. Failures inside `side` are reported to the
    /// failure sink and do not change the outcome.
    pub fn on_complete(
        self,
        side: impl Fn(&Result<T, ExecutionError>) + Send + Sync + 'static,
    ) -> Execution<T> {
        let side_fn: SideFn = Arc::new(move |outcome| {
            let typed = match outcome {
                Ok(value) => Ok(downcast::<T>(value)),
                Err(error) => Err(error.clone()),
            };
            side(&typed);
        });
        Execution::from_node(ExecNode::new(NodeKind::OnComplete {
            prev: self.node,
            side_fn,
        }))
    }

    /// Materializes the counters accumulated so far next to the value. The
    /// counters keep accumulating for enclosing stages.
    pub fn get_counters(self) -> Execution<(T, Counters)> {
        let node = ExecNode::new(NodeKind::GetCounters { prev: self.node });
        let reshape: MapFn = Arc::new(|value| {
            let pair = value
                .downcast_ref::<(DynVal, Counters)>()
                .expect("get_counters produces an erased pair");
            Ok(erase((downcast::<T>(&pair.0), pair.1.clone())))
        });
        Execution::from_node(map_node(&node, &reshape))
    }

    /// Discards the counters accumulated by this sub-execution.
    pub fn reset_counters(self) -> Execution<T> {
        Execution::from_node(ExecNode::new(NodeKind::ResetCounters { prev: self.node }))
    }

    pub fn get_and_reset_counters(self) -> Execution<(T, Counters)> {
        self.get_counters().reset_counters()
    }

    /// Evaluates this sub-tree under a rewritten config. Cache keys use the
    /// rewritten config, so the same sub-tree under different configs is
    /// not conflated.
    pub fn with_config(
        self,
        f: impl Fn(&JobConfig) -> JobConfig + Send + Sync + 'static,
    ) -> Execution<T> {
        Execution::from_node(ExecNode::new(NodeKind::TransformedConfig {
            prev: self.node,
            config_fn: Arc::new(f),
        }))
    }

    /// Evaluates this sub-tree against a fresh memoization scope, bounding
    /// peak cache growth on large fan-outs. Writes still de-duplicate
    /// run-wide.
    pub fn with_new_cache(self) -> Execution<T> {
        Execution::from_node(ExecNode::new(NodeKind::WithNewCache { prev: self.node }))
    }

    /// Fails with a domain error when `predicate` rejects the value.
    pub fn filter(self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Execution<T>
    where
        T: std::fmt::Debug,
    {
        self.flat_map(move |value| {
            if predicate(&value) {
                Execution::from_value(value)
            } else {
                Execution::failed(ExecutionError::FilterFailed {
                    value: format!("{:?}", value),
                })
            }
        })
    }

    /// Reifies the outcome into the value position; flow stops still
    /// propagate as failures.
    pub fn lift_to_try(self) -> Execution<Result<T, ExecutionError>> {
        self.map(|value| Ok(value))
            .recover_with(|error| Some(Execution::from_value(Err(error.clone()))))
    }

    /// Requests a fresh unique token, recorded in the config the sub-tree
    /// runs under.
    pub fn with_id(f: impl Fn(UniqueId) -> Execution<T> + Send + Sync + 'static) -> Execution<T> {
        let id_fn: WithIdFn = Arc::new(move |unique_id| f(unique_id).node);
        Execution::from_node(ExecNode::new(NodeKind::WithId(id_fn)))
    }

    /// Registers `path` for distribution through the platform's file cache
    /// and hands the sub-tree its job-side token.
    pub fn with_cached_file(
        path: impl Into<String>,
        f: impl Fn(CachedFile) -> Execution<T> + Send + Sync + 'static,
    ) -> Execution<T> {
        let path = path.into();
        Self::with_id(move |token| {
            let file = CachedFile::new(path.clone(), token);
            let entry = file.config_entry();
            f(file).with_config(move |conf| conf.add_cached_file(&entry))
        })
    }

    /// Zips all executions together; every element is submitted in
    /// parallel and the values come back in input order.
    pub fn sequence(executions: Vec<Execution<T>>) -> Execution<Vec<T>> {
        let mut collected = Execution::<Vec<T>>::from_value(Vec::new());
        for execution in executions {
            collected = collected.zip(execution).map(|(mut values, value)| {
                values.push(value);
                values
            });
        }
        collected
    }

    /// Like [`sequence`](Self::sequence), but with at most `parallelism`
    /// elements in flight. Permits release on success and failure alike;
    /// the original outcome is re-raised afterwards.
    pub fn with_parallelism(
        executions: Vec<Execution<T>>,
        parallelism: usize,
    ) -> Execution<Vec<T>> {
        assert!(parallelism > 0, "parallelism bound must be positive");
        let semaphore = AsyncSemaphore::new(parallelism);
        let bounded = executions
            .into_iter()
            .map(|execution| {
                let semaphore = semaphore.clone();
                Execution::<Arc<PermitSlot>>::from_async(move || {
                    let semaphore = semaphore.clone();
                    async move { Ok(Arc::new(PermitSlot::new(semaphore.acquire().await))) }
                })
                .flat_map(move |slot| {
                    let execution = execution.clone();
                    execution.lift_to_try().map(move |outcome| {
                        slot.release();
                        outcome
                    })
                })
                .flat_map(Execution::from_result)
            })
            .collect();
        Execution::sequence(bounded)
    }

    /// Optimizes the graph, evaluates it against a fresh writer and cache,
    /// and resolves with the final value. On failure the cancellation chain
    /// gets a bounded grace period before the writer is released.
    pub fn run(
        &self,
        handle: &Handle,
        conf: JobConfig,
        mode: Mode,
    ) -> BoxFuture<'static, Result<T, ExecutionError>> {
        let root = run_root(self.node.clone(), handle.clone(), conf, mode);
        async move {
            let (value, _counters) = root.await?;
            Ok(downcast::<T>(&value))
        }
        .boxed()
    }

    /// [`run`](Self::run), also reporting the run's flattened counters.
    pub fn run_and_report(
        &self,
        handle: &Handle,
        conf: JobConfig,
        mode: Mode,
    ) -> BoxFuture<'static, Result<(T, Counters), ExecutionError>> {
        let root = run_root(self.node.clone(), handle.clone(), conf, mode);
        async move {
            let (value, counters) = root.await?;
            Ok((downcast::<T>(&value), counters.flatten()))
        }
        .boxed()
    }

    /// Blocking [`run`](Self::run). Discouraged: only for entry points that
    /// own no async context themselves, never from a runtime thread.
    pub fn wait_for(&self, handle: &Handle, conf: JobConfig, mode: Mode) -> Result<T, ExecutionError> {
        futures::executor::block_on(self.run(handle, conf, mode))
    }
}

impl Execution<()> {
    pub fn unit() -> Self {
        Execution::from_value(())
    }

    /// Writes `pipe` into `sink` when the enclosing run submits.
    pub fn write(pipe: Pipe, sink: Sink) -> Self {
        let present: PresentFn = Arc::new(|_args| async { Ok(erase(())) }.boxed());
        Execution::from_node(ExecNode::new(NodeKind::Write {
            head: WriteDescriptor::Simple { pipe, sink },
            tail: Vec::new(),
            present,
        }))
    }

    /// Submits a raw planner flow description. Only writers that can plan
    /// one accept it; others fail this sub-execution.
    pub fn from_flow_spec(
        f: impl Fn(&JobConfig, &Mode) -> Result<FlowSpec, ExecutionError> + Send + Sync + 'static,
    ) -> Self {
        Execution::from_node(ExecNode::new(NodeKind::FlowSpec(Arc::new(f))))
    }
}

impl Execution<Pipe> {
    /// Materializes `pipe` and yields the handle of the materialized form.
    pub fn force_to_disk(pipe: Pipe) -> Self {
        let present_pipe = pipe.clone();
        let present: PresentFn = Arc::new(move |args| {
            let pipe = present_pipe.clone();
            async move {
                let forced = args.writer.get_forced(&args.conf, &pipe).await?;
                Ok(erase(forced))
            }
            .boxed()
        });
        Execution::from_node(ExecNode::new(NodeKind::Write {
            head: WriteDescriptor::Force { pipe },
            tail: Vec::new(),
            present,
        }))
    }
}

impl Execution<RecordBatch> {
    /// Materializes `pipe` and reads it back as client-side records.
    pub fn to_iterable(pipe: Pipe) -> Self {
        let present_pipe = pipe.clone();
        let present: PresentFn = Arc::new(move |args| {
            let pipe = present_pipe.clone();
            async move {
                let records = args.writer.get_iterable(&args.conf, &pipe).await?;
                Ok(erase(records))
            }
            .boxed()
        });
        Execution::from_node(ExecNode::new(NodeKind::Write {
            head: WriteDescriptor::ToIterable { pipe },
            tail: Vec::new(),
            present,
        }))
    }
}

impl Execution<(JobConfig, Mode)> {
    /// Yields the effective config and mode of the enclosing run.
    pub fn reader() -> Self {
        Execution::from_node(ExecNode::new(NodeKind::Reader))
    }
}

pub fn zip3<A, B, C>(a: Execution<A>, b: Execution<B>, c: Execution<C>) -> Execution<(A, B, C)>
where
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
{
    a.zip(b).zip(c).map(|((a, b), c)| (a, b, c))
}

pub fn zip4<A, B, C, D>(
    a: Execution<A>,
    b: Execution<B>,
    c: Execution<C>,
    d: Execution<D>,
) -> Execution<(A, B, C, D)>
where
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
    C: Clone + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
{
    a.zip(b).zip(c).zip(d).map(|(((a, b), c), d)| (a, b, c, d))
}
