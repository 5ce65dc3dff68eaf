// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    config::JobConfig,
    counters::{Counters, SubmissionId},
    error::ExecutionError,
    pipe::{FlowSpec, Pipe, WriteDescriptor},
};
use aptos_cancellable_futures::{CancellableFuture, CancellationHandler};
use futures::future::BoxFuture;
use std::{
    any::Any,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};
use tokio::runtime::Handle;
use tracing::{debug, warn};

/// An opaque record read back from a materialized pipe.
#[derive(Clone)]
pub struct Record(Arc<dyn Any + Send + Sync>);

impl Record {
    pub fn new<T: Send + Sync + 'static>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}

impl std::fmt::Debug for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Record")
    }
}

pub type RecordBatch = Arc<Vec<Record>>;

pub type SubmissionFuture = CancellableFuture<(SubmissionId, Counters), ExecutionError>;

/// The engine's view of the component that plans and runs write bundles.
///
/// Lifecycle: `start` is called once before any `execute`, `finished`
/// exactly once after the last one — also on failed runs, after the
/// cancellation budget elapsed — and must release resources without
/// failing. `get_forced` / `get_iterable` are only valid for pipes whose
/// enclosing `execute` succeeded.
pub trait Writer: Send + Sync {
    fn start(&self);

    fn finished(&self);

    /// Atomically plans and runs `writes` as one submission. An empty
    /// bundle is legal and yields a fresh id with empty counters.
    fn execute(&self, conf: &JobConfig, writes: Vec<WriteDescriptor>) -> SubmissionFuture;

    fn get_forced(
        &self,
        conf: &JobConfig,
        pipe: &Pipe,
    ) -> BoxFuture<'static, Result<Pipe, ExecutionError>>;

    fn get_iterable(
        &self,
        conf: &JobConfig,
        pipe: &Pipe,
    ) -> BoxFuture<'static, Result<RecordBatch, ExecutionError>>;

    /// Raw flow-spec submission; only some writer kinds can plan one.
    fn submit_flow_spec(
        &self,
        _conf: &JobConfig,
        _spec: FlowSpec,
    ) -> Result<SubmissionFuture, ExecutionError> {
        Err(ExecutionError::FlowSpecUnsupported)
    }
}

/// The external planner/submitter a [`FlowWriter`] drives. Implementations
/// own all planner state; the engine never calls `run_flow` twice for the
/// same descriptor within a run.
pub trait FlowPlanner: Send + Sync + 'static {
    /// Plans and runs one bundle of writes as a single flow, returning the
    /// flow's counters. Planner-level optimization across the bundle is the
    /// reason adjacent writes are worth coalescing.
    fn run_flow(
        &self,
        conf: &JobConfig,
        writes: &[WriteDescriptor],
    ) -> BoxFuture<'static, Result<Counters, ExecutionError>>;

    /// Runs a raw flow description, for planners that can take one as-is.
    fn run_flow_spec(
        &self,
        _conf: &JobConfig,
        _spec: &FlowSpec,
    ) -> BoxFuture<'static, Result<Counters, ExecutionError>> {
        Box::pin(futures::future::ready(Err(
            ExecutionError::FlowSpecUnsupported,
        )))
    }

    /// Best-effort stop of an in-flight submission. In-flight flows should
    /// fail with [`ExecutionError::FlowStopped`] once the signal lands.
    fn stop(&self, _id: SubmissionId) -> BoxFuture<'static, ()> {
        Box::pin(futures::future::ready(()))
    }

    /// Releases planner resources once the owning writer is finished.
    fn shutdown(&self) {}

    fn forced_pipe(
        &self,
        conf: &JobConfig,
        pipe: &Pipe,
    ) -> BoxFuture<'static, Result<Pipe, ExecutionError>>;

    fn iterable(
        &self,
        conf: &JobConfig,
        pipe: &Pipe,
    ) -> BoxFuture<'static, Result<RecordBatch, ExecutionError>>;
}

/// Where a run plans and executes its flows.
#[derive(Clone)]
pub struct Mode {
    kind: ModeKind,
    planner: Arc<dyn FlowPlanner>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModeKind {
    /// In-process planner; raw flow specs are not plannable here.
    Local,
    /// Cluster submitter; also honors raw flow-spec submissions.
    Cluster,
}

impl Mode {
    pub fn local(planner: Arc<dyn FlowPlanner>) -> Self {
        Self {
            kind: ModeKind::Local,
            planner,
        }
    }

    pub fn cluster(planner: Arc<dyn FlowPlanner>) -> Self {
        Self {
            kind: ModeKind::Cluster,
            planner,
        }
    }

    pub fn kind(&self) -> ModeKind {
        self.kind
    }

    /// A fresh writer for one `run` invocation.
    pub(crate) fn new_writer(&self, handle: &Handle) -> Arc<dyn Writer> {
        Arc::new(FlowWriter::new(
            self.planner.clone(),
            handle.clone(),
            self.kind == ModeKind::Cluster,
        ))
    }
}

impl std::fmt::Debug for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Mode").field(&self.kind).finish()
    }
}

/// Adapts a [`FlowPlanner`] to the [`Writer`] contract: allocates
/// submission ids, wires a stop signal per submission, and tracks the
/// start/finished lifecycle.
pub struct FlowWriter {
    planner: Arc<dyn FlowPlanner>,
    handle: Handle,
    supports_flow_specs: bool,
    next_submission: AtomicU64,
    started: AtomicBool,
    done: AtomicBool,
}

impl FlowWriter {
    pub fn new(planner: Arc<dyn FlowPlanner>, handle: Handle, supports_flow_specs: bool) -> Self {
        Self {
            planner,
            handle,
            supports_flow_specs,
            next_submission: AtomicU64::new(0),
            started: AtomicBool::new(false),
            done: AtomicBool::new(false),
        }
    }

    fn next_id(&self) -> SubmissionId {
        SubmissionId::new(self.next_submission.fetch_add(1, Ordering::Relaxed))
    }

    fn submit(
        &self,
        id: SubmissionId,
        flow: BoxFuture<'static, Result<Counters, ExecutionError>>,
    ) -> SubmissionFuture {
        let planner = self.planner.clone();
        CancellableFuture::spawn(&self.handle, async move {
            let counters = flow.await?;
            Ok((id, counters))
        })
        .with_handler(CancellationHandler::from_fn(move || planner.stop(id)))
    }
}

impl Writer for FlowWriter {
    fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("writer started twice");
        }
    }

    // Must not fail: runs tear down through here on every exit path.
    fn finished(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            warn!("writer finished twice");
            return;
        }
        self.planner.shutdown();
    }

    fn execute(&self, conf: &JobConfig, writes: Vec<WriteDescriptor>) -> SubmissionFuture {
        let id = self.next_id();
        if writes.is_empty() {
            return CancellableFuture::successful((id, Counters::empty()));
        }
        debug!(
            submission = %id,
            writes = writes.len(),
            "submitting write bundle"
        );
        self.submit(id, self.planner.run_flow(conf, &writes))
    }

    fn get_forced(
        &self,
        conf: &JobConfig,
        pipe: &Pipe,
    ) -> BoxFuture<'static, Result<Pipe, ExecutionError>> {
        self.planner.forced_pipe(conf, pipe)
    }

    fn get_iterable(
        &self,
        conf: &JobConfig,
        pipe: &Pipe,
    ) -> BoxFuture<'static, Result<RecordBatch, ExecutionError>> {
        self.planner.iterable(conf, pipe)
    }

    fn submit_flow_spec(
        &self,
        conf: &JobConfig,
        spec: FlowSpec,
    ) -> Result<SubmissionFuture, ExecutionError> {
        if !self.supports_flow_specs {
            return Err(ExecutionError::FlowSpecUnsupported);
        }
        let id = self.next_id();
        debug!(submission = %id, spec = ?spec, "submitting raw flow spec");
        Ok(self.submit(id, self.planner.run_flow_spec(conf, &spec)))
    }
}
