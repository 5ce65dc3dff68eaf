// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    cache::EvalCache,
    config::JobConfig,
    counters::{Counters, StatKey, SubmissionId},
    error::ExecutionError,
    evaluator::EvalCtx,
    pipe::{FlowSpec, Pipe, WriteDescriptor},
    writer::{FlowPlanner, Mode, Record, RecordBatch},
};
use aptos_infallible::Mutex;
use futures::future::BoxFuture;
use std::{collections::HashSet, sync::Arc};
use tokio::runtime::Handle;

/// A planner that records everything it is asked to do and answers from
/// canned data. Pipes can be marked failing (the flow errors) or stalled
/// (the flow never completes, for cancellation tests).
#[derive(Default)]
pub(crate) struct MockPlanner {
    flows: Mutex<Vec<Vec<WriteDescriptor>>>,
    spec_runs: Mutex<Vec<String>>,
    stops: Mutex<Vec<SubmissionId>>,
    shutdowns: Mutex<usize>,
    failing: Mutex<HashSet<String>>,
    stalled: Mutex<HashSet<String>>,
}

impl MockPlanner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_pipe(&self, pipe: &Pipe) {
        self.failing.lock().insert(pipe.label().to_string());
    }

    pub fn stall_pipe(&self, pipe: &Pipe) {
        self.stalled.lock().insert(pipe.label().to_string());
    }

    /// Every submitted bundle, in submission order.
    pub fn flows(&self) -> Vec<Vec<WriteDescriptor>> {
        self.flows.lock().clone()
    }

    pub fn spec_runs(&self) -> Vec<String> {
        self.spec_runs.lock().clone()
    }

    pub fn stops(&self) -> Vec<SubmissionId> {
        self.stops.lock().clone()
    }

    pub fn shutdowns(&self) -> usize {
        *self.shutdowns.lock()
    }
}

/// Counter key every mock flow reports its record count under.
pub(crate) fn records_key() -> StatKey {
    StatKey::new("flow", "records")
}

impl FlowPlanner for MockPlanner {
    fn run_flow(
        &self,
        _conf: &JobConfig,
        writes: &[WriteDescriptor],
    ) -> BoxFuture<'static, Result<Counters, ExecutionError>> {
        self.flows.lock().push(writes.to_vec());
        let labels: Vec<String> = writes
            .iter()
            .map(|descriptor| descriptor.pipe().label().to_string())
            .collect();
        if labels
            .iter()
            .any(|label| self.failing.lock().contains(label))
        {
            return Box::pin(futures::future::ready(Err(ExecutionError::message(
                "planner failure",
            ))));
        }
        if labels
            .iter()
            .any(|label| self.stalled.lock().contains(label))
        {
            return Box::pin(futures::future::pending());
        }
        let counters = Counters::from_iter(
            std::iter::once((records_key(), labels.len() as i64)).chain(
                labels
                    .into_iter()
                    .map(|label| (StatKey::new("write", label), 1)),
            ),
        );
        Box::pin(futures::future::ready(Ok(counters)))
    }

    fn run_flow_spec(
        &self,
        _conf: &JobConfig,
        spec: &FlowSpec,
    ) -> BoxFuture<'static, Result<Counters, ExecutionError>> {
        self.spec_runs.lock().push(spec.label().to_string());
        let counters = Counters::from_iter([(StatKey::new("spec", spec.label()), 1)]);
        Box::pin(futures::future::ready(Ok(counters)))
    }

    fn stop(&self, id: SubmissionId) -> BoxFuture<'static, ()> {
        self.stops.lock().push(id);
        Box::pin(futures::future::ready(()))
    }

    fn shutdown(&self) {
        *self.shutdowns.lock() += 1;
    }

    fn forced_pipe(
        &self,
        _conf: &JobConfig,
        pipe: &Pipe,
    ) -> BoxFuture<'static, Result<Pipe, ExecutionError>> {
        let forced = Pipe::new(format!("forced-{}", pipe.label()));
        Box::pin(futures::future::ready(Ok(forced)))
    }

    fn iterable(
        &self,
        _conf: &JobConfig,
        pipe: &Pipe,
    ) -> BoxFuture<'static, Result<RecordBatch, ExecutionError>> {
        let records = Arc::new(vec![
            Record::new(format!("{}-0", pipe.label())),
            Record::new(format!("{}-1", pipe.label())),
        ]);
        Box::pin(futures::future::ready(Ok(records)))
    }
}

pub(crate) fn local_mode(planner: &Arc<MockPlanner>) -> Mode {
    Mode::local(planner.clone() as Arc<dyn FlowPlanner>)
}

pub(crate) fn cluster_mode(planner: &Arc<MockPlanner>) -> Mode {
    Mode::cluster(planner.clone() as Arc<dyn FlowPlanner>)
}

/// An evaluation context over a fresh writer and cache, for tests that
/// drive the evaluator directly and inspect the cache.
pub(crate) fn eval_ctx(planner: &Arc<MockPlanner>) -> (EvalCtx, EvalCache) {
    let mode = local_mode(planner);
    let writer = mode.new_writer(&Handle::current());
    let cache = EvalCache::new(writer);
    let ctx = EvalCtx {
        handle: Handle::current(),
        mode,
        cache: cache.clone(),
    };
    (ctx, cache)
}
