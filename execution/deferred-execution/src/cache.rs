// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    config::JobConfig,
    counters::CountersById,
    error::ExecutionError,
    node::{EvalOut, NodeKey, NodeRef},
    pipe::WriteDescriptor,
    writer::Writer,
};
use aptos_cancellable_futures::{CancellableFuture, FuturePromise};
use dashmap::{mapref::entry::Entry, DashMap};
use std::sync::Arc;

pub(crate) type EvalFuture = CancellableFuture<EvalOut, ExecutionError>;
pub(crate) type WriteCountersFuture = CancellableFuture<CountersById, ExecutionError>;

/// Outcome of a cache probe. `New` hands the caller ownership of the
/// installed entry's completion; the stored future is already visible to
/// every other prober, so at most one builder runs per key.
pub(crate) enum CacheEntry<T: Clone + Send + Sync + 'static> {
    New(
        FuturePromise<T, ExecutionError>,
        CancellableFuture<T, ExecutionError>,
    ),
    Existing(CancellableFuture<T, ExecutionError>),
}

/// The per-run memoization scope: in-flight or complete evaluations keyed
/// by `(config, node)`, and write submissions keyed by
/// `(config, descriptor)`. Entries are installed as unresolved promises so
/// builders never run under a map shard lock.
#[derive(Clone)]
pub(crate) struct EvalCache {
    writer: Arc<dyn Writer>,
    exec: Arc<DashMap<(JobConfig, NodeKey), EvalFuture>>,
    writes: Arc<DashMap<(JobConfig, WriteDescriptor), WriteCountersFuture>>,
}

impl EvalCache {
    pub(crate) fn new(writer: Arc<dyn Writer>) -> Self {
        Self {
            writer,
            exec: Arc::new(DashMap::new()),
            writes: Arc::new(DashMap::new()),
        }
    }

    pub(crate) fn writer(&self) -> &Arc<dyn Writer> {
        &self.writer
    }

    pub(crate) fn exec_entry(&self, conf: &JobConfig, node: &NodeRef) -> CacheEntry<EvalOut> {
        match self.exec.entry((conf.clone(), NodeKey(node.clone()))) {
            Entry::Occupied(entry) => CacheEntry::Existing(entry.get().clone()),
            Entry::Vacant(entry) => {
                let (future, promise) = CancellableFuture::promise();
                entry.insert(future.clone());
                CacheEntry::New(promise, future)
            },
        }
    }

    pub(crate) fn write_entry(
        &self,
        conf: &JobConfig,
        descriptor: &WriteDescriptor,
    ) -> CacheEntry<CountersById> {
        match self.writes.entry((conf.clone(), descriptor.clone())) {
            Entry::Occupied(entry) => CacheEntry::Existing(entry.get().clone()),
            Entry::Vacant(entry) => {
                let (future, promise) = CancellableFuture::promise();
                entry.insert(future.clone());
                CacheEntry::New(promise, future)
            },
        }
    }

    /// A fresh memoization scope for `with_new_cache` sub-trees. The write
    /// table and the writer are shared, so a descriptor still submits at
    /// most once per run; only the execution table is isolated.
    pub(crate) fn clean_cache(&self) -> EvalCache {
        Self {
            writer: self.writer.clone(),
            exec: Arc::new(DashMap::new()),
            writes: self.writes.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn exec_entries(&self) -> usize {
        self.exec.len()
    }
}
