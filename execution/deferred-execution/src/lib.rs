// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

//! Deferred, de-duplicating execution engine for batch data flows.
//!
//! Applications describe a pipeline as a DAG of [`Execution`] values —
//! maps, dependent continuations, parallel zips, recoveries, counter and
//! config transforms, and write leaves over opaque planner tokens. A
//! [`run`](Execution::run) then optimizes the graph, de-duplicates
//! structurally equal sub-graphs against a per-run cache, bundles adjacent
//! writes into single planner submissions through a [`Writer`], accumulates
//! counters across the evaluation, and on failure drives best-effort
//! cooperative cancellation before releasing the writer.

mod cache;
mod evaluator;
mod node;
mod optimize;

pub mod config;
pub mod counters;
pub mod error;
pub mod execution;
pub mod pipe;
pub mod writer;

pub use aptos_cancellable_futures::{CancellableFuture, CancellationHandler};
pub use config::{CachedFile, JobConfig, UniqueId};
pub use counters::{Counters, CountersById, StatKey, SubmissionId};
pub use error::ExecutionError;
pub use execution::{zip3, zip4, Execution};
pub use pipe::{FlowSpec, Pipe, Sink, WriteDescriptor};
pub use writer::{
    FlowPlanner, FlowWriter, Mode, ModeKind, Record, RecordBatch, SubmissionFuture, Writer,
};

#[cfg(test)]
mod tests;
