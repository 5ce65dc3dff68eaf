// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use aptos_cancellable_futures::Aborted;
use std::sync::Arc;
use thiserror::Error;

/// Failures that can surface from a deferred execution. Results travel
/// through shared futures, so the error is cheaply cloneable.
#[derive(Clone, Debug, Error)]
pub enum ExecutionError {
    /// The distinguished cancellation signal raised when a flow is stopped.
    /// Recovery handlers never observe this variant.
    #[error("flow stopped: {reason}")]
    FlowStopped { reason: String },

    /// A `filter` predicate rejected the value.
    #[error("Filter failed on: {value}")]
    FilterFailed { value: String },

    /// A raw flow spec was submitted against a writer that cannot plan one.
    #[error("writer does not support flow spec submission")]
    FlowSpecUnsupported,

    /// A failure thrown by user code.
    #[error("{0}")]
    User(Arc<anyhow::Error>),

    /// An execution task died before producing a result (panic, runtime
    /// shutdown, or an abandoned promise).
    #[error("execution aborted: {0}")]
    Aborted(String),
}

impl ExecutionError {
    pub fn user(error: impl Into<anyhow::Error>) -> Self {
        Self::User(Arc::new(error.into()))
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self::user(anyhow::anyhow!(message.into()))
    }

    pub fn flow_stopped(reason: impl Into<String>) -> Self {
        Self::FlowStopped {
            reason: reason.into(),
        }
    }

    /// True for the cancellation signal that bypasses `recover_with`.
    pub fn is_flow_stop(&self) -> bool {
        matches!(self, Self::FlowStopped { .. })
    }

    /// Returns a summary label for the error
    pub fn get_label(&self) -> &'static str {
        match self {
            Self::FlowStopped { .. } => "flow_stopped",
            Self::FilterFailed { .. } => "filter_failed",
            Self::FlowSpecUnsupported => "flow_spec_unsupported",
            Self::User(_) => "user",
            Self::Aborted(_) => "aborted",
        }
    }
}

impl From<anyhow::Error> for ExecutionError {
    fn from(error: anyhow::Error) -> Self {
        Self::User(Arc::new(error))
    }
}

impl From<Aborted> for ExecutionError {
    fn from(aborted: Aborted) -> Self {
        Self::Aborted(aborted.to_string())
    }
}
