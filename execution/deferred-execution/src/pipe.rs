// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Opaque planner tokens. The engine never inspects a pipe, sink or flow
//! spec; it only threads them through to the writer. Identity (and thereby
//! write de-duplication) is by token instance, not by label.

use std::{
    hash::{Hash, Hasher},
    sync::Arc,
};

macro_rules! planner_token {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone)]
        pub struct $name {
            inner: Arc<String>,
        }

        impl $name {
            pub fn new(label: impl Into<String>) -> Self {
                Self {
                    inner: Arc::new(label.into()),
                }
            }

            pub fn label(&self) -> &str {
                &self.inner
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                Arc::ptr_eq(&self.inner, &other.inner)
            }
        }

        impl Eq for $name {}

        impl Hash for $name {
            fn hash<H: Hasher>(&self, state: &mut H) {
                (Arc::as_ptr(&self.inner) as usize).hash(state);
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_tuple(stringify!($name)).field(&self.label()).finish()
            }
        }
    };
}

planner_token!(
    /// A pipeline of records, as described to the planner.
    Pipe
);
planner_token!(
    /// A materialization target for a pipe.
    Sink
);
planner_token!(
    /// A raw planner flow description, submitted as-is.
    FlowSpec
);

/// One desired materialization of a pipe, the unit of write coalescing.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum WriteDescriptor {
    /// Materialize the pipe so later stages can reuse it.
    Force { pipe: Pipe },
    /// Materialize the pipe and read it back as client-side records.
    ToIterable { pipe: Pipe },
    /// Write the pipe into a sink.
    Simple { pipe: Pipe, sink: Sink },
}

impl WriteDescriptor {
    pub fn pipe(&self) -> &Pipe {
        match self {
            Self::Force { pipe } => pipe,
            Self::ToIterable { pipe } => pipe,
            Self::Simple { pipe, .. } => pipe,
        }
    }
}
