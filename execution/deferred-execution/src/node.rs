// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! The execution IR: a closed sum of immutable, shareable nodes. Structural
//! equality and hashing are what make the per-run memoization effective, so
//! every node caches a product hash at construction and equality walks the
//! graph memoized by reference pairs.

use crate::{
    config::{JobConfig, UniqueId},
    counters::CountersById,
    error::ExecutionError,
    pipe::{FlowSpec, WriteDescriptor},
    writer::{Mode, Writer},
};
use futures::future::BoxFuture;
use std::{
    any::Any,
    collections::HashSet,
    hash::{Hash, Hasher},
    sync::Arc,
};
use tokio::runtime::Handle;

/// Type-erased value travelling through the interpreter. The typed
/// `Execution<T>` facade downcasts at its boundaries.
pub(crate) type DynVal = Arc<dyn Any + Send + Sync>;

pub(crate) type NodeRef = Arc<ExecNode>;

pub(crate) type ProducerFn =
    Arc<dyn Fn() -> BoxFuture<'static, Result<DynVal, ExecutionError>> + Send + Sync>;
pub(crate) type MapFn = Arc<dyn Fn(DynVal) -> Result<DynVal, ExecutionError> + Send + Sync>;
pub(crate) type FlatMapFn = Arc<dyn Fn(DynVal) -> Result<NodeRef, ExecutionError> + Send + Sync>;
pub(crate) type SideFn = Arc<dyn Fn(&Result<DynVal, ExecutionError>) + Send + Sync>;
pub(crate) type RecoverFn = Arc<dyn Fn(&ExecutionError) -> Option<NodeRef> + Send + Sync>;
pub(crate) type ConfigFn = Arc<dyn Fn(&JobConfig) -> JobConfig + Send + Sync>;
pub(crate) type WithIdFn = Arc<dyn Fn(UniqueId) -> NodeRef + Send + Sync>;
pub(crate) type FlowSpecFn =
    Arc<dyn Fn(&JobConfig, &Mode) -> Result<FlowSpec, ExecutionError> + Send + Sync>;
pub(crate) type PresentFn =
    Arc<dyn Fn(PresentArgs) -> BoxFuture<'static, Result<DynVal, ExecutionError>> + Send + Sync>;

/// Everything a write's result function may consult once the bundled
/// submission has resolved.
#[derive(Clone)]
pub(crate) struct PresentArgs {
    pub conf: JobConfig,
    pub mode: Mode,
    pub writer: Arc<dyn Writer>,
    pub handle: Handle,
}

/// The value produced by evaluating any node.
pub(crate) type EvalOut = (DynVal, CountersById);

pub(crate) struct ExecNode {
    kind: NodeKind,
    hash: u64,
}

impl std::fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let variant = match self {
            NodeKind::FutureConst(_) => "FutureConst",
            NodeKind::FlowSpec(_) => "FlowSpec",
            NodeKind::Mapped { .. } => "Mapped",
            NodeKind::FlatMapped { .. } => "FlatMapped",
            NodeKind::Zipped { .. } => "Zipped",
            NodeKind::OnComplete { .. } => "OnComplete",
            NodeKind::RecoverWith { .. } => "RecoverWith",
            NodeKind::GetCounters { .. } => "GetCounters",
            NodeKind::ResetCounters { .. } => "ResetCounters",
            NodeKind::TransformedConfig { .. } => "TransformedConfig",
            NodeKind::WithNewCache { .. } => "WithNewCache",
            NodeKind::WithId(_) => "WithId",
            NodeKind::Reader => "Reader",
            NodeKind::Write { .. } => "Write",
        };
        f.write_str(variant)
    }
}

pub(crate) enum NodeKind {
    /// Deferred producer run on the caller's executor; never memoized.
    FutureConst(ProducerFn),
    /// A raw planner description submitted through the writer.
    FlowSpec(FlowSpecFn),
    Mapped {
        prev: NodeRef,
        map_fn: MapFn,
    },
    FlatMapped {
        prev: NodeRef,
        flat_map_fn: FlatMapFn,
    },
    /// Parallel composition; the value is an erased `(DynVal, DynVal)` pair.
    Zipped {
        left: NodeRef,
        right: NodeRef,
    },
    OnComplete {
        prev: NodeRef,
        side_fn: SideFn,
    },
    RecoverWith {
        prev: NodeRef,
        recover_fn: RecoverFn,
    },
    /// The value is an erased `(DynVal, Counters)` pair.
    GetCounters {
        prev: NodeRef,
    },
    ResetCounters {
        prev: NodeRef,
    },
    TransformedConfig {
        prev: NodeRef,
        config_fn: ConfigFn,
    },
    WithNewCache {
        prev: NodeRef,
    },
    WithId(WithIdFn),
    /// Yields `(config, mode)`.
    Reader,
    Write {
        head: WriteDescriptor,
        tail: Vec<WriteDescriptor>,
        present: PresentFn,
    },
}

impl ExecNode {
    pub(crate) fn new(kind: NodeKind) -> NodeRef {
        let hash = hash_kind(&kind);
        Arc::new(Self { kind, hash })
    }

    pub(crate) fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub(crate) fn structural_hash(&self) -> u64 {
        self.hash
    }

    /// Direct sub-executions, for traversals that rewrite or compare.
    pub(crate) fn children(&self) -> Vec<NodeRef> {
        match &self.kind {
            NodeKind::Mapped { prev, .. }
            | NodeKind::FlatMapped { prev, .. }
            | NodeKind::OnComplete { prev, .. }
            | NodeKind::RecoverWith { prev, .. }
            | NodeKind::GetCounters { prev }
            | NodeKind::ResetCounters { prev }
            | NodeKind::TransformedConfig { prev, .. }
            | NodeKind::WithNewCache { prev } => vec![prev.clone()],
            NodeKind::Zipped { left, right } => vec![left.clone(), right.clone()],
            NodeKind::FutureConst(_)
            | NodeKind::FlowSpec(_)
            | NodeKind::WithId(_)
            | NodeKind::Reader
            | NodeKind::Write { .. } => Vec::new(),
        }
    }

    fn kind_name(&self) -> &'static str {
        match &self.kind {
            NodeKind::FutureConst(_) => "FutureConst",
            NodeKind::FlowSpec(_) => "FlowSpec",
            NodeKind::Mapped { .. } => "Mapped",
            NodeKind::FlatMapped { .. } => "FlatMapped",
            NodeKind::Zipped { .. } => "Zipped",
            NodeKind::OnComplete { .. } => "OnComplete",
            NodeKind::RecoverWith { .. } => "RecoverWith",
            NodeKind::GetCounters { .. } => "GetCounters",
            NodeKind::ResetCounters { .. } => "ResetCounters",
            NodeKind::TransformedConfig { .. } => "TransformedConfig",
            NodeKind::WithNewCache { .. } => "WithNewCache",
            NodeKind::WithId(_) => "WithId",
            NodeKind::Reader => "Reader",
            NodeKind::Write { .. } => "Write",
        }
    }
}

impl std::fmt::Debug for ExecNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(self.kind_name())
            .field("hash", &self.hash)
            .field(
                "children",
                &self.children().iter().map(|c| c.kind_name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Address of a closure's captured state. Function positions compare by
/// value identity: clones of one `Arc` are equal, separately constructed
/// closures are not, even when textually identical.
fn fn_addr<T: ?Sized>(f: &Arc<T>) -> usize {
    Arc::as_ptr(f).cast::<()>() as usize
}

fn hash_kind(kind: &NodeKind) -> u64 {
    let mut state = std::collections::hash_map::DefaultHasher::new();
    std::mem::discriminant(kind).hash(&mut state);
    match kind {
        NodeKind::FutureConst(producer) => fn_addr(producer).hash(&mut state),
        NodeKind::FlowSpec(spec_fn) => fn_addr(spec_fn).hash(&mut state),
        NodeKind::Mapped { prev, map_fn } => {
            state.write_u64(prev.hash);
            fn_addr(map_fn).hash(&mut state);
        },
        NodeKind::FlatMapped { prev, flat_map_fn } => {
            state.write_u64(prev.hash);
            fn_addr(flat_map_fn).hash(&mut state);
        },
        NodeKind::Zipped { left, right } => {
            state.write_u64(left.hash);
            state.write_u64(right.hash);
        },
        NodeKind::OnComplete { prev, side_fn } => {
            state.write_u64(prev.hash);
            fn_addr(side_fn).hash(&mut state);
        },
        NodeKind::RecoverWith { prev, recover_fn } => {
            state.write_u64(prev.hash);
            fn_addr(recover_fn).hash(&mut state);
        },
        NodeKind::GetCounters { prev } => state.write_u64(prev.hash),
        NodeKind::ResetCounters { prev } => state.write_u64(prev.hash),
        NodeKind::TransformedConfig { prev, config_fn } => {
            state.write_u64(prev.hash);
            fn_addr(config_fn).hash(&mut state);
        },
        NodeKind::WithNewCache { prev } => state.write_u64(prev.hash),
        NodeKind::WithId(id_fn) => fn_addr(id_fn).hash(&mut state),
        NodeKind::Reader => {},
        NodeKind::Write {
            head,
            tail,
            present,
        } => {
            head.hash(&mut state);
            tail.hash(&mut state);
            fn_addr(present).hash(&mut state);
        },
    }
    state.finish()
}

/// Structural equality with sharing: identical references short-circuit,
/// mismatched cached hashes fail fast, and revisited reference pairs are
/// assumed equal (sound because the graph is acyclic — a pair can only be
/// revisited through a shared sub-graph whose first comparison succeeded).
pub(crate) fn structurally_eq(a: &NodeRef, b: &NodeRef) -> bool {
    let mut assumed = HashSet::new();
    eq_rec(a, b, &mut assumed)
}

fn eq_rec(a: &NodeRef, b: &NodeRef, assumed: &mut HashSet<(usize, usize)>) -> bool {
    if Arc::ptr_eq(a, b) {
        return true;
    }
    if a.hash != b.hash {
        return false;
    }
    if !assumed.insert((Arc::as_ptr(a) as usize, Arc::as_ptr(b) as usize)) {
        return true;
    }
    match (&a.kind, &b.kind) {
        (NodeKind::FutureConst(fa), NodeKind::FutureConst(fb)) => fn_addr(fa) == fn_addr(fb),
        (NodeKind::FlowSpec(fa), NodeKind::FlowSpec(fb)) => fn_addr(fa) == fn_addr(fb),
        (
            NodeKind::Mapped { prev: pa, map_fn: fa },
            NodeKind::Mapped { prev: pb, map_fn: fb },
        ) => fn_addr(fa) == fn_addr(fb) && eq_rec(pa, pb, assumed),
        (
            NodeKind::FlatMapped {
                prev: pa,
                flat_map_fn: fa,
            },
            NodeKind::FlatMapped {
                prev: pb,
                flat_map_fn: fb,
            },
        ) => fn_addr(fa) == fn_addr(fb) && eq_rec(pa, pb, assumed),
        (
            NodeKind::Zipped {
                left: la,
                right: ra,
            },
            NodeKind::Zipped {
                left: lb,
                right: rb,
            },
        ) => eq_rec(la, lb, assumed) && eq_rec(ra, rb, assumed),
        (
            NodeKind::OnComplete {
                prev: pa,
                side_fn: fa,
            },
            NodeKind::OnComplete {
                prev: pb,
                side_fn: fb,
            },
        ) => fn_addr(fa) == fn_addr(fb) && eq_rec(pa, pb, assumed),
        (
            NodeKind::RecoverWith {
                prev: pa,
                recover_fn: fa,
            },
            NodeKind::RecoverWith {
                prev: pb,
                recover_fn: fb,
            },
        ) => fn_addr(fa) == fn_addr(fb) && eq_rec(pa, pb, assumed),
        (NodeKind::GetCounters { prev: pa }, NodeKind::GetCounters { prev: pb }) => {
            eq_rec(pa, pb, assumed)
        },
        (NodeKind::ResetCounters { prev: pa }, NodeKind::ResetCounters { prev: pb }) => {
            eq_rec(pa, pb, assumed)
        },
        (
            NodeKind::TransformedConfig {
                prev: pa,
                config_fn: fa,
            },
            NodeKind::TransformedConfig {
                prev: pb,
                config_fn: fb,
            },
        ) => fn_addr(fa) == fn_addr(fb) && eq_rec(pa, pb, assumed),
        (NodeKind::WithNewCache { prev: pa }, NodeKind::WithNewCache { prev: pb }) => {
            eq_rec(pa, pb, assumed)
        },
        (NodeKind::WithId(fa), NodeKind::WithId(fb)) => fn_addr(fa) == fn_addr(fb),
        (NodeKind::Reader, NodeKind::Reader) => true,
        (
            NodeKind::Write {
                head: ha,
                tail: ta,
                present: fa,
            },
            NodeKind::Write {
                head: hb,
                tail: tb,
                present: fb,
            },
        ) => ha == hb && ta == tb && fn_addr(fa) == fn_addr(fb),
        _ => false,
    }
}

/// A node as a hash-map key: hashes by the cached structural hash and
/// compares structurally.
#[derive(Clone, Debug)]
pub(crate) struct NodeKey(pub NodeRef);

impl PartialEq for NodeKey {
    fn eq(&self, other: &Self) -> bool {
        structurally_eq(&self.0, &other.0)
    }
}

impl Eq for NodeKey {}

impl Hash for NodeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.0.hash);
    }
}
