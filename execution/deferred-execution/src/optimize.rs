// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Pre-evaluation rewrite rules over the IR. The write-oriented rules are
//! load-bearing for planner efficiency: merging adjacent writes lets the
//! planner optimize across the whole bundle, so the `zip`/`map` combinators
//! apply them even when the config disables the general pass.

use crate::node::{DynVal, ExecNode, MapFn, NodeKind, NodeRef, PresentFn};
use futures::FutureExt;
use std::{collections::HashMap, sync::Arc};

/// Maps over a node. Inlines into a write's result function where possible,
/// otherwise wraps a `Mapped` node.
pub(crate) fn map_node(prev: &NodeRef, map_fn: &MapFn) -> NodeRef {
    match prev.kind() {
        NodeKind::Write {
            head,
            tail,
            present,
        } => ExecNode::new(NodeKind::Write {
            head: head.clone(),
            tail: tail.clone(),
            present: compose_present(present, map_fn),
        }),
        _ => ExecNode::new(NodeKind::Mapped {
            prev: prev.clone(),
            map_fn: map_fn.clone(),
        }),
    }
}

/// Zips two nodes. Two writes merge into a single write whose descriptor
/// list concatenates both sides; anything else becomes a `Zipped` node.
/// Either way the value is an erased pair.
pub(crate) fn zip_nodes(left: &NodeRef, right: &NodeRef) -> NodeRef {
    match (left.kind(), right.kind()) {
        (
            NodeKind::Write {
                head: left_head,
                tail: left_tail,
                present: left_present,
            },
            NodeKind::Write {
                head: right_head,
                tail: right_tail,
                present: right_present,
            },
        ) => {
            let mut tail = left_tail.clone();
            tail.push(right_head.clone());
            tail.extend(right_tail.iter().cloned());
            ExecNode::new(NodeKind::Write {
                head: left_head.clone(),
                tail,
                present: pair_presents(left_present, right_present),
            })
        },
        _ => ExecNode::new(NodeKind::Zipped {
            left: left.clone(),
            right: right.clone(),
        }),
    }
}

/// Rewrites the graph bottom-up: fuses `Mapped` chains, inlines maps into
/// writes, and merges writes joined by a zip. Sharing is preserved — a
/// sub-graph reached twice is rewritten once — and untouched nodes keep
/// their identity so memoization still de-duplicates them.
pub(crate) fn optimize(root: &NodeRef) -> NodeRef {
    let mut rewritten: HashMap<usize, NodeRef> = HashMap::new();
    let mut stack = vec![root.clone()];
    while let Some(node) = stack.pop() {
        let addr = Arc::as_ptr(&node) as usize;
        if rewritten.contains_key(&addr) {
            continue;
        }
        let pending: Vec<NodeRef> = node
            .children()
            .into_iter()
            .filter(|child| !rewritten.contains_key(&(Arc::as_ptr(child) as usize)))
            .collect();
        if pending.is_empty() {
            let result = apply_rules(rebuild(&node, &rewritten));
            rewritten.insert(addr, result);
        } else {
            stack.push(node);
            stack.extend(pending);
        }
    }
    rewritten
        .remove(&(Arc::as_ptr(root) as usize))
        .expect("the root is rewritten last")
}

/// Replaces a node's children with their rewritten forms, keeping the
/// original node when nothing underneath changed.
fn rebuild(node: &NodeRef, rewritten: &HashMap<usize, NodeRef>) -> NodeRef {
    let resolved = |child: &NodeRef| -> NodeRef {
        rewritten[&(Arc::as_ptr(child) as usize)].clone()
    };
    match node.kind() {
        NodeKind::Mapped { prev, map_fn } => {
            let new_prev = resolved(prev);
            if Arc::ptr_eq(&new_prev, prev) {
                node.clone()
            } else {
                ExecNode::new(NodeKind::Mapped {
                    prev: new_prev,
                    map_fn: map_fn.clone(),
                })
            }
        },
        NodeKind::FlatMapped { prev, flat_map_fn } => {
            let new_prev = resolved(prev);
            if Arc::ptr_eq(&new_prev, prev) {
                node.clone()
            } else {
                ExecNode::new(NodeKind::FlatMapped {
                    prev: new_prev,
                    flat_map_fn: flat_map_fn.clone(),
                })
            }
        },
        NodeKind::Zipped { left, right } => {
            let new_left = resolved(left);
            let new_right = resolved(right);
            if Arc::ptr_eq(&new_left, left) && Arc::ptr_eq(&new_right, right) {
                node.clone()
            } else {
                ExecNode::new(NodeKind::Zipped {
                    left: new_left,
                    right: new_right,
                })
            }
        },
        NodeKind::OnComplete { prev, side_fn } => {
            let new_prev = resolved(prev);
            if Arc::ptr_eq(&new_prev, prev) {
                node.clone()
            } else {
                ExecNode::new(NodeKind::OnComplete {
                    prev: new_prev,
                    side_fn: side_fn.clone(),
                })
            }
        },
        NodeKind::RecoverWith { prev, recover_fn } => {
            let new_prev = resolved(prev);
            if Arc::ptr_eq(&new_prev, prev) {
                node.clone()
            } else {
                ExecNode::new(NodeKind::RecoverWith {
                    prev: new_prev,
                    recover_fn: recover_fn.clone(),
                })
            }
        },
        NodeKind::GetCounters { prev } => {
            let new_prev = resolved(prev);
            if Arc::ptr_eq(&new_prev, prev) {
                node.clone()
            } else {
                ExecNode::new(NodeKind::GetCounters { prev: new_prev })
            }
        },
        NodeKind::ResetCounters { prev } => {
            let new_prev = resolved(prev);
            if Arc::ptr_eq(&new_prev, prev) {
                node.clone()
            } else {
                ExecNode::new(NodeKind::ResetCounters { prev: new_prev })
            }
        },
        NodeKind::TransformedConfig { prev, config_fn } => {
            let new_prev = resolved(prev);
            if Arc::ptr_eq(&new_prev, prev) {
                node.clone()
            } else {
                ExecNode::new(NodeKind::TransformedConfig {
                    prev: new_prev,
                    config_fn: config_fn.clone(),
                })
            }
        },
        NodeKind::WithNewCache { prev } => {
            let new_prev = resolved(prev);
            if Arc::ptr_eq(&new_prev, prev) {
                node.clone()
            } else {
                ExecNode::new(NodeKind::WithNewCache { prev: new_prev })
            }
        },
        NodeKind::FutureConst(_)
        | NodeKind::FlowSpec(_)
        | NodeKind::WithId(_)
        | NodeKind::Reader
        | NodeKind::Write { .. } => node.clone(),
    }
}

/// Applies the local rules until the node is stable.
fn apply_rules(mut node: NodeRef) -> NodeRef {
    loop {
        let next = match node.kind() {
            NodeKind::Mapped { prev, map_fn } => match prev.kind() {
                NodeKind::Mapped {
                    prev: inner,
                    map_fn: first,
                } => Some(ExecNode::new(NodeKind::Mapped {
                    prev: inner.clone(),
                    map_fn: compose_maps(first, map_fn),
                })),
                NodeKind::Write { .. } => Some(map_node(prev, map_fn)),
                _ => None,
            },
            NodeKind::Zipped { left, right }
                if matches!(
                    (left.kind(), right.kind()),
                    (NodeKind::Write { .. }, NodeKind::Write { .. })
                ) =>
            {
                Some(zip_nodes(left, right))
            },
            _ => None,
        };
        match next {
            Some(rewritten) => node = rewritten,
            None => return node,
        }
    }
}

fn compose_maps(first: &MapFn, second: &MapFn) -> MapFn {
    let first = first.clone();
    let second = second.clone();
    Arc::new(move |value| second(first(value)?))
}

fn compose_present(present: &PresentFn, map_fn: &MapFn) -> PresentFn {
    let present = present.clone();
    let map_fn = map_fn.clone();
    Arc::new(move |args| {
        let pending = present(args);
        let map_fn = map_fn.clone();
        async move { map_fn(pending.await?) }.boxed()
    })
}

fn pair_presents(left: &PresentFn, right: &PresentFn) -> PresentFn {
    let left = left.clone();
    let right = right.clone();
    Arc::new(move |args| {
        let left_pending = left(args.clone());
        let right_pending = right(args);
        async move {
            let (left_value, right_value) =
                futures::future::try_join(left_pending, right_pending).await?;
            Ok(Arc::new((left_value, right_value)) as DynVal)
        }
        .boxed()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        execution::Execution,
        pipe::{Pipe, Sink},
    };

    fn write_node(label: &str) -> NodeRef {
        Execution::write(Pipe::new(label), Sink::new("warehouse"))
            .node()
            .clone()
    }

    #[test]
    fn mapped_chains_fuse_to_one_node() {
        let chained = Execution::from_value(1).map(|v| v + 1).map(|v| v * 2);
        let optimized = optimize(chained.node());

        match optimized.kind() {
            NodeKind::Mapped { prev, .. } => {
                assert!(matches!(prev.kind(), NodeKind::FutureConst(_)))
            },
            other => panic!("expected a fused map, got {:?}", other),
        }
    }

    #[test]
    fn zipped_writes_merge_with_concatenated_descriptors() {
        let zipped = ExecNode::new(NodeKind::Zipped {
            left: write_node("a"),
            right: write_node("b"),
        });
        let optimized = optimize(&zipped);

        match optimized.kind() {
            NodeKind::Write { head, tail, .. } => {
                assert_eq!(head.pipe().label(), "a");
                assert_eq!(tail.len(), 1);
                assert_eq!(tail[0].pipe().label(), "b");
            },
            other => panic!("expected a merged write, got {:?}", other),
        }
    }

    #[test]
    fn maps_inline_into_writes_at_construction() {
        let mapped = Execution::write(Pipe::new("a"), Sink::new("warehouse")).map(|_| 1);
        assert!(matches!(mapped.node().kind(), NodeKind::Write { .. }));
    }

    #[test]
    fn untouched_graphs_keep_their_identity() {
        let execution = Execution::from_value(1).flat_map(Execution::from_value);
        let optimized = optimize(execution.node());
        assert!(Arc::ptr_eq(&optimized, execution.node()));
    }

    #[test]
    fn shared_subgraphs_rewrite_once() {
        let chain = Execution::from_value(1).map(|v| v + 1).map(|v| v * 2);
        let zipped = ExecNode::new(NodeKind::Zipped {
            left: chain.node().clone(),
            right: chain.node().clone(),
        });

        let optimized = optimize(&zipped);
        match optimized.kind() {
            NodeKind::Zipped { left, right } => {
                assert!(Arc::ptr_eq(left, right), "sharing must be preserved")
            },
            other => panic!("expected a zip, got {:?}", other),
        }
    }
}

