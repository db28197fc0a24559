//! The operation planner: a pure function from captured ops to CRDT
//! intents.
//!
//! Map batches collapse to the last op per key. List batches are replayed
//! against the pre-batch items to classify every primitive set as an
//! insert, a replace, or part of a shift cascade:
//!
//! - a tail-first run of sets starting at the current length, whose
//!   non-final ops copy their left neighbor, is an insertion shift and
//!   coalesces to one insert;
//! - a front-first run of sets copying their right neighbor, closed by a
//!   tail delete, is a removal shift and coalesces to one delete;
//! - adjacent inserts and adjacent deletes merge.
//!
//! Detection is best-effort: a run that fails its copy checks falls back to
//! per-op classification, which is less efficient but produces the same
//! final state. The planner never touches the document.

use loro::{ContainerID, LoroText};
use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::capture::{CapturedOp, PendingBatch, PreState};
use crate::convert::scalar_to_loro;
use crate::error::{MirrorError, MirrorResult};
use crate::store::{NodeContent, NodeId, Slot, Store};

/// A value as the applier will produce it: either a scalar, or a fresh
/// container to create at that position.
#[derive(Debug, Clone)]
pub(crate) enum Planned {
    Scalar(loro::LoroValue),
    FreshMap(NodeId),
    FreshList(NodeId),
    FreshText { node: NodeId, text: LoroText },
}

/// One directly executable CRDT operation.
#[derive(Debug, Clone)]
pub(crate) enum Intent {
    MapSet { key: String, value: Planned },
    MapDelete { key: String },
    ListInsert { index: usize, values: Vec<Planned> },
    ListDelete { index: usize, len: usize },
}

/// The planned intents for one container, in application order.
#[derive(Debug)]
pub(crate) struct ContainerPlan {
    pub node: NodeId,
    /// `None` for containers the applier creates within this same commit.
    pub binding: Option<ContainerID>,
    pub intents: SmallVec<[Intent; 4]>,
}

/// Plan all pending batches, in first-op order.
///
/// Fails atomically: any validation or re-parent problem rejects the whole
/// flush and no intents are produced.
pub(crate) fn plan_batches(
    store: &Store,
    batches: Vec<(NodeId, PendingBatch)>,
) -> MirrorResult<Vec<ContainerPlan>> {
    let mut claimed: FxHashSet<NodeId> = FxHashSet::default();
    let mut plans = Vec::with_capacity(batches.len());
    for (node_id, batch) in batches {
        let Some(node) = store.get(node_id) else {
            debug!("dropping batch for a replaced container");
            continue;
        };
        let binding = node.binding.clone();
        if binding.is_none() && !claimed.contains(&node_id) {
            // Created and then overwritten within the same batch; it never
            // reaches the document.
            debug!("dropping batch for an orphaned fresh container");
            continue;
        }
        trace!(ops = ?batch.ops, "planning container batch");
        let intents = match (&node.content, batch.pre) {
            (NodeContent::Map(_), PreState::Map) => {
                plan_map(store, &mut claimed, batch.ops)?
            }
            (NodeContent::List(_), PreState::List { items }) => {
                plan_list(store, &mut claimed, items, batch.ops)?
            }
            _ => {
                return Err(MirrorError::PlannerInvariant(
                    "batch pre-state does not match the node kind".into(),
                ))
            }
        };
        if intents.is_empty() {
            continue;
        }
        plans.push(ContainerPlan {
            node: node_id,
            binding,
            intents,
        });
    }
    Ok(plans)
}

fn plan_map(
    store: &Store,
    claimed: &mut FxHashSet<NodeId>,
    ops: Vec<CapturedOp>,
) -> MirrorResult<SmallVec<[Intent; 4]>> {
    // Last op per key wins, emitted in last-op order.
    let mut surviving: Vec<Option<CapturedOp>> = Vec::with_capacity(ops.len());
    let mut last_pos: rustc_hash::FxHashMap<String, usize> = Default::default();
    for op in ops {
        let key = match &op {
            CapturedOp::MapSet { key, .. } | CapturedOp::MapDelete { key, .. } => key.clone(),
            _ => {
                return Err(MirrorError::PlannerInvariant(
                    "list op captured on a map container".into(),
                ))
            }
        };
        if let Some(&pos) = last_pos.get(&key) {
            surviving[pos] = None;
        }
        last_pos.insert(key, surviving.len());
        surviving.push(Some(op));
    }
    let mut intents = SmallVec::new();
    for op in surviving.into_iter().flatten() {
        match op {
            CapturedOp::MapSet { key, new, old } => {
                trace!(key = %key, replacing = old.is_some(), "map set");
                let value = plan_value(store, claimed, &new)?;
                intents.push(Intent::MapSet { key, value });
            }
            CapturedOp::MapDelete { key, old } => {
                trace!(key = %key, removed = ?old, "map delete");
                intents.push(Intent::MapDelete { key });
            }
            _ => unreachable!("filtered above"),
        }
    }
    Ok(intents)
}

fn plan_list(
    store: &Store,
    claimed: &mut FxHashSet<NodeId>,
    pre_items: Vec<Slot>,
    ops: Vec<CapturedOp>,
) -> MirrorResult<SmallVec<[Intent; 4]>> {
    let mut cur = pre_items;
    let mut intents: SmallVec<[Intent; 4]> = SmallVec::new();
    let mut j = 0;
    while j < ops.len() {
        if let Some((consumed, index, slot)) = match_insert_shift(&ops[j..], &cur) {
            if consumed > 1 {
                trace!(consumed, index, "coalesced an insertion shift");
            }
            let planned = plan_value(store, claimed, &slot)?;
            push_intent(
                &mut intents,
                Intent::ListInsert {
                    index,
                    values: vec![planned],
                },
            );
            cur.insert(index, slot);
            j += consumed;
            continue;
        }
        if let Some((consumed, index)) = match_remove_shift(&ops[j..], &cur) {
            if consumed > 1 {
                trace!(consumed, index, "coalesced a removal shift");
            }
            push_intent(&mut intents, Intent::ListDelete { index, len: 1 });
            cur.remove(index);
            j += consumed;
            continue;
        }
        match &ops[j] {
            CapturedOp::ListSet { index, new, old } => {
                let len = cur.len();
                if *index == len {
                    let planned = plan_value(store, claimed, new)?;
                    push_intent(
                        &mut intents,
                        Intent::ListInsert {
                            index: len,
                            values: vec![planned],
                        },
                    );
                    cur.push(new.clone());
                } else if *index < len {
                    if new == &cur[*index] {
                        // Re-setting the current element; nothing to emit.
                    } else {
                        trace!(index, old = ?old, "replace at position");
                        if matches!(new, Slot::Child(_) | Slot::Lazy(_)) {
                            // A shifted child landing here outside a
                            // recognized cascade would be a move, which is
                            // not detected.
                            warn!(
                                "a set at index {index} re-inserts an existing container; \
                                 moves are not detected"
                            );
                        }
                        let planned = plan_value(store, claimed, new)?;
                        push_intent(&mut intents, Intent::ListDelete { index: *index, len: 1 });
                        push_intent(
                            &mut intents,
                            Intent::ListInsert {
                                index: *index,
                                values: vec![planned],
                            },
                        );
                        cur[*index] = new.clone();
                    }
                } else {
                    return Err(MirrorError::PlannerInvariant(
                        format!("set at index {index} exceeds the list length {len}").into(),
                    ));
                }
            }
            CapturedOp::ListDelete { index, old } => {
                if *index < cur.len() {
                    trace!(index, removed = ?old, "list delete");
                    push_intent(&mut intents, Intent::ListDelete { index: *index, len: 1 });
                    cur.remove(*index);
                } else {
                    return Err(MirrorError::PlannerInvariant(
                        format!(
                            "delete at index {index} exceeds the list length {}",
                            cur.len()
                        )
                        .into(),
                    ));
                }
            }
            _ => {
                return Err(MirrorError::PlannerInvariant(
                    "map op captured on a list container".into(),
                ))
            }
        }
        j += 1;
    }
    Ok(intents)
}

/// Match a tail-first insertion cascade: sets at `len, len-1, ..., i` where
/// every op but the last copies its left neighbor. Returns
/// `(ops consumed, insertion index, inserted slot)`.
///
/// The copy checks make coalescing sound by construction: whenever they
/// hold, one insert at `i` produces the same list as replaying the sets.
fn match_insert_shift(ops: &[CapturedOp], cur: &[Slot]) -> Option<(usize, usize, Slot)> {
    let len = cur.len();
    let mut run = 0;
    while run < ops.len() && run <= len {
        match &ops[run] {
            CapturedOp::ListSet { index, .. } if *index == len - run => run += 1,
            _ => break,
        }
    }
    while run >= 1 {
        let mut matches = true;
        for t in 0..run - 1 {
            let CapturedOp::ListSet { index, new, old } = &ops[t] else {
                unreachable!("run only contains sets");
            };
            if *index == 0 || new != &cur[*index - 1] {
                matches = false;
                break;
            }
            if *index < len && old.as_ref() != Some(&cur[*index]) {
                matches = false;
                break;
            }
        }
        if matches {
            let CapturedOp::ListSet { index, new, .. } = &ops[run - 1] else {
                unreachable!("run only contains sets");
            };
            return Some((run, *index, new.clone()));
        }
        run -= 1;
    }
    None
}

/// Match a front-first removal cascade: sets at `i, i+1, ..., len-2`, each
/// copying its right neighbor, closed by a delete of the tail. A bare tail
/// delete is the degenerate case. Returns `(ops consumed, removal index)`.
fn match_remove_shift(ops: &[CapturedOp], cur: &[Slot]) -> Option<(usize, usize)> {
    let len = cur.len();
    if len == 0 {
        return None;
    }
    let start = match ops.first()? {
        CapturedOp::ListSet { index, .. } => *index,
        CapturedOp::ListDelete { index, old } => {
            if *index == len - 1 && old == &cur[len - 1] {
                return Some((1, len - 1));
            }
            return None;
        }
        _ => return None,
    };
    let mut run = 0;
    while run < ops.len() {
        match &ops[run] {
            CapturedOp::ListSet { index, new, old }
                if *index == start + run
                    && *index + 1 < len
                    && new == &cur[*index + 1]
                    && old.as_ref() == Some(&cur[*index]) =>
            {
                run += 1
            }
            _ => break,
        }
    }
    if run > 0 && start + run == len - 1 {
        if let Some(CapturedOp::ListDelete { index, .. }) = ops.get(run) {
            if *index == len - 1 {
                return Some((run + 1, start));
            }
        }
    }
    None
}

/// Append an intent, merging adjacent inserts and adjacent deletes.
fn push_intent(intents: &mut SmallVec<[Intent; 4]>, intent: Intent) {
    if let Some(last) = intents.last_mut() {
        match (last, &intent) {
            (
                Intent::ListInsert { index: a, values: xs },
                Intent::ListInsert { index: b, values: ys },
            ) => {
                if *b == *a + xs.len() {
                    xs.extend(ys.iter().cloned());
                    return;
                }
                if *b == *a {
                    // The later insert lands in front of the earlier one.
                    let mut merged = ys.clone();
                    merged.append(xs);
                    *xs = merged;
                    return;
                }
            }
            (
                Intent::ListDelete { index: a, len: n },
                Intent::ListDelete { index: b, len: m },
            ) => {
                if *b == *a {
                    *n += *m;
                    return;
                }
                if *b + *m == *a {
                    *a = *b;
                    *n += *m;
                    return;
                }
            }
            _ => {}
        }
    }
    intents.push(intent);
}

/// Resolve an op value into its planned form, enforcing the single-parent
/// rule: an attached container, or a fresh one already claimed in this
/// flush, cannot be placed again.
fn plan_value(
    store: &Store,
    claimed: &mut FxHashSet<NodeId>,
    slot: &Slot,
) -> MirrorResult<Planned> {
    match slot {
        Slot::Value(v) => scalar_to_loro(v).map(Planned::Scalar).ok_or_else(|| {
            MirrorError::PlannerInvariant("composite value recorded as a scalar op".into())
        }),
        Slot::Child(id) => {
            let Some(child) = store.get(*id) else {
                return Err(MirrorError::PlannerInvariant(
                    "op references a purged node".into(),
                ));
            };
            if child.binding.is_some() || claimed.contains(id) {
                let path = store.path_of(*id);
                warn!(path = %path, "rejected an attempt to attach an already-parented container");
                return Err(MirrorError::Reparent { path });
            }
            claimed.insert(*id);
            match &child.content {
                NodeContent::Map(_) => Ok(Planned::FreshMap(*id)),
                NodeContent::List(_) => Ok(Planned::FreshList(*id)),
                NodeContent::Text(t) => Ok(Planned::FreshText {
                    node: *id,
                    text: t.detached_inner(),
                }),
            }
        }
        Slot::Lazy(cid) => Err(MirrorError::Reparent {
            path: cid.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LocalNode;
    use crate::value::Value;
    use loro::LoroValue;

    fn scalar(i: i64) -> Slot {
        Slot::Value(Value::I64(i))
    }

    fn set(index: usize, new: Slot, old: Option<Slot>) -> CapturedOp {
        CapturedOp::ListSet { index, new, old }
    }

    fn del(index: usize, old: Slot) -> CapturedOp {
        CapturedOp::ListDelete { index, old }
    }

    fn plan_list_ops(pre: Vec<Slot>, ops: Vec<CapturedOp>) -> Vec<Intent> {
        let store = Store::default();
        let mut claimed = FxHashSet::default();
        plan_list(&store, &mut claimed, pre, ops)
            .unwrap()
            .into_vec()
    }

    fn assert_insert(intent: &Intent, at: usize, expected: &[i64]) {
        let Intent::ListInsert { index, values } = intent else {
            panic!("expected an insert, got {intent:?}");
        };
        assert_eq!(*index, at);
        let got: Vec<i64> = values
            .iter()
            .map(|p| match p {
                Planned::Scalar(LoroValue::I64(i)) => *i,
                other => panic!("expected scalar, got {other:?}"),
            })
            .collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn map_last_op_wins() {
        let store = Store::default();
        let mut claimed = FxHashSet::default();
        let ops = vec![
            CapturedOp::MapSet {
                key: "a".into(),
                new: scalar(1),
                old: None,
            },
            CapturedOp::MapSet {
                key: "a".into(),
                new: scalar(2),
                old: Some(scalar(1)),
            },
            CapturedOp::MapDelete {
                key: "a".into(),
                old: scalar(2),
            },
        ];
        let intents = plan_map(&store, &mut claimed, ops).unwrap();
        assert_eq!(intents.len(), 1);
        assert!(matches!(&intents[0], Intent::MapDelete { key } if key == "a"));
    }

    #[test]
    fn tail_pushes_coalesce_into_one_insert() {
        // push(1); push(2); push(3) on an empty list
        let intents = plan_list_ops(
            vec![],
            vec![
                set(0, scalar(1), None),
                set(1, scalar(2), None),
                set(2, scalar(3), None),
            ],
        );
        assert_eq!(intents.len(), 1);
        assert_insert(&intents[0], 0, &[1, 2, 3]);
    }

    #[test]
    fn replace_is_a_delete_insert_pair() {
        // xs[1] = 99 on [10, 20, 30]
        let intents = plan_list_ops(
            vec![scalar(10), scalar(20), scalar(30)],
            vec![set(1, scalar(99), Some(scalar(20)))],
        );
        assert_eq!(intents.len(), 2);
        assert!(matches!(
            &intents[0],
            Intent::ListDelete { index: 1, len: 1 }
        ));
        assert_insert(&intents[1], 1, &[99]);
    }

    #[test]
    fn insert_shift_coalesces() {
        // insert(0, 7) on [1, 2]: tail-first copies, then the new head
        let intents = plan_list_ops(
            vec![scalar(1), scalar(2)],
            vec![
                set(2, scalar(2), None),
                set(1, scalar(1), Some(scalar(2))),
                set(0, scalar(7), Some(scalar(1))),
            ],
        );
        assert_eq!(intents.len(), 1);
        assert_insert(&intents[0], 0, &[7]);
    }

    #[test]
    fn unshift_three_coalesces_to_one_insert() {
        // insert(0, a); insert(1, b); insert(2, c) on an empty list
        let intents = plan_list_ops(
            vec![],
            vec![
                set(0, scalar(1), None),
                set(1, scalar(2), None),
                set(2, scalar(3), None),
            ],
        );
        assert_eq!(intents.len(), 1);
        assert_insert(&intents[0], 0, &[1, 2, 3]);
    }

    #[test]
    fn remove_shift_coalesces() {
        // remove(0) on [1, 2, 3]: front-first copies, then a tail delete
        let intents = plan_list_ops(
            vec![scalar(1), scalar(2), scalar(3)],
            vec![
                set(0, scalar(2), Some(scalar(1))),
                set(1, scalar(3), Some(scalar(2))),
                del(2, scalar(3)),
            ],
        );
        assert_eq!(intents.len(), 1);
        assert!(matches!(
            &intents[0],
            Intent::ListDelete { index: 0, len: 1 }
        ));
    }

    #[test]
    fn tail_pops_merge_into_one_delete() {
        let intents = plan_list_ops(
            vec![scalar(1), scalar(2), scalar(3)],
            vec![del(2, scalar(3)), del(1, scalar(2)), del(0, scalar(1))],
        );
        assert_eq!(intents.len(), 1);
        assert!(matches!(
            &intents[0],
            Intent::ListDelete { index: 0, len: 3 }
        ));
    }

    #[test]
    fn coalescing_does_not_cross_a_delete() {
        // push(1); pop(); push(2)
        let intents = plan_list_ops(
            vec![],
            vec![
                set(0, scalar(1), None),
                del(0, scalar(1)),
                set(0, scalar(2), None),
            ],
        );
        assert_eq!(intents.len(), 3);
        assert_insert(&intents[0], 0, &[1]);
        assert!(matches!(
            &intents[1],
            Intent::ListDelete { index: 0, len: 1 }
        ));
        assert_insert(&intents[2], 0, &[2]);
    }

    #[test]
    fn sparse_set_is_rejected() {
        let store = Store::default();
        let mut claimed = FxHashSet::default();
        let err = plan_list(
            &store,
            &mut claimed,
            vec![scalar(1)],
            vec![set(5, scalar(9), None)],
        )
        .unwrap_err();
        assert!(matches!(err, MirrorError::PlannerInvariant(_)));
    }

    #[test]
    fn resetting_the_same_value_emits_nothing() {
        let intents = plan_list_ops(
            vec![scalar(1)],
            vec![set(0, scalar(1), Some(scalar(1)))],
        );
        assert!(intents.is_empty());
    }

    #[test]
    fn double_claim_is_a_reparent() {
        let mut store = Store::default();
        let fresh = store.alloc(LocalNode {
            content: NodeContent::List(vec![]),
            binding: None,
            parent: None,
        });
        let mut claimed = FxHashSet::default();
        let ops = vec![
            CapturedOp::MapSet {
                key: "a".into(),
                new: Slot::Child(fresh),
                old: None,
            },
            CapturedOp::MapSet {
                key: "b".into(),
                new: Slot::Child(fresh),
                old: None,
            },
        ];
        let err = plan_map(&store, &mut claimed, ops).unwrap_err();
        assert!(matches!(err, MirrorError::Reparent { .. }));
    }

    #[test]
    fn orphaned_fresh_batches_are_dropped() {
        let mut store = Store::default();
        let fresh = store.alloc(LocalNode {
            content: NodeContent::List(vec![]),
            binding: None,
            parent: None,
        });
        let batches = vec![(
            fresh,
            PendingBatch {
                pre: PreState::List { items: vec![] },
                ops: vec![set(0, scalar(1), None)],
            },
        )];
        let plans = plan_batches(&store, batches).unwrap();
        assert!(plans.is_empty());
    }

    #[test]
    fn cascade_followed_by_replace_classifies_in_order() {
        // insert(0, 7) on [1, 2], then xs[2] = 9
        let intents = plan_list_ops(
            vec![scalar(1), scalar(2)],
            vec![
                set(2, scalar(2), None),
                set(1, scalar(1), Some(scalar(2))),
                set(0, scalar(7), Some(scalar(1))),
                set(2, scalar(9), Some(scalar(2))),
            ],
        );
        assert_eq!(intents.len(), 3);
        assert_insert(&intents[0], 0, &[7]);
        assert!(matches!(
            &intents[1],
            Intent::ListDelete { index: 2, len: 1 }
        ));
        assert_insert(&intents[2], 2, &[9]);
    }
}
