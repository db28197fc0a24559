//! Local-op capture: every mutation through a proxy lands here.
//!
//! A mutating call validates its value, records a granular op into the
//! pending batch of the touched node, then applies the mutation to the
//! local arena. Nothing reaches the document until
//! [`Mirror::commit`](crate::Mirror::commit) plans and applies the batch.
//!
//! List mutations are decomposed into primitive set/delete ops with the
//! shift semantics of a plain dense array (an insert records the tail-first
//! copy cascade, a removal the front-first one). The planner recognizes
//! these cascades and coalesces them back into single CRDT inserts and
//! deletes.

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::error::{MirrorError, MirrorResult};
use crate::store::{LocalNode, NodeContent, NodeId, Slot};
use crate::value::{format_path, PathSeg, Value};
use crate::MirrorInner;

/// A granular local op, in arrival order within its batch.
#[derive(Debug, Clone)]
pub(crate) enum CapturedOp {
    MapSet {
        key: String,
        new: Slot,
        old: Option<Slot>,
    },
    MapDelete {
        key: String,
        old: Slot,
    },
    ListSet {
        index: usize,
        new: Slot,
        old: Option<Slot>,
    },
    ListDelete {
        index: usize,
        old: Slot,
    },
}

/// The touched node's state at the moment its batch opened.
#[derive(Debug)]
pub(crate) enum PreState {
    Map,
    /// Pre-batch items, cloned before the first op mutated the node. The
    /// planner replays ops against this to classify them.
    List { items: Vec<Slot> },
}

#[derive(Debug)]
pub(crate) struct PendingBatch {
    pub pre: PreState,
    pub ops: Vec<CapturedOp>,
}

/// All pending batches, ordered by each node's first captured op. That
/// order is also the cross-container application order at commit time.
#[derive(Debug, Default)]
pub(crate) struct Batches {
    by_node: FxHashMap<NodeId, PendingBatch>,
    order: Vec<NodeId>,
}

impl Batches {
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.by_node.contains_key(&node)
    }

    pub fn ensure(&mut self, node: NodeId, pre: impl FnOnce() -> PreState) -> &mut PendingBatch {
        self.by_node.entry(node).or_insert_with(|| {
            self.order.push(node);
            PendingBatch {
                pre: pre(),
                ops: Vec::new(),
            }
        })
    }

    /// Drain all batches in first-op order.
    pub fn take(&mut self) -> Vec<(NodeId, PendingBatch)> {
        let order = std::mem::take(&mut self.order);
        let mut by_node = std::mem::take(&mut self.by_node);
        order
            .into_iter()
            .filter_map(|id| by_node.remove(&id).map(|b| (id, b)))
            .collect()
    }
}

/// The per-commit lifecycle of the pending batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BatchStage {
    Collecting,
    Planning,
    Applying,
    Done,
    Error,
}

/// Returns true when the write must be dropped (soft lifecycle failure).
fn write_blocked(inner: &MirrorInner, node: NodeId) -> bool {
    if inner.disposed {
        warn!("write after dispose was dropped");
        return true;
    }
    if !inner.store.contains(node) {
        warn!("write through a stale handle was dropped; its container was replaced");
        return true;
    }
    false
}

/// Rewrite a relative validation/re-parent path into an absolute one.
fn absolutize(inner: &MirrorInner, node: NodeId, err: MirrorError) -> MirrorError {
    let base = inner.store.path_of(node);
    match err {
        MirrorError::Validation { path, reason } => MirrorError::Validation {
            path: format!("{base}{path}"),
            reason,
        },
        MirrorError::Reparent { path } => MirrorError::Reparent {
            path: format!("{base}{path}"),
        },
        other => other,
    }
}

pub(crate) fn map_insert(
    inner: &mut MirrorInner,
    node: NodeId,
    key: &str,
    value: Value,
) -> MirrorResult<()> {
    if write_blocked(inner, node) {
        return Ok(());
    }
    let existing = match &inner.store.get(node).expect("checked").content {
        NodeContent::Map(entries) => entries.get(key).cloned(),
        _ => return Err(MirrorError::PlannerInvariant("map op on non-map node".into())),
    };
    if let Some(old) = &existing {
        if slot_matches_value(inner, old, &value) {
            return Ok(());
        }
    }
    let suppressed = inner.suppress > 0;
    if suppressed {
        debug!(key, "suppressed map write is not captured");
    } else {
        inner.batches.ensure(node, || PreState::Map);
    }
    let mut segs = vec![PathSeg::Key(key.to_string())];
    let slot = intern_value(inner, node, &value, suppressed, &mut segs)
        .map_err(|e| absolutize(inner, node, e))?;
    if !suppressed {
        inner
            .batches
            .ensure(node, || PreState::Map)
            .ops
            .push(CapturedOp::MapSet {
                key: key.to_string(),
                new: slot.clone(),
                old: existing.clone(),
            });
    }
    purge_replaced(inner, existing.as_ref());
    if let Some(n) = inner.store.get_mut(node) {
        if let NodeContent::Map(entries) = &mut n.content {
            entries.insert(key.to_string(), slot);
        }
    }
    Ok(())
}

pub(crate) fn map_delete(inner: &mut MirrorInner, node: NodeId, key: &str) -> MirrorResult<()> {
    if write_blocked(inner, node) {
        return Ok(());
    }
    let existing = match &inner.store.get(node).expect("checked").content {
        NodeContent::Map(entries) => entries.get(key).cloned(),
        _ => return Err(MirrorError::PlannerInvariant("map op on non-map node".into())),
    };
    let Some(old) = existing else {
        return Ok(());
    };
    if inner.suppress == 0 {
        inner
            .batches
            .ensure(node, || PreState::Map)
            .ops
            .push(CapturedOp::MapDelete {
                key: key.to_string(),
                old: old.clone(),
            });
    }
    purge_replaced(inner, Some(&old));
    if let Some(n) = inner.store.get_mut(node) {
        if let NodeContent::Map(entries) = &mut n.content {
            entries.remove(key);
        }
    }
    Ok(())
}

pub(crate) fn map_clear(inner: &mut MirrorInner, node: NodeId) -> MirrorResult<()> {
    if write_blocked(inner, node) {
        return Ok(());
    }
    let keys: Vec<String> = match &inner.store.get(node).expect("checked").content {
        NodeContent::Map(entries) => entries.keys().cloned().collect(),
        _ => return Err(MirrorError::PlannerInvariant("map op on non-map node".into())),
    };
    for key in keys {
        map_delete(inner, node, &key)?;
    }
    Ok(())
}

pub(crate) fn list_set(
    inner: &mut MirrorInner,
    node: NodeId,
    index: usize,
    value: Value,
) -> MirrorResult<()> {
    if write_blocked(inner, node) {
        return Ok(());
    }
    let (len, existing) = match &inner.store.get(node).expect("checked").content {
        NodeContent::List(items) => (items.len(), items.get(index).cloned()),
        _ => {
            return Err(MirrorError::PlannerInvariant(
                "list op on non-list node".into(),
            ))
        }
    };
    if index > len {
        return Err(MirrorError::OutOfBound { pos: index, len });
    }
    if let Some(old) = &existing {
        if slot_matches_value(inner, old, &value) {
            return Ok(());
        }
    }
    let suppressed = inner.suppress > 0;
    if !suppressed {
        ensure_list_batch(inner, node);
    }
    let mut segs = vec![PathSeg::Index(index)];
    let slot = intern_value(inner, node, &value, suppressed, &mut segs)
        .map_err(|e| absolutize(inner, node, e))?;
    if !suppressed {
        inner
            .batches
            .ensure(node, || unreachable!("batch ensured above"))
            .ops
            .push(CapturedOp::ListSet {
                index,
                new: slot.clone(),
                old: existing.clone(),
            });
    }
    purge_replaced(inner, existing.as_ref());
    if let Some(n) = inner.store.get_mut(node) {
        if let NodeContent::List(items) = &mut n.content {
            if index == items.len() {
                items.push(slot);
            } else {
                items[index] = slot;
            }
        }
    }
    Ok(())
}

pub(crate) fn list_push(inner: &mut MirrorInner, node: NodeId, value: Value) -> MirrorResult<()> {
    if write_blocked(inner, node) {
        return Ok(());
    }
    let len = list_len(inner, node)?;
    list_set(inner, node, len, value)
}

pub(crate) fn list_insert(
    inner: &mut MirrorInner,
    node: NodeId,
    index: usize,
    value: Value,
) -> MirrorResult<()> {
    if write_blocked(inner, node) {
        return Ok(());
    }
    let len = list_len(inner, node)?;
    if index > len {
        return Err(MirrorError::OutOfBound { pos: index, len });
    }
    if index == len {
        return list_set(inner, node, index, value);
    }
    let suppressed = inner.suppress > 0;
    if !suppressed {
        ensure_list_batch(inner, node);
    }
    // Validate and intern before recording any shift op, so a rejected
    // value leaves the node untouched.
    let mut segs = vec![PathSeg::Index(index)];
    let slot = intern_value(inner, node, &value, suppressed, &mut segs)
        .map_err(|e| absolutize(inner, node, e))?;

    let mut work = list_items_clone(inner, node)?;
    let mut ops = Vec::with_capacity(len - index + 1);
    // Tail-first copies shift the suffix right by one.
    for k in (index..len).rev() {
        let src = work[k].clone();
        let old = work.get(k + 1).cloned();
        ops.push(CapturedOp::ListSet {
            index: k + 1,
            new: src.clone(),
            old,
        });
        if k + 1 == work.len() {
            work.push(src);
        } else {
            work[k + 1] = src;
        }
    }
    ops.push(CapturedOp::ListSet {
        index,
        new: slot.clone(),
        old: Some(work[index].clone()),
    });
    work[index] = slot;
    finish_list_write(inner, node, suppressed, ops, work);
    Ok(())
}

pub(crate) fn list_delete(
    inner: &mut MirrorInner,
    node: NodeId,
    index: usize,
    len_to_del: usize,
) -> MirrorResult<()> {
    if write_blocked(inner, node) {
        return Ok(());
    }
    let len = list_len(inner, node)?;
    if index + len_to_del > len {
        return Err(MirrorError::OutOfBound {
            pos: index + len_to_del,
            len,
        });
    }
    if len_to_del == 0 {
        return Ok(());
    }
    let suppressed = inner.suppress > 0;
    if !suppressed {
        ensure_list_batch(inner, node);
    }
    let mut work = list_items_clone(inner, node)?;
    let mut ops = Vec::new();
    let mut removed = Vec::with_capacity(len_to_del);
    for _ in 0..len_to_del {
        let n = work.len();
        removed.push(work[index].clone());
        // Front-first copies shift the suffix left, then the tail drops.
        for k in index..n - 1 {
            let src = work[k + 1].clone();
            ops.push(CapturedOp::ListSet {
                index: k,
                new: src.clone(),
                old: Some(work[k].clone()),
            });
            work[k] = src;
        }
        let last = work.pop().expect("non-empty");
        ops.push(CapturedOp::ListDelete {
            index: n - 1,
            old: last,
        });
    }
    finish_list_write(inner, node, suppressed, ops, work);
    for slot in &removed {
        purge_replaced(inner, Some(slot));
    }
    Ok(())
}

pub(crate) fn list_clear(inner: &mut MirrorInner, node: NodeId) -> MirrorResult<()> {
    if write_blocked(inner, node) {
        return Ok(());
    }
    let len = list_len(inner, node)?;
    if len == 0 {
        return Ok(());
    }
    let suppressed = inner.suppress > 0;
    if !suppressed {
        ensure_list_batch(inner, node);
    }
    let mut work = list_items_clone(inner, node)?;
    let mut ops = Vec::with_capacity(len);
    let mut removed = Vec::with_capacity(len);
    // Popping from the tail keeps every delete a tail delete; the planner
    // folds the run into one delete of the whole range.
    for k in (0..len).rev() {
        let last = work.pop().expect("non-empty");
        removed.push(last.clone());
        ops.push(CapturedOp::ListDelete { index: k, old: last });
    }
    finish_list_write(inner, node, suppressed, ops, work);
    for slot in &removed {
        purge_replaced(inner, Some(slot));
    }
    Ok(())
}

/// Deep snapshot of the last element, then remove it.
pub(crate) fn list_pop(inner: &mut MirrorInner, node: NodeId) -> MirrorResult<Option<Value>> {
    if write_blocked(inner, node) {
        return Ok(None);
    }
    let len = list_len(inner, node)?;
    if len == 0 {
        return Ok(None);
    }
    let doc = inner.doc.clone();
    let snapshot = match &inner.store.get(node).expect("checked").content {
        NodeContent::List(items) => inner.store.slot_value(&items[len - 1], &doc),
        _ => unreachable!("length was read from a list"),
    };
    list_delete(inner, node, len - 1, 1)?;
    Ok(Some(snapshot))
}

fn list_len(inner: &MirrorInner, node: NodeId) -> MirrorResult<usize> {
    match &inner.store.get(node).expect("checked").content {
        NodeContent::List(items) => Ok(items.len()),
        _ => Err(MirrorError::PlannerInvariant(
            "list op on non-list node".into(),
        )),
    }
}

fn list_items_clone(inner: &MirrorInner, node: NodeId) -> MirrorResult<Vec<Slot>> {
    match &inner.store.get(node).expect("checked").content {
        NodeContent::List(items) => Ok(items.clone()),
        _ => Err(MirrorError::PlannerInvariant(
            "list op on non-list node".into(),
        )),
    }
}

fn ensure_list_batch(inner: &mut MirrorInner, node: NodeId) {
    let pre = match &inner.store.get(node).expect("checked").content {
        NodeContent::List(items) => items.clone(),
        _ => Vec::new(),
    };
    inner.batches.ensure(node, || PreState::List { items: pre });
}

fn finish_list_write(
    inner: &mut MirrorInner,
    node: NodeId,
    suppressed: bool,
    ops: Vec<CapturedOp>,
    items: Vec<Slot>,
) {
    if !suppressed {
        inner
            .batches
            .ensure(node, || unreachable!("batch ensured by the caller"))
            .ops
            .extend(ops);
    }
    if let Some(n) = inner.store.get_mut(node) {
        if let NodeContent::List(list) = &mut n.content {
            *list = items;
        }
    }
}

/// Purge a replaced child's subtree, but only once it is bound: ops already
/// captured this batch may still reference a fresh node, and the planner
/// needs it in the arena to resolve them.
fn purge_replaced(inner: &mut MirrorInner, old: Option<&Slot>) {
    if let Some(Slot::Child(child)) = old {
        let bound = inner
            .store
            .get(*child)
            .map(|n| !n.is_fresh())
            .unwrap_or(false);
        if bound {
            inner.registry.purge_subtree(&mut inner.store, *child);
        }
    }
}

/// Turn a plain value into a slot, creating fresh nodes for composites and
/// recording their content as synthesized child ops. The fresh containers
/// themselves are created by the applier inside the commit.
fn intern_value(
    inner: &mut MirrorInner,
    parent: NodeId,
    value: &Value,
    suppressed: bool,
    segs: &mut Vec<PathSeg>,
) -> MirrorResult<Slot> {
    match value {
        Value::Double(d) if !d.is_finite() => Err(MirrorError::Validation {
            path: format_path("", segs),
            reason: "the number is not finite".into(),
        }),
        Value::Null
        | Value::Bool(_)
        | Value::I64(_)
        | Value::Double(_)
        | Value::Str(_)
        | Value::Binary(_) => Ok(Slot::Value(value.clone())),
        Value::Text(text) => {
            if inner.registry.text_node(text.key()).is_some() || text.is_attached() {
                return Err(MirrorError::Reparent {
                    path: format_path("", segs),
                });
            }
            let id = inner.store.alloc(LocalNode {
                content: NodeContent::Text(text.clone()),
                binding: None,
                parent: Some(parent),
            });
            inner.registry.register_text(text.key(), id);
            Ok(Slot::Child(id))
        }
        Value::Map(m) => {
            let id = inner.store.alloc(LocalNode {
                content: NodeContent::Map(FxHashMap::default()),
                binding: None,
                parent: Some(parent),
            });
            if !suppressed {
                inner.batches.ensure(id, || PreState::Map);
            }
            for (k, v) in m {
                segs.push(PathSeg::Key(k.clone()));
                let slot = intern_value(inner, id, v, suppressed, segs)?;
                segs.pop();
                if !suppressed {
                    inner
                        .batches
                        .ensure(id, || PreState::Map)
                        .ops
                        .push(CapturedOp::MapSet {
                            key: k.clone(),
                            new: slot.clone(),
                            old: None,
                        });
                }
                if let Some(n) = inner.store.get_mut(id) {
                    if let NodeContent::Map(entries) = &mut n.content {
                        entries.insert(k.clone(), slot);
                    }
                }
            }
            Ok(Slot::Child(id))
        }
        Value::List(xs) => {
            let id = inner.store.alloc(LocalNode {
                content: NodeContent::List(Vec::with_capacity(xs.len())),
                binding: None,
                parent: Some(parent),
            });
            if !suppressed {
                inner
                    .batches
                    .ensure(id, || PreState::List { items: Vec::new() });
            }
            for (i, v) in xs.iter().enumerate() {
                segs.push(PathSeg::Index(i));
                let slot = intern_value(inner, id, v, suppressed, segs)?;
                segs.pop();
                if !suppressed {
                    inner
                        .batches
                        .ensure(id, || PreState::List { items: Vec::new() })
                        .ops
                        .push(CapturedOp::ListSet {
                            index: i,
                            new: slot.clone(),
                            old: None,
                        });
                }
                if let Some(n) = inner.store.get_mut(id) {
                    if let NodeContent::List(items) = &mut n.content {
                        items.push(slot);
                    }
                }
            }
            Ok(Slot::Child(id))
        }
    }
}

fn slot_matches_value(inner: &MirrorInner, old: &Slot, value: &Value) -> bool {
    match (old, value) {
        (Slot::Value(a), v) if v.is_scalar() => a == v,
        (Slot::Child(n), Value::Text(t)) => matches!(
            inner.store.get(*n).map(|node| &node.content),
            Some(NodeContent::Text(existing)) if existing.key() == t.key()
        ),
        _ => false,
    }
}
