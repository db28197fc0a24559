//! The remote reconciler: the only writer to the local tree on the remote
//! path.
//!
//! Subscribes to the document's root event stream. Events carrying the
//! mirror's own origin are recognized and dropped before any lock is
//! taken; everything else (imports, checkouts, foreign commits) is applied
//! to the local tree as the minimal structural change, under the suppress
//! counter so none of it is re-captured.

use std::sync::{Arc, Mutex};

use loro::event::{ContainerDiff, Diff, DiffEvent, ListDiffItem};
use loro::{Container, ContainerTrait, LoroDoc, LoroValue, Subscription, ValueOrContainer};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{trace, warn};

use crate::convert::value_from_loro;
use crate::registry::shallow_slot;
use crate::store::{NodeContent, NodeId, Slot};
use crate::{ChangeSource, MirrorInner};

pub(crate) fn install_subscription(
    inner: &Arc<Mutex<MirrorInner>>,
    doc: &LoroDoc,
    origin: String,
) -> Subscription {
    let weak = Arc::downgrade(inner);
    doc.subscribe_root(Arc::new(move |event| {
        // Our own commits come back with our origin; drop them before
        // taking any lock so a commit in progress cannot deadlock.
        if event.origin == origin {
            return;
        }
        let Some(strong) = weak.upgrade() else {
            return;
        };
        handle_remote_event(&strong, &event);
    }))
}

fn handle_remote_event(inner_arc: &Arc<Mutex<MirrorInner>>, event: &DiffEvent) {
    let callbacks = {
        let mut guard = inner_arc.lock().unwrap();
        let inner = &mut *guard;
        if inner.disposed {
            return;
        }
        inner.suppress += 1;
        for diff in &event.events {
            apply_container_diff(inner, diff);
        }
        inner.callbacks()
    };
    // Callbacks run unlocked but still suppressed: proxy writes they make
    // in reaction to remote state must not loop back into the document.
    for cb in &callbacks {
        cb(ChangeSource::Remote);
    }
    let mut guard = inner_arc.lock().unwrap();
    guard.suppress = guard.suppress.saturating_sub(1);
}

fn apply_container_diff(inner: &mut MirrorInner, diff: &ContainerDiff) {
    let Some(node) = inner.registry.node_for(diff.target) else {
        // Not materialized: a lazy read will see the new state on demand.
        trace!(cid = %diff.target, "event for an unmaterialized container");
        return;
    };
    if inner.batches.contains(node) {
        warn!(
            path = %inner.store.path_of(node),
            "remote update interleaved with uncommitted local ops; commit before importing"
        );
    }
    match &diff.diff {
        Diff::Map(delta) => {
            let updates: Vec<(String, Option<Slot>)> = delta
                .updated
                .iter()
                .map(|(k, v)| (k.to_string(), v.as_ref().map(voc_to_slot)))
                .collect();
            apply_map_updates(inner, node, updates);
        }
        Diff::List(items) => apply_list_diff(inner, node, items),
        // The text handle is live; there is nothing to mirror.
        Diff::Text(_) => {}
        _ => {}
    }
}

fn voc_to_slot(v: &ValueOrContainer) -> Slot {
    match v {
        ValueOrContainer::Value(v) => Slot::Value(value_from_loro(v)),
        ValueOrContainer::Container(c) => Slot::Lazy(c.id()),
    }
}

fn apply_map_updates(inner: &mut MirrorInner, node: NodeId, updates: Vec<(String, Option<Slot>)>) {
    for (key, new_slot) in updates {
        let old = {
            let Some(n) = inner.store.get(node) else { return };
            match &n.content {
                NodeContent::Map(entries) => entries.get(&key).cloned(),
                _ => return,
            }
        };
        // A changed key purges the replaced subtree, unless the event
        // re-announces the container the slot already points at.
        let same_container = matches!(
            (&old, &new_slot),
            (Some(Slot::Lazy(a)), Some(Slot::Lazy(b))) if a == b
        ) || matches!(
            (&old, &new_slot),
            (Some(Slot::Child(n)), Some(Slot::Lazy(cid)))
                if inner.store.get(*n).and_then(|c| c.binding.as_ref()) == Some(cid)
        );
        if same_container {
            continue;
        }
        if let Some(old) = &old {
            inner.registry.purge_slot(&mut inner.store, old);
        }
        if let Some(n) = inner.store.get_mut(node) {
            if let NodeContent::Map(entries) = &mut n.content {
                match new_slot {
                    Some(slot) => {
                        entries.insert(key, slot);
                    }
                    None => {
                        entries.remove(&key);
                    }
                }
            }
        }
    }
}

/// Apply retain / insert / delete runs to the list node in place, so the
/// node (and every proxy pointing at it) keeps its identity.
fn apply_list_diff(inner: &mut MirrorInner, node: NodeId, runs: &[ListDiffItem]) {
    let mut purged: Vec<Slot> = Vec::new();
    {
        let Some(n) = inner.store.get_mut(node) else { return };
        let NodeContent::List(items) = &mut n.content else {
            return;
        };
        let mut pos = 0usize;
        for run in runs {
            match run {
                ListDiffItem::Retain { retain } => {
                    pos += retain;
                    if pos > items.len() {
                        warn!("list delta retained past the end; clamping");
                        pos = items.len();
                    }
                }
                ListDiffItem::Insert { insert, .. } => {
                    let slots: Vec<Slot> = insert.iter().map(voc_to_slot).collect();
                    let count = slots.len();
                    items.splice(pos..pos, slots);
                    pos += count;
                }
                ListDiffItem::Delete { delete } => {
                    let end = (pos + delete).min(items.len());
                    if end < pos + delete {
                        warn!("list delta deleted past the end; clamping");
                    }
                    purged.extend(items.drain(pos..end));
                }
            }
        }
    }
    for slot in &purged {
        inner.registry.purge_slot(&mut inner.store, slot);
    }
}

/// Force the local tree back to the document's current state with a
/// structural diff, preserving node identity wherever the underlying
/// container is unchanged. Used after a rejected or partially applied
/// batch, and available to hosts as a consistency pass.
pub(crate) fn resync(inner: &mut MirrorInner) {
    let Some(root) = inner.root_node else {
        return;
    };
    sync_node(inner, root);
}

fn sync_node(inner: &mut MirrorInner, id: NodeId) {
    let Some(node) = inner.store.get(id) else {
        return;
    };
    let Some(cid) = node.binding.clone() else {
        return;
    };
    let doc = inner.doc.clone();
    let Some(container) = doc.get_container(cid) else {
        return;
    };
    match container {
        Container::Map(map) => {
            let LoroValue::Map(shallow) = map.get_value() else {
                return;
            };
            let mut reused: FxHashSet<NodeId> = FxHashSet::default();
            let mut recurse: Vec<NodeId> = Vec::new();
            let mut next: FxHashMap<String, Slot> = FxHashMap::default();
            for (key, value) in shallow.iter() {
                next.insert(key.clone(), rebuilt_slot(inner, value, &mut reused, &mut recurse));
            }
            let old = {
                let Some(n) = inner.store.get_mut(id) else { return };
                let NodeContent::Map(entries) = &mut n.content else {
                    return;
                };
                std::mem::replace(entries, next)
            };
            for slot in old.into_values() {
                drop_unreused(inner, slot, &reused);
            }
            finish_children(inner, id, recurse);
        }
        Container::List(list) => {
            let LoroValue::List(shallow) = list.get_value() else {
                return;
            };
            let mut reused: FxHashSet<NodeId> = FxHashSet::default();
            let mut recurse: Vec<NodeId> = Vec::new();
            let next: Vec<Slot> = shallow
                .iter()
                .map(|value| rebuilt_slot(inner, value, &mut reused, &mut recurse))
                .collect();
            let old = {
                let Some(n) = inner.store.get_mut(id) else { return };
                let NodeContent::List(items) = &mut n.content else {
                    return;
                };
                std::mem::replace(items, next)
            };
            for slot in old {
                drop_unreused(inner, slot, &reused);
            }
            finish_children(inner, id, recurse);
        }
        _ => {}
    }
}

fn rebuilt_slot(
    inner: &MirrorInner,
    value: &LoroValue,
    reused: &mut FxHashSet<NodeId>,
    recurse: &mut Vec<NodeId>,
) -> Slot {
    if let LoroValue::Container(child_cid) = value {
        if let Some(n) = inner.registry.node_for(child_cid) {
            reused.insert(n);
            recurse.push(n);
            return Slot::Child(n);
        }
    }
    shallow_slot(value)
}

fn drop_unreused(inner: &mut MirrorInner, slot: Slot, reused: &FxHashSet<NodeId>) {
    if let Slot::Child(n) = slot {
        if !reused.contains(&n) {
            inner.registry.purge_subtree(&mut inner.store, n);
        }
    }
}

fn finish_children(inner: &mut MirrorInner, parent: NodeId, children: Vec<NodeId>) {
    for child in children {
        if let Some(n) = inner.store.get_mut(child) {
            n.parent = Some(parent);
        }
        sync_node(inner, child);
    }
}
