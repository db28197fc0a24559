//! The proxy façade: cheap handles that read through the registry and
//! write through op capture.
//!
//! A handle is a node id plus a reference to the mirror state; clones are
//! interchangeable and compare equal when they point at the same node.
//! Reads crossing into a not-yet-materialized child wrap it on the spot.
//! Writes against a handle whose container was replaced (or whose mirror
//! was disposed) are dropped with a warning.

use std::sync::{Arc, Mutex, MutexGuard};

use enum_as_inner::EnumAsInner;
use loro::ContainerID;

use crate::capture;
use crate::convert::{container_deep_value, value_from_loro};
use crate::error::MirrorResult;
use crate::store::{NodeContent, NodeId, Slot};
use crate::text::SyncedText;
use crate::value::Value;
use crate::MirrorInner;

/// A handle to a mirrored keyed map.
#[derive(Clone)]
pub struct MapRef {
    inner: Arc<Mutex<MirrorInner>>,
    node: NodeId,
}

/// A handle to a mirrored ordered list.
#[derive(Clone)]
pub struct ListRef {
    inner: Arc<Mutex<MirrorInner>>,
    node: NodeId,
}

/// What a read returns: a scalar, a nested handle, or a text handle.
#[derive(Clone, Debug, PartialEq, EnumAsInner)]
pub enum ValueRef {
    /// A scalar value.
    Value(Value),
    /// A nested map.
    Map(MapRef),
    /// A nested list.
    List(ListRef),
    /// A rich text handle, live by itself.
    Text(SyncedText),
}

pub(crate) fn ref_for_node(
    arc: &Arc<Mutex<MirrorInner>>,
    inner: &MirrorInner,
    node: NodeId,
) -> ValueRef {
    match inner.store.get(node).map(|n| &n.content) {
        Some(NodeContent::Map(_)) => ValueRef::Map(MapRef {
            inner: arc.clone(),
            node,
        }),
        Some(NodeContent::List(_)) => ValueRef::List(ListRef {
            inner: arc.clone(),
            node,
        }),
        Some(NodeContent::Text(t)) => ValueRef::Text(t.clone()),
        None => ValueRef::Value(Value::Null),
    }
}

enum SlotAddr<'a> {
    Key(&'a str),
    Index(usize),
}

/// Resolve a read slot, materializing lazy children and repointing the
/// parent slot at the new node.
fn resolve_slot(
    arc: &Arc<Mutex<MirrorInner>>,
    inner: &mut MirrorInner,
    parent: NodeId,
    addr: SlotAddr<'_>,
    slot: Slot,
) -> ValueRef {
    match slot {
        Slot::Value(v) => ValueRef::Value(v),
        Slot::Child(node) => ref_for_node(arc, inner, node),
        Slot::Lazy(cid) => {
            let doc = inner.doc.clone();
            match inner
                .registry
                .materialize(&mut inner.store, &doc, &cid, Some(parent))
            {
                Some(node) => {
                    repoint(inner, parent, addr, node);
                    ref_for_node(arc, inner, node)
                }
                // Container kinds the mirror does not model read as
                // snapshots.
                None => ValueRef::Value(snapshot_container(inner, &cid)),
            }
        }
    }
}

fn repoint(inner: &mut MirrorInner, parent: NodeId, addr: SlotAddr<'_>, node: NodeId) {
    if let Some(p) = inner.store.get_mut(parent) {
        match (&mut p.content, addr) {
            (NodeContent::Map(entries), SlotAddr::Key(key)) => {
                entries.insert(key.to_string(), Slot::Child(node));
            }
            (NodeContent::List(items), SlotAddr::Index(i)) => {
                if i < items.len() {
                    items[i] = Slot::Child(node);
                }
            }
            _ => {}
        }
    }
}

fn snapshot_container(inner: &MirrorInner, cid: &ContainerID) -> Value {
    match inner.doc.get_container(cid.clone()) {
        Some(c) => value_from_loro(&container_deep_value(&c)),
        None => Value::Null,
    }
}

impl MapRef {
    fn lock(&self) -> MutexGuard<'_, MirrorInner> {
        self.inner.lock().unwrap()
    }

    /// Read one entry. `None` for missing keys and stale handles.
    pub fn get(&self, key: &str) -> Option<ValueRef> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let slot = match &inner.store.get(self.node)?.content {
            NodeContent::Map(entries) => entries.get(key)?.clone(),
            _ => return None,
        };
        Some(resolve_slot(
            &self.inner,
            inner,
            self.node,
            SlotAddr::Key(key),
            slot,
        ))
    }

    /// Set one entry. Accepts anything convertible to [`Value`];
    /// `Option::None` converts to null.
    pub fn insert(&self, key: &str, value: impl Into<Value>) -> MirrorResult<()> {
        let mut guard = self.lock();
        capture::map_insert(&mut guard, self.node, key, value.into())
    }

    /// Remove one entry. Removing a missing key is a no-op.
    pub fn delete(&self, key: &str) -> MirrorResult<()> {
        let mut guard = self.lock();
        capture::map_delete(&mut guard, self.node, key)
    }

    /// Remove every entry.
    pub fn clear(&self) -> MirrorResult<()> {
        let mut guard = self.lock();
        capture::map_clear(&mut guard, self.node)
    }

    /// Whether the map has an entry for `key`.
    pub fn contains_key(&self, key: &str) -> bool {
        let guard = self.lock();
        match guard.store.get(self.node).map(|n| &n.content) {
            Some(NodeContent::Map(entries)) => entries.contains_key(key),
            _ => false,
        }
    }

    /// The keys, snapshotted.
    pub fn keys(&self) -> Vec<String> {
        let guard = self.lock();
        match guard.store.get(self.node).map(|n| &n.content) {
            Some(NodeContent::Map(entries)) => entries.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// The number of entries. Zero for stale handles.
    pub fn len(&self) -> usize {
        let guard = self.lock();
        match guard.store.get(self.node).map(|n| &n.content) {
            Some(NodeContent::Map(entries)) => entries.len(),
            _ => 0,
        }
    }

    /// Whether the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deep plain snapshot of this subtree.
    pub fn to_value(&self) -> Value {
        let guard = self.lock();
        let doc = guard.doc.clone();
        guard.store.deep_value(self.node, &doc)
    }
}

impl ListRef {
    fn lock(&self) -> MutexGuard<'_, MirrorInner> {
        self.inner.lock().unwrap()
    }

    /// Read one element. `None` out of range and for stale handles.
    pub fn get(&self, index: usize) -> Option<ValueRef> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let slot = match &inner.store.get(self.node)?.content {
            NodeContent::List(items) => items.get(index)?.clone(),
            _ => return None,
        };
        Some(resolve_slot(
            &self.inner,
            inner,
            self.node,
            SlotAddr::Index(index),
            slot,
        ))
    }

    /// Append one element.
    pub fn push(&self, value: impl Into<Value>) -> MirrorResult<()> {
        let mut guard = self.lock();
        capture::list_push(&mut guard, self.node, value.into())
    }

    /// Remove and return a deep snapshot of the last element.
    pub fn pop(&self) -> MirrorResult<Option<Value>> {
        let mut guard = self.lock();
        capture::list_pop(&mut guard, self.node)
    }

    /// Write the element at `index`; `index == len` appends.
    pub fn set(&self, index: usize, value: impl Into<Value>) -> MirrorResult<()> {
        let mut guard = self.lock();
        capture::list_set(&mut guard, self.node, index, value.into())
    }

    /// Insert one element at `index`, shifting the suffix right.
    pub fn insert(&self, index: usize, value: impl Into<Value>) -> MirrorResult<()> {
        let mut guard = self.lock();
        capture::list_insert(&mut guard, self.node, index, value.into())
    }

    /// Delete `len` elements starting at `index`.
    pub fn delete(&self, index: usize, len: usize) -> MirrorResult<()> {
        let mut guard = self.lock();
        capture::list_delete(&mut guard, self.node, index, len)
    }

    /// Remove every element.
    pub fn clear(&self) -> MirrorResult<()> {
        let mut guard = self.lock();
        capture::list_clear(&mut guard, self.node)
    }

    /// The number of elements. Zero for stale handles.
    pub fn len(&self) -> usize {
        let guard = self.lock();
        match guard.store.get(self.node).map(|n| &n.content) {
            Some(NodeContent::List(items)) => items.len(),
            _ => 0,
        }
    }

    /// Whether the list has no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deep plain snapshot of this subtree.
    pub fn to_value(&self) -> Value {
        let guard = self.lock();
        let doc = guard.doc.clone();
        guard.store.deep_value(self.node, &doc)
    }
}

impl PartialEq for MapRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) && self.node == other.node
    }
}

impl PartialEq for ListRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) && self.node == other.node
    }
}

impl std::fmt::Debug for MapRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MapRef({:?})", self.node)
    }
}

impl std::fmt::Debug for ListRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ListRef({:?})", self.node)
    }
}
