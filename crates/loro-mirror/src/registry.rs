//! The materialization registry: the bidirectional identity map between
//! attached containers and local nodes.
//!
//! Forward direction: `ContainerID -> NodeId`. Reverse direction: the
//! node's `binding` field. Rich text handles are additionally indexed by
//! their process-unique key so that assigning the same handle twice is
//! caught as a re-parent.

use loro::{Container, ContainerID, ContainerTrait, LoroDoc, LoroValue};
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::convert::value_from_loro;
use crate::store::{LocalNode, NodeContent, NodeId, Slot, Store};
use crate::text::SyncedText;

#[derive(Debug, Default)]
pub(crate) struct Registry {
    by_container: FxHashMap<ContainerID, NodeId>,
    by_text_key: FxHashMap<u64, NodeId>,
}

impl Registry {
    pub fn node_for(&self, cid: &ContainerID) -> Option<NodeId> {
        self.by_container.get(cid).copied()
    }

    pub fn text_node(&self, key: u64) -> Option<NodeId> {
        self.by_text_key.get(&key).copied()
    }

    pub fn register_text(&mut self, key: u64, node: NodeId) {
        self.by_text_key.insert(key, node);
    }

    /// Record that `node` mirrors the attached container `cid`.
    pub fn bind(&mut self, store: &mut Store, node: NodeId, cid: ContainerID) {
        if let Some(n) = store.get_mut(node) {
            n.binding = Some(cid.clone());
        }
        self.by_container.insert(cid, node);
    }

    /// Idempotently materialize the container as a local node, shallowly:
    /// scalar entries are copied, child containers become lazy slots.
    ///
    /// Returns `None` for container kinds the mirror does not model
    /// (callers fall back to read-only snapshots).
    pub fn materialize(
        &mut self,
        store: &mut Store,
        doc: &LoroDoc,
        cid: &ContainerID,
        parent: Option<NodeId>,
    ) -> Option<NodeId> {
        if let Some(existing) = self.node_for(cid) {
            return Some(existing);
        }
        let container = doc.get_container(cid.clone())?;
        let content = match &container {
            Container::Map(m) => NodeContent::Map(shallow_map(&m.get_value())),
            Container::List(l) => NodeContent::List(shallow_list(&l.get_value())),
            Container::Text(t) => NodeContent::Text(SyncedText::from_attached(t.clone())),
            _ => return None,
        };
        let node = store.alloc(LocalNode {
            content,
            binding: Some(cid.clone()),
            parent,
        });
        if let NodeContent::Text(text) = &store.get(node).expect("just allocated").content {
            self.by_text_key.insert(text.key(), node);
        }
        self.by_container.insert(cid.clone(), node);
        trace!(%cid, "materialized container");
        Some(node)
    }

    /// Remove a subtree from the arena and both registry directions.
    /// Absence from the arena is what makes stale proxies inert.
    pub fn purge_subtree(&mut self, store: &mut Store, id: NodeId) {
        let Some(node) = store.remove(id) else {
            return;
        };
        if let Some(cid) = &node.binding {
            self.by_container.remove(cid);
        }
        match node.content {
            NodeContent::Map(entries) => {
                for slot in entries.into_values() {
                    if let Slot::Child(child) = slot {
                        self.purge_subtree(store, child);
                    }
                }
            }
            NodeContent::List(items) => {
                for slot in items {
                    if let Slot::Child(child) = slot {
                        self.purge_subtree(store, child);
                    }
                }
            }
            NodeContent::Text(text) => {
                self.by_text_key.remove(&text.key());
            }
        }
    }

    /// Purge whatever a slot points at; no-op for scalars and lazies.
    pub fn purge_slot(&mut self, store: &mut Store, slot: &Slot) {
        if let Slot::Child(child) = slot {
            self.purge_subtree(store, *child);
        }
    }

    pub fn clear(&mut self) {
        self.by_container.clear();
        self.by_text_key.clear();
    }
}

/// Shallow map content from a container's `get_value()`: child containers
/// appear as `LoroValue::Container` markers and become lazy slots.
fn shallow_map(v: &LoroValue) -> FxHashMap<String, Slot> {
    let LoroValue::Map(m) = v else {
        return FxHashMap::default();
    };
    m.iter()
        .map(|(k, v)| (k.clone(), shallow_slot(v)))
        .collect()
}

fn shallow_list(v: &LoroValue) -> Vec<Slot> {
    let LoroValue::List(xs) = v else {
        return Vec::new();
    };
    xs.iter().map(shallow_slot).collect()
}

pub(crate) fn shallow_slot(v: &LoroValue) -> Slot {
    match v {
        LoroValue::Container(cid) => Slot::Lazy(cid.clone()),
        other => Slot::Value(value_from_loro(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn materialize_is_idempotent() {
        let doc = LoroDoc::new();
        let map = doc.get_map("data");
        map.insert("a", 1).unwrap();
        let mut store = Store::default();
        let mut registry = Registry::default();
        let cid = map.id();
        let n1 = registry.materialize(&mut store, &doc, &cid, None).unwrap();
        let n2 = registry.materialize(&mut store, &doc, &cid, None).unwrap();
        assert_eq!(n1, n2);
        let NodeContent::Map(entries) = &store.get(n1).unwrap().content else {
            panic!("expected a map node");
        };
        assert_eq!(entries["a"], Slot::Value(crate::Value::I64(1)));
    }

    #[test]
    fn purge_unbinds_both_directions() {
        let doc = LoroDoc::new();
        let map = doc.get_map("data");
        let mut store = Store::default();
        let mut registry = Registry::default();
        let cid = map.id();
        let n = registry.materialize(&mut store, &doc, &cid, None).unwrap();
        registry.purge_subtree(&mut store, n);
        assert!(registry.node_for(&cid).is_none());
        assert!(!store.contains(n));
    }
}
