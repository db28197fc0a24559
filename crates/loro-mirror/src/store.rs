//! The local arena: plain nodes mirroring shared containers.
//!
//! Every materialized container is one [`LocalNode`] addressed by a
//! [`NodeId`]. Proxies hold node ids, never direct references, so
//! replacement and disposal are just arena removals: a dangling id is the
//! tombstone.

use loro::{ContainerID, LoroDoc};
use rustc_hash::FxHashMap;

use crate::convert::{container_deep_value, value_from_loro};
use crate::text::SyncedText;
use crate::value::{format_path, PathSeg, Value};

/// Identity of a local node. Stable for the life of the node; never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct NodeId(u64);

/// One position in a map or list node.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Slot {
    /// A scalar value, stored inline.
    Value(Value),
    /// A materialized child node.
    Child(NodeId),
    /// An attached child container that has not been read yet. Materialized
    /// on first access.
    Lazy(ContainerID),
}

#[derive(Debug)]
pub(crate) enum NodeContent {
    Map(FxHashMap<String, Slot>),
    List(Vec<Slot>),
    Text(SyncedText),
}

#[derive(Debug)]
pub(crate) struct LocalNode {
    pub content: NodeContent,
    /// The attached container this node mirrors. `None` while the node is
    /// fresh (created locally, not yet committed).
    pub binding: Option<ContainerID>,
    pub parent: Option<NodeId>,
}

impl LocalNode {
    pub fn is_fresh(&self) -> bool {
        self.binding.is_none()
    }
}

#[derive(Debug, Default)]
pub(crate) struct Store {
    nodes: FxHashMap<NodeId, LocalNode>,
    next_id: u64,
}

impl Store {
    pub fn alloc(&mut self, node: LocalNode) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(id, node);
        id
    }

    pub fn get(&self, id: NodeId) -> Option<&LocalNode> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut LocalNode> {
        self.nodes.get_mut(&id)
    }

    pub fn remove(&mut self, id: NodeId) -> Option<LocalNode> {
        self.nodes.remove(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }

    /// Slash-separated path of a node, for diagnostics. Positions are
    /// resolved by scanning the parent, so this is best-effort on trees
    /// that are mid-mutation.
    pub fn path_of(&self, id: NodeId) -> String {
        let mut segs: Vec<PathSeg> = Vec::new();
        let mut cur = id;
        loop {
            let Some(node) = self.get(cur) else {
                segs.reverse();
                return format_path("<stale>", &segs);
            };
            let Some(parent) = node.parent else {
                let root = match &node.binding {
                    Some(ContainerID::Root { name, .. }) => name.to_string(),
                    Some(other) => other.to_string(),
                    None => "<detached>".to_string(),
                };
                segs.reverse();
                return format_path(&root, &segs);
            };
            if let Some(p) = self.get(parent) {
                match &p.content {
                    NodeContent::Map(entries) => {
                        if let Some((k, _)) = entries
                            .iter()
                            .find(|(_, slot)| matches!(slot, Slot::Child(c) if *c == cur))
                        {
                            segs.push(PathSeg::Key(k.clone()));
                        }
                    }
                    NodeContent::List(items) => {
                        if let Some(i) = items
                            .iter()
                            .position(|slot| matches!(slot, Slot::Child(c) if *c == cur))
                        {
                            segs.push(PathSeg::Index(i));
                        }
                    }
                    NodeContent::Text(_) => {}
                }
            }
            cur = parent;
        }
    }

    /// Deep plain snapshot of a subtree. Text resolves to its string
    /// content; lazy children are read from the document without
    /// materializing them.
    pub fn deep_value(&self, id: NodeId, doc: &LoroDoc) -> Value {
        let Some(node) = self.get(id) else {
            return Value::Null;
        };
        match &node.content {
            NodeContent::Map(entries) => Value::Map(
                entries
                    .iter()
                    .map(|(k, slot)| (k.clone(), self.slot_value(slot, doc)))
                    .collect(),
            ),
            NodeContent::List(items) => Value::List(
                items.iter().map(|slot| self.slot_value(slot, doc)).collect(),
            ),
            NodeContent::Text(text) => Value::Str(text.to_string()),
        }
    }

    pub fn slot_value(&self, slot: &Slot, doc: &LoroDoc) -> Value {
        match slot {
            Slot::Value(v) => v.clone(),
            Slot::Child(id) => self.deep_value(*id, doc),
            Slot::Lazy(cid) => match doc.get_container(cid.clone()) {
                Some(c) => value_from_loro(&container_deep_value(&c)),
                None => Value::Null,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_tombstone() {
        let mut store = Store::default();
        let id = store.alloc(LocalNode {
            content: NodeContent::List(vec![Slot::Value(Value::I64(1))]),
            binding: None,
            parent: None,
        });
        assert!(store.contains(id));
        store.remove(id);
        assert!(!store.contains(id));
        // A dangling id resolves to nothing rather than panicking.
        assert_eq!(store.path_of(id), "<stale>");
    }

    #[test]
    fn deep_value_resolves_children() {
        let doc = LoroDoc::new();
        let mut store = Store::default();
        let child = store.alloc(LocalNode {
            content: NodeContent::List(vec![
                Slot::Value(Value::I64(1)),
                Slot::Value(Value::I64(2)),
            ]),
            binding: None,
            parent: None,
        });
        let mut entries = FxHashMap::default();
        entries.insert("xs".to_string(), Slot::Child(child));
        let root = store.alloc(LocalNode {
            content: NodeContent::Map(entries),
            binding: None,
            parent: None,
        });
        store.get_mut(child).unwrap().parent = Some(root);
        let v = store.deep_value(root, &doc);
        assert_eq!(
            v.as_map().unwrap()["xs"],
            Value::List(vec![Value::I64(1), Value::I64(2)])
        );
        assert_eq!(store.path_of(child), "<detached>/xs");
    }
}
