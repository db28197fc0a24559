//! The CRDT applier: the only writer to the document on the local path.
//!
//! Executes planned intents per container, creating fresh containers with
//! `insert_container` at their final position so that parent assignment is
//! atomic with the insert. The caller wraps the whole run in one commit
//! tagged with the mirror's origin.

use loro::{Container, LoroDoc, LoroList, LoroMap};
use rustc_hash::FxHashMap;
use tracing::warn;

use crate::error::{MirrorError, MirrorResult};
use crate::planner::{ContainerPlan, Intent, Planned};
use crate::store::NodeId;

pub(crate) struct ApplyOutcome {
    /// Containers created during this run, to be bound in the registry.
    pub bindings: Vec<(NodeId, Container)>,
}

pub(crate) fn apply_plans(doc: &LoroDoc, plans: &[ContainerPlan]) -> MirrorResult<ApplyOutcome> {
    let mut created: FxHashMap<NodeId, Container> = FxHashMap::default();
    for plan in plans {
        let handle = match &plan.binding {
            Some(cid) => doc.get_container(cid.clone()),
            None => created.get(&plan.node).cloned(),
        };
        let Some(handle) = handle else {
            warn!("skipping intents for a container that no longer resolves");
            continue;
        };
        match handle {
            Container::Map(map) => apply_map_intents(&map, &plan.intents, &mut created)?,
            Container::List(list) => apply_list_intents(&list, &plan.intents, &mut created)?,
            _ => {
                return Err(MirrorError::PlannerInvariant(
                    "planned intents for an unsupported container kind".into(),
                ))
            }
        }
    }
    Ok(ApplyOutcome {
        bindings: created.into_iter().collect(),
    })
}

fn apply_map_intents(
    map: &LoroMap,
    intents: &[Intent],
    created: &mut FxHashMap<NodeId, Container>,
) -> MirrorResult<()> {
    for intent in intents {
        match intent {
            Intent::MapSet { key, value } => match value {
                Planned::Scalar(v) => map.insert(key, v.clone())?,
                Planned::FreshMap(node) => {
                    let child = map.insert_container(key, LoroMap::new())?;
                    created.insert(*node, Container::Map(child));
                }
                Planned::FreshList(node) => {
                    let child = map.insert_container(key, LoroList::new())?;
                    created.insert(*node, Container::List(child));
                }
                Planned::FreshText { node, text } => {
                    let child = map.insert_container(key, text.clone())?;
                    created.insert(*node, Container::Text(child));
                }
            },
            Intent::MapDelete { key } => map.delete(key)?,
            _ => {
                return Err(MirrorError::PlannerInvariant(
                    "list intent planned for a map container".into(),
                ))
            }
        }
    }
    Ok(())
}

fn apply_list_intents(
    list: &LoroList,
    intents: &[Intent],
    created: &mut FxHashMap<NodeId, Container>,
) -> MirrorResult<()> {
    for intent in intents {
        match intent {
            Intent::ListInsert { index, values } => {
                for (offset, value) in values.iter().enumerate() {
                    let pos = index + offset;
                    match value {
                        Planned::Scalar(v) => list.insert(pos, v.clone())?,
                        Planned::FreshMap(node) => {
                            let child = list.insert_container(pos, LoroMap::new())?;
                            created.insert(*node, Container::Map(child));
                        }
                        Planned::FreshList(node) => {
                            let child = list.insert_container(pos, LoroList::new())?;
                            created.insert(*node, Container::List(child));
                        }
                        Planned::FreshText { node, text } => {
                            let child = list.insert_container(pos, text.clone())?;
                            created.insert(*node, Container::Text(child));
                        }
                    }
                }
            }
            Intent::ListDelete { index, len } => list.delete(*index, *len)?,
            _ => {
                return Err(MirrorError::PlannerInvariant(
                    "map intent planned for a list container".into(),
                ))
            }
        }
    }
    Ok(())
}
