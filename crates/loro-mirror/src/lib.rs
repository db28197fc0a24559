//! Mirror a [Loro](https://loro.dev) document as a plain reactive tree.
//!
//! Application code holds cheap handles ([`MapRef`], [`ListRef`]) into a
//! local tree of plain values and mutates them in place; the mirror
//! captures every mutation, plans it into the minimal set of CRDT
//! operations, and applies them to the document in one commit tagged with
//! a mirror-owned origin. Remote updates (imports, checkouts, commits made
//! outside the mirror) flow the other way: the mirror observes the
//! document's events and reconciles the local tree without echoing
//! anything back.
//!
//! ```
//! use loro::LoroDoc;
//! use loro_mirror::Mirror;
//!
//! let doc = LoroDoc::new();
//! let mirror = Mirror::new(&doc, doc.get_map("state"))?;
//! let root = mirror.root().into_map().unwrap();
//! root.insert("title", "hello")?;
//! root.insert("todos", serde_json::json!([{ "done": false, "text": "ship" }]))?;
//! mirror.commit()?;
//! assert_eq!(
//!     mirror.to_value().to_json_value(),
//!     serde_json::json!({ "title": "hello", "todos": [{ "done": false, "text": "ship" }] }),
//! );
//! # Ok::<(), loro_mirror::MirrorError>(())
//! ```
//!
//! Mutations are batched until [`Mirror::commit`], which is the moment the
//! whole burst becomes one transaction: remote peers observe it
//! atomically, and an undo manager configured to track (or exclude)
//! [`Mirror::origin`] sees exactly the mirror's own changes.
#![warn(missing_docs)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use loro::{CommitOptions, Container, ContainerID, ContainerTrait, LoroDoc, LoroList, LoroMap, Subscription};
use tracing::{debug, trace, warn};

mod apply;
mod capture;
mod convert;
mod error;
mod planner;
mod proxy;
mod reconcile;
mod registry;
mod store;
mod text;
mod value;

pub use error::{MirrorError, MirrorResult};
pub use proxy::{ListRef, MapRef, ValueRef};
pub use text::{synced_text, SyncedText};
pub use value::{Value, ValueKind};

use capture::{BatchStage, Batches};
use registry::Registry;
use store::{NodeId, Store};

static NEXT_MIRROR_ID: AtomicU64 = AtomicU64::new(0);

/// Where a change came from, as reported to [`Mirror::subscribe`]
/// callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    /// A local batch was committed to the document.
    Local,
    /// A non-local document event (import, checkout, or a commit made
    /// outside the mirror) was reconciled into the local tree.
    Remote,
}

/// Identifies a callback registered with [`Mirror::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubId(u64);

type MirrorCallback = Arc<dyn Fn(ChangeSource) + Send + Sync>;

/// The root shared container a mirror is built over: a keyed map or an
/// ordered list.
#[derive(Debug)]
pub enum SyncRoot {
    /// A keyed map root, e.g. `doc.get_map("state")`.
    Map(LoroMap),
    /// An ordered list root, e.g. `doc.get_list("rows")`.
    List(LoroList),
}

impl From<LoroMap> for SyncRoot {
    fn from(map: LoroMap) -> Self {
        SyncRoot::Map(map)
    }
}

impl From<LoroList> for SyncRoot {
    fn from(list: LoroList) -> Self {
        SyncRoot::List(list)
    }
}

impl SyncRoot {
    fn is_attached(&self) -> bool {
        match self {
            SyncRoot::Map(m) => m.is_attached(),
            SyncRoot::List(l) => l.is_attached(),
        }
    }

    fn id(&self) -> ContainerID {
        match self {
            SyncRoot::Map(m) => m.id(),
            SyncRoot::List(l) => l.id(),
        }
    }
}

pub(crate) struct MirrorInner {
    pub doc: LoroDoc,
    pub origin: String,
    pub root_cid: ContainerID,
    pub root_node: Option<NodeId>,
    pub store: Store,
    pub registry: Registry,
    pub batches: Batches,
    /// Reference-counted re-entrancy barrier: while it is raised, proxy
    /// writes mutate the local tree but are not captured.
    pub suppress: usize,
    pub disposed: bool,
    pub stage: BatchStage,
    pub subscribers: Vec<(SubId, MirrorCallback)>,
    pub next_sub_id: u64,
    pub sub: Option<Subscription>,
}

impl MirrorInner {
    pub fn callbacks(&self) -> Vec<MirrorCallback> {
        self.subscribers.iter().map(|(_, cb)| cb.clone()).collect()
    }
}

fn set_stage(inner: &mut MirrorInner, next: BatchStage) {
    let prev = inner.stage;
    inner.stage = next;
    trace!(?prev, ?next, "batch stage");
}

fn ensure_root(inner: &mut MirrorInner) -> Option<NodeId> {
    if let Some(node) = inner.root_node {
        if inner.store.contains(node) {
            return Some(node);
        }
    }
    let doc = inner.doc.clone();
    let cid = inner.root_cid.clone();
    let node = inner
        .registry
        .materialize(&mut inner.store, &doc, &cid, None)?;
    inner.root_node = Some(node);
    Some(node)
}

/// The bidirectional bridge between a [`LoroDoc`] subtree and a local
/// plain tree.
///
/// Dropping the mirror disposes it: the pending batch is committed
/// best-effort, the event subscription is removed, and every outstanding
/// handle goes inert (writes are dropped with a warning).
pub struct Mirror {
    inner: Arc<Mutex<MirrorInner>>,
    origin: String,
}

impl Mirror {
    /// Build a mirror over the given root container of `doc`.
    ///
    /// The root must be attached, which root containers obtained from
    /// [`LoroDoc::get_map`] / [`LoroDoc::get_list`] always are (they are
    /// created on first access). The root proxy itself materializes
    /// lazily, on the first [`root`](Mirror::root) call.
    pub fn new(doc: &LoroDoc, root: impl Into<SyncRoot>) -> MirrorResult<Mirror> {
        let root = root.into();
        if !root.is_attached() {
            return Err(MirrorError::Validation {
                path: "<root>".into(),
                reason: "the root container must be attached to the document".into(),
            });
        }
        let origin = format!("mirror:{}", NEXT_MIRROR_ID.fetch_add(1, Ordering::Relaxed));
        let inner = Arc::new(Mutex::new(MirrorInner {
            doc: doc.clone(),
            origin: origin.clone(),
            root_cid: root.id(),
            root_node: None,
            store: Store::default(),
            registry: Registry::default(),
            batches: Batches::default(),
            suppress: 0,
            disposed: false,
            stage: BatchStage::Collecting,
            subscribers: Vec::new(),
            next_sub_id: 0,
            sub: None,
        }));
        let sub = reconcile::install_subscription(&inner, doc, origin.clone());
        inner.lock().unwrap().sub = Some(sub);
        Ok(Mirror { inner, origin })
    }

    /// The root proxy: a [`ValueRef::Map`] or [`ValueRef::List`] matching
    /// the root container kind.
    pub fn root(&self) -> ValueRef {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        match ensure_root(inner) {
            Some(node) => proxy::ref_for_node(&self.inner, inner, node),
            None => ValueRef::Value(Value::Null),
        }
    }

    /// The origin string tagging every commit this mirror makes.
    ///
    /// Expose it to integrations that filter by origin — an undo manager
    /// should track exactly this origin, or it will record remote changes
    /// as local undo steps.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Plan and apply the pending batch as one document commit.
    ///
    /// All mutations since the previous commit flush together: remote
    /// peers observe them atomically. A validation or re-parent problem
    /// rejects the whole batch, restores the local tree from the document,
    /// and surfaces the error; the document is left untouched in that
    /// case.
    pub fn commit(&self) -> MirrorResult<()> {
        let (doc, origin) = {
            let inner = self.inner.lock().unwrap();
            if inner.disposed {
                warn!("commit after dispose does nothing");
                return Ok(());
            }
            if inner.batches.is_empty() {
                return Ok(());
            }
            (inner.doc.clone(), inner.origin.clone())
        };
        // Ops pending on the doc from outside the mirror would be swept
        // into our commit; flush them first so their events reconcile
        // ahead of planning.
        doc.commit();
        let plans = {
            let mut guard = self.inner.lock().unwrap();
            let inner = &mut *guard;
            set_stage(inner, BatchStage::Planning);
            let batches = inner.batches.take();
            match planner::plan_batches(&inner.store, batches) {
                Ok(plans) => plans,
                Err(err) => {
                    set_stage(inner, BatchStage::Error);
                    // The batch is rejected atomically; the local tree may
                    // already show the rejected writes, so force it back
                    // to the document's state.
                    reconcile::resync(inner);
                    set_stage(inner, BatchStage::Collecting);
                    return Err(err);
                }
            }
        };
        if plans.is_empty() {
            let mut guard = self.inner.lock().unwrap();
            set_stage(&mut guard, BatchStage::Collecting);
            return Ok(());
        }
        {
            let mut guard = self.inner.lock().unwrap();
            set_stage(&mut guard, BatchStage::Applying);
        }
        let applied = apply::apply_plans(&doc, &plans);
        doc.commit_with(CommitOptions::new().origin(&origin));
        match applied {
            Ok(outcome) => {
                let callbacks = {
                    let mut guard = self.inner.lock().unwrap();
                    let inner = &mut *guard;
                    for (node, container) in outcome.bindings {
                        let cid = container.id();
                        inner.registry.bind(&mut inner.store, node, cid);
                    }
                    set_stage(inner, BatchStage::Done);
                    set_stage(inner, BatchStage::Collecting);
                    inner.callbacks()
                };
                for cb in &callbacks {
                    cb(ChangeSource::Local);
                }
                Ok(())
            }
            Err(err) => {
                // Loro has no transaction rollback; tolerate the partial
                // commit and restore consistency from the document.
                warn!("apply failed mid-commit; resyncing the local tree: {err}");
                let mut guard = self.inner.lock().unwrap();
                let inner = &mut *guard;
                set_stage(inner, BatchStage::Error);
                reconcile::resync(inner);
                set_stage(inner, BatchStage::Collecting);
                Err(err)
            }
        }
    }

    /// Write `initial` into an empty root, in one commit. Idempotent: a
    /// non-empty root (including one populated by a concurrent peer) is
    /// left alone, as is a [`Value::Null`] initial value.
    pub fn bootstrap(&self, initial: impl Into<Value>) -> MirrorResult<()> {
        let initial = initial.into();
        if matches!(initial, Value::Null) {
            return Ok(());
        }
        // Validate up front so a bad initial value leaves no partial batch.
        initial.validate()?;
        {
            let mut guard = self.inner.lock().unwrap();
            let inner = &mut *guard;
            if inner.disposed {
                warn!("bootstrap after dispose does nothing");
                return Ok(());
            }
            let doc = inner.doc.clone();
            let empty = match doc.get_container(inner.root_cid.clone()) {
                Some(Container::Map(m)) => m.is_empty(),
                Some(Container::List(l)) => l.is_empty(),
                _ => false,
            };
            if !empty {
                debug!("bootstrap skipped; the root is not empty");
                return Ok(());
            }
            let Some(root) = ensure_root(inner) else {
                return Ok(());
            };
            match initial {
                Value::Map(entries) => {
                    for (key, value) in entries {
                        capture::map_insert(inner, root, &key, value)?;
                    }
                }
                Value::List(items) => {
                    for value in items {
                        capture::list_push(inner, root, value)?;
                    }
                }
                other => {
                    return Err(MirrorError::Validation {
                        path: "<root>".into(),
                        reason: format!(
                            "the initial value kind {:?} does not match the root container",
                            other.classify()
                        )
                        .into(),
                    })
                }
            }
        }
        self.commit()
    }

    /// Deep plain snapshot of the mirrored subtree. Text resolves to its
    /// string content. The returned value is owned: mutating it does not
    /// touch the mirror.
    pub fn to_value(&self) -> Value {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        if inner.disposed {
            return Value::Null;
        }
        let Some(root) = ensure_root(inner) else {
            return Value::Null;
        };
        let doc = inner.doc.clone();
        inner.store.deep_value(root, &doc)
    }

    /// Force the local tree back to the document's current state with a
    /// structural diff. Normally unnecessary — the mirror resyncs itself
    /// after rejected batches — but available to hosts that interleave
    /// imports with uncommitted local writes.
    pub fn resync(&self) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        if inner.disposed {
            return;
        }
        reconcile::resync(inner);
    }

    /// Register a callback fired after every commit and after every
    /// reconciled remote event. Callbacks run outside the mirror's lock;
    /// writes they make during a [`ChangeSource::Remote`] notification are
    /// suppressed to prevent feedback loops.
    pub fn subscribe(&self, callback: impl Fn(ChangeSource) + Send + Sync + 'static) -> SubId {
        let mut guard = self.inner.lock().unwrap();
        let id = SubId(guard.next_sub_id);
        guard.next_sub_id += 1;
        guard.subscribers.push((id, Arc::new(callback)));
        id
    }

    /// Remove a callback registered with [`subscribe`](Mirror::subscribe).
    pub fn unsubscribe(&self, id: SubId) {
        let mut guard = self.inner.lock().unwrap();
        guard.subscribers.retain(|(sub_id, _)| *sub_id != id);
    }

    /// Tear the mirror down: commit the pending batch best-effort, drop
    /// the event subscription, and purge the registry. Idempotent; writes
    /// through outstanding handles are dropped with a warning afterwards.
    pub fn dispose(&self) {
        if let Err(err) = self.commit() {
            warn!("commit during dispose failed: {err}");
        }
        let mut guard = self.inner.lock().unwrap();
        if guard.disposed {
            return;
        }
        let inner = &mut *guard;
        inner.disposed = true;
        inner.sub = None;
        inner.root_node = None;
        inner.store.clear();
        inner.registry.clear();
        inner.subscribers.clear();
    }
}

impl Drop for Mirror {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Mirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Mirror {{ origin: {:?} }}", self.origin)
    }
}
