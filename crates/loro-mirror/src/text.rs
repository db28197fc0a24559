use std::sync::atomic::{AtomicU64, Ordering};

use loro::{ContainerTrait, LoroText, TextDelta};

use crate::error::MirrorResult;

static NEXT_TEXT_KEY: AtomicU64 = AtomicU64::new(0);

/// Create a new rich text handle with the given initial content.
///
/// The handle starts detached. Assigning it into a mirrored tree attaches
/// it on the next [`Mirror::commit`](crate::Mirror::commit); after that,
/// edits through any clone of the handle go straight to the document and
/// merge like any other text edits.
pub fn synced_text(initial: &str) -> SyncedText {
    let text = LoroText::new();
    if !initial.is_empty() {
        // Detached text edits are buffered and transferred on attach.
        text.insert(0, initial).expect("detached text insert");
    }
    SyncedText::new_detached(text)
}

/// A rich text handle that can live inside a mirrored tree.
///
/// Unlike maps and lists, text is not wrapped in a proxy: reads return this
/// handle itself and its content is edited through it directly. Clones share
/// identity, so assigning the same handle under two parents is rejected.
#[derive(Clone)]
pub struct SyncedText {
    key: u64,
    text: LoroText,
}

impl SyncedText {
    fn new_detached(text: LoroText) -> Self {
        Self {
            key: NEXT_TEXT_KEY.fetch_add(1, Ordering::Relaxed),
            text,
        }
    }

    pub(crate) fn from_attached(text: LoroText) -> Self {
        debug_assert!(text.is_attached());
        Self {
            key: NEXT_TEXT_KEY.fetch_add(1, Ordering::Relaxed),
            text,
        }
    }

    pub(crate) fn key(&self) -> u64 {
        self.key
    }

    /// The detached inner handle, for attaching inside a commit.
    pub(crate) fn detached_inner(&self) -> LoroText {
        self.text.clone()
    }

    // After `insert_container` the original handle stays in its detached
    // shell; the attached handler is reachable through `get_attached`.
    fn current(&self) -> LoroText {
        self.text.get_attached().unwrap_or_else(|| self.text.clone())
    }

    /// Whether this handle has been attached to a document.
    pub fn is_attached(&self) -> bool {
        self.text.get_attached().is_some()
    }

    /// Insert a string at the given unicode position.
    pub fn insert(&self, pos: usize, s: &str) -> MirrorResult<()> {
        self.current().insert(pos, s).map_err(Into::into)
    }

    /// Delete a range at the given unicode position.
    pub fn delete(&self, pos: usize, len: usize) -> MirrorResult<()> {
        self.current().delete(pos, len).map_err(Into::into)
    }

    /// Apply a quill-style delta to the text.
    pub fn apply_delta(&self, delta: &[TextDelta]) -> MirrorResult<()> {
        self.current().apply_delta(delta).map_err(Into::into)
    }

    /// The text length in unicode code points.
    pub fn len_unicode(&self) -> usize {
        self.current().len_unicode()
    }

    /// Whether the text is empty.
    pub fn is_empty(&self) -> bool {
        self.current().is_empty()
    }

    /// The underlying [`LoroText`], for APIs this wrapper does not cover
    /// (marks, cursors, ...).
    pub fn loro_text(&self) -> LoroText {
        self.current()
    }
}

impl std::fmt::Display for SyncedText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.current().to_string())
    }
}

impl std::fmt::Debug for SyncedText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_attached() {
            write!(f, "SyncedText {}", self.current().id())
        } else {
            write!(f, "SyncedText Detached")
        }
    }
}

impl PartialEq for SyncedText {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for SyncedText {}
