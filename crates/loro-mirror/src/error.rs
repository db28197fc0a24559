use loro::LoroError;
use thiserror::Error;

/// The result type used throughout this crate.
pub type MirrorResult<T> = Result<T, MirrorError>;

/// Errors surfaced by the mirror.
///
/// Lifecycle violations (writing through a handle whose container was
/// replaced, or after [`Mirror::dispose`](crate::Mirror::dispose)) are not
/// errors: they are logged and the write is dropped.
#[derive(Error, Debug, PartialEq)]
pub enum MirrorError {
    /// The assigned value cannot be represented in a shared document.
    ///
    /// `path` points at the offending node, slash-separated from the root
    /// container name (e.g. `data/xs/1`).
    #[error("Unsupported value at \"{path}\": {reason}")]
    Validation {
        /// Slash-separated path to the offending value.
        path: String,
        /// Why the value was rejected.
        reason: Box<str>,
    },
    /// An already-parented shared container was assigned somewhere else.
    ///
    /// A shared container lives under exactly one parent. Build a fresh
    /// value instead of moving an attached one.
    #[error("The container at \"{path}\" already has a parent and cannot be attached again")]
    Reparent {
        /// Slash-separated path of the rejected assignment.
        path: String,
    },
    /// Index out of bound for a list operation.
    #[error("Index out of bound. The given pos is {pos}, but the length is {len}")]
    OutOfBound {
        /// The requested position.
        pos: usize,
        /// The list length at the time of the call.
        len: usize,
    },
    /// An internal inconsistency between captured ops and the pre-batch
    /// state. This indicates a bug; the whole batch is discarded.
    #[error("Planner invariant violated: {0}")]
    PlannerInvariant(Box<str>),
    /// An error propagated unchanged from the underlying CRDT.
    #[error("{0}")]
    Loro(#[from] LoroError),
}
