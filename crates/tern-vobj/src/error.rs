use thiserror::Error;

use tern_marshal::{BaseRef, MarshalError, Vref};
use tern_store::StoreError;

use crate::kind::KindId;

/// Failures of the virtual object layer. Most variants are vat-code bugs
/// (naming a property that does not exist, breaking durability, forging a
/// second representative) and abort the operation that hit them; nothing
/// here is retried.
#[derive(Debug, Error)]
pub enum VobjError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("marshal error: {0}")]
    Marshal(#[from] MarshalError),
    #[error("kind {0} is not defined in this incarnation")]
    UnknownKind(KindId),
    #[error("kind {0} is already defined in this incarnation")]
    KindAlreadyDefined(KindId),
    #[error("no persisted descriptor for kind {0}")]
    UnknownKindDescriptor(KindId),
    #[error("'{0}' is not a kind handle")]
    UnknownKindHandle(Vref),
    #[error("kind handles are not initialized for this store")]
    KindHandlesUninitialized,
    #[error("{0} already has a live representative")]
    AlreadyRepresented(BaseRef),
    #[error("no stored state for {0}")]
    StateNotFound(BaseRef),
    #[error("{base} has no property '{prop}'")]
    UnknownProperty { base: BaseRef, prop: String },
    #[error("kind '{tag}' has no method '{method}'")]
    MethodNotFound { tag: String, method: String },
    #[error("kind '{tag}' has no facet '{facet}'")]
    UnknownFacet { tag: String, facet: String },
    #[error("kind '{tag}' is faceted; invoke a named facet instead of the cohort")]
    FacetRequired { tag: String },
    #[error("durable {base} would hold non-durable slot {slot} in property '{prop}'")]
    DurabilityViolation { base: BaseRef, prop: String, slot: Vref },
    #[error("facet names for kind {kind} do not match its established set (expected {expected:?}, got {got:?})")]
    FacetNamesMismatch { kind: KindId, expected: Option<Vec<String>>, got: Option<Vec<String>> },
    #[error("faceted kind '{tag}' needs at least two facets, got {count}")]
    NotEnoughFacets { tag: String, count: usize },
    #[error("durable kinds never redefined after restart: {}", .tags.join(", "))]
    DurableKindsNotReconnected { tags: Vec<String> },
    #[error("weak collection {0} does not exist (or was disposed)")]
    UnknownCollection(u64),
    #[error("'{0}' does not designate a virtual object")]
    NotVirtual(Vref),
    #[error("corrupt record at '{key}': {detail}")]
    CorruptRecord { key: String, detail: String },
    #[error("{0}")]
    MethodFailed(String),
}

impl VobjError {
    /// Failure raised from inside a kind's method body.
    pub fn method(detail: impl Into<String>) -> Self {
        VobjError::MethodFailed(detail.into())
    }
}
