//! Virtual objects: durable state behind ordinary-looking handles.
//!
//! A kind is declared once with its init function and method behavior;
//! each instance then keeps its properties as serialized capability data
//! in a vatstore, paged through a bounded LRU cache. Handles stay valid
//! across eviction and restart because identity lives in the reference,
//! not in memory: a cohort with no live representative is reanimated on
//! first use, and at most one representative exists per instance.
//!
//! Collection is explicit. The manager reports every reachability and
//! recognition transition to its [`Collector`], and [`VirtualObjectManager::collect`]
//! deletes exactly the instances that nothing represents, references, or
//! protects.

pub mod collector;
pub mod error;
pub mod kind;
pub mod manager;
pub mod weak;

mod cache;

pub use collector::{Collector, RefCountCollector};
pub use error::VobjError;
pub use kind::{
    Behavior, DurableKindDescriptor, FinishFn, InitFn, Kind, KindHandle, KindId, KindSpec,
    MethodFn, MethodTable,
};
pub use manager::{FacetSet, MethodCtx, ObjectRef, VirtualObjectManager, VomConfig};
pub use weak::{WeakMapId, WeakSetId};
