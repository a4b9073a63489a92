use std::collections::BTreeMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use tern_marshal::{Value, Vref};

use crate::error::VobjError;
use crate::manager::MethodCtx;

/// Identifier of a defined kind. Durable kinds keep the same id across
/// incarnations through their persisted descriptor.
pub type KindId = u64;

/// Builds an instance's initial property set from constructor arguments.
pub type InitFn = Box<dyn Fn(Value) -> Result<BTreeMap<String, Value>, VobjError>>;

/// One method body. The context gives property access on the target
/// instance and, through it, the whole manager for nested operations.
pub type MethodFn = Rc<dyn Fn(&mut MethodCtx<'_>, Value) -> Result<Value, VobjError>>;

/// Post-construction hook, for wiring cycles that need the finished
/// object.
pub type FinishFn = Box<dyn Fn(&mut MethodCtx<'_>) -> Result<(), VobjError>>;

/// Named methods of one facet.
#[derive(Clone, Default)]
pub struct MethodTable {
    methods: BTreeMap<String, MethodFn>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method<F>(mut self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut MethodCtx<'_>, Value) -> Result<Value, VobjError> + 'static,
    {
        self.methods.insert(name.into(), Rc::new(body));
        self
    }

    pub(crate) fn get(&self, name: &str) -> Option<&MethodFn> {
        self.methods.get(name)
    }
}

/// Facet shape of a kind, declared once at definition time: either a
/// single method-bearing handle, or several named facets sharing one
/// instance's state.
pub enum Behavior {
    One(MethodTable),
    Many(BTreeMap<String, MethodTable>),
}

impl Behavior {
    /// Facet names in their canonical (sorted) order; `None` for a
    /// single-facet kind.
    pub(crate) fn facet_names(&self) -> Option<Vec<String>> {
        match self {
            Behavior::One(_) => None,
            Behavior::Many(facets) => Some(facets.keys().cloned().collect()),
        }
    }
}

/// Everything needed to define a kind.
pub struct KindSpec {
    pub tag: String,
    pub init: InitFn,
    pub behavior: Behavior,
    pub finish: Option<FinishFn>,
}

impl KindSpec {
    /// Single-facet kind: one handle carrying all methods.
    pub fn single<F>(tag: impl Into<String>, init: F, methods: MethodTable) -> Self
    where
        F: Fn(Value) -> Result<BTreeMap<String, Value>, VobjError> + 'static,
    {
        Self { tag: tag.into(), init: Box::new(init), behavior: Behavior::One(methods), finish: None }
    }

    /// Multi-facet kind: named handles sharing one state. Needs at least
    /// two facets.
    pub fn faceted<F>(
        tag: impl Into<String>,
        init: F,
        facets: BTreeMap<String, MethodTable>,
    ) -> Self
    where
        F: Fn(Value) -> Result<BTreeMap<String, Value>, VobjError> + 'static,
    {
        Self {
            tag: tag.into(),
            init: Box::new(init),
            behavior: Behavior::Many(facets),
            finish: None,
        }
    }

    pub fn with_finish<F>(mut self, finish: F) -> Self
    where
        F: Fn(&mut MethodCtx<'_>) -> Result<(), VobjError> + 'static,
    {
        self.finish = Some(Box::new(finish));
        self
    }
}

/// Installed definition of a kind.
pub(crate) struct KindDef {
    pub(crate) id: KindId,
    pub(crate) tag: String,
    pub(crate) durable: bool,
    pub(crate) init: InitFn,
    pub(crate) behavior: Behavior,
    pub(crate) finish: Option<FinishFn>,
}

impl KindDef {
    /// Facet index for a name, per the canonical sorted order.
    pub(crate) fn facet_index(&self, name: &str) -> Option<u32> {
        match &self.behavior {
            Behavior::One(_) => None,
            Behavior::Many(facets) => {
                facets.keys().position(|key| key == name).map(|index| index as u32)
            }
        }
    }

    /// Method table addressed by a facet choice.
    pub(crate) fn table_for(&self, facet: Option<u32>) -> Result<&MethodTable, VobjError> {
        match (&self.behavior, facet) {
            (Behavior::One(table), None) => Ok(table),
            (Behavior::One(_), Some(index)) => Err(VobjError::UnknownFacet {
                tag: self.tag.clone(),
                facet: format!("#{index}"),
            }),
            (Behavior::Many(_), None) => Err(VobjError::FacetRequired { tag: self.tag.clone() }),
            (Behavior::Many(facets), Some(index)) => {
                facets.values().nth(index as usize).ok_or_else(|| VobjError::UnknownFacet {
                    tag: self.tag.clone(),
                    facet: format!("#{index}"),
                })
            }
        }
    }
}

/// Token for a kind defined in this incarnation; instances are made
/// through the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Kind {
    pub(crate) id: KindId,
}

impl Kind {
    pub fn id(&self) -> KindId {
        self.id
    }
}

/// Handle to a durable kind. The handle itself is a durable virtual
/// object, so it can be stored in durable state and recovered after
/// restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindHandle {
    pub(crate) vref: Vref,
}

impl KindHandle {
    pub fn vref(&self) -> &Vref {
        &self.vref
    }
}

/// Persisted identity of a durable kind, stored under `vom.kind.<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableKindDescriptor {
    pub kind_id: KindId,
    pub tag: String,
}
