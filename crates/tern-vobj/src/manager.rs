use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::rc::Rc;

use tern_marshal::{
    BaseRef, CapData, MarshalError, Value, Vref, from_cbor_slice, serialize, to_canonical_cbor,
    unserialize,
};
use tern_store::DynVatstore;

use crate::cache::{InnerSelf, RawState, StateStore, VoCache};
use crate::collector::Collector;
use crate::error::VobjError;
use crate::kind::{
    Behavior, DurableKindDescriptor, Kind, KindDef, KindHandle, KindId, KindSpec,
};
use crate::weak::{WeakMapState, WeakSetState};

const KIND_DESCRIPTOR_PREFIX: &str = "vom.kind.";
const KIND_HANDLE_KIND_KEY: &str = "vom.kindHandleKind";
const DEFAULT_CACHE_SIZE: usize = 64;

/// Tuning knobs for the manager.
#[derive(Debug, Clone)]
pub struct VomConfig {
    /// Upper bound on resident inner selves before LRU eviction. Clamped
    /// to at least 1.
    pub cache_size: usize,
}

impl Default for VomConfig {
    fn default() -> Self {
        Self { cache_size: DEFAULT_CACHE_SIZE }
    }
}

/// Live handle to a virtual object, or to one facet of a faceted cohort.
///
/// Handles are plain tokens: equality is identity of the underlying
/// baseRef (plus facet), which stays valid across eviction and
/// reanimation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectRef {
    pub(crate) base: BaseRef,
    pub(crate) facet: Option<u32>,
}

impl ObjectRef {
    pub fn base_ref(&self) -> BaseRef {
        self.base
    }

    pub fn facet(&self) -> Option<u32> {
        self.facet
    }

    pub fn vref(&self) -> Vref {
        match self.facet {
            Some(facet) => self.base.facet_vref(facet),
            None => self.base.vref(),
        }
    }

    /// Handle for a reference received from elsewhere. Fails for plain
    /// exports and imports, which have no virtual object behind them.
    pub fn from_vref(vref: &Vref) -> Result<Self, VobjError> {
        match vref {
            Vref::Virtual { base, facet } => Ok(Self { base: *base, facet: *facet }),
            other => Err(VobjError::NotVirtual(other.clone())),
        }
    }
}

/// The exposed facade of a constructed instance: one handle for a
/// single-facet kind, a named cohort for a faceted one.
#[derive(Debug, Clone)]
pub enum FacetSet {
    One(ObjectRef),
    Many(BTreeMap<String, ObjectRef>),
}

impl FacetSet {
    pub fn single(&self) -> Option<&ObjectRef> {
        match self {
            FacetSet::One(handle) => Some(handle),
            FacetSet::Many(_) => None,
        }
    }

    pub fn facet(&self, name: &str) -> Option<&ObjectRef> {
        match self {
            FacetSet::One(_) => None,
            FacetSet::Many(facets) => facets.get(name),
        }
    }
}

/// How a materialization retains the representative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Retain {
    /// Normal path: register the cohort as represented.
    Permanent,
    /// Consistency probe: build everything, register nothing.
    ProForma,
}

/// State and self access handed to a kind's method bodies and finish
/// hooks. For faceted kinds the context targets the cohort; use
/// [`MethodCtx::facet`] to address a specific handle.
pub struct MethodCtx<'a> {
    pub(crate) mgr: &'a mut VirtualObjectManager,
    pub(crate) target: ObjectRef,
}

impl MethodCtx<'_> {
    pub fn self_ref(&self) -> ObjectRef {
        self.target.clone()
    }

    pub fn get(&mut self, prop: &str) -> Result<Value, VobjError> {
        let target = self.target.clone();
        self.mgr.get_property(&target, prop)
    }

    pub fn set(&mut self, prop: &str, value: Value) -> Result<(), VobjError> {
        let target = self.target.clone();
        self.mgr.set_property(&target, prop, value)
    }

    /// Sibling facet of this instance, sharing its state.
    pub fn facet(&self, name: &str) -> Result<ObjectRef, VobjError> {
        let def = self.mgr.kind_def_for_base(&self.target.base)?;
        let index = def.facet_index(name).ok_or_else(|| VobjError::UnknownFacet {
            tag: def.tag.clone(),
            facet: name.to_string(),
        })?;
        Ok(ObjectRef { base: self.target.base, facet: Some(index) })
    }

    /// Full manager access, for methods that construct instances, touch
    /// weak collections, or invoke other objects.
    pub fn manager(&mut self) -> &mut VirtualObjectManager {
        self.mgr
    }
}

/// The virtual object manager: kind definitions, instance construction,
/// paged property state, representative identity, and explicit
/// collection.
pub struct VirtualObjectManager {
    pub(crate) store: DynVatstore,
    state_store: StateStore,
    pub(crate) collector: Box<dyn Collector>,
    cache: VoCache,
    kinds: HashMap<KindId, Rc<KindDef>>,
    instance_counters: HashMap<KindId, u64>,
    /// Cohorts with a live representative. At most one registration per
    /// baseRef; a second materialization attempt is a bug.
    reps: HashSet<BaseRef>,
    /// Cohorts released since the last collect pass.
    released: BTreeSet<Vref>,
    kind_handle_kind: Option<KindId>,
    kind_handles: HashMap<Vref, DurableKindDescriptor>,
    /// Durable kinds redefined this incarnation.
    reconnected: BTreeSet<KindId>,
    next_kind_id: KindId,
    pub(crate) weak_maps: HashMap<u64, WeakMapState>,
    pub(crate) weak_sets: HashMap<u64, WeakSetState>,
    pub(crate) next_collection_id: u64,
}

impl VirtualObjectManager {
    /// Build a manager over `store`. Kind id allocation resumes past every
    /// id already persisted, so fresh kinds never collide with recovered
    /// durable ones.
    pub fn new(
        store: DynVatstore,
        collector: Box<dyn Collector>,
        config: VomConfig,
    ) -> Result<Self, VobjError> {
        let mut next_kind_id = 1;
        if let Some(bytes) = store.get(KIND_HANDLE_KIND_KEY)? {
            let id = parse_kind_id(KIND_HANDLE_KIND_KEY, &bytes)?;
            next_kind_id = next_kind_id.max(id + 1);
        }
        let mut cursor = String::new();
        while let Some((key, bytes)) = store.get_after(&cursor, KIND_DESCRIPTOR_PREFIX)? {
            let descriptor = decode_descriptor(&key, &bytes)?;
            next_kind_id = next_kind_id.max(descriptor.kind_id + 1);
            cursor = key;
        }

        Ok(Self {
            state_store: StateStore::new(store.clone()),
            cache: VoCache::new(config.cache_size.max(1), StateStore::new(store.clone())),
            store,
            collector,
            kinds: HashMap::new(),
            instance_counters: HashMap::new(),
            reps: HashSet::new(),
            released: BTreeSet::new(),
            kind_handle_kind: None,
            kind_handles: HashMap::new(),
            reconnected: BTreeSet::new(),
            next_kind_id,
            weak_maps: HashMap::new(),
            weak_sets: HashMap::new(),
            next_collection_id: 1,
        })
    }

    /// Establish (or recover) the kind that kind handles themselves belong
    /// to. Must run before any durable kind work; the chosen id is
    /// persisted so handle references stay valid across restarts.
    pub fn initialize_kind_handle_kind(&mut self) -> Result<(), VobjError> {
        let id = match self.store.get(KIND_HANDLE_KIND_KEY)? {
            Some(bytes) => parse_kind_id(KIND_HANDLE_KIND_KEY, &bytes)?,
            None => {
                let id = self.allocate_kind_id();
                self.store.set(KIND_HANDLE_KIND_KEY, id.to_string().as_bytes())?;
                id
            }
        };
        log::debug!("vo kind handles are kind {id}");
        self.kind_handle_kind = Some(id);
        self.collector.register_kind(id, true);
        Ok(())
    }

    /// Mint a handle for a durable kind to be defined now or after a
    /// restart. The `{kind_id, tag}` descriptor is persisted immediately.
    pub fn make_kind_handle(&mut self, tag: impl Into<String>) -> Result<KindHandle, VobjError> {
        let handle_kind = self.kind_handle_kind.ok_or(VobjError::KindHandlesUninitialized)?;
        let kind_id = self.allocate_kind_id();
        let descriptor = DurableKindDescriptor { kind_id, tag: tag.into() };
        let bytes = encode_descriptor(&descriptor)?;
        self.store.set(&descriptor_key(kind_id), &bytes)?;
        let vref = BaseRef::new(handle_kind, kind_id).vref();
        log::debug!("vo kind handle {vref} for '{}'", descriptor.tag);
        self.kind_handles.insert(vref.clone(), descriptor);
        Ok(KindHandle { vref })
    }

    /// Resolve a reference back into a durable kind handle, loading its
    /// persisted descriptor if this incarnation has not seen it yet. This
    /// is the restart path: pull a handle reference out of recovered
    /// state, resolve it here, then pass it to [`Self::define_durable_kind`].
    pub fn kind_handle(&mut self, vref: &Vref) -> Result<KindHandle, VobjError> {
        let handle_kind = self.kind_handle_kind.ok_or(VobjError::KindHandlesUninitialized)?;
        let base = vref.base_ref().ok_or_else(|| VobjError::NotVirtual(vref.clone()))?;
        if base.kind != handle_kind {
            return Err(VobjError::UnknownKindHandle(vref.clone()));
        }
        if !self.kind_handles.contains_key(&base.vref()) {
            self.reanimate_kind_handle(&base)?;
        }
        Ok(KindHandle { vref: base.vref() })
    }

    /// Tag recorded in a handle's persisted descriptor.
    pub fn kind_tag(&self, handle: &KindHandle) -> Result<&str, VobjError> {
        self.kind_handles
            .get(&handle.vref)
            .map(|descriptor| descriptor.tag.as_str())
            .ok_or_else(|| VobjError::UnknownKindHandle(handle.vref.clone()))
    }

    /// Define a non-durable kind under a fresh id. Instances do not
    /// survive restart.
    pub fn define_kind(&mut self, spec: KindSpec) -> Result<Kind, VobjError> {
        let id = self.allocate_kind_id();
        self.install_kind(id, spec, false)
    }

    /// Define (or, after restart, redefine) the durable kind behind
    /// `handle`. The kind id comes from the persisted descriptor, and the
    /// instance counter resumes past every persisted instance.
    pub fn define_durable_kind(
        &mut self,
        handle: &KindHandle,
        spec: KindSpec,
    ) -> Result<Kind, VobjError> {
        let descriptor = self
            .kind_handles
            .get(&handle.vref)
            .cloned()
            .ok_or_else(|| VobjError::UnknownKindHandle(handle.vref.clone()))?;
        let kind = self.install_kind(descriptor.kind_id, spec, true)?;
        self.resume_instance_counter(descriptor.kind_id)?;
        self.reconnected.insert(descriptor.kind_id);
        Ok(kind)
    }

    /// Fail, naming every missing tag, if storage holds a durable kind
    /// descriptor that was never redefined this incarnation. Run after
    /// restart wiring, before accepting traffic.
    pub fn insist_all_durable_kinds_reconnected(&self) -> Result<(), VobjError> {
        let mut missing = Vec::new();
        let mut cursor = String::new();
        while let Some((key, bytes)) = self.store.get_after(&cursor, KIND_DESCRIPTOR_PREFIX)? {
            let descriptor = decode_descriptor(&key, &bytes)?;
            if !self.reconnected.contains(&descriptor.kind_id) {
                missing.push(descriptor.tag);
            }
            cursor = key;
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(VobjError::DurableKindsNotReconnected { tags: missing })
        }
    }

    /// Construct an instance: run `init`, persist-count every capability
    /// its initial state holds, register the inner self dirty, build the
    /// representative, and run the optional finish hook.
    pub fn make_instance(&mut self, kind: Kind, args: Value) -> Result<FacetSet, VobjError> {
        let def = self.kind_def(kind.id)?;
        let instance = self.next_instance(def.id);
        let base = BaseRef::new(def.id, instance);
        log::debug!("vo make {base} ('{}')", def.tag);

        let initial = (def.init)(args)?;
        let mut raw = RawState::new();
        for (prop, value) in initial {
            let data = serialize(&value)?;
            if def.durable {
                self.insist_durable_slots(&base, &prop, &data)?;
            }
            raw.insert(prop, data);
        }
        // count references only once the whole property set is valid
        for data in raw.values() {
            for slot in &data.slots {
                self.collector.add_reachable_vref(slot);
            }
        }

        let idx = self.cache.remember(InnerSelf::resident(base, raw))?;
        self.cache.mark_dirty(idx);

        let facets = self.materialize(&def, &base, Retain::Permanent)?;
        if let Some(finish) = def.finish.as_ref() {
            let mut ctx = MethodCtx { mgr: self, target: ObjectRef { base, facet: None } };
            finish(&mut ctx)?;
        }
        Ok(facets)
    }

    /// Invoke a method on a handle, reanimating the cohort first if no
    /// representative is live.
    pub fn invoke(
        &mut self,
        target: &ObjectRef,
        method: &str,
        args: Value,
    ) -> Result<Value, VobjError> {
        self.ensure_represented(&target.base)?;
        let def = self.kind_def_for_base(&target.base)?;
        let body = def.table_for(target.facet)?.get(method).cloned().ok_or_else(|| {
            VobjError::MethodNotFound { tag: def.tag.clone(), method: method.to_string() }
        })?;
        let mut ctx = MethodCtx { mgr: self, target: target.clone() };
        body(&mut ctx, args)
    }

    /// Read one property, paging the state blob back in if it was
    /// evicted. Any virtual object the value references is reanimated.
    pub fn get_property(&mut self, target: &ObjectRef, prop: &str) -> Result<Value, VobjError> {
        let base = target.base;
        let idx = self.cache.lookup(&base, true)?;
        let data = {
            let state = self.cache.raw_state(idx).ok_or(VobjError::StateNotFound(base))?;
            state.get(prop).cloned().ok_or_else(|| VobjError::UnknownProperty {
                base,
                prop: prop.to_string(),
            })?
        };
        self.unserialize_value(&data)
    }

    /// Overwrite one property. The property set is fixed by `init`;
    /// writing an undeclared property is an error. Reference counts move
    /// by the slot difference between old and new value, and durable
    /// kinds re-check durability of every referenced slot.
    pub fn set_property(
        &mut self,
        target: &ObjectRef,
        prop: &str,
        value: Value,
    ) -> Result<(), VobjError> {
        let base = target.base;
        let durable = self.kind_def_for_base(&base)?.durable;
        let idx = self.cache.lookup(&base, true)?;
        let before = {
            let state = self.cache.raw_state(idx).ok_or(VobjError::StateNotFound(base))?;
            state.get(prop).cloned().ok_or_else(|| VobjError::UnknownProperty {
                base,
                prop: prop.to_string(),
            })?
        };
        let after = serialize(&value)?;
        if durable {
            self.insist_durable_slots(&base, prop, &after)?;
        }
        self.collector.update_reference_counts(&before.slots, &after.slots);
        let state = self.cache.raw_state_mut(idx).ok_or(VobjError::StateNotFound(base))?;
        state.insert(prop.to_string(), after);
        self.cache.mark_dirty(idx);
        Ok(())
    }

    /// Decode a wire value, reanimating every referenced virtual object
    /// that has no live representative so identity is ready before the
    /// value is used.
    pub fn unserialize_value(&mut self, data: &CapData) -> Result<Value, VobjError> {
        for slot in &data.slots {
            self.ensure_known(slot)?;
        }
        Ok(unserialize(data)?)
    }

    /// Rebuild the load path for `vref` without retaining a
    /// representative: the inner self is looked up (and created) exactly
    /// as in a real reanimation, but representative accounting stays
    /// untouched, so this is safe on an already-represented cohort.
    pub fn reanimate_pro_forma(&mut self, vref: &Vref) -> Result<(), VobjError> {
        let base = vref.base_ref().ok_or_else(|| VobjError::NotVirtual(vref.clone()))?;
        if self.kind_handle_kind == Some(base.kind) {
            if !self.kind_handles.contains_key(&base.vref()) {
                self.reanimate_kind_handle(&base)?;
            }
            return Ok(());
        }
        self.reanimate(&base, Retain::ProForma)?;
        Ok(())
    }

    /// Drop the live-representative registration for `target`'s cohort.
    /// Releasing any facet releases the whole cohort; once its persisted
    /// references are gone too, [`Self::collect`] may delete it.
    pub fn release(&mut self, target: &ObjectRef) {
        let base = target.base;
        if !self.reps.remove(&base) {
            return;
        }
        if let Some(idx) = self.cache.index_of(&base) {
            self.cache.drop_rep_count(idx);
        }
        self.released.insert(base.vref());
        log::trace!("vo release {base}");
    }

    /// Delete every virtual object that is neither represented nor
    /// reachable from persisted state, cascading through references the
    /// deleted state held. Returns how many objects were deleted.
    ///
    /// Starts with a cache flush so deletion sees current state even for
    /// objects created since the last flush.
    pub fn collect(&mut self) -> Result<usize, VobjError> {
        self.cache.flush()?;
        let mut deleted = 0;
        loop {
            let mut candidates: BTreeSet<Vref> = self.collector.drain_dead().into_iter().collect();
            candidates.append(&mut std::mem::take(&mut self.released));
            if candidates.is_empty() {
                break;
            }
            for vref in candidates {
                let Some(base) = vref.base_ref() else { continue };
                if self.kind_handle_kind == Some(base.kind) {
                    // handles live as long as their descriptor
                    continue;
                }
                if self.reps.contains(&base) || self.collector.is_reachable(&vref) {
                    continue;
                }
                if self.delete_stored_object(&base)? {
                    deleted += 1;
                }
            }
        }
        if deleted > 0 {
            log::debug!("vo collect deleted {deleted} objects");
        }
        Ok(deleted)
    }

    /// Write every dirty cached state to the store without evicting, for
    /// controlled shutdown.
    pub fn flush_cache(&mut self) -> Result<(), VobjError> {
        self.cache.flush()
    }

    pub fn resident_count(&self) -> usize {
        self.cache.len()
    }

    pub fn dirty_count(&self) -> usize {
        self.cache.dirty_count()
    }

    pub fn is_represented(&self, base: &BaseRef) -> bool {
        self.reps.contains(base)
    }

    /// Representatives handed out against the currently resident record
    /// for `base`; zero when the record is absent or evicted.
    pub fn rep_count(&self, base: &BaseRef) -> u32 {
        self.cache.index_of(base).map(|idx| self.cache.rep_count(idx)).unwrap_or(0)
    }

    pub fn collector(&self) -> &dyn Collector {
        self.collector.as_ref()
    }

    pub fn collector_mut(&mut self) -> &mut dyn Collector {
        self.collector.as_mut()
    }

    fn allocate_kind_id(&mut self) -> KindId {
        let id = self.next_kind_id;
        self.next_kind_id += 1;
        id
    }

    fn next_instance(&mut self, kind: KindId) -> u64 {
        let counter = self.instance_counters.entry(kind).or_insert(1);
        let instance = *counter;
        *counter += 1;
        instance
    }

    fn install_kind(&mut self, id: KindId, spec: KindSpec, durable: bool) -> Result<Kind, VobjError> {
        if self.kinds.contains_key(&id) {
            return Err(VobjError::KindAlreadyDefined(id));
        }
        if let Behavior::Many(facets) = &spec.behavior {
            if facets.len() < 2 {
                return Err(VobjError::NotEnoughFacets {
                    tag: spec.tag.clone(),
                    count: facets.len(),
                });
            }
        }
        let names = spec.behavior.facet_names();
        self.collector.check_or_acquire_facet_names(id, names.as_deref())?;
        self.collector.register_kind(id, durable);
        log::debug!("vo kind {id} '{}' defined (durable={durable})", spec.tag);
        self.kinds.insert(
            id,
            Rc::new(KindDef {
                id,
                tag: spec.tag,
                durable,
                init: spec.init,
                behavior: spec.behavior,
                finish: spec.finish,
            }),
        );
        Ok(Kind { id })
    }

    fn resume_instance_counter(&mut self, kind_id: KindId) -> Result<(), VobjError> {
        let prefix = format!("vom.o+{kind_id}/");
        let mut max_instance = 0u64;
        let mut cursor = String::new();
        while let Some((key, _)) = self.store.get_after(&cursor, &prefix)? {
            if let Some(rest) = key.strip_prefix(&prefix) {
                if let Ok(instance) = rest.parse::<u64>() {
                    max_instance = max_instance.max(instance);
                }
            }
            cursor = key;
        }
        self.instance_counters.insert(kind_id, max_instance + 1);
        Ok(())
    }

    fn kind_def(&self, id: KindId) -> Result<Rc<KindDef>, VobjError> {
        self.kinds.get(&id).cloned().ok_or(VobjError::UnknownKind(id))
    }

    pub(crate) fn kind_def_for_base(&self, base: &BaseRef) -> Result<Rc<KindDef>, VobjError> {
        self.kind_def(base.kind)
    }

    fn ensure_represented(&mut self, base: &BaseRef) -> Result<(), VobjError> {
        if self.reps.contains(base) || self.kind_handle_kind == Some(base.kind) {
            return Ok(());
        }
        self.reanimate(base, Retain::Permanent)?;
        Ok(())
    }

    /// Rebuild the representative for a cohort known only by reference.
    /// State is not loaded here; the first property access pages it in.
    fn reanimate(&mut self, base: &BaseRef, retain: Retain) -> Result<FacetSet, VobjError> {
        let def = self.kind_def_for_base(base)?;
        log::trace!("vo reanimate {base} ({retain:?})");
        self.cache.lookup(base, false)?;
        self.materialize(&def, base, retain)
    }

    fn materialize(
        &mut self,
        def: &Rc<KindDef>,
        base: &BaseRef,
        retain: Retain,
    ) -> Result<FacetSet, VobjError> {
        if retain == Retain::Permanent {
            if self.reps.contains(base) {
                return Err(VobjError::AlreadyRepresented(*base));
            }
            if let Some(idx) = self.cache.index_of(base) {
                self.cache.bump_rep_count(idx);
            }
            self.reps.insert(*base);
            self.released.remove(&base.vref());
        }
        let facets = match &def.behavior {
            Behavior::One(_) => FacetSet::One(ObjectRef { base: *base, facet: None }),
            Behavior::Many(tables) => FacetSet::Many(
                tables
                    .keys()
                    .enumerate()
                    .map(|(index, name)| {
                        (name.clone(), ObjectRef { base: *base, facet: Some(index as u32) })
                    })
                    .collect(),
            ),
        };
        Ok(facets)
    }

    fn ensure_known(&mut self, vref: &Vref) -> Result<(), VobjError> {
        let Some(base) = vref.base_ref() else { return Ok(()) };
        if self.kind_handle_kind == Some(base.kind) {
            if !self.kind_handles.contains_key(&base.vref()) {
                self.reanimate_kind_handle(&base)?;
            }
            return Ok(());
        }
        if !self.reps.contains(&base) {
            self.reanimate(&base, Retain::Permanent)?;
        }
        Ok(())
    }

    fn reanimate_kind_handle(&mut self, base: &BaseRef) -> Result<(), VobjError> {
        // handle instance id doubles as the kind id it stands for
        let kind_id = base.instance;
        let key = descriptor_key(kind_id);
        let bytes = self.store.get(&key)?.ok_or(VobjError::UnknownKindDescriptor(kind_id))?;
        let descriptor = decode_descriptor(&key, &bytes)?;
        log::trace!("vo reanimate kind handle {base} ('{}')", descriptor.tag);
        self.kind_handles.insert(base.vref(), descriptor);
        Ok(())
    }

    fn insist_durable_slots(
        &self,
        base: &BaseRef,
        prop: &str,
        data: &CapData,
    ) -> Result<(), VobjError> {
        for slot in &data.slots {
            if !self.collector.is_durable(slot) {
                return Err(VobjError::DurabilityViolation {
                    base: *base,
                    prop: prop.to_string(),
                    slot: slot.clone(),
                });
            }
        }
        Ok(())
    }

    /// Delete one object's persisted state, decrementing the reachable
    /// count of every slot it held. Returns false when the state was
    /// already gone (deletion cascades can revisit a baseRef).
    fn delete_stored_object(&mut self, base: &BaseRef) -> Result<bool, VobjError> {
        self.cache.discard(base);
        let Some(state) = self.state_store.fetch(base)? else {
            return Ok(false);
        };
        for data in state.values() {
            for slot in &data.slots {
                self.collector.remove_reachable_vref(slot);
            }
        }
        self.state_store.remove(base)?;
        log::trace!("vo delete {base}");
        Ok(true)
    }
}

fn descriptor_key(kind_id: KindId) -> String {
    format!("{KIND_DESCRIPTOR_PREFIX}{kind_id}")
}

fn encode_descriptor(descriptor: &DurableKindDescriptor) -> Result<Vec<u8>, VobjError> {
    Ok(to_canonical_cbor(descriptor).map_err(MarshalError::from)?)
}

fn decode_descriptor(key: &str, bytes: &[u8]) -> Result<DurableKindDescriptor, VobjError> {
    from_cbor_slice(bytes)
        .map_err(|err| VobjError::CorruptRecord { key: key.to_string(), detail: err.to_string() })
}

fn parse_kind_id(key: &str, bytes: &[u8]) -> Result<KindId, VobjError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|text| text.parse::<KindId>().ok())
        .ok_or_else(|| VobjError::CorruptRecord {
            key: key.to_string(),
            detail: "expected a decimal kind id".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tern_store::{MemVatstore, Vatstore};

    use crate::collector::RefCountCollector;
    use crate::kind::MethodTable;

    fn manager_over(store: MemVatstore) -> VirtualObjectManager {
        VirtualObjectManager::new(
            Arc::new(store),
            Box::new(RefCountCollector::new()),
            VomConfig { cache_size: 2 },
        )
        .unwrap()
    }

    fn manager() -> VirtualObjectManager {
        manager_over(MemVatstore::new())
    }

    fn counter_spec() -> KindSpec {
        KindSpec::single(
            "counter",
            |args| {
                Ok(BTreeMap::from([(
                    "count".to_string(),
                    Value::Int(args.as_int().unwrap_or(0)),
                )]))
            },
            MethodTable::new()
                .method("incr", |ctx, _args| {
                    let next = ctx.get("count")?.as_int().unwrap_or(0) + 1;
                    ctx.set("count", Value::Int(next))?;
                    Ok(Value::Int(next))
                })
                .method("read", |ctx, _args| ctx.get("count")),
        )
    }

    fn single(facets: FacetSet) -> ObjectRef {
        facets.single().cloned().expect("single-facet kind")
    }

    #[test]
    fn instances_count_independently() {
        let mut mgr = manager();
        let kind = mgr.define_kind(counter_spec()).unwrap();
        let a = single(mgr.make_instance(kind, Value::Int(0)).unwrap());
        let b = single(mgr.make_instance(kind, Value::Int(10)).unwrap());
        assert_ne!(a.vref(), b.vref());

        assert_eq!(mgr.invoke(&a, "incr", Value::Null).unwrap(), Value::Int(1));
        assert_eq!(mgr.invoke(&b, "incr", Value::Null).unwrap(), Value::Int(11));
        assert_eq!(mgr.invoke(&a, "incr", Value::Null).unwrap(), Value::Int(2));
        assert!(mgr.is_represented(&a.base_ref()));
        assert_eq!(mgr.rep_count(&a.base_ref()), 1);
    }

    #[test]
    fn state_survives_eviction() {
        let mut mgr = manager();
        let kind = mgr.define_kind(counter_spec()).unwrap();
        let a = single(mgr.make_instance(kind, Value::Int(5)).unwrap());
        assert_eq!(mgr.invoke(&a, "incr", Value::Null).unwrap(), Value::Int(6));

        // two more instances push a's state out of the size-2 cache
        let b = single(mgr.make_instance(kind, Value::Int(0)).unwrap());
        let c = single(mgr.make_instance(kind, Value::Int(0)).unwrap());
        assert_eq!(mgr.resident_count(), 2);

        assert_eq!(mgr.invoke(&a, "read", Value::Null).unwrap(), Value::Int(6));
        assert_eq!(mgr.invoke(&b, "read", Value::Null).unwrap(), Value::Int(0));
        assert_eq!(mgr.invoke(&c, "read", Value::Null).unwrap(), Value::Int(0));
    }

    #[test]
    fn undeclared_names_are_rejected() {
        let mut mgr = manager();
        let kind = mgr.define_kind(counter_spec()).unwrap();
        let handle = single(mgr.make_instance(kind, Value::Null).unwrap());

        assert!(matches!(
            mgr.get_property(&handle, "total"),
            Err(VobjError::UnknownProperty { .. }),
        ));
        assert!(matches!(
            mgr.set_property(&handle, "total", Value::Int(1)),
            Err(VobjError::UnknownProperty { .. }),
        ));
        assert!(matches!(
            mgr.invoke(&handle, "decr", Value::Null),
            Err(VobjError::MethodNotFound { .. }),
        ));
    }

    #[test]
    fn faceted_kinds_enforce_their_shape() {
        let mut mgr = manager();
        let lone = BTreeMap::from([("only".to_string(), MethodTable::new())]);
        let err = mgr
            .define_kind(KindSpec::faceted("lopsided", |_| Ok(BTreeMap::new()), lone))
            .unwrap_err();
        assert!(matches!(err, VobjError::NotEnoughFacets { count: 1, .. }));

        let facets = BTreeMap::from([
            (
                "write".to_string(),
                MethodTable::new().method("set", |ctx, args| {
                    ctx.set("n", args)?;
                    Ok(Value::Null)
                }),
            ),
            (
                "read".to_string(),
                MethodTable::new().method("get", |ctx, _args| ctx.get("n")),
            ),
        ]);
        let kind = mgr
            .define_kind(KindSpec::faceted(
                "cell",
                |_| Ok(BTreeMap::from([("n".to_string(), Value::Null)])),
                facets,
            ))
            .unwrap();
        let made = mgr.make_instance(kind, Value::Null).unwrap();
        let write = made.facet("write").cloned().unwrap();
        let read = made.facet("read").cloned().unwrap();

        mgr.invoke(&write, "set", Value::Int(9)).unwrap();
        assert_eq!(mgr.invoke(&read, "get", Value::Null).unwrap(), Value::Int(9));

        // the cohort itself carries no methods
        let cohort = ObjectRef { base: write.base_ref(), facet: None };
        assert!(matches!(
            mgr.invoke(&cohort, "get", Value::Null),
            Err(VobjError::FacetRequired { .. }),
        ));
    }

    #[test]
    fn release_and_collect_drop_unreferenced_state() {
        let store = MemVatstore::new();
        let mut mgr = manager_over(store.clone());
        let kind = mgr.define_kind(counter_spec()).unwrap();
        let handle = single(mgr.make_instance(kind, Value::Int(3)).unwrap());
        let key = format!("vom.{}", handle.base_ref());

        assert_eq!(mgr.collect().unwrap(), 0, "a represented object stays");
        assert!(store.get(&key).unwrap().is_some());

        mgr.release(&handle);
        assert!(!mgr.is_represented(&handle.base_ref()));
        assert_eq!(mgr.collect().unwrap(), 1);
        assert!(store.get(&key).unwrap().is_none());
        assert_eq!(mgr.resident_count(), 0);
    }

    #[test]
    fn stored_references_keep_objects_alive() {
        let store = MemVatstore::new();
        let mut mgr = manager_over(store.clone());
        let counter = mgr.define_kind(counter_spec()).unwrap();
        let holder = mgr
            .define_kind(KindSpec::single(
                "holder",
                |args| Ok(BTreeMap::from([("item".to_string(), args)])),
                MethodTable::new(),
            ))
            .unwrap();

        let target = single(mgr.make_instance(counter, Value::Int(0)).unwrap());
        let keeper =
            single(mgr.make_instance(holder, Value::Ref(target.vref())).unwrap());

        mgr.release(&target);
        assert_eq!(mgr.collect().unwrap(), 0, "held by keeper's state");
        assert!(store.get(&format!("vom.{}", target.base_ref())).unwrap().is_some());

        mgr.set_property(&keeper, "item", Value::Null).unwrap();
        assert_eq!(mgr.collect().unwrap(), 1);
        assert!(store.get(&format!("vom.{}", target.base_ref())).unwrap().is_none());
    }

    #[test]
    fn kind_handles_require_initialization() {
        let mut mgr = manager();
        assert!(matches!(
            mgr.make_kind_handle("anything"),
            Err(VobjError::KindHandlesUninitialized),
        ));
    }
}
