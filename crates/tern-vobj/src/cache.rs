use std::collections::{BTreeMap, HashMap};

use tern_marshal::{BaseRef, CapData, MarshalError, from_cbor_slice, to_canonical_cbor};
use tern_store::DynVatstore;

use crate::error::VobjError;

/// Serialized per-property state of one virtual object, as persisted.
pub(crate) type RawState = BTreeMap<String, CapData>;

pub(crate) fn state_key(base: &BaseRef) -> String {
    format!("vom.{base}")
}

/// Store adapter the cache pages through: one canonical-CBOR blob per
/// baseRef under `vom.<baseRef>`.
#[derive(Clone)]
pub(crate) struct StateStore {
    store: DynVatstore,
}

impl StateStore {
    pub(crate) fn new(store: DynVatstore) -> Self {
        Self { store }
    }

    pub(crate) fn fetch(&self, base: &BaseRef) -> Result<Option<RawState>, VobjError> {
        match self.store.get(&state_key(base))? {
            Some(bytes) => {
                let state = from_cbor_slice(&bytes).map_err(MarshalError::from)?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    pub(crate) fn persist(&self, base: &BaseRef, state: &RawState) -> Result<(), VobjError> {
        let bytes = to_canonical_cbor(state).map_err(MarshalError::from)?;
        self.store.set(&state_key(base), &bytes)?;
        Ok(())
    }

    pub(crate) fn remove(&self, base: &BaseRef) -> Result<(), VobjError> {
        self.store.delete(&state_key(base))?;
        Ok(())
    }
}

/// Residency record for one virtual object. `raw_state` is present iff the
/// state blob is in memory; `rep_count` counts representatives handed out
/// while this record has been resident.
#[derive(Debug)]
pub(crate) struct InnerSelf {
    pub(crate) base: BaseRef,
    pub(crate) raw_state: Option<RawState>,
    pub(crate) rep_count: u32,
    pub(crate) dirty: bool,
}

impl InnerSelf {
    pub(crate) fn absent(base: BaseRef) -> Self {
        Self { base, raw_state: None, rep_count: 0, dirty: false }
    }

    pub(crate) fn resident(base: BaseRef, state: RawState) -> Self {
        Self { base, raw_state: Some(state), rep_count: 0, dirty: false }
    }
}

struct Node {
    inner: InnerSelf,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Bounded LRU over [`InnerSelf`] records, linked through an arena so
/// entries are addressed by stable index while resident.
///
/// Eviction takes the tail of the recency list; a dirty entry is written
/// to the store before its state reference is dropped, and the dirty
/// counter moves exactly once per clean/dirty transition in either
/// direction.
pub(crate) struct VoCache {
    limit: usize,
    backing: StateStore,
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    table: HashMap<BaseRef, usize>,
    head: Option<usize>,
    tail: Option<usize>,
    dirty_count: usize,
}

impl VoCache {
    pub(crate) fn new(limit: usize, backing: StateStore) -> Self {
        Self {
            limit,
            backing,
            nodes: Vec::new(),
            free: Vec::new(),
            table: HashMap::new(),
            head: None,
            tail: None,
            dirty_count: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.table.len()
    }

    pub(crate) fn dirty_count(&self) -> usize {
        self.dirty_count
    }

    pub(crate) fn index_of(&self, base: &BaseRef) -> Option<usize> {
        self.table.get(base).copied()
    }

    pub(crate) fn raw_state(&self, idx: usize) -> Option<&RawState> {
        self.node(idx).inner.raw_state.as_ref()
    }

    pub(crate) fn raw_state_mut(&mut self, idx: usize) -> Option<&mut RawState> {
        self.node_mut(idx).inner.raw_state.as_mut()
    }

    pub(crate) fn rep_count(&self, idx: usize) -> u32 {
        self.node(idx).inner.rep_count
    }

    pub(crate) fn bump_rep_count(&mut self, idx: usize) {
        self.node_mut(idx).inner.rep_count += 1;
    }

    pub(crate) fn drop_rep_count(&mut self, idx: usize) {
        let inner = &mut self.node_mut(idx).inner;
        inner.rep_count = inner.rep_count.saturating_sub(1);
    }

    /// The record for `base`, created at the head if absent, relinked to
    /// most-recently-used otherwise. With `load` set, the state blob is
    /// fetched from the store when not already resident.
    ///
    /// The returned index is only valid until the next operation that can
    /// evict.
    pub(crate) fn lookup(&mut self, base: &BaseRef, load: bool) -> Result<usize, VobjError> {
        let idx = match self.table.get(base).copied() {
            Some(idx) => {
                self.refresh(idx);
                idx
            }
            None => self.remember(InnerSelf::absent(*base))?,
        };
        if load && self.node(idx).inner.raw_state.is_none() {
            let state = self.backing.fetch(base)?.ok_or(VobjError::StateNotFound(*base))?;
            self.node_mut(idx).inner.raw_state = Some(state);
        }
        Ok(idx)
    }

    /// Register a new record at the head of the recency list, then evict
    /// from the tail while over capacity. Registering an already-tracked
    /// baseRef just returns its existing record.
    pub(crate) fn remember(&mut self, inner: InnerSelf) -> Result<usize, VobjError> {
        if let Some(idx) = self.table.get(&inner.base).copied() {
            self.refresh(idx);
            return Ok(idx);
        }
        let base = inner.base;
        let node = Node { inner, prev: None, next: None };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        self.table.insert(base, idx);
        self.push_front(idx);
        self.make_room()?;
        Ok(idx)
    }

    /// Relink an existing record to most-recently-used.
    pub(crate) fn refresh(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.unlink(idx);
        self.push_front(idx);
    }

    /// Flag pending state changes. Counted once per clean-to-dirty
    /// transition.
    pub(crate) fn mark_dirty(&mut self, idx: usize) {
        let node = self.node_mut(idx);
        debug_assert!(node.inner.raw_state.is_some(), "dirty entry must be resident");
        if node.inner.dirty {
            return;
        }
        node.inner.dirty = true;
        self.dirty_count += 1;
    }

    /// Evict least-recently-used records until the cache is back within
    /// its bound, flushing dirty state first.
    pub(crate) fn make_room(&mut self) -> Result<(), VobjError> {
        while self.table.len() > self.limit {
            let Some(tail) = self.tail else { break };
            self.evict(tail)?;
        }
        Ok(())
    }

    /// Write every dirty record to the store without evicting anything.
    pub(crate) fn flush(&mut self) -> Result<(), VobjError> {
        if self.dirty_count == 0 {
            return Ok(());
        }
        let mut cursor = self.tail;
        let Self { backing, nodes, dirty_count, .. } = self;
        while let Some(idx) = cursor {
            let node = nodes[idx].as_mut().expect("linked cache node");
            if node.inner.dirty {
                if let Some(state) = node.inner.raw_state.as_ref() {
                    backing.persist(&node.inner.base, state)?;
                }
                node.inner.dirty = false;
                *dirty_count -= 1;
            }
            cursor = node.prev;
        }
        Ok(())
    }

    /// Forget `base` without flushing, for objects being deleted.
    pub(crate) fn discard(&mut self, base: &BaseRef) {
        let Some(idx) = self.table.remove(base) else { return };
        self.unlink(idx);
        if let Some(node) = self.nodes[idx].take() {
            if node.inner.dirty {
                self.dirty_count -= 1;
            }
        }
        self.free.push(idx);
    }

    fn evict(&mut self, idx: usize) -> Result<(), VobjError> {
        {
            let Self { backing, nodes, dirty_count, .. } = self;
            let node = nodes[idx].as_mut().expect("linked cache node");
            log::trace!("vo cache evicts {} (dirty={})", node.inner.base, node.inner.dirty);
            if node.inner.dirty {
                if let Some(state) = node.inner.raw_state.as_ref() {
                    backing.persist(&node.inner.base, state)?;
                }
                node.inner.dirty = false;
                *dirty_count -= 1;
            }
            // state reference is dropped only after the flush above
            node.inner.raw_state = None;
        }
        self.unlink(idx);
        let base = self.node(idx).inner.base;
        self.table.remove(&base);
        self.nodes[idx] = None;
        self.free.push(idx);
        Ok(())
    }

    fn push_front(&mut self, idx: usize) {
        self.node_mut(idx).prev = None;
        self.node_mut(idx).next = self.head;
        if let Some(old_head) = self.head {
            self.node_mut(old_head).prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.node(idx);
            (node.prev, node.next)
        };
        match prev {
            Some(prev_idx) => self.node_mut(prev_idx).next = next,
            None => self.head = next,
        }
        match next {
            Some(next_idx) => self.node_mut(next_idx).prev = prev,
            None => self.tail = prev,
        }
        let node = self.node_mut(idx);
        node.prev = None;
        node.next = None;
    }

    // Index validity is structural: every index in `table` points at a
    // live node. A miss here is a cache bug, not a caller error.
    fn node(&self, idx: usize) -> &Node {
        self.nodes[idx].as_ref().expect("linked cache node")
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node {
        self.nodes[idx].as_mut().expect("linked cache node")
    }

    #[cfg(test)]
    fn order(&self) -> Vec<BaseRef> {
        let mut out = Vec::new();
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            let node = self.node(idx);
            out.push(node.inner.base);
            cursor = node.next;
        }
        out
    }
}
