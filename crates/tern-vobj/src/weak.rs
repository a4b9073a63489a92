use std::collections::{BTreeMap, BTreeSet};

use tern_marshal::Value;

use crate::error::VobjError;
use crate::manager::VirtualObjectManager;

/// Handle to a weak map owned by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WeakMapId(pub(crate) u64);

/// Handle to a weak set owned by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WeakSetId(pub(crate) u64);

/// Weak map contents, split by key nature: plain data keys compare by
/// value, capability keys are bucketed under their stable string key.
/// The original key value is retained per bucket so recognition can be
/// handed back to the collector entry by entry.
#[derive(Default)]
pub(crate) struct WeakMapState {
    plain: BTreeMap<Value, Value>,
    by_vref: BTreeMap<String, (Value, Value)>,
}

#[derive(Default)]
pub(crate) struct WeakSetState {
    plain: BTreeSet<Value>,
    by_vref: BTreeMap<String, Value>,
}

/// Weak containers. They hold plain values like ordinary collections;
/// a capability-bearing key additionally registers with the collector's
/// recognition tracking, and never counts as a reachable reference, so
/// membership alone keeps nothing alive.
impl VirtualObjectManager {
    pub fn make_weak_map(&mut self) -> WeakMapId {
        let id = self.next_collection_id;
        self.next_collection_id += 1;
        self.weak_maps.insert(id, WeakMapState::default());
        WeakMapId(id)
    }

    pub fn make_weak_set(&mut self) -> WeakSetId {
        let id = self.next_collection_id;
        self.next_collection_id += 1;
        self.weak_sets.insert(id, WeakSetState::default());
        WeakSetId(id)
    }

    /// Insert or replace an entry. Recognition rises only when the key
    /// was not already present.
    pub fn weak_map_insert(
        &mut self,
        map: WeakMapId,
        key: &Value,
        value: Value,
    ) -> Result<(), VobjError> {
        let stable = self.collector.vref_key(key);
        let state = self.weak_maps.get_mut(&map.0).ok_or(VobjError::UnknownCollection(map.0))?;
        match stable {
            Some(stable) => {
                let fresh = !state.by_vref.contains_key(&stable);
                state.by_vref.insert(stable, (key.clone(), value));
                if fresh {
                    self.collector.add_recognizable_value(key);
                }
            }
            None => {
                state.plain.insert(key.clone(), value);
            }
        }
        Ok(())
    }

    pub fn weak_map_get(&self, map: WeakMapId, key: &Value) -> Result<Option<&Value>, VobjError> {
        let state = self.weak_maps.get(&map.0).ok_or(VobjError::UnknownCollection(map.0))?;
        Ok(match self.collector.vref_key(key) {
            Some(stable) => state.by_vref.get(&stable).map(|(_, value)| value),
            None => state.plain.get(key),
        })
    }

    pub fn weak_map_has(&self, map: WeakMapId, key: &Value) -> Result<bool, VobjError> {
        Ok(self.weak_map_get(map, key)?.is_some())
    }

    pub fn weak_map_remove(
        &mut self,
        map: WeakMapId,
        key: &Value,
    ) -> Result<Option<Value>, VobjError> {
        let stable = self.collector.vref_key(key);
        let state = self.weak_maps.get_mut(&map.0).ok_or(VobjError::UnknownCollection(map.0))?;
        match stable {
            Some(stable) => {
                let Some((key_value, value)) = state.by_vref.remove(&stable) else {
                    return Ok(None);
                };
                self.collector.remove_recognizable_value(&key_value);
                Ok(Some(value))
            }
            None => Ok(state.plain.remove(key)),
        }
    }

    /// Drop the whole map, ceasing recognition of every remaining
    /// capability key.
    pub fn dispose_weak_map(&mut self, map: WeakMapId) -> Result<(), VobjError> {
        let state = self.weak_maps.remove(&map.0).ok_or(VobjError::UnknownCollection(map.0))?;
        for (key_value, _) in state.by_vref.into_values() {
            self.collector.remove_recognizable_value(&key_value);
        }
        Ok(())
    }

    /// Add a member. Returns false when it was already present.
    pub fn weak_set_add(&mut self, set: WeakSetId, member: &Value) -> Result<bool, VobjError> {
        let stable = self.collector.vref_key(member);
        let state = self.weak_sets.get_mut(&set.0).ok_or(VobjError::UnknownCollection(set.0))?;
        match stable {
            Some(stable) => {
                if state.by_vref.contains_key(&stable) {
                    return Ok(false);
                }
                state.by_vref.insert(stable, member.clone());
                self.collector.add_recognizable_value(member);
                Ok(true)
            }
            None => Ok(state.plain.insert(member.clone())),
        }
    }

    pub fn weak_set_has(&self, set: WeakSetId, member: &Value) -> Result<bool, VobjError> {
        let state = self.weak_sets.get(&set.0).ok_or(VobjError::UnknownCollection(set.0))?;
        Ok(match self.collector.vref_key(member) {
            Some(stable) => state.by_vref.contains_key(&stable),
            None => state.plain.contains(member),
        })
    }

    pub fn weak_set_remove(&mut self, set: WeakSetId, member: &Value) -> Result<bool, VobjError> {
        let stable = self.collector.vref_key(member);
        let state = self.weak_sets.get_mut(&set.0).ok_or(VobjError::UnknownCollection(set.0))?;
        match stable {
            Some(stable) => {
                let Some(key_value) = state.by_vref.remove(&stable) else {
                    return Ok(false);
                };
                self.collector.remove_recognizable_value(&key_value);
                Ok(true)
            }
            None => Ok(state.plain.remove(member)),
        }
    }

    /// Drop the whole set, ceasing recognition of every remaining
    /// capability member.
    pub fn dispose_weak_set(&mut self, set: WeakSetId) -> Result<(), VobjError> {
        let state = self.weak_sets.remove(&set.0).ok_or(VobjError::UnknownCollection(set.0))?;
        for member in state.by_vref.into_values() {
            self.collector.remove_recognizable_value(&member);
        }
        Ok(())
    }
}
