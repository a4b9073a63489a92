use std::collections::{BTreeMap, BTreeSet, HashMap};

use tern_marshal::{Value, Vref};

use crate::error::VobjError;
use crate::kind::KindId;

/// Reference bookkeeping the virtual object manager drives.
///
/// The manager reports every reachability transition explicitly: a slot
/// gained by persisted state, a slot dropped by an overwrite, a weak
/// container starting or ceasing to recognize a key. Nothing here is
/// inferred from liveness of in-memory handles; the counts are the only
/// source of truth for collection.
pub trait Collector {
    /// Whether instances referenced through `vref` survive restart.
    fn is_durable(&self, vref: &Vref) -> bool;

    /// Record one more persisted reference to `vref`.
    fn add_reachable_vref(&mut self, vref: &Vref);

    /// Record one less persisted reference to `vref`. Returns true when
    /// the drop may have produced new collection work.
    fn remove_reachable_vref(&mut self, vref: &Vref) -> bool;

    /// Apply the slot difference between an overwritten value and its
    /// replacement. Slots present on both sides stay untouched.
    fn update_reference_counts(&mut self, before: &[Vref], after: &[Vref]);

    /// Record a kind's durability so `is_durable` can answer for its
    /// instances.
    fn register_kind(&mut self, kind: KindId, durable: bool);

    /// Lock the facet-name set of a kind on first use; later calls must
    /// present the identical set.
    fn check_or_acquire_facet_names(
        &mut self,
        kind: KindId,
        names: Option<&[String]>,
    ) -> Result<(), VobjError>;

    /// Stable string key for a capability-bearing weak-collection key;
    /// `None` when the value is plain data.
    fn vref_key(&self, value: &Value) -> Option<String>;

    /// A weak container started recognizing `value` as a key.
    fn add_recognizable_value(&mut self, value: &Value);

    /// A weak container stopped recognizing `value` as a key.
    fn remove_recognizable_value(&mut self, value: &Value);

    /// Whether `vref` still has persisted references keeping it alive.
    fn is_reachable(&self, vref: &Vref) -> bool;

    /// Drain the references whose reachable count hit zero since the last
    /// call.
    fn drain_dead(&mut self) -> Vec<Vref>;
}

/// Deterministic reference-counting [`Collector`].
///
/// Reachability is counted per cohort (facet references collapse onto
/// their baseRef); recognition is counted per exact reference, since
/// distinct facets are distinct weak keys.
#[derive(Default)]
pub struct RefCountCollector {
    reachable: BTreeMap<Vref, u64>,
    recognizable: BTreeMap<Vref, u64>,
    kinds: HashMap<KindId, bool>,
    facet_names: HashMap<KindId, Option<Vec<String>>>,
    dead: BTreeSet<Vref>,
}

impl RefCountCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current reachable count for `vref` (cohort-collapsed).
    pub fn reachable_count(&self, vref: &Vref) -> u64 {
        self.reachable.get(&vref.without_facet()).copied().unwrap_or(0)
    }

    /// Current recognition count for `vref` (exact).
    pub fn recognizable_count(&self, vref: &Vref) -> u64 {
        self.recognizable.get(vref).copied().unwrap_or(0)
    }

    fn drop_recognition(&mut self, vref: &Vref) {
        let Some(count) = self.recognizable.get_mut(vref) else {
            log::warn!("recognition count for {vref} dropped below zero");
            return;
        };
        *count -= 1;
        if *count == 0 {
            self.recognizable.remove(vref);
        }
    }
}

impl Collector for RefCountCollector {
    fn is_durable(&self, vref: &Vref) -> bool {
        match vref {
            Vref::Virtual { base, .. } => self.kinds.get(&base.kind).copied().unwrap_or(false),
            Vref::Import(_) | Vref::Export(_) => false,
        }
    }

    fn add_reachable_vref(&mut self, vref: &Vref) {
        let key = vref.without_facet();
        self.dead.remove(&key);
        *self.reachable.entry(key).or_insert(0) += 1;
    }

    fn remove_reachable_vref(&mut self, vref: &Vref) -> bool {
        let key = vref.without_facet();
        let Some(count) = self.reachable.get_mut(&key) else {
            log::warn!("reachable count for {key} dropped below zero");
            return false;
        };
        *count -= 1;
        if *count > 0 {
            return false;
        }
        self.reachable.remove(&key);
        if key.is_virtual() {
            self.dead.insert(key);
            return true;
        }
        false
    }

    fn update_reference_counts(&mut self, before: &[Vref], after: &[Vref]) {
        let mut delta: BTreeMap<Vref, i64> = BTreeMap::new();
        for vref in after {
            *delta.entry(vref.without_facet()).or_insert(0) += 1;
        }
        for vref in before {
            *delta.entry(vref.without_facet()).or_insert(0) -= 1;
        }
        for (vref, diff) in delta {
            for _ in 0..diff.abs() {
                if diff > 0 {
                    self.add_reachable_vref(&vref);
                } else {
                    self.remove_reachable_vref(&vref);
                }
            }
        }
    }

    fn register_kind(&mut self, kind: KindId, durable: bool) {
        self.kinds.insert(kind, durable);
    }

    fn check_or_acquire_facet_names(
        &mut self,
        kind: KindId,
        names: Option<&[String]>,
    ) -> Result<(), VobjError> {
        let got = names.map(|names| names.to_vec());
        match self.facet_names.get(&kind) {
            Some(expected) if *expected != got => Err(VobjError::FacetNamesMismatch {
                kind,
                expected: expected.clone(),
                got,
            }),
            Some(_) => Ok(()),
            None => {
                self.facet_names.insert(kind, got);
                Ok(())
            }
        }
    }

    fn vref_key(&self, value: &Value) -> Option<String> {
        match value {
            Value::Ref(vref) => Some(vref.to_string()),
            _ => None,
        }
    }

    fn add_recognizable_value(&mut self, value: &Value) {
        if let Value::Ref(vref) = value {
            *self.recognizable.entry(vref.clone()).or_insert(0) += 1;
        }
    }

    fn remove_recognizable_value(&mut self, value: &Value) {
        if let Value::Ref(vref) = value {
            self.drop_recognition(vref);
        }
    }

    fn is_reachable(&self, vref: &Vref) -> bool {
        self.reachable.contains_key(&vref.without_facet())
    }

    fn drain_dead(&mut self) -> Vec<Vref> {
        std::mem::take(&mut self.dead).into_iter().collect()
    }
}
