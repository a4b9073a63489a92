use std::collections::HashMap;

use serde::Serialize;

/// Name of a registered vat.
pub type VatId = String;

/// Vat-local capability slot. Positive slots are exports named by the
/// owning vat; negative slots are imports allocated by the kernel. Slot 0
/// is never used.
pub type SlotId = i64;

/// Kernel-neutral designation of a capability: the exporting vat plus the
/// export slot it chose.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct KernelSlot {
    pub vat_id: VatId,
    pub slot_id: SlotId,
}

impl KernelSlot {
    pub fn new(vat_id: impl Into<VatId>, slot_id: SlotId) -> Self {
        Self { vat_id: vat_id.into(), slot_id }
    }
}

/// One vat's capability table, kept bidirectional: local import slot to
/// neutral pair, and neutral pair back to the import slot. Both directions
/// are always written together, so a pair maps to exactly one import slot
/// for the lifetime of the table.
#[derive(Debug)]
pub struct CList {
    forward: HashMap<SlotId, KernelSlot>,
    backward: HashMap<KernelSlot, SlotId>,
    next_import: SlotId,
}

impl CList {
    pub fn new() -> Self {
        Self { forward: HashMap::new(), backward: HashMap::new(), next_import: -1 }
    }

    /// Neutral pair behind an already-allocated import slot.
    pub fn neutral_for(&self, slot: SlotId) -> Option<&KernelSlot> {
        self.forward.get(&slot)
    }

    /// Import slot for a neutral pair, allocating the next negative slot
    /// on first sight. Repeated calls with the same pair return the same
    /// slot.
    pub fn import(&mut self, neutral: KernelSlot) -> SlotId {
        if let Some(slot) = self.backward.get(&neutral) {
            return *slot;
        }
        let slot = self.next_import;
        self.next_import -= 1;
        self.forward.insert(slot, neutral.clone());
        self.backward.insert(neutral, slot);
        slot
    }

    /// Every import mapping, ordered by local slot ascending.
    pub fn entries(&self) -> Vec<(SlotId, KernelSlot)> {
        let mut rows: Vec<_> =
            self.forward.iter().map(|(slot, neutral)| (*slot, neutral.clone())).collect();
        rows.sort_by_key(|(slot, _)| *slot);
        rows
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}

impl Default for CList {
    fn default() -> Self {
        Self::new()
    }
}
