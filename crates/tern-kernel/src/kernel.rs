use std::collections::HashMap;

use serde::Serialize;

use crate::clist::{CList, KernelSlot, SlotId, VatId};
use crate::error::KernelError;
use crate::queue::{Message, RunQueue};
use crate::vat::{Syscall, VatDispatch};

/// Kernel tables a vat may touch mid-delivery through its syscall facet.
/// Split from the vat registry so the dispatching vat and its syscalls can
/// borrow disjoint halves of the kernel.
pub(crate) struct KernelState {
    pub(crate) run_queue: RunQueue,
    pub(crate) clists: HashMap<VatId, CList>,
    pub(crate) running: bool,
}

impl KernelState {
    fn new() -> Self {
        Self { run_queue: RunQueue::new(), clists: HashMap::new(), running: false }
    }

    /// Translate a vat-local slot into neutral form. Exports pass through
    /// as `(from_vat, slot)`; imports resolve through the c-list and must
    /// already exist there.
    pub(crate) fn map_outbound(
        &self,
        from_vat: &str,
        slot: SlotId,
    ) -> Result<KernelSlot, KernelError> {
        if slot > 0 {
            return Ok(KernelSlot::new(from_vat, slot));
        }
        if slot == 0 {
            return Err(KernelError::InvalidSlot { vat: from_vat.to_string(), slot });
        }
        let clist = self
            .clists
            .get(from_vat)
            .ok_or_else(|| KernelError::UnknownVat(from_vat.to_string()))?;
        clist
            .neutral_for(slot)
            .cloned()
            .ok_or_else(|| KernelError::UnknownImport { vat: from_vat.to_string(), slot })
    }

    /// Translate a neutral pair into the receiving vat's import form,
    /// allocating a fresh negative slot on first sight of the pair. The
    /// slot in the pair is always a positive export.
    pub(crate) fn map_inbound(
        &mut self,
        to_vat: &str,
        neutral: KernelSlot,
    ) -> Result<SlotId, KernelError> {
        if neutral.slot_id <= 0 {
            return Err(KernelError::InvalidSlot { vat: neutral.vat_id, slot: neutral.slot_id });
        }
        let clist = self
            .clists
            .get_mut(to_vat)
            .ok_or_else(|| KernelError::UnknownVat(to_vat.to_string()))?;
        let slot = clist.import(neutral);
        log::trace!("vat {to_vat} inbound slot {slot}");
        Ok(slot)
    }
}

/// One row of the combined kernel capability table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct KernelTableRow {
    pub from_vat: VatId,
    pub from_slot: SlotId,
    pub to_vat: VatId,
    pub to_slot: SlotId,
}

/// One vat's import table as reported by [`Kernel::dump_slots`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VatTable {
    pub vat_id: VatId,
    pub entries: Vec<VatTableEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VatTableEntry {
    pub local_slot: SlotId,
    pub export: KernelSlot,
}

/// Deterministic snapshot of every capability mapping the kernel holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotDump {
    pub vat_tables: Vec<VatTable>,
    pub kernel_table: Vec<KernelTableRow>,
}

/// The object-capability kernel: vat registry, per-vat c-lists, and the
/// turn scheduler.
pub struct Kernel {
    vats: HashMap<VatId, Box<dyn VatDispatch>>,
    state: KernelState,
}

impl Kernel {
    pub fn new() -> Self {
        Self { vats: HashMap::new(), state: KernelState::new() }
    }

    /// Register a vat's dispatch entry point. Re-registering an existing
    /// vat replaces its dispatch but keeps its c-list, so import
    /// identities survive a vat swap.
    pub fn add_vat(&mut self, vat_id: impl Into<VatId>, dispatch: Box<dyn VatDispatch>) {
        let vat_id = vat_id.into();
        log::debug!("kernel registers vat {vat_id}");
        self.state.clists.entry(vat_id.clone()).or_default();
        self.vats.insert(vat_id, dispatch);
    }

    /// Enqueue a message from outside any vat. The facet must be an
    /// export of the target vat; no slots can accompany a bootstrap
    /// message because the outside world owns none.
    pub fn queue(&mut self, to_vat: impl Into<VatId>, facet_id: SlotId, method: &str, args: &str) {
        self.state.run_queue.push(Message {
            to_vat: to_vat.into(),
            facet_id,
            method: method.to_string(),
            args: args.to_string(),
            slots: Vec::new(),
        });
    }

    pub fn queue_len(&self) -> usize {
        self.state.run_queue.len()
    }

    /// Deliver queued messages, including ones enqueued along the way,
    /// until the queue empties or a vat pauses the kernel.
    pub fn run(&mut self) -> Result<(), KernelError> {
        self.state.running = true;
        while self.state.running && !self.state.run_queue.is_empty() {
            self.deliver_next()?;
        }
        Ok(())
    }

    /// Deliver only the messages already queued when the call began; new
    /// sends stay queued for a later `run` or `drain`.
    pub fn drain(&mut self) -> Result<(), KernelError> {
        self.state.running = true;
        let mut remaining = self.state.run_queue.len();
        while self.state.running && remaining > 0 {
            self.deliver_next()?;
            remaining -= 1;
        }
        Ok(())
    }

    /// Deliver exactly one message, if any is queued.
    pub fn step(&mut self) -> Result<(), KernelError> {
        self.state.running = true;
        if self.state.run_queue.is_empty() {
            return Ok(());
        }
        self.deliver_next()
    }

    fn deliver_next(&mut self) -> Result<(), KernelError> {
        let Some(message) = self.state.run_queue.pop() else {
            return Ok(());
        };
        let mut local_slots = Vec::with_capacity(message.slots.len());
        for neutral in &message.slots {
            local_slots.push(self.state.map_inbound(&message.to_vat, neutral.clone())?);
        }
        let vat = self
            .vats
            .get_mut(&message.to_vat)
            .ok_or_else(|| KernelError::UnknownVat(message.to_vat.clone()))?;
        log::debug!(
            "deliver '{}' to vat {} facet {}",
            message.method,
            message.to_vat,
            message.facet_id,
        );
        let mut syscall = Syscall { state: &mut self.state, from_vat: message.to_vat.clone() };
        vat.deliver(&mut syscall, message.facet_id, &message.method, &message.args, &local_slots)
    }

    /// Deterministic snapshot of every c-list: one table per vat sorted by
    /// vat name, plus the flattened kernel table sorted by row.
    pub fn dump_slots(&self) -> SlotDump {
        let mut vat_tables: Vec<VatTable> = self
            .state
            .clists
            .iter()
            .map(|(vat_id, clist)| VatTable {
                vat_id: vat_id.clone(),
                entries: clist
                    .entries()
                    .into_iter()
                    .map(|(local_slot, export)| VatTableEntry { local_slot, export })
                    .collect(),
            })
            .collect();
        vat_tables.sort_by(|a, b| a.vat_id.cmp(&b.vat_id));

        let mut kernel_table = Vec::new();
        for table in &vat_tables {
            for entry in &table.entries {
                kernel_table.push(KernelTableRow {
                    from_vat: table.vat_id.clone(),
                    from_slot: entry.local_slot,
                    to_vat: entry.export.vat_id.clone(),
                    to_slot: entry.export.slot_id,
                });
            }
        }
        kernel_table.sort();

        SlotDump { vat_tables, kernel_table }
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}
