use std::collections::VecDeque;

use serde::Serialize;

use crate::clist::{KernelSlot, SlotId, VatId};

/// One pending delivery, held in kernel-neutral form. Immutable once
/// enqueued.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub to_vat: VatId,
    /// Export slot of the target object within `to_vat`.
    pub facet_id: SlotId,
    pub method: String,
    /// Serialized argument payload, passed through untranslated.
    pub args: String,
    /// Capability slots accompanying the payload.
    pub slots: Vec<KernelSlot>,
}

/// Strict FIFO run queue; delivery order is exactly arrival order.
#[derive(Debug, Default)]
pub struct RunQueue {
    pending: VecDeque<Message>,
}

impl RunQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: Message) {
        self.pending.push_back(message);
    }

    pub fn pop(&mut self) -> Option<Message> {
        self.pending.pop_front()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
