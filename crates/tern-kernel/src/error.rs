use thiserror::Error;

use crate::clist::{SlotId, VatId};

/// Kernel-fatal protocol violations. The kernel stops rather than guess:
/// a vat naming a slot it was never granted is indistinguishable from an
/// escape attempt.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("vat '{0}' is not registered")]
    UnknownVat(VatId),
    #[error("vat '{vat}' used import slot {slot} it was never granted")]
    UnknownImport { vat: VatId, slot: SlotId },
    #[error("vat '{vat}' used invalid slot {slot} (slot 0 is never allocated)")]
    InvalidSlot { vat: VatId, slot: SlotId },
    #[error("delivery to vat '{vat}' failed: {detail}")]
    Dispatch { vat: VatId, detail: String },
}

impl KernelError {
    /// Wrap a vat-internal failure for propagation out of the scheduler.
    pub fn dispatch(vat: impl Into<VatId>, err: impl std::fmt::Display) -> Self {
        KernelError::Dispatch { vat: vat.into(), detail: err.to_string() }
    }
}
