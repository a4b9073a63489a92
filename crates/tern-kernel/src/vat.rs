use crate::clist::{SlotId, VatId};
use crate::error::KernelError;
use crate::kernel::KernelState;
use crate::queue::Message;

/// Entry point of a vat. The kernel calls `deliver` once per queued
/// message, synchronously; the delivery owns the thread until it returns.
///
/// `slots` arrive already translated into the receiving vat's import
/// form, so they are always negative.
pub trait VatDispatch {
    fn deliver(
        &mut self,
        syscall: &mut Syscall<'_>,
        facet_id: SlotId,
        method: &str,
        args: &str,
        slots: &[SlotId],
    ) -> Result<(), KernelError>;
}

/// Kernel services available to a vat during one delivery.
pub struct Syscall<'a> {
    pub(crate) state: &'a mut KernelState,
    pub(crate) from_vat: VatId,
}

impl Syscall<'_> {
    /// Queue a message for `target`, translating it and every argument
    /// slot out of this vat's local form. Delivery happens on a later
    /// turn; nothing runs re-entrantly.
    pub fn send(
        &mut self,
        target: SlotId,
        method: &str,
        args: &str,
        slots: &[SlotId],
    ) -> Result<(), KernelError> {
        let neutral_target = self.state.map_outbound(&self.from_vat, target)?;
        let mut neutral_slots = Vec::with_capacity(slots.len());
        for slot in slots {
            neutral_slots.push(self.state.map_outbound(&self.from_vat, *slot)?);
        }
        log::debug!(
            "vat {} sends '{}' to {}:{}",
            self.from_vat,
            method,
            neutral_target.vat_id,
            neutral_target.slot_id,
        );
        self.state.run_queue.push(Message {
            to_vat: neutral_target.vat_id,
            facet_id: neutral_target.slot_id,
            method: method.to_string(),
            args: args.to_string(),
            slots: neutral_slots,
        });
        Ok(())
    }

    /// Stop the scheduler once the current delivery returns. Messages
    /// already queued stay queued.
    pub fn pause(&mut self) {
        log::debug!("vat {} pauses the kernel", self.from_vat);
        self.state.running = false;
    }

    /// The vat this syscall facet belongs to.
    pub fn vat_id(&self) -> &str {
        &self.from_vat
    }
}
