//! Object-capability kernel for cooperating vats: per-vat capability
//! tables, slot translation across vat boundaries, and a strict-FIFO turn
//! scheduler.
//!
//! A vat never holds a direct reference into another vat. It names its own
//! objects with positive export slots and foreign objects with negative
//! import slots that only the kernel can interpret; every message crossing
//! a vat boundary has its slots translated through the kernel's neutral
//! `(vat, export-slot)` form. Deliveries run one at a time to completion,
//! so no vat ever observes another mid-turn.

pub mod clist;
pub mod error;
pub mod kernel;
pub mod queue;
pub mod vat;

pub use clist::{CList, KernelSlot, SlotId, VatId};
pub use error::KernelError;
pub use kernel::{Kernel, KernelTableRow, SlotDump, VatTable, VatTableEntry};
pub use queue::{Message, RunQueue};
pub use vat::{Syscall, VatDispatch};
