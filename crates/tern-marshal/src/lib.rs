//! Capability-aware marshalling shared by the vat kernel and the virtual
//! object layer: a deterministic value tree, the textual vat-reference
//! grammar, the `{body, slots}` wire form, and canonical CBOR helpers for
//! persisted records.

mod capdata;
mod cbor;
mod value;
mod vref;

pub use capdata::{CapData, serialize, unserialize};
pub use cbor::{from_cbor_slice, to_canonical_cbor, write_canonical_cbor};
pub use value::Value;
pub use vref::{BaseRef, Vref};

use thiserror::Error;

pub type MarshalResult<T> = Result<T, MarshalError>;

#[derive(Debug, Error)]
pub enum MarshalError {
    #[error("malformed vat reference '{0}'")]
    BadVref(String),
    #[error("record key '{0}' is reserved (keys must not start with '@')")]
    ReservedKey(String),
    #[error("slot placeholder {index} out of range for {len} slots")]
    SlotOutOfRange { index: usize, len: usize },
    #[error("number {0} is not an integer")]
    NonIntegerNumber(String),
    #[error("malformed body: {0}")]
    BadBody(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("CBOR error: {0}")]
    Cbor(#[from] serde_cbor::Error),
}
