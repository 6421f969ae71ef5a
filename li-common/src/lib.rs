// li-common - Shared types, wire codec, and record builder for libinfo
//
// This crate defines the kvbuf/kvarray wire format, the transport-facing
// message shapes, and the ILS record allocator used by every lookup.

pub mod error;
pub mod ils;
pub mod kvarray;
pub mod kvbuf;
pub mod protocol;
pub mod types;

// Re-export for convenience
pub use error::*;
pub use ils::{CorruptRecord, IlsRecord, IlsValue};
pub use kvarray::{DictView, KeyView, KvArray};
pub use kvbuf::{Kvbuf, QueryArg};
pub use protocol::*;
pub use types::*;
