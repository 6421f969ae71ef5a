// li-engine - Process and thread local state for the libinfo lookup core
//
// This crate holds the per-thread entry cache, the change-notification
// primitive, and the L1 cache gate built on top of it.

pub mod l1;
pub mod notify;
pub mod thread_cache;

pub use l1::{L1Cache, L1Config, L1Gate, L1Status};
pub use notify::{ChangeNotifier, MemoryNotifier, NotifyToken};
pub use thread_cache::{with_thread_slot, EntrySlot, ThreadEntryCache};
