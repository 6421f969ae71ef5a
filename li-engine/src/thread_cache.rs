//! # Per-Thread Entry Cache
//!
//! Purpose: Give every reentrant `get*ent`-style iterator a stable,
//! thread-confined lifetime for its decoded results and its last returned
//! record.
//!
//! ## Design Principles
//!
//! 1. **One Slot Per Database**: A thread holds at most one decoded result
//!    set and one recycled record per logical database.
//! 2. **Recycle Frees The Previous**: Installing a record releases the last
//!    one, so a caller's borrow stays valid until its next lookup.
//! 3. **Thread Confined**: Slots live in `thread_local!` storage (or in an
//!    explicitly passed `ThreadEntryCache`) and never need a lock.
//! 4. **Exit Cleanup**: `Drop` releases whatever a slot still holds when the
//!    thread goes away.
//!
//! ## Structure Overview
//!
//! ```text
//! ThreadEntryCache (one per thread)
//!   └── slots: HashMap<Database, EntrySlot>
//!         └── EntrySlot
//!               ├── results: Option<KvArray>   (freed by end())
//!               ├── cursor: usize
//!               └── recycled: Option<IlsRecord> (freed by recycle()/drop)
//! ```

use std::cell::RefCell;

use ahash::RandomState;
use hashbrown::HashMap;
use tracing::{error, trace};

use li_common::{CorruptRecord, Database, DictView, IlsRecord, KvArray};

/// Cache slot for one (thread, database) pair.
#[derive(Debug)]
pub struct EntrySlot {
    db: Database,
    results: Option<KvArray>,
    cursor: usize,
    recycled: Option<IlsRecord>,
}

impl EntrySlot {
    pub fn new(db: Database) -> Self {
        EntrySlot {
            db,
            results: None,
            cursor: 0,
            recycled: None,
        }
    }

    #[inline]
    pub fn database(&self) -> Database {
        self.db
    }

    /// Installs a decoded result set and rewinds the cursor.
    pub fn set_results(&mut self, results: KvArray) {
        self.results = Some(results);
        self.cursor = 0;
    }

    #[inline]
    pub fn has_results(&self) -> bool {
        self.results.is_some()
    }

    /// Index of the next dictionary `next_dict` will return.
    #[inline]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// Returns the dictionary under the cursor and advances past it.
    pub fn next_dict(&mut self) -> Option<DictView<'_>> {
        let results = self.results.as_ref()?;
        let dict = results.dict(self.cursor)?;
        self.cursor += 1;
        Some(dict)
    }

    /// Frees the decoded result set. The recycled record is kept.
    pub fn end(&mut self) {
        self.results = None;
        self.cursor = 0;
    }

    /// Replaces the recycled record and returns a borrow of the new one.
    pub fn recycle(&mut self, record: IlsRecord) -> &IlsRecord {
        if let Some(previous) = self.recycled.take() {
            release_record(self.db, previous);
        }
        self.recycled.insert(record)
    }

    /// Record most recently published through `recycle`.
    pub fn current(&self) -> Option<&IlsRecord> {
        self.recycled.as_ref()
    }
}

impl Drop for EntrySlot {
    fn drop(&mut self) {
        if let Some(record) = self.recycled.take() {
            release_record(self.db, record);
        }
    }
}

fn release_record(db: Database, record: IlsRecord) {
    let header_size = record.header_size();
    match record.release(header_size) {
        Ok(()) => trace!(db = %db, "ils record released"),
        Err(CorruptRecord { record }) => {
            error!(db = %db, len = record.len(), "ils record corrupted; leaking it");
            std::mem::forget(record);
        }
    }
}

/// All slots owned by one thread (or one explicitly passed context).
#[derive(Debug, Default)]
pub struct ThreadEntryCache {
    slots: HashMap<Database, EntrySlot, RandomState>,
}

impl ThreadEntryCache {
    pub fn new() -> Self {
        ThreadEntryCache::default()
    }

    /// Returns the slot for `db`, creating it on first use.
    pub fn slot(&mut self, db: Database) -> &mut EntrySlot {
        self.slots.entry(db).or_insert_with(|| EntrySlot::new(db))
    }

    /// Returns the slot for `db` if it was ever created.
    pub fn existing(&self, db: Database) -> Option<&EntrySlot> {
        self.slots.get(&db)
    }

    /// Number of slots created so far.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Drops every slot, releasing their records.
    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

thread_local! {
    static THREAD_ENTRY_CACHE: RefCell<ThreadEntryCache> =
        RefCell::new(ThreadEntryCache::new());
}

/// Runs `f` against the calling thread's slot for `db`.
///
/// Returns `None` during thread teardown or when called re-entrantly from
/// inside another `with_thread_slot` closure.
pub fn with_thread_slot<R>(db: Database, f: impl FnOnce(&mut EntrySlot) -> R) -> Option<R> {
    THREAD_ENTRY_CACHE
        .try_with(|cell| {
            let mut cache = cell.try_borrow_mut().ok()?;
            Some(f(cache.slot(db)))
        })
        .ok()
        .flatten()
}
