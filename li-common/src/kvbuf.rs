//! # kvbuf Encoder
//!
//! Purpose: Build request buffers in the self-describing kvbuf format used for
//! every directory-service query and reply.
//!
//! ## Design Principles
//!
//! 1. **Single Forward Cursor**: One open dictionary and one open key at a
//!    time; counts are patched in place as entries are appended.
//! 2. **Amortized Growth**: Capacity doubles (rounded up to `KVBUF_CHUNK`) so
//!    long buffers never pay quadratic reallocation.
//! 3. **Recognizable Failure**: A failed reservation drops the backing store;
//!    every later call is a no-op and `is_failed()` reports it.
//! 4. **Big-Endian Everywhere**: All integers on the wire are `u32` BE.
//!
//! ## Wire Format
//!
//! ```text
//! kvbuf:      | dict_count:4B | dict * dict_count |
//! dict:       | key_count:4B  | key * key_count   |
//! key:        | key_len:4B | key bytes | value_count:4B | value * value_count |
//! value:      | value_len:4B | value bytes |
//! ```
//!
//! Keys and values added as strings carry a trailing NUL inside their length
//! so the wire image doubles as a C string table.

use bytes::Bytes;
use tracing::trace;

/// Initial capacity of a fresh buffer.
pub const KVBUF_START_SIZE: usize = 128;

/// Growth granularity in bytes.
pub const KVBUF_CHUNK: usize = 256;

const COUNT_SIZE: usize = 4;

/// One argument of a single-dictionary query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryArg<'a> {
    /// Opens a new key.
    Key(&'a str),
    /// String value under the current key.
    Str(&'a str),
    /// Signed integer value, encoded as decimal text.
    Int(i64),
    /// Unsigned integer value, encoded as decimal text.
    Uint(u64),
}

/// Growable, serialized sequence of dictionaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Kvbuf {
    // `None` once an allocation failed.
    data: Option<Vec<u8>>,
    // Offset of the open dictionary's key count.
    dict: Option<usize>,
    // Offset of the open key's value count.
    vlist: Option<usize>,
}

impl Default for Kvbuf {
    fn default() -> Self {
        Kvbuf::new()
    }
}

impl Kvbuf {
    /// Creates an empty buffer holding a zero dictionary count.
    pub fn new() -> Self {
        Self::with_capacity(KVBUF_START_SIZE)
    }

    /// Creates an empty buffer with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut data = Vec::new();
        if data.try_reserve_exact(capacity.max(COUNT_SIZE)).is_err() {
            return Kvbuf {
                data: None,
                dict: None,
                vlist: None,
            };
        }
        data.extend_from_slice(&0u32.to_be_bytes());
        Kvbuf {
            data: Some(data),
            dict: None,
            vlist: None,
        }
    }

    /// Wraps already-serialized bytes. Nothing is validated here.
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        Kvbuf {
            data: Some(data.into()),
            dict: None,
            vlist: None,
        }
    }

    /// Builds a single-dictionary query from a key/value argument list.
    ///
    /// Values appearing before the first key are ignored.
    pub fn query(args: &[QueryArg<'_>]) -> Self {
        let mut kv = Kvbuf::new();
        kv.add_dict();
        for arg in args {
            match *arg {
                QueryArg::Key(key) => kv.add_key(key),
                QueryArg::Str(val) => kv.add_val(val),
                QueryArg::Int(val) => kv.add_val(&val.to_string()),
                QueryArg::Uint(val) => kv.add_val(&val.to_string()),
            }
        }
        kv
    }

    /// Builds the common one-key, one-value query.
    pub fn query_key_val(key: &str, val: &str) -> Self {
        Self::query(&[QueryArg::Key(key), QueryArg::Str(val)])
    }

    /// True once an allocation failed; the buffer is unusable.
    #[inline]
    pub fn is_failed(&self) -> bool {
        self.data.is_none()
    }

    /// Serialized length in bytes (zero when failed).
    #[inline]
    pub fn len(&self) -> usize {
        self.data.as_ref().map_or(0, Vec::len)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serialized bytes (empty when failed).
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }

    /// Number of dictionaries recorded in the header.
    pub fn dict_count(&self) -> u32 {
        read_u32(self.as_bytes(), 0).unwrap_or(0)
    }

    /// Opens a new dictionary and bumps the global count.
    pub fn add_dict(&mut self) {
        if self.len() < COUNT_SIZE {
            trace!(len = self.len(), "add_dict on buffer without header ignored");
            return;
        }
        if !self.grow(COUNT_SIZE) {
            return;
        }
        let offset = self.len();
        self.put_u32(0);
        self.bump(0);
        self.dict = Some(offset);
        self.vlist = None;
    }

    /// Opens a new key in the current dictionary.
    ///
    /// The key is stored NUL-terminated. Ignored when no dictionary is open.
    pub fn add_key(&mut self, key: &str) {
        let Some(dict) = self.dict else {
            trace!(key, "add_key without open dictionary ignored");
            return;
        };
        let Some(len) = wire_len(key.len() + 1) else {
            return;
        };
        if !self.grow(COUNT_SIZE + key.len() + 1 + COUNT_SIZE) {
            return;
        }
        self.put_u32(len);
        self.put_bytes(key.as_bytes());
        self.put_bytes(&[0]);
        let vlist = self.len();
        self.put_u32(0);
        self.bump(dict);
        self.vlist = Some(vlist);
    }

    /// Appends a NUL-terminated string value under the current key.
    pub fn add_val(&mut self, val: &str) {
        self.push_val(val.as_bytes(), true);
    }

    /// Appends raw value bytes under the current key.
    pub fn add_val_len(&mut self, val: &[u8]) {
        self.push_val(val, false);
    }

    /// Appends every dictionary of `other` and adds its count to ours.
    ///
    /// Closes the cursor; call `add_dict` before adding more keys.
    pub fn append(&mut self, other: &Kvbuf) {
        self.dict = None;
        self.vlist = None;
        if other.len() < COUNT_SIZE || self.len() < COUNT_SIZE {
            return;
        }
        let body = &other.as_bytes()[COUNT_SIZE..];
        let Some(total) = self.dict_count().checked_add(other.dict_count()) else {
            trace!("append would overflow dictionary count; ignored");
            return;
        };
        if !self.grow(body.len()) {
            return;
        }
        self.put_bytes(body);
        if let Some(data) = self.data.as_mut() {
            data[..COUNT_SIZE].copy_from_slice(&total.to_be_bytes());
        }
    }

    /// Converts the buffer into immutable bytes (empty when failed).
    pub fn freeze(self) -> Bytes {
        self.data.map(Bytes::from).unwrap_or_default()
    }

    fn push_val(&mut self, val: &[u8], nul: bool) {
        let Some(vlist) = self.vlist else {
            trace!("value without open key ignored");
            return;
        };
        let stored = val.len() + usize::from(nul);
        let Some(len) = wire_len(stored) else {
            return;
        };
        if !self.grow(COUNT_SIZE + stored) {
            return;
        }
        self.put_u32(len);
        self.put_bytes(val);
        if nul {
            self.put_bytes(&[0]);
        }
        self.bump(vlist);
    }

    /// Makes room for `extra` more bytes, switching to the failed state when
    /// the reservation cannot be satisfied.
    fn grow(&mut self, extra: usize) -> bool {
        let Some(data) = self.data.as_mut() else {
            return false;
        };
        let ok = match data.len().checked_add(extra) {
            Some(needed) if needed <= data.capacity() => true,
            Some(needed) => {
                let chunked = needed.div_ceil(KVBUF_CHUNK).saturating_mul(KVBUF_CHUNK);
                let target = chunked.max(data.capacity().saturating_mul(2));
                data.try_reserve_exact(target - data.len()).is_ok()
            }
            None => false,
        };
        if !ok {
            trace!(extra, "kvbuf growth failed; buffer released");
            self.data = None;
            self.dict = None;
            self.vlist = None;
        }
        ok
    }

    fn put_u32(&mut self, value: u32) {
        self.put_bytes(&value.to_be_bytes());
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        if let Some(data) = self.data.as_mut() {
            data.extend_from_slice(bytes);
        }
    }

    /// Increments the big-endian counter stored at `offset`.
    fn bump(&mut self, offset: usize) {
        if let Some(data) = self.data.as_mut() {
            if let Some(slot) = data.get_mut(offset..offset + COUNT_SIZE) {
                let current = u32::from_be_bytes([slot[0], slot[1], slot[2], slot[3]]);
                slot.copy_from_slice(&current.wrapping_add(1).to_be_bytes());
            }
        }
    }
}

fn wire_len(len: usize) -> Option<u32> {
    let value = u32::try_from(len).ok();
    if value.is_none() {
        trace!(len, "entry longer than u32::MAX ignored");
    }
    value
}

pub(crate) fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset.checked_add(COUNT_SIZE)?)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
