//! # kvarray Decoder
//!
//! Purpose: Parse a reply buffer into a navigable array of dictionaries whose
//! keys and values alias the original bytes.
//!
//! ## Design Principles
//!
//! 1. **Check Before Use**: Every length and count is validated against the
//!    remaining bytes before it is trusted, including before any allocation
//!    sized by a count.
//! 2. **Fail Closed**: Any violation returns `Malformed`; a partially parsed
//!    array never escapes.
//! 3. **One Ownership Path**: `KvArray` owns the buffer; dropping it releases
//!    the index scaffolding and the bytes together.
//! 4. **Ranges, Not Copies**: The index stores byte ranges into the buffer.
//!
//! ## Structure Overview
//!
//! ```text
//! KvArray
//!   ├── buf: Bytes                (the reply, owned)
//!   └── dicts: Vec<DictIndex>
//!         └── keys: Vec<KeyIndex>
//!               ├── name: Range    (NUL stripped, UTF-8 checked)
//!               └── values: Vec<Range>
//! ```

use std::ops::Range;

use bytes::Bytes;

use crate::error::{LiError, LiResult};
use crate::kvbuf::Kvbuf;

const COUNT_SIZE: usize = 4;
// Smallest encodings, used to bound declared counts.
const MIN_DICT_SIZE: usize = COUNT_SIZE;
const MIN_KEY_SIZE: usize = 2 * COUNT_SIZE;
const MIN_VALUE_SIZE: usize = COUNT_SIZE;

#[derive(Debug, Clone)]
struct KeyIndex {
    name: Range<usize>,
    values: Vec<Range<usize>>,
}

#[derive(Debug, Clone)]
struct DictIndex {
    keys: Vec<KeyIndex>,
}

/// Decoded overlay of a kvbuf reply.
#[derive(Debug, Clone)]
pub struct KvArray {
    buf: Bytes,
    dicts: Vec<DictIndex>,
}

impl KvArray {
    /// Decodes `buf`, taking ownership of it.
    ///
    /// Trailing bytes after the last declared dictionary are rejected.
    pub fn decode(buf: impl Into<Bytes>) -> LiResult<KvArray> {
        let buf = buf.into();
        let dicts = Parser::new(&buf).parse()?;
        Ok(KvArray { buf, dicts })
    }

    /// An array with no dictionaries.
    pub fn empty() -> KvArray {
        KvArray {
            buf: Bytes::new(),
            dicts: Vec::new(),
        }
    }

    /// Decodes a finished encoder buffer.
    pub fn from_kvbuf(kv: Kvbuf) -> LiResult<KvArray> {
        if kv.is_failed() {
            return Err(LiError::AllocationFailed);
        }
        Self::decode(kv.freeze())
    }

    /// Number of dictionaries.
    #[inline]
    pub fn len(&self) -> usize {
        self.dicts.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.dicts.is_empty()
    }

    /// Dictionary at `index`.
    pub fn dict(&self, index: usize) -> Option<DictView<'_>> {
        self.dicts.get(index).map(|dict| DictView {
            buf: &self.buf,
            dict,
        })
    }

    /// Iterates dictionaries in wire order.
    pub fn dicts(&self) -> impl Iterator<Item = DictView<'_>> + '_ {
        self.dicts.iter().map(move |dict| DictView {
            buf: &self.buf,
            dict,
        })
    }

    /// Releases the index and returns the underlying buffer.
    pub fn into_bytes(self) -> Bytes {
        self.buf
    }
}

/// Borrowed view of one dictionary.
#[derive(Debug, Clone, Copy)]
pub struct DictView<'a> {
    buf: &'a [u8],
    dict: &'a DictIndex,
}

impl<'a> DictView<'a> {
    #[inline]
    pub fn key_count(&self) -> usize {
        self.dict.keys.len()
    }

    /// Key at `index`.
    pub fn key(&self, index: usize) -> Option<KeyView<'a>> {
        let (buf, dict) = (self.buf, self.dict);
        dict.keys.get(index).map(|key| KeyView { buf, key })
    }

    /// Iterates keys in wire order.
    pub fn keys(&self) -> impl Iterator<Item = KeyView<'a>> + 'a {
        let (buf, dict) = (self.buf, self.dict);
        dict.keys.iter().map(move |key| KeyView { buf, key })
    }

    /// First key named `name`.
    pub fn get(&self, name: &str) -> Option<KeyView<'a>> {
        self.keys().find(|key| key.name() == name)
    }

    /// First value of key `name` as a string.
    pub fn first_str(&self, name: &str) -> Option<&'a str> {
        self.get(name).and_then(|key| key.value_str(0))
    }
}

/// Borrowed view of one key and its values.
#[derive(Debug, Clone, Copy)]
pub struct KeyView<'a> {
    buf: &'a [u8],
    key: &'a KeyIndex,
}

impl<'a> KeyView<'a> {
    /// Key name without its trailing NUL.
    pub fn name(&self) -> &'a str {
        // Validated as UTF-8 during decode.
        let (buf, key) = (self.buf, self.key);
        std::str::from_utf8(&buf[key.name.clone()]).unwrap_or_default()
    }

    #[inline]
    pub fn value_count(&self) -> usize {
        self.key.values.len()
    }

    /// Raw bytes of value `index`.
    ///
    /// `value(value_count())` is `None`, acting as the list terminator.
    pub fn value(&self, index: usize) -> Option<&'a [u8]> {
        let (buf, key) = (self.buf, self.key);
        key.values.get(index).map(|range| &buf[range.clone()])
    }

    /// Value `index` as text, with one trailing NUL stripped.
    pub fn value_str(&self, index: usize) -> Option<&'a str> {
        self.value(index)
            .and_then(|bytes| std::str::from_utf8(strip_nul(bytes)).ok())
    }

    /// Iterates raw values in wire order.
    pub fn values(&self) -> impl Iterator<Item = &'a [u8]> + 'a {
        let (buf, key) = (self.buf, self.key);
        key.values.iter().map(move |range| &buf[range.clone()])
    }

    /// Iterates values that are valid text, NUL stripped.
    pub fn str_values(&self) -> impl Iterator<Item = &'a str> + 'a {
        self.values()
            .filter_map(|bytes| std::str::from_utf8(strip_nul(bytes)).ok())
    }
}

fn strip_nul(bytes: &[u8]) -> &[u8] {
    match bytes.split_last() {
        Some((&0, rest)) => rest,
        _ => bytes,
    }
}

/// Single forward pass over the reply bytes.
struct Parser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(data: &'a [u8]) -> Self {
        Parser { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn read_u32(&mut self) -> LiResult<u32> {
        if self.remaining() < COUNT_SIZE {
            return Err(LiError::Malformed("truncated count"));
        }
        let b = &self.data[self.pos..self.pos + COUNT_SIZE];
        self.pos += COUNT_SIZE;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn take(&mut self, len: usize) -> LiResult<Range<usize>> {
        if self.remaining() < len {
            return Err(LiError::Malformed("length exceeds buffer"));
        }
        let start = self.pos;
        self.pos += len;
        Ok(start..self.pos)
    }

    /// Reads a count and rejects it if that many minimal items cannot fit.
    fn read_count(&mut self, min_item: usize) -> LiResult<usize> {
        let count = self.read_u32()? as usize;
        if count > self.remaining() / min_item {
            return Err(LiError::Malformed("count exceeds buffer"));
        }
        Ok(count)
    }

    fn parse(mut self) -> LiResult<Vec<DictIndex>> {
        let dict_count = self.read_count(MIN_DICT_SIZE)?;
        let mut dicts = Vec::with_capacity(dict_count);
        for _ in 0..dict_count {
            dicts.push(self.parse_dict()?);
        }
        if self.remaining() != 0 {
            return Err(LiError::Malformed("trailing bytes"));
        }
        Ok(dicts)
    }

    fn parse_dict(&mut self) -> LiResult<DictIndex> {
        let key_count = self.read_count(MIN_KEY_SIZE)?;
        let mut keys = Vec::with_capacity(key_count);
        for _ in 0..key_count {
            keys.push(self.parse_key()?);
        }
        Ok(DictIndex { keys })
    }

    fn parse_key(&mut self) -> LiResult<KeyIndex> {
        let key_len = self.read_u32()? as usize;
        let raw = self.take(key_len)?;
        let name = match self.data[raw.clone()].split_last() {
            Some((&0, _)) => raw.start..raw.end - 1,
            _ => raw,
        };
        if std::str::from_utf8(&self.data[name.clone()]).is_err() {
            return Err(LiError::Malformed("key is not utf-8"));
        }

        let value_count = self.read_count(MIN_VALUE_SIZE)?;
        let mut values = Vec::with_capacity(value_count);
        for _ in 0..value_count {
            let len = self.read_u32()? as usize;
            values.push(self.take(len)?);
        }
        Ok(KeyIndex { name, values })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passwd_reply() -> Kvbuf {
        let mut kv = Kvbuf::new();
        kv.add_dict();
        kv.add_key("name");
        kv.add_val("alice");
        kv.add_key("uid");
        kv.add_val("501");
        kv
    }

    #[test]
    fn decodes_scenario_record() {
        let array = KvArray::from_kvbuf(passwd_reply()).unwrap();
        assert_eq!(array.len(), 1);
        let dict = array.dict(0).unwrap();
        assert_eq!(dict.key_count(), 2);

        let name = dict.key(0).unwrap();
        assert_eq!(name.name(), "name");
        assert_eq!(name.value_count(), 1);
        assert_eq!(name.value_str(0), Some("alice"));

        let uid = dict.key(1).unwrap();
        assert_eq!(uid.name(), "uid");
        assert_eq!(uid.value_count(), 1);
        assert_eq!(uid.value_str(0), Some("501"));
    }

    #[test]
    fn value_list_has_terminator() {
        let array = KvArray::from_kvbuf(passwd_reply()).unwrap();
        let key = array.dict(0).unwrap().get("name").unwrap();
        assert!(key.value(0).is_some());
        assert!(key.value(1).is_none());
    }

    #[test]
    fn lookup_by_key_name() {
        let array = KvArray::from_kvbuf(passwd_reply()).unwrap();
        let dict = array.dict(0).unwrap();
        assert_eq!(dict.first_str("uid"), Some("501"));
        assert!(dict.get("shell").is_none());
    }

    #[test]
    fn empty_buffer_is_malformed() {
        assert!(matches!(KvArray::decode(Bytes::new()), Err(LiError::Malformed(_))));
    }

    #[test]
    fn zero_dicts_is_valid() {
        let array = KvArray::decode(Bytes::from_static(&[0, 0, 0, 0])).unwrap();
        assert!(array.is_empty());
        assert!(array.dict(0).is_none());
    }

    #[test]
    fn huge_counts_rejected_before_allocation() {
        let data = Bytes::from_static(&[0xff, 0xff, 0xff, 0xff, 0, 0, 0, 0]);
        assert!(matches!(KvArray::decode(data), Err(LiError::Malformed(_))));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut bytes = passwd_reply().freeze().to_vec();
        bytes.push(0);
        assert!(KvArray::decode(bytes).is_err());
    }

    #[test]
    fn non_utf8_key_rejected() {
        let mut kv = Kvbuf::new();
        kv.add_dict();
        kv.add_key("k");
        let mut bytes = kv.freeze().to_vec();
        // Overwrite the key byte with an invalid UTF-8 lead byte.
        bytes[12] = 0xff;
        assert!(matches!(KvArray::decode(bytes), Err(LiError::Malformed(_))));
    }

    #[test]
    fn binary_values_survive() {
        let mut kv = Kvbuf::new();
        kv.add_dict();
        kv.add_key("addr");
        kv.add_val_len(&[10, 0, 0, 1]);
        let array = KvArray::from_kvbuf(kv).unwrap();
        let key = array.dict(0).unwrap().get("addr").unwrap();
        assert_eq!(key.value(0), Some(&[10u8, 0, 0, 1][..]));
    }

    #[test]
    fn into_bytes_returns_original() {
        let kv = passwd_reply();
        let expected = kv.as_bytes().to_vec();
        let array = KvArray::from_kvbuf(kv).unwrap();
        assert_eq!(&array.into_bytes()[..], &expected[..]);
    }
}
