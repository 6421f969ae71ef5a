//! # ILS Record Builder
//!
//! Purpose: Build POSIX-struct-shaped records (passwd, hostent, servent, ...)
//! as one contiguous allocation described by a format string.
//!
//! ## Design Principles
//!
//! 1. **Two Passes, One Walker**: Sizing and writing run the same placement
//!    code, so per-field padding can never diverge between the passes.
//! 2. **Single Allocation**: Header slots, magic cookie, and payloads live in
//!    one buffer.
//! 3. **Offsets As Pointers**: Pointer slots hold the byte offset of their
//!    target inside the record (0 is NULL; offset 0 is always header).
//! 4. **Guarded Release**: `release` verifies the cookie at the offset implied
//!    by the caller's header size and refuses to free on mismatch.
//!
//! ## Format Characters
//!
//! | char | header slot          | data region                               |
//! |------|----------------------|-------------------------------------------|
//! | `1`  | u8                   | -                                         |
//! | `2`  | u16                  | -                                         |
//! | `4`  | u32                  | -                                         |
//! | `8`  | u64                  | -                                         |
//! | `L`  | usize                | -                                         |
//! | `s`  | pointer              | NUL-terminated string                     |
//! | `*`  | pointer              | NULL-terminated pointer array + strings   |
//! | `a`  | pointer              | NULL-terminated pointer array + 4B items  |
//! | `b`  | pointer              | NULL-terminated pointer array + 8B items  |
//! | `c`  | pointer              | NULL-terminated pointer array + 16B items |
//!
//! ## Memory Layout Example
//!
//! ```text
//! build("s4*", [Str("alice"), U32(501), StrList(["staff"])]) on 64-bit:
//! +---------+--------+-------+---------+-----------+-------------------------+
//! | name:8B | uid:4B | pad:4B| list:8B | cookie:8B | "alice\0" pad [ptr,0] "staff\0" |
//! +---------+--------+-------+---------+-----------+-------------------------+
//! |<-------------- header (24B) ------>|           |<------- data ---------->|
//! ```

use std::mem::size_of;

use thiserror::Error;

use crate::error::{LiError, LiResult};

/// Magic cookie written right after the padded header.
pub const ILS_MAGIC: [u8; ILS_MAGIC_SIZE] = *b"ILSMAGIC";

/// Cookie length in bytes.
pub const ILS_MAGIC_SIZE: usize = 8;

const PTR: usize = size_of::<usize>();
const HEADER_ALIGN: usize = 8;

/// One value matching a format character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IlsValue<'a> {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    Word(usize),
    Str(Option<&'a str>),
    StrList(&'a [&'a str]),
    Items4(&'a [[u8; 4]]),
    Items8(&'a [[u8; 8]]),
    Items16(&'a [[u8; 16]]),
}

impl IlsValue<'_> {
    fn format_char(&self) -> char {
        match self {
            IlsValue::U8(_) => '1',
            IlsValue::U16(_) => '2',
            IlsValue::U32(_) => '4',
            IlsValue::U64(_) => '8',
            IlsValue::Word(_) => 'L',
            IlsValue::Str(_) => 's',
            IlsValue::StrList(_) => '*',
            IlsValue::Items4(_) => 'a',
            IlsValue::Items8(_) => 'b',
            IlsValue::Items16(_) => 'c',
        }
    }
}

/// A record built by [`build`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IlsRecord {
    buf: Box<[u8]>,
    header_size: usize,
    fields: Vec<usize>,
}

/// Returned by [`IlsRecord::release`] when the footer does not match.
///
/// The record is handed back untouched; it has not been freed.
#[derive(Debug, Error)]
#[error("ils record footer is corrupted; record not freed")]
pub struct CorruptRecord {
    pub record: IlsRecord,
}

impl From<CorruptRecord> for LiError {
    fn from(_: CorruptRecord) -> Self {
        LiError::Corruption
    }
}

/// Builds a record from `format` and matching `values`.
///
/// # Errors
/// `InvalidFormat` when a character is unknown, the counts differ, or a value
/// does not match its character; `AllocationFailed` when the buffer cannot be
/// reserved.
pub fn build(format: &str, values: &[IlsValue<'_>]) -> LiResult<IlsRecord> {
    validate(format, values)?;

    // Pass 1: measure.
    let mut sizing = Walker::measure();
    for value in values {
        sizing.place(value);
    }
    let header_size = align_up(sizing.header, HEADER_ALIGN);
    let data_start = header_size + ILS_MAGIC_SIZE;
    let total = data_start + sizing.data;

    // Pass 2: write into one zeroed allocation.
    let mut storage = Vec::new();
    storage
        .try_reserve_exact(total)
        .map_err(|_| LiError::AllocationFailed)?;
    storage.resize(total, 0);

    let mut writer = Walker::write(&mut storage, data_start);
    let fields = values.iter().map(|value| writer.place(value)).collect();
    debug_assert_eq!(align_up(writer.header, HEADER_ALIGN), header_size);
    debug_assert_eq!(writer.data, total - data_start);

    storage[header_size..data_start].copy_from_slice(&ILS_MAGIC);
    Ok(IlsRecord {
        buf: storage.into_boxed_slice(),
        header_size,
        fields,
    })
}

impl IlsRecord {
    /// Alias for [`build`].
    pub fn build(format: &str, values: &[IlsValue<'_>]) -> LiResult<IlsRecord> {
        build(format, values)
    }

    /// Padded header size; the cookie starts here.
    #[inline]
    pub fn header_size(&self) -> usize {
        self.header_size
    }

    /// Total allocation size.
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Header offset of field `index`.
    pub fn field_offset(&self, index: usize) -> Option<usize> {
        self.fields.get(index).copied()
    }

    /// Number of fields.
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Raw record bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Mutable raw bytes, for in-place patching of header fields.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn read_u8(&self, offset: usize) -> Option<u8> {
        self.buf.get(offset).copied()
    }

    pub fn read_u16(&self, offset: usize) -> Option<u16> {
        self.read_array(offset).map(u16::from_ne_bytes)
    }

    pub fn read_u32(&self, offset: usize) -> Option<u32> {
        self.read_array(offset).map(u32::from_ne_bytes)
    }

    pub fn read_u64(&self, offset: usize) -> Option<u64> {
        self.read_array(offset).map(u64::from_ne_bytes)
    }

    pub fn read_word(&self, offset: usize) -> Option<usize> {
        self.read_array(offset).map(usize::from_ne_bytes)
    }

    /// Follows the pointer slot at `offset` to a string.
    ///
    /// `None` for a NULL slot or a target that is not valid text.
    pub fn read_str(&self, offset: usize) -> Option<&str> {
        let target = self.read_word(offset)?;
        self.c_str_at(target)
    }

    /// Follows the pointer slot at `offset` to a string list.
    pub fn read_str_list(&self, offset: usize) -> Option<Vec<&str>> {
        self.walk_list(offset)?
            .into_iter()
            .map(|target| self.c_str_at(target))
            .collect()
    }

    /// Follows the pointer slot at `offset` to a list of `N`-byte items.
    pub fn read_items<const N: usize>(&self, offset: usize) -> Option<Vec<[u8; N]>> {
        self.walk_list(offset)?
            .into_iter()
            .map(|target| self.read_array::<N>(target))
            .collect()
    }

    /// Verifies the cookie implied by `header_size` and frees the record.
    ///
    /// # Errors
    /// Hands the record back inside `CorruptRecord` on cookie mismatch.
    pub fn release(self, header_size: usize) -> Result<(), CorruptRecord> {
        if self.cookie_matches(header_size) {
            Ok(())
        } else {
            Err(CorruptRecord { record: self })
        }
    }

    /// True if the cookie is found where `header_size` says it should be.
    ///
    /// A header size whose cookie offset overflows never matches.
    pub fn cookie_matches(&self, header_size: usize) -> bool {
        let Some(at) = header_size.checked_next_multiple_of(HEADER_ALIGN) else {
            return false;
        };
        let Some(end) = at.checked_add(ILS_MAGIC_SIZE) else {
            return false;
        };
        self.buf
            .get(at..end)
            .is_some_and(|cookie| cookie == ILS_MAGIC)
    }

    fn read_array<const N: usize>(&self, offset: usize) -> Option<[u8; N]> {
        let bytes = self.buf.get(offset..offset.checked_add(N)?)?;
        bytes.try_into().ok()
    }

    fn c_str_at(&self, target: usize) -> Option<&str> {
        if target == 0 {
            return None;
        }
        let tail = self.buf.get(target..)?;
        let end = tail.iter().position(|&b| b == 0)?;
        std::str::from_utf8(&tail[..end]).ok()
    }

    /// Collects the targets of a NULL-terminated pointer array.
    fn walk_list(&self, offset: usize) -> Option<Vec<usize>> {
        let array = self.read_word(offset)?;
        if array == 0 {
            return None;
        }
        let mut targets = Vec::new();
        let mut slot = array;
        loop {
            let target = self.read_word(slot)?;
            if target == 0 {
                return Some(targets);
            }
            targets.push(target);
            slot += PTR;
        }
    }
}

fn validate(format: &str, values: &[IlsValue<'_>]) -> LiResult<()> {
    let chars: Vec<char> = format.chars().collect();
    if chars.len() != values.len() {
        return Err(LiError::InvalidFormat {
            index: chars.len().min(values.len()),
            reason: "format and value counts differ",
        });
    }
    for (index, (ch, value)) in chars.iter().zip(values).enumerate() {
        if !"1248Ls*abc".contains(*ch) {
            return Err(LiError::InvalidFormat {
                index,
                reason: "unknown format character",
            });
        }
        if *ch != value.format_char() {
            return Err(LiError::InvalidFormat {
                index,
                reason: "value does not match format character",
            });
        }
    }
    Ok(())
}

#[inline]
fn align_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

/// Field placement shared by the sizing and writing passes.
struct Walker<'b> {
    header: usize,
    // Relative to the start of the data region.
    data: usize,
    data_base: usize,
    out: Option<&'b mut [u8]>,
}

impl<'b> Walker<'b> {
    fn measure() -> Self {
        Walker {
            header: 0,
            data: 0,
            data_base: 0,
            out: None,
        }
    }

    fn write(out: &'b mut [u8], data_base: usize) -> Self {
        Walker {
            header: 0,
            data: 0,
            data_base,
            out: Some(out),
        }
    }

    /// Places one field and returns its header offset.
    fn place(&mut self, value: &IlsValue<'_>) -> usize {
        match *value {
            IlsValue::U8(v) => self.scalar(&[v]),
            IlsValue::U16(v) => self.scalar(&v.to_ne_bytes()),
            IlsValue::U32(v) => self.scalar(&v.to_ne_bytes()),
            IlsValue::U64(v) => self.scalar(&v.to_ne_bytes()),
            IlsValue::Word(v) => self.scalar(&v.to_ne_bytes()),
            IlsValue::Str(s) => {
                let at = self.slot(PTR);
                if let Some(s) = s {
                    let target = self.payload(s.as_bytes(), s.len() + 1, 1);
                    self.put_word(at, target);
                }
                at
            }
            IlsValue::StrList(list) => {
                let payloads = list.iter().map(|s| s.as_bytes());
                self.list(payloads, list.len(), true, 1)
            }
            IlsValue::Items4(items) => {
                self.list(items.iter().map(|i| &i[..]), items.len(), false, 4)
            }
            IlsValue::Items8(items) => {
                self.list(items.iter().map(|i| &i[..]), items.len(), false, 8)
            }
            IlsValue::Items16(items) => {
                self.list(items.iter().map(|i| &i[..]), items.len(), false, 8)
            }
        }
    }

    fn scalar(&mut self, bytes: &[u8]) -> usize {
        let at = self.slot(bytes.len());
        self.put(at, bytes);
        at
    }

    fn list<'v>(
        &mut self,
        payloads: impl Iterator<Item = &'v [u8]>,
        count: usize,
        nul: bool,
        align: usize,
    ) -> usize {
        let at = self.slot(PTR);
        // Terminator slot stays zero.
        let array = self.payload(&[], (count + 1) * PTR, PTR);
        self.put_word(at, array);
        for (idx, bytes) in payloads.enumerate() {
            let size = bytes.len() + usize::from(nul);
            let target = self.payload(bytes, size, align);
            self.put_word(array + idx * PTR, target);
        }
        at
    }

    /// Reserves a natively aligned header slot.
    fn slot(&mut self, size: usize) -> usize {
        self.header = align_up(self.header, size);
        let at = self.header;
        self.header += size;
        at
    }

    /// Reserves `size` data bytes, copies `bytes` in, returns the absolute offset.
    fn payload(&mut self, bytes: &[u8], size: usize, align: usize) -> usize {
        self.data = align_up(self.data, align);
        let at = self.data_base + self.data;
        self.data += size;
        self.put(at, bytes);
        at
    }

    fn put_word(&mut self, at: usize, value: usize) {
        self.put(at, &value.to_ne_bytes());
    }

    fn put(&mut self, at: usize, bytes: &[u8]) {
        if let Some(out) = self.out.as_deref_mut() {
            out[at..at + bytes.len()].copy_from_slice(bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passwd_shaped_record_reads_back() {
        let groups = ["staff", "admin"];
        let record = build(
            "s4*s",
            &[
                IlsValue::Str(Some("alice")),
                IlsValue::U32(501),
                IlsValue::StrList(&groups),
                IlsValue::Str(None),
            ],
        )
        .unwrap();

        let name = record.field_offset(0).unwrap();
        let uid = record.field_offset(1).unwrap();
        let list = record.field_offset(2).unwrap();
        let shell = record.field_offset(3).unwrap();

        assert_eq!(name, 0);
        assert_eq!(uid, PTR);
        assert_eq!(list % PTR, 0);
        assert_eq!(record.read_str(name), Some("alice"));
        assert_eq!(record.read_u32(uid), Some(501));
        assert_eq!(record.read_str_list(list), Some(vec!["staff", "admin"]));
        assert_eq!(record.read_str(shell), None);
    }

    #[test]
    fn cookie_follows_padded_header() {
        let record = build("1", &[IlsValue::U8(7)]).unwrap();
        assert_eq!(record.header_size(), 8);
        assert_eq!(&record.as_bytes()[8..16], &ILS_MAGIC);
        assert_eq!(record.len(), 16);
    }

    #[test]
    fn scalars_are_naturally_aligned() {
        let record = build(
            "128L",
            &[
                IlsValue::U8(1),
                IlsValue::U16(0x0203),
                IlsValue::U64(u64::MAX),
                IlsValue::Word(42),
            ],
        )
        .unwrap();
        assert_eq!(record.field_offset(1), Some(2));
        assert_eq!(record.field_offset(2), Some(8));
        assert_eq!(record.field_offset(3), Some(16));
        assert_eq!(record.read_u16(2), Some(0x0203));
        assert_eq!(record.read_u64(8), Some(u64::MAX));
        assert_eq!(record.read_word(16), Some(42));
    }

    #[test]
    fn address_lists_read_back() {
        let v4 = [[127, 0, 0, 1], [10, 0, 0, 2]];
        let v6 = [[0u8; 16]];
        let record = build(
            "sac",
            &[
                IlsValue::Str(Some("localhost")),
                IlsValue::Items4(&v4),
                IlsValue::Items16(&v6),
            ],
        )
        .unwrap();
        let a = record.field_offset(1).unwrap();
        let c = record.field_offset(2).unwrap();
        assert_eq!(record.read_items::<4>(a), Some(v4.to_vec()));
        assert_eq!(record.read_items::<16>(c), Some(v6.to_vec()));
    }

    #[test]
    fn empty_list_is_terminator_only() {
        let empty: [&str; 0] = [];
        let record = build("*", &[IlsValue::StrList(&empty)]).unwrap();
        assert_eq!(record.read_str_list(0), Some(Vec::new()));
    }

    #[test]
    fn release_with_correct_header_size() {
        let record = build("s4", &[IlsValue::Str(Some("x")), IlsValue::U32(1)]).unwrap();
        let header = record.header_size();
        assert!(record.release(header).is_ok());
    }

    #[test]
    fn release_unpadded_header_size_is_accepted() {
        // 12 bytes of fields round up to the same cookie offset.
        let record = build("s4", &[IlsValue::Str(Some("x")), IlsValue::U32(1)]).unwrap();
        assert!(record.release(PTR + 4).is_ok());
    }

    #[test]
    fn corrupted_footer_is_refused() {
        let mut record = build("4", &[IlsValue::U32(1)]).unwrap();
        let header = record.header_size();
        record.bytes_mut()[header] ^= 0xff;
        let err = record.release(header).unwrap_err();
        // The record came back intact apart from the patched byte.
        assert_eq!(err.record.read_u32(0), Some(1));
        assert_eq!(LiError::from(err), LiError::Corruption);
    }

    #[test]
    fn wrong_header_size_is_refused() {
        let record = build("88", &[IlsValue::U64(1), IlsValue::U64(2)]).unwrap();
        assert!(record.release(8).is_err());
    }

    #[test]
    fn huge_header_size_is_refused() {
        let record = build("s", &[IlsValue::Str(Some("root"))]).unwrap();
        for header in [usize::MAX, usize::MAX - 3, usize::MAX - ILS_MAGIC_SIZE + 1] {
            assert!(!record.cookie_matches(header));
        }
        let err = record.release(usize::MAX - 3).unwrap_err();
        assert_eq!(err.record.read_str(0), Some("root"));
    }

    #[test]
    fn format_mismatch_rejected() {
        assert!(matches!(
            build("4", &[IlsValue::U8(1)]),
            Err(LiError::InvalidFormat { index: 0, .. })
        ));
        assert!(matches!(
            build("44", &[IlsValue::U32(1)]),
            Err(LiError::InvalidFormat { .. })
        ));
        assert!(matches!(
            build("q", &[IlsValue::U8(1)]),
            Err(LiError::InvalidFormat { .. })
        ));
    }
}
