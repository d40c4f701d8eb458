use std::cell::RefCell;
use std::io::Write;
use std::rc::{Rc, Weak};

use byteorder::{ByteOrder, LittleEndian};

use crate::errors::ClawError;
use crate::lists::ListOwner;
use crate::structs::StructInner;
use crate::wire::{padding_needed, FieldType, Header, WireCursor, HEADER_LEN, MAX_FINAL40};

/// A list of variable-length byte items backed by a contiguous arena plus a
/// `u32` offsets side array: item `i` is `data[offsets[i]..offsets[i + 1]]`,
/// so reads are a single slice with no pointer chasing.
#[derive(Clone)]
pub struct BytesList {
    inner: Rc<RefCell<BytesInner>>,
}

pub(crate) struct BytesInner {
    data: Vec<u8>,
    offsets: Vec<u32>,
    size: u64,
    field_num: u16,
    tag: FieldType,
    owner: Option<ListOwner>,
}

impl Default for BytesList {
    fn default() -> Self {
        Self::new()
    }
}

impl BytesList {
    pub fn new() -> Self {
        Self::with_tag(FieldType::ListBytes)
    }

    fn with_tag(tag: FieldType) -> Self {
        Self {
            inner: Rc::new(RefCell::new(BytesInner {
                data: Vec::new(),
                offsets: vec![0],
                size: 0,
                field_num: 0,
                tag,
                owner: None,
            })),
        }
    }

    /// Decodes `count` length-prefixed items. Two passes: the first sizes
    /// the arena so it is allocated exactly once, the second copies.
    pub(crate) fn from_wire(tag: FieldType, count: u64, payload: &[u8]) -> Result<Self, ClawError> {
        let count = count as usize;

        let mut sizing = WireCursor::new(payload);
        let mut total = 0usize;
        for _ in 0..count {
            let item_len = sizing.take_u32()? as usize;
            sizing.skip(item_len)?;
            total += item_len;
        }

        let list = Self::with_tag(tag);
        {
            let mut inner = list.inner.borrow_mut();
            inner.data.reserve_exact(total);
            inner.offsets.reserve_exact(count);

            let mut cursor = WireCursor::new(payload);
            for _ in 0..count {
                let item_len = cursor.take_u32()? as usize;
                inner.data.extend_from_slice(cursor.advance(item_len)?);
                let end = inner.data.len() as u32;
                inner.offsets.push(end);
            }
            inner.size = wire_size_for(count, inner.data.len());
        }
        Ok(list)
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().offsets.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Result<Vec<u8>, ClawError> {
        let inner = self.inner.borrow();
        let len = inner.offsets.len() - 1;
        if index >= len {
            return Err(ClawError::OutOfBounds { index, len });
        }
        let start = inner.offsets[index] as usize;
        let end = inner.offsets[index + 1] as usize;
        Ok(inner.data[start..end].to_vec())
    }

    /// Replaces item `index`. A same-length value is written in place; a
    /// different length rebuilds the arena with one allocation and shifts
    /// the later offsets.
    pub fn set(&self, index: usize, value: &[u8]) -> Result<(), ClawError> {
        let mut inner = self.inner.borrow_mut();
        let len = inner.offsets.len() - 1;
        if index >= len {
            return Err(ClawError::OutOfBounds { index, len });
        }

        let start = inner.offsets[index] as usize;
        let end = inner.offsets[index + 1] as usize;
        let old_len = end - start;

        let delta: i64 = if value.len() == old_len {
            inner.data[start..end].copy_from_slice(value);
            0
        } else {
            let new_data_len = inner.data.len() - old_len + value.len();
            check_arena_len(inner.field_num, new_data_len)?;

            let new_size = wire_size_for(len, new_data_len);
            let delta = new_size as i64 - inner.size as i64;
            if delta > 0 {
                if let Some(owner) = &inner.owner {
                    owner.check_grow(delta as u64)?;
                }
            }

            let mut data = Vec::with_capacity(new_data_len);
            data.extend_from_slice(&inner.data[..start]);
            data.extend_from_slice(value);
            data.extend_from_slice(&inner.data[end..]);
            inner.data = data;

            let shift = value.len() as i64 - old_len as i64;
            for offset in inner.offsets[index + 1..].iter_mut() {
                *offset = (*offset as i64 + shift) as u32;
            }
            inner.size = new_size;
            delta
        };

        let owner = inner.owner.clone();
        drop(inner);
        if let Some(owner) = owner {
            owner.touch(delta);
        }
        Ok(())
    }

    pub fn append(&self, value: &[u8]) -> Result<(), ClawError> {
        let mut inner = self.inner.borrow_mut();
        let len = inner.offsets.len() - 1;

        let new_data_len = inner.data.len() + value.len();
        check_arena_len(inner.field_num, new_data_len)?;

        let new_size = wire_size_for(len + 1, new_data_len);
        let delta = new_size - inner.size;
        if let Some(owner) = &inner.owner {
            owner.check_grow(delta)?;
        }

        inner.data.extend_from_slice(value);
        let end = inner.data.len() as u32;
        inner.offsets.push(end);
        inner.size = new_size;

        let owner = inner.owner.clone();
        drop(inner);
        if let Some(owner) = owner {
            owner.touch(delta as i64);
        }
        Ok(())
    }

    pub fn range(&self, from: usize, to: usize) -> Result<Vec<Vec<u8>>, ClawError> {
        let inner = self.inner.borrow();
        let len = inner.offsets.len() - 1;
        if from > to || to > len {
            return Err(ClawError::OutOfBounds { index: to, len });
        }
        Ok((from..to)
            .map(|i| {
                let start = inner.offsets[i] as usize;
                let end = inner.offsets[i + 1] as usize;
                inner.data[start..end].to_vec()
            })
            .collect())
    }

    pub(crate) fn wire_size(&self) -> u64 {
        self.inner.borrow().size
    }

    pub(crate) fn tag(&self) -> FieldType {
        self.inner.borrow().tag
    }

    pub(crate) fn attach(
        &self,
        field_num: u16,
        owner: Weak<RefCell<StructInner>>,
    ) -> Result<(), ClawError> {
        let mut inner = self.inner.borrow_mut();
        if inner.owner.is_some() {
            return Err(ClawError::AlreadyAttached { field: field_num });
        }
        inner.field_num = field_num;
        inner.owner = Some(ListOwner { owner });
        Ok(())
    }

    pub(crate) fn detach(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.owner = None;
        inner.field_num = 0;
    }

    /// Emits `header || (u32 length || payload)* || one trailing pad run`.
    pub(crate) fn encode<W: Write>(&self, writer: &mut W) -> Result<u64, ClawError> {
        let inner = self.inner.borrow();
        let len = inner.offsets.len() - 1;
        if len == 0 {
            return Ok(0);
        }

        let header = Header::new(inner.field_num, inner.tag, len as u64)?;
        writer.write_all(&header.pack())?;

        let mut prefix = [0u8; 4];
        for i in 0..len {
            let start = inner.offsets[i] as usize;
            let end = inner.offsets[i + 1] as usize;
            LittleEndian::write_u32(&mut prefix, (end - start) as u32);
            writer.write_all(&prefix)?;
            writer.write_all(&inner.data[start..end])?;
        }

        let unpadded = HEADER_LEN + 4 * len + inner.data.len();
        let pad = padding_needed(unpadded);
        writer.write_all(&[0u8; 8][..pad])?;

        Ok((unpadded + pad) as u64)
    }
}

fn wire_size_for(len: usize, data_len: usize) -> u64 {
    if len == 0 {
        0
    } else {
        let unpadded = HEADER_LEN + 4 * len + data_len;
        (unpadded + padding_needed(unpadded)) as u64
    }
}

fn check_arena_len(field: u16, data_len: usize) -> Result<(), ClawError> {
    if data_len as u64 > u32::MAX as u64 || data_len as u64 > MAX_FINAL40 {
        return Err(ClawError::SizeOverflow {
            field,
            size: data_len as u64,
        });
    }
    Ok(())
}

impl std::fmt::Debug for BytesList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BytesList").field("len", &self.len()).finish()
    }
}

/// [`BytesList`] with string accessors overlaid. Items are UTF-8 on the
/// wire; the encoding is shared with the bytes list down to the tag.
#[derive(Clone, Debug)]
pub struct Strings {
    list: BytesList,
}

impl Default for Strings {
    fn default() -> Self {
        Self::new()
    }
}

impl Strings {
    pub fn new() -> Self {
        Self {
            list: BytesList::with_tag(FieldType::ListStrings),
        }
    }

    pub(crate) fn from_wire(count: u64, payload: &[u8]) -> Result<Self, ClawError> {
        Ok(Self {
            list: BytesList::from_wire(FieldType::ListStrings, count, payload)?,
        })
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn get(&self, index: usize) -> Result<String, ClawError> {
        Ok(String::from_utf8(self.list.get(index)?)?)
    }

    pub fn set(&self, index: usize, value: &str) -> Result<(), ClawError> {
        self.list.set(index, value.as_bytes())
    }

    pub fn append(&self, value: &str) -> Result<(), ClawError> {
        self.list.append(value.as_bytes())
    }

    pub fn range(&self, from: usize, to: usize) -> Result<Vec<String>, ClawError> {
        self.list
            .range(from, to)?
            .into_iter()
            .map(|item| Ok(String::from_utf8(item)?))
            .collect()
    }

    pub(crate) fn wire_size(&self) -> u64 {
        self.list.wire_size()
    }

    pub(crate) fn attach(
        &self,
        field_num: u16,
        owner: Weak<RefCell<StructInner>>,
    ) -> Result<(), ClawError> {
        self.list.attach(field_num, owner)
    }

    pub(crate) fn detach(&self) {
        self.list.detach()
    }

    pub(crate) fn encode<W: Write>(&self, writer: &mut W) -> Result<u64, ClawError> {
        self.list.encode(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_get_offsets() {
        let list = BytesList::new();
        list.append(b"a").unwrap();
        list.append(b"bb").unwrap();
        list.append(b"ccc").unwrap();

        assert_eq!(list.len(), 3);
        assert_eq!(list.get(0).unwrap(), b"a");
        assert_eq!(list.get(1).unwrap(), b"bb");
        assert_eq!(list.get(2).unwrap(), b"ccc");

        let inner = list.inner.borrow();
        assert_eq!(inner.offsets, vec![0, 1, 3, 6]);
    }

    #[test]
    fn test_same_length_set_is_in_place() {
        let list = BytesList::new();
        list.append(b"aaa").unwrap();
        list.append(b"bbb").unwrap();

        let before = list.wire_size();
        list.set(0, b"xyz").unwrap();
        assert_eq!(list.wire_size(), before);
        assert_eq!(list.get(0).unwrap(), b"xyz");
        assert_eq!(list.get(1).unwrap(), b"bbb");
    }

    #[test]
    fn test_resizing_set_shifts_later_offsets() {
        let list = BytesList::new();
        list.append(b"short").unwrap();
        list.append(b"tail").unwrap();

        list.set(0, b"a-much-longer-item").unwrap();
        assert_eq!(list.get(0).unwrap(), b"a-much-longer-item");
        assert_eq!(list.get(1).unwrap(), b"tail");

        list.set(0, b"s").unwrap();
        assert_eq!(list.get(0).unwrap(), b"s");
        assert_eq!(list.get(1).unwrap(), b"tail");
    }

    #[test]
    fn test_encode_layout() {
        let list = BytesList::new();
        list.append(b"a").unwrap();
        list.append(b"bb").unwrap();
        list.append(b"ccc").unwrap();

        let mut buf = Vec::new();
        let written = list.encode(&mut buf).unwrap();

        // header + (4+1) + (4+2) + (4+3) = 26, padded up to 32.
        assert_eq!(written, 32);
        assert_eq!(buf.len(), 32);
        assert_eq!(&buf[8..13], &[1, 0, 0, 0, b'a']);
        assert_eq!(&buf[26..], &[0u8; 6]);
    }

    #[test]
    fn test_decode_round_trip() {
        let list = BytesList::new();
        list.append(b"one").unwrap();
        list.append(b"").unwrap();
        list.append(b"three").unwrap();

        let mut buf = Vec::new();
        list.encode(&mut buf).unwrap();

        let header = Header::unpack(&buf).unwrap();
        let decoded =
            BytesList::from_wire(header.field_type, header.final40, &buf[HEADER_LEN..]).unwrap();

        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded.get(0).unwrap(), b"one");
        assert_eq!(decoded.get(1).unwrap(), b"");
        assert_eq!(decoded.get(2).unwrap(), b"three");
        assert_eq!(decoded.wire_size(), list.wire_size());
    }

    #[test]
    fn test_string_accessors() {
        let list = Strings::new();
        list.append("hello").unwrap();
        list.append("wörld").unwrap();

        assert_eq!(list.get(1).unwrap(), "wörld");
        assert_eq!(
            list.range(0, 2).unwrap(),
            vec!["hello".to_string(), "wörld".to_string()]
        );
    }
}
