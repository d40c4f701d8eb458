use std::cell::RefCell;
use std::io::Write;
use std::rc::{Rc, Weak};

use crate::errors::ClawError;
use crate::lists::ListOwner;
use crate::structs::StructInner;
use crate::wire::{word_aligned, FieldType, Header, HEADER_LEN, WORD};

/// A packed bit-vector list. Bit `i` lives at bit `i % 8` of byte `i / 8`.
#[derive(Clone)]
pub struct Bools {
    inner: Rc<RefCell<BoolsInner>>,
}

pub(crate) struct BoolsInner {
    // Storage grows in whole 8-byte words.
    data: Vec<u8>,
    len: usize,
    size: u64,
    field_num: u16,
    owner: Option<ListOwner>,
}

impl Default for Bools {
    fn default() -> Self {
        Self::new()
    }
}

impl Bools {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(BoolsInner {
                data: Vec::new(),
                len: 0,
                size: 0,
                field_num: 0,
                owner: None,
            })),
        }
    }

    pub(crate) fn from_wire(count: u64, payload: &[u8]) -> Result<Self, ClawError> {
        let count = count as usize;
        let needed = count.div_ceil(8);
        if payload.len() < needed {
            return Err(ClawError::Truncated {
                needed,
                remaining: payload.len(),
            });
        }

        let mut data = payload[..needed].to_vec();
        data.resize(word_aligned(needed), 0);

        let list = Self::new();
        {
            let mut inner = list.inner.borrow_mut();
            inner.data = data;
            inner.len = count;
            inner.size = wire_size_for(count);
        }
        Ok(list)
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Result<bool, ClawError> {
        let inner = self.inner.borrow();
        if index >= inner.len {
            return Err(ClawError::OutOfBounds {
                index,
                len: inner.len,
            });
        }
        Ok(inner.data[index / 8] & (1 << (index % 8)) != 0)
    }

    pub fn set(&self, index: usize, value: bool) -> Result<(), ClawError> {
        let mut inner = self.inner.borrow_mut();
        if index >= inner.len {
            return Err(ClawError::OutOfBounds {
                index,
                len: inner.len,
            });
        }

        if value {
            inner.data[index / 8] |= 1 << (index % 8);
        } else {
            inner.data[index / 8] &= !(1 << (index % 8));
        }

        let owner = inner.owner.clone();
        drop(inner);
        if let Some(owner) = owner {
            owner.touch(0);
        }
        Ok(())
    }

    pub fn append(&self, value: bool) -> Result<(), ClawError> {
        let mut inner = self.inner.borrow_mut();

        let new_size = wire_size_for(inner.len + 1);
        let delta = new_size - inner.size;
        if delta > 0 {
            if let Some(owner) = &inner.owner {
                owner.check_grow(delta)?;
            }
        }

        if inner.len / 8 == inner.data.len() {
            inner.data.extend_from_slice(&[0u8; WORD]);
        }
        let index = inner.len;
        if value {
            inner.data[index / 8] |= 1 << (index % 8);
        }
        inner.len += 1;
        inner.size = new_size;

        let owner = inner.owner.clone();
        drop(inner);
        if let Some(owner) = owner {
            owner.touch(delta as i64);
        }
        Ok(())
    }

    pub fn range(&self, from: usize, to: usize) -> Result<Vec<bool>, ClawError> {
        let inner = self.inner.borrow();
        if from > to || to > inner.len {
            return Err(ClawError::OutOfBounds {
                index: to,
                len: inner.len,
            });
        }
        Ok((from..to)
            .map(|i| inner.data[i / 8] & (1 << (i % 8)) != 0)
            .collect())
    }

    /// Bytes this list contributes to the emit stream (zero when empty).
    pub(crate) fn wire_size(&self) -> u64 {
        self.inner.borrow().size
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

    pub(crate) fn encode<W: Write>(&self, writer: &mut W) -> Result<u64, ClawError> {
        let inner = self.inner.borrow();
        if inner.len == 0 {
            return Ok(0);
        }

        let header = Header::new(inner.field_num, FieldType::ListBools, inner.len as u64)?;
        writer.write_all(&header.pack())?;

        let body = word_aligned(inner.len.div_ceil(8));
        writer.write_all(&inner.data[..body])?;

        Ok((HEADER_LEN + body) as u64)
    }
}

fn wire_size_for(len: usize) -> u64 {
    if len == 0 {
        0
    } else {
        (HEADER_LEN + word_aligned(len.div_ceil(8))) as u64
    }
}

impl std::fmt::Debug for Bools {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Bools").field("len", &inner.len).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_packing_order() {
        let list = Bools::new();
        for value in [true, false, false, true, true, false, false, false, true] {
            list.append(value).unwrap();
        }

        // 0b0001_1001 in the first byte, bit 0 of the second.
        let inner = list.inner.borrow();
        assert_eq!(inner.data[0], 0b0001_1001);
        assert_eq!(inner.data[1], 0b0000_0001);
    }

    #[test]
    fn test_get_set_round_trip() {
        let list = Bools::new();
        for _ in 0..10 {
            list.append(false).unwrap();
        }

        list.set(7, true).unwrap();
        assert!(list.get(7).unwrap());
        assert!(!list.get(6).unwrap());

        list.set(7, false).unwrap();
        assert!(!list.get(7).unwrap());
    }

    #[test]
    fn test_bounds() {
        let list = Bools::new();
        list.append(true).unwrap();

        assert!(matches!(
            list.get(1),
            Err(ClawError::OutOfBounds { index: 1, len: 1 })
        ));
        assert!(matches!(
            list.range(0, 2),
            Err(ClawError::OutOfBounds { .. })
        ));
        assert_eq!(list.range(0, 1).unwrap(), vec![true]);
    }

    #[test]
    fn test_wire_size_tracks_word_growth() {
        let list = Bools::new();
        assert_eq!(list.wire_size(), 0);

        list.append(true).unwrap();
        // Header plus one padded word of bits.
        assert_eq!(list.wire_size(), 16);

        for _ in 0..63 {
            list.append(false).unwrap();
        }
        assert_eq!(list.len(), 64);
        assert_eq!(list.wire_size(), 16);

        list.append(true).unwrap();
        assert_eq!(list.wire_size(), 24);
    }

    #[test]
    fn test_encode_decode() {
        let list = Bools::new();
        for i in 0..12 {
            list.append(i % 3 == 0).unwrap();
        }

        let mut buf = Vec::new();
        let written = list.encode(&mut buf).unwrap();
        assert_eq!(written as usize, buf.len());
        assert_eq!(buf.len() % 8, 0);

        let header = Header::unpack(&buf).unwrap();
        assert_eq!(header.field_type, FieldType::ListBools);
        assert_eq!(header.final40, 12);

        let decoded = Bools::from_wire(header.final40, &buf[HEADER_LEN..]).unwrap();
        assert_eq!(decoded.len(), 12);
        for i in 0..12 {
            assert_eq!(decoded.get(i).unwrap(), i % 3 == 0);
        }
        assert_eq!(decoded.wire_size(), list.wire_size());
    }
}
