use std::cell::RefCell;
use std::io::Write;
use std::rc::{Rc, Weak};

use crate::errors::ClawError;
use crate::lists::ListOwner;
use crate::pool::{Pools, VecPool};
use crate::structs::StructInner;
use crate::value::FixedNumeric;
use crate::wire::{padding_needed, word_aligned, Header, HEADER_LEN};

/// A list of fixed-width numbers stored contiguously. One generic
/// implementation covers every width, signedness and floatness; storage is
/// pooled per concrete element type.
pub struct Numbers<T: FixedNumeric> {
    inner: Rc<RefCell<NumbersInner<T>>>,
}

impl<T: FixedNumeric> Clone for Numbers<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

pub(crate) struct NumbersInner<T: FixedNumeric> {
    items: Vec<T>,
    size: u64,
    field_num: u16,
    owner: Option<ListOwner>,
    pool: Option<VecPool<T>>,
}

impl<T: FixedNumeric> Drop for NumbersInner<T> {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.put(std::mem::take(&mut self.items));
        }
    }
}

impl<T: FixedNumeric> Default for Numbers<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: FixedNumeric> Numbers<T> {
    pub fn new() -> Self {
        Self::with_storage(Vec::new(), None)
    }

    /// Builds the list on pooled storage from the context registry.
    pub fn with_pools(pools: &Pools) -> Self {
        let pool = pools.vecs::<T>();
        Self::with_storage(pool.get(), Some(pool))
    }

    fn with_storage(items: Vec<T>, pool: Option<VecPool<T>>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(NumbersInner {
                items,
                size: 0,
                field_num: 0,
                owner: None,
                pool,
            })),
        }
    }

    pub(crate) fn from_wire(count: u64, payload: &[u8], pools: &Pools) -> Result<Self, ClawError> {
        let count = count as usize;
        let needed = count * T::WIDTH;
        if payload.len() < needed {
            return Err(ClawError::Truncated {
                needed,
                remaining: payload.len(),
            });
        }

        let list = Self::with_pools(pools);
        {
            let mut inner = list.inner.borrow_mut();
            inner.items.reserve(count);
            for chunk in payload[..needed].chunks_exact(T::WIDTH) {
                inner.items.push(T::read_le(chunk));
            }
            inner.size = wire_size_for::<T>(count);
        }
        Ok(list)
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Result<T, ClawError> {
        let inner = self.inner.borrow();
        inner
            .items
            .get(index)
            .copied()
            .ok_or(ClawError::OutOfBounds {
                index,
                len: inner.items.len(),
            })
    }

    pub fn set(&self, index: usize, value: T) -> Result<(), ClawError> {
        let mut inner = self.inner.borrow_mut();
        let len = inner.items.len();
        match inner.items.get_mut(index) {
            Some(slot) => *slot = value,
            None => return Err(ClawError::OutOfBounds { index, len }),
        }

        let owner = inner.owner.clone();
        drop(inner);
        if let Some(owner) = owner {
            owner.touch(0);
        }
        Ok(())
    }

    pub fn append(&self, value: T) -> Result<(), ClawError> {
        let mut inner = self.inner.borrow_mut();

        let new_size = wire_size_for::<T>(inner.items.len() + 1);
        let delta = new_size - inner.size;
        if delta > 0 {
            if let Some(owner) = &inner.owner {
                owner.check_grow(delta)?;
            }
        }

        inner.items.push(value);
        inner.size = new_size;

        let owner = inner.owner.clone();
        drop(inner);
        if let Some(owner) = owner {
            owner.touch(delta as i64);
        }
        Ok(())
    }

    pub fn range(&self, from: usize, to: usize) -> Result<Vec<T>, ClawError> {
        let inner = self.inner.borrow();
        if from > to || to > inner.items.len() {
            return Err(ClawError::OutOfBounds {
                index: to,
                len: inner.items.len(),
            });
        }
        Ok(inner.items[from..to].to_vec())
    }

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
        if inner.items.is_empty() {
            return Ok(0);
        }

        let header = Header::new(inner.field_num, T::LIST_TYPE, inner.items.len() as u64)?;
        writer.write_all(&header.pack())?;

        let mut scratch = [0u8; 8];
        for item in &inner.items {
            item.write_le(&mut scratch[..T::WIDTH]);
            writer.write_all(&scratch[..T::WIDTH])?;
        }

        let data_len = inner.items.len() * T::WIDTH;
        let pad = padding_needed(data_len);
        writer.write_all(&[0u8; 8][..pad])?;

        Ok((HEADER_LEN + data_len + pad) as u64)
    }
}

fn wire_size_for<T: FixedNumeric>(len: usize) -> u64 {
    if len == 0 {
        0
    } else {
        (HEADER_LEN + word_aligned(len * T::WIDTH)) as u64
    }
}

impl<T: FixedNumeric> std::fmt::Debug for Numbers<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Numbers")
            .field("len", &inner.items.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::FieldType;

    #[test]
    fn test_append_get_range() {
        let list = Numbers::<u32>::new();
        for v in [10u32, 20, 30, 40] {
            list.append(v).unwrap();
        }

        assert_eq!(list.len(), 4);
        assert_eq!(list.get(2).unwrap(), 30);
        assert_eq!(list.range(1, 3).unwrap(), vec![20, 30]);
        assert!(matches!(list.get(4), Err(ClawError::OutOfBounds { .. })));
    }

    #[test]
    fn test_wire_size_rounds_to_words() {
        let list = Numbers::<u16>::new();
        list.append(1).unwrap();
        // 8-byte header + one word holding 2 payload bytes.
        assert_eq!(list.wire_size(), 16);

        for v in 2..=4u16 {
            list.append(v).unwrap();
        }
        assert_eq!(list.wire_size(), 16);

        list.append(5).unwrap();
        assert_eq!(list.wire_size(), 24);
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let pools = Pools::new();
        let list = Numbers::<i64>::new();
        for v in [-1i64, 0, 7_000_000_000] {
            list.append(v).unwrap();
        }

        let mut buf = Vec::new();
        let written = list.encode(&mut buf).unwrap();
        assert_eq!(written as usize, buf.len());
        assert_eq!(buf.len(), 8 + 24);

        let header = Header::unpack(&buf).unwrap();
        assert_eq!(header.field_type, FieldType::ListInt64);

        let decoded = Numbers::<i64>::from_wire(header.final40, &buf[HEADER_LEN..], &pools).unwrap();
        assert_eq!(decoded.range(0, 3).unwrap(), vec![-1, 0, 7_000_000_000]);
    }

    #[test]
    fn test_float_payload_round_trips_bits() {
        let pools = Pools::new();
        let list = Numbers::<f32>::new();
        for v in [1.5f32, -0.0, f32::MIN_POSITIVE] {
            list.append(v).unwrap();
        }

        let mut buf = Vec::new();
        list.encode(&mut buf).unwrap();

        let header = Header::unpack(&buf).unwrap();
        let decoded = Numbers::<f32>::from_wire(header.final40, &buf[HEADER_LEN..], &pools).unwrap();
        assert_eq!(decoded.get(0).unwrap().to_bits(), 1.5f32.to_bits());
        assert_eq!(decoded.get(1).unwrap().to_bits(), (-0.0f32).to_bits());
    }

    #[test]
    fn test_pooled_storage_returns_on_drop() {
        let pools = Pools::new();
        {
            let list = Numbers::<u64>::with_pools(&pools);
            list.append(9).unwrap();
        }
        assert_eq!(pools.vecs::<u64>().retained(), 1);
    }
}
