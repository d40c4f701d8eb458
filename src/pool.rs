use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

use crate::structs::Struct;

/// Size classes for pooled byte buffers. Requests larger than the top class
/// are allocated exactly and never pooled on return.
pub const SIZE_CLASSES: [usize; 8] = [
    256,
    512,
    1024,
    4096,
    16 * 1024,
    64 * 1024,
    256 * 1024,
    1024 * 1024,
];

// Fill levels are advisory: releases beyond these are dropped, not retained.
const MAX_BUFS_PER_CLASS: usize = 32;
const MAX_VECS_PER_POOL: usize = 64;
const MAX_STRUCTS_PER_MAPPING: usize = 64;

/// A pool of `Vec<u8>` buffers tiered by the fixed size classes above.
#[derive(Clone, Default)]
pub struct BytePool {
    classes: Rc<RefCell<HashMap<usize, VecDeque<Vec<u8>>>>>,
}

impl BytePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a cleared buffer whose capacity is the smallest class that
    /// can hold `size` bytes. Oversized requests allocate exactly `size`.
    pub fn get(&self, size: usize) -> PooledBuf {
        let vec = match SIZE_CLASSES.iter().find(|&&class| class >= size) {
            Some(&class) => self
                .classes
                .borrow_mut()
                .entry(class)
                .or_default()
                .pop_front()
                .unwrap_or_else(|| Vec::with_capacity(class)),
            None => Vec::with_capacity(size),
        };

        PooledBuf {
            vec: Some(vec),
            pool: self.clone(),
        }
    }

    /// Allocates a buffer and fills it with `data`.
    pub fn from_slice(&self, data: &[u8]) -> PooledBuf {
        let mut buf = self.get(data.len());
        buf.extend_from_slice(data);
        buf
    }

    // Routes by exact capacity match; anything else is dropped.
    fn put(&self, mut vec: Vec<u8>) {
        if !SIZE_CLASSES.contains(&vec.capacity()) {
            return;
        }
        vec.clear();

        let mut classes = self.classes.borrow_mut();
        let deque = classes.entry(vec.capacity()).or_default();
        if deque.len() < MAX_BUFS_PER_CLASS {
            deque.push_back(vec);
        }
    }

    /// Current retained buffer count per class (for testing).
    pub fn class_sizes(&self) -> HashMap<usize, usize> {
        self.classes
            .borrow()
            .iter()
            .map(|(class, deque)| (*class, deque.len()))
            .collect()
    }
}

/// A `Vec<u8>` on loan from a [`BytePool`], returned automatically on drop.
pub struct PooledBuf {
    vec: Option<Vec<u8>>,
    pool: BytePool,
}

impl Deref for PooledBuf {
    type Target = Vec<u8>;
    fn deref(&self) -> &Vec<u8> {
        self.vec.as_ref().unwrap()
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        self.vec.as_mut().unwrap()
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(vec) = self.vec.take() {
            self.pool.put(vec);
        }
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf").field("len", &self.len()).finish()
    }
}

/// A shared, immutable view into a pooled buffer.
///
/// Nested structs and struct-list elements hold narrowed `RawBuf`s over
/// their parent's unmarshal buffer, so a decode shares one backing
/// allocation; it returns to the pool when the last view drops.
#[derive(Clone, Debug)]
pub struct RawBuf {
    buf: Rc<PooledBuf>,
    start: usize,
    len: usize,
}

impl RawBuf {
    pub fn new(buf: PooledBuf) -> Self {
        let len = buf.len();
        Self {
            buf: Rc::new(buf),
            start: 0,
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf[self.start..self.start + self.len]
    }

    /// A narrowed view relative to this one. Callers validate bounds first;
    /// a range past the end is a programming error.
    pub fn slice(&self, start: usize, len: usize) -> RawBuf {
        assert!(start + len <= self.len, "RawBuf slice out of range");
        RawBuf {
            buf: Rc::clone(&self.buf),
            start: self.start + start,
            len,
        }
    }
}

/// A typed pool of `Vec<T>` scratch arrays (field slots, state arrays,
/// offset indexes, number-list storage).
pub struct VecPool<T> {
    free: Rc<RefCell<Vec<Vec<T>>>>,
}

impl<T> Clone for VecPool<T> {
    fn clone(&self) -> Self {
        Self {
            free: Rc::clone(&self.free),
        }
    }
}

impl<T> Default for VecPool<T> {
    fn default() -> Self {
        Self {
            free: Rc::new(RefCell::new(Vec::new())),
        }
    }
}

impl<T> VecPool<T> {
    pub fn get(&self) -> Vec<T> {
        self.free.borrow_mut().pop().unwrap_or_default()
    }

    pub fn put(&self, mut vec: Vec<T>) {
        vec.clear();
        let mut free = self.free.borrow_mut();
        if free.len() < MAX_VECS_PER_POOL {
            free.push(vec);
        }
    }

    pub fn retained(&self) -> usize {
        self.free.borrow().len()
    }
}

/// The context-scoped pool registry threaded through construction, decode
/// and recycle. Cloning shares the underlying pools; the whole registry is
/// single-owner (`Rc`-based) like the rest of the runtime.
#[derive(Clone, Default)]
pub struct Pools {
    pub bytes: BytePool,
    by_type: Rc<RefCell<HashMap<TypeId, Box<dyn Any>>>>,
    structs: Rc<RefCell<HashMap<usize, Vec<Struct>>>>,
}

impl Pools {
    pub fn new() -> Self {
        Self::default()
    }

    /// The `Vec<T>` pool for a concrete element type, created on first use.
    /// Number lists key their storage pools this way, one per width, sign
    /// and floatness combination.
    pub fn vecs<T: 'static>(&self) -> VecPool<T> {
        let mut by_type = self.by_type.borrow_mut();
        let entry = by_type
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(VecPool::<T>::default()));
        entry
            .downcast_ref::<VecPool<T>>()
            .expect("pool registry entry has the keyed type")
            .clone()
    }

    pub(crate) fn get_struct(&self, mapping_key: usize) -> Option<Struct> {
        self.structs.borrow_mut().get_mut(&mapping_key)?.pop()
    }

    pub(crate) fn put_struct(&self, mapping_key: usize, handle: Struct) {
        let mut structs = self.structs.borrow_mut();
        let free = structs.entry(mapping_key).or_default();
        if free.len() < MAX_STRUCTS_PER_MAPPING {
            free.push(handle);
        }
    }

    pub(crate) fn retained_structs(&self, mapping_key: usize) -> usize {
        self.structs
            .borrow()
            .get(&mapping_key)
            .map_or(0, Vec::len)
    }
}
