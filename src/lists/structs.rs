use std::cell::RefCell;
use std::io::Write;
use std::rc::{Rc, Weak};

use crate::errors::ClawError;
use crate::lists::ListOwner;
use crate::mapping::Mapping;
use crate::pool::{Pools, RawBuf};
use crate::structs::{Struct, StructInner};
use crate::wire::{FieldType, Header, HEADER_LEN};

/// A list of structs sharing one mapping. Elements decoded from the wire
/// stay as raw bytes until first access, mirroring the per-field lazy model
/// one level down: `raw` holds the contiguous element bytes, `offsets`
/// indexes them, and `decoded` caches the elements that have been touched.
#[derive(Clone)]
pub struct Structs {
    inner: Rc<RefCell<StructsInner>>,
}

pub(crate) struct StructsInner {
    pub(crate) mapping: Rc<Mapping>,
    pub(crate) pools: Pools,
    pub(crate) raw: Option<RawBuf>,
    pub(crate) offsets: Vec<u32>,
    pub(crate) decoded: Vec<Option<Struct>>,
    pub(crate) dirty: Vec<bool>,
    pub(crate) size: u64,
    pub(crate) field_num: u16,
    pub(crate) owner: Option<ListOwner>,
    pub(crate) is_set_enabled: bool,
    self_weak: Weak<RefCell<StructsInner>>,
}

impl Structs {
    pub fn new(mapping: &Rc<Mapping>, pools: &Pools) -> Self {
        Self::build(mapping, pools, None, vec![0], 0, 0, false)
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        mapping: &Rc<Mapping>,
        pools: &Pools,
        raw: Option<RawBuf>,
        offsets: Vec<u32>,
        count: usize,
        size: u64,
        is_set_enabled: bool,
    ) -> Self {
        let inner = Rc::new_cyclic(|self_weak| {
            RefCell::new(StructsInner {
                mapping: Rc::clone(mapping),
                pools: pools.clone(),
                raw,
                offsets,
                decoded: (0..count).map(|_| None).collect(),
                dirty: vec![false; count],
                size,
                field_num: 0,
                owner: None,
                is_set_enabled,
                self_weak: self_weak.clone(),
            })
        });
        Self { inner }
    }

    /// Decodes a list field (header included in `field_raw`). Element
    /// payloads are shared views into the unmarshal buffer, not copies.
    pub(crate) fn from_wire(
        mapping: &Rc<Mapping>,
        field_raw: RawBuf,
        pools: &Pools,
        is_set_enabled: bool,
    ) -> Result<Self, ClawError> {
        let bytes = field_raw.bytes();
        let header = Header::unpack(bytes)?;
        let count = header.final40 as usize;

        let mut offsets = Vec::with_capacity(count + 1);
        offsets.push(0u32);

        let mut pos = HEADER_LEN;
        for _ in 0..count {
            let elem = Header::unpack(bytes.get(pos..).unwrap_or(&[]))?;
            if elem.final40 < HEADER_LEN as u64 || pos as u64 + elem.final40 > bytes.len() as u64 {
                return Err(ClawError::SizeMismatch {
                    declared: elem.final40,
                    observed: (bytes.len() - pos) as u64,
                });
            }
            pos += elem.final40 as usize;
            offsets.push((pos - HEADER_LEN) as u32);
        }

        let raw = field_raw.slice(HEADER_LEN, field_raw.len() - HEADER_LEN);
        let list = Self::build(
            mapping,
            pools,
            Some(raw),
            offsets,
            count,
            field_raw.len() as u64,
            is_set_enabled,
        );
        list.inner.borrow_mut().field_num = header.field_num;
        Ok(list)
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().decoded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns element `index`, decoding it on first access.
    pub fn get(&self, index: usize) -> Result<Struct, ClawError> {
        let mut inner = self.inner.borrow_mut();
        let len = inner.decoded.len();
        if index >= len {
            return Err(ClawError::OutOfBounds { index, len });
        }

        if inner.decoded[index].is_none() {
            log::debug!("lazy-decoding struct list element {index}");
            let start = inner.offsets[index] as usize;
            let end = inner.offsets[index + 1] as usize;
            let raw = inner
                .raw
                .as_ref()
                .ok_or_else(|| {
                    ClawError::InternalError("undecoded element without raw bytes".into())
                })?
                .slice(start, end - start);

            let elem = Struct::from_raw_element(
                &inner.mapping,
                raw,
                &inner.pools,
                inner.is_set_enabled,
            )?;
            elem.attach_to_list(inner.self_weak.clone(), index)?;
            inner.decoded[index] = Some(elem);
        }

        Ok(inner.decoded[index].as_ref().unwrap().clone())
    }

    /// Replaces element `index` with an unattached struct using this list's
    /// mapping.
    pub fn set(&self, index: usize, element: Struct) -> Result<(), ClawError> {
        let mut inner = self.inner.borrow_mut();
        let len = inner.decoded.len();
        if index >= len {
            return Err(ClawError::OutOfBounds { index, len });
        }
        self.admit(&inner, &element)?;

        let old_footprint = match &inner.decoded[index] {
            Some(old) => old.wire_size(),
            None => u64::from(inner.offsets[index + 1] - inner.offsets[index]),
        };

        if inner.is_set_enabled {
            element.enable_is_set()?;
        }

        let delta = element.wire_size() as i64 - old_footprint as i64;
        if delta > 0 {
            if let Some(owner) = &inner.owner {
                owner.check_grow(delta as u64)?;
            }
        }

        if let Some(old) = inner.decoded[index].take() {
            old.detach();
        }
        element.attach_to_list(inner.self_weak.clone(), index)?;
        inner.decoded[index] = Some(element);
        inner.dirty[index] = true;
        inner.size = (inner.size as i64 + delta) as u64;

        let owner = inner.owner.clone();
        drop(inner);
        if let Some(owner) = owner {
            owner.touch(delta);
        }
        Ok(())
    }

    /// Appends an unattached struct using this list's mapping.
    pub fn append(&self, element: Struct) -> Result<(), ClawError> {
        let mut inner = self.inner.borrow_mut();
        self.admit(&inner, &element)?;

        if inner.is_set_enabled {
            element.enable_is_set()?;
        }

        let was_empty = inner.decoded.is_empty();
        let delta = element.wire_size() + if was_empty { HEADER_LEN as u64 } else { 0 };
        if let Some(owner) = &inner.owner {
            owner.check_grow(delta)?;
        }

        let index = inner.decoded.len();
        element.attach_to_list(inner.self_weak.clone(), index)?;

        let tail = *inner.offsets.last().unwrap();
        inner.offsets.push(tail);
        inner.decoded.push(Some(element));
        inner.dirty.push(true);
        inner.size += delta;

        let owner = inner.owner.clone();
        drop(inner);
        if let Some(owner) = owner {
            owner.touch(delta as i64);
        }
        Ok(())
    }

    fn admit(&self, inner: &StructsInner, element: &Struct) -> Result<(), ClawError> {
        if element.is_attached() {
            return Err(ClawError::AlreadyAttached {
                field: inner.field_num,
            });
        }
        let elem_mapping = element.mapping()?;
        if !Rc::ptr_eq(&elem_mapping, &inner.mapping) {
            return Err(ClawError::MappingMismatch {
                field: inner.field_num,
            });
        }
        Ok(())
    }

    pub(crate) fn wire_size(&self) -> u64 {
        self.inner.borrow().size
    }

    pub(crate) fn mapping(&self) -> Rc<Mapping> {
        Rc::clone(&self.inner.borrow().mapping)
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.inner.borrow().owner.is_some()
    }

    /// Detaches and recycles every decoded element; part of the transitive
    /// recycle of an enclosing struct.
    pub(crate) fn recycle_elements(&self) {
        let elements = {
            let mut inner = self.inner.borrow_mut();
            inner
                .decoded
                .iter_mut()
                .filter_map(Option::take)
                .collect::<Vec<_>>()
        };
        for element in elements {
            element.detach();
            let _ = element.recycle();
        }
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

    /// Enables explicit-set tracking on every element, transitively. Only
    /// legal before any wire data is held; raw elements cannot grow a
    /// trailer retroactively.
    pub(crate) fn enable_is_set(&self) -> Result<(), ClawError> {
        let elements = {
            let mut inner = self.inner.borrow_mut();
            if inner.is_set_enabled {
                return Ok(());
            }
            if inner.raw.is_some() {
                return Err(ClawError::IsSetAfterDecode);
            }
            inner.is_set_enabled = true;
            inner.decoded.iter().flatten().cloned().collect::<Vec<_>>()
        };

        // Element enables propagate their size deltas back through the list,
        // so the borrow must be released first.
        for element in elements {
            element.enable_is_set()?;
        }
        Ok(())
    }

    pub(crate) fn encode<W: Write>(&self, writer: &mut W) -> Result<u64, ClawError> {
        let inner = self.inner.borrow();
        let count = inner.decoded.len();
        if count == 0 {
            return Ok(0);
        }

        let header = Header::new(inner.field_num, FieldType::ListStructs, count as u64)?;
        writer.write_all(&header.pack())?;
        let mut written = HEADER_LEN as u64;

        // Untouched list: one block write of the raw element region.
        let untouched =
            inner.decoded.iter().all(Option::is_none) && !inner.dirty.iter().any(|&d| d);
        if untouched {
            let raw = inner.raw.as_ref().ok_or_else(|| {
                ClawError::InternalError("undecoded element without raw bytes".into())
            })?;
            writer.write_all(raw.bytes())?;
            return Ok(written + raw.len() as u64);
        }

        for index in 0..count {
            match &inner.decoded[index] {
                Some(element) => written += element.marshal(writer)?,
                None => {
                    let start = inner.offsets[index] as usize;
                    let end = inner.offsets[index + 1] as usize;
                    let raw = inner.raw.as_ref().ok_or_else(|| {
                        ClawError::InternalError("undecoded element without raw bytes".into())
                    })?;
                    writer.write_all(&raw.bytes()[start..end])?;
                    written += (end - start) as u64;
                }
            }
        }

        Ok(written)
    }

    /// True when neither the list shape nor any decoded element has
    /// uncommitted changes.
    pub(crate) fn is_pristine(&self) -> bool {
        let inner = self.inner.borrow();
        if inner.dirty.iter().any(|&d| d) {
            return false;
        }
        inner
            .decoded
            .iter()
            .flatten()
            .all(|element| element.is_pristine())
    }
}

impl std::fmt::Debug for Structs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Structs")
            .field("mapping", &inner.mapping.name)
            .field("len", &inner.decoded.len())
            .finish()
    }
}
