use std::cell::RefCell;
use std::io::{ErrorKind, Read, Write};
use std::rc::{Rc, Weak};

use crate::errors::ClawError;
use crate::is_set::IsSetBits;
use crate::lists::structs::StructsInner;
use crate::lists::{Bools, BytesList, Numbers, Strings, Structs};
use crate::mapping::{FieldDescriptor, Mapping};
use crate::pool::{Pools, RawBuf};
use crate::value::sealed::Sealed as _;
use crate::value::{FieldState, FieldValue, FixedNumeric, Value};
use crate::wire::{
    field_wire_size, padding_needed, word_aligned, FieldType, Header, HEADER_LEN, MAX_FINAL40,
    WORD,
};

macro_rules! scalar_accessors {
    ($get:ident, $set:ident, $ty:ty) => {
        pub fn $get(&self, field_num: u16) -> Result<Option<$ty>, ClawError> {
            self.get_number::<$ty>(field_num)
        }

        pub fn $set(&self, field_num: u16, value: $ty) -> Result<(), ClawError> {
            self.set_number::<$ty>(field_num, value)
        }
    };
}

/// Back reference from a struct to whatever holds it: a field slot of a
/// parent struct, or an element slot of a struct list.
#[derive(Clone)]
pub(crate) enum Parent {
    Field(Weak<RefCell<StructInner>>),
    ListElem {
        list: Weak<RefCell<StructsInner>>,
        index: usize,
    },
}

/// One entry of the offsets index built during unmarshal: where a field's
/// raw bytes live and how many of them there are.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawField {
    pub(crate) field_num: u16,
    pub(crate) offset: u32,
    pub(crate) size: u32,
}

pub(crate) struct StructInner {
    pub(crate) mapping: Option<Rc<Mapping>>,
    pub(crate) pools: Pools,
    pub(crate) self_weak: Weak<RefCell<StructInner>>,
    pub(crate) is_set_enabled: bool,
    header: Header,
    slots: Vec<Option<Value>>,
    states: Vec<FieldState>,
    raw: Option<RawBuf>,
    offsets: Vec<RawField>,
    total: u64,
    modified: bool,
    parent: Option<Parent>,
    is_set: Option<IsSetBits>,
    decoding: bool,
}

impl StructInner {
    pub(crate) fn install(&mut self, field_num: u16, value: Value) {
        self.slots[usize::from(field_num)] = Some(value);
    }

    /// Verifies that growing by `delta` keeps every total on the parent
    /// chain inside the 40-bit size field. Nothing is mutated.
    pub(crate) fn check_grow(&self, delta: u64) -> Result<(), ClawError> {
        if self.decoding {
            return Ok(());
        }

        let new_total = self.total.checked_add(delta).unwrap_or(u64::MAX);
        if new_total > MAX_FINAL40 {
            return Err(ClawError::SizeOverflow {
                field: self.header.field_num,
                size: new_total,
            });
        }

        match &self.parent {
            Some(Parent::Field(parent)) => match parent.upgrade() {
                Some(cell) => cell.borrow().check_grow(delta),
                None => Ok(()),
            },
            Some(Parent::ListElem { list, .. }) => match list.upgrade() {
                Some(cell) => {
                    let list_inner = cell.borrow();
                    match &list_inner.owner {
                        Some(owner) => owner.check_grow(delta),
                        None => Ok(()),
                    }
                }
                None => Ok(()),
            },
            None => Ok(()),
        }
    }

    /// The four-step mutator tail: applies a size delta to this struct,
    /// rewrites its header, marks it modified, and walks the parent chain
    /// doing the same. Suppressed while `Unmarshal` holds the decoding
    /// latch, when sizes are already reflected in the raw buffer.
    pub(crate) fn touch(&mut self, delta: i64) {
        if self.decoding {
            return;
        }

        self.modified = true;
        if delta != 0 {
            self.total = (self.total as i64 + delta) as u64;
            self.header.final40 = self.total;
        }

        match self.parent.clone() {
            Some(Parent::Field(parent)) => {
                if let Some(cell) = parent.upgrade() {
                    cell.borrow_mut().touch(delta);
                }
            }
            Some(Parent::ListElem { list, index }) => {
                if let Some(cell) = list.upgrade() {
                    let owner = {
                        let mut list_inner = cell.borrow_mut();
                        list_inner.dirty[index] = true;
                        if delta != 0 {
                            list_inner.size = (list_inner.size as i64 + delta) as u64;
                        }
                        list_inner.owner.clone()
                    };
                    if let Some(owner) = owner {
                        owner.touch(delta);
                    }
                }
            }
            None => {}
        }
    }

    fn lookup_raw(&self, field_num: u16) -> Option<RawField> {
        self.offsets
            .binary_search_by_key(&field_num, |rf| rf.field_num)
            .ok()
            .map(|idx| self.offsets[idx])
    }

    /// Bytes the field currently contributes to the wire, before a pending
    /// mutation: from the offsets index while raw, from the slot otherwise.
    fn previous_footprint(&self, field_num: u16) -> u64 {
        let index = usize::from(field_num);
        match self.states[index] {
            FieldState::Raw => self
                .lookup_raw(field_num)
                .map_or(0, |rf| u64::from(rf.size)),
            FieldState::Decoded | FieldState::Dirty => self.slots[index]
                .as_ref()
                .map_or(0, Value::footprint),
        }
    }
}

/// The decoded in-memory form of one message: a slot per field, lazily
/// populated from the raw buffer of the most recent unmarshal, with exact
/// wire-size tracking kept current through every mutation.
///
/// Handles are cheap clones sharing one underlying struct. The runtime is
/// single-owner: a struct and its subtree belong to one task at a time.
#[derive(Clone)]
pub struct Struct {
    inner: Rc<RefCell<StructInner>>,
}

impl Struct {
    pub fn new(mapping: &Rc<Mapping>, pools: &Pools) -> Struct {
        if let Some(recycled) = pools.get_struct(mapping.key()) {
            recycled.reinitialize(mapping);
            return recycled;
        }

        let field_count = mapping.field_count();
        let mut slots = pools.vecs::<Option<Value>>().get();
        slots.resize_with(field_count, || None);
        let mut states = pools.vecs::<FieldState>().get();
        states.resize(field_count, FieldState::Raw);

        let inner = Rc::new_cyclic(|self_weak| {
            RefCell::new(StructInner {
                mapping: Some(Rc::clone(mapping)),
                pools: pools.clone(),
                self_weak: self_weak.clone(),
                is_set_enabled: false,
                header: empty_header(),
                slots,
                states,
                raw: None,
                offsets: pools.vecs::<RawField>().get(),
                total: HEADER_LEN as u64,
                modified: false,
                parent: None,
                is_set: None,
                decoding: false,
            })
        });
        Struct { inner }
    }

    /// Builds a struct by unmarshaling `reader` in one step.
    pub fn unmarshal_from<R: Read>(
        mapping: &Rc<Mapping>,
        pools: &Pools,
        reader: &mut R,
    ) -> Result<Struct, ClawError> {
        let decoded = Struct::new(mapping, pools);
        decoded.unmarshal(reader)?;
        Ok(decoded)
    }

    fn reinitialize(&self, mapping: &Rc<Mapping>) {
        let mut inner = self.inner.borrow_mut();
        let field_count = mapping.field_count();

        inner.mapping = Some(Rc::clone(mapping));
        inner.header = empty_header();
        inner.slots = inner.pools.vecs::<Option<Value>>().get();
        inner.slots.resize_with(field_count, || None);
        inner.states = inner.pools.vecs::<FieldState>().get();
        inner.states.resize(field_count, FieldState::Raw);
        inner.offsets = inner.pools.vecs::<RawField>().get();
        inner.raw = None;
        inner.total = HEADER_LEN as u64;
        inner.modified = false;
        inner.parent = None;
        inner.is_set = None;
        inner.is_set_enabled = false;
        inner.decoding = false;
    }

    pub fn mapping(&self) -> Result<Rc<Mapping>, ClawError> {
        self.inner.borrow().mapping.clone().ok_or(ClawError::Recycled)
    }

    /// The exact byte length `marshal` would emit, header included.
    pub fn wire_size(&self) -> u64 {
        self.inner.borrow().total
    }

    pub fn is_modified(&self) -> bool {
        self.inner.borrow().modified
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.inner.borrow().parent.is_some()
    }

    pub(crate) fn detach(&self) {
        self.inner.borrow_mut().parent = None;
    }

    pub(crate) fn attach_to_field(
        &self,
        field_num: u16,
        parent: Weak<RefCell<StructInner>>,
    ) -> Result<(), ClawError> {
        let mut inner = self.inner.borrow_mut();
        if inner.parent.is_some() {
            return Err(ClawError::AlreadyAttached { field: field_num });
        }
        if inner.header.field_num != field_num {
            inner.header.field_num = field_num;
            // The retained raw header no longer matches; force re-emit.
            if inner.raw.is_some() {
                inner.modified = true;
            }
        }
        inner.parent = Some(Parent::Field(parent));
        Ok(())
    }

    pub(crate) fn attach_to_list(
        &self,
        list: Weak<RefCell<StructsInner>>,
        index: usize,
    ) -> Result<(), ClawError> {
        let mut inner = self.inner.borrow_mut();
        if inner.parent.is_some() {
            return Err(ClawError::AlreadyAttached {
                field: inner.header.field_num,
            });
        }
        inner.parent = Some(Parent::ListElem { list, index });
        Ok(())
    }

    // ------------------------ scalar accessors ------------------------

    /// Typed getter for fixed-width numeric fields. Triggers a lazy decode
    /// on first access; absent fields return `None`.
    pub fn get_number<T: FixedNumeric>(&self, field_num: u16) -> Result<Option<T>, ClawError> {
        let mut inner = self.inner.borrow_mut();
        let mapping = inner.mapping.clone().ok_or(ClawError::Recycled)?;
        expect_type(&mapping, field_num, T::SCALAR_TYPE)?;
        ensure_decoded(&mut inner, &mapping, field_num)?;

        match &inner.slots[usize::from(field_num)] {
            None => Ok(None),
            Some(value) => T::from_value(value).map(Some).ok_or_else(|| {
                ClawError::InternalError(format!("slot {field_num} holds a mismatched value"))
            }),
        }
    }

    /// Typed setter for fixed-width numeric fields. Zero values still
    /// occupy the slot but contribute no wire bytes.
    pub fn set_number<T: FixedNumeric>(&self, field_num: u16, value: T) -> Result<(), ClawError> {
        let mut inner = self.inner.borrow_mut();
        let mapping = inner.mapping.clone().ok_or(ClawError::Recycled)?;
        expect_type(&mapping, field_num, T::SCALAR_TYPE)?;

        let previous = inner.previous_footprint(field_num);
        commit(&mut inner, field_num, Some(value.into_value()), previous)
    }

    pub fn get_bool(&self, field_num: u16) -> Result<Option<bool>, ClawError> {
        let mut inner = self.inner.borrow_mut();
        let mapping = inner.mapping.clone().ok_or(ClawError::Recycled)?;
        expect_type(&mapping, field_num, FieldType::Bool)?;
        ensure_decoded(&mut inner, &mapping, field_num)?;

        match &inner.slots[usize::from(field_num)] {
            None => Ok(None),
            Some(Value::Bool(value)) => Ok(Some(*value)),
            Some(_) => Err(ClawError::InternalError(format!(
                "slot {field_num} holds a mismatched value"
            ))),
        }
    }

    pub fn set_bool(&self, field_num: u16, value: bool) -> Result<(), ClawError> {
        let mut inner = self.inner.borrow_mut();
        let mapping = inner.mapping.clone().ok_or(ClawError::Recycled)?;
        expect_type(&mapping, field_num, FieldType::Bool)?;

        let previous = inner.previous_footprint(field_num);
        commit(&mut inner, field_num, Some(Value::Bool(value)), previous)
    }

    scalar_accessors!(get_u8, set_u8, u8);
    scalar_accessors!(get_u16, set_u16, u16);
    scalar_accessors!(get_u32, set_u32, u32);
    scalar_accessors!(get_u64, set_u64, u64);
    scalar_accessors!(get_i8, set_i8, i8);
    scalar_accessors!(get_i16, set_i16, i16);
    scalar_accessors!(get_i32, set_i32, i32);
    scalar_accessors!(get_i64, set_i64, i64);
    scalar_accessors!(get_f32, set_f32, f32);
    scalar_accessors!(get_f64, set_f64, f64);

    // ------------------------ bytes and strings ------------------------

    pub fn get_bytes(&self, field_num: u16) -> Result<Option<Vec<u8>>, ClawError> {
        self.bytes_slot(field_num, FieldType::Bytes)
    }

    pub fn set_bytes(&self, field_num: u16, value: &[u8]) -> Result<(), ClawError> {
        self.set_bytes_slot(field_num, FieldType::Bytes, value)
    }

    pub fn get_str(&self, field_num: u16) -> Result<Option<String>, ClawError> {
        match self.bytes_slot(field_num, FieldType::String)? {
            None => Ok(None),
            Some(data) => Ok(Some(String::from_utf8(data)?)),
        }
    }

    pub fn set_str(&self, field_num: u16, value: &str) -> Result<(), ClawError> {
        self.set_bytes_slot(field_num, FieldType::String, value.as_bytes())
    }

    fn bytes_slot(
        &self,
        field_num: u16,
        requested: FieldType,
    ) -> Result<Option<Vec<u8>>, ClawError> {
        let mut inner = self.inner.borrow_mut();
        let mapping = inner.mapping.clone().ok_or(ClawError::Recycled)?;
        expect_type(&mapping, field_num, requested)?;
        ensure_decoded(&mut inner, &mapping, field_num)?;

        match &inner.slots[usize::from(field_num)] {
            None => Ok(None),
            Some(Value::Bytes(data)) => Ok(Some(data.clone())),
            Some(_) => Err(ClawError::InternalError(format!(
                "slot {field_num} holds a mismatched value"
            ))),
        }
    }

    fn set_bytes_slot(
        &self,
        field_num: u16,
        requested: FieldType,
        value: &[u8],
    ) -> Result<(), ClawError> {
        let mut inner = self.inner.borrow_mut();
        let mapping = inner.mapping.clone().ok_or(ClawError::Recycled)?;
        expect_type(&mapping, field_num, requested)?;

        if value.len() as u64 > MAX_FINAL40 {
            return Err(ClawError::SizeOverflow {
                field: field_num,
                size: value.len() as u64,
            });
        }

        let previous = inner.previous_footprint(field_num);
        commit(
            &mut inner,
            field_num,
            Some(Value::Bytes(value.to_vec())),
            previous,
        )
    }

    // ------------------------ nested structs ------------------------

    pub fn get_struct(&self, field_num: u16) -> Result<Option<Struct>, ClawError> {
        let mut inner = self.inner.borrow_mut();
        let mapping = inner.mapping.clone().ok_or(ClawError::Recycled)?;
        expect_type(&mapping, field_num, FieldType::Struct)?;
        ensure_decoded(&mut inner, &mapping, field_num)?;

        match &inner.slots[usize::from(field_num)] {
            None => Ok(None),
            Some(Value::Struct(child)) => Ok(Some(child.clone())),
            Some(_) => Err(ClawError::InternalError(format!(
                "slot {field_num} holds a mismatched value"
            ))),
        }
    }

    /// Attaches `child` at `field_num`, replacing any current occupant.
    /// The child must be unattached and use the descriptor's mapping.
    pub fn set_struct(&self, field_num: u16, child: Struct) -> Result<(), ClawError> {
        let mut inner = self.inner.borrow_mut();
        let mapping = inner.mapping.clone().ok_or(ClawError::Recycled)?;
        let desc = expect_type(&mapping, field_num, FieldType::Struct)?;

        // The cycle check comes first: it works on pointers alone, so it
        // also rejects `child == self` before any re-borrow of the child.
        if in_ancestry(&inner, &child.inner) {
            return Err(ClawError::AlreadyAttached { field: field_num });
        }
        if child.is_attached() {
            return Err(ClawError::AlreadyAttached { field: field_num });
        }
        let expected = mapping.nested(desc)?;
        if !Rc::ptr_eq(&expected, &child.mapping()?) {
            return Err(ClawError::MappingMismatch { field: field_num });
        }

        if inner.is_set_enabled {
            child.enable_is_set()?;
        }

        let previous = inner.previous_footprint(field_num);
        let delta = child.wire_size() as i64 - previous as i64;
        if delta > 0 {
            inner.check_grow(delta as u64)?;
        }

        detach_occupant(&mut inner, field_num);
        child.attach_to_field(field_num, inner.self_weak.clone())?;
        commit_unchecked(&mut inner, field_num, Some(Value::Struct(child)), delta);
        Ok(())
    }

    /// Creates an empty child struct attached at `field_num` and returns it.
    pub fn new_struct(&self, field_num: u16) -> Result<Struct, ClawError> {
        let (nested, pools) = {
            let inner = self.inner.borrow();
            let mapping = inner.mapping.clone().ok_or(ClawError::Recycled)?;
            let desc = expect_type(&mapping, field_num, FieldType::Struct)?;
            (mapping.nested(desc)?, inner.pools.clone())
        };

        let child = Struct::new(&nested, &pools);
        self.set_struct(field_num, child.clone())?;
        Ok(child)
    }

    // ------------------------ list accessors ------------------------

    pub fn get_list_bools(&self, field_num: u16) -> Result<Option<Bools>, ClawError> {
        match self.list_slot(field_num, FieldType::ListBools)? {
            None => Ok(None),
            Some(Value::ListBools(list)) => Ok(Some(list)),
            Some(_) => Err(mismatched_slot(field_num)),
        }
    }

    pub fn get_list_numbers<T: FixedNumeric>(
        &self,
        field_num: u16,
    ) -> Result<Option<Numbers<T>>, ClawError> {
        match self.list_slot(field_num, T::LIST_TYPE)? {
            None => Ok(None),
            Some(value) => T::list_from_value(&value)
                .map(Some)
                .ok_or_else(|| mismatched_slot(field_num)),
        }
    }

    pub fn get_list_bytes(&self, field_num: u16) -> Result<Option<BytesList>, ClawError> {
        match self.list_slot(field_num, FieldType::ListBytes)? {
            None => Ok(None),
            Some(Value::ListBytes(list)) => Ok(Some(list)),
            Some(_) => Err(mismatched_slot(field_num)),
        }
    }

    pub fn get_list_strings(&self, field_num: u16) -> Result<Option<Strings>, ClawError> {
        match self.list_slot(field_num, FieldType::ListStrings)? {
            None => Ok(None),
            Some(Value::ListStrings(list)) => Ok(Some(list)),
            Some(_) => Err(mismatched_slot(field_num)),
        }
    }

    pub fn get_list_structs(&self, field_num: u16) -> Result<Option<Structs>, ClawError> {
        match self.list_slot(field_num, FieldType::ListStructs)? {
            None => Ok(None),
            Some(Value::ListStructs(list)) => Ok(Some(list)),
            Some(_) => Err(mismatched_slot(field_num)),
        }
    }

    fn list_slot(&self, field_num: u16, requested: FieldType) -> Result<Option<Value>, ClawError> {
        let mut inner = self.inner.borrow_mut();
        let mapping = inner.mapping.clone().ok_or(ClawError::Recycled)?;
        expect_type(&mapping, field_num, requested)?;
        ensure_decoded(&mut inner, &mapping, field_num)?;
        Ok(inner.slots[usize::from(field_num)].clone())
    }

    pub fn set_list_bools(&self, field_num: u16, list: Bools) -> Result<(), ClawError> {
        self.set_container(field_num, FieldType::ListBools, |owner| {
            list.attach(field_num, owner).map(|()| {
                (Value::ListBools(list.clone()), list.wire_size())
            })
        })
    }

    pub fn set_list_numbers<T: FixedNumeric>(
        &self,
        field_num: u16,
        list: Numbers<T>,
    ) -> Result<(), ClawError> {
        self.set_container(field_num, T::LIST_TYPE, |owner| {
            list.attach(field_num, owner).map(|()| {
                (T::list_into_value(list.clone()), list.wire_size())
            })
        })
    }

    pub fn set_list_bytes(&self, field_num: u16, list: BytesList) -> Result<(), ClawError> {
        if list.tag() != FieldType::ListBytes {
            return Err(ClawError::MappingMismatch { field: field_num });
        }
        self.set_container(field_num, FieldType::ListBytes, |owner| {
            list.attach(field_num, owner).map(|()| {
                (Value::ListBytes(list.clone()), list.wire_size())
            })
        })
    }

    pub fn set_list_strings(&self, field_num: u16, list: Strings) -> Result<(), ClawError> {
        self.set_container(field_num, FieldType::ListStrings, |owner| {
            list.attach(field_num, owner).map(|()| {
                (Value::ListStrings(list.clone()), list.wire_size())
            })
        })
    }

    pub fn set_list_structs(&self, field_num: u16, list: Structs) -> Result<(), ClawError> {
        {
            let inner = self.inner.borrow();
            let mapping = inner.mapping.clone().ok_or(ClawError::Recycled)?;
            let desc = expect_type(&mapping, field_num, FieldType::ListStructs)?;
            if list.is_attached() {
                return Err(ClawError::AlreadyAttached { field: field_num });
            }
            let expected = mapping.nested(desc)?;
            if !Rc::ptr_eq(&expected, &list.mapping()) {
                return Err(ClawError::MappingMismatch { field: field_num });
            }
            if inner.is_set_enabled {
                list.enable_is_set()?;
            }
        }
        self.set_container(field_num, FieldType::ListStructs, |owner| {
            list.attach(field_num, owner).map(|()| {
                (Value::ListStructs(list.clone()), list.wire_size())
            })
        })
    }

    fn set_container<F>(
        &self,
        field_num: u16,
        requested: FieldType,
        attach: F,
    ) -> Result<(), ClawError>
    where
        F: FnOnce(Weak<RefCell<StructInner>>) -> Result<(Value, u64), ClawError>,
    {
        let mut inner = self.inner.borrow_mut();
        let mapping = inner.mapping.clone().ok_or(ClawError::Recycled)?;
        expect_type(&mapping, field_num, requested)?;

        let previous = inner.previous_footprint(field_num);
        let (value, footprint) = attach(inner.self_weak.clone())?;

        let delta = footprint as i64 - previous as i64;
        if delta > 0 {
            if let Err(err) = inner.check_grow(delta as u64) {
                // Roll the attach back so the container stays reusable.
                detach_value(&value);
                return Err(err);
            }
        }

        detach_occupant(&mut inner, field_num);
        commit_unchecked(&mut inner, field_num, Some(value), delta);
        Ok(())
    }

    /// Creates an empty, attached bool list at `field_num`.
    pub fn new_list_bools(&self, field_num: u16) -> Result<Bools, ClawError> {
        let list = Bools::new();
        self.set_list_bools(field_num, list.clone())?;
        Ok(list)
    }

    /// Creates an empty, attached number list at `field_num`.
    pub fn new_list_numbers<T: FixedNumeric>(
        &self,
        field_num: u16,
    ) -> Result<Numbers<T>, ClawError> {
        let pools = self.inner.borrow().pools.clone();
        let list = Numbers::<T>::with_pools(&pools);
        self.set_list_numbers(field_num, list.clone())?;
        Ok(list)
    }

    /// Creates an empty, attached bytes list at `field_num`.
    pub fn new_list_bytes(&self, field_num: u16) -> Result<BytesList, ClawError> {
        let list = BytesList::new();
        self.set_list_bytes(field_num, list.clone())?;
        Ok(list)
    }

    /// Creates an empty, attached string list at `field_num`.
    pub fn new_list_strings(&self, field_num: u16) -> Result<Strings, ClawError> {
        let list = Strings::new();
        self.set_list_strings(field_num, list.clone())?;
        Ok(list)
    }

    /// Creates an empty, attached struct list at `field_num`.
    pub fn new_list_structs(&self, field_num: u16) -> Result<Structs, ClawError> {
        let (nested, pools) = {
            let inner = self.inner.borrow();
            let mapping = inner.mapping.clone().ok_or(ClawError::Recycled)?;
            let desc = expect_type(&mapping, field_num, FieldType::ListStructs)?;
            (mapping.nested(desc)?, inner.pools.clone())
        };

        let list = Structs::new(&nested, &pools);
        self.set_list_structs(field_num, list.clone())?;
        Ok(list)
    }

    /// Appends `item` to the struct list at `field_num`, creating the list
    /// if the field is empty.
    pub fn append_list_struct(&self, field_num: u16, item: Struct) -> Result<(), ClawError> {
        let list = match self.get_list_structs(field_num)? {
            Some(list) => list,
            None => self.new_list_structs(field_num)?,
        };
        list.append(item)
    }

    // ------------------------ generic dispatch ------------------------

    /// Sets any field from a dynamically typed value, dispatching on the
    /// descriptor's type.
    pub fn set_field(&self, field_num: u16, value: FieldValue) -> Result<(), ClawError> {
        match value {
            FieldValue::Bool(v) => self.set_bool(field_num, v),
            FieldValue::Int8(v) => self.set_number(field_num, v),
            FieldValue::Int16(v) => self.set_number(field_num, v),
            FieldValue::Int32(v) => self.set_number(field_num, v),
            FieldValue::Int64(v) => self.set_number(field_num, v),
            FieldValue::Uint8(v) => self.set_number(field_num, v),
            FieldValue::Uint16(v) => self.set_number(field_num, v),
            FieldValue::Uint32(v) => self.set_number(field_num, v),
            FieldValue::Uint64(v) => self.set_number(field_num, v),
            FieldValue::Float32(v) => self.set_number(field_num, v),
            FieldValue::Float64(v) => self.set_number(field_num, v),
            FieldValue::Bytes(v) => self.set_bytes(field_num, &v),
            FieldValue::String(v) => self.set_str(field_num, &v),
            FieldValue::Struct(v) => self.set_struct(field_num, v),
            FieldValue::ListBools(v) => self.set_list_bools(field_num, v),
            FieldValue::ListInt8(v) => self.set_list_numbers(field_num, v),
            FieldValue::ListInt16(v) => self.set_list_numbers(field_num, v),
            FieldValue::ListInt32(v) => self.set_list_numbers(field_num, v),
            FieldValue::ListInt64(v) => self.set_list_numbers(field_num, v),
            FieldValue::ListUint8(v) => self.set_list_numbers(field_num, v),
            FieldValue::ListUint16(v) => self.set_list_numbers(field_num, v),
            FieldValue::ListUint32(v) => self.set_list_numbers(field_num, v),
            FieldValue::ListUint64(v) => self.set_list_numbers(field_num, v),
            FieldValue::ListFloat32(v) => self.set_list_numbers(field_num, v),
            FieldValue::ListFloat64(v) => self.set_list_numbers(field_num, v),
            FieldValue::ListBytes(v) => self.set_list_bytes(field_num, v),
            FieldValue::ListStrings(v) => self.set_list_strings(field_num, v),
            FieldValue::ListStructs(v) => self.set_list_structs(field_num, v),
        }
    }

    /// Removes the field entirely; a subsequent marshal emits nothing for
    /// it and getters report it absent.
    pub fn delete(&self, field_num: u16) -> Result<(), ClawError> {
        let mut inner = self.inner.borrow_mut();
        let mapping = inner.mapping.clone().ok_or(ClawError::Recycled)?;
        mapping.field(field_num)?;

        let previous = inner.previous_footprint(field_num);
        detach_occupant(&mut inner, field_num);
        commit_unchecked(&mut inner, field_num, None, -(previous as i64));
        Ok(())
    }

    /// Reports whether the field was explicitly set (with tracking enabled)
    /// or is present at all (without).
    pub fn is_set(&self, field_num: u16) -> Result<bool, ClawError> {
        let inner = self.inner.borrow();
        let mapping = inner.mapping.clone().ok_or(ClawError::Recycled)?;
        mapping.field(field_num)?;

        if let Some(bits) = &inner.is_set {
            return Ok(bits.get(field_num));
        }

        let index = usize::from(field_num);
        Ok(match inner.states[index] {
            FieldState::Raw => inner.lookup_raw(field_num).is_some(),
            FieldState::Decoded | FieldState::Dirty => inner.slots[index].is_some(),
        })
    }

    // ------------------------ is-set tracking ------------------------

    /// Opts this struct (and, transitively, every attached child) into the
    /// explicit-set trailer. Must happen before any wire data is held.
    pub fn set_is_set_enabled(&self) -> Result<(), ClawError> {
        self.enable_is_set()
    }

    pub(crate) fn enable_is_set(&self) -> Result<(), ClawError> {
        let children = {
            let mut inner = self.inner.borrow_mut();
            if inner.is_set_enabled {
                return Ok(());
            }
            if inner.raw.is_some() {
                return Err(ClawError::IsSetAfterDecode);
            }
            let mapping = inner.mapping.clone().ok_or(ClawError::Recycled)?;
            let field_count = mapping.field_count();

            let mut bits = IsSetBits::new(field_count);
            for (index, slot) in inner.slots.iter().enumerate() {
                if slot.is_some() {
                    bits.set(index as u16);
                }
            }
            inner.is_set_enabled = true;
            inner.is_set = Some(bits);
            inner.touch(IsSetBits::trailer_len(field_count) as i64);

            inner
                .slots
                .iter()
                .flatten()
                .cloned()
                .collect::<Vec<Value>>()
        };

        // Children grow their own trailers; each enable propagates its size
        // delta back through this struct, so no borrow may be held here.
        for value in children {
            match value {
                Value::Struct(child) => child.enable_is_set()?,
                Value::ListStructs(list) => list.enable_is_set()?,
                _ => {}
            }
        }
        Ok(())
    }

    // ------------------------ codec ------------------------

    /// Emits the struct. When nothing in the subtree was modified since the
    /// last unmarshal, the retained raw buffer is written in one piece.
    pub fn marshal<W: Write>(&self, writer: &mut W) -> Result<u64, ClawError> {
        let inner = self.inner.borrow();
        let mapping = inner.mapping.clone().ok_or(ClawError::Recycled)?;

        if !inner.modified && subtree_pristine(&inner) {
            if let Some(raw) = &inner.raw {
                writer.write_all(raw.bytes())?;
                return Ok(raw.len() as u64);
            }
        }

        writer.write_all(&inner.header.pack())?;
        let mut written = HEADER_LEN as u64;

        for desc in mapping.fields() {
            written += emit_field(&inner, writer, desc)?;
        }

        // Fields past the mapping belong to a newer schema; re-emit their
        // raw bytes untouched. Sorted offsets keep field-number order.
        for raw_field in &inner.offsets {
            if usize::from(raw_field.field_num) >= mapping.field_count() {
                written += copy_raw(&inner, writer, *raw_field)?;
            }
        }

        if let Some(bits) = &inner.is_set {
            written += bits.encode(writer)?;
        }

        if written != inner.total {
            return Err(ClawError::SizeMismatch {
                declared: inner.total,
                observed: written,
            });
        }
        Ok(written)
    }

    /// Populates this struct from a byte stream: reads the header, pulls
    /// the body into a pooled buffer, and builds the field-offset index in
    /// one linear scan. Every present field is left in raw state.
    pub fn unmarshal<R: Read>(&self, reader: &mut R) -> Result<u64, ClawError> {
        let mut inner = self.inner.borrow_mut();
        let mapping = inner.mapping.clone().ok_or(ClawError::Recycled)?;
        if inner.parent.is_some() {
            return Err(ClawError::AlreadyAttached {
                field: inner.header.field_num,
            });
        }

        let mut head = [0u8; HEADER_LEN];
        read_exact(reader, &mut head)?;
        let header = Header::unpack(&head)?;

        if header.field_type != FieldType::Struct {
            return Err(ClawError::TypeMismatch {
                field: header.field_num,
                expected: FieldType::Struct,
                requested: header.field_type,
            });
        }
        if header.final40 < HEADER_LEN as u64 {
            return Err(ClawError::SizeMismatch {
                declared: header.final40,
                observed: HEADER_LEN as u64,
            });
        }

        let total = header.final40 as usize;
        let mut buf = inner.pools.bytes.get(total);
        buf.extend_from_slice(&head);
        buf.resize(total, 0);
        read_exact(reader, &mut buf[HEADER_LEN..])?;

        load_raw(&mut inner, &mapping, RawBuf::new(buf), header)?;
        Ok(total as u64)
    }

    /// Builds a struct over raw field bytes (header included) shared with
    /// an enclosing buffer; used for nested structs and list elements.
    pub(crate) fn from_raw_element(
        mapping: &Rc<Mapping>,
        raw: RawBuf,
        pools: &Pools,
        is_set_enabled: bool,
    ) -> Result<Struct, ClawError> {
        let header = Header::unpack(raw.bytes())?;
        if header.field_type != FieldType::Struct {
            return Err(ClawError::TypeMismatch {
                field: header.field_num,
                expected: FieldType::Struct,
                requested: header.field_type,
            });
        }
        if header.final40 != raw.len() as u64 {
            return Err(ClawError::SizeMismatch {
                declared: header.final40,
                observed: raw.len() as u64,
            });
        }

        let child = Struct::new(mapping, pools);
        {
            let mut inner = child.inner.borrow_mut();
            inner.is_set_enabled = is_set_enabled;
            load_raw(&mut inner, mapping, raw, header)?;
        }
        Ok(child)
    }

    /// Resets all state and returns every owned resource to the pools.
    /// Attached children are recycled transitively; further use of any
    /// stale handle reports `Recycled`.
    pub fn recycle(self) -> Result<(), ClawError> {
        let (mapping_key, pools) = {
            let mut inner = self.inner.borrow_mut();
            if inner.parent.is_some() {
                return Err(ClawError::AlreadyAttached {
                    field: inner.header.field_num,
                });
            }
            let mapping = inner.mapping.take().ok_or(ClawError::Recycled)?;

            release_children(&mut inner);

            let pools = inner.pools.clone();
            pools.vecs::<Option<Value>>().put(std::mem::take(&mut inner.slots));
            pools.vecs::<FieldState>().put(std::mem::take(&mut inner.states));
            pools.vecs::<RawField>().put(std::mem::take(&mut inner.offsets));

            inner.raw = None;
            inner.is_set = None;
            inner.is_set_enabled = false;
            inner.header = empty_header();
            inner.total = HEADER_LEN as u64;
            inner.modified = false;
            inner.decoding = false;

            (mapping.key(), pools)
        };

        // Only a handle with no outstanding clones is safe to hand out
        // again; stale clones keep reporting Recycled forever.
        if Rc::strong_count(&self.inner) == 1 {
            pools.put_struct(mapping_key, self);
        }
        Ok(())
    }

    /// True when neither this struct nor any attached descendant has
    /// uncommitted changes.
    pub(crate) fn is_pristine(&self) -> bool {
        let inner = self.inner.borrow();
        !inner.modified && subtree_pristine(&inner)
    }
}

// ------------------------ internal helpers ------------------------

fn empty_header() -> Header {
    Header {
        field_num: 0,
        field_type: FieldType::Struct,
        final40: HEADER_LEN as u64,
    }
}

fn mismatched_slot(field_num: u16) -> ClawError {
    ClawError::InternalError(format!("slot {field_num} holds a mismatched value"))
}

fn expect_type<'m>(
    mapping: &'m Rc<Mapping>,
    field_num: u16,
    requested: FieldType,
) -> Result<&'m FieldDescriptor, ClawError> {
    let desc = mapping.field(field_num)?;
    if desc.field_type != requested {
        return Err(ClawError::TypeMismatch {
            field: field_num,
            expected: desc.field_type,
            requested,
        });
    }
    Ok(desc)
}

/// Transitions a raw field to decoded through the mapping's cached decoder.
/// Fields absent from the raw index stay raw and empty.
fn ensure_decoded(
    inner: &mut StructInner,
    mapping: &Rc<Mapping>,
    field_num: u16,
) -> Result<(), ClawError> {
    if inner.states[usize::from(field_num)] != FieldState::Raw {
        return Ok(());
    }

    let Some(raw_field) = inner.lookup_raw(field_num) else {
        return Ok(());
    };

    let raw = inner
        .raw
        .as_ref()
        .ok_or_else(|| ClawError::InternalError("raw field without raw buffer".into()))?
        .slice(raw_field.offset as usize, raw_field.size as usize);

    let desc = mapping.field(field_num)?;
    log::debug!(
        "lazy decode: field {} ({:?}), {} bytes",
        field_num,
        desc.field_type,
        raw_field.size
    );

    (desc.decoder)(inner, desc, raw)?;
    inner.states[usize::from(field_num)] = FieldState::Decoded;
    Ok(())
}

/// Shared tail of every scalar/bytes mutator: overflow check, is-set
/// bookkeeping, slot write, dirty flip and size propagation. The slot is
/// untouched if the overflow check fails.
fn commit(
    inner: &mut StructInner,
    field_num: u16,
    value: Option<Value>,
    previous: u64,
) -> Result<(), ClawError> {
    let footprint = value.as_ref().map_or(0, Value::footprint);
    let delta = footprint as i64 - previous as i64;
    if delta > 0 {
        inner.check_grow(delta as u64)?;
    }
    commit_unchecked(inner, field_num, value, delta);
    Ok(())
}

fn commit_unchecked(inner: &mut StructInner, field_num: u16, value: Option<Value>, delta: i64) {
    if let Some(bits) = &mut inner.is_set {
        if value.is_some() {
            bits.set(field_num);
        } else {
            bits.clear(field_num);
        }
    }
    inner.slots[usize::from(field_num)] = value;
    inner.states[usize::from(field_num)] = FieldState::Dirty;
    inner.touch(delta);
}

/// Clears the back reference of whatever currently occupies the slot, so a
/// later mutation on a detached child cannot corrupt this struct's totals.
fn detach_occupant(inner: &mut StructInner, field_num: u16) {
    if let Some(value) = &inner.slots[usize::from(field_num)] {
        detach_value(value);
    }
}

fn detach_value(value: &Value) {
    match value {
        Value::Struct(child) => child.detach(),
        Value::ListBools(list) => list.detach(),
        Value::ListU8(list) => list.detach(),
        Value::ListU16(list) => list.detach(),
        Value::ListU32(list) => list.detach(),
        Value::ListU64(list) => list.detach(),
        Value::ListI8(list) => list.detach(),
        Value::ListI16(list) => list.detach(),
        Value::ListI32(list) => list.detach(),
        Value::ListI64(list) => list.detach(),
        Value::ListF32(list) => list.detach(),
        Value::ListF64(list) => list.detach(),
        Value::ListBytes(list) => list.detach(),
        Value::ListStrings(list) => list.detach(),
        Value::ListStructs(list) => list.detach(),
        _ => {}
    }
}

/// Detaches and recycles attached children ahead of a reset.
fn release_children(inner: &mut StructInner) {
    for slot in inner.slots.iter_mut() {
        if let Some(value) = slot.take() {
            match value {
                Value::Struct(child) => {
                    child.detach();
                    let _ = child.recycle();
                }
                Value::ListStructs(list) => {
                    list.detach();
                    list.recycle_elements();
                }
                other => detach_value(&other),
            }
        }
    }
}

/// True when the attach target `candidate` is this struct or one of its
/// ancestors; attaching it would create a cycle.
fn in_ancestry(inner: &StructInner, candidate: &Rc<RefCell<StructInner>>) -> bool {
    if std::ptr::eq(Weak::as_ptr(&inner.self_weak), Rc::as_ptr(candidate)) {
        return true;
    }

    let mut current = inner.parent.clone();
    loop {
        let next = match current {
            Some(Parent::Field(parent)) => parent.upgrade(),
            Some(Parent::ListElem { list, .. }) => list
                .upgrade()
                .and_then(|cell| cell.borrow().owner.clone())
                .and_then(|owner| owner.owner.upgrade()),
            None => return false,
        };

        match next {
            Some(cell) => {
                if Rc::ptr_eq(&cell, candidate) {
                    return true;
                }
                current = cell.borrow().parent.clone();
            }
            None => return false,
        }
    }
}

fn subtree_pristine(inner: &StructInner) -> bool {
    if inner.modified {
        return false;
    }
    inner.slots.iter().flatten().all(|value| match value {
        Value::Struct(child) => child.is_pristine(),
        Value::ListStructs(list) => list.is_pristine(),
        _ => true,
    })
}

fn emit_field<W: Write>(
    inner: &StructInner,
    writer: &mut W,
    desc: &FieldDescriptor,
) -> Result<u64, ClawError> {
    let index = usize::from(desc.field_num);
    match inner.states[index] {
        FieldState::Raw => match inner.lookup_raw(desc.field_num) {
            Some(raw_field) => copy_raw(inner, writer, raw_field),
            None => Ok(0),
        },
        FieldState::Decoded | FieldState::Dirty => match &inner.slots[index] {
            Some(value) => emit_value(writer, desc, value),
            // A no-op decoder (unknown tag) leaves the raw bytes
            // authoritative; a deleted field emits nothing.
            None => match inner.states[index] {
                FieldState::Decoded => match inner.lookup_raw(desc.field_num) {
                    Some(raw_field) => copy_raw(inner, writer, raw_field),
                    None => Ok(0),
                },
                _ => Ok(0),
            },
        },
    }
}

fn copy_raw<W: Write>(
    inner: &StructInner,
    writer: &mut W,
    raw_field: RawField,
) -> Result<u64, ClawError> {
    let raw = inner
        .raw
        .as_ref()
        .ok_or_else(|| ClawError::InternalError("raw field without raw buffer".into()))?;
    let start = raw_field.offset as usize;
    let end = start + raw_field.size as usize;
    writer.write_all(&raw.bytes()[start..end])?;
    Ok(u64::from(raw_field.size))
}

fn emit_value<W: Write>(
    writer: &mut W,
    desc: &FieldDescriptor,
    value: &Value,
) -> Result<u64, ClawError> {
    match value {
        Value::Bool(v) => {
            if !*v {
                return Ok(0);
            }
            let header = Header::new(desc.field_num, FieldType::Bool, 1)?;
            writer.write_all(&header.pack())?;
            Ok(HEADER_LEN as u64)
        }
        Value::U8(v) => emit_scalar(writer, desc.field_num, *v),
        Value::U16(v) => emit_scalar(writer, desc.field_num, *v),
        Value::U32(v) => emit_scalar(writer, desc.field_num, *v),
        Value::U64(v) => emit_scalar(writer, desc.field_num, *v),
        Value::I8(v) => emit_scalar(writer, desc.field_num, *v),
        Value::I16(v) => emit_scalar(writer, desc.field_num, *v),
        Value::I32(v) => emit_scalar(writer, desc.field_num, *v),
        Value::I64(v) => emit_scalar(writer, desc.field_num, *v),
        Value::F32(v) => emit_scalar(writer, desc.field_num, *v),
        Value::F64(v) => emit_scalar(writer, desc.field_num, *v),
        Value::Bytes(data) => emit_bytes(writer, desc.field_num, desc.field_type, data),
        Value::Struct(child) => child.marshal(writer),
        Value::ListBools(list) => list.encode(writer),
        Value::ListU8(list) => list.encode(writer),
        Value::ListU16(list) => list.encode(writer),
        Value::ListU32(list) => list.encode(writer),
        Value::ListU64(list) => list.encode(writer),
        Value::ListI8(list) => list.encode(writer),
        Value::ListI16(list) => list.encode(writer),
        Value::ListI32(list) => list.encode(writer),
        Value::ListI64(list) => list.encode(writer),
        Value::ListF32(list) => list.encode(writer),
        Value::ListF64(list) => list.encode(writer),
        Value::ListBytes(list) => list.encode(writer),
        Value::ListStrings(list) => list.encode(writer),
        Value::ListStructs(list) => list.encode(writer),
    }
}

/// Scalar emitter with zero-value compression: nothing for zero, the value
/// packed into the header for widths under 64 bits, one trailing word
/// otherwise.
fn emit_scalar<W: Write, T: FixedNumeric>(
    writer: &mut W,
    field_num: u16,
    value: T,
) -> Result<u64, ClawError> {
    if value.is_zero() {
        return Ok(0);
    }

    if T::WIDTH == WORD {
        let header = Header::new(field_num, T::SCALAR_TYPE, WORD as u64)?;
        writer.write_all(&header.pack())?;
        writer.write_all(&value.to_bits().to_le_bytes())?;
        Ok((HEADER_LEN + WORD) as u64)
    } else {
        let header = Header::new(field_num, T::SCALAR_TYPE, value.to_bits())?;
        writer.write_all(&header.pack())?;
        Ok(HEADER_LEN as u64)
    }
}

fn emit_bytes<W: Write>(
    writer: &mut W,
    field_num: u16,
    field_type: FieldType,
    data: &[u8],
) -> Result<u64, ClawError> {
    if data.is_empty() {
        return Ok(0);
    }

    let header = Header::new(field_num, field_type, data.len() as u64)?;
    writer.write_all(&header.pack())?;
    writer.write_all(data)?;
    writer.write_all(&[0u8; HEADER_LEN][..padding_needed(data.len())])?;
    Ok((HEADER_LEN + word_aligned(data.len())) as u64)
}

/// Resets content and rebuilds the struct over `raw`, leaving every present
/// field in raw state. On error the struct is indeterminate and should be
/// recycled by the caller.
fn load_raw(
    inner: &mut StructInner,
    mapping: &Rc<Mapping>,
    raw: RawBuf,
    header: Header,
) -> Result<(), ClawError> {
    release_children(inner);
    let field_count = mapping.field_count();
    inner.slots.clear();
    inner.slots.resize_with(field_count, || None);
    inner.states.clear();
    inner.states.resize(field_count, FieldState::Raw);
    inner.offsets.clear();
    inner.raw = None;
    inner.is_set = None;

    inner.decoding = true;
    let scanned = scan(inner, mapping, &raw, header);
    inner.decoding = false;
    scanned?;

    inner.header = header;
    inner.total = header.final40;
    inner.raw = Some(raw);
    inner.modified = false;
    Ok(())
}

/// One linear pass over the body: record `(field_num, offset, size)` for
/// every field, then sort by field number for binary-searched access.
fn scan(
    inner: &mut StructInner,
    mapping: &Rc<Mapping>,
    raw: &RawBuf,
    header: Header,
) -> Result<(), ClawError> {
    let bytes = raw.bytes();
    if bytes.len() as u64 != header.final40 {
        return Err(ClawError::SizeMismatch {
            declared: header.final40,
            observed: bytes.len() as u64,
        });
    }

    let trailer_len = if inner.is_set_enabled {
        IsSetBits::trailer_len(mapping.field_count())
    } else {
        0
    };
    if bytes.len() < HEADER_LEN + trailer_len {
        return Err(ClawError::SizeMismatch {
            declared: header.final40,
            observed: (HEADER_LEN + trailer_len) as u64,
        });
    }
    let scan_end = bytes.len() - trailer_len;

    let mut pos = HEADER_LEN;
    while pos < scan_end {
        let size = field_wire_size(&bytes[pos..scan_end])?;
        let field_header = Header::unpack(&bytes[pos..])?;
        log::trace!(
            "scan: field {} ({:?}) at {pos}, {size} bytes",
            field_header.field_num,
            field_header.field_type
        );

        inner.offsets.push(RawField {
            field_num: field_header.field_num,
            offset: pos as u32,
            size: size as u32,
        });
        pos += size;
    }

    // Offsets are recorded in appearance order, then sorted.
    inner.offsets.sort_by_key(|rf| rf.field_num);

    if trailer_len > 0 {
        inner.is_set = Some(IsSetBits::from_wire(
            &bytes[scan_end..],
            mapping.field_count(),
        )?);
    }
    Ok(())
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), ClawError> {
    reader.read_exact(buf).map_err(|err| {
        if err.kind() == ErrorKind::UnexpectedEof {
            ClawError::UnexpectedEof
        } else {
            ClawError::Io(err)
        }
    })
}

impl std::fmt::Debug for Struct {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Struct")
            .field(
                "mapping",
                &inner.mapping.as_ref().map(|m| m.name.as_str()).unwrap_or("<recycled>"),
            )
            .field("total", &inner.total)
            .field("modified", &inner.modified)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{ByteOrder, LittleEndian};

    fn meta_mapping() -> Rc<Mapping> {
        Mapping::builder("ObjectMeta")
            .field("name", FieldType::String)
            .field("generation", FieldType::Int32)
            .field("uid", FieldType::Uint64)
            .build()
            .unwrap()
    }

    #[test]
    fn test_empty_struct_round_trip() {
        let mapping = meta_mapping();
        let pools = Pools::new();
        let empty = Struct::new(&mapping, &pools);

        let mut buf = Vec::new();
        assert_eq!(empty.marshal(&mut buf).unwrap(), 8);

        let header = Header::unpack(&buf).unwrap();
        assert_eq!(header.field_num, 0);
        assert_eq!(header.field_type, FieldType::Struct);
        assert_eq!(header.final40, 8);

        let decoded = Struct::new(&mapping, &pools);
        assert_eq!(decoded.unmarshal(&mut &buf[..]).unwrap(), 8);
        assert_eq!(decoded.wire_size(), 8);
        assert_eq!(decoded.get_str(0).unwrap(), None);
    }

    #[test]
    fn test_zero_scalar_is_free() {
        let mapping = meta_mapping();
        let pools = Pools::new();
        let meta = Struct::new(&mapping, &pools);

        meta.set_i32(1, 0).unwrap();
        let mut zeroed = Vec::new();
        meta.marshal(&mut zeroed).unwrap();
        assert_eq!(zeroed.len(), 8);

        meta.set_i32(1, 1).unwrap();
        let mut populated = Vec::new();
        meta.marshal(&mut populated).unwrap();
        assert_eq!(populated.len(), 16);

        // The value rides in the scalar header's final40.
        let scalar = Header::unpack(&populated[8..]).unwrap();
        assert_eq!(scalar.field_num, 1);
        assert_eq!(scalar.field_type, FieldType::Int32);
        assert_eq!(scalar.final40, 1);
    }

    #[test]
    fn test_wide_scalar_has_trailing_word() {
        let mapping = meta_mapping();
        let pools = Pools::new();
        let meta = Struct::new(&mapping, &pools);

        meta.set_u64(2, 0x0102_0304_0506_0708).unwrap();
        assert_eq!(meta.wire_size(), 24);

        let mut buf = Vec::new();
        meta.marshal(&mut buf).unwrap();
        assert_eq!(LittleEndian::read_u64(&buf[16..24]), 0x0102_0304_0506_0708);

        let decoded = Struct::new(&mapping, &pools);
        decoded.unmarshal(&mut &buf[..]).unwrap();
        assert_eq!(decoded.get_u64(2).unwrap(), Some(0x0102_0304_0506_0708));
    }

    #[test]
    fn test_string_field_growth() {
        let mapping = meta_mapping();
        let pools = Pools::new();
        let meta = Struct::new(&mapping, &pools);

        meta.set_str(0, "test-pod").unwrap();
        // 8-byte payload lands on a word boundary: header + payload, no pad.
        assert_eq!(meta.wire_size(), 8 + 16);

        let mut buf = Vec::new();
        meta.marshal(&mut buf).unwrap();
        assert_eq!(&buf[16..24], b"test-pod");
        assert_eq!(meta.get_str(0).unwrap(), Some("test-pod".to_string()));
    }

    #[test]
    fn test_type_mismatch_is_rejected() {
        let mapping = meta_mapping();
        let pools = Pools::new();
        let meta = Struct::new(&mapping, &pools);

        assert!(matches!(
            meta.set_u32(0, 1),
            Err(ClawError::TypeMismatch { field: 0, .. })
        ));
        assert!(matches!(
            meta.get_u32(99),
            Err(ClawError::UnknownField { field: 99 })
        ));

        // A failed mutator leaves the slot untouched.
        assert_eq!(meta.wire_size(), 8);
        assert!(!meta.is_modified());
    }

    #[test]
    fn test_delete_restores_empty_output() {
        let mapping = meta_mapping();
        let pools = Pools::new();
        let meta = Struct::new(&mapping, &pools);

        meta.set_str(0, "doomed").unwrap();
        meta.set_i32(1, 42).unwrap();
        meta.delete(0).unwrap();
        meta.delete(1).unwrap();

        assert_eq!(meta.wire_size(), 8);
        let mut buf = Vec::new();
        meta.marshal(&mut buf).unwrap();
        assert_eq!(buf.len(), 8);
        assert_eq!(meta.get_str(0).unwrap(), None);
    }

    #[test]
    fn test_fast_path_byte_stability() {
        let mapping = meta_mapping();
        let pools = Pools::new();
        let meta = Struct::new(&mapping, &pools);
        meta.set_str(0, "stable").unwrap();
        meta.set_i32(1, 7).unwrap();
        meta.set_u64(2, 99).unwrap();

        let mut original = Vec::new();
        meta.marshal(&mut original).unwrap();

        let decoded = Struct::new(&mapping, &pools);
        decoded.unmarshal(&mut &original[..]).unwrap();

        // Reads must not disturb the raw fast path.
        assert_eq!(decoded.get_str(0).unwrap(), Some("stable".to_string()));
        assert_eq!(decoded.get_i32(1).unwrap(), Some(7));

        let mut re_emitted = Vec::new();
        decoded.marshal(&mut re_emitted).unwrap();
        assert_eq!(re_emitted, original);
    }

    #[test]
    fn test_unknown_field_survives_re_emit() {
        let mapping = meta_mapping();
        let pools = Pools::new();

        // Root header, then a field from a newer schema: tag 200,
        // field number past the mapping, 5 payload bytes padded to 8.
        let mut buf = Header::new(0, FieldType::Struct, 24).unwrap().pack().to_vec();
        buf.extend_from_slice(&Header::new(7, FieldType::Unknown(200), 5).unwrap().pack());
        buf.extend_from_slice(b"hello\0\0\0");

        let decoded = Struct::new(&mapping, &pools);
        assert_eq!(decoded.unmarshal(&mut &buf[..]).unwrap(), 24);

        // Clean re-emit is the raw fast path.
        let mut clean = Vec::new();
        decoded.marshal(&mut clean).unwrap();
        assert_eq!(clean, buf);

        // A mutation forces the field-by-field path; the unknown field is
        // still carried, after the known fields.
        decoded.set_i32(1, 3).unwrap();
        let mut mutated = Vec::new();
        decoded.marshal(&mut mutated).unwrap();
        assert_eq!(mutated.len(), 32);

        let known = Header::unpack(&mutated[8..]).unwrap();
        assert_eq!(known.field_num, 1);
        let unknown = Header::unpack(&mutated[16..]).unwrap();
        assert_eq!(unknown.field_num, 7);
        assert_eq!(&mutated[24..29], b"hello");
    }

    #[test]
    fn test_truncated_buffer_is_a_wire_error() {
        let mapping = meta_mapping();
        let pools = Pools::new();

        let mut buf = Header::new(0, FieldType::Struct, 32).unwrap().pack().to_vec();
        buf.extend_from_slice(&Header::new(0, FieldType::String, 40).unwrap().pack());
        buf.resize(32, 0);

        let target = Struct::new(&mapping, &pools);
        assert!(matches!(
            target.unmarshal(&mut &buf[..]),
            Err(ClawError::Truncated { .. })
        ));
    }

    #[test]
    fn test_zero_item_list_is_a_wire_error() {
        let mapping = Mapping::builder("Labels")
            .field("labels", FieldType::ListStrings)
            .build()
            .unwrap();
        let pools = Pools::new();

        let mut buf = Header::new(0, FieldType::Struct, 16).unwrap().pack().to_vec();
        buf.extend_from_slice(&Header::new(0, FieldType::ListStrings, 0).unwrap().pack());

        let target = Struct::new(&mapping, &pools);
        assert!(matches!(
            target.unmarshal(&mut &buf[..]),
            Err(ClawError::EmptyList { field: 0 })
        ));
    }

    #[test]
    fn test_nested_struct_attach_rules() {
        let meta = meta_mapping();
        let pod = Mapping::builder("Pod")
            .struct_field("meta", &meta)
            .build()
            .unwrap();
        let pools = Pools::new();

        let parent_a = Struct::new(&pod, &pools);
        let parent_b = Struct::new(&pod, &pools);
        let child = Struct::new(&meta, &pools);

        parent_a.set_struct(0, child.clone()).unwrap();
        assert!(matches!(
            parent_b.set_struct(0, child.clone()),
            Err(ClawError::AlreadyAttached { field: 0 })
        ));

        // The wrong mapping is rejected before anything is mutated.
        let stranger = Struct::new(&pod, &pools);
        assert!(matches!(
            parent_a.set_struct(0, stranger),
            Err(ClawError::MappingMismatch { field: 0 })
        ));
    }

    #[test]
    fn test_nested_size_propagates_to_root() {
        let meta = meta_mapping();
        let pod = Mapping::builder("Pod")
            .struct_field("meta", &meta)
            .build()
            .unwrap();
        let pools = Pools::new();

        let root = Struct::new(&pod, &pools);
        let child = root.new_struct(0).unwrap();
        assert_eq!(root.wire_size(), 16);

        child.set_str(0, "abcdefgh").unwrap();
        assert_eq!(child.wire_size(), 24);
        assert_eq!(root.wire_size(), 32);

        let mut buf = Vec::new();
        assert_eq!(root.marshal(&mut buf).unwrap(), 32);
        assert_eq!(buf.len() as u64, root.wire_size());

        let decoded = Struct::new(&pod, &pools);
        decoded.unmarshal(&mut &buf[..]).unwrap();
        let decoded_child = decoded.get_struct(0).unwrap().unwrap();
        assert_eq!(decoded_child.get_str(0).unwrap(), Some("abcdefgh".to_string()));
    }

    #[test]
    fn test_generic_set_field_dispatch() {
        let mapping = meta_mapping();
        let pools = Pools::new();
        let meta = Struct::new(&mapping, &pools);

        meta.set_field(0, FieldValue::String("via-dispatch".into()))
            .unwrap();
        meta.set_field(1, FieldValue::Int32(-4)).unwrap();

        assert_eq!(meta.get_str(0).unwrap(), Some("via-dispatch".to_string()));
        assert_eq!(meta.get_i32(1).unwrap(), Some(-4));

        assert!(matches!(
            meta.set_field(1, FieldValue::Uint32(4)),
            Err(ClawError::TypeMismatch { field: 1, .. })
        ));
    }

    #[test]
    fn test_is_set_tracks_explicit_zero() {
        let mapping = meta_mapping();
        let pools = Pools::new();
        let meta = Struct::new(&mapping, &pools);
        meta.set_is_set_enabled().unwrap();

        // Trailer joins the total immediately.
        assert_eq!(meta.wire_size(), 16);

        meta.set_i32(1, 0).unwrap();
        assert!(meta.is_set(1).unwrap());
        assert!(!meta.is_set(0).unwrap());

        let mut buf = Vec::new();
        assert_eq!(meta.marshal(&mut buf).unwrap(), 16);

        let decoded = Struct::new(&mapping, &pools);
        decoded.set_is_set_enabled().unwrap();
        decoded.unmarshal(&mut &buf[..]).unwrap();

        // The zero never hit the wire, but the explicit-set bit did.
        assert_eq!(decoded.get_i32(1).unwrap(), None);
        assert!(decoded.is_set(1).unwrap());
        assert!(!decoded.is_set(0).unwrap());

        meta.delete(1).unwrap();
        assert!(!meta.is_set(1).unwrap());
    }

    #[test]
    fn test_is_set_rejected_after_unmarshal() {
        let mapping = meta_mapping();
        let pools = Pools::new();

        let source = Struct::new(&mapping, &pools);
        source.set_i32(1, 9).unwrap();
        let mut buf = Vec::new();
        source.marshal(&mut buf).unwrap();

        let decoded = Struct::new(&mapping, &pools);
        decoded.unmarshal(&mut &buf[..]).unwrap();
        assert!(matches!(
            decoded.set_is_set_enabled(),
            Err(ClawError::IsSetAfterDecode)
        ));
    }

    #[test]
    fn test_recycle_returns_struct_to_pool() {
        let mapping = meta_mapping();
        let pools = Pools::new();

        let meta = Struct::new(&mapping, &pools);
        meta.set_str(0, "short-lived").unwrap();
        meta.recycle().unwrap();
        assert_eq!(pools.retained_structs(mapping.key()), 1);

        // The pooled struct comes back indistinguishable from fresh.
        let reused = Struct::new(&mapping, &pools);
        assert_eq!(pools.retained_structs(mapping.key()), 0);
        assert_eq!(reused.wire_size(), 8);
        assert_eq!(reused.get_str(0).unwrap(), None);
        assert!(!reused.is_modified());
    }

    #[test]
    fn test_stale_handle_reports_recycled() {
        let mapping = meta_mapping();
        let pools = Pools::new();

        let meta = Struct::new(&mapping, &pools);
        let stale = meta.clone();
        meta.recycle().unwrap();

        // An outstanding clone kept the struct out of the pool, and every
        // operation through it fails closed.
        assert_eq!(pools.retained_structs(mapping.key()), 0);
        assert!(matches!(stale.get_str(0), Err(ClawError::Recycled)));
        assert!(matches!(stale.set_i32(1, 1), Err(ClawError::Recycled)));
    }

    #[test]
    fn test_recycle_of_attached_child_is_rejected() {
        let meta = meta_mapping();
        let pod = Mapping::builder("Pod")
            .struct_field("meta", &meta)
            .build()
            .unwrap();
        let pools = Pools::new();

        let root = Struct::new(&pod, &pools);
        let child = root.new_struct(0).unwrap();
        assert!(matches!(
            child.recycle(),
            Err(ClawError::AlreadyAttached { .. })
        ));
    }

}
