use byteorder::{ByteOrder, LittleEndian};

use crate::lists::{Bools, BytesList, Numbers, Strings, Structs};
use crate::structs::Struct;
use crate::wire::{word_aligned, FieldType, HEADER_LEN, WORD};

pub(crate) mod sealed {
    use crate::lists::Numbers;
    use crate::value::{FixedNumeric, Value};

    /// Closed-world part of [`FixedNumeric`](crate::value::FixedNumeric):
    /// the slot-value conversions for each concrete numeric type.
    pub trait Sealed: Sized + Copy {
        fn into_value(self) -> Value;
        fn from_value(value: &Value) -> Option<Self>;
        fn list_into_value(list: Numbers<Self>) -> Value
        where
            Self: FixedNumeric;
        fn list_from_value(value: &Value) -> Option<Numbers<Self>>
        where
            Self: FixedNumeric;
    }
}

/// The fixed-width numeric types a number list (and scalar slot) can hold.
///
/// `to_bits` is the zero-extended little-endian bit pattern; scalars at or
/// below 32 bits ride in the header's 40-bit payload field as exactly these
/// bits, and floats round-trip through their IEEE-754 representation.
pub trait FixedNumeric: Copy + PartialEq + std::fmt::Debug + sealed::Sealed + 'static {
    const WIDTH: usize;
    const SCALAR_TYPE: FieldType;
    const LIST_TYPE: FieldType;

    fn read_le(buf: &[u8]) -> Self;
    fn write_le(self, buf: &mut [u8]);
    fn to_bits(self) -> u64;
    fn from_bits(bits: u64) -> Self;

    /// Zero-value compression keys off the bit pattern, so `-0.0` is kept.
    fn is_zero(self) -> bool {
        self.to_bits() == 0
    }
}

macro_rules! impl_fixed_numeric {
    ($ty:ty, $width:expr, $scalar:expr, $list:expr, $value:ident, $list_value:ident,
     $read:expr, $write:expr, $to:expr, $from:expr) => {
        impl sealed::Sealed for $ty {
            fn into_value(self) -> Value {
                Value::$value(self)
            }

            fn from_value(value: &Value) -> Option<Self> {
                match value {
                    Value::$value(v) => Some(*v),
                    _ => None,
                }
            }

            fn list_into_value(list: Numbers<Self>) -> Value {
                Value::$list_value(list)
            }

            fn list_from_value(value: &Value) -> Option<Numbers<Self>> {
                match value {
                    Value::$list_value(list) => Some(list.clone()),
                    _ => None,
                }
            }
        }

        impl FixedNumeric for $ty {
            const WIDTH: usize = $width;
            const SCALAR_TYPE: FieldType = $scalar;
            const LIST_TYPE: FieldType = $list;

            fn read_le(buf: &[u8]) -> Self {
                $read(buf)
            }

            fn write_le(self, buf: &mut [u8]) {
                $write(buf, self)
            }

            fn to_bits(self) -> u64 {
                $to(self)
            }

            fn from_bits(bits: u64) -> Self {
                $from(bits)
            }
        }
    };
}

impl_fixed_numeric!(
    u8, 1, FieldType::Uint8, FieldType::ListUint8, U8, ListU8,
    |b: &[u8]| b[0],
    |b: &mut [u8], v: u8| b[0] = v,
    |v: u8| u64::from(v),
    |bits: u64| bits as u8
);
impl_fixed_numeric!(
    u16, 2, FieldType::Uint16, FieldType::ListUint16, U16, ListU16,
    LittleEndian::read_u16,
    |b: &mut [u8], v| LittleEndian::write_u16(b, v),
    |v: u16| u64::from(v),
    |bits: u64| bits as u16
);
impl_fixed_numeric!(
    u32, 4, FieldType::Uint32, FieldType::ListUint32, U32, ListU32,
    LittleEndian::read_u32,
    |b: &mut [u8], v| LittleEndian::write_u32(b, v),
    |v: u32| u64::from(v),
    |bits: u64| bits as u32
);
impl_fixed_numeric!(
    u64, 8, FieldType::Uint64, FieldType::ListUint64, U64, ListU64,
    LittleEndian::read_u64,
    |b: &mut [u8], v| LittleEndian::write_u64(b, v),
    |v: u64| v,
    |bits: u64| bits
);
impl_fixed_numeric!(
    i8, 1, FieldType::Int8, FieldType::ListInt8, I8, ListI8,
    |b: &[u8]| b[0] as i8,
    |b: &mut [u8], v: i8| b[0] = v as u8,
    |v: i8| u64::from(v as u8),
    |bits: u64| bits as u8 as i8
);
impl_fixed_numeric!(
    i16, 2, FieldType::Int16, FieldType::ListInt16, I16, ListI16,
    LittleEndian::read_i16,
    |b: &mut [u8], v| LittleEndian::write_i16(b, v),
    |v: i16| u64::from(v as u16),
    |bits: u64| bits as u16 as i16
);
impl_fixed_numeric!(
    i32, 4, FieldType::Int32, FieldType::ListInt32, I32, ListI32,
    LittleEndian::read_i32,
    |b: &mut [u8], v| LittleEndian::write_i32(b, v),
    |v: i32| u64::from(v as u32),
    |bits: u64| bits as u32 as i32
);
impl_fixed_numeric!(
    i64, 8, FieldType::Int64, FieldType::ListInt64, I64, ListI64,
    LittleEndian::read_i64,
    |b: &mut [u8], v| LittleEndian::write_i64(b, v),
    |v: i64| v as u64,
    |bits: u64| bits as i64
);
impl_fixed_numeric!(
    f32, 4, FieldType::Float32, FieldType::ListFloat32, F32, ListF32,
    LittleEndian::read_f32,
    |b: &mut [u8], v| LittleEndian::write_f32(b, v),
    |v: f32| u64::from(v.to_bits()),
    |bits: u64| f32::from_bits(bits as u32)
);
impl_fixed_numeric!(
    f64, 8, FieldType::Float64, FieldType::ListFloat64, F64, ListF64,
    LittleEndian::read_f64,
    |b: &mut [u8], v| LittleEndian::write_f64(b, v),
    |v: f64| v.to_bits(),
    |bits: u64| f64::from_bits(bits)
);

/// Per-field lazy-decode state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum FieldState {
    /// The authoritative value, if any, still lives in the raw buffer.
    #[default]
    Raw,
    /// The slot holds the value; the raw bytes are still byte-identical.
    Decoded,
    /// The slot holds the value; the raw bytes are stale.
    Dirty,
}

/// The decoded representation held in a field slot. String fields share the
/// `Bytes` variant; the descriptor disambiguates at the accessor.
#[derive(Debug, Clone)]
pub(crate) enum Value {
    Bool(bool),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Bytes(Vec<u8>),
    Struct(Struct),
    ListBools(Bools),
    ListU8(Numbers<u8>),
    ListU16(Numbers<u16>),
    ListU32(Numbers<u32>),
    ListU64(Numbers<u64>),
    ListI8(Numbers<i8>),
    ListI16(Numbers<i16>),
    ListI32(Numbers<i32>),
    ListI64(Numbers<i64>),
    ListF32(Numbers<f32>),
    ListF64(Numbers<f64>),
    ListBytes(BytesList),
    ListStrings(Strings),
    ListStructs(Structs),
}

impl Value {
    /// The exact byte count this slot contributes to the emit stream,
    /// with zero-value compression applied.
    pub(crate) fn footprint(&self) -> u64 {
        match self {
            Value::Bool(v) => {
                if *v {
                    HEADER_LEN as u64
                } else {
                    0
                }
            }
            Value::U8(v) => scalar_footprint(*v),
            Value::U16(v) => scalar_footprint(*v),
            Value::U32(v) => scalar_footprint(*v),
            Value::U64(v) => scalar_footprint(*v),
            Value::I8(v) => scalar_footprint(*v),
            Value::I16(v) => scalar_footprint(*v),
            Value::I32(v) => scalar_footprint(*v),
            Value::I64(v) => scalar_footprint(*v),
            Value::F32(v) => scalar_footprint(*v),
            Value::F64(v) => scalar_footprint(*v),
            Value::Bytes(data) => bytes_footprint(data.len()),
            Value::Struct(child) => child.wire_size(),
            Value::ListBools(list) => list.wire_size(),
            Value::ListU8(list) => list.wire_size(),
            Value::ListU16(list) => list.wire_size(),
            Value::ListU32(list) => list.wire_size(),
            Value::ListU64(list) => list.wire_size(),
            Value::ListI8(list) => list.wire_size(),
            Value::ListI16(list) => list.wire_size(),
            Value::ListI32(list) => list.wire_size(),
            Value::ListI64(list) => list.wire_size(),
            Value::ListF32(list) => list.wire_size(),
            Value::ListF64(list) => list.wire_size(),
            Value::ListBytes(list) => list.wire_size(),
            Value::ListStrings(list) => list.wire_size(),
            Value::ListStructs(list) => list.wire_size(),
        }
    }
}

/// A dynamically typed field value for the generic `set_field` entry point.
/// Typed setters are the hot path; this mirror exists for callers that
/// dispatch on descriptor metadata.
#[derive(Debug, Clone)]
pub enum FieldValue {
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Uint8(u8),
    Uint16(u16),
    Uint32(u32),
    Uint64(u64),
    Float32(f32),
    Float64(f64),
    Bytes(Vec<u8>),
    String(String),
    Struct(Struct),
    ListBools(Bools),
    ListInt8(Numbers<i8>),
    ListInt16(Numbers<i16>),
    ListInt32(Numbers<i32>),
    ListInt64(Numbers<i64>),
    ListUint8(Numbers<u8>),
    ListUint16(Numbers<u16>),
    ListUint32(Numbers<u32>),
    ListUint64(Numbers<u64>),
    ListFloat32(Numbers<f32>),
    ListFloat64(Numbers<f64>),
    ListBytes(BytesList),
    ListStrings(Strings),
    ListStructs(Structs),
}

impl FieldValue {
    /// The wire tag this value would be stored under.
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::Bool(_) => FieldType::Bool,
            FieldValue::Int8(_) => FieldType::Int8,
            FieldValue::Int16(_) => FieldType::Int16,
            FieldValue::Int32(_) => FieldType::Int32,
            FieldValue::Int64(_) => FieldType::Int64,
            FieldValue::Uint8(_) => FieldType::Uint8,
            FieldValue::Uint16(_) => FieldType::Uint16,
            FieldValue::Uint32(_) => FieldType::Uint32,
            FieldValue::Uint64(_) => FieldType::Uint64,
            FieldValue::Float32(_) => FieldType::Float32,
            FieldValue::Float64(_) => FieldType::Float64,
            FieldValue::Bytes(_) => FieldType::Bytes,
            FieldValue::String(_) => FieldType::String,
            FieldValue::Struct(_) => FieldType::Struct,
            FieldValue::ListBools(_) => FieldType::ListBools,
            FieldValue::ListInt8(_) => FieldType::ListInt8,
            FieldValue::ListInt16(_) => FieldType::ListInt16,
            FieldValue::ListInt32(_) => FieldType::ListInt32,
            FieldValue::ListInt64(_) => FieldType::ListInt64,
            FieldValue::ListUint8(_) => FieldType::ListUint8,
            FieldValue::ListUint16(_) => FieldType::ListUint16,
            FieldValue::ListUint32(_) => FieldType::ListUint32,
            FieldValue::ListUint64(_) => FieldType::ListUint64,
            FieldValue::ListFloat32(_) => FieldType::ListFloat32,
            FieldValue::ListFloat64(_) => FieldType::ListFloat64,
            FieldValue::ListBytes(_) => FieldType::ListBytes,
            FieldValue::ListStrings(_) => FieldType::ListStrings,
            FieldValue::ListStructs(_) => FieldType::ListStructs,
        }
    }
}

/// Footprint of a scalar slot: zero compresses away, 64-bit values carry
/// one trailing word, everything smaller rides inside the header.
pub(crate) fn scalar_footprint<T: FixedNumeric>(value: T) -> u64 {
    if value.is_zero() {
        0
    } else if T::WIDTH == WORD {
        (HEADER_LEN + WORD) as u64
    } else {
        HEADER_LEN as u64
    }
}

/// Footprint of a bytes/string slot; empty payloads are omitted entirely.
pub(crate) fn bytes_footprint(len: usize) -> u64 {
    if len == 0 {
        0
    } else {
        (HEADER_LEN + word_aligned(len)) as u64
    }
}
