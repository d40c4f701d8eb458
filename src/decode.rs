//! The per-field-type lazy decoders.
//!
//! One static table, indexed by wire tag. Mappings resolve their entries at
//! build time, so first access to a raw field is a plain function-pointer
//! call with no type switch. Unassigned tags resolve to a no-op so a newer
//! writer cannot crash an older reader.

use lazy_static::lazy_static;

use crate::errors::ClawError;
use crate::lists::{Bools, BytesList, Strings, Structs};
use crate::mapping::FieldDescriptor;
use crate::pool::RawBuf;
use crate::structs::{Struct, StructInner};
use crate::value::sealed::Sealed as _;
use crate::value::{FixedNumeric, Value};
use crate::wire::{FieldType, Header, WireCursor, HEADER_LEN, WORD};

/// Decodes one raw field (header included) into its slot on `target`.
/// Sizes are already accounted for in the raw buffer, so decoders install
/// slots directly instead of going through the mutator protocol.
pub(crate) type DecodeFn =
    fn(&mut StructInner, &FieldDescriptor, RawBuf) -> Result<(), ClawError>;

lazy_static! {
    static ref DECODERS: [DecodeFn; 256] = build_table();
}

pub(crate) fn decoder_for(field_type: FieldType) -> DecodeFn {
    DECODERS[usize::from(u8::from(field_type))]
}

fn build_table() -> [DecodeFn; 256] {
    let mut table: [DecodeFn; 256] = [decode_nop; 256];

    table[usize::from(u8::from(FieldType::Bool))] = decode_bool;
    table[usize::from(u8::from(FieldType::Int8))] = decode_scalar::<i8>;
    table[usize::from(u8::from(FieldType::Int16))] = decode_scalar::<i16>;
    table[usize::from(u8::from(FieldType::Int32))] = decode_scalar::<i32>;
    table[usize::from(u8::from(FieldType::Int64))] = decode_scalar::<i64>;
    table[usize::from(u8::from(FieldType::Uint8))] = decode_scalar::<u8>;
    table[usize::from(u8::from(FieldType::Uint16))] = decode_scalar::<u16>;
    table[usize::from(u8::from(FieldType::Uint32))] = decode_scalar::<u32>;
    table[usize::from(u8::from(FieldType::Uint64))] = decode_scalar::<u64>;
    table[usize::from(u8::from(FieldType::Float32))] = decode_scalar::<f32>;
    table[usize::from(u8::from(FieldType::Float64))] = decode_scalar::<f64>;
    table[usize::from(u8::from(FieldType::Bytes))] = decode_bytes;
    table[usize::from(u8::from(FieldType::String))] = decode_bytes;
    table[usize::from(u8::from(FieldType::Struct))] = decode_struct;
    table[usize::from(u8::from(FieldType::ListBools))] = decode_list_bools;
    table[usize::from(u8::from(FieldType::ListInt8))] = decode_list_numbers::<i8>;
    table[usize::from(u8::from(FieldType::ListInt16))] = decode_list_numbers::<i16>;
    table[usize::from(u8::from(FieldType::ListInt32))] = decode_list_numbers::<i32>;
    table[usize::from(u8::from(FieldType::ListInt64))] = decode_list_numbers::<i64>;
    table[usize::from(u8::from(FieldType::ListUint8))] = decode_list_numbers::<u8>;
    table[usize::from(u8::from(FieldType::ListUint16))] = decode_list_numbers::<u16>;
    table[usize::from(u8::from(FieldType::ListUint32))] = decode_list_numbers::<u32>;
    table[usize::from(u8::from(FieldType::ListUint64))] = decode_list_numbers::<u64>;
    table[usize::from(u8::from(FieldType::ListFloat32))] = decode_list_numbers::<f32>;
    table[usize::from(u8::from(FieldType::ListFloat64))] = decode_list_numbers::<f64>;
    table[usize::from(u8::from(FieldType::ListBytes))] = decode_list_bytes;
    table[usize::from(u8::from(FieldType::ListStrings))] = decode_list_strings;
    table[usize::from(u8::from(FieldType::ListStructs))] = decode_list_structs;

    table
}

// Unknown tags keep their raw bytes authoritative; the emit path copies
// them verbatim.
fn decode_nop(
    _target: &mut StructInner,
    _desc: &FieldDescriptor,
    _raw: RawBuf,
) -> Result<(), ClawError> {
    Ok(())
}

fn decode_bool(
    target: &mut StructInner,
    desc: &FieldDescriptor,
    raw: RawBuf,
) -> Result<(), ClawError> {
    let header = Header::unpack(raw.bytes())?;
    target.install(desc.field_num, Value::Bool(header.final40 != 0));
    Ok(())
}

fn decode_scalar<T: FixedNumeric>(
    target: &mut StructInner,
    desc: &FieldDescriptor,
    raw: RawBuf,
) -> Result<(), ClawError> {
    let bytes = raw.bytes();
    let header = Header::unpack(bytes)?;

    // 64-bit values occupy the word after the header; everything smaller is
    // packed into the header itself.
    let bits = if T::WIDTH == WORD {
        WireCursor::new(&bytes[HEADER_LEN..]).take_u64()?
    } else {
        header.final40
    };

    target.install(desc.field_num, T::from_bits(bits).into_value());
    Ok(())
}

fn decode_bytes(
    target: &mut StructInner,
    desc: &FieldDescriptor,
    raw: RawBuf,
) -> Result<(), ClawError> {
    let bytes = raw.bytes();
    let header = Header::unpack(bytes)?;
    let len = header.final40 as usize;

    let payload = bytes
        .get(HEADER_LEN..HEADER_LEN + len)
        .ok_or(ClawError::Truncated {
            needed: HEADER_LEN + len,
            remaining: bytes.len(),
        })?;

    target.install(desc.field_num, Value::Bytes(payload.to_vec()));
    Ok(())
}

fn decode_struct(
    target: &mut StructInner,
    desc: &FieldDescriptor,
    raw: RawBuf,
) -> Result<(), ClawError> {
    let enclosing = target.mapping.clone().ok_or(ClawError::Recycled)?;
    let nested = enclosing.nested(desc)?;

    let child =
        Struct::from_raw_element(&nested, raw, &target.pools, target.is_set_enabled)?;
    child.attach_to_field(desc.field_num, target.self_weak.clone())?;

    target.install(desc.field_num, Value::Struct(child));
    Ok(())
}

fn decode_list_bools(
    target: &mut StructInner,
    desc: &FieldDescriptor,
    raw: RawBuf,
) -> Result<(), ClawError> {
    let bytes = raw.bytes();
    let header = Header::unpack(bytes)?;

    let list = Bools::from_wire(header.final40, &bytes[HEADER_LEN..])?;
    list.attach(desc.field_num, target.self_weak.clone())?;

    target.install(desc.field_num, Value::ListBools(list));
    Ok(())
}

fn decode_list_numbers<T: FixedNumeric>(
    target: &mut StructInner,
    desc: &FieldDescriptor,
    raw: RawBuf,
) -> Result<(), ClawError> {
    let bytes = raw.bytes();
    let header = Header::unpack(bytes)?;

    let list = crate::lists::Numbers::<T>::from_wire(
        header.final40,
        &bytes[HEADER_LEN..],
        &target.pools,
    )?;
    list.attach(desc.field_num, target.self_weak.clone())?;

    target.install(desc.field_num, T::list_into_value(list));
    Ok(())
}

fn decode_list_bytes(
    target: &mut StructInner,
    desc: &FieldDescriptor,
    raw: RawBuf,
) -> Result<(), ClawError> {
    let bytes = raw.bytes();
    let header = Header::unpack(bytes)?;

    let list = BytesList::from_wire(FieldType::ListBytes, header.final40, &bytes[HEADER_LEN..])?;
    list.attach(desc.field_num, target.self_weak.clone())?;

    target.install(desc.field_num, Value::ListBytes(list));
    Ok(())
}

fn decode_list_strings(
    target: &mut StructInner,
    desc: &FieldDescriptor,
    raw: RawBuf,
) -> Result<(), ClawError> {
    let bytes = raw.bytes();
    let header = Header::unpack(bytes)?;

    let list = Strings::from_wire(header.final40, &bytes[HEADER_LEN..])?;
    list.attach(desc.field_num, target.self_weak.clone())?;

    target.install(desc.field_num, Value::ListStrings(list));
    Ok(())
}

fn decode_list_structs(
    target: &mut StructInner,
    desc: &FieldDescriptor,
    raw: RawBuf,
) -> Result<(), ClawError> {
    let enclosing = target.mapping.clone().ok_or(ClawError::Recycled)?;
    let nested = enclosing.nested(desc)?;

    let list = Structs::from_wire(&nested, raw, &target.pools, target.is_set_enabled)?;
    list.attach(desc.field_num, target.self_weak.clone())?;

    target.install(desc.field_num, Value::ListStructs(list));
    Ok(())
}
