use std::fmt;

use crate::wire::{FieldType, Header};

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Bool => "bool",
            FieldType::Int8 => "int8",
            FieldType::Int16 => "int16",
            FieldType::Int32 => "int32",
            FieldType::Int64 => "int64",
            FieldType::Uint8 => "uint8",
            FieldType::Uint16 => "uint16",
            FieldType::Uint32 => "uint32",
            FieldType::Uint64 => "uint64",
            FieldType::Float32 => "float32",
            FieldType::Float64 => "float64",
            FieldType::Bytes => "bytes",
            FieldType::String => "string",
            FieldType::Struct => "struct",
            FieldType::ListBools => "[]bool",
            FieldType::ListInt8 => "[]int8",
            FieldType::ListInt16 => "[]int16",
            FieldType::ListInt32 => "[]int32",
            FieldType::ListInt64 => "[]int64",
            FieldType::ListUint8 => "[]uint8",
            FieldType::ListUint16 => "[]uint16",
            FieldType::ListUint32 => "[]uint32",
            FieldType::ListUint64 => "[]uint64",
            FieldType::ListFloat32 => "[]float32",
            FieldType::ListFloat64 => "[]float64",
            FieldType::ListBytes => "[]bytes",
            FieldType::ListStrings => "[]string",
            FieldType::ListStructs => "[]struct",
            FieldType::Unknown(tag) => return write!(f, "unknown(0x{tag:02X})"),
        };
        f.write_str(name)
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "field {} {} final40={}",
            self.field_num, self.field_type, self.final40
        )
    }
}
