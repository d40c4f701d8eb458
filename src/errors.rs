use std::io;
use std::string::FromUtf8Error;

use thiserror::Error;

use crate::wire::FieldType;

#[derive(Error, Debug)]
pub enum ClawError {
    #[error("IO Error: {0}")]
    Io(#[from] io::Error),

    #[error("UTF-8 Decoding Error: {0}")]
    Utf8(#[from] FromUtf8Error),

    #[error("Unknown field number {field}")]
    UnknownField { field: u16 },

    #[error("Field {field}: descriptor says {expected}, caller requested {requested}")]
    TypeMismatch {
        field: u16,
        expected: FieldType,
        requested: FieldType,
    },

    #[error("Struct was recycled; acquire a fresh one from its mapping")]
    Recycled,

    #[error("Truncated buffer: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("Field {field}: list header declares zero items")]
    EmptyList { field: u16 },

    #[error("Declared size {declared} disagrees with observed length {observed}")]
    SizeMismatch { declared: u64, observed: u64 },

    #[error("Field {field}: footprint is not a multiple of 8 bytes")]
    BadPadding { field: u16 },

    #[error("Unexpected end of stream")]
    UnexpectedEof,

    #[error("Field {field}: size {size} exceeds the 40-bit wire limit")]
    SizeOverflow { field: u16, size: u64 },

    #[error("Field {field}: child is already attached to a parent")]
    AlreadyAttached { field: u16 },

    #[error("Field {field}: child mapping differs from the descriptor's mapping")]
    MappingMismatch { field: u16 },

    #[error("Index {index} out of bounds for list of length {len}")]
    OutOfBounds { index: usize, len: usize },

    #[error("Explicit-set tracking must be enabled before any data is decoded")]
    IsSetAfterDecode,

    #[error("Invalid mapping: {0}")]
    InvalidMapping(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}
