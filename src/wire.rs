use byteorder::{ByteOrder, LittleEndian};

use crate::errors::ClawError;

/// Every header and every field boundary is aligned to this many bytes.
pub const WORD: usize = 8;

/// Length of the generic 8-byte header that precedes every struct and field.
pub const HEADER_LEN: usize = 8;

/// Largest value representable in a header's 40-bit payload-size field.
pub const MAX_FINAL40: u64 = (1 << 40) - 1;

/// The closed set of wire type tags.
///
/// Values outside the set round-trip through `Unknown` so a reader built
/// against an older schema can skip and re-emit fields it does not know.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FieldType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float32,
    Float64,
    Bytes,
    String,
    Struct,
    ListBools,
    ListInt8,
    ListInt16,
    ListInt32,
    ListInt64,
    ListUint8,
    ListUint16,
    ListUint32,
    ListUint64,
    ListFloat32,
    ListFloat64,
    ListBytes,
    ListStrings,
    ListStructs,
    Unknown(u8),
}

impl From<u8> for FieldType {
    fn from(byte: u8) -> Self {
        match byte {
            1 => FieldType::Bool,
            2 => FieldType::Int8,
            3 => FieldType::Int16,
            4 => FieldType::Int32,
            5 => FieldType::Int64,
            6 => FieldType::Uint8,
            7 => FieldType::Uint16,
            8 => FieldType::Uint32,
            9 => FieldType::Uint64,
            10 => FieldType::Float32,
            11 => FieldType::Float64,
            12 => FieldType::Bytes,
            13 => FieldType::String,
            14 => FieldType::Struct,
            15 => FieldType::ListBools,
            16 => FieldType::ListInt8,
            17 => FieldType::ListInt16,
            18 => FieldType::ListInt32,
            19 => FieldType::ListInt64,
            20 => FieldType::ListUint8,
            21 => FieldType::ListUint16,
            22 => FieldType::ListUint32,
            23 => FieldType::ListUint64,
            24 => FieldType::ListFloat32,
            25 => FieldType::ListFloat64,
            26 => FieldType::ListBytes,
            27 => FieldType::ListStrings,
            28 => FieldType::ListStructs,
            other => FieldType::Unknown(other),
        }
    }
}

impl From<FieldType> for u8 {
    fn from(field_type: FieldType) -> Self {
        match field_type {
            FieldType::Bool => 1,
            FieldType::Int8 => 2,
            FieldType::Int16 => 3,
            FieldType::Int32 => 4,
            FieldType::Int64 => 5,
            FieldType::Uint8 => 6,
            FieldType::Uint16 => 7,
            FieldType::Uint32 => 8,
            FieldType::Uint64 => 9,
            FieldType::Float32 => 10,
            FieldType::Float64 => 11,
            FieldType::Bytes => 12,
            FieldType::String => 13,
            FieldType::Struct => 14,
            FieldType::ListBools => 15,
            FieldType::ListInt8 => 16,
            FieldType::ListInt16 => 17,
            FieldType::ListInt32 => 18,
            FieldType::ListInt64 => 19,
            FieldType::ListUint8 => 20,
            FieldType::ListUint16 => 21,
            FieldType::ListUint32 => 22,
            FieldType::ListUint64 => 23,
            FieldType::ListFloat32 => 24,
            FieldType::ListFloat64 => 25,
            FieldType::ListBytes => 26,
            FieldType::ListStrings => 27,
            FieldType::ListStructs => 28,
            FieldType::Unknown(byte) => byte,
        }
    }
}

impl FieldType {
    /// Byte width of a scalar value of this type, if it is a scalar.
    pub fn scalar_width(self) -> Option<usize> {
        match self {
            FieldType::Bool | FieldType::Int8 | FieldType::Uint8 => Some(1),
            FieldType::Int16 | FieldType::Uint16 => Some(2),
            FieldType::Int32 | FieldType::Uint32 | FieldType::Float32 => Some(4),
            FieldType::Int64 | FieldType::Uint64 | FieldType::Float64 => Some(8),
            _ => None,
        }
    }

    /// Item width of a fixed-width number list, if this tag is one.
    pub fn list_item_width(self) -> Option<usize> {
        match self {
            FieldType::ListInt8 | FieldType::ListUint8 => Some(1),
            FieldType::ListInt16 | FieldType::ListUint16 => Some(2),
            FieldType::ListInt32 | FieldType::ListUint32 | FieldType::ListFloat32 => Some(4),
            FieldType::ListInt64 | FieldType::ListUint64 | FieldType::ListFloat64 => Some(8),
            _ => None,
        }
    }

    pub fn is_scalar(self) -> bool {
        self.scalar_width().is_some()
    }

    pub fn is_list(self) -> bool {
        matches!(
            self,
            FieldType::ListBools
                | FieldType::ListInt8
                | FieldType::ListInt16
                | FieldType::ListInt32
                | FieldType::ListInt64
                | FieldType::ListUint8
                | FieldType::ListUint16
                | FieldType::ListUint32
                | FieldType::ListUint64
                | FieldType::ListFloat32
                | FieldType::ListFloat64
                | FieldType::ListBytes
                | FieldType::ListStrings
                | FieldType::ListStructs
        )
    }
}

/// Zero bytes required to bring `n` up to the next multiple of 8.
pub fn padding_needed(n: usize) -> usize {
    (WORD - n % WORD) % WORD
}

/// `n` rounded up to whole 8-byte words.
pub fn word_aligned(n: usize) -> usize {
    n + padding_needed(n)
}

const FINAL40_SHIFT: u32 = 24;
const TYPE_SHIFT: u32 = 16;

/// The generic 8-byte header: field number (bits 0-15), type tag
/// (bits 16-23) and the overloaded 40-bit payload-size field (bits 24-63),
/// packed little-endian.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Header {
    pub field_num: u16,
    pub field_type: FieldType,
    pub final40: u64,
}

impl Header {
    pub fn new(field_num: u16, field_type: FieldType, final40: u64) -> Result<Header, ClawError> {
        if final40 > MAX_FINAL40 {
            return Err(ClawError::SizeOverflow {
                field: field_num,
                size: final40,
            });
        }

        Ok(Header {
            field_num,
            field_type,
            final40,
        })
    }

    pub fn pack(&self) -> [u8; HEADER_LEN] {
        let word = u64::from(self.field_num)
            | u64::from(u8::from(self.field_type)) << TYPE_SHIFT
            | self.final40 << FINAL40_SHIFT;

        let mut bytes = [0u8; HEADER_LEN];
        LittleEndian::write_u64(&mut bytes, word);
        bytes
    }

    pub fn unpack(bytes: &[u8]) -> Result<Header, ClawError> {
        if bytes.len() < HEADER_LEN {
            return Err(ClawError::Truncated {
                needed: HEADER_LEN,
                remaining: bytes.len(),
            });
        }

        let word = LittleEndian::read_u64(&bytes[..HEADER_LEN]);

        Ok(Header {
            field_num: (word & 0xFFFF) as u16,
            field_type: FieldType::from((word >> TYPE_SHIFT) as u8),
            final40: word >> FINAL40_SHIFT,
        })
    }
}

/// `WireCursor` wraps a byte slice and lets decode paths take successive
/// little-endian values from it without tracking offsets by hand.
pub struct WireCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Number of bytes not yet taken.
    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Advances past `size` bytes and returns them.
    pub fn advance(&mut self, size: usize) -> Result<&'a [u8], ClawError> {
        if self.remaining() < size {
            return Err(ClawError::Truncated {
                needed: size,
                remaining: self.remaining(),
            });
        }

        let bytes = &self.buf[self.pos..self.pos + size];
        self.pos += size;
        Ok(bytes)
    }

    pub fn skip(&mut self, size: usize) -> Result<(), ClawError> {
        self.advance(size).map(|_| ())
    }

    pub fn take_u8(&mut self) -> Result<u8, ClawError> {
        self.advance(1).map(|bytes| bytes[0])
    }

    #[allow(clippy::cast_possible_wrap)]
    pub fn take_i8(&mut self) -> Result<i8, ClawError> {
        self.advance(1).map(|bytes| bytes[0] as i8)
    }

    pub fn take_u16(&mut self) -> Result<u16, ClawError> {
        self.advance(2).map(LittleEndian::read_u16)
    }

    pub fn take_i16(&mut self) -> Result<i16, ClawError> {
        self.advance(2).map(LittleEndian::read_i16)
    }

    pub fn take_u32(&mut self) -> Result<u32, ClawError> {
        self.advance(4).map(LittleEndian::read_u32)
    }

    pub fn take_i32(&mut self) -> Result<i32, ClawError> {
        self.advance(4).map(LittleEndian::read_i32)
    }

    pub fn take_u64(&mut self) -> Result<u64, ClawError> {
        self.advance(8).map(LittleEndian::read_u64)
    }

    pub fn take_i64(&mut self) -> Result<i64, ClawError> {
        self.advance(8).map(LittleEndian::read_i64)
    }

    pub fn take_f32(&mut self) -> Result<f32, ClawError> {
        self.advance(4).map(LittleEndian::read_f32)
    }

    pub fn take_f64(&mut self) -> Result<f64, ClawError> {
        self.advance(8).map(LittleEndian::read_f64)
    }

    pub fn take_bool(&mut self) -> Result<bool, ClawError> {
        self.take_u8().map(|val| val != 0)
    }

    pub fn take_header(&mut self) -> Result<Header, ClawError> {
        Header::unpack(self.advance(HEADER_LEN)?)
    }
}

/// Computes the full on-wire footprint (header + payload + padding) of the
/// field starting at `buf[0]`, validating it against the buffer length.
///
/// Variable-shape lists are walked item by item; everything else is derived
/// from the header alone.
pub fn field_wire_size(buf: &[u8]) -> Result<usize, ClawError> {
    let header = Header::unpack(buf)?;
    let field = header.field_num;

    let nonzero_count = |n: u64| -> Result<u64, ClawError> {
        if n == 0 {
            Err(ClawError::EmptyList { field })
        } else {
            Ok(n)
        }
    };

    let size: u64 = match header.field_type {
        FieldType::Bool
        | FieldType::Int8
        | FieldType::Int16
        | FieldType::Int32
        | FieldType::Uint8
        | FieldType::Uint16
        | FieldType::Uint32
        | FieldType::Float32 => HEADER_LEN as u64,

        FieldType::Int64 | FieldType::Uint64 | FieldType::Float64 => {
            if header.final40 != WORD as u64 {
                return Err(ClawError::SizeMismatch {
                    declared: header.final40,
                    observed: WORD as u64,
                });
            }
            (HEADER_LEN + WORD) as u64
        }

        FieldType::Bytes | FieldType::String => {
            HEADER_LEN as u64 + aligned64(header.final40)
        }

        FieldType::Struct => {
            if header.final40 < HEADER_LEN as u64 {
                return Err(ClawError::SizeMismatch {
                    declared: header.final40,
                    observed: HEADER_LEN as u64,
                });
            }
            header.final40
        }

        FieldType::ListBools => {
            let n = nonzero_count(header.final40)?;
            HEADER_LEN as u64 + aligned64(n.div_ceil(8))
        }

        FieldType::ListInt8
        | FieldType::ListInt16
        | FieldType::ListInt32
        | FieldType::ListInt64
        | FieldType::ListUint8
        | FieldType::ListUint16
        | FieldType::ListUint32
        | FieldType::ListUint64
        | FieldType::ListFloat32
        | FieldType::ListFloat64 => {
            let n = nonzero_count(header.final40)?;
            let width = header.field_type.list_item_width().unwrap_or(1) as u64;
            HEADER_LEN as u64 + aligned64(n * width)
        }

        FieldType::ListBytes | FieldType::ListStrings => {
            let n = nonzero_count(header.final40)?;
            let mut pos: u64 = HEADER_LEN as u64;
            for _ in 0..n {
                let at = pos as usize;
                if buf.len() < at + 4 {
                    return Err(ClawError::Truncated {
                        needed: at + 4,
                        remaining: buf.len(),
                    });
                }
                let item_len = u64::from(LittleEndian::read_u32(&buf[at..at + 4]));
                pos += 4 + item_len;
            }
            // The single trailing pad run covers header + prefixes + payloads.
            aligned64(pos)
        }

        FieldType::ListStructs => {
            let n = nonzero_count(header.final40)?;
            let mut pos: u64 = HEADER_LEN as u64;
            for _ in 0..n {
                let at = pos as usize;
                let elem = Header::unpack(buf.get(at..).unwrap_or(&[]))?;
                if elem.final40 < HEADER_LEN as u64 {
                    return Err(ClawError::SizeMismatch {
                        declared: elem.final40,
                        observed: HEADER_LEN as u64,
                    });
                }
                pos += elem.final40;
            }
            pos
        }

        // Unknown tags declare the padded length of their trailing payload so
        // they can be skipped and re-emitted verbatim.
        FieldType::Unknown(_) => HEADER_LEN as u64 + aligned64(header.final40),
    };

    if size > buf.len() as u64 {
        return Err(ClawError::Truncated {
            needed: size as usize,
            remaining: buf.len(),
        });
    }
    if size % WORD as u64 != 0 {
        return Err(ClawError::BadPadding { field });
    }

    Ok(size as usize)
}

fn aligned64(n: u64) -> u64 {
    (n + (WORD as u64 - 1)) / WORD as u64 * WORD as u64
}
