//! Pixel element type definitions

use serde::{Deserialize, Serialize};

/// Supported pixel element types.
///
/// The discriminants are the type codes carried in shared-memory image
/// metadata and in the wire header, so they must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ElementType {
    /// 8-bit unsigned integer
    UInt8 = 1,
    /// 8-bit signed integer
    Int8 = 2,
    /// 16-bit unsigned integer
    UInt16 = 3,
    /// 16-bit signed integer
    Int16 = 4,
    /// 32-bit unsigned integer
    UInt32 = 5,
    /// 32-bit signed integer
    Int32 = 6,
    /// 64-bit unsigned integer
    UInt64 = 7,
    /// 64-bit signed integer
    Int64 = 8,
    /// 32-bit floating point
    Float32 = 9,
    /// 64-bit floating point
    Float64 = 10,
    /// Complex number made of two 32-bit floats
    ComplexFloat32 = 11,
    /// Complex number made of two 64-bit floats
    ComplexFloat64 = 12,
    /// 16-bit floating point
    Float16 = 13,
}

impl ElementType {
    /// All element types, in type code order.
    pub const ALL: [ElementType; 13] = [
        ElementType::UInt8,
        ElementType::Int8,
        ElementType::UInt16,
        ElementType::Int16,
        ElementType::UInt32,
        ElementType::Int32,
        ElementType::UInt64,
        ElementType::Int64,
        ElementType::Float32,
        ElementType::Float64,
        ElementType::ComplexFloat32,
        ElementType::ComplexFloat64,
        ElementType::Float16,
    ];

    /// Returns the size in bytes of one element.
    pub const fn size(self) -> usize {
        match self {
            ElementType::UInt8 | ElementType::Int8 => 1,
            ElementType::UInt16 | ElementType::Int16 | ElementType::Float16 => 2,
            ElementType::UInt32 | ElementType::Int32 | ElementType::Float32 => 4,
            ElementType::UInt64
            | ElementType::Int64
            | ElementType::Float64
            | ElementType::ComplexFloat32 => 8,
            ElementType::ComplexFloat64 => 16,
        }
    }

    /// The numeric type code.
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Look up an element type by its numeric code.
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }

    /// Whether the type is a 16-bit integer, the only kind the pixel codec
    /// compresses.
    pub const fn is_16bit_integer(self) -> bool {
        matches!(self, ElementType::UInt16 | ElementType::Int16)
    }
}

impl std::fmt::Display for ElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ElementType::UInt8 => "u8",
            ElementType::Int8 => "i8",
            ElementType::UInt16 => "u16",
            ElementType::Int16 => "i16",
            ElementType::UInt32 => "u32",
            ElementType::Int32 => "i32",
            ElementType::UInt64 => "u64",
            ElementType::Int64 => "i64",
            ElementType::Float32 => "f32",
            ElementType::Float64 => "f64",
            ElementType::ComplexFloat32 => "c32",
            ElementType::ComplexFloat64 => "c64",
            ElementType::Float16 => "f16",
        };
        f.write_str(name)
    }
}
