//! TDS data type definitions.
//!
//! This module defines the TDS 5.0 wire type codes and the static table that
//! describes how each type's format metadata and data are laid out.

use bitflags::bitflags;

use crate::error::ProtocolError;

/// TDS data type identifiers.
///
/// These correspond to the type bytes sent in format entries and parameter
/// definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeId {
    /// Fixed-length binary.
    Binary = 0x2D,
    /// Bit (boolean).
    Bit = 0x32,
    /// Fixed-length character.
    Char = 0x2F,
    /// Nullable datetime (4 or 8 bytes).
    DateTimeN = 0x6F,
    /// Nullable decimal.
    DecN = 0x6A,
    /// 32-bit floating point.
    Flt4 = 0x3B,
    /// 64-bit floating point.
    Flt8 = 0x3E,
    /// Nullable float (4 or 8 bytes).
    FltN = 0x6D,
    /// Image (binary blob).
    Image = 0x22,
    /// 8-bit unsigned integer.
    Int1 = 0x30,
    /// 16-bit signed integer.
    Int2 = 0x34,
    /// 32-bit signed integer.
    Int4 = 0x38,
    /// 64-bit signed integer.
    Int8 = 0xBF,
    /// Nullable signed integer (1, 2, 4 or 8 bytes).
    IntN = 0x26,
    /// 8-bit unsigned integer.
    UInt1 = 0x40,
    /// 16-bit unsigned integer.
    UInt2 = 0x41,
    /// 32-bit unsigned integer.
    UInt4 = 0x42,
    /// 64-bit unsigned integer.
    UInt8 = 0x43,
    /// Nullable unsigned integer (1, 2, 4 or 8 bytes).
    UIntN = 0x44,
    /// Binary with a 4-byte length.
    LongBinary = 0xE1,
    /// Character with a 4-byte length.
    LongChar = 0xAF,
    /// 8-byte money.
    Money = 0x3C,
    /// 4-byte money.
    ShortMoney = 0x7A,
    /// Nullable money (4 or 8 bytes).
    MoneyN = 0x6E,
    /// Nullable numeric.
    NumN = 0x6C,
    /// Text (character blob).
    Text = 0x23,
    /// Variable-length binary.
    VarBinary = 0x25,
    /// Security label.
    Sensitivity = 0x67,
    /// Security boundary.
    Boundary = 0x68,
    /// Variable-length character.
    VarChar = 0x27,
    /// Serialized blob.
    Blob = 0x24,
    /// Void.
    Void = 0x1F,
    /// 8-byte datetime.
    DateTime = 0x3D,
    /// 4-byte small datetime.
    ShortDate = 0x3A,
}

impl TypeId {
    /// Create a type ID from a raw byte.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        let type_id = match value {
            0x2D => Self::Binary,
            0x32 => Self::Bit,
            0x2F => Self::Char,
            0x6F => Self::DateTimeN,
            0x6A => Self::DecN,
            0x3B => Self::Flt4,
            0x3E => Self::Flt8,
            0x6D => Self::FltN,
            0x22 => Self::Image,
            0x30 => Self::Int1,
            0x34 => Self::Int2,
            0x38 => Self::Int4,
            0xBF => Self::Int8,
            0x26 => Self::IntN,
            0x40 => Self::UInt1,
            0x41 => Self::UInt2,
            0x42 => Self::UInt4,
            0x43 => Self::UInt8,
            0x44 => Self::UIntN,
            0xE1 => Self::LongBinary,
            0xAF => Self::LongChar,
            0x3C => Self::Money,
            0x7A => Self::ShortMoney,
            0x6E => Self::MoneyN,
            0x6C => Self::NumN,
            0x23 => Self::Text,
            0x25 => Self::VarBinary,
            0x67 => Self::Sensitivity,
            0x68 => Self::Boundary,
            0x27 => Self::VarChar,
            0x24 => Self::Blob,
            0x1F => Self::Void,
            0x3D => Self::DateTime,
            0x3A => Self::ShortDate,
            _ => return Err(ProtocolError::UnknownDataType(value)),
        };
        Ok(type_id)
    }

    /// Look up the layout descriptor for this type.
    ///
    /// Returns `None` for types this client cannot lay out (blob and void).
    #[must_use]
    pub fn descriptor(self) -> Option<&'static TypeDescriptor> {
        DESCRIPTORS.iter().find(|d| d.type_id == self)
    }

    /// Check if this type carries character data.
    #[must_use]
    pub const fn is_text(self) -> bool {
        matches!(
            self,
            Self::Char | Self::VarChar | Self::LongChar | Self::Text
        )
    }

    /// Check if this is a fixed-length type.
    #[must_use]
    pub fn is_fixed_length(self) -> bool {
        self.descriptor().and_then(TypeDescriptor::fixed_len).is_some()
    }
}

/// How a type's metadata is laid out inside a format entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatLayout {
    /// No metadata besides the locale.
    Empty,
    /// 1-byte declared length.
    OneByteLen,
    /// 4-byte declared length.
    FourByteLen,
    /// Length, precision and scale, 1 byte each.
    Decimal,
    /// 4-byte length then a 2-byte-length object name.
    Blob,
}

/// How a type's data is laid out inside a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataLayout {
    /// Always exactly this many bytes.
    Fixed(usize),
    /// 1-byte length prefix; zero means null.
    OneByteLen,
    /// 4-byte length prefix; zero means null.
    FourByteLen,
    /// Text pointer, timestamp, then a 4-byte length prefix.
    Blob,
}

/// Static description of a wire type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeDescriptor {
    /// Wire type code.
    pub type_id: TypeId,
    /// Server type name.
    pub name: &'static str,
    /// Whether the type can carry a null.
    pub nullable: bool,
    /// Format metadata layout.
    pub format: FormatLayout,
    /// Row data layout.
    pub data: DataLayout,
}

impl TypeDescriptor {
    const fn new(
        type_id: TypeId,
        name: &'static str,
        nullable: bool,
        format: FormatLayout,
        data: DataLayout,
    ) -> Self {
        Self {
            type_id,
            name,
            nullable,
            format,
            data,
        }
    }

    /// Size of the data in bytes when it is fixed.
    #[must_use]
    pub const fn fixed_len(&self) -> Option<usize> {
        match self.data {
            DataLayout::Fixed(n) => Some(n),
            _ => None,
        }
    }
}

use DataLayout as D;
use FormatLayout as F;

static DESCRIPTORS: [TypeDescriptor; 32] = [
    TypeDescriptor::new(TypeId::Binary, "binary", true, F::OneByteLen, D::OneByteLen),
    TypeDescriptor::new(TypeId::Bit, "bit", false, F::Empty, D::Fixed(1)),
    TypeDescriptor::new(TypeId::Char, "char", true, F::OneByteLen, D::OneByteLen),
    TypeDescriptor::new(TypeId::DateTimeN, "datetimn", true, F::OneByteLen, D::OneByteLen),
    TypeDescriptor::new(TypeId::DecN, "decimal", true, F::Decimal, D::OneByteLen),
    TypeDescriptor::new(TypeId::Flt4, "real", false, F::Empty, D::Fixed(4)),
    TypeDescriptor::new(TypeId::Flt8, "float", false, F::Empty, D::Fixed(8)),
    TypeDescriptor::new(TypeId::FltN, "fltn", true, F::OneByteLen, D::OneByteLen),
    TypeDescriptor::new(TypeId::Image, "image", true, F::Blob, D::Blob),
    TypeDescriptor::new(TypeId::Int1, "tinyint", false, F::Empty, D::Fixed(1)),
    TypeDescriptor::new(TypeId::Int2, "smallint", false, F::Empty, D::Fixed(2)),
    TypeDescriptor::new(TypeId::Int4, "int", false, F::Empty, D::Fixed(4)),
    TypeDescriptor::new(TypeId::Int8, "bigint", false, F::Empty, D::Fixed(8)),
    TypeDescriptor::new(TypeId::IntN, "intn", true, F::OneByteLen, D::OneByteLen),
    TypeDescriptor::new(TypeId::UInt1, "unsigned tinyint", false, F::Empty, D::Fixed(1)),
    TypeDescriptor::new(TypeId::UInt2, "unsigned smallint", false, F::Empty, D::Fixed(2)),
    TypeDescriptor::new(TypeId::UInt4, "unsigned int", false, F::Empty, D::Fixed(4)),
    TypeDescriptor::new(TypeId::UInt8, "unsigned bigint", false, F::Empty, D::Fixed(8)),
    TypeDescriptor::new(TypeId::UIntN, "uintn", true, F::OneByteLen, D::OneByteLen),
    TypeDescriptor::new(TypeId::LongBinary, "longbinary", true, F::FourByteLen, D::FourByteLen),
    TypeDescriptor::new(TypeId::LongChar, "longchar", true, F::FourByteLen, D::FourByteLen),
    TypeDescriptor::new(TypeId::Money, "money", false, F::Empty, D::Fixed(8)),
    TypeDescriptor::new(TypeId::ShortMoney, "smallmoney", false, F::Empty, D::Fixed(4)),
    TypeDescriptor::new(TypeId::MoneyN, "moneyn", true, F::OneByteLen, D::OneByteLen),
    TypeDescriptor::new(TypeId::NumN, "numeric", true, F::Decimal, D::OneByteLen),
    TypeDescriptor::new(TypeId::Text, "text", true, F::Blob, D::Blob),
    TypeDescriptor::new(TypeId::VarBinary, "varbinary", true, F::OneByteLen, D::OneByteLen),
    TypeDescriptor::new(TypeId::Sensitivity, "sensitivity", true, F::OneByteLen, D::OneByteLen),
    TypeDescriptor::new(TypeId::Boundary, "boundary", true, F::OneByteLen, D::OneByteLen),
    TypeDescriptor::new(TypeId::VarChar, "varchar", true, F::OneByteLen, D::OneByteLen),
    TypeDescriptor::new(TypeId::DateTime, "datetime", false, F::Empty, D::Fixed(8)),
    TypeDescriptor::new(TypeId::ShortDate, "smalldatetime", false, F::Empty, D::Fixed(4)),
];

bitflags! {
    /// Column status flags from a row format entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ColumnStatus: u32 {
        /// Column is hidden (browse mode).
        const HIDDEN = 0x01;
        /// Column is part of a key.
        const KEY = 0x02;
        /// Column is a timestamp used for optimistic concurrency.
        const VERSION = 0x04;
        /// Row data carries a column status byte.
        const COLUMN_STATUS = 0x08;
        /// Column is updatable.
        const UPDATABLE = 0x10;
        /// Column allows nulls.
        const NULLABLE = 0x20;
        /// Column is an identity column.
        const IDENTITY = 0x40;
        /// Character data is blank padded.
        const PADCHAR = 0x80;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_type_id_from_u8() {
        assert_eq!(TypeId::from_u8(0x38).unwrap(), TypeId::Int4);
        assert_eq!(TypeId::from_u8(0xAF).unwrap(), TypeId::LongChar);
        assert!(matches!(
            TypeId::from_u8(0x99),
            Err(ProtocolError::UnknownDataType(0x99))
        ));
    }

    #[test]
    fn test_every_code_roundtrips() {
        for code in 0u8..=255 {
            if let Ok(type_id) = TypeId::from_u8(code) {
                assert_eq!(type_id as u8, code);
            }
        }
    }

    #[test]
    fn test_descriptor_lookup() {
        let int4 = TypeId::Int4.descriptor().unwrap();
        assert_eq!(int4.name, "int");
        assert_eq!(int4.fixed_len(), Some(4));
        assert!(!int4.nullable);

        let decn = TypeId::DecN.descriptor().unwrap();
        assert_eq!(decn.format, FormatLayout::Decimal);
        assert_eq!(decn.data, DataLayout::OneByteLen);

        let text = TypeId::Text.descriptor().unwrap();
        assert_eq!(text.format, FormatLayout::Blob);
    }

    #[test]
    fn test_blob_and_void_have_no_descriptor() {
        assert!(TypeId::Blob.descriptor().is_none());
        assert!(TypeId::Void.descriptor().is_none());
    }

    #[test]
    fn test_fixed_length_detection() {
        assert!(TypeId::Int4.is_fixed_length());
        assert!(TypeId::Flt8.is_fixed_length());
        assert!(!TypeId::VarChar.is_fixed_length());
        assert!(!TypeId::Void.is_fixed_length());
    }

    #[test]
    fn test_column_status_retains_unknown_bits() {
        let status = ColumnStatus::from_bits_retain(0x0120);
        assert!(status.contains(ColumnStatus::NULLABLE));
        assert_eq!(status.bits(), 0x0120);
    }
}
