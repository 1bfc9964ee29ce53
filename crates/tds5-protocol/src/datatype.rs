//! Per-type wire codec.
//!
//! Reads format metadata and row values for every type in the descriptor
//! table, and writes the subset of types this client sends as parameters.

use chrono::{NaiveDate, NaiveDateTime, TimeDelta, Timelike};
use encoding_rs::Encoding;
use rust_decimal::Decimal;
use tds5_types::{SqlValue, TypeError};

use crate::codec::{TdsRead, TdsWrite, decode_text, encode_text, read_b_varchar, write_b_varchar};
use crate::error::ProtocolError;
use crate::types::{FormatLayout, TypeId};

/// Declared length of a varchar or varbinary parameter.
pub const VAR_MAX: usize = 255;

/// Declared length of a long character or binary parameter.
pub const LONG_MAX: u32 = i32::MAX as u32;

/// Total byte length of an outbound decimal value (sign plus magnitude).
pub const DECIMAL_WIRE_LEN: u8 = 17;

/// Largest precision the server accepts for decimal and numeric.
pub const MAX_PRECISION: u8 = 38;

const TICKS_PER_SECOND: u64 = 300;
const TICKS_PER_DAY: u64 = 86_400 * TICKS_PER_SECOND;
const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// Metadata that follows the type code in a format entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeMetadata {
    /// Declared maximum length in bytes.
    pub length: u32,
    /// Decimal precision.
    pub precision: u8,
    /// Decimal scale.
    pub scale: u8,
    /// Locale information.
    pub locale: Option<String>,
    /// Blob object name (text and image only).
    pub object_name: Option<String>,
}

impl TypeMetadata {
    /// Create metadata with only a declared length.
    #[must_use]
    pub fn with_length(length: u32) -> Self {
        Self {
            length,
            ..Self::default()
        }
    }

    /// Create decimal metadata.
    #[must_use]
    pub fn decimal(length: u8, precision: u8, scale: u8) -> Self {
        Self {
            length: u32::from(length),
            precision,
            scale,
            ..Self::default()
        }
    }

    /// Build the metadata sent for a parameter of `type_id` holding `value`.
    ///
    /// Integer and float widths follow the value; a null takes the widest
    /// common form. A value that `write_value` would refuse for `type_id`
    /// is refused here too, so a request can be checked before encoding.
    pub fn for_param(type_id: TypeId, value: &SqlValue) -> Result<Self, TypeError> {
        let metadata = match (type_id, value) {
            (TypeId::VarChar, SqlValue::Null | SqlValue::String(_))
            | (TypeId::VarBinary, SqlValue::Null | SqlValue::Binary(_)) => Self::with_length(VAR_MAX as u32),
            (TypeId::LongChar, SqlValue::Null | SqlValue::String(_))
            | (TypeId::LongBinary, SqlValue::Null | SqlValue::Binary(_)) => Self::with_length(LONG_MAX),
            (TypeId::VarChar | TypeId::VarBinary | TypeId::LongChar | TypeId::LongBinary, other) => {
                return Err(mismatch(type_id, other));
            }
            (TypeId::IntN, _) => Self::with_length(match value {
                SqlValue::TinyInt(_) => 1,
                SqlValue::SmallInt(_) => 2,
                SqlValue::Null | SqlValue::Int(_) => 4,
                SqlValue::BigInt(_) => 8,
                other => return Err(mismatch(type_id, other)),
            }),
            (TypeId::UIntN, _) => Self::with_length(match value {
                SqlValue::TinyInt(_) => 1,
                SqlValue::USmallInt(_) => 2,
                SqlValue::Null | SqlValue::UInt(_) => 4,
                SqlValue::UBigInt(_) => 8,
                other => return Err(mismatch(type_id, other)),
            }),
            (TypeId::FltN, _) => Self::with_length(match value {
                SqlValue::Float(_) => 4,
                SqlValue::Null | SqlValue::Double(_) => 8,
                other => return Err(mismatch(type_id, other)),
            }),
            (TypeId::DateTimeN, SqlValue::Null | SqlValue::DateTime(_)) => Self::with_length(8),
            (TypeId::DateTimeN, other) => return Err(mismatch(type_id, other)),
            (TypeId::DecN | TypeId::NumN, _) => match value {
                SqlValue::Null => Self::decimal(DECIMAL_WIRE_LEN, MAX_PRECISION, 0),
                SqlValue::Decimal(d) => {
                    let scale = u8::try_from(d.scale())
                        .map_err(|_| TypeError::OutOfRange { target_type: "decimal" })?;
                    Self::decimal(DECIMAL_WIRE_LEN, decimal_precision(d), scale)
                }
                other => return Err(mismatch(type_id, other)),
            },
            (TypeId::Bit, SqlValue::Bool(_)) => Self::default(),
            (TypeId::Bit, other) => return Err(mismatch(type_id, other)),
            (other, _) => return Err(unsupported(other)),
        };
        Ok(metadata)
    }
}

/// Size of the metadata written for a parameter of `type_id`, excluding the
/// locale byte.
pub fn param_metadata_len(type_id: TypeId) -> Result<usize, TypeError> {
    match type_id {
        TypeId::Bit => Ok(0),
        TypeId::VarChar
        | TypeId::VarBinary
        | TypeId::IntN
        | TypeId::UIntN
        | TypeId::FltN
        | TypeId::DateTimeN => Ok(1),
        TypeId::DecN | TypeId::NumN => Ok(3),
        TypeId::LongChar | TypeId::LongBinary => Ok(4),
        other => Err(unsupported(other)),
    }
}

fn unsupported(type_id: TypeId) -> TypeError {
    let name = type_id.descriptor().map_or("blob", |d| d.name);
    TypeError::Unsupported(format!("{name} (0x{:02X})", type_id as u8))
}

fn mismatch(type_id: TypeId, value: &SqlValue) -> TypeError {
    match value {
        SqlValue::Null => TypeError::UnexpectedNull,
        _ => TypeError::TypeMismatch {
            expected: type_id.descriptor().map_or("blob", |d| d.name),
            actual: value.type_name().to_string(),
        },
    }
}

fn invalid_length(type_id: TypeId, length: usize) -> ProtocolError {
    ProtocolError::InvalidDataLength { type_id, length }
}

/// Read the metadata of a format entry, locale included.
pub fn read_type_metadata(
    src: &mut (impl TdsRead + ?Sized),
    type_id: TypeId,
    encoding: &'static Encoding,
) -> Result<TypeMetadata, ProtocolError> {
    let descriptor = type_id.descriptor().ok_or_else(|| unsupported(type_id))?;
    let mut metadata = TypeMetadata::default();

    match descriptor.format {
        FormatLayout::Empty => {}
        FormatLayout::OneByteLen => {
            metadata.length = u32::from(src.read_u8()?);
        }
        FormatLayout::Decimal => {
            metadata.length = u32::from(src.read_u8()?);
            metadata.precision = src.read_u8()?;
            metadata.scale = src.read_u8()?;
        }
        FormatLayout::FourByteLen => {
            metadata.length = src.read_u32_le()?;
        }
        FormatLayout::Blob => {
            metadata.length = src.read_u32_le()?;
            let name_len = usize::from(src.read_u16_le()?);
            if name_len > 0 {
                let name = src.read_bytes(name_len)?;
                metadata.object_name = Some(decode_text(encoding, &name));
            }
        }
    }

    metadata.locale = read_b_varchar(src, encoding)?;
    Ok(metadata)
}

/// Write the metadata of a format entry, locale included.
pub fn write_type_metadata(
    dst: &mut (impl TdsWrite + ?Sized),
    type_id: TypeId,
    metadata: &TypeMetadata,
    encoding: &'static Encoding,
) -> Result<(), ProtocolError> {
    let descriptor = type_id.descriptor().ok_or_else(|| unsupported(type_id))?;

    match descriptor.format {
        FormatLayout::Empty => {}
        FormatLayout::OneByteLen => {
            dst.write_u8(metadata.length.min(u32::from(u8::MAX)) as u8)?;
        }
        FormatLayout::Decimal => {
            dst.write_u8(metadata.length.min(u32::from(u8::MAX)) as u8)?;
            dst.write_u8(metadata.precision)?;
            dst.write_u8(metadata.scale)?;
        }
        FormatLayout::FourByteLen => {
            dst.write_u32_le(metadata.length)?;
        }
        FormatLayout::Blob => {
            dst.write_u32_le(metadata.length)?;
            let name = encode_text(encoding, metadata.object_name.as_deref().unwrap_or(""));
            let len = name.len().min(usize::from(u16::MAX));
            dst.write_u16_le(len as u16)?;
            dst.write_bytes(&name[..len])?;
        }
    }

    write_b_varchar(dst, encoding, metadata.locale.as_deref().unwrap_or(""))
}

/// Read one value laid out as `type_id` with the entry's `metadata`.
///
/// A zero length on any length-prefixed type decodes to `SqlValue::Null`.
pub fn read_value(
    src: &mut (impl TdsRead + ?Sized),
    type_id: TypeId,
    metadata: &TypeMetadata,
    encoding: &'static Encoding,
) -> Result<SqlValue, ProtocolError> {
    let value = match type_id {
        TypeId::Int1 | TypeId::UInt1 => SqlValue::TinyInt(src.read_u8()?),
        TypeId::Int2 => SqlValue::SmallInt(src.read_i16_le()?),
        TypeId::Int4 => SqlValue::Int(src.read_i32_le()?),
        TypeId::Int8 => SqlValue::BigInt(src.read_i64_le()?),
        TypeId::UInt2 => SqlValue::USmallInt(src.read_u16_le()?),
        TypeId::UInt4 => SqlValue::UInt(src.read_u32_le()?),
        TypeId::UInt8 => SqlValue::UBigInt(src.read_u64_le()?),
        TypeId::Bit => SqlValue::Bool(src.read_u8()? != 0),
        TypeId::Flt4 => SqlValue::Float(src.read_f32_le()?),
        TypeId::Flt8 => SqlValue::Double(src.read_f64_le()?),
        TypeId::Money => read_money8(src)?,
        TypeId::ShortMoney => read_money4(src)?,
        TypeId::DateTime => read_datetime8(src)?,
        TypeId::ShortDate => read_datetime4(src)?,

        TypeId::IntN => match usize::from(src.read_u8()?) {
            0 => SqlValue::Null,
            1 => SqlValue::TinyInt(src.read_u8()?),
            2 => SqlValue::SmallInt(src.read_i16_le()?),
            4 => SqlValue::Int(src.read_i32_le()?),
            8 => SqlValue::BigInt(src.read_i64_le()?),
            n => return Err(invalid_length(type_id, n)),
        },
        TypeId::UIntN => match usize::from(src.read_u8()?) {
            0 => SqlValue::Null,
            1 => SqlValue::TinyInt(src.read_u8()?),
            2 => SqlValue::USmallInt(src.read_u16_le()?),
            4 => SqlValue::UInt(src.read_u32_le()?),
            8 => SqlValue::UBigInt(src.read_u64_le()?),
            n => return Err(invalid_length(type_id, n)),
        },
        TypeId::FltN => match usize::from(src.read_u8()?) {
            0 => SqlValue::Null,
            4 => SqlValue::Float(src.read_f32_le()?),
            8 => SqlValue::Double(src.read_f64_le()?),
            n => return Err(invalid_length(type_id, n)),
        },
        TypeId::MoneyN => match usize::from(src.read_u8()?) {
            0 => SqlValue::Null,
            4 => read_money4(src)?,
            8 => read_money8(src)?,
            n => return Err(invalid_length(type_id, n)),
        },
        TypeId::DateTimeN => match usize::from(src.read_u8()?) {
            0 => SqlValue::Null,
            4 => read_datetime4(src)?,
            8 => read_datetime8(src)?,
            n => return Err(invalid_length(type_id, n)),
        },
        TypeId::DecN | TypeId::NumN => read_decimal(src, type_id, metadata.scale)?,

        TypeId::Char | TypeId::VarChar => match usize::from(src.read_u8()?) {
            0 => SqlValue::Null,
            n => SqlValue::String(decode_text(encoding, &src.read_bytes(n)?)),
        },
        TypeId::Binary | TypeId::VarBinary | TypeId::Sensitivity | TypeId::Boundary => {
            match usize::from(src.read_u8()?) {
                0 => SqlValue::Null,
                n => SqlValue::Binary(src.read_bytes(n)?),
            }
        }
        TypeId::LongChar => match src.read_u32_le()? as usize {
            0 => SqlValue::Null,
            n => SqlValue::String(decode_text(encoding, &src.read_bytes(n)?)),
        },
        TypeId::LongBinary => match src.read_u32_le()? as usize {
            0 => SqlValue::Null,
            n => SqlValue::Binary(src.read_bytes(n)?),
        },
        TypeId::Text | TypeId::Image => {
            let pointer_len = usize::from(src.read_u8()?);
            if pointer_len == 0 {
                SqlValue::Null
            } else {
                // Text pointer and timestamp.
                src.skip(pointer_len + 8)?;
                let data_len = src.read_u32_le()? as usize;
                let data = src.read_bytes(data_len)?;
                if type_id == TypeId::Text {
                    SqlValue::String(decode_text(encoding, &data))
                } else {
                    SqlValue::Binary(data)
                }
            }
        }

        TypeId::Blob | TypeId::Void => return Err(unsupported(type_id).into()),
    };
    Ok(value)
}

/// Write one parameter value as `type_id`.
///
/// Only the parameter types are supported; anything else fails with
/// `TypeError::Unsupported`. Varchar and varbinary values are truncated to
/// 255 bytes.
pub fn write_value(
    dst: &mut (impl TdsWrite + ?Sized),
    type_id: TypeId,
    value: &SqlValue,
    encoding: &'static Encoding,
) -> Result<(), ProtocolError> {
    param_metadata_len(type_id)?;

    match (type_id, value) {
        (TypeId::Bit, SqlValue::Bool(b)) => dst.write_u8(u8::from(*b)),
        (TypeId::LongChar | TypeId::LongBinary, SqlValue::Null) => dst.write_u32_le(0),
        (TypeId::Bit, _) => Err(mismatch(type_id, value).into()),
        (_, SqlValue::Null) => dst.write_u8(0),

        (TypeId::VarChar, SqlValue::String(s)) => {
            write_short_bytes(dst, &encode_text(encoding, s))
        }
        (TypeId::VarBinary, SqlValue::Binary(b)) => write_short_bytes(dst, b),
        (TypeId::LongChar, SqlValue::String(s)) => write_long_bytes(dst, &encode_text(encoding, s)),
        (TypeId::LongBinary, SqlValue::Binary(b)) => write_long_bytes(dst, b),

        (TypeId::IntN, SqlValue::TinyInt(v)) | (TypeId::UIntN, SqlValue::TinyInt(v)) => {
            dst.write_u8(1)?;
            dst.write_u8(*v)
        }
        (TypeId::IntN, SqlValue::SmallInt(v)) => {
            dst.write_u8(2)?;
            dst.write_i16_le(*v)
        }
        (TypeId::IntN, SqlValue::Int(v)) => {
            dst.write_u8(4)?;
            dst.write_i32_le(*v)
        }
        (TypeId::IntN, SqlValue::BigInt(v)) => {
            dst.write_u8(8)?;
            dst.write_i64_le(*v)
        }
        (TypeId::UIntN, SqlValue::USmallInt(v)) => {
            dst.write_u8(2)?;
            dst.write_u16_le(*v)
        }
        (TypeId::UIntN, SqlValue::UInt(v)) => {
            dst.write_u8(4)?;
            dst.write_u32_le(*v)
        }
        (TypeId::UIntN, SqlValue::UBigInt(v)) => {
            dst.write_u8(8)?;
            dst.write_u64_le(*v)
        }
        (TypeId::FltN, SqlValue::Float(v)) => {
            dst.write_u8(4)?;
            dst.write_f32_le(*v)
        }
        (TypeId::FltN, SqlValue::Double(v)) => {
            dst.write_u8(8)?;
            dst.write_f64_le(*v)
        }
        (TypeId::DateTimeN, SqlValue::DateTime(dt)) => {
            let (days, ticks) = datetime_to_wire(dt)?;
            dst.write_u8(8)?;
            dst.write_i32_le(days)?;
            dst.write_i32_le(ticks)
        }
        (TypeId::DecN | TypeId::NumN, SqlValue::Decimal(d)) => {
            dst.write_u8(DECIMAL_WIRE_LEN)?;
            dst.write_u8(u8::from(d.is_sign_negative() && !d.is_zero()))?;
            dst.write_bytes(&d.mantissa().unsigned_abs().to_be_bytes())
        }

        _ => Err(mismatch(type_id, value).into()),
    }
}

fn write_short_bytes(dst: &mut (impl TdsWrite + ?Sized), bytes: &[u8]) -> Result<(), ProtocolError> {
    let len = bytes.len().min(VAR_MAX);
    dst.write_u8(len as u8)?;
    dst.write_bytes(&bytes[..len])
}

fn write_long_bytes(dst: &mut (impl TdsWrite + ?Sized), bytes: &[u8]) -> Result<(), ProtocolError> {
    let len = u32::try_from(bytes.len()).map_err(|_| TypeError::OutOfRange { target_type: "longchar" })?;
    dst.write_u32_le(len)?;
    dst.write_bytes(bytes)
}

/// Number of significant digits in a decimal, at least its scale and 1.
fn decimal_precision(d: &Decimal) -> u8 {
    let mut digits = 0u32;
    let mut magnitude = d.mantissa().unsigned_abs();
    while magnitude > 0 {
        magnitude /= 10;
        digits += 1;
    }
    digits.max(d.scale()).clamp(1, u32::from(MAX_PRECISION)) as u8
}

fn read_decimal(
    src: &mut (impl TdsRead + ?Sized),
    type_id: TypeId,
    scale: u8,
) -> Result<SqlValue, ProtocolError> {
    let len = usize::from(src.read_u8()?);
    if len == 0 {
        return Ok(SqlValue::Null);
    }

    let negative = src.read_u8()? != 0;
    let magnitude_len = len - 1;
    if magnitude_len > 16 {
        return Err(invalid_length(type_id, len));
    }

    let mut buf = [0u8; 16];
    src.read_exact_into(&mut buf[16 - magnitude_len..])?;
    let out_of_range = || TypeError::OutOfRange { target_type: "Decimal" };

    let magnitude = i128::try_from(u128::from_be_bytes(buf)).map_err(|_| out_of_range())?;
    let mantissa = if negative { -magnitude } else { magnitude };
    let value = Decimal::try_from_i128_with_scale(mantissa, u32::from(scale))
        .map_err(|_| out_of_range())?;
    Ok(SqlValue::Decimal(value))
}

fn read_money4(src: &mut (impl TdsRead + ?Sized)) -> Result<SqlValue, ProtocolError> {
    let raw = src.read_i32_le()?;
    Ok(SqlValue::Money(Decimal::new(i64::from(raw), 4)))
}

fn read_money8(src: &mut (impl TdsRead + ?Sized)) -> Result<SqlValue, ProtocolError> {
    let hi = src.read_i32_le()?;
    let lo = src.read_u32_le()?;
    let raw = (i64::from(hi) << 32) | i64::from(lo);
    Ok(SqlValue::Money(Decimal::new(raw, 4)))
}

fn read_datetime8(src: &mut (impl TdsRead + ?Sized)) -> Result<SqlValue, ProtocolError> {
    let days = src.read_i32_le()?;
    let ticks = src.read_i32_le()?;
    Ok(SqlValue::DateTime(datetime_from_wire(days, ticks)?))
}

fn read_datetime4(src: &mut (impl TdsRead + ?Sized)) -> Result<SqlValue, ProtocolError> {
    // Unsigned: the short range runs to 2079-06-06, past i16::MAX days.
    let days = src.read_u16_le()?;
    let minutes = src.read_u16_le()?;
    let value = epoch()?
        .checked_add_signed(TimeDelta::days(i64::from(days)) + TimeDelta::minutes(i64::from(minutes)))
        .ok_or_else(|| TypeError::InvalidDateTime(format!("days={days} minutes={minutes}")))?;
    Ok(SqlValue::DateTime(value))
}

fn epoch() -> Result<NaiveDateTime, TypeError> {
    NaiveDate::from_ymd_opt(1900, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or_else(|| TypeError::InvalidDateTime("1900-01-01".into()))
}

/// Convert days since 1900-01-01 and 1/300-second ticks to a timestamp.
pub fn datetime_from_wire(days: i32, ticks: i32) -> Result<NaiveDateTime, TypeError> {
    let nanos = (i64::from(ticks) * NANOS_PER_SECOND as i64 + 150) / TICKS_PER_SECOND as i64;
    epoch()?
        .checked_add_signed(TimeDelta::days(i64::from(days)) + TimeDelta::nanoseconds(nanos))
        .ok_or_else(|| TypeError::InvalidDateTime(format!("days={days} ticks={ticks}")))
}

/// Convert a timestamp to days since 1900-01-01 and 1/300-second ticks.
///
/// Ticks are rounded to the nearest 1/300 second; rounding up past midnight
/// carries into the next day.
pub fn datetime_to_wire(value: &NaiveDateTime) -> Result<(i32, i32), TypeError> {
    let mut days = (value.date() - epoch()?.date()).num_days();
    let time = value.time();
    let nanos = u64::from(time.nanosecond().min(NANOS_PER_SECOND as u32 - 1));
    let mut ticks = u64::from(time.num_seconds_from_midnight()) * TICKS_PER_SECOND
        + (nanos * TICKS_PER_SECOND + NANOS_PER_SECOND / 2) / NANOS_PER_SECOND;
    if ticks >= TICKS_PER_DAY {
        days += 1;
        ticks -= TICKS_PER_DAY;
    }

    let days = i32::try_from(days).map_err(|_| TypeError::OutOfRange { target_type: "datetime" })?;
    Ok((days, ticks as i32))
}
