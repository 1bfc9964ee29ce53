//! Trait for converting from SQL values to Rust types.

use bytes::Bytes;
use chrono::NaiveDateTime;
use rust_decimal::Decimal;

use crate::error::TypeError;
use crate::value::SqlValue;

/// Trait for types that can be converted from SQL values.
///
/// Integer targets accept any narrower integer column and reject values
/// that do not fit, so an `UNSIGNED INT` column can be read as `i64` but
/// not as `i16`.
pub trait FromSql: Sized {
    /// Convert from a SQL value to this type.
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError>;

    /// Convert from an optional SQL value.
    ///
    /// Returns `None` if the value is NULL.
    fn from_sql_nullable(value: &SqlValue) -> Result<Option<Self>, TypeError> {
        if value.is_null() {
            Ok(None)
        } else {
            Self::from_sql(value).map(Some)
        }
    }
}

fn mismatch(expected: &'static str, value: &SqlValue) -> TypeError {
    match value {
        SqlValue::Null => TypeError::UnexpectedNull,
        _ => TypeError::TypeMismatch {
            expected,
            actual: value.type_name().to_string(),
        },
    }
}

/// Widen any integer variant to `i128` so range checks happen in one place.
fn integer_of(value: &SqlValue) -> Option<i128> {
    match value {
        SqlValue::TinyInt(v) => Some(i128::from(*v)),
        SqlValue::SmallInt(v) => Some(i128::from(*v)),
        SqlValue::Int(v) => Some(i128::from(*v)),
        SqlValue::BigInt(v) => Some(i128::from(*v)),
        SqlValue::USmallInt(v) => Some(i128::from(*v)),
        SqlValue::UInt(v) => Some(i128::from(*v)),
        SqlValue::UBigInt(v) => Some(i128::from(*v)),
        _ => None,
    }
}

macro_rules! from_sql_integer {
    ($($ty:ty => $name:literal),* $(,)?) => {
        $(
            impl FromSql for $ty {
                fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
                    let wide = integer_of(value).ok_or_else(|| mismatch($name, value))?;
                    <$ty>::try_from(wide).map_err(|_| TypeError::OutOfRange { target_type: $name })
                }
            }
        )*
    };
}

from_sql_integer! {
    u8 => "u8",
    i16 => "i16",
    u16 => "u16",
    i32 => "i32",
    u32 => "u32",
    i64 => "i64",
    u64 => "u64",
}

impl FromSql for bool {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Bool(v) => Ok(*v),
            other => integer_of(other)
                .map(|v| v != 0)
                .ok_or_else(|| mismatch("bool", other)),
        }
    }
}

impl FromSql for f32 {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Float(v) => Ok(*v),
            _ => Err(mismatch("f32", value)),
        }
    }
}

impl FromSql for f64 {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Double(v) => Ok(*v),
            SqlValue::Float(v) => Ok(f64::from(*v)),
            _ => Err(mismatch("f64", value)),
        }
    }
}

impl FromSql for Decimal {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Decimal(v) | SqlValue::Money(v) => Ok(*v),
            SqlValue::String(s) => s
                .trim()
                .parse()
                .map_err(|e| TypeError::InvalidDecimal(format!("{e}"))),
            other => integer_of(other)
                .and_then(|v| i64::try_from(v).ok().map(Decimal::from))
                .ok_or_else(|| mismatch("Decimal", other)),
        }
    }
}

impl FromSql for NaiveDateTime {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::DateTime(v) => Ok(*v),
            _ => Err(mismatch("NaiveDateTime", value)),
        }
    }
}

impl FromSql for String {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::String(v) => Ok(v.clone()),
            _ => Err(mismatch("String", value)),
        }
    }
}

impl FromSql for Vec<u8> {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Binary(v) => Ok(v.to_vec()),
            _ => Err(mismatch("Vec<u8>", value)),
        }
    }
}

impl FromSql for Bytes {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Binary(v) => Ok(v.clone()),
            _ => Err(mismatch("Bytes", value)),
        }
    }
}

impl<T: FromSql> FromSql for Option<T> {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        T::from_sql_nullable(value)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_range_checks() {
        assert_eq!(i64::from_sql(&SqlValue::UInt(u32::MAX)).unwrap(), i64::from(u32::MAX));
        assert!(matches!(
            i16::from_sql(&SqlValue::Int(70_000)),
            Err(TypeError::OutOfRange { target_type: "i16" })
        ));
        assert!(matches!(
            u8::from_sql(&SqlValue::SmallInt(-1)),
            Err(TypeError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_null_handling() {
        assert!(matches!(i32::from_sql(&SqlValue::Null), Err(TypeError::UnexpectedNull)));
        assert_eq!(Option::<i32>::from_sql(&SqlValue::Null).unwrap(), None);
        assert_eq!(Option::<i32>::from_sql(&SqlValue::Int(7)).unwrap(), Some(7));
    }

    #[test]
    fn test_type_mismatch() {
        let err = String::from_sql(&SqlValue::Int(1)).unwrap_err();
        assert!(matches!(err, TypeError::TypeMismatch { expected: "String", .. }));
    }

    #[test]
    fn test_money_as_decimal() {
        let d = Decimal::from_sql(&SqlValue::Money(Decimal::new(-15000, 4))).unwrap();
        assert_eq!(d, Decimal::new(-15, 1));
    }

    #[test]
    fn test_bool_from_integer() {
        assert!(bool::from_sql(&SqlValue::TinyInt(1)).unwrap());
        assert!(!bool::from_sql(&SqlValue::Int(0)).unwrap());
    }
}
