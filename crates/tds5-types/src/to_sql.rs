//! Trait for converting Rust types to SQL values.

use bytes::Bytes;
use chrono::NaiveDateTime;
use rust_decimal::Decimal;

use crate::error::TypeError;
use crate::value::SqlValue;

/// Trait for types that can be converted to SQL values.
///
/// This trait is implemented for common Rust types to enable
/// type-safe parameter binding.
pub trait ToSql {
    /// Convert this value to a SQL value.
    fn to_sql(&self) -> Result<SqlValue, TypeError>;

    /// Get the SQL type name for this value.
    fn sql_type(&self) -> &'static str;
}

macro_rules! to_sql_copy {
    ($($ty:ty => $variant:ident, $name:literal);* $(;)?) => {
        $(
            impl ToSql for $ty {
                fn to_sql(&self) -> Result<SqlValue, TypeError> {
                    Ok(SqlValue::$variant(*self))
                }

                fn sql_type(&self) -> &'static str {
                    $name
                }
            }
        )*
    };
}

to_sql_copy! {
    bool => Bool, "BIT";
    u8 => TinyInt, "TINYINT";
    i16 => SmallInt, "SMALLINT";
    i32 => Int, "INT";
    i64 => BigInt, "BIGINT";
    u16 => USmallInt, "UNSIGNED SMALLINT";
    u32 => UInt, "UNSIGNED INT";
    u64 => UBigInt, "UNSIGNED BIGINT";
    f32 => Float, "REAL";
    f64 => Double, "FLOAT";
    Decimal => Decimal, "DECIMAL";
    NaiveDateTime => DateTime, "DATETIME";
}

impl ToSql for str {
    fn to_sql(&self) -> Result<SqlValue, TypeError> {
        Ok(SqlValue::String(self.to_owned()))
    }

    fn sql_type(&self) -> &'static str {
        "VARCHAR"
    }
}

impl ToSql for String {
    fn to_sql(&self) -> Result<SqlValue, TypeError> {
        Ok(SqlValue::String(self.clone()))
    }

    fn sql_type(&self) -> &'static str {
        "VARCHAR"
    }
}

impl ToSql for [u8] {
    fn to_sql(&self) -> Result<SqlValue, TypeError> {
        Ok(SqlValue::Binary(Bytes::copy_from_slice(self)))
    }

    fn sql_type(&self) -> &'static str {
        "VARBINARY"
    }
}

impl ToSql for Vec<u8> {
    fn to_sql(&self) -> Result<SqlValue, TypeError> {
        Ok(SqlValue::Binary(Bytes::copy_from_slice(self)))
    }

    fn sql_type(&self) -> &'static str {
        "VARBINARY"
    }
}

impl ToSql for Bytes {
    fn to_sql(&self) -> Result<SqlValue, TypeError> {
        Ok(SqlValue::Binary(self.clone()))
    }

    fn sql_type(&self) -> &'static str {
        "VARBINARY"
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> Result<SqlValue, TypeError> {
        Ok(self.clone())
    }

    fn sql_type(&self) -> &'static str {
        self.type_name()
    }
}

impl<T: ToSql> ToSql for Option<T> {
    fn to_sql(&self) -> Result<SqlValue, TypeError> {
        match self {
            Some(v) => v.to_sql(),
            None => Ok(SqlValue::Null),
        }
    }

    fn sql_type(&self) -> &'static str {
        match self {
            Some(v) => v.sql_type(),
            None => "NULL",
        }
    }
}

impl<T: ToSql + ?Sized> ToSql for &T {
    fn to_sql(&self) -> Result<SqlValue, TypeError> {
        (*self).to_sql()
    }

    fn sql_type(&self) -> &'static str {
        (*self).sql_type()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_to_sql() {
        assert_eq!(42i32.to_sql().unwrap(), SqlValue::Int(42));
        assert_eq!(7u16.to_sql().unwrap(), SqlValue::USmallInt(7));
        assert_eq!(true.sql_type(), "BIT");
    }

    #[test]
    fn test_option_to_sql() {
        let v: Option<i64> = None;
        assert_eq!(v.to_sql().unwrap(), SqlValue::Null);
        assert_eq!(v.sql_type(), "NULL");
        assert_eq!(Some("abc").to_sql().unwrap(), SqlValue::String("abc".into()));
    }

    #[test]
    fn test_bytes_to_sql() {
        let b: &[u8] = &[1, 2, 3];
        assert_eq!(b.to_sql().unwrap(), SqlValue::Binary(Bytes::from_static(&[1, 2, 3])));
    }
}
