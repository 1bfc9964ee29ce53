//! # tds5-types
//!
//! In-memory SQL values for the TDS 5.0 client and their conversions to and
//! from Rust types.
//!
//! Wire encoding lives in `tds5-protocol`; this crate only knows about
//! values.
//!
//! ## Type Mappings
//!
//! | Server Type | Rust Type |
//! |-------------|-----------|
//! | `BIT` | `bool` |
//! | `TINYINT` | `u8` |
//! | `SMALLINT` | `i16` |
//! | `INT` | `i32` |
//! | `BIGINT` | `i64` |
//! | `UNSIGNED SMALLINT`/`INT`/`BIGINT` | `u16`/`u32`/`u64` |
//! | `REAL` | `f32` |
//! | `FLOAT` | `f64` |
//! | `DECIMAL`/`NUMERIC`/`MONEY` | `rust_decimal::Decimal` |
//! | `DATETIME`/`SMALLDATETIME` | `chrono::NaiveDateTime` |
//! | `CHAR`/`VARCHAR`/`TEXT` | `String` |
//! | `BINARY`/`VARBINARY`/`IMAGE` | `Vec<u8>` / `bytes::Bytes` |

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod error;
pub mod from_sql;
pub mod to_sql;
pub mod value;

pub use error::TypeError;
pub use from_sql::FromSql;
pub use to_sql::ToSql;
pub use value::SqlValue;
