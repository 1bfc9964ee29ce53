//! Language (ad-hoc SQL) request encoding.
//!
//! A language request is a LANGUAGE token carrying the SQL text. When
//! parameters are bound, a PARAMFMT token describing them and a PARAMS
//! token carrying their values follow.
//!
//! ## Wire Format
//!
//! ```text
//! LANGUAGE: 0x21 | length:u32 | status:u8 | sql
//! PARAMFMT: 0xEC | length:u16 | count:u16 | entries...
//! PARAMS:   0xD7 | values...
//! ```

use bitflags::bitflags;
use bytes::{Bytes, BytesMut};
use encoding_rs::Encoding;
use tds5_types::{SqlValue, ToSql, TypeError};

use crate::codec::{TdsWrite, encode_text};
use crate::datatype::{TypeMetadata, VAR_MAX, param_metadata_len, write_type_metadata, write_value};
use crate::error::ProtocolError;
use crate::token::TokenType;
use crate::types::TypeId;

bitflags! {
    /// Parameter status flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ParamStatus: u8 {
        /// Output parameter.
        const OUTPUT = 0x01;
        /// Parameter accepts nulls.
        const NULLABLE = 0x20;
    }
}

/// A bound request parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    /// Parameter name including the `@` prefix, if named.
    pub name: Option<String>,
    /// Status flags.
    pub status: ParamStatus,
    /// Value to send.
    pub value: SqlValue,
    type_override: Option<TypeId>,
}

impl Parameter {
    /// Create a named parameter. A missing `@` prefix is added.
    pub fn new(name: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        let name = name.into();
        let name = if name.is_empty() || name.starts_with('@') {
            name
        } else {
            format!("@{name}")
        };
        Self {
            name: (!name.is_empty()).then_some(name),
            status: ParamStatus::empty(),
            value: value.into(),
            type_override: None,
        }
    }

    /// Create an unnamed (positional) parameter.
    pub fn unnamed(value: impl Into<SqlValue>) -> Self {
        Self::new("", value)
    }

    /// Create a named parameter from any [`ToSql`] value.
    pub fn from_sql<T: ToSql + ?Sized>(name: impl Into<String>, value: &T) -> Result<Self, TypeError> {
        Ok(Self::new(name, value.to_sql()?))
    }

    /// Force the wire type instead of inferring it from the value.
    #[must_use]
    pub fn with_type(mut self, type_id: TypeId) -> Self {
        self.type_override = Some(type_id);
        self
    }

    /// Mark as an output parameter.
    #[must_use]
    pub fn as_output(mut self) -> Self {
        self.status |= ParamStatus::OUTPUT;
        self
    }

    /// Mark as accepting nulls.
    #[must_use]
    pub fn as_nullable(mut self) -> Self {
        self.status |= ParamStatus::NULLABLE;
        self
    }

    /// Whether this is an output parameter.
    #[must_use]
    pub fn is_output(&self) -> bool {
        self.status.contains(ParamStatus::OUTPUT)
    }

    /// Wire type for this parameter under `encoding`.
    ///
    /// Strings and binaries longer than 255 bytes switch to the long forms.
    #[must_use]
    pub fn type_id(&self, encoding: &'static Encoding) -> TypeId {
        if let Some(type_id) = self.type_override {
            return type_id;
        }
        match &self.value {
            SqlValue::Null => TypeId::VarChar,
            SqlValue::Bool(_) => TypeId::Bit,
            SqlValue::TinyInt(_) | SqlValue::SmallInt(_) | SqlValue::Int(_) | SqlValue::BigInt(_) => {
                TypeId::IntN
            }
            SqlValue::USmallInt(_) | SqlValue::UInt(_) | SqlValue::UBigInt(_) => TypeId::UIntN,
            SqlValue::Float(_) | SqlValue::Double(_) => TypeId::FltN,
            SqlValue::Decimal(_) => TypeId::DecN,
            SqlValue::Money(_) => TypeId::MoneyN,
            SqlValue::DateTime(_) => TypeId::DateTimeN,
            SqlValue::String(s) if encode_text(encoding, s).len() > VAR_MAX => TypeId::LongChar,
            SqlValue::String(_) => TypeId::VarChar,
            SqlValue::Binary(b) if b.len() > VAR_MAX => TypeId::LongBinary,
            SqlValue::Binary(_) => TypeId::VarBinary,
        }
    }

    fn encoded_name(&self, encoding: &'static Encoding) -> Vec<u8> {
        let name = encode_text(encoding, self.name.as_deref().unwrap_or(""));
        name[..name.len().min(usize::from(u8::MAX))].to_vec()
    }
}

/// Exact byte count of the format entry written for `param`: name length,
/// status, user type, wire type and locale bytes, plus the name and the
/// type metadata.
pub fn param_format_len(param: &Parameter, encoding: &'static Encoding) -> Result<usize, TypeError> {
    let metadata = param_metadata_len(param.type_id(encoding))?;
    Ok(8 + param.encoded_name(encoding).len() + metadata)
}

/// Write the format entry describing `param`.
pub fn write_param_format(
    dst: &mut (impl TdsWrite + ?Sized),
    param: &Parameter,
    encoding: &'static Encoding,
) -> Result<(), ProtocolError> {
    let type_id = param.type_id(encoding);
    let metadata = TypeMetadata::for_param(type_id, &param.value)?;
    let name = param.encoded_name(encoding);

    dst.write_u8(name.len() as u8)?;
    dst.write_bytes(&name)?;
    dst.write_u8(param.status.bits())?;
    dst.write_i32_le(0)?;
    dst.write_u8(type_id as u8)?;
    write_type_metadata(dst, type_id, &metadata, encoding)
}

/// An ad-hoc SQL request with optional parameters.
#[derive(Debug, Clone, Default)]
pub struct LanguageRequest {
    sql: String,
    params: Vec<Parameter>,
}

impl LanguageRequest {
    /// Create a request for `sql`.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Bind a parameter.
    #[must_use]
    pub fn param(mut self, param: Parameter) -> Self {
        self.params.push(param);
        self
    }

    /// Bind several parameters.
    #[must_use]
    pub fn params(mut self, params: impl IntoIterator<Item = Parameter>) -> Self {
        self.params.extend(params);
        self
    }

    /// The SQL text.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Bound parameters.
    #[must_use]
    pub fn parameters(&self) -> &[Parameter] {
        &self.params
    }

    /// Write the request tokens to `dst`.
    ///
    /// The request is built in full before anything reaches `dst`, so a
    /// parameter that cannot be encoded leaves `dst` untouched.
    pub fn write(&self, dst: &mut (impl TdsWrite + ?Sized), encoding: &'static Encoding) -> Result<(), ProtocolError> {
        let bytes = self.encode(encoding)?;
        dst.write_bytes(&bytes)
    }

    /// Encode the request to bytes.
    pub fn encode(&self, encoding: &'static Encoding) -> Result<Bytes, ProtocolError> {
        let format_len = self
            .params
            .iter()
            .map(|p| param_format_len(p, encoding))
            .sum::<Result<usize, _>>()?;
        for param in &self.params {
            TypeMetadata::for_param(param.type_id(encoding), &param.value)?;
        }

        let sql = encode_text(encoding, &self.sql);
        let sql_len = u32::try_from(sql.len() + 1).map_err(|_| ProtocolError::TokenTooLarge {
            token_type: TokenType::Language,
            length: sql.len() + 1,
        })?;
        let mut buf = BytesMut::with_capacity(sql.len() + 16);
        buf.write_u8(TokenType::Language as u8)?;
        buf.write_u32_le(sql_len)?;
        buf.write_u8(u8::from(!self.params.is_empty()))?;
        buf.write_bytes(&sql)?;

        if self.params.is_empty() {
            return Ok(buf.freeze());
        }

        let too_large = |length| ProtocolError::TokenTooLarge {
            token_type: TokenType::ParamFmt,
            length,
        };
        let fmt_len = u16::try_from(2 + format_len).map_err(|_| too_large(2 + format_len))?;
        let count = u16::try_from(self.params.len()).map_err(|_| too_large(self.params.len()))?;
        buf.write_u8(TokenType::ParamFmt as u8)?;
        buf.write_u16_le(fmt_len)?;
        buf.write_u16_le(count)?;
        for param in &self.params {
            write_param_format(&mut buf, param, encoding)?;
        }

        buf.write_u8(TokenType::Params as u8)?;
        for param in &self.params {
            write_value(&mut buf, param.type_id(encoding), &param.value, encoding)?;
        }
        Ok(buf.freeze())
    }
}
