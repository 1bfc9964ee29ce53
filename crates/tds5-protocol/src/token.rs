//! TDS token stream definitions.
//!
//! Tokens are the fundamental units of TDS response data. The server sends
//! a stream of tokens that describe result formats, rows, diagnostics, and
//! environment changes.
//!
//! ## Token Structure
//!
//! Each token begins with a 1-byte token type identifier. Its length is then
//! either fixed, carried in a 1, 2 or 4 byte prefix, or implied by the most
//! recent format token (rows and parameters).
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tds5_protocol::token::{read_token, Token};
//!
//! let mut format = None;
//! loop {
//!     let token = read_token(&mut reader, encoding, format.as_ref())?;
//!     match &token {
//!         Token::Format(f) => format = Some(f.clone()),
//!         Token::Row(row) => println!("{:?}", row.values()),
//!         _ => {}
//!     }
//!     if token.is_end_of_response() {
//!         break;
//!     }
//! }
//! ```

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use encoding_rs::Encoding;
use tds5_types::{FromSql, SqlValue, TypeError};

use crate::codec::{TdsRead, read_b_varchar, read_us_varchar, write_b_varchar, write_us_varchar};
use crate::datatype::{TypeMetadata, read_type_metadata, read_value, write_type_metadata};
use crate::error::ProtocolError;
use crate::types::{ColumnStatus, TypeId};

/// How the length of a token is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenLength {
    /// 1-byte length prefix.
    OneByteLen,
    /// 2-byte length prefix.
    TwoByteLen,
    /// 4-byte length prefix.
    FourByteLen,
    /// Fixed body size.
    Fixed(usize),
    /// Size implied by the current format.
    Dependent,
}

macro_rules! token_types {
    ($($(#[$doc:meta])* $name:ident = $code:literal => $len:expr,)*) => {
        /// Token type identifier.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum TokenType {
            $($(#[$doc])* $name = $code,)*
        }

        impl TokenType {
            /// Create a token type from a raw byte.
            #[must_use]
            pub fn from_u8(value: u8) -> Option<Self> {
                match value {
                    $($code => Some(Self::$name),)*
                    _ => None,
                }
            }

            /// How the body length of this token is encoded.
            #[must_use]
            pub const fn length(self) -> TokenLength {
                match self {
                    $(Self::$name => $len,)*
                }
            }
        }
    };
}

token_types! {
    /// Message (MSG).
    Msg = 0x65 => TokenLength::OneByteLen,

    /// Capability negotiation (CAPABILITY).
    Capability = 0xE2 => TokenLength::TwoByteLen,
    /// Remote procedure call (DBRPC).
    DbRpc = 0xE6 => TokenLength::TwoByteLen,
    /// Dynamic SQL (DYNAMIC).
    Dynamic = 0xE7 => TokenLength::TwoByteLen,
    /// Extended error (EED).
    Eed = 0xE5 => TokenLength::TwoByteLen,
    /// Environment change (ENVCHANGE).
    EnvChange = 0xE3 => TokenLength::TwoByteLen,
    /// Login acknowledgment (LOGINACK).
    LoginAck = 0xAD => TokenLength::TwoByteLen,
    /// Parameter format (PARAMFMT).
    ParamFmt = 0xEC => TokenLength::TwoByteLen,
    /// Row format (ROWFMT).
    RowFmt = 0xEE => TokenLength::TwoByteLen,
    /// Display formats (CONTROL).
    Control = 0xAE => TokenLength::TwoByteLen,
    /// Order by columns (ORDERBY).
    OrderBy = 0xA9 => TokenLength::TwoByteLen,
    /// Compute format (ALTFMT).
    AltFmt = 0xA8 => TokenLength::TwoByteLen,
    /// Compute names (ALTNAME).
    AltName = 0xA7 => TokenLength::TwoByteLen,
    /// Column info (COLINFO).
    ColInfo = 0xA5 => TokenLength::TwoByteLen,
    /// Cursor close (CURCLOSE).
    CurClose = 0x80 => TokenLength::TwoByteLen,
    /// Cursor delete (CURDELETE).
    CurDelete = 0x81 => TokenLength::TwoByteLen,
    /// Cursor fetch (CURFETCH).
    CurFetch = 0x82 => TokenLength::TwoByteLen,
    /// Cursor info (CURINFO).
    CurInfo = 0x83 => TokenLength::TwoByteLen,
    /// Cursor open (CUROPEN).
    CurOpen = 0x84 => TokenLength::TwoByteLen,
    /// Cursor update (CURUPDATE).
    CurUpdate = 0x85 => TokenLength::TwoByteLen,
    /// Cursor declare (CURDECLARE).
    CurDeclare = 0x86 => TokenLength::TwoByteLen,
    /// Error message (ERROR).
    Error = 0xAA => TokenLength::TwoByteLen,
    /// Informational message (INFO).
    Info = 0xAB => TokenLength::TwoByteLen,
    /// Event notification (EVENTNOTICE).
    EventNotice = 0xA2 => TokenLength::TwoByteLen,
    /// Option command (OPTIONCMD).
    OptionCmd = 0xA6 => TokenLength::TwoByteLen,
    /// Return value (RETURNVALUE).
    ReturnValue = 0xAC => TokenLength::TwoByteLen,
    /// Remote procedure call (RPC).
    Rpc = 0xE0 => TokenLength::TwoByteLen,
    /// Table names (TABNAME).
    TabName = 0xA4 => TokenLength::TwoByteLen,

    /// Cursor declare (CURDECLARE2).
    CurDeclare2 = 0x23 => TokenLength::FourByteLen,
    /// Dynamic SQL (DYNAMIC2).
    Dynamic2 = 0xA3 => TokenLength::FourByteLen,
    /// Language command (LANGUAGE).
    Language = 0x21 => TokenLength::FourByteLen,
    /// Order by columns (ORDERBY2).
    OrderBy2 = 0x22 => TokenLength::FourByteLen,
    /// Parameter format with wide status (PARAMFMT2).
    ParamFmt2 = 0x20 => TokenLength::FourByteLen,
    /// Row format with qualifiers (ROWFMT2).
    RowFmt2 = 0x61 => TokenLength::FourByteLen,

    /// Logout (LOGOUT).
    Logout = 0x71 => TokenLength::Fixed(1),
    /// Return status (RETURNSTATUS).
    ReturnStatus = 0x79 => TokenLength::Fixed(4),
    /// Offset (OFFSET).
    Offset = 0x78 => TokenLength::Fixed(4),
    /// Done (DONE).
    Done = 0xFD => TokenLength::Fixed(8),
    /// Done in procedure (DONEINPROC).
    DoneInProc = 0xFF => TokenLength::Fixed(8),
    /// Done procedure (DONEPROC).
    DoneProc = 0xFE => TokenLength::Fixed(8),

    /// Key columns (KEY).
    Key = 0xCA => TokenLength::Dependent,
    /// Parameter values (PARAMS).
    Params = 0xD7 => TokenLength::Dependent,
    /// Row data (ROW).
    Row = 0xD1 => TokenLength::Dependent,
    /// Compute row (ALTROW).
    AltRow = 0xD3 => TokenLength::Dependent,
}

/// Parsed TDS token.
#[derive(Debug, Clone)]
pub enum Token {
    /// Row or parameter format; becomes the decoding context.
    Format(Arc<Format>),
    /// Row or parameter values.
    Row(DataRow),
    /// Environment change notification.
    EnvChange(EnvChange),
    /// Diagnostic message from the server.
    Message(ServerMessage),
    /// Login acknowledgment.
    LoginAck(LoginAck),
    /// Completion of a statement, procedure, or statement in a procedure.
    Done(Done),
    /// Return status from a stored procedure.
    ReturnStatus(i32),
    /// Capability negotiation, kept opaque.
    Capability(Capability),
    /// Display formats.
    Control(Control),
    /// A token without a builder, skipped over.
    Unknown {
        /// Tag of the skipped token.
        token_type: TokenType,
        /// Bytes consumed after the tag, length prefix included.
        size: usize,
    },
}

impl Token {
    /// Whether this token terminates the current response.
    ///
    /// Only a done-family token with the "more" bit clear ends a response.
    #[must_use]
    pub fn is_end_of_response(&self) -> bool {
        matches!(self, Self::Done(done) if !done.has_more())
    }

    /// Tag of this token.
    #[must_use]
    pub fn token_type(&self) -> TokenType {
        match self {
            Self::Format(format) => format.token_type,
            Self::Row(row) => row.token_type,
            Self::EnvChange(_) => TokenType::EnvChange,
            Self::Message(_) => TokenType::Eed,
            Self::LoginAck(_) => TokenType::LoginAck,
            Self::Done(done) => done.kind.token_type(),
            Self::ReturnStatus(_) => TokenType::ReturnStatus,
            Self::Capability(_) => TokenType::Capability,
            Self::Control(_) => TokenType::Control,
            Self::Unknown { token_type, .. } => *token_type,
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Format(format) => write!(f, "{:?}({})", format.token_type, format.len()),
            Self::Row(row) => write!(f, "{:?}({})", row.token_type, row.len()),
            Self::EnvChange(env) => {
                write!(f, "EnvChange[")?;
                for (i, change) in env.changes.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(
                        f,
                        "{:?}: {:?} -> {:?}",
                        change.kind,
                        change.old_value.as_deref().unwrap_or(""),
                        change.new_value.as_deref().unwrap_or("")
                    )?;
                }
                write!(f, "]")
            }
            Self::Message(msg) => write!(f, "{msg}"),
            Self::LoginAck(ack) => write!(
                f,
                "LoginAck({:?}, {} {})",
                ack.status,
                ack.program_name,
                ack.program_version_string()
            ),
            Self::Done(done) => match done.row_count {
                Some(count) => write!(f, "{:?}({:?}, {count} rows)", done.kind, done.status),
                None => write!(f, "{:?}({:?})", done.kind, done.status),
            },
            Self::ReturnStatus(status) => write!(f, "ReturnStatus({status})"),
            Self::Capability(_) => write!(f, "Capability"),
            Self::Control(control) => write!(f, "Control({})", control.formats.len()),
            Self::Unknown { token_type, size } => write!(f, "Unknown({token_type:?}, {size} bytes)"),
        }
    }
}

// =============================================================================
// Format
// =============================================================================

/// What a format describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatKind {
    /// Result set columns.
    Row,
    /// Procedure or request parameters.
    Param,
}

/// One column or parameter description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatEntry {
    /// Column or parameter name; empty when the server sent none.
    pub name: String,
    /// Catalog qualifier (ROWFMT2 only).
    pub catalog: Option<String>,
    /// Schema qualifier (ROWFMT2 only).
    pub schema: Option<String>,
    /// Table qualifier (ROWFMT2 only).
    pub table: Option<String>,
    /// Underlying column name (ROWFMT2 only).
    pub column: Option<String>,
    /// Raw status bits.
    pub status: u32,
    /// Server user type code.
    pub user_type: i32,
    /// Wire type.
    pub type_id: TypeId,
    /// Type-specific metadata.
    pub metadata: TypeMetadata,
}

impl FormatEntry {
    /// Create an entry with no qualifiers and zero status.
    #[must_use]
    pub fn new(name: impl Into<String>, type_id: TypeId, metadata: TypeMetadata) -> Self {
        Self {
            name: name.into(),
            catalog: None,
            schema: None,
            table: None,
            column: None,
            status: 0,
            user_type: 0,
            type_id,
            metadata,
        }
    }

    /// Set the status bits.
    #[must_use]
    pub fn with_status(mut self, status: u32) -> Self {
        self.status = status;
        self
    }

    /// Status bits interpreted as row column flags.
    #[must_use]
    pub fn column_status(&self) -> ColumnStatus {
        ColumnStatus::from_bits_retain(self.status)
    }

    /// Whether the column or parameter allows nulls.
    #[must_use]
    pub fn is_nullable(&self) -> bool {
        self.column_status().contains(ColumnStatus::NULLABLE)
    }
}

/// Decoded format token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    /// Tag the format arrived with.
    pub token_type: TokenType,
    /// Entries in wire order.
    pub entries: Vec<FormatEntry>,
}

impl Format {
    /// Create a format from entries.
    #[must_use]
    pub fn new(token_type: TokenType, entries: Vec<FormatEntry>) -> Self {
        Self { token_type, entries }
    }

    /// Whether this is a row or a parameter format.
    #[must_use]
    pub fn kind(&self) -> FormatKind {
        match self.token_type {
            TokenType::ParamFmt | TokenType::ParamFmt2 => FormatKind::Param,
            _ => FormatKind::Row,
        }
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the format has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find an entry index by name (case-insensitive).
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.name.eq_ignore_ascii_case(name))
    }

    fn is_wide(token_type: TokenType) -> bool {
        matches!(token_type, TokenType::RowFmt2 | TokenType::ParamFmt2)
    }

    /// Decode a format body (after the length prefix).
    pub fn decode(
        src: &mut (impl TdsRead + ?Sized),
        token_type: TokenType,
        encoding: &'static Encoding,
    ) -> Result<Self, ProtocolError> {
        let count = src.read_u16_le()?;
        let wide = Self::is_wide(token_type);
        let mut entries = Vec::with_capacity(usize::from(count));

        for _ in 0..count {
            let name = read_b_varchar(src, encoding)?.unwrap_or_default();

            let (catalog, schema, table, column) = if token_type == TokenType::RowFmt2 {
                (
                    read_b_varchar(src, encoding)?,
                    read_b_varchar(src, encoding)?,
                    read_b_varchar(src, encoding)?,
                    read_b_varchar(src, encoding)?,
                )
            } else {
                (None, None, None, None)
            };

            let status = if wide {
                src.read_u32_le()?
            } else {
                u32::from(src.read_u8()?)
            };
            let user_type = src.read_i32_le()?;
            let type_id = TypeId::from_u8(src.read_u8()?)?;
            let metadata = read_type_metadata(src, type_id, encoding)?;

            entries.push(FormatEntry {
                name,
                catalog,
                schema,
                table,
                column,
                status,
                user_type,
                type_id,
                metadata,
            });
        }

        Ok(Self { token_type, entries })
    }

    /// Encode the format token, tag and length prefix included.
    pub fn encode(&self, dst: &mut BytesMut, encoding: &'static Encoding) -> Result<(), ProtocolError> {
        let wide = Self::is_wide(self.token_type);
        let mut body = BytesMut::new();
        let count = u16::try_from(self.entries.len()).map_err(|_| ProtocolError::TokenTooLarge {
            token_type: self.token_type,
            length: self.entries.len(),
        })?;
        body.put_u16_le(count);

        for entry in &self.entries {
            write_b_varchar(&mut body, encoding, &entry.name)?;
            if self.token_type == TokenType::RowFmt2 {
                for qualifier in [&entry.catalog, &entry.schema, &entry.table, &entry.column] {
                    write_b_varchar(&mut body, encoding, qualifier.as_deref().unwrap_or(""))?;
                }
            }
            if wide {
                body.put_u32_le(entry.status);
            } else {
                body.put_u8(entry.status as u8);
            }
            body.put_i32_le(entry.user_type);
            body.put_u8(entry.type_id as u8);
            write_type_metadata(&mut body, entry.type_id, &entry.metadata, encoding)?;
        }

        put_with_length(dst, self.token_type, &body)
    }
}

// =============================================================================
// Data rows
// =============================================================================

/// One row (or set of parameter values), decoded against its format.
#[derive(Debug, Clone, PartialEq)]
pub struct DataRow {
    /// Tag the row arrived with (ROW or PARAMS).
    pub token_type: TokenType,
    format: Arc<Format>,
    values: Vec<SqlValue>,
}

impl DataRow {
    /// Create a row from values already decoded against `format`.
    #[must_use]
    pub fn new(token_type: TokenType, format: Arc<Format>, values: Vec<SqlValue>) -> Self {
        Self {
            token_type,
            format,
            values,
        }
    }

    /// Decode one value per format entry.
    pub fn decode(
        src: &mut (impl TdsRead + ?Sized),
        token_type: TokenType,
        format: &Arc<Format>,
        encoding: &'static Encoding,
    ) -> Result<Self, ProtocolError> {
        let values = format
            .entries
            .iter()
            .map(|entry| read_value(src, entry.type_id, &entry.metadata, encoding))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self::new(token_type, Arc::clone(format), values))
    }

    /// The format these values were decoded against.
    #[must_use]
    pub fn format(&self) -> &Arc<Format> {
        &self.format
    }

    /// All values in order.
    #[must_use]
    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    /// Consume the row, returning its values.
    #[must_use]
    pub fn into_values(self) -> Vec<SqlValue> {
        self.values
    }

    /// Number of values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if the row has no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Whether these are procedure or request parameter values.
    #[must_use]
    pub fn is_params(&self) -> bool {
        self.token_type == TokenType::Params
    }

    /// Raw value at `index`.
    #[must_use]
    pub fn value(&self, index: usize) -> Option<&SqlValue> {
        self.values.get(index)
    }

    /// Get a value by column index.
    pub fn get<T: FromSql>(&self, index: usize) -> Result<T, TypeError> {
        self.values
            .get(index)
            .ok_or_else(|| TypeError::TypeMismatch {
                expected: "valid column index",
                actual: format!("index {index} out of bounds"),
            })
            .and_then(T::from_sql)
    }

    /// Get a value by column name (case-insensitive).
    pub fn get_by_name<T: FromSql>(&self, name: &str) -> Result<T, TypeError> {
        let index = self
            .format
            .column_index(name)
            .ok_or_else(|| TypeError::TypeMismatch {
                expected: "valid column name",
                actual: format!("column '{name}' not found"),
            })?;
        self.get(index)
    }

    /// Check if the value at `index` is null. Missing columns count as null.
    #[must_use]
    pub fn is_null(&self, index: usize) -> bool {
        self.values.get(index).is_none_or(SqlValue::is_null)
    }
}

// =============================================================================
// Environment changes
// =============================================================================

/// Kind of environment change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvChangeType {
    /// Current database.
    Database,
    /// Session language.
    Language,
    /// Session character set.
    Charset,
    /// Network packet size.
    PacketSize,
    /// Any other kind.
    Other(u8),
}

impl EnvChangeType {
    /// Create from the wire code.
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Database,
            2 => Self::Language,
            3 => Self::Charset,
            4 => Self::PacketSize,
            other => Self::Other(other),
        }
    }

    /// Wire code.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Database => 1,
            Self::Language => 2,
            Self::Charset => 3,
            Self::PacketSize => 4,
            Self::Other(other) => other,
        }
    }
}

/// A single environment change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvChangeEntry {
    /// Kind of change.
    pub kind: EnvChangeType,
    /// New value.
    pub new_value: Option<String>,
    /// Previous value.
    pub old_value: Option<String>,
}

impl EnvChangeEntry {
    /// Create a change entry.
    #[must_use]
    pub fn new(kind: EnvChangeType, new_value: impl Into<String>, old_value: impl Into<String>) -> Self {
        let non_empty = |s: String| if s.is_empty() { None } else { Some(s) };
        Self {
            kind,
            new_value: non_empty(new_value.into()),
            old_value: non_empty(old_value.into()),
        }
    }
}

/// Environment change token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvChange {
    /// Changes in wire order.
    pub changes: Vec<EnvChangeEntry>,
}

impl EnvChange {
    /// Decode an environment change body; reads until `src` is exhausted.
    pub fn decode(src: &mut &[u8], encoding: &'static Encoding) -> Result<Self, ProtocolError> {
        let mut changes = Vec::new();
        while !src.is_empty() {
            let kind = EnvChangeType::from_u8(src.read_u8()?);
            let new_value = read_b_varchar(src, encoding)?;
            let old_value = read_b_varchar(src, encoding)?;
            changes.push(EnvChangeEntry {
                kind,
                new_value,
                old_value,
            });
        }
        Ok(Self { changes })
    }

    /// Encode the token, tag and length prefix included.
    pub fn encode(&self, dst: &mut BytesMut, encoding: &'static Encoding) -> Result<(), ProtocolError> {
        let mut body = BytesMut::new();
        for change in &self.changes {
            body.put_u8(change.kind.as_u8());
            write_b_varchar(&mut body, encoding, change.new_value.as_deref().unwrap_or(""))?;
            write_b_varchar(&mut body, encoding, change.old_value.as_deref().unwrap_or(""))?;
        }
        put_with_length(dst, TokenType::EnvChange, &body)
    }
}

// =============================================================================
// Messages
// =============================================================================

/// Diagnostic message (EED) from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMessage {
    /// Message number.
    pub number: i32,
    /// Message state.
    pub state: u8,
    /// Severity class.
    pub severity: u8,
    /// SQLSTATE bytes.
    pub sql_state: Bytes,
    /// Extended parameters follow this message.
    pub params_follow: bool,
    /// Transaction state at the time of the message.
    pub transaction_state: u16,
    /// Message text.
    pub message: String,
    /// Server name.
    pub server: Option<String>,
    /// Procedure name.
    pub procedure: Option<String>,
    /// Line number.
    pub line: u16,
}

impl ServerMessage {
    /// Create a message with the given number, severity and text.
    #[must_use]
    pub fn new(number: i32, severity: u8, message: impl Into<String>) -> Self {
        Self {
            number,
            state: 1,
            severity,
            sql_state: Bytes::new(),
            params_follow: false,
            transaction_state: 0,
            message: message.into(),
            server: None,
            procedure: None,
            line: 0,
        }
    }

    /// Set the server name.
    #[must_use]
    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    /// Set the procedure name and line.
    #[must_use]
    pub fn with_procedure(mut self, procedure: impl Into<String>, line: u16) -> Self {
        self.procedure = Some(procedure.into());
        self.line = line;
        self
    }

    /// Severity above 10 is an error; 10 and below is informational.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.severity > 10
    }

    /// Decode a message body (after the length prefix).
    pub fn decode(src: &mut (impl TdsRead + ?Sized), encoding: &'static Encoding) -> Result<Self, ProtocolError> {
        let number = src.read_i32_le()?;
        let state = src.read_u8()?;
        let severity = src.read_u8()?;
        let sql_state_len = usize::from(src.read_u8()?);
        let sql_state = src.read_bytes(sql_state_len)?;
        let params_follow = src.read_u8()? == 1;
        let transaction_state = src.read_u16_le()?;
        let message = read_us_varchar(src, encoding)?.unwrap_or_default();
        let server = read_b_varchar(src, encoding)?;
        let procedure = read_b_varchar(src, encoding)?;
        let line = src.read_u16_le()?;

        Ok(Self {
            number,
            state,
            severity,
            sql_state,
            params_follow,
            transaction_state,
            message,
            server,
            procedure,
            line,
        })
    }

    /// Encode the token, tag and length prefix included.
    pub fn encode(&self, dst: &mut BytesMut, encoding: &'static Encoding) -> Result<(), ProtocolError> {
        let mut body = BytesMut::new();
        body.put_i32_le(self.number);
        body.put_u8(self.state);
        body.put_u8(self.severity);
        let sql_state_len = u8::try_from(self.sql_state.len()).map_err(|_| ProtocolError::TokenTooLarge {
            token_type: TokenType::Eed,
            length: self.sql_state.len(),
        })?;
        body.put_u8(sql_state_len);
        body.put_slice(&self.sql_state);
        body.put_u8(u8::from(self.params_follow));
        body.put_u16_le(self.transaction_state);
        write_us_varchar(&mut body, encoding, &self.message)?;
        write_b_varchar(&mut body, encoding, self.server.as_deref().unwrap_or(""))?;
        write_b_varchar(&mut body, encoding, self.procedure.as_deref().unwrap_or(""))?;
        body.put_u16_le(self.line);
        put_with_length(dst, TokenType::Eed, &body)
    }
}

impl fmt::Display for ServerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_error() { "Error" } else { "Info" };
        write!(f, "{kind} {}/{}: {:?}", self.number, self.state, self.message)?;
        if let Some(server) = &self.server {
            write!(f, " on {server}")?;
        }
        if let Some(procedure) = &self.procedure {
            write!(f, " in {procedure}:{}", self.line)?;
        }
        Ok(())
    }
}

// =============================================================================
// Login acknowledgment
// =============================================================================

/// Outcome reported by a login acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginStatus {
    /// Login accepted.
    Succeed,
    /// Login rejected.
    Fail,
    /// Further negotiation required.
    Negotiate,
    /// Any other status byte.
    Other(u8),
}

impl LoginStatus {
    /// Create from the wire code.
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            5 => Self::Succeed,
            6 => Self::Fail,
            7 => Self::Negotiate,
            other => Self::Other(other),
        }
    }

    /// Wire code.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Succeed => 5,
            Self::Fail => 6,
            Self::Negotiate => 7,
            Self::Other(other) => other,
        }
    }
}

/// Login acknowledgment token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginAck {
    /// Login outcome.
    pub status: LoginStatus,
    /// TDS version spoken by the server.
    pub tds_version: [u8; 4],
    /// Server program name.
    pub program_name: String,
    /// Server program version.
    pub program_version: [u8; 4],
}

impl LoginAck {
    /// Decode a login acknowledgment body (after the length prefix).
    pub fn decode(src: &mut (impl TdsRead + ?Sized), encoding: &'static Encoding) -> Result<Self, ProtocolError> {
        let status = LoginStatus::from_u8(src.read_u8()?);
        let mut tds_version = [0u8; 4];
        src.read_exact_into(&mut tds_version)?;
        let program_name = read_b_varchar(src, encoding)?.unwrap_or_default();
        let mut program_version = [0u8; 4];
        src.read_exact_into(&mut program_version)?;

        Ok(Self {
            status,
            tds_version,
            program_name,
            program_version,
        })
    }

    /// Encode the token, tag and length prefix included.
    pub fn encode(&self, dst: &mut BytesMut, encoding: &'static Encoding) -> Result<(), ProtocolError> {
        let mut body = BytesMut::new();
        body.put_u8(self.status.as_u8());
        body.put_slice(&self.tds_version);
        write_b_varchar(&mut body, encoding, &self.program_name)?;
        body.put_slice(&self.program_version);
        put_with_length(dst, TokenType::LoginAck, &body)
    }

    /// Check if the login succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == LoginStatus::Succeed
    }

    /// TDS version as dotted text.
    #[must_use]
    pub fn tds_version_string(&self) -> String {
        dotted(&self.tds_version)
    }

    /// Program version as dotted text.
    #[must_use]
    pub fn program_version_string(&self) -> String {
        dotted(&self.program_version)
    }
}

fn dotted(v: &[u8; 4]) -> String {
    format!("{}.{}.{}.{}", v[0], v[1], v[2], v[3])
}

// =============================================================================
// Done
// =============================================================================

/// Which done-family token this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneKind {
    /// Completion of a statement (DONE).
    Done,
    /// Completion of a statement inside a procedure (DONEINPROC).
    DoneInProc,
    /// Completion of a procedure (DONEPROC).
    DoneProc,
}

impl DoneKind {
    /// Tag for this kind.
    #[must_use]
    pub const fn token_type(self) -> TokenType {
        match self {
            Self::Done => TokenType::Done,
            Self::DoneInProc => TokenType::DoneInProc,
            Self::DoneProc => TokenType::DoneProc,
        }
    }
}

bitflags! {
    /// Done status flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DoneStatus: u16 {
        /// More results follow.
        const MORE = 0x01;
        /// Statement failed.
        const ERROR = 0x02;
        /// A transaction is in progress.
        const IN_TRANSACTION = 0x04;
        /// Result comes from a stored procedure.
        const PROC = 0x08;
        /// Row count is valid.
        const COUNT = 0x10;
        /// Acknowledges an attention request.
        const ATTENTION_ACK = 0x20;
        /// Event notification follows.
        const EVENT = 0x40;
    }
}

/// Transaction state reported in a done token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Not in a transaction.
    NotInTransaction,
    /// Transaction succeeded.
    Succeeded,
    /// Transaction in progress.
    InProgress,
    /// Statement aborted, transaction continues.
    StatementAborted,
    /// Transaction aborted.
    Aborted,
    /// Any other value.
    Other(u16),
}

impl TransactionState {
    /// Create from the wire code.
    #[must_use]
    pub const fn from_u16(value: u16) -> Self {
        match value {
            0 => Self::NotInTransaction,
            1 => Self::Succeeded,
            2 => Self::InProgress,
            3 => Self::StatementAborted,
            4 => Self::Aborted,
            other => Self::Other(other),
        }
    }

    /// Wire code.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        match self {
            Self::NotInTransaction => 0,
            Self::Succeeded => 1,
            Self::InProgress => 2,
            Self::StatementAborted => 3,
            Self::Aborted => 4,
            Self::Other(other) => other,
        }
    }
}

/// Done token indicating statement or procedure completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Done {
    /// Which done-family token this is.
    pub kind: DoneKind,
    /// Status flags.
    pub status: DoneStatus,
    /// Transaction state.
    pub transaction_state: TransactionState,
    /// Row count, present only when the count bit is set.
    pub row_count: Option<u32>,
}

impl Done {
    /// Size of the done body in bytes (excluding the tag).
    pub const SIZE: usize = 8;

    /// Create a final DONE with no row count.
    #[must_use]
    pub const fn new(kind: DoneKind) -> Self {
        Self {
            kind,
            status: DoneStatus::empty(),
            transaction_state: TransactionState::NotInTransaction,
            row_count: None,
        }
    }

    /// Set a row count; also sets the count bit.
    #[must_use]
    pub const fn with_row_count(mut self, count: u32) -> Self {
        self.status = self.status.union(DoneStatus::COUNT);
        self.row_count = Some(count);
        self
    }

    /// Add status flags.
    #[must_use]
    pub const fn with_status(mut self, status: DoneStatus) -> Self {
        self.status = self.status.union(status);
        self
    }

    /// Decode a done body.
    pub fn decode(src: &mut (impl TdsRead + ?Sized), kind: DoneKind) -> Result<Self, ProtocolError> {
        let status = DoneStatus::from_bits_retain(src.read_u16_le()?);
        let transaction_state = TransactionState::from_u16(src.read_u16_le()?);
        let count = src.read_u32_le()?;

        Ok(Self {
            kind,
            status,
            transaction_state,
            row_count: status.contains(DoneStatus::COUNT).then_some(count),
        })
    }

    /// Encode the done token to bytes.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.kind.token_type() as u8);
        dst.put_u16_le(self.status.bits());
        dst.put_u16_le(self.transaction_state.as_u16());
        dst.put_u32_le(self.row_count.unwrap_or(0));
    }

    /// Check if more results follow this done token.
    #[must_use]
    pub const fn has_more(&self) -> bool {
        self.status.contains(DoneStatus::MORE)
    }

    /// Check if an error occurred.
    #[must_use]
    pub const fn has_error(&self) -> bool {
        self.status.contains(DoneStatus::ERROR)
    }

    /// Check if this acknowledges an attention request.
    #[must_use]
    pub const fn is_attention_ack(&self) -> bool {
        self.status.contains(DoneStatus::ATTENTION_ACK)
    }
}

// =============================================================================
// Capability and control
// =============================================================================

const CAPABILITY_REQUEST_LEN: u8 = 11;
const CAPABILITY_RESPONSE_LEN: u8 = 10;
const CAPABILITY_BODY_LEN: u16 = 4 + CAPABILITY_REQUEST_LEN as u16 + CAPABILITY_RESPONSE_LEN as u16;

/// Capability negotiation bitmaps, kept opaque.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capability {
    /// Request capabilities.
    pub request: [u8; CAPABILITY_REQUEST_LEN as usize],
    /// Response capabilities.
    pub response: [u8; CAPABILITY_RESPONSE_LEN as usize],
}

impl Capability {
    /// Decode a capability body (after the length prefix).
    pub fn decode(src: &mut (impl TdsRead + ?Sized)) -> Result<Self, ProtocolError> {
        let mut capability = Self::default();
        read_capability_part(src, 1, &mut capability.request)?;
        read_capability_part(src, 2, &mut capability.response)?;
        Ok(capability)
    }

    /// Encode the token, tag and length prefix included.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(TokenType::Capability as u8);
        dst.put_u16_le(CAPABILITY_BODY_LEN);
        dst.put_u8(1);
        dst.put_u8(CAPABILITY_REQUEST_LEN);
        dst.put_slice(&self.request);
        dst.put_u8(2);
        dst.put_u8(CAPABILITY_RESPONSE_LEN);
        dst.put_slice(&self.response);
    }
}

fn read_capability_part(
    src: &mut (impl TdsRead + ?Sized),
    marker: u8,
    dst: &mut [u8],
) -> Result<(), ProtocolError> {
    let found = src.read_u8()?;
    if found != marker {
        return Err(ProtocolError::InvalidCapability(format!(
            "expected marker {marker}, found {found}"
        )));
    }
    let len = usize::from(src.read_u8()?);
    if len == dst.len() {
        src.read_exact_into(dst)
    } else if len == 0 {
        Ok(())
    } else {
        Err(ProtocolError::InvalidCapability(format!(
            "byte count {len}, expected {} or 0",
            dst.len()
        )))
    }
}

/// Display formats for the current result set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Control {
    /// One optional format string per column.
    pub formats: Vec<Option<String>>,
}

impl Control {
    /// Decode a control body; reads until `src` is exhausted.
    pub fn decode(src: &mut &[u8], encoding: &'static Encoding) -> Result<Self, ProtocolError> {
        let mut formats = Vec::new();
        while !src.is_empty() {
            formats.push(read_b_varchar(src, encoding)?);
        }
        Ok(Self { formats })
    }

    /// Encode the token, tag and length prefix included.
    pub fn encode(&self, dst: &mut BytesMut, encoding: &'static Encoding) -> Result<(), ProtocolError> {
        let mut body = BytesMut::new();
        for format in &self.formats {
            write_b_varchar(&mut body, encoding, format.as_deref().unwrap_or(""))?;
        }
        put_with_length(dst, TokenType::Control, &body)
    }
}

/// Encode a return status token.
pub fn encode_return_status(dst: &mut impl BufMut, status: i32) {
    dst.put_u8(TokenType::ReturnStatus as u8);
    dst.put_i32_le(status);
}

/// Write `body` behind its tag and length prefix. Fails without writing
/// when the body does not fit the prefix.
pub(crate) fn put_with_length(
    dst: &mut BytesMut,
    token_type: TokenType,
    body: &[u8],
) -> Result<(), ProtocolError> {
    let too_large = |_| ProtocolError::TokenTooLarge {
        token_type,
        length: body.len(),
    };
    match token_type.length() {
        TokenLength::OneByteLen => {
            let len = u8::try_from(body.len()).map_err(too_large)?;
            dst.put_u8(token_type as u8);
            dst.put_u8(len);
        }
        TokenLength::FourByteLen => {
            let len = u32::try_from(body.len()).map_err(too_large)?;
            dst.put_u8(token_type as u8);
            dst.put_u32_le(len);
        }
        _ => {
            let len = u16::try_from(body.len()).map_err(too_large)?;
            dst.put_u8(token_type as u8);
            dst.put_u16_le(len);
        }
    }
    dst.put_slice(body);
    Ok(())
}

// =============================================================================
// Token reader
// =============================================================================

/// Read the declared length prefix of `token_type`, returning the body size
/// and the size of the prefix itself.
fn read_length(
    src: &mut (impl TdsRead + ?Sized),
    token_type: TokenType,
) -> Result<(usize, usize), ProtocolError> {
    match token_type.length() {
        TokenLength::OneByteLen => Ok((usize::from(src.read_u8()?), 1)),
        TokenLength::TwoByteLen => Ok((usize::from(src.read_u16_le()?), 2)),
        TokenLength::FourByteLen => Ok((src.read_u32_le()? as usize, 4)),
        TokenLength::Fixed(n) => Ok((n, 0)),
        TokenLength::Dependent => Err(ProtocolError::UnsizedToken(token_type)),
    }
}

/// Read exactly the declared body of a length-prefixed token.
fn read_body(src: &mut (impl TdsRead + ?Sized), token_type: TokenType) -> Result<Bytes, ProtocolError> {
    let (len, _) = read_length(src, token_type)?;
    src.read_bytes(len)
}

/// Read one token.
///
/// `last_format` is the current decoding context for row and parameter
/// data. Tokens without a builder are skipped and returned as
/// [`Token::Unknown`].
pub fn read_token(
    src: &mut (impl TdsRead + ?Sized),
    encoding: &'static Encoding,
    last_format: Option<&Arc<Format>>,
) -> Result<Token, ProtocolError> {
    let tag = src.read_u8()?;
    let token_type = TokenType::from_u8(tag).ok_or(ProtocolError::UnknownToken(tag))?;

    let token = match token_type {
        TokenType::RowFmt | TokenType::ParamFmt | TokenType::RowFmt2 | TokenType::ParamFmt2 => {
            let body = read_body(src, token_type)?;
            Token::Format(Arc::new(Format::decode(&mut &body[..], token_type, encoding)?))
        }
        TokenType::Row | TokenType::Params => {
            let format = last_format.ok_or(ProtocolError::MissingFormat(token_type))?;
            Token::Row(DataRow::decode(src, token_type, format, encoding)?)
        }
        TokenType::EnvChange => {
            let body = read_body(src, token_type)?;
            Token::EnvChange(EnvChange::decode(&mut &body[..], encoding)?)
        }
        TokenType::Eed => {
            let body = read_body(src, token_type)?;
            Token::Message(ServerMessage::decode(&mut &body[..], encoding)?)
        }
        TokenType::LoginAck => {
            let body = read_body(src, token_type)?;
            Token::LoginAck(LoginAck::decode(&mut &body[..], encoding)?)
        }
        TokenType::Capability => {
            let body = read_body(src, token_type)?;
            Token::Capability(Capability::decode(&mut &body[..])?)
        }
        TokenType::Control => {
            let body = read_body(src, token_type)?;
            Token::Control(Control::decode(&mut &body[..], encoding)?)
        }
        TokenType::Done => Token::Done(Done::decode(src, DoneKind::Done)?),
        TokenType::DoneInProc => Token::Done(Done::decode(src, DoneKind::DoneInProc)?),
        TokenType::DoneProc => Token::Done(Done::decode(src, DoneKind::DoneProc)?),
        TokenType::ReturnStatus => Token::ReturnStatus(src.read_i32_le()?),
        _ => {
            let (len, prefix) = read_length(src, token_type)?;
            src.skip(len)?;
            tracing::warn!(token_type = ?token_type, size = len + prefix, "skipping unsupported token");
            Token::Unknown {
                token_type,
                size: len + prefix,
            }
        }
    };

    tracing::trace!(token = %token, "decoded token");
    Ok(token)
}
