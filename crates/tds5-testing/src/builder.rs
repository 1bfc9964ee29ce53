//! Byte-exact server response construction.
//!
//! [`ResponseBuilder`] appends encoded tokens to a buffer and can pack the
//! result into response packets of any size, which makes it suitable both
//! for in-memory transports and for the mock server.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use encoding_rs::Encoding;
use tds5_codec::RequestWriter;
use tds5_protocol::datatype::write_value;
use tds5_protocol::packet::PacketType;
use tds5_protocol::token::encode_return_status;
use tds5_protocol::{
    Capability, Done, DoneKind, DoneStatus, EnvChange, EnvChangeEntry, EnvChangeType, Format,
    FormatEntry, LoginAck, LoginStatus, ProtocolError, ServerMessage, TokenType, TypeId,
    TypeMetadata,
};
use tds5_types::SqlValue;

/// Column definition for a mock result set.
#[derive(Debug, Clone)]
pub struct MockColumn {
    /// Column name.
    pub name: String,
    /// Column type.
    pub type_id: TypeId,
    /// Type metadata.
    pub metadata: TypeMetadata,
    /// Whether the column is nullable.
    pub nullable: bool,
}

impl MockColumn {
    /// Create a new column definition.
    pub fn new(name: impl Into<String>, type_id: TypeId, metadata: TypeMetadata) -> Self {
        Self {
            name: name.into(),
            type_id,
            metadata,
            nullable: true,
        }
    }

    /// A nullable 4-byte int column.
    pub fn int(name: impl Into<String>) -> Self {
        Self::new(name, TypeId::IntN, TypeMetadata::with_length(4))
    }

    /// A fixed 4-byte int column, as the server describes `select 1`.
    pub fn int4(name: impl Into<String>) -> Self {
        Self::new(name, TypeId::Int4, TypeMetadata::default()).with_nullable(false)
    }

    /// A nullable 8-byte int column.
    pub fn bigint(name: impl Into<String>) -> Self {
        Self::new(name, TypeId::IntN, TypeMetadata::with_length(8))
    }

    /// A nullable 8-byte float column.
    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, TypeId::FltN, TypeMetadata::with_length(8))
    }

    /// A varchar column.
    pub fn varchar(name: impl Into<String>, max_len: u32) -> Self {
        Self::new(name, TypeId::VarChar, TypeMetadata::with_length(max_len))
    }

    /// Set the nullable flag.
    #[must_use]
    pub fn with_nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }
}

impl From<&MockColumn> for FormatEntry {
    fn from(column: &MockColumn) -> Self {
        let status = if column.nullable { 0x20 } else { 0 };
        FormatEntry::new(&column.name, column.type_id, column.metadata.clone()).with_status(status)
    }
}

/// Builds a server token stream.
///
/// Encoding errors are deferred to [`build`](Self::build) so calls can be
/// chained.
#[derive(Debug)]
pub struct ResponseBuilder {
    encoding: &'static Encoding,
    buf: BytesMut,
    format: Option<Arc<Format>>,
    error: Option<ProtocolError>,
}

impl Default for ResponseBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseBuilder {
    /// Create a builder that encodes text as iso_1.
    pub fn new() -> Self {
        Self::with_encoding(encoding_rs::WINDOWS_1252)
    }

    /// Create a builder with a specific text encoding.
    pub fn with_encoding(encoding: &'static Encoding) -> Self {
        Self {
            encoding,
            buf: BytesMut::new(),
            format: None,
            error: None,
        }
    }

    fn record(&mut self, result: Result<(), ProtocolError>) {
        if let Err(e) = result {
            self.error.get_or_insert(e);
        }
    }

    /// A capability token with empty bitmaps.
    #[must_use]
    pub fn capability(mut self) -> Self {
        Capability::default().encode(&mut self.buf);
        self
    }

    /// A login acknowledgment.
    #[must_use]
    pub fn login_ack(mut self, status: LoginStatus, program_name: &str) -> Self {
        let ack = LoginAck {
            status,
            tds_version: [5, 0, 0, 0],
            program_name: program_name.to_string(),
            program_version: [15, 7, 0, 0],
        };
        let result = ack.encode(&mut self.buf, self.encoding);
        self.record(result);
        self
    }

    /// An environment change with a single entry.
    #[must_use]
    pub fn env_change(mut self, kind: EnvChangeType, new_value: &str, old_value: &str) -> Self {
        let env = EnvChange {
            changes: vec![EnvChangeEntry::new(kind, new_value, old_value)],
        };
        let result = env.encode(&mut self.buf, self.encoding);
        self.record(result);
        self
    }

    /// A database change.
    #[must_use]
    pub fn database(self, name: &str) -> Self {
        self.env_change(EnvChangeType::Database, name, "master")
    }

    /// A packet size change.
    #[must_use]
    pub fn packet_size(self, size: usize) -> Self {
        self.env_change(EnvChangeType::PacketSize, &size.to_string(), "512")
    }

    /// A diagnostic message.
    #[must_use]
    pub fn message(mut self, message: &ServerMessage) -> Self {
        let result = message.encode(&mut self.buf, self.encoding);
        self.record(result);
        self
    }

    /// An error message with the given severity.
    #[must_use]
    pub fn error(self, number: i32, severity: u8, text: &str) -> Self {
        self.message(&ServerMessage::new(number, severity, text).with_server("MOCK"))
    }

    /// An informational message (severity 10).
    #[must_use]
    pub fn info(self, number: i32, text: &str) -> Self {
        self.message(&ServerMessage::new(number, 10, text))
    }

    /// A row format; it becomes the format for subsequent rows.
    #[must_use]
    pub fn row_format(self, columns: &[MockColumn]) -> Self {
        self.format(TokenType::RowFmt, columns)
    }

    /// A parameter format; it becomes the format for subsequent parameters.
    #[must_use]
    pub fn param_format(self, columns: &[MockColumn]) -> Self {
        self.format(TokenType::ParamFmt, columns)
    }

    fn format(mut self, token_type: TokenType, columns: &[MockColumn]) -> Self {
        let format = Format::new(token_type, columns.iter().map(FormatEntry::from).collect());
        let result = format.encode(&mut self.buf, self.encoding);
        self.record(result);
        self.format = Some(Arc::new(format));
        self
    }

    /// A row encoded against the current format.
    #[must_use]
    pub fn row(self, values: &[SqlValue]) -> Self {
        self.data(TokenType::Row, values)
    }

    /// Parameter values encoded against the current format.
    #[must_use]
    pub fn params(self, values: &[SqlValue]) -> Self {
        self.data(TokenType::Params, values)
    }

    fn data(mut self, token_type: TokenType, values: &[SqlValue]) -> Self {
        let Some(format) = self.format.clone() else {
            self.error.get_or_insert(ProtocolError::MissingFormat(token_type));
            return self;
        };
        self.buf.put_u8(token_type as u8);
        for (entry, value) in format.entries.iter().zip(values) {
            let result = write_column_value(&mut self.buf, entry.type_id, value, self.encoding);
            self.record(result);
        }
        self
    }

    /// A done token with arbitrary status and optional row count.
    #[must_use]
    pub fn done_with(mut self, kind: DoneKind, status: DoneStatus, count: Option<u32>) -> Self {
        let mut done = Done::new(kind).with_status(status);
        if let Some(count) = count {
            done = done.with_row_count(count);
        }
        done.encode(&mut self.buf);
        self
    }

    /// A final done token.
    #[must_use]
    pub fn done(self) -> Self {
        self.done_with(DoneKind::Done, DoneStatus::empty(), None)
    }

    /// A final done token with a row count.
    #[must_use]
    pub fn done_count(self, count: u32) -> Self {
        self.done_with(DoneKind::Done, DoneStatus::empty(), Some(count))
    }

    /// A done token announcing more results.
    #[must_use]
    pub fn done_more(self) -> Self {
        self.done_with(DoneKind::Done, DoneStatus::MORE, None)
    }

    /// A final done token flagged as an error.
    #[must_use]
    pub fn done_error(self) -> Self {
        self.done_with(DoneKind::Done, DoneStatus::ERROR, None)
    }

    /// The done token acknowledging an attention.
    #[must_use]
    pub fn attention_ack(self) -> Self {
        self.done_with(DoneKind::Done, DoneStatus::ATTENTION_ACK, None)
    }

    /// A procedure return status.
    #[must_use]
    pub fn return_status(mut self, status: i32) -> Self {
        encode_return_status(&mut self.buf, status);
        self
    }

    /// Arbitrary bytes, for tokens the builder has no method for.
    #[must_use]
    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.buf.put_slice(bytes);
        self
    }

    /// The encoded token stream.
    pub fn build(self) -> Result<Bytes, ProtocolError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.buf.freeze()),
        }
    }

    /// The encoded token stream packed into response packets.
    pub fn packets(self, packet_size: usize) -> Result<Vec<u8>, ProtocolError> {
        let tokens = self.build()?;
        pack(&tokens, packet_size)
    }
}

/// Pack a token stream into response packets of `packet_size` bytes.
pub fn pack(tokens: &[u8], packet_size: usize) -> Result<Vec<u8>, ProtocolError> {
    let mut writer = RequestWriter::with_packet_size(Vec::new(), packet_size);
    writer.send_message(PacketType::Response, tokens)?;
    Ok(writer.into_inner())
}

/// Write one column value. Fixed-width integer and float columns carry no
/// length byte; everything else uses the nullable wire forms.
fn write_column_value(
    dst: &mut BytesMut,
    type_id: TypeId,
    value: &SqlValue,
    encoding: &'static Encoding,
) -> Result<(), ProtocolError> {
    match (type_id, value) {
        (TypeId::Int1, SqlValue::TinyInt(v)) => dst.put_u8(*v),
        (TypeId::Int2, SqlValue::SmallInt(v)) => dst.put_i16_le(*v),
        (TypeId::Int4, SqlValue::Int(v)) => dst.put_i32_le(*v),
        (TypeId::Int8, SqlValue::BigInt(v)) => dst.put_i64_le(*v),
        (TypeId::Flt8, SqlValue::Double(v)) => dst.put_f64_le(*v),
        _ => return write_value(dst, type_id, value, encoding),
    }
    Ok(())
}
