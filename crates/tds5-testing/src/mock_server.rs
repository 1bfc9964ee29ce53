//! Mock TDS 5.0 server for testing.
//!
//! Provides a blocking mock server that speaks enough of the protocol to
//! drive the client over a real socket:
//! - Login acknowledgment (or rejection)
//! - Canned responses keyed by SQL text
//! - Attention acknowledgment
//! - Packet recording for assertions
//!
//! ## Example
//!
//! ```rust,ignore
//! use tds5_testing::mock_server::{MockResponse, MockServer};
//!
//! let server = MockServer::builder()
//!     .with_response("select 1", MockResponse::scalar_int(1))
//!     .build()?;
//!
//! let config = Config::new().host(server.host()).port(server.port());
//! ```

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use bytes::{Bytes, BytesMut};
use tds5_codec::{Packet, RequestWriter, ResponseReader, TdsCodec};
use tds5_protocol::packet::{PacketHeader, PacketType};
use tds5_protocol::{LoginStatus, ProtocolError, TokenType, decode_text};
use tds5_types::SqlValue;

use crate::builder::{MockColumn, ResponseBuilder};

/// Error raised by the mock server.
#[derive(Debug, thiserror::Error)]
pub enum MockServerError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Malformed traffic from the client.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A request the server does not handle.
    #[error("unexpected request: {0}")]
    Unexpected(String),
}

/// Response a mock server sends for a language request.
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// A result set followed by a done token with the row count.
    Rows {
        /// Column definitions.
        columns: Vec<MockColumn>,
        /// Row values.
        rows: Vec<Vec<SqlValue>>,
    },
    /// A done token with a row count.
    RowsAffected(u32),
    /// An error message followed by a done token with the error bit.
    Error {
        /// Message number.
        number: i32,
        /// Severity.
        severity: u8,
        /// Message text.
        message: String,
    },
    /// A pre-encoded token stream.
    Tokens(Bytes),
    /// Close the connection instead of answering.
    Disconnect,
}

impl MockResponse {
    /// A single int4 column with one row.
    pub fn scalar_int(value: i32) -> Self {
        Self::Rows {
            columns: vec![MockColumn::int4("")],
            rows: vec![vec![SqlValue::Int(value)]],
        }
    }

    /// A result set.
    pub fn rows(columns: Vec<MockColumn>, rows: Vec<Vec<SqlValue>>) -> Self {
        Self::Rows { columns, rows }
    }

    /// A bare done token.
    pub fn empty() -> Self {
        Self::Tokens(Bytes::from_static(&[TokenType::Done as u8, 0, 0, 0, 0, 0, 0, 0, 0]))
    }

    /// A done token with a row count.
    pub fn affected(count: u32) -> Self {
        Self::RowsAffected(count)
    }

    /// An error response.
    pub fn error(number: i32, severity: u8, message: impl Into<String>) -> Self {
        Self::Error {
            number,
            severity,
            message: message.into(),
        }
    }

    /// Encode the response as a token stream.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let builder = ResponseBuilder::new();
        match self {
            Self::Rows { columns, rows } => {
                let builder = rows
                    .iter()
                    .fold(builder.row_format(columns), |b, row| b.row(row));
                builder.done_count(u32::try_from(rows.len()).unwrap_or(u32::MAX)).build()
            }
            Self::RowsAffected(count) => builder.done_count(*count).build(),
            Self::Error {
                number,
                severity,
                message,
            } => builder.error(*number, *severity, message).done_error().build(),
            Self::Tokens(tokens) => Ok(tokens.clone()),
            Self::Disconnect => Ok(Bytes::new()),
        }
    }
}

/// A packet received by the mock server.
#[derive(Debug, Clone)]
pub struct RecordedPacket {
    /// Packet header.
    pub header: PacketHeader,
    /// Packet payload.
    pub payload: Bytes,
}

impl RecordedPacket {
    /// Packet type.
    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        self.header.packet_type
    }
}

impl From<&Packet> for RecordedPacket {
    fn from(packet: &Packet) -> Self {
        Self {
            header: packet.header,
            payload: packet.payload.clone(),
        }
    }
}

/// Traffic seen by the server across all connections.
#[derive(Debug, Default)]
struct Recorder {
    packets: Mutex<Vec<RecordedPacket>>,
    queries: Mutex<Vec<String>>,
    logins: Mutex<Vec<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
struct ServerConfig {
    server_name: String,
    database: Option<String>,
    packet_size: Option<usize>,
    reject_login: Option<String>,
    responses: HashMap<String, MockResponse>,
    default_response: MockResponse,
}

/// Builder for a [`MockServer`].
#[derive(Debug)]
pub struct MockServerBuilder {
    config: ServerConfig,
}

impl Default for MockServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MockServerBuilder {
    /// Create a builder with an empty response table.
    pub fn new() -> Self {
        Self {
            config: ServerConfig {
                server_name: "MockServer".into(),
                database: None,
                packet_size: None,
                reject_login: None,
                responses: HashMap::new(),
                default_response: MockResponse::empty(),
            },
        }
    }

    /// Answer `sql` with `response`. Matching is exact.
    #[must_use]
    pub fn with_response(mut self, sql: impl Into<String>, response: MockResponse) -> Self {
        self.config.responses.insert(sql.into(), response);
        self
    }

    /// Response for SQL with no registered match.
    #[must_use]
    pub fn with_default_response(mut self, response: MockResponse) -> Self {
        self.config.default_response = response;
        self
    }

    /// Program name reported in the login acknowledgment.
    #[must_use]
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.config.server_name = name.into();
        self
    }

    /// Announce a database change during login.
    #[must_use]
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.config.database = Some(database.into());
        self
    }

    /// Announce a packet size during login and use it for responses.
    #[must_use]
    pub fn with_packet_size(mut self, size: usize) -> Self {
        self.config.packet_size = Some(size);
        self
    }

    /// Reject every login with `message`.
    #[must_use]
    pub fn with_login_failure(mut self, message: impl Into<String>) -> Self {
        self.config.reject_login = Some(message.into());
        self
    }

    /// Bind to an ephemeral localhost port and start accepting.
    pub fn build(self) -> Result<MockServer, MockServerError> {
        MockServer::start(self.config)
    }
}

/// Blocking mock TDS server.
///
/// Each accepted connection is served on its own thread. The server stops
/// accepting when dropped.
pub struct MockServer {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    recorder: Arc<Recorder>,
    accept_thread: Option<JoinHandle<()>>,
}

impl MockServer {
    /// Create a new builder.
    pub fn builder() -> MockServerBuilder {
        MockServerBuilder::new()
    }

    fn start(config: ServerConfig) -> Result<Self, MockServerError> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let stop = Arc::new(AtomicBool::new(false));
        let recorder = Arc::new(Recorder::default());
        let config = Arc::new(config);

        let accept_thread = {
            let stop = Arc::clone(&stop);
            let recorder = Arc::clone(&recorder);
            thread::spawn(move || accept_loop(&listener, &stop, &config, &recorder))
        };

        tracing::debug!(%addr, "mock server listening");
        Ok(Self {
            addr,
            stop,
            recorder,
            accept_thread: Some(accept_thread),
        })
    }

    /// Listening address.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Listening host as a string.
    #[must_use]
    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    /// Listening port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Every packet received so far, in arrival order per connection.
    #[must_use]
    pub fn packets(&self) -> Vec<RecordedPacket> {
        lock(&self.recorder.packets).clone()
    }

    /// SQL text of every language request received.
    #[must_use]
    pub fn queries(&self) -> Vec<String> {
        lock(&self.recorder.queries).clone()
    }

    /// Usernames of every login received.
    #[must_use]
    pub fn logins(&self) -> Vec<String> {
        lock(&self.recorder.logins).clone()
    }

    /// Number of attention packets received.
    #[must_use]
    pub fn attentions(&self) -> usize {
        lock(&self.recorder.packets)
            .iter()
            .filter(|p| p.packet_type() == PacketType::Attention)
            .count()
    }

    /// Stop accepting connections.
    pub fn stop(&mut self) {
        if self.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        // Wake the blocked accept call.
        let _ = TcpStream::connect(self.addr);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        tracing::debug!(addr = %self.addr, "mock server stopped");
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for MockServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockServer")
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

fn accept_loop(listener: &TcpListener, stop: &AtomicBool, config: &Arc<ServerConfig>, recorder: &Arc<Recorder>) {
    for stream in listener.incoming() {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        match stream {
            Ok(stream) => {
                let config = Arc::clone(config);
                let recorder = Arc::clone(recorder);
                thread::spawn(move || {
                    if let Err(e) = serve(stream, &config, &recorder) {
                        tracing::warn!(error = %e, "mock connection failed");
                    }
                });
            }
            Err(e) => tracing::warn!(error = %e, "accept failed"),
        }
    }
}

/// Serve one client until it disconnects.
fn serve(stream: TcpStream, config: &ServerConfig, recorder: &Recorder) -> Result<(), MockServerError> {
    stream.set_nodelay(true)?;
    let mut reader = ResponseReader::with_codec(stream.try_clone()?, TdsCodec::any_type());
    let mut writer = RequestWriter::new(stream);

    loop {
        let (packet_type, payload) = match read_message(&mut reader, recorder) {
            Ok(message) => message,
            Err(ProtocolError::ConnectionClosed) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let response = match packet_type {
            PacketType::Login => {
                let response = login_response(config, recorder, &payload)?;
                if config.reject_login.is_some() {
                    writer.send_message(PacketType::Response, &response)?;
                    return Ok(());
                }
                response
            }
            PacketType::Language | PacketType::Normal => {
                let sql = language_text(&payload)?;
                tracing::debug!(sql = %sql, "mock query");
                lock(&recorder.queries).push(sql.clone());
                let reply = config.responses.get(&sql).unwrap_or(&config.default_response);
                if matches!(reply, MockResponse::Disconnect) {
                    return Ok(());
                }
                reply.encode()?
            }
            PacketType::Attention => ResponseBuilder::new().attention_ack().build()?,
            other => return Err(MockServerError::Unexpected(format!("{other:?} packet"))),
        };
        writer.send_message(PacketType::Response, &response)?;

        if packet_type == PacketType::Login {
            if let Some(size) = config.packet_size {
                writer = RequestWriter::with_packet_size(writer.into_inner(), size);
            }
        }
    }
}

/// Read one complete request message.
fn read_message(
    reader: &mut ResponseReader<TcpStream>,
    recorder: &Recorder,
) -> Result<(PacketType, Bytes), ProtocolError> {
    let mut payload = BytesMut::new();
    loop {
        let packet = reader.read_packet()?;
        lock(&recorder.packets).push(RecordedPacket::from(&packet));
        payload.extend_from_slice(&packet.payload);
        if packet.is_end_of_message() {
            return Ok((packet.header.packet_type, payload.freeze()));
        }
    }
}

fn login_response(config: &ServerConfig, recorder: &Recorder, record: &[u8]) -> Result<Bytes, ProtocolError> {
    let username = login_field(record, 31, 30);
    tracing::debug!(username = %username, "mock login");
    lock(&recorder.logins).push(username);

    if let Some(message) = &config.reject_login {
        return ResponseBuilder::new()
            .error(4002, 14, message)
            .login_ack(LoginStatus::Fail, &config.server_name)
            .done_error()
            .build();
    }

    let mut builder = ResponseBuilder::new()
        .capability()
        .login_ack(LoginStatus::Succeed, &config.server_name);
    if let Some(database) = &config.database {
        builder = builder.database(database);
    }
    if let Some(size) = config.packet_size {
        builder = builder.packet_size(size);
    }
    builder.done().build()
}

/// A login record string field: `width` bytes followed by a length byte.
fn login_field(record: &[u8], offset: usize, width: usize) -> String {
    let len = record.get(offset + width).map_or(0, |&l| usize::from(l).min(width));
    record
        .get(offset..offset + len)
        .map(|raw| decode_text(encoding_rs::WINDOWS_1252, raw))
        .unwrap_or_default()
}

/// SQL text of a language token: tag, u32 length, status byte, text.
fn language_text(payload: &[u8]) -> Result<String, MockServerError> {
    if payload.len() < 6 || payload[0] != TokenType::Language as u8 {
        return Err(MockServerError::Unexpected("not a language request".into()));
    }
    let len = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]) as usize;
    let text = payload
        .get(6..5 + len)
        .ok_or_else(|| MockServerError::Unexpected("truncated language request".into()))?;
    Ok(decode_text(encoding_rs::WINDOWS_1252, text))
}
