//! TDS 5.0 client implementation.

use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs};

use once_cell::sync::Lazy;
use regex::Regex;
use tds5_codec::{Connection, RequestWriter};
use tds5_protocol::packet::PacketType;
use tds5_protocol::{LanguageRequest, Parameter, ProtocolError, Token, read_token};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::query::QueryResult;
use crate::session::{ServerInfo, Session};
use crate::state::ConnectionState;
use crate::stream::ResponseStream;

/// A blocking TDS 5.0 client connection.
///
/// A client owns one transport and serves one request at a time. Responses
/// are read lazily through [`ResponseStream`], which borrows the client
/// mutably so no second request can start until the first is drained or
/// cancelled.
///
/// # Example
///
/// ```rust,ignore
/// use tds5_client::{Client, Config};
///
/// let config = Config::new().host("dbhost").credentials("sa", "secret");
/// let mut client = Client::new(config)?;
/// client.open()?;
///
/// let result = client.execute("select name from sysobjects", &[])?;
/// for row in result.rows() {
///     let name: String = row.get(0)?;
///     println!("{name}");
/// }
/// ```
pub struct Client<R: Read = TcpStream, W: Write = TcpStream> {
    config: Config,
    state: ConnectionState,
    session: Session,
    connection: Option<Connection<R, W>>,
}

impl Client<TcpStream, TcpStream> {
    /// Create a client for `config`. No connection is made yet.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let session = Session::new(&config.charset, config.packet_size)?;
        Ok(Self {
            config,
            state: ConnectionState::Closed,
            session,
            connection: None,
        })
    }

    /// Open the TCP connection.
    pub fn connect(&mut self) -> Result<()> {
        self.expect_state(ConnectionState::Closed, "closed")?;

        let addr = resolve(&self.config.host, self.config.port)?;
        tracing::debug!(host = %self.config.host, addr = %addr, "establishing TCP connection");

        let stream = TcpStream::connect_timeout(&addr, self.config.timeouts.connect_timeout)
            .map_err(|e| Error::Connection(format!("{addr}: {e}")))?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(self.config.timeouts.read_timeout)?;

        self.session = Session::new(&self.config.charset, self.config.packet_size)?;
        self.connection = Some(Connection::from_tcp(stream)?);
        self.state = ConnectionState::Connecting;
        Ok(())
    }

    /// Connect, log in, and run the post-login setup.
    pub fn open(&mut self) -> Result<()> {
        self.connect()?;
        self.login()
    }
}

impl<R: Read, W: Write> Client<R, W> {
    /// Create a client over an already connected transport.
    ///
    /// The client starts in [`ConnectionState::Connecting`]; call
    /// [`login`](Self::login) next.
    pub fn from_transport(config: Config, reader: R, writer: W) -> Result<Self> {
        config.validate()?;
        let session = Session::new(&config.charset, config.packet_size)?;
        Ok(Self {
            config,
            state: ConnectionState::Connecting,
            session,
            connection: Some(Connection::new(reader, writer)),
        })
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Session state.
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The configuration this client was built with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Current database, as last reported by the server.
    #[must_use]
    pub fn database(&self) -> Option<&str> {
        self.session.database()
    }

    /// Negotiated packet size.
    #[must_use]
    pub fn packet_size(&self) -> usize {
        self.session.packet_size()
    }

    /// Server identity, after a successful login.
    #[must_use]
    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.session.server_info()
    }

    /// Log in and run the post-login setup: the configured init SQL, then
    /// `use <database>` if a database is configured.
    pub fn login(&mut self) -> Result<()> {
        self.send_login()?;
        self.read_login_response()?;

        if let Some(sql) = self.config.init_sql.clone() {
            self.execute(&sql, &[])?;
        }
        if let Some(database) = self.config.database.clone() {
            validate_identifier(&database)?;
            self.execute(&format!("use {database}"), &[])?;
        }
        Ok(())
    }

    /// Send the login record.
    pub fn send_login(&mut self) -> Result<()> {
        self.expect_state(ConnectionState::Connecting, "connecting")?;
        let login = self.config.login_record();
        self.write_message(PacketType::Login, |writer, encoding| login.write(writer, encoding))?;
        tracing::debug!(username = %login.username, packet_size = login.packet_size, "login sent");
        Ok(())
    }

    /// Read the login response.
    ///
    /// Reads until the end of the response or of the login reply message,
    /// whichever comes first. Succeeds only if the server acknowledged the
    /// login with a success status. On failure the transport is dropped.
    pub fn read_login_response(&mut self) -> Result<()> {
        self.expect_state(ConnectionState::Connecting, "connecting")?;
        loop {
            let token = self.read_next_token()?;
            let message_complete = self
                .connection
                .as_mut()
                .is_some_and(|connection| connection.reader().is_message_complete());
            if token.is_end_of_response() || message_complete {
                break;
            }
        }

        match self.session.login_ack() {
            Some(ack) if ack.is_success() => {
                tracing::info!(
                    host = %self.config.host,
                    server = %ack.program_name,
                    version = %ack.program_version_string(),
                    "logged in"
                );
                self.state = ConnectionState::Open;
                Ok(())
            }
            ack => {
                let reason = match (self.session.server_error(), ack) {
                    (Some(err), _) => err.to_string(),
                    (None, Some(ack)) => format!("server answered with status {:?}", ack.status),
                    (None, None) => "no login acknowledgment received".to_string(),
                };
                self.connection = None;
                self.state = ConnectionState::Closed;
                Err(Error::LoginFailed(reason))
            }
        }
    }

    /// Send SQL text with parameters and return the response as a token stream.
    pub fn execute_sql(&mut self, sql: &str, params: &[Parameter]) -> Result<ResponseStream<'_, R, W>> {
        self.expect_state(ConnectionState::Open, "open")?;
        self.session.reset_request();
        self.state = ConnectionState::Executing;

        tracing::info!(sql = sql, params = params.len(), "executing SQL");
        let request = LanguageRequest::new(sql).params(params.iter().cloned());
        if let Err(err) =
            self.write_message(PacketType::Normal, |writer, encoding| request.write(writer, encoding))
        {
            if !err.is_fatal() {
                self.state = ConnectionState::Open;
            }
            return Err(err);
        }

        self.state = ConnectionState::Fetching;
        Ok(ResponseStream::new(self))
    }

    /// Send SQL text and drain the whole response.
    ///
    /// If any message with severity above 10 arrived, the highest-severity
    /// one is returned as [`Error::Server`] once the response is drained.
    pub fn execute(&mut self, sql: &str, params: &[Parameter]) -> Result<QueryResult> {
        self.execute_sql(sql, params)?.into_result()
    }

    /// Send an attention request.
    pub fn send_cancel(&mut self) -> Result<()> {
        let result = self.connection_mut()?.send_attention();
        result.map_err(|e| self.fail(e.into()))?;
        self.session.set_in_cancel(true);
        tracing::debug!("attention sent");
        Ok(())
    }

    /// Discard tokens until the server acknowledges the attention.
    pub fn wait_for_cancel(&mut self) -> Result<()> {
        let mut discarded = 0usize;
        while self.session.in_cancel() {
            match self.read_next_token()? {
                Token::Done(done) if done.is_attention_ack() => self.session.set_in_cancel(false),
                _ => discarded += 1,
            }
        }
        tracing::debug!(discarded, "attention acknowledged");
        self.state = ConnectionState::Open;
        Ok(())
    }

    /// Cancel the request in flight and wait for the server to acknowledge.
    pub fn cancel(&mut self) -> Result<()> {
        if !self.state.is_busy() {
            return Err(Error::InvalidState {
                expected: "executing or fetching",
                actual: self.state,
            });
        }
        self.send_cancel()?;
        self.wait_for_cancel()
    }

    /// Close the connection. Calling this more than once is harmless.
    pub fn close(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            if self.state.is_busy() {
                if let Err(e) = connection.send_attention() {
                    tracing::debug!(error = %e, "attention on close failed");
                }
            }
            tracing::debug!(state = %self.state, "closing connection");
        }
        self.state = ConnectionState::Closed;
    }

    /// Read one response token and mark the client idle after the last one.
    pub(crate) fn next_response_token(&mut self) -> Result<Token> {
        let token = self.read_next_token()?;
        if token.is_end_of_response() && !self.session.in_cancel() {
            self.state = ConnectionState::Open;
        }
        Ok(token)
    }

    /// Read one token and apply its side effects. Any failure breaks the
    /// connection since the stream position is lost.
    fn read_next_token(&mut self) -> Result<Token> {
        let result = self.try_read_token();
        result.map_err(|e| {
            if self.state != ConnectionState::Broken {
                tracing::error!(error = %e, "response stream failed");
            }
            self.state = ConnectionState::Broken;
            e
        })
    }

    fn try_read_token(&mut self) -> Result<Token> {
        let encoding = self.session.encoding();
        let connection = self.connection.as_mut().ok_or(Error::ConnectionClosed)?;
        let token = read_token(connection.reader(), encoding, self.session.current_format())?;
        if let Some(packet_size) = self.session.apply(&token)? {
            connection.set_packet_size(packet_size);
        }
        Ok(token)
    }

    fn write_message<F>(&mut self, packet_type: PacketType, write: F) -> Result<()>
    where
        F: FnOnce(&mut RequestWriter<W>, &'static encoding_rs::Encoding) -> std::result::Result<(), ProtocolError>,
    {
        let encoding = self.session.encoding();
        let writer = self.connection_mut()?.writer();
        writer.set_message_type(packet_type);
        let result = match write(&mut *writer, encoding) {
            Ok(()) => writer.end_message(),
            Err(e) => Err(e),
        };
        result.map_err(|e| self.fail(e.into()))
    }

    fn connection_mut(&mut self) -> Result<&mut Connection<R, W>> {
        self.connection.as_mut().ok_or(Error::ConnectionClosed)
    }

    fn expect_state(&self, expected: ConnectionState, name: &'static str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::InvalidState {
                expected: name,
                actual: self.state,
            })
        }
    }

    /// Move to Broken if `err` desynchronised the connection.
    fn fail(&mut self, err: Error) -> Error {
        if err.is_fatal() {
            tracing::error!(error = %err, state = %self.state, "connection broken");
            self.state = ConnectionState::Broken;
        }
        err
    }
}

impl<R: Read, W: Write> Drop for Client<R, W> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<R: Read, W: Write> std::fmt::Debug for Client<R, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("state", &self.state)
            .field("database", &self.session.database())
            .finish()
    }
}

/// Resolve the server address. Literal IPs are used as given; DNS results
/// prefer IPv4.
fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::Connection(format!("cannot resolve {host}: {e}")))?
        .collect();
    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| Error::Connection(format!("no addresses found for {host}")))
}

static IDENTIFIER_RE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_@#$]{0,127}$").ok());

/// Validate an identifier (database name) before splicing it into SQL.
fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidIdentifier("identifier cannot be empty".into()));
    }

    let valid = IDENTIFIER_RE.as_ref().is_some_and(|re| re.is_match(name));
    if !valid {
        return Err(Error::InvalidIdentifier(format!(
            "invalid identifier '{name}': must start with letter/underscore, \
             contain only alphanumerics/_/@/#/$, and be 1-128 characters"
        )));
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::io::Cursor;

    use bytes::BytesMut;
    use encoding_rs::{Encoding, WINDOWS_1252};
    use tds5_protocol::packet::{PACKET_HEADER_SIZE, PacketHeader};
    use tds5_protocol::{
        Capability, Done, DoneKind, DoneStatus, EnvChange, EnvChangeEntry, EnvChangeType, Format,
        FormatEntry, LoginAck, LoginStatus, ServerMessage, TokenType, TypeId, TypeMetadata,
    };
    use tds5_types::{SqlValue, TypeError};

    use super::*;

    const ENC: &Encoding = WINDOWS_1252;

    type MemClient = Client<Cursor<Vec<u8>>, Vec<u8>>;

    fn frame(tokens: &[u8]) -> Vec<u8> {
        let mut writer = RequestWriter::new(Vec::new());
        writer.send_message(PacketType::Response, tokens).unwrap();
        writer.into_inner()
    }

    fn login_ack(status: LoginStatus) -> BytesMut {
        let mut buf = BytesMut::new();
        Capability::default().encode(&mut buf);
        LoginAck {
            status,
            tds_version: [5, 0, 0, 0],
            program_name: "sql server".into(),
            program_version: [15, 7, 0, 0],
        }
        .encode(&mut buf, ENC)
        .unwrap();
        Done::new(DoneKind::Done).encode(&mut buf);
        buf
    }

    fn select_one() -> BytesMut {
        let mut buf = BytesMut::new();
        Format::new(
            TokenType::RowFmt,
            vec![FormatEntry::new("", TypeId::IntN, TypeMetadata::with_length(4))],
        )
        .encode(&mut buf, ENC)
        .unwrap();
        buf.extend_from_slice(&[TokenType::Row as u8, 4, 1, 0, 0, 0]);
        Done::new(DoneKind::Done).with_row_count(1).encode(&mut buf);
        buf
    }

    /// A client whose transport replays `responses`, already logged in.
    fn logged_in(responses: &[&[u8]]) -> MemClient {
        let mut input = frame(&login_ack(LoginStatus::Succeed));
        for response in responses {
            input.extend(frame(response));
        }
        let mut client = Client::from_transport(Config::new(), Cursor::new(input), Vec::new()).unwrap();
        client.login().unwrap();
        client
    }

    fn sent(client: &mut MemClient) -> Vec<u8> {
        client.connection_mut().unwrap().writer().get_ref().clone()
    }

    #[test]
    fn test_validate_identifier_valid() {
        assert!(validate_identifier("pubs2").is_ok());
        assert!(validate_identifier("_tempdb").is_ok());
        assert!(validate_identifier("db#1").is_ok());
    }

    #[test]
    fn test_validate_identifier_invalid() {
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("1db").is_err());
        assert!(validate_identifier("db; drop table x").is_err());
        assert!(validate_identifier(&"a".repeat(129)).is_err());
    }

    #[test]
    fn test_resolve_literal_ip() {
        assert_eq!(
            resolve("127.0.0.1", 5000).unwrap(),
            "127.0.0.1:5000".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(resolve("::1", 4100).unwrap().port(), 4100);
    }

    #[test]
    fn test_new_client_is_closed() {
        let client = Client::new(Config::new()).unwrap();
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(Client::new(Config::new().charset("nope")).is_err());
    }

    #[test]
    fn test_login_success() {
        let mut client = logged_in(&[]);
        assert_eq!(client.state(), ConnectionState::Open);
        let info = client.server_info().unwrap();
        assert_eq!(info.program_name, "sql server");

        // The 568-byte record does not fit one 512-byte packet.
        let written = sent(&mut client);
        let first = PacketHeader::decode(&mut &written[..PACKET_HEADER_SIZE]).unwrap();
        assert_eq!(first.packet_type, PacketType::Login);
        assert_eq!(first.length, 512);
        assert!(!first.is_end_of_message());
        let second = PacketHeader::decode(&mut &written[512..512 + PACKET_HEADER_SIZE]).unwrap();
        assert_eq!(second.packet_type, PacketType::Login);
        assert!(second.is_end_of_message());
        assert_eq!(written.len(), 2 * PACKET_HEADER_SIZE + tds5_protocol::LOGIN_RECORD_SIZE);
    }

    #[test]
    fn test_login_ends_with_reply_message() {
        let mut tokens = BytesMut::new();
        Capability::default().encode(&mut tokens);
        LoginAck {
            status: LoginStatus::Succeed,
            tds_version: [5, 0, 0, 0],
            program_name: "sql server".into(),
            program_version: [15, 7, 0, 0],
        }
        .encode(&mut tokens, ENC)
        .unwrap();
        let mut client =
            Client::from_transport(Config::new(), Cursor::new(frame(&tokens)), Vec::new()).unwrap();
        client.login().unwrap();
        assert_eq!(client.state(), ConnectionState::Open);
    }

    #[test]
    fn test_login_failure_closes() {
        let mut tokens = BytesMut::new();
        ServerMessage::new(4002, 14, "Login failed.").encode(&mut tokens, ENC).unwrap();
        tokens.extend_from_slice(&login_ack(LoginStatus::Fail));
        let mut client =
            Client::from_transport(Config::new(), Cursor::new(frame(&tokens)), Vec::new()).unwrap();

        let err = client.login().unwrap_err();
        match err {
            Error::LoginFailed(reason) => assert!(reason.contains("Login failed.")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_login_without_ack_fails() {
        let mut tokens = BytesMut::new();
        Done::new(DoneKind::Done).encode(&mut tokens);
        let mut client =
            Client::from_transport(Config::new(), Cursor::new(frame(&tokens)), Vec::new()).unwrap();
        assert!(matches!(client.login(), Err(Error::LoginFailed(_))));
    }

    #[test]
    fn test_login_switches_database() {
        let mut use_db = BytesMut::new();
        EnvChange {
            changes: vec![EnvChangeEntry::new(EnvChangeType::Database, "pubs2", "master")],
        }
        .encode(&mut use_db, ENC)
        .unwrap();
        Done::new(DoneKind::Done).encode(&mut use_db);

        let mut input = frame(&login_ack(LoginStatus::Succeed));
        input.extend(frame(&use_db));
        let config = Config::new().database("pubs2");
        let mut client = Client::from_transport(config, Cursor::new(input), Vec::new()).unwrap();
        client.login().unwrap();
        assert_eq!(client.database(), Some("pubs2"));
    }

    #[test]
    fn test_login_rejects_bad_database_name() {
        let config = Config::new().database("x; shutdown");
        let input = frame(&login_ack(LoginStatus::Succeed));
        let mut client = Client::from_transport(config, Cursor::new(input), Vec::new()).unwrap();
        assert!(matches!(client.login(), Err(Error::InvalidIdentifier(_))));
        assert_eq!(client.state(), ConnectionState::Open);
    }

    #[test]
    fn test_execute_select_one() {
        let mut client = logged_in(&[&select_one()]);
        let result = client.execute("select 1", &[]).unwrap();
        let rows: Vec<_> = result.rows().collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get::<i32>(0).unwrap(), 1);
        assert_eq!(result.rows_affected(), 1);
        assert_eq!(client.state(), ConnectionState::Open);
    }

    #[test]
    fn test_execute_requires_open() {
        let mut client =
            Client::from_transport(Config::new(), Cursor::new(Vec::new()), Vec::new()).unwrap();
        assert!(matches!(
            client.execute_sql("select 1", &[]),
            Err(Error::InvalidState { actual: ConnectionState::Connecting, .. })
        ));
    }

    #[test]
    fn test_unsupported_parameter_keeps_connection_open() {
        let mut client = logged_in(&[]);
        let before = sent(&mut client).len();
        let param = Parameter::new("m", 1i32).with_type(TypeId::Money);
        let err = client.execute_sql("select @m", &[param]).unwrap_err();
        assert!(matches!(err, Error::Type(TypeError::Unsupported(_))));
        assert_eq!(client.state(), ConnectionState::Open);
        assert_eq!(sent(&mut client).len(), before);
    }

    #[test]
    fn test_failed_parameter_sends_nothing() {
        let mut client = logged_in(&[&select_one()]);
        let before = sent(&mut client).len();
        let param = Parameter::new("b", SqlValue::Null).with_type(TypeId::Bit);
        let err = client.execute_sql("select @b", &[param]).unwrap_err();
        assert!(matches!(err, Error::Type(TypeError::UnexpectedNull)));
        assert_eq!(client.state(), ConnectionState::Open);
        assert_eq!(client.connection_mut().unwrap().writer().buffered(), 0);
        assert_eq!(sent(&mut client).len(), before);

        // The next request goes out on its own.
        client.execute("select 1", &[]).unwrap();
        let written = sent(&mut client);
        let payload = &written[before + PACKET_HEADER_SIZE..];
        assert_eq!(payload[0], TokenType::Language as u8);
        assert_eq!(&payload[1..5], &9u32.to_le_bytes());
        assert_eq!(&payload[6..], b"select 1");
    }

    #[test]
    fn test_row_needs_format_from_same_response() {
        let mut stale = BytesMut::new();
        stale.extend_from_slice(&[TokenType::Row as u8, 4, 9, 0, 0, 0]);
        Done::new(DoneKind::Done).with_row_count(1).encode(&mut stale);
        let mut client = logged_in(&[&select_one(), &stale]);

        assert_eq!(client.execute("select 1", &[]).unwrap().rows().count(), 1);
        assert!(client.session().current_format().is_none());

        let err = client.execute("select 9", &[]).unwrap_err();
        assert!(
            matches!(err, Error::Protocol(ProtocolError::MissingFormat(TokenType::Row))),
            "{err:?}"
        );
        assert_eq!(client.state(), ConnectionState::Broken);
    }

    #[test]
    fn test_server_error_raised_after_drain() {
        let mut tokens = BytesMut::new();
        ServerMessage::new(208, 16, "nope not found.").encode(&mut tokens, ENC).unwrap();
        Done::new(DoneKind::Done)
            .with_status(DoneStatus::ERROR)
            .encode(&mut tokens);
        let mut client = logged_in(&[&tokens]);

        let err = client.execute("select * from nope", &[]).unwrap_err();
        assert!(err.is_server_error(208));
        assert_eq!(err.severity(), Some(16));
        assert_eq!(client.state(), ConnectionState::Open);
        assert!(client.session().is_error());
    }

    #[test]
    fn test_packet_size_change_reaches_writer() {
        let mut tokens = BytesMut::new();
        EnvChange {
            changes: vec![EnvChangeEntry::new(EnvChangeType::PacketSize, "2048", "512")],
        }
        .encode(&mut tokens, ENC)
        .unwrap();
        Done::new(DoneKind::Done).encode(&mut tokens);
        let mut client = logged_in(&[&tokens]);
        client.execute("set packet size", &[]).unwrap();
        assert_eq!(client.packet_size(), 2048);
        assert_eq!(client.connection_mut().unwrap().writer().packet_size(), 2048);
    }

    #[test]
    fn test_truncated_response_breaks_connection() {
        let mut client = logged_in(&[]);
        let mut stream = client.execute_sql("select 1", &[]).unwrap();
        assert!(matches!(stream.next(), Some(Err(Error::ConnectionClosed))));
        assert!(stream.next().is_none());
        drop(stream);
        assert_eq!(client.state(), ConnectionState::Broken);
        assert!(client.execute_sql("select 1", &[]).is_err());
        client.close();
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_cancel_drains_to_attention_ack() {
        let mut first = select_one();
        first.truncate(first.len() - Done::SIZE - 1);
        Done::new(DoneKind::Done)
            .with_status(DoneStatus::MORE)
            .encode(&mut first);
        let mut ack = BytesMut::new();
        Done::new(DoneKind::Done).encode(&mut ack);
        Done::new(DoneKind::Done)
            .with_status(DoneStatus::ATTENTION_ACK)
            .encode(&mut ack);
        let mut client = logged_in(&[&first, &ack, &select_one()]);

        let mut stream = client.execute_sql("select 1 select 2", &[]).unwrap();
        assert!(matches!(stream.next(), Some(Ok(Token::Format(_)))));
        stream.cancel().unwrap();
        assert_eq!(client.state(), ConnectionState::Open);
        assert!(!client.session().in_cancel());

        let written = sent(&mut client);
        assert_eq!(&written[written.len() - PACKET_HEADER_SIZE..][..2], &[0x06, 0x01]);

        // The connection is usable again.
        let result = client.execute("select 1", &[]).unwrap();
        assert_eq!(result.rows().count(), 1);
    }

    #[test]
    fn test_cancel_requires_busy() {
        let mut client = logged_in(&[]);
        assert!(matches!(client.cancel(), Err(Error::InvalidState { .. })));
    }

    #[test]
    fn test_dropped_stream_recovers_with_cancel() {
        let mut ack = BytesMut::new();
        Done::new(DoneKind::Done)
            .with_status(DoneStatus::ATTENTION_ACK)
            .encode(&mut ack);
        let mut client = logged_in(&[&select_one(), &ack]);
        drop(client.execute_sql("select 1", &[]).unwrap());
        assert_eq!(client.state(), ConnectionState::Fetching);
        client.cancel().unwrap();
        assert_eq!(client.state(), ConnectionState::Open);
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut client = logged_in(&[]);
        client.close();
        client.close();
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(matches!(client.execute_sql("select 1", &[]), Err(Error::InvalidState { .. })));
    }
}
