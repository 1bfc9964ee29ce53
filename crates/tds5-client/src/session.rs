//! Per-connection session state.
//!
//! The session is the part of the client that tokens act upon: environment
//! changes update it, diagnostic messages accumulate in it, and the most
//! recent format token lives here as the decoding context for data rows.
//! It performs no I/O.

use std::sync::Arc;

use encoding_rs::Encoding;
use tds5_protocol::{
    EnvChange, EnvChangeType, Format, LoginAck, ProtocolError, ServerMessage, Token,
    encoding_for_charset,
};

use crate::error::Error;

/// Identity of the server, taken from the login acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    /// Server program name.
    pub program_name: String,
    /// Server program version, dotted.
    pub program_version: String,
    /// TDS version spoken by the server, dotted.
    pub tds_version: String,
}

impl From<&LoginAck> for ServerInfo {
    fn from(ack: &LoginAck) -> Self {
        Self {
            program_name: ack.program_name.clone(),
            program_version: ack.program_version_string(),
            tds_version: ack.tds_version_string(),
        }
    }
}

/// Session state shared by every request on a connection.
#[derive(Debug, Clone)]
pub struct Session {
    charset: String,
    encoding: &'static Encoding,
    database: Option<String>,
    language: Option<String>,
    packet_size: usize,
    server_info: Option<ServerInfo>,
    login_ack: Option<LoginAck>,
    current_format: Option<Arc<Format>>,
    messages: Vec<ServerMessage>,
    has_error: bool,
    end_of_response: bool,
    in_cancel: bool,
}

impl Session {
    /// Create a session for the given initial charset.
    pub fn new(charset: &str, packet_size: usize) -> Result<Self, Error> {
        let encoding = encoding_for_charset(charset)?;
        Ok(Self {
            charset: charset.to_string(),
            encoding,
            database: None,
            language: None,
            packet_size,
            server_info: None,
            login_ack: None,
            current_format: None,
            messages: Vec::new(),
            has_error: false,
            end_of_response: false,
            in_cancel: false,
        })
    }

    /// Current charset name.
    #[must_use]
    pub fn charset(&self) -> &str {
        &self.charset
    }

    /// Encoding used for character data.
    #[must_use]
    pub fn encoding(&self) -> &'static Encoding {
        self.encoding
    }

    /// Current database, once the server has reported one.
    #[must_use]
    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    /// Current session language, once the server has reported one.
    #[must_use]
    pub fn language(&self) -> Option<&str> {
        self.language.as_deref()
    }

    /// Negotiated packet size.
    #[must_use]
    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Server identity, after a successful login.
    #[must_use]
    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_ref()
    }

    /// The login acknowledgment, if one was received.
    #[must_use]
    pub fn login_ack(&self) -> Option<&LoginAck> {
        self.login_ack.as_ref()
    }

    /// Decoding context for row and parameter data.
    #[must_use]
    pub fn current_format(&self) -> Option<&Arc<Format>> {
        self.current_format.as_ref()
    }

    /// Messages received during the current request.
    #[must_use]
    pub fn messages(&self) -> &[ServerMessage] {
        &self.messages
    }

    /// Whether a message with severity above 10 arrived during the current request.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.has_error
    }

    /// Whether the end of the current response has been read.
    #[must_use]
    pub fn is_end_of_response(&self) -> bool {
        self.end_of_response
    }

    /// Whether an attention is outstanding.
    #[must_use]
    pub fn in_cancel(&self) -> bool {
        self.in_cancel
    }

    pub(crate) fn set_in_cancel(&mut self, in_cancel: bool) {
        self.in_cancel = in_cancel;
    }

    /// Clear per-request state before a new request is sent.
    pub fn reset_request(&mut self) {
        self.messages.clear();
        self.has_error = false;
        self.end_of_response = false;
        self.current_format = None;
    }

    /// Apply the side effects of a decoded token.
    ///
    /// Returns the new packet size when the server changed it, so the
    /// caller can pass it on to the request writer.
    pub fn apply(&mut self, token: &Token) -> Result<Option<usize>, ProtocolError> {
        let mut new_packet_size = None;
        match token {
            Token::Format(format) => self.current_format = Some(Arc::clone(format)),
            Token::EnvChange(env) => new_packet_size = self.apply_env_change(env)?,
            Token::Message(msg) => self.apply_message(msg),
            Token::LoginAck(ack) => {
                if ack.is_success() {
                    self.server_info = Some(ServerInfo::from(ack));
                }
                self.login_ack = Some(ack.clone());
            }
            _ => {}
        }
        if token.is_end_of_response() {
            // A format only describes rows of the response that carried it.
            self.end_of_response = true;
            self.current_format = None;
        }
        Ok(new_packet_size)
    }

    /// Apply an environment change.
    pub fn apply_env_change(&mut self, env: &EnvChange) -> Result<Option<usize>, ProtocolError> {
        let mut new_packet_size = None;
        for change in &env.changes {
            let value = change.new_value.clone().unwrap_or_default();
            match change.kind {
                EnvChangeType::Database => {
                    tracing::debug!(database = %value, "database changed");
                    self.database = Some(value);
                }
                EnvChangeType::Language => {
                    tracing::debug!(language = %value, "language changed");
                    self.language = Some(value);
                }
                EnvChangeType::Charset => {
                    let encoding = encoding_for_charset(&value).inspect_err(|_| {
                        tracing::error!(charset = %value, "server switched to unknown charset");
                    })?;
                    tracing::debug!(charset = %value, encoding = encoding.name(), "charset changed");
                    self.encoding = encoding;
                    self.charset = value;
                }
                EnvChangeType::PacketSize => {
                    let size = value
                        .trim()
                        .parse::<usize>()
                        .ok()
                        .filter(|size| *size > 0)
                        .ok_or_else(|| ProtocolError::InvalidPacketSize(value.clone()))?;
                    tracing::debug!(packet_size = size, "packet size changed");
                    self.packet_size = size;
                    new_packet_size = Some(size);
                }
                EnvChangeType::Other(kind) => {
                    tracing::warn!(kind, value = %value, "ignoring unknown environment change");
                }
            }
        }
        Ok(new_packet_size)
    }

    /// Record a diagnostic message.
    pub fn apply_message(&mut self, msg: &ServerMessage) {
        if msg.is_error() {
            tracing::error!(
                number = msg.number,
                severity = msg.severity,
                state = msg.state,
                line = msg.line,
                message = %msg.message,
                "server error"
            );
            self.has_error = true;
        } else {
            tracing::warn!(number = msg.number, message = %msg.message, "server message");
        }
        self.messages.push(msg.clone());
    }

    /// The error to raise for the current request, if any.
    ///
    /// Picks the highest-severity message; among equals the last one wins.
    #[must_use]
    pub fn server_error(&self) -> Option<Error> {
        if !self.has_error {
            return None;
        }
        self.messages
            .iter()
            .filter(|msg| msg.is_error())
            .reduce(|best, msg| if msg.severity >= best.severity { msg } else { best })
            .map(Error::from)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tds5_protocol::{
        Done, DoneKind, DoneStatus, EnvChangeEntry, FormatEntry, LoginStatus, TokenType, TypeId,
        TypeMetadata,
    };

    use super::*;

    fn session() -> Session {
        Session::new("iso_1", 512).unwrap()
    }

    fn env(kind: EnvChangeType, value: &str) -> Token {
        Token::EnvChange(EnvChange {
            changes: vec![EnvChangeEntry::new(kind, value, "")],
        })
    }

    #[test]
    fn test_initial_state() {
        let session = session();
        assert_eq!(session.charset(), "iso_1");
        assert_eq!(session.encoding(), encoding_rs::WINDOWS_1252);
        assert_eq!(session.packet_size(), 512);
        assert!(session.database().is_none());
        assert!(!session.is_error());
        assert!(Session::new("nope", 512).is_err());
    }

    #[test]
    fn test_env_changes() {
        let mut session = session();
        assert_eq!(session.apply(&env(EnvChangeType::Database, "pubs2")).unwrap(), None);
        assert_eq!(session.database(), Some("pubs2"));

        session.apply(&env(EnvChangeType::Language, "us_english")).unwrap();
        assert_eq!(session.language(), Some("us_english"));

        session.apply(&env(EnvChangeType::Charset, "utf8")).unwrap();
        assert_eq!(session.charset(), "utf8");
        assert_eq!(session.encoding(), encoding_rs::UTF_8);

        assert_eq!(session.apply(&env(EnvChangeType::PacketSize, "2048")).unwrap(), Some(2048));
        assert_eq!(session.packet_size(), 2048);

        session.apply(&env(EnvChangeType::Other(42), "x")).unwrap();
    }

    #[test]
    fn test_bad_env_changes() {
        let mut session = session();
        assert!(matches!(
            session.apply(&env(EnvChangeType::Charset, "martian")),
            Err(ProtocolError::UnknownCharset(_))
        ));
        assert_eq!(session.charset(), "iso_1");
        assert!(matches!(
            session.apply(&env(EnvChangeType::PacketSize, "big")),
            Err(ProtocolError::InvalidPacketSize(_))
        ));
        assert_eq!(session.packet_size(), 512);
    }

    #[test]
    fn test_messages_and_error_selection() {
        let mut session = session();
        session.apply(&Token::Message(ServerMessage::new(5701, 10, "changed db"))).unwrap();
        assert!(!session.is_error());
        assert!(session.server_error().is_none());

        session.apply(&Token::Message(ServerMessage::new(1, 14, "first"))).unwrap();
        session.apply(&Token::Message(ServerMessage::new(2, 16, "second"))).unwrap();
        session.apply(&Token::Message(ServerMessage::new(3, 16, "third"))).unwrap();
        session.apply(&Token::Message(ServerMessage::new(4, 11, "fourth"))).unwrap();
        assert!(session.is_error());
        assert_eq!(session.messages().len(), 5);
        assert!(session.server_error().unwrap().is_server_error(3));

        session.reset_request();
        assert!(!session.is_error());
        assert!(session.messages().is_empty());
    }

    #[test]
    fn test_end_of_response_and_login_ack() {
        let mut session = session();
        session
            .apply(&Token::Done(Done::new(DoneKind::Done).with_status(DoneStatus::MORE)))
            .unwrap();
        assert!(!session.is_end_of_response());
        session.apply(&Token::Done(Done::new(DoneKind::Done))).unwrap();
        assert!(session.is_end_of_response());

        let ack = LoginAck {
            status: LoginStatus::Succeed,
            tds_version: [5, 0, 0, 0],
            program_name: "sql server".into(),
            program_version: [15, 7, 0, 0],
        };
        session.apply(&Token::LoginAck(ack)).unwrap();
        let info = session.server_info().unwrap();
        assert_eq!(info.program_name, "sql server");
        assert_eq!(info.program_version, "15.7.0.0");
        assert_eq!(info.tds_version, "5.0.0.0");
    }

    #[test]
    fn test_format_ends_with_response() {
        let mut session = session();
        let format = Arc::new(Format::new(
            TokenType::RowFmt,
            vec![FormatEntry::new("n", TypeId::Int4, TypeMetadata::default())],
        ));
        session.apply(&Token::Format(Arc::clone(&format))).unwrap();
        session
            .apply(&Token::Done(Done::new(DoneKind::Done).with_status(DoneStatus::MORE)))
            .unwrap();
        assert!(session.current_format().is_some());

        session.apply(&Token::Done(Done::new(DoneKind::Done))).unwrap();
        assert!(session.current_format().is_none());

        session.apply(&Token::Format(format)).unwrap();
        session.reset_request();
        assert!(session.current_format().is_none());
    }
}
