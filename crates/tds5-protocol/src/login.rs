//! TDS 5.0 login record construction.
//!
//! The login record is a fixed 568-byte structure sent in a single LOGIN
//! packet. Every string occupies a fixed-width field followed by a 1-byte
//! count of the meaningful bytes; surplus bytes are zero.
//!
//! ## Security Note
//!
//! The password is sent in clear text, twice: once in the user fields and
//! once in the remote password block.

use bytes::{Bytes, BytesMut};
use encoding_rs::Encoding;

use crate::codec::{TdsWrite, encode_text};
use crate::error::ProtocolError;

/// Size of an encoded login record.
pub const LOGIN_RECORD_SIZE: usize = 568;

/// Width of the name fields.
const NAME_LEN: usize = 30;

/// Width of the remote password field.
const REMOTE_PASSWORD_LEN: usize = 253;

/// Width of the client library field.
const LIBRARY_LEN: usize = 10;

/// Width of the packet size field.
const PACKET_SIZE_LEN: usize = 6;

/// Client library name reported to the server.
pub const CLIENT_LIBRARY: &str = "tds5";

/// TDS protocol version requested.
pub const TDS_VERSION: [u8; 4] = [5, 0, 0, 0];

/// Client program version reported to the server.
pub const PROGRAM_VERSION: [u8; 4] = [5, 0, 0, 0];

/// Byte order and format options: int2, int4, char, float, date, use-db
/// notify, disallow dump/load, interface, network type.
const FORMAT_OPTIONS: [u8; 9] = [3, 1, 6, 10, 9, 1, 1, 0, 0];

/// Login record sent to open a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRecord {
    /// Client host name.
    pub hostname: String,
    /// Login name.
    pub username: String,
    /// Login password.
    pub password: String,
    /// Client process id, as text.
    pub process_id: String,
    /// Client application name.
    pub app_name: String,
    /// Server name.
    pub server_name: String,
    /// Session language; empty for the server default.
    pub language: String,
    /// Requested session character set.
    pub charset: String,
    /// Requested packet size.
    pub packet_size: u32,
}

impl Default for LoginRecord {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            username: String::new(),
            password: String::new(),
            process_id: std::process::id().to_string(),
            app_name: CLIENT_LIBRARY.to_string(),
            server_name: String::new(),
            language: String::new(),
            charset: "iso_1".to_string(),
            packet_size: 512,
        }
    }
}

impl LoginRecord {
    /// Create a new login record with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the login credentials.
    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Set the client host name.
    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Set the application name.
    #[must_use]
    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = app_name.into();
        self
    }

    /// Set the server name.
    #[must_use]
    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = server_name.into();
        self
    }

    /// Set the session language.
    #[must_use]
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    /// Set the character set.
    #[must_use]
    pub fn with_charset(mut self, charset: impl Into<String>) -> Self {
        self.charset = charset.into();
        self
    }

    /// Set the requested packet size.
    #[must_use]
    pub fn with_packet_size(mut self, packet_size: u32) -> Self {
        self.packet_size = packet_size;
        self
    }

    /// Write the login record to `dst`, encoding strings with `encoding`.
    pub fn write(&self, dst: &mut (impl TdsWrite + ?Sized), encoding: &'static Encoding) -> Result<(), ProtocolError> {
        let text = |s: &str| encode_text(encoding, s).into_owned();
        let password = text(&self.password);

        dst.write_fixed_string(&text(&self.hostname), NAME_LEN)?;
        dst.write_fixed_string(&text(&self.username), NAME_LEN)?;
        dst.write_fixed_string(&password, NAME_LEN)?;
        dst.write_fixed_string(&text(&self.process_id), NAME_LEN)?;

        dst.write_bytes(&FORMAT_OPTIONS)?;
        dst.write_zeros(7)?;

        dst.write_fixed_string(&text(&self.app_name), NAME_LEN)?;
        dst.write_fixed_string(&text(&self.server_name), NAME_LEN)?;

        // Remote password block: server name length, password length, password.
        let remote = &password[..password.len().min(REMOTE_PASSWORD_LEN)];
        dst.write_u8(0)?;
        dst.write_u8(remote.len() as u8)?;
        dst.write_padded(remote, REMOTE_PASSWORD_LEN)?;
        dst.write_u8((remote.len() + 2) as u8)?;

        dst.write_bytes(&TDS_VERSION)?;
        dst.write_fixed_string(CLIENT_LIBRARY.as_bytes(), LIBRARY_LEN)?;
        dst.write_bytes(&PROGRAM_VERSION)?;

        // No short conversion, flt4 and date4 formats.
        dst.write_bytes(&[0, 0x0D, 0x11])?;

        dst.write_fixed_string(&text(&self.language), NAME_LEN)?;
        dst.write_u8(1)?;

        // Security label hierarchy, encryption, components and spares.
        dst.write_zeros(3)?;
        dst.write_zeros(8)?;
        dst.write_zeros(2)?;

        dst.write_fixed_string(&text(&self.charset), NAME_LEN)?;
        dst.write_u8(1)?;

        dst.write_fixed_string(self.packet_size.to_string().as_bytes(), PACKET_SIZE_LEN)?;
        dst.write_zeros(4)
    }

    /// Encode the login record to bytes.
    pub fn encode(&self, encoding: &'static Encoding) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(LOGIN_RECORD_SIZE);
        self.write(&mut buf, encoding)?;
        Ok(buf.freeze())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const ENC: &Encoding = encoding_rs::WINDOWS_1252;

    fn sample() -> LoginRecord {
        LoginRecord::new()
            .with_hostname("client01")
            .with_credentials("sa", "secret")
            .with_app_name("report")
            .with_server_name("ASE")
            .with_charset("iso_1")
            .with_packet_size(2048)
    }

    fn field(buf: &[u8], offset: usize, width: usize) -> &[u8] {
        let len = usize::from(buf[offset + width]);
        &buf[offset..offset + len]
    }

    #[test]
    fn test_record_is_fixed_size() {
        let record = sample().encode(ENC).unwrap();
        assert_eq!(record.len(), LOGIN_RECORD_SIZE);

        let long = LoginRecord::new()
            .with_hostname("h".repeat(100))
            .with_credentials("u".repeat(100), "p".repeat(300))
            .encode(ENC)
            .unwrap();
        assert_eq!(long.len(), LOGIN_RECORD_SIZE);
    }

    #[test]
    fn test_user_fields() {
        let record = sample().encode(ENC).unwrap();
        assert_eq!(field(&record, 0, 30), b"client01");
        assert_eq!(field(&record, 31, 30), b"sa");
        assert_eq!(field(&record, 62, 30), b"secret");
        // Padding after the meaningful bytes is zero.
        assert!(record[31 + 2..61].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_format_options() {
        let record = sample().encode(ENC).unwrap();
        assert_eq!(&record[124..133], &FORMAT_OPTIONS);
        assert!(record[133..140].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_app_and_server() {
        let record = sample().encode(ENC).unwrap();
        assert_eq!(field(&record, 140, 30), b"report");
        assert_eq!(field(&record, 171, 30), b"ASE");
    }

    #[test]
    fn test_remote_password_block() {
        let record = sample().encode(ENC).unwrap();
        assert_eq!(record[202], 0);
        assert_eq!(record[203], 6);
        assert_eq!(&record[204..210], b"secret");
        assert_eq!(record[457], 8);
    }

    #[test]
    fn test_versions_and_library() {
        let record = sample().encode(ENC).unwrap();
        assert_eq!(&record[458..462], &TDS_VERSION);
        assert_eq!(field(&record, 462, 10), b"tds5");
        assert_eq!(&record[473..477], &PROGRAM_VERSION);
        assert_eq!(&record[477..480], &[0, 0x0D, 0x11]);
    }

    #[test]
    fn test_language_charset_packet_size() {
        let record = sample().encode(ENC).unwrap();
        assert_eq!(field(&record, 480, 30), b"");
        assert_eq!(record[511], 1);
        assert!(record[512..525].iter().all(|&b| b == 0));
        assert_eq!(field(&record, 525, 30), b"iso_1");
        assert_eq!(record[556], 1);
        assert_eq!(field(&record, 557, 6), b"2048");
        assert!(record[564..568].iter().all(|&b| b == 0));
    }
}
