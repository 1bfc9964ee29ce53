//! Client configuration.

use std::time::Duration;

use tds5_protocol::LoginRecord;
use tds5_protocol::encoding_for_charset;
use tds5_protocol::packet::{DEFAULT_PACKET_SIZE, MIN_PACKET_SIZE};
use tds5_codec::MAX_WRITE_PACKET_SIZE;

use crate::error::Error;

/// Width of the fixed login record name fields.
const LOGIN_FIELD_LEN: usize = 30;

/// Timeout configuration for socket operations.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Time to establish the TCP connection (default: 15s).
    pub connect_timeout: Duration,
    /// Read timeout applied to the socket (default: none, block forever).
    pub read_timeout: Option<Duration>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            read_timeout: None,
        }
    }
}

impl TimeoutConfig {
    /// Create a new timeout configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the TCP connection timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the socket read timeout.
    #[must_use]
    pub fn read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }
}

/// Configuration for a TDS 5.0 connection.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host name or IP address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Login name.
    pub username: String,
    /// Login password.
    pub password: String,
    /// Database to switch to after login.
    pub database: Option<String>,
    /// Client host name reported in the login record.
    pub client_hostname: String,
    /// Client process id reported in the login record.
    pub process_id: String,
    /// Application name.
    pub application_name: String,
    /// Server name reported in the login record.
    pub server_name: String,
    /// Session language; empty for the server default.
    pub language: String,
    /// Requested character set.
    pub charset: String,
    /// Requested packet size.
    pub packet_size: usize,
    /// SQL executed once right after login.
    pub init_sql: Option<String>,
    /// Timeout configuration.
    pub timeouts: TimeoutConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5000,
            username: String::new(),
            password: String::new(),
            database: None,
            client_hostname: String::new(),
            process_id: std::process::id().to_string(),
            application_name: "tds5".to_string(),
            server_name: String::new(),
            language: String::new(),
            charset: "iso_1".to_string(),
            packet_size: DEFAULT_PACKET_SIZE,
            init_sql: None,
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl Config {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the server host.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the server port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the login credentials.
    #[must_use]
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Set the database to use after login.
    #[must_use]
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set the client host name.
    #[must_use]
    pub fn client_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.client_hostname = hostname.into();
        self
    }

    /// Set the application name.
    #[must_use]
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }

    /// Set the server name.
    #[must_use]
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    /// Set the session language.
    #[must_use]
    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    /// Set the character set.
    #[must_use]
    pub fn charset(mut self, charset: impl Into<String>) -> Self {
        self.charset = charset.into();
        self
    }

    /// Set the requested packet size, clamped to `[512, 65535]`.
    #[must_use]
    pub fn packet_size(mut self, size: usize) -> Self {
        self.packet_size = size.clamp(MIN_PACKET_SIZE, MAX_WRITE_PACKET_SIZE);
        self
    }

    /// Set SQL to run once after login.
    #[must_use]
    pub fn init_sql(mut self, sql: impl Into<String>) -> Self {
        self.init_sql = Some(sql.into());
        self
    }

    /// Set the TCP connection timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.connect_timeout = timeout;
        self
    }

    /// Set the timeout configuration.
    #[must_use]
    pub fn timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Check that the configuration can produce a valid login record.
    pub fn validate(&self) -> Result<(), Error> {
        if self.host.is_empty() {
            return Err(Error::Config("host cannot be empty".into()));
        }
        encoding_for_charset(&self.charset)
            .map_err(|_| Error::Config(format!("unknown charset '{}'", self.charset)))?;

        let fields = [
            ("username", &self.username),
            ("password", &self.password),
            ("client hostname", &self.client_hostname),
            ("application name", &self.application_name),
            ("server name", &self.server_name),
            ("language", &self.language),
        ];
        for (name, value) in fields {
            if value.len() > LOGIN_FIELD_LEN {
                return Err(Error::Config(format!(
                    "{name} is {} bytes, login field holds {LOGIN_FIELD_LEN}",
                    value.len()
                )));
            }
        }
        Ok(())
    }

    /// Build the login record for this configuration.
    #[must_use]
    pub fn login_record(&self) -> LoginRecord {
        let mut login = LoginRecord::new()
            .with_credentials(&self.username, &self.password)
            .with_hostname(&self.client_hostname)
            .with_app_name(&self.application_name)
            .with_server_name(&self.server_name)
            .with_language(&self.language)
            .with_charset(&self.charset)
            .with_packet_size(self.packet_size as u32);
        login.process_id.clone_from(&self.process_id);
        login
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 5000);
        assert_eq!(config.charset, "iso_1");
        assert_eq!(config.application_name, "tds5");
        assert_eq!(config.packet_size, 512);
        assert_eq!(config.process_id, std::process::id().to_string());
        assert!(config.database.is_none());
        assert!(config.init_sql.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_timeout_config_defaults() {
        let timeouts = TimeoutConfig::default();
        assert_eq!(timeouts.connect_timeout, Duration::from_secs(15));
        assert!(timeouts.read_timeout.is_none());
    }

    #[test]
    fn test_timeout_config_builder() {
        let config = Config::new().timeouts(
            TimeoutConfig::new()
                .connect_timeout(Duration::from_secs(3))
                .read_timeout(Some(Duration::from_secs(60))),
        );
        assert_eq!(config.timeouts.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.timeouts.read_timeout, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_packet_size_is_clamped() {
        assert_eq!(Config::new().packet_size(100).packet_size, 512);
        assert_eq!(Config::new().packet_size(4096).packet_size, 4096);
        assert_eq!(Config::new().packet_size(1 << 20).packet_size, 65535);
    }

    #[test]
    fn test_validate_rejects_empty_host() {
        let err = Config::new().host("").validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_validate_rejects_unknown_charset() {
        let err = Config::new().charset("klingon").validate().unwrap_err();
        assert!(err.to_string().contains("klingon"));
    }

    #[test]
    fn test_validate_rejects_long_fields() {
        let long = "x".repeat(31);
        assert!(Config::new().credentials(&long, "pw").validate().is_err());
        assert!(Config::new().application_name(&long).validate().is_err());
        assert!(Config::new().language(&long).validate().is_err());
        assert!(Config::new().credentials("x".repeat(30), "pw").validate().is_ok());
    }

    #[test]
    fn test_login_record_from_config() {
        let config = Config::new()
            .credentials("sa", "secret")
            .client_hostname("box")
            .application_name("report")
            .charset("utf8")
            .packet_size(2048);
        let login = config.login_record();
        assert_eq!(login.username, "sa");
        assert_eq!(login.password, "secret");
        assert_eq!(login.hostname, "box");
        assert_eq!(login.app_name, "report");
        assert_eq!(login.charset, "utf8");
        assert_eq!(login.packet_size, 2048);
        assert_eq!(login.process_id, config.process_id);
    }
}
