//! # tds5-testing
//!
//! Test infrastructure for TDS 5.0 client development.
//!
//! ## Features
//!
//! - Byte-exact server response construction with [`ResponseBuilder`]
//! - Blocking mock server that answers logins, language requests and
//!   attentions over a real socket
//! - Packet recording for assertions on what the client sent
//!
//! ## Example
//!
//! ```rust,ignore
//! use tds5_client::{Client, Config};
//! use tds5_testing::{MockResponse, MockServer};
//!
//! let server = MockServer::builder()
//!     .with_response("select 1", MockResponse::scalar_int(1))
//!     .build()?;
//!
//! let mut client = Client::new(Config::new().host(server.host()).port(server.port()))?;
//! client.open()?;
//! let result = client.execute("select 1", &[])?;
//! assert_eq!(result.rows().count(), 1);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod builder;
pub mod mock_server;

pub use builder::{MockColumn, ResponseBuilder, pack};
pub use mock_server::{MockResponse, MockServer, MockServerBuilder, MockServerError, RecordedPacket};
