//! # tds5-client
//!
//! Blocking TDS 5.0 client for Sybase Adaptive Server Enterprise.
//!
//! This is the public API surface of the workspace. It opens a TCP
//! connection, logs in, submits SQL text with bound parameters, and hands
//! responses back as a lazy stream of decoded tokens.
//!
//! ## Features
//!
//! - **Blocking I/O**: plain `std::net`, no async runtime
//! - **Lazy responses**: [`ResponseStream`] is an `Iterator` that performs
//!   one token read per `next()`
//! - **Session tracking**: database, language, charset and packet size
//!   changes are applied before the token that carries them is returned
//! - **Cancellation**: attention requests with a drain to the server's
//!   acknowledgment
//!
//! ## Connection States
//!
//! ```text
//! Closed -> Connecting (via connect())
//! Connecting -> Open (via login())
//! Open -> Executing -> Fetching (via execute_sql())
//! Fetching -> Open (response drained, or cancel())
//! any -> Broken (protocol or transport failure)
//! any -> Closed (via close())
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use tds5_client::{Client, Config, Parameter, Token};
//!
//! let config = Config::new()
//!     .host("dbhost")
//!     .port(5000)
//!     .credentials("sa", "secret")
//!     .database("pubs2");
//!
//! let mut client = Client::new(config)?;
//! client.open()?;
//!
//! let mut stream = client.execute_sql(
//!     "select title from titles where price > @p",
//!     &[Parameter::new("p", 20.0f64)],
//! )?;
//! for token in stream.by_ref() {
//!     if let Token::Row(row) = token? {
//!         let title: String = row.get(0)?;
//!         println!("{title}");
//!     }
//! }
//! stream.finish()?;
//!
//! client.close();
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod client;
pub mod config;
pub mod error;
pub mod query;
pub mod session;
pub mod state;
pub mod stream;

pub use client::Client;
pub use config::{Config, TimeoutConfig};
pub use error::{Error, Result};
pub use query::QueryResult;
pub use session::{ServerInfo, Session};
pub use state::ConnectionState;
pub use stream::ResponseStream;
pub use tds5_protocol::{DataRow, Format, Parameter, ServerMessage, Token};
pub use tds5_types::{FromSql, SqlValue, ToSql};
