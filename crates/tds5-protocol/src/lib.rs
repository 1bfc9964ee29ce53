//! # tds5-protocol
//!
//! Pure implementation of the TDS 5.0 (Tabular Data Stream) protocol spoken
//! by Sybase Adaptive Server Enterprise.
//!
//! This crate provides packet headers, token decoding, the wire type codec
//! and the request encoders for login and language commands.
//!
//! ## Design Philosophy
//!
//! This crate is IO-agnostic. Decoders pull bytes through the [`TdsRead`]
//! trait and encoders push them through [`TdsWrite`], so the same code runs
//! over an in-memory slice or a framed socket. Higher-level crates provide
//! the packet framing and the connection itself.
//!
//! ## Example
//!
//! ```rust
//! use tds5_protocol::{PacketHeader, PacketStatus, PacketType};
//!
//! let header = PacketHeader::new(PacketType::Language, PacketStatus::END_OF_MESSAGE, 100);
//! assert_eq!(header.payload_length(), 92);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod codec;
pub mod datatype;
pub mod error;
pub mod language;
pub mod login;
pub mod packet;
pub mod token;
pub mod types;

pub use codec::{TdsRead, TdsWrite, decode_text, encode_text, encoding_for_charset};
pub use datatype::TypeMetadata;
pub use error::ProtocolError;
pub use language::{LanguageRequest, ParamStatus, Parameter};
pub use login::{LOGIN_RECORD_SIZE, LoginRecord};
pub use packet::{
    DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE, MIN_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader,
    PacketStatus, PacketType,
};
pub use token::{
    Capability, Control, DataRow, Done, DoneKind, DoneStatus, EnvChange, EnvChangeEntry,
    EnvChangeType, Format, FormatEntry, FormatKind, LoginAck, LoginStatus, ServerMessage, Token,
    TokenType, TransactionState, read_token,
};
pub use types::{ColumnStatus, TypeDescriptor, TypeId};
