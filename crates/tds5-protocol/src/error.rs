//! Protocol-level error types.

use tds5_types::TypeError;
use thiserror::Error;

use crate::packet::PacketType;
use crate::token::TokenType;
use crate::types::TypeId;

/// Errors raised while framing, decoding or encoding the TDS byte stream.
///
/// Apart from [`ProtocolError::Type`] and [`ProtocolError::TokenTooLarge`],
/// which are raised before anything is written, every variant leaves the
/// stream in an unknown position and the connection should be treated as
/// unusable.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Packet header carries a type tag outside the protocol.
    #[error("invalid packet type 0x{0:02X}")]
    InvalidPacketType(u8),

    /// Packet type is valid but not expected in a response stream.
    #[error("unexpected packet type {0:?} in response")]
    UnexpectedPacketType(PacketType),

    /// Declared packet length is outside the allowed range.
    #[error("invalid network packet length {0}")]
    InvalidPacketLength(usize),

    /// Token tag is not in the token table.
    #[error("unknown token type 0x{0:02X}")]
    UnknownToken(u8),

    /// Token has no builder and its length depends on a format.
    #[error("unknown length of token {0:?}")]
    UnsizedToken(TokenType),

    /// Wire type code is not in the type table.
    #[error("unknown data type 0x{0:02X}")]
    UnknownDataType(u8),

    /// A self-describing value carried a length its type does not allow.
    #[error("invalid data length {length} for {type_id:?}")]
    InvalidDataLength {
        /// Wire type being decoded.
        type_id: TypeId,
        /// Offending length.
        length: usize,
    },

    /// A data token arrived with no preceding format token.
    #[error("no format available for {0:?}")]
    MissingFormat(TokenType),

    /// Capability token markers or lengths are malformed.
    #[error("invalid capability token: {0}")]
    InvalidCapability(String),

    /// Server switched to a charset with no known encoding.
    #[error("unknown charset {0:?}")]
    UnknownCharset(String),

    /// Server announced a packet size that is not a number in range.
    #[error("invalid packet size {0:?}")]
    InvalidPacketSize(String),

    /// An encoded token or one of its counts does not fit its length prefix.
    #[error("{token_type:?} token too large: {length}")]
    TokenTooLarge {
        /// Token being encoded.
        token_type: TokenType,
        /// Length or count that overflowed.
        length: usize,
    },

    /// A token body ended before all its fields were read.
    #[error("unexpected end of data")]
    UnexpectedEof,

    /// Peer closed the connection mid-read.
    #[error("connection closed")]
    ConnectionClosed,

    /// Transport failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Value could not be converted to or from its wire form.
    #[error(transparent)]
    Type(#[from] TypeError),
}
