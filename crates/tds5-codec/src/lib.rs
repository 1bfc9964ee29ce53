//! # tds5-codec
//!
//! Blocking framing layer for TDS 5.0 packet handling.
//!
//! This crate turns raw byte streams into TDS packets and back. Outgoing
//! logical messages are split into packets of the negotiated size; incoming
//! packets are stitched back into one continuous byte stream that the token
//! decoder reads from.
//!
//! ## Architecture
//!
//! ```text
//! request encoders → RequestWriter → TdsCodec (encode) → io::Write
//! io::Read → TdsCodec (decode) → ResponseReader → token decoder
//! ```
//!
//! `TdsCodec` implements tokio-util's `Decoder` and `Encoder` traits and is
//! driven synchronously over a `BytesMut`; no async runtime is involved.
//!
//! ### Split I/O
//!
//! [`Connection`] keeps the read and write halves apart so that an
//! attention packet can be sent while a response is only partly consumed.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod connection;
pub mod packet_codec;
pub mod reader;
pub mod writer;

pub use connection::Connection;
pub use packet_codec::{Packet, TdsCodec};
pub use reader::ResponseReader;
pub use writer::{MAX_WRITE_PACKET_SIZE, RequestWriter};
