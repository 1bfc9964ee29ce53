//! TDS packet header definitions.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// TDS packet header size in bytes.
pub const PACKET_HEADER_SIZE: usize = 8;

/// Largest declared packet length accepted from the server.
pub const MAX_PACKET_SIZE: usize = 65536;

/// Packet size requested at login and used until the server changes it.
pub const DEFAULT_PACKET_SIZE: usize = 512;

/// Smallest packet size a client may negotiate.
pub const MIN_PACKET_SIZE: usize = 512;

/// TDS 5.0 packet (buffer) type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Language command.
    Language = 0x01,
    /// Login record.
    Login = 0x02,
    /// Remote procedure call.
    Rpc = 0x03,
    /// Response to a command.
    Response = 0x04,
    /// Raw unformatted data.
    Unformatted = 0x05,
    /// Non-expedited attention request.
    Attention = 0x06,
    /// Bulk binary data.
    Bulk = 0x07,
    /// Open another logical channel.
    Setup = 0x08,
    /// Close a logical channel.
    Close = 0x09,
    /// Channel resource error.
    Error = 0x0A,
    /// Channel windowing acknowledgement.
    ProtocolAck = 0x0B,
    /// Echo request.
    Echo = 0x0C,
    /// Logout of a logical channel.
    Logout = 0x0D,
    /// End of parameters.
    EndParam = 0x0E,
    /// Tokenized request or response.
    Normal = 0x0F,
    /// Urgent tokenized request or response.
    Urgent = 0x10,
}

impl PacketType {
    /// Create a packet type from a raw byte value.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x01 => Ok(Self::Language),
            0x02 => Ok(Self::Login),
            0x03 => Ok(Self::Rpc),
            0x04 => Ok(Self::Response),
            0x05 => Ok(Self::Unformatted),
            0x06 => Ok(Self::Attention),
            0x07 => Ok(Self::Bulk),
            0x08 => Ok(Self::Setup),
            0x09 => Ok(Self::Close),
            0x0A => Ok(Self::Error),
            0x0B => Ok(Self::ProtocolAck),
            0x0C => Ok(Self::Echo),
            0x0D => Ok(Self::Logout),
            0x0E => Ok(Self::EndParam),
            0x0F => Ok(Self::Normal),
            0x10 => Ok(Self::Urgent),
            _ => Err(ProtocolError::InvalidPacketType(value)),
        }
    }

    /// Whether a server may send this packet type in a response stream.
    #[must_use]
    pub const fn is_response(self) -> bool {
        matches!(
            self,
            Self::Login | Self::Language | Self::Normal | Self::Response
        )
    }
}

bitflags! {
    /// TDS packet status flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PacketStatus: u8 {
        /// Normal packet, more packets to follow.
        const NORMAL = 0x00;
        /// End of message (last packet).
        const END_OF_MESSAGE = 0x01;
        /// Acknowledges an attention request.
        const ATTENTION_ACK = 0x02;
        /// Carries an attention request.
        const ATTENTION = 0x04;
        /// Event notification.
        const EVENT = 0x08;
        /// Sealed buffer.
        const SEAL = 0x10;
        /// Encrypted buffer.
        const ENCRYPT = 0x20;
        /// Symmetrically encrypted buffer.
        const SYM_ENCRYPT = 0x40;
    }
}

/// TDS packet header.
///
/// Every packet begins with an 8-byte header: type, status, the big-endian
/// total length, then four bytes of channel bookkeeping that this client
/// always writes as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Type of packet.
    pub packet_type: PacketType,
    /// Status flags.
    pub status: PacketStatus,
    /// Total packet length including header.
    pub length: u16,
    /// Logical channel.
    pub channel: u16,
    /// Packet number within the channel.
    pub packet_number: u8,
    /// Window size.
    pub window: u8,
}

impl PacketHeader {
    /// Create a new packet header.
    #[must_use]
    pub const fn new(packet_type: PacketType, status: PacketStatus, length: u16) -> Self {
        Self {
            packet_type,
            status,
            length,
            channel: 0,
            packet_number: 0,
            window: 0,
        }
    }

    /// Parse a packet header from bytes.
    ///
    /// Unknown status bits are retained rather than rejected.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        if src.remaining() < PACKET_HEADER_SIZE {
            return Err(ProtocolError::UnexpectedEof);
        }

        let packet_type = PacketType::from_u8(src.get_u8())?;
        let status = PacketStatus::from_bits_retain(src.get_u8());
        let length = src.get_u16();
        let channel = src.get_u16();
        let packet_number = src.get_u8();
        let window = src.get_u8();

        Ok(Self {
            packet_type,
            status,
            length,
            channel,
            packet_number,
            window,
        })
    }

    /// Encode the packet header to bytes.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.packet_type as u8);
        dst.put_u8(self.status.bits());
        dst.put_u16(self.length);
        dst.put_u16(self.channel);
        dst.put_u8(self.packet_number);
        dst.put_u8(self.window);
    }

    /// Encode the packet header to a new `Bytes` buffer.
    #[must_use]
    pub fn encode_to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE);
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Get the payload length (total length minus header).
    #[must_use]
    pub const fn payload_length(&self) -> usize {
        self.length.saturating_sub(PACKET_HEADER_SIZE as u16) as usize
    }

    /// Check if this is the last packet in a message.
    #[must_use]
    pub const fn is_end_of_message(&self) -> bool {
        self.status.contains(PacketStatus::END_OF_MESSAGE)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = PacketHeader::new(PacketType::Normal, PacketStatus::END_OF_MESSAGE, 100);

        let bytes = header.encode_to_bytes();
        assert_eq!(bytes.len(), PACKET_HEADER_SIZE);
        assert_eq!(&bytes[..], &[0x0F, 0x01, 0x00, 0x64, 0, 0, 0, 0]);

        let mut cursor = bytes.as_ref();
        let decoded = PacketHeader::decode(&mut cursor).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn test_length_is_big_endian() {
        let header = PacketHeader::new(PacketType::Login, PacketStatus::NORMAL, 512);
        let bytes = header.encode_to_bytes();
        assert_eq!(bytes[2], 0x02);
        assert_eq!(bytes[3], 0x00);
    }

    #[test]
    fn test_payload_length() {
        let header = PacketHeader::new(PacketType::Response, PacketStatus::END_OF_MESSAGE, 100);
        assert_eq!(header.payload_length(), 92);
    }

    #[test]
    fn test_unknown_status_bits_retained() {
        let raw = [0x04, 0x81, 0x00, 0x08, 0, 0, 0, 0];
        let header = PacketHeader::decode(&mut &raw[..]).unwrap();
        assert!(header.is_end_of_message());
        assert_eq!(header.status.bits(), 0x81);
    }

    #[test]
    fn test_packet_type_from_u8() {
        assert_eq!(PacketType::from_u8(0x0F).unwrap(), PacketType::Normal);
        assert_eq!(PacketType::from_u8(0x06).unwrap(), PacketType::Attention);
        assert!(PacketType::from_u8(0x00).is_err());
        assert!(PacketType::from_u8(0x12).is_err());
    }

    #[test]
    fn test_response_types() {
        assert!(PacketType::Response.is_response());
        assert!(PacketType::Normal.is_response());
        assert!(PacketType::Login.is_response());
        assert!(PacketType::Language.is_response());
        assert!(!PacketType::Attention.is_response());
        assert!(!PacketType::Bulk.is_response());
    }

    #[test]
    fn test_truncated_header() {
        let raw = [0x04, 0x01, 0x00];
        assert!(matches!(
            PacketHeader::decode(&mut &raw[..]),
            Err(ProtocolError::UnexpectedEof)
        ));
    }
}
