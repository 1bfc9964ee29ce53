//! TDS packet codec implementation.
//!
//! The codec implements tokio-util's `Decoder` and `Encoder` over a plain
//! `BytesMut`; the blocking reader and writer drive it synchronously.

use bytes::{BufMut, Bytes, BytesMut};
use tds5_protocol::ProtocolError;
use tds5_protocol::packet::{MAX_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader, PacketStatus, PacketType};
use tokio_util::codec::{Decoder, Encoder};

/// A TDS packet with header and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet header.
    pub header: PacketHeader,
    /// Packet payload (excluding header).
    pub payload: Bytes,
}

impl Packet {
    /// Create a new packet with the given header and payload.
    #[must_use]
    pub fn new(header: PacketHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Create a packet of `packet_type` whose header length is filled in on
    /// encode.
    #[must_use]
    pub fn with_payload(packet_type: PacketType, last: bool, payload: Bytes) -> Self {
        let status = if last {
            PacketStatus::END_OF_MESSAGE
        } else {
            PacketStatus::NORMAL
        };
        Self::new(PacketHeader::new(packet_type, status, 0), payload)
    }

    /// Get the total packet size including header.
    #[must_use]
    pub fn total_size(&self) -> usize {
        PACKET_HEADER_SIZE + self.payload.len()
    }

    /// Check if this is the last packet in a message.
    #[must_use]
    pub fn is_end_of_message(&self) -> bool {
        self.header.is_end_of_message()
    }
}

/// TDS packet codec.
///
/// By default only packet types a server may send in a response are
/// accepted on decode; [`TdsCodec::any_type`] lifts that restriction for
/// the server side of a connection.
#[derive(Debug, Clone)]
pub struct TdsCodec {
    /// Maximum packet size to accept.
    max_packet_size: usize,
    /// Accept any known packet type on decode.
    any_type: bool,
}

impl TdsCodec {
    /// Create a new TDS codec with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_packet_size: MAX_PACKET_SIZE,
            any_type: false,
        }
    }

    /// Create a codec that decodes request packets as well as responses.
    #[must_use]
    pub fn any_type() -> Self {
        Self {
            any_type: true,
            ..Self::new()
        }
    }

    /// Create a new TDS codec with a custom maximum packet size.
    #[must_use]
    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.clamp(PACKET_HEADER_SIZE, MAX_PACKET_SIZE);
        self
    }

    /// Maximum packet size accepted on decode.
    #[must_use]
    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Validate a header's type tag and declared length.
    fn check_header(&self, src: &[u8]) -> Result<usize, ProtocolError> {
        let packet_type = PacketType::from_u8(src[0])?;
        if !self.any_type && !packet_type.is_response() {
            return Err(ProtocolError::UnexpectedPacketType(packet_type));
        }
        let length = usize::from(u16::from_be_bytes([src[2], src[3]]));
        if !(PACKET_HEADER_SIZE..=self.max_packet_size).contains(&length) {
            return Err(ProtocolError::InvalidPacketLength(length));
        }
        Ok(length)
    }
}

impl Default for TdsCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for TdsCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least a header to proceed
        if src.len() < PACKET_HEADER_SIZE {
            return Ok(None);
        }

        let length = self.check_header(src)?;

        // Check if we have the complete packet
        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        let mut packet_bytes = src.split_to(length);
        let header = PacketHeader::decode(&mut packet_bytes.split_to(PACKET_HEADER_SIZE))?;
        let payload = packet_bytes.freeze();

        tracing::trace!(
            packet_type = ?header.packet_type,
            length = length,
            is_eom = header.is_end_of_message(),
            "received TDS packet"
        );

        Ok(Some(Packet::new(header, payload)))
    }
}

impl Encoder<Packet> for TdsCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let total_length = item.total_size();
        if total_length > usize::from(u16::MAX) {
            return Err(ProtocolError::InvalidPacketLength(total_length));
        }

        dst.reserve(total_length);

        // The channel, packet number and window bytes are always zero.
        let header = PacketHeader::new(item.header.packet_type, item.header.status, total_length as u16);
        header.encode(dst);
        dst.put_slice(&item.payload);

        tracing::trace!(
            packet_type = ?header.packet_type,
            length = total_length,
            is_eom = header.is_end_of_message(),
            "sent TDS packet"
        );

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn raw_packet(packet_type: u8, status: u8, payload: &[u8]) -> BytesMut {
        let mut data = BytesMut::new();
        data.put_u8(packet_type);
        data.put_u8(status);
        data.put_u16((PACKET_HEADER_SIZE + payload.len()) as u16);
        data.put_u16(0);
        data.put_u8(0);
        data.put_u8(0);
        data.put_slice(payload);
        data
    }

    #[test]
    fn test_decode_packet() {
        let mut codec = TdsCodec::new();
        let mut data = raw_packet(PacketType::Response as u8, 0x01, b"test");

        let packet = codec.decode(&mut data).unwrap().unwrap();
        assert_eq!(packet.header.packet_type, PacketType::Response);
        assert!(packet.is_end_of_message());
        assert_eq!(&packet.payload[..], b"test");
        assert!(data.is_empty());
    }

    #[test]
    fn test_encode_packet_zeroes_reserved_bytes() {
        let mut codec = TdsCodec::new();
        let mut header = PacketHeader::new(PacketType::Language, PacketStatus::END_OF_MESSAGE, 0);
        header.channel = 7;
        header.packet_number = 3;
        let packet = Packet::new(header, Bytes::from_static(b"test"));

        let mut dst = BytesMut::new();
        codec.encode(packet, &mut dst).unwrap();

        assert_eq!(&dst[..], &[0x01, 0x01, 0x00, 0x0C, 0, 0, 0, 0, b't', b'e', b's', b't']);
    }

    #[test]
    fn test_incomplete_packet() {
        let mut codec = TdsCodec::new();
        let mut data = raw_packet(PacketType::Normal as u8, 0x01, b"test");
        data.truncate(10);

        assert!(codec.decode(&mut data).unwrap().is_none());
        assert_eq!(data.len(), 10);
    }

    #[test]
    fn test_rejects_request_type_from_server() {
        let mut codec = TdsCodec::new();
        let mut data = raw_packet(PacketType::Attention as u8, 0x01, b"");
        assert!(matches!(
            codec.decode(&mut data),
            Err(ProtocolError::UnexpectedPacketType(PacketType::Attention))
        ));

        let mut server = TdsCodec::any_type();
        let mut data = raw_packet(PacketType::Attention as u8, 0x01, b"");
        assert!(server.decode(&mut data).unwrap().is_some());
    }

    #[test]
    fn test_rejects_unknown_type() {
        let mut codec = TdsCodec::new();
        let mut data = raw_packet(0x55, 0x01, b"");
        assert!(matches!(
            codec.decode(&mut data),
            Err(ProtocolError::InvalidPacketType(0x55))
        ));
    }

    #[test]
    fn test_rejects_short_length() {
        let mut codec = TdsCodec::new();
        let mut data = raw_packet(PacketType::Response as u8, 0x01, b"");
        data[3] = 4;
        assert!(matches!(
            codec.decode(&mut data),
            Err(ProtocolError::InvalidPacketLength(4))
        ));
    }

    #[test]
    fn test_rejects_oversized_for_limit() {
        let mut codec = TdsCodec::new().with_max_packet_size(512);
        let mut data = raw_packet(PacketType::Response as u8, 0x01, &[0u8; 600]);
        assert!(matches!(
            codec.decode(&mut data),
            Err(ProtocolError::InvalidPacketLength(608))
        ));
    }
}
