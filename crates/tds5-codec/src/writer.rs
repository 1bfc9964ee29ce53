//! Blocking request framer.
//!
//! Bytes written through [`TdsWrite`] accumulate in a buffer sized to the
//! negotiated packet size. A full buffer is sent as a non-final packet;
//! [`RequestWriter::end_message`] sends the remainder as the final packet.

use std::io::Write;

use bytes::BytesMut;
use tds5_protocol::packet::{DEFAULT_PACKET_SIZE, MIN_PACKET_SIZE, PACKET_HEADER_SIZE, PacketType};
use tds5_protocol::{ProtocolError, TdsWrite};
use tokio_util::codec::Encoder;

use crate::packet_codec::{Packet, TdsCodec};

/// Largest packet size the 16-bit header length can declare.
pub const MAX_WRITE_PACKET_SIZE: usize = u16::MAX as usize;

fn clamp_packet_size(size: usize) -> usize {
    size.clamp(MIN_PACKET_SIZE, MAX_WRITE_PACKET_SIZE)
}

/// Splits logical request messages into packets and writes them to `W`.
pub struct RequestWriter<W> {
    inner: W,
    codec: TdsCodec,
    /// Payload of the packet being assembled.
    buf: BytesMut,
    /// Scratch space for the encoded packet.
    out: BytesMut,
    /// Packet size the buffer is currently sized for.
    packet_size: usize,
    /// Negotiated size to adopt at the next flush.
    pending_size: Option<usize>,
    message_type: PacketType,
}

impl<W: Write> RequestWriter<W> {
    /// Create a writer using the default packet size.
    pub fn new(inner: W) -> Self {
        Self::with_packet_size(inner, DEFAULT_PACKET_SIZE)
    }

    /// Create a writer with a specific packet size, clamped to
    /// `[512, 65535]`.
    pub fn with_packet_size(inner: W, packet_size: usize) -> Self {
        let packet_size = clamp_packet_size(packet_size);
        Self {
            inner,
            codec: TdsCodec::new(),
            buf: BytesMut::with_capacity(packet_size - PACKET_HEADER_SIZE),
            out: BytesMut::with_capacity(packet_size),
            packet_size,
            pending_size: None,
            message_type: PacketType::Normal,
        }
    }

    /// Set the packet type for the next message.
    pub fn set_message_type(&mut self, packet_type: PacketType) {
        self.message_type = packet_type;
    }

    /// Current packet type.
    #[must_use]
    pub fn message_type(&self) -> PacketType {
        self.message_type
    }

    /// Record a newly negotiated packet size.
    ///
    /// A larger size takes effect at the next flush; the packet being
    /// assembled keeps its current size.
    pub fn set_packet_size(&mut self, packet_size: usize) {
        let packet_size = clamp_packet_size(packet_size);
        if packet_size > self.packet_size {
            self.pending_size = Some(packet_size);
        }
    }

    /// Packet size in effect for the packet being assembled.
    #[must_use]
    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Number of payload bytes buffered and not yet sent.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn payload_capacity(&self) -> usize {
        self.packet_size - PACKET_HEADER_SIZE
    }

    /// Send the buffered payload as the final packet of the message.
    pub fn end_message(&mut self) -> Result<(), ProtocolError> {
        self.flush_packet(true)
    }

    /// Write a complete message of `packet_type`.
    pub fn send_message(&mut self, packet_type: PacketType, payload: &[u8]) -> Result<(), ProtocolError> {
        self.set_message_type(packet_type);
        self.write_bytes(payload)?;
        self.end_message()
    }

    /// Send an attention packet as its own message.
    pub fn send_attention(&mut self) -> Result<(), ProtocolError> {
        let previous = self.message_type;
        self.send_message(PacketType::Attention, &[])?;
        self.message_type = previous;
        tracing::debug!("attention sent");
        Ok(())
    }

    fn flush_packet(&mut self, last: bool) -> Result<(), ProtocolError> {
        let payload = self.buf.split().freeze();
        let packet = Packet::with_payload(self.message_type, last, payload);

        self.out.clear();
        self.codec.encode(packet, &mut self.out)?;
        self.inner.write_all(&self.out)?;
        self.inner.flush()?;

        if let Some(size) = self.pending_size.take() {
            tracing::debug!(from = self.packet_size, to = size, "resizing request buffer");
            self.packet_size = size;
            self.buf = BytesMut::with_capacity(size - PACKET_HEADER_SIZE);
        }
        Ok(())
    }

    /// Get a reference to the underlying writer.
    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Get a mutable reference to the underlying writer.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Consume the framer and return the underlying writer.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> TdsWrite for RequestWriter<W> {
    fn write_u8(&mut self, value: u8) -> Result<(), ProtocolError> {
        self.write_bytes(&[value])
    }

    fn write_bytes(&mut self, mut src: &[u8]) -> Result<(), ProtocolError> {
        while !src.is_empty() {
            let room = self.payload_capacity() - self.buf.len();
            if room == 0 {
                self.flush_packet(false)?;
                continue;
            }
            let n = room.min(src.len());
            self.buf.extend_from_slice(&src[..n]);
            src = &src[n..];
        }
        Ok(())
    }
}

impl<W> std::fmt::Debug for RequestWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestWriter")
            .field("message_type", &self.message_type)
            .field("packet_size", &self.packet_size)
            .field("buffered", &self.buf.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tds5_protocol::packet::PacketHeader;

    fn split_packets(mut raw: &[u8]) -> Vec<(PacketHeader, Vec<u8>)> {
        let mut packets = Vec::new();
        while !raw.is_empty() {
            let header = PacketHeader::decode(&mut &raw[..PACKET_HEADER_SIZE]).unwrap();
            let len = usize::from(header.length);
            packets.push((header, raw[PACKET_HEADER_SIZE..len].to_vec()));
            raw = &raw[len..];
        }
        packets
    }

    #[test]
    fn test_single_packet_message() {
        let mut writer = RequestWriter::new(Vec::new());
        writer.set_message_type(PacketType::Language);
        writer.write_i32_le(7).unwrap();
        writer.end_message().unwrap();

        let out = writer.into_inner();
        assert_eq!(&out[..], &[0x01, 0x01, 0x00, 0x0C, 0, 0, 0, 0, 7, 0, 0, 0]);
    }

    #[test]
    fn test_multi_packet_split() {
        let data: Vec<u8> = (0..1200u32).map(|i| i as u8).collect();
        let mut writer = RequestWriter::new(Vec::new());
        writer.send_message(PacketType::Normal, &data).unwrap();

        let packets = split_packets(&writer.into_inner());
        assert_eq!(packets.len(), 3);
        for (header, _) in &packets[..2] {
            assert!(!header.is_end_of_message());
            assert_eq!(header.length, 512);
        }
        let (last, payload) = &packets[2];
        assert!(last.is_end_of_message());
        assert_eq!(usize::from(last.length), 8 + 1200 - 2 * 504);
        assert_eq!(payload.len(), 1200 - 2 * 504);

        let joined: Vec<u8> = packets.into_iter().flat_map(|(_, p)| p).collect();
        assert_eq!(joined, data);
    }

    #[test]
    fn test_exact_fill_sends_single_final_packet() {
        let mut writer = RequestWriter::new(Vec::new());
        writer.send_message(PacketType::Normal, &[1u8; 504]).unwrap();
        let packets = split_packets(&writer.into_inner());
        assert_eq!(packets.len(), 1);
        assert!(packets[0].0.is_end_of_message());
        assert_eq!(packets[0].0.length, 512);
    }

    #[test]
    fn test_attention_is_header_only() {
        let mut writer = RequestWriter::new(Vec::new());
        writer.set_message_type(PacketType::Language);
        writer.send_attention().unwrap();
        assert_eq!(writer.message_type(), PacketType::Language);
        assert_eq!(&writer.into_inner()[..], &[0x06, 0x01, 0x00, 0x08, 0, 0, 0, 0]);
    }

    #[test]
    fn test_packet_size_grows_at_next_flush() {
        let mut writer = RequestWriter::new(Vec::new());
        writer.write_bytes(&[0u8; 10]).unwrap();
        writer.set_packet_size(2048);
        assert_eq!(writer.packet_size(), 512);
        writer.end_message().unwrap();
        assert_eq!(writer.packet_size(), 2048);

        writer.get_mut().clear();
        writer.send_message(PacketType::Normal, &[0u8; 3000]).unwrap();
        let packets = split_packets(&writer.into_inner());
        assert_eq!(packets[0].0.length, 2048);
        assert_eq!(packets.len(), 2);
    }

    #[test]
    fn test_packet_size_clamped() {
        let mut writer = RequestWriter::with_packet_size(Vec::new(), 100);
        assert_eq!(writer.packet_size(), 512);
        writer.set_packet_size(1_000_000);
        writer.end_message().unwrap();
        assert_eq!(writer.packet_size(), MAX_WRITE_PACKET_SIZE);
    }

    #[test]
    fn test_smaller_packet_size_is_ignored() {
        let mut writer = RequestWriter::with_packet_size(Vec::new(), 4096);
        writer.set_packet_size(512);
        writer.end_message().unwrap();
        assert_eq!(writer.packet_size(), 4096);
    }

    #[test]
    fn test_fixed_string_through_framer() {
        let mut writer = RequestWriter::new(Vec::new());
        writer.write_fixed_string(b"sa", 4).unwrap();
        assert_eq!(writer.buffered(), 5);
        writer.end_message().unwrap();
        assert_eq!(&writer.into_inner()[8..], &[b's', b'a', 0, 0, 2]);
    }
}
