//! Blocking response framer.
//!
//! [`ResponseReader`] presents the payloads of consecutive packets as one
//! continuous byte stream through [`TdsRead`]. When the current packet is
//! exhausted it blocks for exactly one more packet, header first.

use std::io::{ErrorKind, Read};

use bytes::{Buf, Bytes, BytesMut};
use tds5_protocol::packet::{PACKET_HEADER_SIZE, PacketHeader};
use tds5_protocol::{ProtocolError, TdsRead};
use tokio_util::codec::Decoder;

use crate::packet_codec::{Packet, TdsCodec};

/// Reads packets from `R` and exposes their payloads as a byte stream.
pub struct ResponseReader<R> {
    inner: R,
    codec: TdsCodec,
    /// Raw bytes of the packet being received.
    raw: BytesMut,
    /// Unread payload of the current packet.
    payload: Bytes,
    last_header: Option<PacketHeader>,
}

impl<R: Read> ResponseReader<R> {
    /// Create a reader that accepts server response packets.
    pub fn new(inner: R) -> Self {
        Self::with_codec(inner, TdsCodec::new())
    }

    /// Create a reader with a custom codec.
    pub fn with_codec(inner: R, codec: TdsCodec) -> Self {
        Self {
            inner,
            codec,
            raw: BytesMut::with_capacity(PACKET_HEADER_SIZE),
            payload: Bytes::new(),
            last_header: None,
        }
    }

    /// Header of the most recently received packet.
    #[must_use]
    pub fn last_header(&self) -> Option<&PacketHeader> {
        self.last_header.as_ref()
    }

    /// Unread payload bytes in the current packet.
    #[must_use]
    pub fn remaining_in_packet(&self) -> usize {
        self.payload.len()
    }

    /// Whether the current logical message has been fully consumed.
    #[must_use]
    pub fn is_message_complete(&self) -> bool {
        self.payload.is_empty() && self.last_header.is_none_or(|h| h.is_end_of_message())
    }

    /// Receive exactly one packet.
    ///
    /// The header is read and validated before the payload is requested.
    pub fn read_packet(&mut self) -> Result<Packet, ProtocolError> {
        self.raw.clear();
        self.fill(PACKET_HEADER_SIZE)?;
        // Validates the header; the payload is not here yet unless the
        // packet is header-only.
        if let Some(packet) = self.codec.decode(&mut self.raw)? {
            return Ok(packet);
        }
        let length = usize::from(u16::from_be_bytes([self.raw[2], self.raw[3]]));
        self.fill(length)?;
        self.codec
            .decode(&mut self.raw)?
            .ok_or(ProtocolError::UnexpectedEof)
    }

    /// Read from the transport until `raw` holds `target` bytes.
    fn fill(&mut self, target: usize) -> Result<(), ProtocolError> {
        let start = self.raw.len();
        if start >= target {
            return Ok(());
        }
        self.raw.resize(target, 0);
        let mut filled = start;
        while filled < target {
            match self.inner.read(&mut self.raw[filled..target]) {
                Ok(0) => {
                    self.raw.truncate(filled);
                    return Err(ProtocolError::ConnectionClosed);
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    self.raw.truncate(filled);
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Make sure at least one unread payload byte is available.
    fn ensure_payload(&mut self) -> Result<(), ProtocolError> {
        while self.payload.is_empty() {
            let packet = self.read_packet()?;
            self.last_header = Some(packet.header);
            self.payload = packet.payload;
        }
        Ok(())
    }

    /// Skip the rest of the current logical message.
    pub fn discard_message(&mut self) -> Result<(), ProtocolError> {
        let mut skipped = self.payload.len();
        self.payload.clear();
        while !self.is_message_complete() {
            let packet = self.read_packet()?;
            skipped += packet.payload.len();
            self.last_header = Some(packet.header);
        }
        tracing::debug!(skipped, "discarded rest of message");
        Ok(())
    }

    /// Get a reference to the underlying reader.
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Get a mutable reference to the underlying reader.
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Consume the framer and return the underlying reader.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> TdsRead for ResponseReader<R> {
    fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        self.ensure_payload()?;
        Ok(self.payload.get_u8())
    }

    fn read_exact_into(&mut self, mut dst: &mut [u8]) -> Result<(), ProtocolError> {
        while !dst.is_empty() {
            self.ensure_payload()?;
            let n = dst.len().min(self.payload.len());
            self.payload.copy_to_slice(&mut dst[..n]);
            dst = &mut dst[n..];
        }
        Ok(())
    }

    fn skip(&mut self, mut n: usize) -> Result<(), ProtocolError> {
        while n > 0 {
            self.ensure_payload()?;
            let step = n.min(self.payload.len());
            self.payload.advance(step);
            n -= step;
        }
        Ok(())
    }

    fn read_bytes(&mut self, n: usize) -> Result<Bytes, ProtocolError> {
        if n == 0 {
            return Ok(Bytes::new());
        }
        self.ensure_payload()?;
        if self.payload.len() >= n {
            return Ok(self.payload.split_to(n));
        }

        // `n` comes off the wire: grow with what arrives, and never run
        // past the end of the message for the rest.
        let mut buf = BytesMut::with_capacity(self.payload.len());
        while buf.len() < n {
            if self.is_message_complete() {
                return Err(ProtocolError::UnexpectedEof);
            }
            self.ensure_payload()?;
            let step = (n - buf.len()).min(self.payload.len());
            buf.extend_from_slice(&self.payload.split_to(step));
        }
        Ok(buf.freeze())
    }
}

impl<R> std::fmt::Debug for ResponseReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseReader")
            .field("last_header", &self.last_header)
            .field("remaining_in_packet", &self.payload.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io;

    use proptest::prelude::*;
    use tds5_protocol::TdsWrite;
    use tds5_protocol::packet::PacketType;

    use super::*;
    use crate::writer::RequestWriter;

    /// A transport that hands out at most `chunk` bytes per read and
    /// interrupts every other call.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
        calls: usize,
    }

    impl Trickle {
        fn new(data: Vec<u8>, chunk: usize) -> Self {
            Self {
                data,
                pos: 0,
                chunk,
                calls: 0,
            }
        }
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.calls += 1;
            if self.calls % 2 == 0 {
                return Err(io::Error::new(ErrorKind::Interrupted, "signal"));
            }
            let n = buf.len().min(self.chunk).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    fn frame(packet_type: PacketType, packet_size: usize, data: &[u8]) -> Vec<u8> {
        let mut writer = RequestWriter::with_packet_size(Vec::new(), packet_size);
        writer.send_message(packet_type, data).unwrap();
        writer.into_inner()
    }

    #[test]
    fn test_reads_across_packets() {
        let data: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        let raw = frame(PacketType::Response, 512, &data);
        let mut reader = ResponseReader::new(&raw[..]);

        assert_eq!(reader.read_u8().unwrap(), 0);
        reader.skip(500).unwrap();
        // Spans the packet boundary at offset 504.
        let bytes = reader.read_bytes(10).unwrap();
        assert_eq!(&bytes[..], &data[501..511]);
        assert_eq!(reader.read_u16_le().unwrap(), u16::from_le_bytes([data[511], data[512]]));
        assert!(reader.last_header().unwrap().is_end_of_message());
    }

    #[test]
    fn test_partial_and_interrupted_reads() {
        let data = b"hello, partial world".to_vec();
        let raw = frame(PacketType::Normal, 512, &data);
        let mut reader = ResponseReader::new(Trickle::new(raw, 3));
        let bytes = reader.read_bytes(data.len()).unwrap();
        assert_eq!(&bytes[..], &data[..]);
        assert!(reader.is_message_complete());
    }

    #[test]
    fn test_zero_read_is_connection_closed() {
        let raw = frame(PacketType::Response, 512, b"abc");
        let mut reader = ResponseReader::new(&raw[..]);
        reader.skip(3).unwrap();
        assert!(matches!(reader.read_u8(), Err(ProtocolError::ConnectionClosed)));
    }

    #[test]
    fn test_truncated_payload_is_connection_closed() {
        let mut raw = frame(PacketType::Response, 512, b"abcdef");
        raw.truncate(10);
        let mut reader = ResponseReader::new(&raw[..]);
        assert!(matches!(reader.read_u8(), Err(ProtocolError::ConnectionClosed)));
    }

    #[test]
    fn test_huge_length_stops_at_end_of_message() {
        let mut raw = frame(PacketType::Response, 512, &[7u8; 600]);
        raw.extend(frame(PacketType::Response, 512, b"next"));
        let mut reader = ResponseReader::new(&raw[..]);
        reader.skip(2).unwrap();
        assert!(matches!(
            reader.read_bytes(u32::MAX as usize),
            Err(ProtocolError::UnexpectedEof)
        ));
        // The following message was not touched.
        assert!(reader.is_message_complete());
    }

    #[test]
    fn test_rejects_request_packet() {
        let raw = frame(PacketType::Attention, 512, b"");
        let mut reader = ResponseReader::new(&raw[..]);
        assert!(matches!(
            reader.read_u8(),
            Err(ProtocolError::UnexpectedPacketType(PacketType::Attention))
        ));
    }

    #[test]
    fn test_discard_message() {
        let mut raw = frame(PacketType::Response, 512, &[9u8; 1200]);
        raw.extend(frame(PacketType::Response, 512, &[1, 2]));
        let mut reader = ResponseReader::new(&raw[..]);
        reader.skip(3).unwrap();
        reader.discard_message().unwrap();
        assert!(reader.is_message_complete());
        assert_eq!(reader.read_u8().unwrap(), 1);
        assert_eq!(reader.read_u8().unwrap(), 2);
    }

    #[test]
    fn test_writer_output_reads_back_through_codec_trait() {
        let mut writer = RequestWriter::new(Vec::new());
        writer.set_message_type(PacketType::Normal);
        writer.write_i64_le(-5).unwrap();
        writer.write_f64_le(2.5).unwrap();
        writer.end_message().unwrap();

        let raw = writer.into_inner();
        let mut reader = ResponseReader::new(&raw[..]);
        assert_eq!(reader.read_i64_le().unwrap(), -5);
        assert_eq!(reader.read_f64_le().unwrap(), 2.5);
    }

    proptest! {
        #[test]
        fn prop_split_and_reassemble(
            data in proptest::collection::vec(any::<u8>(), 0..5000),
            packet_size in 512usize..2048,
            chunk in 1usize..64,
        ) {
            let raw = frame(PacketType::Normal, packet_size, &data);

            // Every packet but the last is full and not final.
            let mut rest = &raw[..];
            let mut headers = Vec::new();
            while !rest.is_empty() {
                let header = PacketHeader::decode(&mut &rest[..PACKET_HEADER_SIZE]).unwrap();
                headers.push(header);
                rest = &rest[usize::from(header.length)..];
            }
            let (last, full) = headers.split_last().unwrap();
            prop_assert!(last.is_end_of_message());
            for header in full {
                prop_assert!(!header.is_end_of_message());
                prop_assert_eq!(usize::from(header.length), packet_size);
            }

            let mut reader = ResponseReader::new(Trickle::new(raw, chunk));
            let read = reader.read_bytes(data.len()).unwrap();
            prop_assert_eq!(&read[..], &data[..]);
        }
    }
}
