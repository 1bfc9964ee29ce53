//! Split I/O connection.
//!
//! The transport is split into independent read and write halves so that an
//! attention packet can be written while a response is only partially read.
//! For TCP the halves are two handles to the same socket from `try_clone`.

use std::io::{self, Read, Write};
use std::net::TcpStream;

use tds5_protocol::ProtocolError;
use tds5_protocol::packet::PacketType;

use crate::reader::ResponseReader;
use crate::writer::RequestWriter;

/// A TDS connection with split read and write framers.
///
/// # Example
///
/// ```rust,ignore
/// use std::net::TcpStream;
/// use tds5_codec::Connection;
///
/// let stream = TcpStream::connect("localhost:5000")?;
/// let mut conn = Connection::from_tcp(stream)?;
/// conn.send_message(PacketType::Language, &request)?;
/// ```
pub struct Connection<R, W> {
    reader: ResponseReader<R>,
    writer: RequestWriter<W>,
}

impl Connection<TcpStream, TcpStream> {
    /// Split a connected socket into a read and a write half.
    pub fn from_tcp(stream: TcpStream) -> io::Result<Self> {
        let write_half = stream.try_clone()?;
        Ok(Self::new(stream, write_half))
    }

    /// Shut down both directions of the socket.
    pub fn shutdown(&self) -> io::Result<()> {
        self.writer.get_ref().shutdown(std::net::Shutdown::Both)
    }
}

impl<R: Read, W: Write> Connection<R, W> {
    /// Create a connection from separate read and write halves.
    pub fn new(reader: R, writer: W) -> Self {
        Self::from_parts(ResponseReader::new(reader), RequestWriter::new(writer))
    }

    /// Create a connection from already configured framers.
    pub fn from_parts(reader: ResponseReader<R>, writer: RequestWriter<W>) -> Self {
        Self { reader, writer }
    }

    /// The response framer.
    pub fn reader(&mut self) -> &mut ResponseReader<R> {
        &mut self.reader
    }

    /// The request framer.
    pub fn writer(&mut self) -> &mut RequestWriter<W> {
        &mut self.writer
    }

    /// Both framers at once.
    pub fn split_mut(&mut self) -> (&mut ResponseReader<R>, &mut RequestWriter<W>) {
        (&mut self.reader, &mut self.writer)
    }

    /// Send a complete message, splitting into packets as needed.
    pub fn send_message(&mut self, packet_type: PacketType, payload: &[u8]) -> Result<(), ProtocolError> {
        self.writer.send_message(packet_type, payload)
    }

    /// Send an attention packet.
    pub fn send_attention(&mut self) -> Result<(), ProtocolError> {
        self.writer.send_attention()
    }

    /// Adopt a newly negotiated packet size for outgoing requests.
    pub fn set_packet_size(&mut self, packet_size: usize) {
        self.writer.set_packet_size(packet_size);
    }

    /// Consume the connection and return the framers.
    pub fn into_parts(self) -> (ResponseReader<R>, RequestWriter<W>) {
        (self.reader, self.writer)
    }
}

impl<R, W> std::fmt::Debug for Connection<R, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("reader", &self.reader)
            .field("writer", &self.writer)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::net::TcpListener;
    use std::thread;

    use tds5_protocol::TdsRead;

    use super::*;
    use crate::packet_codec::TdsCodec;

    #[test]
    fn test_tcp_halves_share_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            // Echo one request payload back as a response.
            let mut reader =
                ResponseReader::with_codec(stream.try_clone().unwrap(), TdsCodec::any_type());
            let packet = reader.read_packet().unwrap();
            assert_eq!(packet.header.packet_type, PacketType::Language);
            let mut writer = RequestWriter::new(stream);
            writer.send_message(PacketType::Response, &packet.payload).unwrap();
        });

        let stream = TcpStream::connect(addr).unwrap();
        let mut conn = Connection::from_tcp(stream).unwrap();
        conn.send_message(PacketType::Language, b"ping").unwrap();
        let echoed = conn.reader().read_bytes(4).unwrap();
        assert_eq!(&echoed[..], b"ping");
        server.join().unwrap();
    }

    #[test]
    fn test_in_memory_halves() {
        let mut conn = Connection::new(&b""[..], Vec::new());
        conn.send_attention().unwrap();
        let (_, writer) = conn.into_parts();
        assert_eq!(writer.into_inner(), vec![0x06, 0x01, 0x00, 0x08, 0, 0, 0, 0]);
    }
}
