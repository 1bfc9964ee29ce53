//! Codec utilities for TDS protocol encoding and decoding.
//!
//! Token and type decoders never touch a socket directly. They read through
//! [`TdsRead`], which is implemented both for in-memory slices and for the
//! packet-aware reader in `tds5-codec`, and they write through [`TdsWrite`],
//! implemented for `BytesMut` and for the packet-splitting request writer.

use std::borrow::Cow;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use encoding_rs::Encoding;

use crate::error::ProtocolError;

const READ_CHUNK: usize = 4096;

/// Blocking little-endian reads over a TDS byte stream.
///
/// Implementors only provide the three primitives; everything else is
/// derived from them.
pub trait TdsRead {
    /// Read a single byte.
    fn read_u8(&mut self) -> Result<u8, ProtocolError>;

    /// Fill `dst` completely.
    fn read_exact_into(&mut self, dst: &mut [u8]) -> Result<(), ProtocolError>;

    /// Discard `n` bytes.
    fn skip(&mut self, n: usize) -> Result<(), ProtocolError>;

    /// Read exactly `n` bytes.
    ///
    /// `n` usually comes off the wire, so the buffer grows with the bytes
    /// actually read rather than being sized up front.
    fn read_bytes(&mut self, n: usize) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(n.min(READ_CHUNK));
        let mut chunk = [0u8; READ_CHUNK];
        while buf.len() < n {
            let step = (n - buf.len()).min(READ_CHUNK);
            self.read_exact_into(&mut chunk[..step])?;
            buf.extend_from_slice(&chunk[..step]);
        }
        Ok(buf.freeze())
    }

    /// Read a little-endian `u16`.
    fn read_u16_le(&mut self) -> Result<u16, ProtocolError> {
        let mut buf = [0u8; 2];
        self.read_exact_into(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    /// Read a little-endian `i16`.
    fn read_i16_le(&mut self) -> Result<i16, ProtocolError> {
        let mut buf = [0u8; 2];
        self.read_exact_into(&mut buf)?;
        Ok(i16::from_le_bytes(buf))
    }

    /// Read a little-endian `u32`.
    fn read_u32_le(&mut self) -> Result<u32, ProtocolError> {
        let mut buf = [0u8; 4];
        self.read_exact_into(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Read a little-endian `i32`.
    fn read_i32_le(&mut self) -> Result<i32, ProtocolError> {
        let mut buf = [0u8; 4];
        self.read_exact_into(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    /// Read a little-endian `u64`.
    fn read_u64_le(&mut self) -> Result<u64, ProtocolError> {
        let mut buf = [0u8; 8];
        self.read_exact_into(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Read a little-endian `i64`.
    fn read_i64_le(&mut self) -> Result<i64, ProtocolError> {
        let mut buf = [0u8; 8];
        self.read_exact_into(&mut buf)?;
        Ok(i64::from_le_bytes(buf))
    }

    /// Read a little-endian IEEE 754 single.
    fn read_f32_le(&mut self) -> Result<f32, ProtocolError> {
        self.read_u32_le().map(f32::from_bits)
    }

    /// Read a little-endian IEEE 754 double.
    fn read_f64_le(&mut self) -> Result<f64, ProtocolError> {
        self.read_u64_le().map(f64::from_bits)
    }
}

impl TdsRead for &[u8] {
    fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        if !self.has_remaining() {
            return Err(ProtocolError::UnexpectedEof);
        }
        Ok(self.get_u8())
    }

    fn read_exact_into(&mut self, dst: &mut [u8]) -> Result<(), ProtocolError> {
        if self.remaining() < dst.len() {
            return Err(ProtocolError::UnexpectedEof);
        }
        self.copy_to_slice(dst);
        Ok(())
    }

    fn skip(&mut self, n: usize) -> Result<(), ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::UnexpectedEof);
        }
        self.advance(n);
        Ok(())
    }

    fn read_bytes(&mut self, n: usize) -> Result<Bytes, ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::UnexpectedEof);
        }
        Ok(self.copy_to_bytes(n))
    }
}

/// Little-endian writes into a TDS request.
pub trait TdsWrite {
    /// Append a single byte.
    fn write_u8(&mut self, value: u8) -> Result<(), ProtocolError>;

    /// Append raw bytes.
    fn write_bytes(&mut self, src: &[u8]) -> Result<(), ProtocolError>;

    /// Append a little-endian `i16`.
    fn write_i16_le(&mut self, value: i16) -> Result<(), ProtocolError> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Append a little-endian `u16`.
    fn write_u16_le(&mut self, value: u16) -> Result<(), ProtocolError> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Append a little-endian `i32`.
    fn write_i32_le(&mut self, value: i32) -> Result<(), ProtocolError> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Append a little-endian `u32`.
    fn write_u32_le(&mut self, value: u32) -> Result<(), ProtocolError> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Append a little-endian `i64`.
    fn write_i64_le(&mut self, value: i64) -> Result<(), ProtocolError> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Append a little-endian `u64`.
    fn write_u64_le(&mut self, value: u64) -> Result<(), ProtocolError> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Append a little-endian IEEE 754 single.
    fn write_f32_le(&mut self, value: f32) -> Result<(), ProtocolError> {
        self.write_u32_le(value.to_bits())
    }

    /// Append a little-endian IEEE 754 double.
    fn write_f64_le(&mut self, value: f64) -> Result<(), ProtocolError> {
        self.write_u64_le(value.to_bits())
    }

    /// Append `n` zero bytes.
    fn write_zeros(&mut self, n: usize) -> Result<(), ProtocolError> {
        const ZEROS: [u8; 64] = [0; 64];
        let mut left = n;
        while left > 0 {
            let chunk = left.min(ZEROS.len());
            self.write_bytes(&ZEROS[..chunk])?;
            left -= chunk;
        }
        Ok(())
    }

    /// Append `src`, zero-padded up to `len` bytes.
    ///
    /// If `src` is longer than `len` it is written in full.
    fn write_padded(&mut self, src: &[u8], len: usize) -> Result<(), ProtocolError> {
        self.write_bytes(src)?;
        self.write_zeros(len.saturating_sub(src.len()))
    }

    /// Append exactly `max_len` bytes of `src` (truncated or zero-padded)
    /// followed by a 1-byte count of the meaningful bytes.
    fn write_fixed_string(&mut self, src: &[u8], max_len: usize) -> Result<(), ProtocolError> {
        let used = src.len().min(max_len).min(usize::from(u8::MAX));
        self.write_padded(&src[..used], max_len)?;
        self.write_u8(used as u8)
    }
}

impl TdsWrite for BytesMut {
    fn write_u8(&mut self, value: u8) -> Result<(), ProtocolError> {
        self.put_u8(value);
        Ok(())
    }

    fn write_bytes(&mut self, src: &[u8]) -> Result<(), ProtocolError> {
        self.put_slice(src);
        Ok(())
    }
}

/// Resolve a server charset name to its text encoding.
///
/// Names are matched case-insensitively.
pub fn encoding_for_charset(name: &str) -> Result<&'static Encoding, ProtocolError> {
    let encoding = match name.to_ascii_lowercase().as_str() {
        "iso_1" | "ascii_7" | "ascii_8" | "cp1252" => encoding_rs::WINDOWS_1252,
        "utf8" => encoding_rs::UTF_8,
        "unicode" => encoding_rs::UTF_16LE,
        "cp1250" => encoding_rs::WINDOWS_1250,
        "cp1251" => encoding_rs::WINDOWS_1251,
        "cp1253" => encoding_rs::WINDOWS_1253,
        "cp1254" => encoding_rs::WINDOWS_1254,
        "cp1255" => encoding_rs::WINDOWS_1255,
        "cp1256" => encoding_rs::WINDOWS_1256,
        "cp1257" => encoding_rs::WINDOWS_1257,
        "cp1258" => encoding_rs::WINDOWS_1258,
        "iso88592" => encoding_rs::ISO_8859_2,
        "iso88595" => encoding_rs::ISO_8859_5,
        "iso88597" => encoding_rs::ISO_8859_7,
        "iso88598" => encoding_rs::ISO_8859_8,
        "iso88599" => encoding_rs::WINDOWS_1254,
        "koi8" => encoding_rs::KOI8_R,
        "sjis" => encoding_rs::SHIFT_JIS,
        "eucjis" => encoding_rs::EUC_JP,
        "eucgb" => encoding_rs::GBK,
        "gb18030" => encoding_rs::GB18030,
        "big5" => encoding_rs::BIG5,
        "eucksc" => encoding_rs::EUC_KR,
        "cp874" | "tis620" => encoding_rs::WINDOWS_874,
        _ => return Err(ProtocolError::UnknownCharset(name.to_string())),
    };
    Ok(encoding)
}

/// Encode `s` in the session encoding.
///
/// `encoding_rs` only decodes UTF-16, so both UTF-16 forms are produced
/// here directly.
pub fn encode_text<'a>(encoding: &'static Encoding, s: &'a str) -> Cow<'a, [u8]> {
    if encoding == encoding_rs::UTF_16LE {
        Cow::Owned(s.encode_utf16().flat_map(u16::to_le_bytes).collect())
    } else if encoding == encoding_rs::UTF_16BE {
        Cow::Owned(s.encode_utf16().flat_map(u16::to_be_bytes).collect())
    } else {
        let (bytes, _, _) = encoding.encode(s);
        bytes
    }
}

/// Decode `bytes` in the session encoding, replacing malformed sequences.
#[must_use]
pub fn decode_text(encoding: &'static Encoding, bytes: &[u8]) -> String {
    encoding
        .decode_without_bom_handling(bytes)
        .0
        .into_owned()
}

/// Read a string with a 1-byte length prefix. A zero length yields `None`.
pub fn read_b_varchar(
    src: &mut (impl TdsRead + ?Sized),
    encoding: &'static Encoding,
) -> Result<Option<String>, ProtocolError> {
    let len = usize::from(src.read_u8()?);
    if len == 0 {
        return Ok(None);
    }
    let bytes = src.read_bytes(len)?;
    Ok(Some(decode_text(encoding, &bytes)))
}

/// Read a string with a 2-byte length prefix. A zero length yields `None`.
pub fn read_us_varchar(
    src: &mut (impl TdsRead + ?Sized),
    encoding: &'static Encoding,
) -> Result<Option<String>, ProtocolError> {
    let len = usize::from(src.read_u16_le()?);
    if len == 0 {
        return Ok(None);
    }
    let bytes = src.read_bytes(len)?;
    Ok(Some(decode_text(encoding, &bytes)))
}

/// Write a string with a 1-byte length prefix, truncated to 255 bytes.
pub fn write_b_varchar(
    dst: &mut (impl TdsWrite + ?Sized),
    encoding: &'static Encoding,
    s: &str,
) -> Result<(), ProtocolError> {
    let bytes = encode_text(encoding, s);
    let len = bytes.len().min(usize::from(u8::MAX));
    dst.write_u8(len as u8)?;
    dst.write_bytes(&bytes[..len])
}

/// Write a string with a 2-byte length prefix, truncated to 65535 bytes.
pub fn write_us_varchar(
    dst: &mut (impl TdsWrite + ?Sized),
    encoding: &'static Encoding,
    s: &str,
) -> Result<(), ProtocolError> {
    let bytes = encode_text(encoding, s);
    let len = bytes.len().min(usize::from(u16::MAX));
    dst.write_u16_le(len as u16)?;
    dst.write_bytes(&bytes[..len])
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    /// A reader that only provides the required primitives.
    struct Primitives<'a>(&'a [u8]);

    impl TdsRead for Primitives<'_> {
        fn read_u8(&mut self) -> Result<u8, ProtocolError> {
            self.0.read_u8()
        }

        fn read_exact_into(&mut self, dst: &mut [u8]) -> Result<(), ProtocolError> {
            self.0.read_exact_into(dst)
        }

        fn skip(&mut self, n: usize) -> Result<(), ProtocolError> {
            self.0.skip(n)
        }
    }

    #[test]
    fn test_default_read_bytes_spans_chunks() {
        let data: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
        let mut src = Primitives(&data);
        assert_eq!(&src.read_bytes(9_000).unwrap()[..], &data[..9_000]);
        assert_eq!(src.0.len(), 1_000);
    }

    #[test]
    fn test_default_read_bytes_huge_length_is_eof() {
        let mut src = Primitives(&[1, 2, 3]);
        assert!(matches!(
            src.read_bytes(u32::MAX as usize),
            Err(ProtocolError::UnexpectedEof)
        ));
    }

    #[test]
    fn test_b_varchar_roundtrip() {
        let mut buf = BytesMut::new();
        write_b_varchar(&mut buf, encoding_rs::UTF_8, "Hello, 世界!").unwrap();

        let mut cursor = &buf[..];
        let decoded = read_b_varchar(&mut cursor, encoding_rs::UTF_8).unwrap();
        assert_eq!(decoded.as_deref(), Some("Hello, 世界!"));
        assert!(cursor.is_empty());
    }

    #[test]
    fn test_empty_varchar_is_none() {
        let mut cursor: &[u8] = &[0, 0, 0];
        assert_eq!(read_b_varchar(&mut cursor, encoding_rs::UTF_8).unwrap(), None);
        assert_eq!(read_us_varchar(&mut cursor, encoding_rs::UTF_8).unwrap(), None);
        assert!(cursor.is_empty());
    }

    #[test]
    fn test_slice_reads_are_little_endian() {
        let mut cursor: &[u8] = &[0x34, 0x12, 0x78, 0x56, 0x34, 0x12, 0xFF];
        assert_eq!(cursor.read_u16_le().unwrap(), 0x1234);
        assert_eq!(cursor.read_i32_le().unwrap(), 0x1234_5678);
        assert_eq!(cursor.read_u8().unwrap(), 0xFF);
        assert!(matches!(cursor.read_u8(), Err(ProtocolError::UnexpectedEof)));
    }

    #[test]
    fn test_short_read_is_eof() {
        let mut cursor: &[u8] = &[1, 2, 3];
        assert!(matches!(cursor.read_i64_le(), Err(ProtocolError::UnexpectedEof)));
        assert!(matches!(cursor.skip(4), Err(ProtocolError::UnexpectedEof)));
    }

    #[test]
    fn test_write_fixed_string_pads_and_truncates() {
        let mut buf = BytesMut::new();
        buf.write_fixed_string(b"abc", 5).unwrap();
        assert_eq!(&buf[..], b"abc\0\0\x03");

        let mut buf = BytesMut::new();
        buf.write_fixed_string(b"abcdefg", 4).unwrap();
        assert_eq!(&buf[..], b"abcd\x04");
    }

    #[test]
    fn test_write_padded_longer_source() {
        let mut buf = BytesMut::new();
        buf.write_padded(b"abcdef", 4).unwrap();
        assert_eq!(&buf[..], b"abcdef");

        let mut buf = BytesMut::new();
        buf.write_padded(b"ab", 4).unwrap();
        assert_eq!(&buf[..], b"ab\0\0");
    }

    #[test]
    fn test_write_zeros_spans_chunks() {
        let mut buf = BytesMut::new();
        buf.write_zeros(150).unwrap();
        assert_eq!(buf.len(), 150);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_charset_table() {
        assert_eq!(encoding_for_charset("iso_1").unwrap(), encoding_rs::WINDOWS_1252);
        assert_eq!(encoding_for_charset("UTF8").unwrap(), encoding_rs::UTF_8);
        assert_eq!(encoding_for_charset("sjis").unwrap(), encoding_rs::SHIFT_JIS);
        assert!(matches!(
            encoding_for_charset("klingon"),
            Err(ProtocolError::UnknownCharset(name)) if name == "klingon"
        ));
    }

    #[test]
    fn test_utf16_text_roundtrip() {
        let bytes = encode_text(encoding_rs::UTF_16LE, "aé");
        assert_eq!(&bytes[..], &[0x61, 0x00, 0xE9, 0x00]);
        assert_eq!(decode_text(encoding_rs::UTF_16LE, &bytes), "aé");
    }

    #[test]
    fn test_single_byte_text_roundtrip() {
        let bytes = encode_text(encoding_rs::WINDOWS_1252, "café");
        assert_eq!(&bytes[..], b"caf\xE9");
        assert_eq!(decode_text(encoding_rs::WINDOWS_1252, &bytes), "café");
    }
}
