//! Frame codecs: slicing the byte stream into application frames.
//!
//! A codec is stateless with respect to the framework; per-connection
//! framing state, when needed, belongs in the connection's context slot.
//! `decode` inspects the inbound ring through [`Conn::peek`]/[`Conn::shift_n`]
//! and must shift exactly the consumed prefix when it yields a frame.
//! Returning an error closes the connection and surfaces the error through
//! `on_closed`.

use bytes::Bytes;

use crate::connection::Conn;
use crate::error::CodecError;

/// Bidirectional framing: bytes ↔ frames.
pub trait Codec: Send + Sync + 'static {
    /// Produce the wire bytes for one outbound payload.
    fn encode(&self, conn: &Conn, buf: &[u8]) -> Result<Bytes, CodecError>;

    /// Return the next complete frame from the inbound ring, `None` when
    /// insufficient bytes are buffered, or an error when framing is
    /// irrecoverable.
    fn decode(&self, conn: &mut Conn) -> Result<Option<Bytes>, CodecError>;
}

/// Default codec: the entire inbound buffer is one frame, encode is the
/// identity.
pub struct TransparentCodec;

impl Codec for TransparentCodec {
    fn encode(&self, _conn: &Conn, buf: &[u8]) -> Result<Bytes, CodecError> {
        Ok(Bytes::copy_from_slice(buf))
    }

    fn decode(&self, conn: &mut Conn) -> Result<Option<Bytes>, CodecError> {
        let n = conn.buffer_len();
        if n == 0 {
            return Ok(None);
        }
        let frame = Bytes::from(conn.read_n(n));
        conn.shift_n(n);
        Ok(Some(frame))
    }
}

/// Frames delimited by `\n`. The delimiter is stripped on decode and
/// appended on encode.
pub struct LineCodec;

impl Codec for LineCodec {
    fn encode(&self, _conn: &Conn, buf: &[u8]) -> Result<Bytes, CodecError> {
        encode_delimited(buf, b'\n')
    }

    fn decode(&self, conn: &mut Conn) -> Result<Option<Bytes>, CodecError> {
        decode_delimited(conn, b'\n')
    }
}

/// Frames delimited by a configurable byte.
pub struct DelimiterCodec {
    delimiter: u8,
}

impl DelimiterCodec {
    pub fn new(delimiter: u8) -> DelimiterCodec {
        DelimiterCodec { delimiter }
    }
}

impl Codec for DelimiterCodec {
    fn encode(&self, _conn: &Conn, buf: &[u8]) -> Result<Bytes, CodecError> {
        encode_delimited(buf, self.delimiter)
    }

    fn decode(&self, conn: &mut Conn) -> Result<Option<Bytes>, CodecError> {
        decode_delimited(conn, self.delimiter)
    }
}

fn encode_delimited(buf: &[u8], delimiter: u8) -> Result<Bytes, CodecError> {
    let mut out = Vec::with_capacity(buf.len() + 1);
    out.extend_from_slice(buf);
    out.push(delimiter);
    Ok(Bytes::from(out))
}

fn decode_delimited(conn: &mut Conn, delimiter: u8) -> Result<Option<Bytes>, CodecError> {
    let idx = {
        let (a, b) = conn.peek_all();
        match a.iter().position(|&c| c == delimiter) {
            Some(i) => Some(i),
            None => b
                .iter()
                .position(|&c| c == delimiter)
                .map(|i| a.len() + i),
        }
    };
    let Some(idx) = idx else {
        return Ok(None);
    };
    let frame = if idx == 0 {
        Bytes::new()
    } else {
        Bytes::from(conn.read_n(idx))
    };
    conn.shift_n(idx + 1);
    Ok(Some(frame))
}

/// Fixed-size frames of exactly `frame_len` bytes.
pub struct FixedLengthCodec {
    frame_len: usize,
}

impl FixedLengthCodec {
    pub fn new(frame_len: usize) -> FixedLengthCodec {
        assert!(frame_len > 0, "frame length must be positive");
        FixedLengthCodec { frame_len }
    }
}

impl Codec for FixedLengthCodec {
    fn encode(&self, _conn: &Conn, buf: &[u8]) -> Result<Bytes, CodecError> {
        if buf.len() % self.frame_len != 0 {
            return Err(CodecError::Unencodable(
                "payload length is not a multiple of the fixed frame length",
            ));
        }
        Ok(Bytes::copy_from_slice(buf))
    }

    fn decode(&self, conn: &mut Conn) -> Result<Option<Bytes>, CodecError> {
        if conn.buffer_len() < self.frame_len {
            return Ok(None);
        }
        let frame = Bytes::from(conn.read_n(self.frame_len));
        conn.shift_n(self.frame_len);
        Ok(Some(frame))
    }
}

/// Byte order of the length field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    BigEndian,
    LittleEndian,
}

/// Encode-side configuration for [`LengthFieldCodec`].
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub byte_order: ByteOrder,
    /// Width of the length field in bytes: 1, 2, 3, 4 or 8.
    pub length_field_len: usize,
    /// Added to the payload length before writing the field.
    pub length_adjustment: i64,
    /// Whether the written length counts the field itself.
    pub length_includes_field_len: bool,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        EncoderConfig {
            byte_order: ByteOrder::BigEndian,
            length_field_len: 4,
            length_adjustment: 0,
            length_includes_field_len: false,
        }
    }
}

/// Decode-side configuration for [`LengthFieldCodec`].
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    pub byte_order: ByteOrder,
    /// Offset of the length field from the start of the frame.
    pub length_field_offset: usize,
    /// Width of the length field in bytes: 1, 2, 3, 4 or 8.
    pub length_field_len: usize,
    /// Added to the field value when computing the total frame length.
    pub length_adjustment: i64,
    /// Bytes stripped from the front of the decoded frame.
    pub initial_bytes_to_strip: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        DecoderConfig {
            byte_order: ByteOrder::BigEndian,
            length_field_offset: 0,
            length_field_len: 4,
            length_adjustment: 0,
            initial_bytes_to_strip: 4,
        }
    }
}

/// Length-field framing with configurable byte order, field offset and
/// width, length adjustment and initial strip.
///
/// Total frame length is computed as
/// `field + adjustment + offset + field_len`.
#[derive(Debug)]
pub struct LengthFieldCodec {
    encoder: EncoderConfig,
    decoder: DecoderConfig,
}

impl LengthFieldCodec {
    pub fn new(encoder: EncoderConfig, decoder: DecoderConfig) -> Result<Self, CodecError> {
        if !matches!(encoder.length_field_len, 1 | 2 | 3 | 4 | 8) {
            return Err(CodecError::InvalidConfig(
                "encoder length field width must be 1, 2, 3, 4 or 8",
            ));
        }
        if !matches!(decoder.length_field_len, 1 | 2 | 3 | 4 | 8) {
            return Err(CodecError::InvalidConfig(
                "decoder length field width must be 1, 2, 3, 4 or 8",
            ));
        }
        Ok(LengthFieldCodec { encoder, decoder })
    }
}

impl Default for LengthFieldCodec {
    fn default() -> Self {
        LengthFieldCodec {
            encoder: EncoderConfig::default(),
            decoder: DecoderConfig::default(),
        }
    }
}

impl Codec for LengthFieldCodec {
    fn encode(&self, _conn: &Conn, buf: &[u8]) -> Result<Bytes, CodecError> {
        let width = self.encoder.length_field_len;
        let mut length = buf.len() as i64 + self.encoder.length_adjustment;
        if self.encoder.length_includes_field_len {
            length += width as i64;
        }
        if length < 0 {
            return Err(CodecError::InvalidLength(length));
        }
        let max = if width == 8 {
            u64::MAX
        } else {
            (1u64 << (width * 8)) - 1
        };
        if length as u64 > max {
            return Err(CodecError::InvalidLength(length));
        }
        let mut out = Vec::with_capacity(width + buf.len());
        write_uint(&mut out, length as u64, width, self.encoder.byte_order);
        out.extend_from_slice(buf);
        Ok(Bytes::from(out))
    }

    fn decode(&self, conn: &mut Conn) -> Result<Option<Bytes>, CodecError> {
        let d = &self.decoder;
        let header_end = d.length_field_offset + d.length_field_len;
        if conn.buffer_len() < header_end {
            return Ok(None);
        }

        let mut field_bytes = [0u8; 8];
        copy_range(
            conn.peek_all(),
            d.length_field_offset,
            &mut field_bytes[..d.length_field_len],
        );
        let field = read_uint(&field_bytes[..d.length_field_len], d.byte_order);

        let total = field as i128 + d.length_adjustment as i128 + header_end as i128;
        if total < header_end as i128 || total > u32::MAX as i128 {
            return Err(CodecError::InvalidLength(total as i64));
        }
        let total = total as usize;
        if d.initial_bytes_to_strip > total {
            return Err(CodecError::InvalidLength(total as i64));
        }
        if conn.buffer_len() < total {
            return Ok(None);
        }

        let whole = conn.read_n(total);
        let frame = Bytes::from(whole[d.initial_bytes_to_strip..].to_vec());
        conn.shift_n(total);
        Ok(Some(frame))
    }
}

fn write_uint(out: &mut Vec<u8>, value: u64, width: usize, order: ByteOrder) {
    match order {
        ByteOrder::BigEndian => out.extend_from_slice(&value.to_be_bytes()[8 - width..]),
        ByteOrder::LittleEndian => out.extend_from_slice(&value.to_le_bytes()[..width]),
    }
}

fn read_uint(bytes: &[u8], order: ByteOrder) -> u64 {
    match order {
        ByteOrder::BigEndian => bytes.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64),
        ByteOrder::LittleEndian => bytes
            .iter()
            .rev()
            .fold(0u64, |acc, &b| (acc << 8) | b as u64),
    }
}

/// Copy `dst.len()` bytes starting at `offset` out of a two-slice view.
fn copy_range(views: (&[u8], &[u8]), offset: usize, dst: &mut [u8]) {
    let (a, b) = views;
    for (i, slot) in dst.iter_mut().enumerate() {
        let pos = offset + i;
        *slot = if pos < a.len() {
            a[pos]
        } else {
            b[pos - a.len()]
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::Poller;

    /// A connection detached from any real socket, plus the poller that
    /// keeps its trigger alive.
    fn harness() -> (Poller, Conn) {
        let poller = Poller::new().unwrap();
        let trigger = poller.trigger();
        let conn = Conn::accepted(-1, 0, trigger, None, None);
        (poller, conn)
    }

    fn feed(conn: &mut Conn, bytes: &[u8]) {
        conn.inbound.write(bytes);
    }

    #[test]
    fn transparent_takes_everything() {
        let (_p, mut conn) = harness();
        let codec = TransparentCodec;
        assert_eq!(codec.decode(&mut conn).unwrap(), None);
        feed(&mut conn, b"abc");
        assert_eq!(codec.decode(&mut conn).unwrap().unwrap(), &b"abc"[..]);
        assert_eq!(codec.decode(&mut conn).unwrap(), None);
    }

    #[test]
    fn line_codec_round_trip() {
        let (_p, mut conn) = harness();
        let codec = LineCodec;
        let wire = codec.encode(&conn, b"hello").unwrap();
        assert_eq!(&wire[..], b"hello\n");
        feed(&mut conn, &wire);
        feed(&mut conn, b"wor"); // incomplete second frame
        assert_eq!(codec.decode(&mut conn).unwrap().unwrap(), &b"hello"[..]);
        assert_eq!(codec.decode(&mut conn).unwrap(), None);
        feed(&mut conn, b"ld\n");
        assert_eq!(codec.decode(&mut conn).unwrap().unwrap(), &b"world"[..]);
    }

    #[test]
    fn delimiter_codec_empty_frame() {
        let (_p, mut conn) = harness();
        let codec = DelimiterCodec::new(b'|');
        feed(&mut conn, b"||x|");
        assert_eq!(codec.decode(&mut conn).unwrap().unwrap(), Bytes::new());
        assert_eq!(codec.decode(&mut conn).unwrap().unwrap(), Bytes::new());
        assert_eq!(codec.decode(&mut conn).unwrap().unwrap(), &b"x"[..]);
        assert_eq!(codec.decode(&mut conn).unwrap(), None);
    }

    #[test]
    fn fixed_length_frames() {
        let (_p, mut conn) = harness();
        let codec = FixedLengthCodec::new(4);
        feed(&mut conn, b"aaaabbbbcc");
        assert_eq!(codec.decode(&mut conn).unwrap().unwrap(), &b"aaaa"[..]);
        assert_eq!(codec.decode(&mut conn).unwrap().unwrap(), &b"bbbb"[..]);
        assert_eq!(codec.decode(&mut conn).unwrap(), None);
        feed(&mut conn, b"cc");
        assert_eq!(codec.decode(&mut conn).unwrap().unwrap(), &b"cccc"[..]);
    }

    #[test]
    fn fixed_length_rejects_ragged_payload() {
        let (_p, conn) = harness();
        let codec = FixedLengthCodec::new(8);
        assert!(codec.encode(&conn, b"12345").is_err());
        assert!(codec.encode(&conn, b"12345678").is_ok());
    }

    #[test]
    fn length_field_hello_frame() {
        // [00 00 00 05][h e l l o] with a 4-byte big-endian field.
        let (_p, mut conn) = harness();
        let codec = LengthFieldCodec::default();
        let wire = codec.encode(&conn, b"hello").unwrap();
        assert_eq!(&wire[..], b"\x00\x00\x00\x05hello");
        feed(&mut conn, &wire);
        assert_eq!(codec.decode(&mut conn).unwrap().unwrap(), &b"hello"[..]);
        assert_eq!(conn.buffer_len(), 0);
    }

    #[test]
    fn length_field_round_trip_all_widths_and_orders() {
        let payload = b"the quick brown fox";
        for width in [1usize, 2, 3, 4, 8] {
            for order in [ByteOrder::BigEndian, ByteOrder::LittleEndian] {
                let codec = LengthFieldCodec::new(
                    EncoderConfig {
                        byte_order: order,
                        length_field_len: width,
                        ..EncoderConfig::default()
                    },
                    DecoderConfig {
                        byte_order: order,
                        length_field_len: width,
                        initial_bytes_to_strip: width,
                        ..DecoderConfig::default()
                    },
                )
                .unwrap();
                let (_p, mut conn) = harness();
                let wire = codec.encode(&conn, payload).unwrap();
                assert_eq!(wire.len(), width + payload.len());
                feed(&mut conn, &wire);
                let frame = codec.decode(&mut conn).unwrap().unwrap();
                assert_eq!(&frame[..], payload, "width={width} order={order:?}");
                assert_eq!(conn.buffer_len(), 0);
            }
        }
    }

    #[test]
    fn length_field_partial_then_complete() {
        let (_p, mut conn) = harness();
        let codec = LengthFieldCodec::default();
        let wire = codec.encode(&conn, b"fragmented").unwrap();
        feed(&mut conn, &wire[..3]); // not even the header yet
        assert_eq!(codec.decode(&mut conn).unwrap(), None);
        feed(&mut conn, &wire[3..7]);
        assert_eq!(codec.decode(&mut conn).unwrap(), None);
        feed(&mut conn, &wire[7..]);
        assert_eq!(codec.decode(&mut conn).unwrap().unwrap(), &b"fragmented"[..]);
    }

    #[test]
    fn length_field_offset_and_strip() {
        // 2-byte type tag, then a 2-byte big-endian length, keep the tag.
        let codec = LengthFieldCodec::new(
            EncoderConfig::default(),
            DecoderConfig {
                byte_order: ByteOrder::BigEndian,
                length_field_offset: 2,
                length_field_len: 2,
                length_adjustment: 0,
                initial_bytes_to_strip: 4,
            },
        )
        .unwrap();
        let (_p, mut conn) = harness();
        feed(&mut conn, b"\xCA\xFE\x00\x03abcrest");
        let frame = codec.decode(&mut conn).unwrap().unwrap();
        assert_eq!(&frame[..], b"abc");
        assert_eq!(conn.read_n(0), b"rest");
    }

    #[test]
    fn length_field_negative_total_is_an_error() {
        let codec = LengthFieldCodec::new(
            EncoderConfig::default(),
            DecoderConfig {
                length_adjustment: -64,
                ..DecoderConfig::default()
            },
        )
        .unwrap();
        let (_p, mut conn) = harness();
        feed(&mut conn, b"\x00\x00\x00\x05hello");
        assert!(matches!(
            codec.decode(&mut conn),
            Err(CodecError::InvalidLength(_))
        ));
    }

    #[test]
    fn invalid_width_rejected_at_construction() {
        let err = LengthFieldCodec::new(
            EncoderConfig {
                length_field_len: 5,
                ..EncoderConfig::default()
            },
            DecoderConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, CodecError::InvalidConfig(_)));
    }
}
