//! Length-prefixed word framing for the RouterOS binary API ("sentence" wire
//! format).
//!
//! A word is a UTF-8 byte string preceded by a variable-width, big-endian
//! length prefix. The narrowest of five prefix widths is chosen based on the
//! payload length. This module implements the encode/decode primitives as a
//! [`tokio_util::codec`] pair so the socket transport can drive it through a
//! `Framed<TcpStream, WordCodec>` the same way `tokio-util` line/length
//! codecs are driven elsewhere in this stack.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Maximum word length accepted on decode. RouterOS sentences are small;
/// anything near the 32-bit length ceiling is almost certainly a corrupted
/// stream, not a real word.
pub const MAX_WORD_LEN: usize = 64 * 1024 * 1024;

/// Encode `word` into `(length-prefix || bytes)`, appending to `out`.
pub fn encode_word(word: &[u8], out: &mut BytesMut) {
    let len = word.len();
    out.reserve(prefix_width(len) + len);
    if len < 0x80 {
        out.put_u8(len as u8);
    } else if len < 0x4000 {
        out.put_u8(((len >> 8) as u8) | 0x80);
        out.put_u8(len as u8);
    } else if len < 0x20_0000 {
        out.put_u8(((len >> 16) as u8) | 0xC0);
        out.put_u8((len >> 8) as u8);
        out.put_u8(len as u8);
    } else if len < 0x1000_0000 {
        out.put_u8(((len >> 24) as u8) | 0xE0);
        out.put_u8((len >> 16) as u8);
        out.put_u8((len >> 8) as u8);
        out.put_u8(len as u8);
    } else {
        out.put_u8(0xF0);
        out.put_u32(len as u32);
    }
    out.put_slice(word);
}

fn prefix_width(len: usize) -> usize {
    if len < 0x80 {
        1
    } else if len < 0x4000 {
        2
    } else if len < 0x20_0000 {
        3
    } else if len < 0x1000_0000 {
        4
    } else {
        5
    }
}

/// The outcome of attempting to decode a length prefix from the front of a
/// buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DecodedLength {
    pub len: usize,
    pub width: usize,
}

/// Decode the length prefix at the start of `buf`. Returns `Ok(None)` when
/// there are not yet enough bytes to determine the prefix width or read its
/// full value — the caller should wait for more bytes. Returns `Err` when
/// the first byte's top five bits are `11111`, which is a hard framing
/// error per the wire format.
pub(crate) fn decode_length(buf: &[u8]) -> Result<Option<DecodedLength>, FramingError> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };
    if first & 0xF8 == 0xF8 {
        return Err(FramingError::InvalidPrefix(first));
    }
    if first & 0x80 == 0 {
        return Ok(Some(DecodedLength {
            len: first as usize,
            width: 1,
        }));
    }
    if first & 0xC0 == 0x80 {
        if buf.len() < 2 {
            return Ok(None);
        }
        let len = (((first & 0x3F) as usize) << 8) | buf[1] as usize;
        return Ok(Some(DecodedLength { len, width: 2 }));
    }
    if first & 0xE0 == 0xC0 {
        if buf.len() < 3 {
            return Ok(None);
        }
        let len = (((first & 0x1F) as usize) << 16) | ((buf[1] as usize) << 8) | buf[2] as usize;
        return Ok(Some(DecodedLength { len, width: 3 }));
    }
    if first & 0xF0 == 0xE0 {
        if buf.len() < 4 {
            return Ok(None);
        }
        let len = (((first & 0x0F) as usize) << 24)
            | ((buf[1] as usize) << 16)
            | ((buf[2] as usize) << 8)
            | buf[3] as usize;
        return Ok(Some(DecodedLength { len, width: 4 }));
    }
    // first == 0xF0: 32-bit big-endian length follows.
    if buf.len() < 5 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    Ok(Some(DecodedLength { len, width: 5 }))
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum FramingError {
    #[error("invalid length prefix (first byte 0x{0:02x})")]
    InvalidPrefix(u8),
    #[error("word of {0} bytes exceeds the {1}-byte limit")]
    WordTooLarge(usize, usize),
    #[error("non-UTF-8 word: {0}")]
    NotUtf8(#[from] std::str::Utf8Error),
}

/// A `tokio_util::codec` pair that encodes/decodes individual RouterOS
/// words. The empty-word sentence terminator is a zero-length word like any
/// other; callers distinguish it by its emptiness, not at the codec layer.
#[derive(Debug, Default)]
pub struct WordCodec;

impl Decoder for WordCodec {
    type Item = String;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(decoded) = decode_length(src)? else {
            return Ok(None);
        };
        if decoded.len > MAX_WORD_LEN {
            return Err(FramingError::WordTooLarge(decoded.len, MAX_WORD_LEN));
        }
        if src.len() < decoded.width + decoded.len {
            src.reserve(decoded.width + decoded.len - src.len());
            return Ok(None);
        }
        src.advance(decoded.width);
        let bytes = src.split_to(decoded.len);
        let word = std::str::from_utf8(&bytes)?.to_owned();
        Ok(Some(word))
    }
}

impl Encoder<&str> for WordCodec {
    type Error = FramingError;

    fn encode(&mut self, item: &str, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_word(item.as_bytes(), dst);
        Ok(())
    }
}

impl Encoder<String> for WordCodec {
    type Error = FramingError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_word(item.as_bytes(), dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_short_word_with_single_byte_prefix() {
        let mut out = BytesMut::new();
        encode_word(b"/ip/address/print", &mut out);
        assert_eq!(out.len(), 18);
        assert_eq!(out[0], 0x11);
    }

    #[test]
    fn encodes_200_byte_word_with_two_byte_prefix() {
        let word = vec![b'x'; 200];
        let mut out = BytesMut::new();
        encode_word(&word, &mut out);
        assert_eq!(out[0], 0x80);
        assert_eq!(out[1], 0xC8);
        assert_eq!(out.len(), 202);
    }

    #[test]
    fn round_trips_each_prefix_width() {
        for len in [0usize, 1, 127, 128, 16383, 16384, 2_097_151, 2_097_152] {
            let word = vec![b'a'; len];
            let mut buf = BytesMut::new();
            encode_word(&word, &mut buf);
            let mut codec = WordCodec;
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded.len(), len);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn streaming_concatenation_emits_words_in_order_regardless_of_chunking() {
        let words = ["/login", "=name=admin", "", "!re", "=.id=*1", ""];
        let mut full = BytesMut::new();
        for w in &words {
            encode_word(w.as_bytes(), &mut full);
        }
        let full = full.freeze();

        // Drive the codec one byte at a time to prove chunk-boundary independence.
        let mut codec = WordCodec;
        let mut buf = BytesMut::new();
        let mut out = Vec::new();
        for byte in full.iter() {
            buf.put_u8(*byte);
            while let Some(word) = codec.decode(&mut buf).unwrap() {
                out.push(word);
            }
        }
        assert_eq!(out, words.to_vec());
    }

    #[test]
    fn incomplete_buffer_returns_need_more_bytes() {
        let mut codec = WordCodec;
        let mut buf = BytesMut::from(&[0x80u8][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn top_five_bits_all_set_is_a_hard_framing_error() {
        let mut codec = WordCodec;
        let mut buf = BytesMut::from(&[0xF8u8][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FramingError::InvalidPrefix(0xF8))
        ));
    }

    #[test]
    fn oversized_word_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(0xF0);
        buf.put_u32((MAX_WORD_LEN + 1) as u32);
        let mut codec = WordCodec;
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FramingError::WordTooLarge(_, _))
        ));
    }
}
