//! Line-based codec for tokio.
//!
//! Reads/writes newline-terminated lines, enforcing the IRC 512-byte line
//! limit and rejecting illegal control characters.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::error;

/// Line-based codec that handles newline-terminated messages.
///
/// By default, lines are limited to 512 bytes (IRC standard).
pub struct LineCodec {
    /// Index of next byte to check for newline.
    next_index: usize,
    /// Maximum line length.
    max_len: usize,
}

impl LineCodec {
    /// Create a new codec with the default 512-byte line limit.
    pub fn new() -> Self {
        Self {
            next_index: 0,
            max_len: 512,
        }
    }

    /// Create a new codec with a custom max line length.
    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            next_index: 0,
            max_len,
        }
    }

    fn validate_line(s: &str) -> error::Result<()> {
        let trimmed = s.trim_end_matches(['\r', '\n']);
        for ch in trimmed.chars() {
            if crate::format::is_illegal_control_char(ch) {
                return Err(error::ProtocolError::IllegalControlChar(ch));
            }
        }
        Ok(())
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = error::ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> error::Result<Option<String>> {
        if let Some(offset) = src[self.next_index..].iter().position(|b| *b == b'\n') {
            let line = src.split_to(self.next_index + offset + 1);
            self.next_index = 0;

            if line.len() > self.max_len {
                return Err(error::ProtocolError::MessageTooLong {
                    actual: line.len(),
                    limit: self.max_len,
                });
            }

            let data = String::from_utf8(line.to_vec())?;
            Self::validate_line(&data)?;
            Ok(Some(data))
        } else {
            self.next_index = src.len();
            if src.len() > self.max_len {
                return Err(error::ProtocolError::MessageTooLong {
                    actual: src.len(),
                    limit: self.max_len,
                });
            }
            Ok(None)
        }
    }
}

impl Encoder<String> for LineCodec {
    type Error = error::ProtocolError;

    fn encode(&mut self, msg: String, dst: &mut BytesMut) -> error::Result<()> {
        dst.extend(msg.into_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_complete_line() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from("PING :test\r\n");

        let result = codec.decode(&mut buf).unwrap();
        assert_eq!(result, Some("PING :test\r\n".to_string()));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_partial_line() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from("PING :");

        let result = codec.decode(&mut buf).unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn test_decode_too_long() {
        let mut codec = LineCodec::with_max_len(10);
        let mut buf = BytesMut::from("this is way too long\n");

        let result = codec.decode(&mut buf);
        assert!(matches!(
            result,
            Err(error::ProtocolError::MessageTooLong { .. })
        ));
    }

    #[test]
    fn test_encode() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::new();

        codec
            .encode("PONG :test\r\n".to_string(), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], b"PONG :test\r\n");
    }
}
