//! Tokio codec for framing [`RawMessage`]s over a TCP/TLS stream.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::error;
use crate::line::LineCodec;
use crate::message::RawMessage;

/// Tokio codec that wraps [`LineCodec`] and parses lines into [`RawMessage`].
pub struct RawCodec {
    inner: LineCodec,
}

impl RawCodec {
    /// Create a new codec with the default 512-byte line limit.
    pub fn new() -> Self {
        Self {
            inner: LineCodec::new(),
        }
    }

    /// Create a new codec with a custom max line length.
    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            inner: LineCodec::with_max_len(max_len),
        }
    }
}

impl Default for RawCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for RawCodec {
    type Item = RawMessage;
    type Error = error::ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> error::Result<Option<RawMessage>> {
        self.inner
            .decode(src)
            .and_then(|res| res.map_or(Ok(None), |line| RawMessage::parse(&line).map(Some)))
    }
}

impl Encoder<RawMessage> for RawCodec {
    type Error = error::ProtocolError;

    fn encode(&mut self, msg: RawMessage, dst: &mut BytesMut) -> error::Result<()> {
        let mut line = msg.format();
        line.push_str("\r\n");
        self.inner.encode(line, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_encode_roundtrip() {
        let mut codec = RawCodec::new();
        let mut buf = BytesMut::from(":nick!~user@host PRIVMSG #chan :hi\r\n");

        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.command, "PRIVMSG");

        let mut out = BytesMut::new();
        codec.encode(msg, &mut out).unwrap();
        assert_eq!(&out[..], b"PRIVMSG #chan :hi\r\n");
    }

    #[test]
    fn test_decode_rejects_empty_line() {
        let mut codec = RawCodec::new();
        let mut buf = BytesMut::from("\r\n");
        assert!(codec.decode(&mut buf).is_err());
    }
}
