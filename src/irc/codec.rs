//! Line framing over `tokio_util::codec`, grounded on the teacher's
//! `IrcCodec`/`LineCodec` split (`crates/slirc-proto/src/irc.rs`,
//! `line.rs`): split on `\r\n`/`\n`, enforce a max line length, decode
//! inbound bytes leniently, sanitize outbound text.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::GatewayError;
use crate::text::{decode_inbound, strip_newlines};

use super::message::Message;

pub const MAX_LINE_LEN: usize = 512;

pub struct IrcCodec {
    max_len: usize,
}

impl Default for IrcCodec {
    fn default() -> Self {
        Self { max_len: MAX_LINE_LEN }
    }
}

impl IrcCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_len(max_len: usize) -> Self {
        Self { max_len }
    }
}

impl Decoder for IrcCodec {
    type Item = Message;
    type Error = GatewayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, GatewayError> {
        let Some(pos) = src.iter().position(|b| *b == b'\n') else {
            if src.len() > self.max_len {
                src.clear();
                return Err(GatewayError::Internal("line too long".into()));
            }
            return Ok(None);
        };

        let mut line = src.split_to(pos + 1);
        line.truncate(line.len() - 1);
        if line.ends_with(b"\r") {
            line.truncate(line.len() - 1);
        }

        let decoded = decode_inbound(&line);
        Ok(Message::parse(decoded.trim_end()))
    }
}

impl Encoder<Message> for IrcCodec {
    type Error = GatewayError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), GatewayError> {
        let mut rendered = msg.to_string();
        if let Some(last) = rendered.find('\n') {
            rendered.truncate(last);
        }
        let rendered = strip_newlines(&rendered);
        dst.extend_from_slice(rendered.as_bytes());
        dst.extend_from_slice(b"\r\n");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_one_line_at_a_time_and_leaves_remainder_buffered() {
        let mut codec = IrcCodec::new();
        let mut buf = BytesMut::from("NICK alice\r\nUSER a 0 * :A\r\n");

        let m1 = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(m1.command, "NICK");

        let m2 = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(m2.command, "USER");

        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn incomplete_line_returns_none_without_consuming() {
        let mut codec = IrcCodec::new();
        let mut buf = BytesMut::from("PING :abc");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.remaining(), "PING :abc".len());
    }

    #[test]
    fn encode_appends_crlf() {
        let mut codec = IrcCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Message::new("PONG", vec!["passerd".into()]), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], b"PONG passerd\r\n");
    }

    #[test]
    fn oversized_line_without_newline_errors() {
        let mut codec = IrcCodec::with_max_len(8);
        let mut buf = BytesMut::from("this line has no terminator yet");
        assert!(codec.decode(&mut buf).is_err());
    }
}
