//! Frame codecs for the probe channel.
//!
//! Two framings exist: newline-terminated JSON text, and binary frames with a
//! 1-byte kind tag plus a 4-byte little-endian length before the payload.
//! Binary is preferred when both ends support it because payloads may carry
//! arbitrary bytes without escaping.

use crate::error::Error;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame kind tag for event payloads. Other kinds are reserved for future
/// command/ack framing.
pub const FRAME_KIND_EVENT: u8 = 1;

/// Highest kind tag the protocol reserves. A kind byte above this is a
/// corrupted stream, not a future extension.
const MAX_FRAME_KIND: u8 = 0x0f;

/// Upper bound on a single frame payload. Anything larger is treated as a
/// corrupted stream rather than an allocation request.
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

const BINARY_HEADER_LEN: usize = 1 + 4;

/// Wire framing selected at channel construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    /// Newline-terminated JSON values.
    #[default]
    Text,
    /// `[1-byte kind][4-byte LE length][payload]`.
    Binary,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: u8,
    pub payload: Bytes,
}

/// Encode an outbound payload with the given framing. Text framing appends
/// the newline terminator; binary framing always tags with the event kind.
pub fn encode(framing: Framing, payload: &[u8]) -> Vec<u8> {
    match framing {
        Framing::Text => {
            let mut out = Vec::with_capacity(payload.len() + 1);
            out.extend_from_slice(payload);
            out.push(b'\n');
            out
        }
        Framing::Binary => {
            let mut out = BytesMut::with_capacity(BINARY_HEADER_LEN + payload.len());
            out.put_u8(FRAME_KIND_EVENT);
            out.put_u32_le(payload.len() as u32);
            out.put_slice(payload);
            out.to_vec()
        }
    }
}

/// Incremental frame decoder. Bytes are fed in as they arrive from the
/// transport; complete frames are drained with [`FrameDecoder::next_frame`].
#[derive(Debug)]
pub struct FrameDecoder {
    framing: Framing,
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new(framing: Framing) -> Self {
        FrameDecoder {
            framing,
            buf: BytesMut::with_capacity(4096),
        }
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete frame, or `None` when more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, Error> {
        match self.framing {
            Framing::Text => self.next_text_frame(),
            Framing::Binary => self.next_binary_frame(),
        }
    }

    fn next_text_frame(&mut self) -> Result<Option<Frame>, Error> {
        let Some(pos) = self.buf.iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };
        let mut line = self.buf.split_to(pos + 1);
        line.truncate(pos);
        // Tolerate \r\n terminators from probes on CRLF platforms.
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        Ok(Some(Frame {
            kind: FRAME_KIND_EVENT,
            payload: line.freeze(),
        }))
    }

    fn next_binary_frame(&mut self) -> Result<Option<Frame>, Error> {
        if self.buf.len() < BINARY_HEADER_LEN {
            return Ok(None);
        }
        let kind = self.buf[0];
        if kind == 0 || kind > MAX_FRAME_KIND {
            return Err(Error::UnknownFrameKind(kind));
        }
        let len = u32::from_le_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]);
        if len > MAX_FRAME_LEN {
            return Err(Error::FrameTooLarge(len));
        }
        if self.buf.len() < BINARY_HEADER_LEN + len as usize {
            return Ok(None);
        }
        self.buf.advance(BINARY_HEADER_LEN);
        let payload = self.buf.split_to(len as usize).freeze();
        Ok(Some(Frame { kind, payload }))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn text_frames_split_on_newlines() {
        let mut decoder = FrameDecoder::new(Framing::Text);
        decoder.extend(b"{\"event\":\"stopped\"}\n{\"event\":");
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(&frame.payload[..], b"{\"event\":\"stopped\"}");
        assert!(decoder.next_frame().unwrap().is_none());

        decoder.extend(b"\"exited\"}\r\n");
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(&frame.payload[..], b"{\"event\":\"exited\"}");
    }

    #[test]
    fn binary_roundtrip() {
        let payload = br#"{"event":"output","body":{"text":"hi\n"}}"#;
        let encoded = encode(Framing::Binary, payload);
        assert_eq!(encoded[0], FRAME_KIND_EVENT);

        let mut decoder = FrameDecoder::new(Framing::Binary);
        decoder.extend(&encoded);
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(frame.kind, FRAME_KIND_EVENT);
        assert_eq!(&frame.payload[..], payload);
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn binary_tolerates_split_delivery() {
        let encoded = encode(Framing::Binary, b"0123456789");
        let mut decoder = FrameDecoder::new(Framing::Binary);
        for chunk in encoded.chunks(3) {
            decoder.extend(chunk);
        }
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(&frame.payload[..], b"0123456789");
    }

    #[test]
    fn binary_payload_may_contain_newlines() {
        let payload = b"line one\nline two\n";
        let encoded = encode(Framing::Binary, payload);
        let mut decoder = FrameDecoder::new(Framing::Binary);
        decoder.extend(&encoded);
        assert_eq!(&decoder.next_frame().unwrap().unwrap().payload[..], payload);
    }

    #[test]
    fn corrupted_kind_byte_is_rejected() {
        let mut decoder = FrameDecoder::new(Framing::Binary);
        let mut header = vec![0xffu8];
        header.extend_from_slice(&4u32.to_le_bytes());
        header.extend_from_slice(b"{}{}");
        decoder.extend(&header);
        assert!(matches!(
            decoder.next_frame(),
            Err(Error::UnknownFrameKind(0xff))
        ));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut decoder = FrameDecoder::new(Framing::Binary);
        let mut header = vec![FRAME_KIND_EVENT];
        header.extend_from_slice(&u32::MAX.to_le_bytes());
        decoder.extend(&header);
        assert!(matches!(
            decoder.next_frame(),
            Err(Error::FrameTooLarge(_))
        ));
    }
}
