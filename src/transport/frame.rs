// ABOUTME: RFC 6455 frame encoding and decoding
// ABOUTME: tokio-util codec with client masking and control-frame validation

use super::TransportError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Largest payload accepted for a single frame or a reassembled message
pub const MAX_PAYLOAD_LEN: usize = 64 << 20;

/// Well-known close codes
pub mod close_code {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Endpoint is going away
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol violation
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Close frame carried no status code
    pub const NO_STATUS: u16 = 1005;
    /// Socket dropped without a close frame
    pub const ABNORMAL: u16 = 1006;
    /// Payload was not valid for its message type
    pub const INVALID_DATA: u16 = 1007;
    /// Message exceeded the size limit
    pub const TOO_BIG: u16 = 1009;
}

/// Frame opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// Continuation of a fragmented message
    Continuation,
    /// UTF-8 text data
    Text,
    /// Binary data
    Binary,
    /// Connection close
    Close,
    /// Ping
    Ping,
    /// Pong
    Pong,
}

impl OpCode {
    /// Parse the low nibble of the first header byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    /// Wire value of this opcode
    pub fn as_u8(self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    /// Whether this is a control opcode (close, ping, pong)
    pub fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

/// A single WebSocket frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment flag
    pub fin: bool,
    /// Frame opcode
    pub opcode: OpCode,
    /// Unmasked payload
    pub payload: Bytes,
}

impl Frame {
    /// Create a final frame with the given opcode
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode,
            payload: payload.into(),
        }
    }

    /// Single-frame text message
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(OpCode::Text, Bytes::from(text.into()))
    }

    /// Single-frame binary message
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Binary, data)
    }

    /// Ping control frame
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Ping, payload)
    }

    /// Pong control frame
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Pong, payload)
    }

    /// Close control frame. `1005` produces an empty payload.
    pub fn close(code: u16, reason: &str) -> Self {
        if code == close_code::NO_STATUS {
            return Self::new(OpCode::Close, Bytes::new());
        }

        // control payloads are capped at 125 bytes, two of which are the code
        let mut end = reason.len().min(123);
        while !reason.is_char_boundary(end) {
            end -= 1;
        }

        let mut payload = BytesMut::with_capacity(2 + end);
        payload.put_u16(code);
        payload.put_slice(&reason.as_bytes()[..end]);
        Self::new(OpCode::Close, payload.freeze())
    }
}

/// Code and reason carried by a close frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    /// Numeric close code
    pub code: u16,
    /// Human-readable reason (may be empty)
    pub reason: String,
}

impl CloseFrame {
    /// Create a close description
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Parse a close frame payload
    pub fn parse(payload: &[u8]) -> Result<Self, TransportError> {
        match payload.len() {
            0 => Ok(Self::new(close_code::NO_STATUS, "")),
            1 => Err(TransportError::Protocol(
                "close frame payload of one byte".to_string(),
            )),
            _ => {
                let code = u16::from_be_bytes([payload[0], payload[1]]);
                let reason = std::str::from_utf8(&payload[2..])
                    .map_err(|_| TransportError::InvalidUtf8)?;
                Ok(Self::new(code, reason))
            }
        }
    }
}

/// XOR `buf` in place with the 4-byte masking key
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// Frame codec for the client side of a connection
///
/// Outgoing frames are masked with the connection's key. A client codec
/// refuses masked incoming frames; an unmasked codec plays the server side and
/// unmasks whatever the peer masked.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    mask: Option<[u8; 4]>,
    max_payload_len: usize,
}

impl FrameCodec {
    /// Codec that masks every outgoing frame with `mask`
    pub fn client(mask: [u8; 4]) -> Self {
        Self {
            mask: Some(mask),
            max_payload_len: MAX_PAYLOAD_LEN,
        }
    }

    /// Codec that writes unmasked frames (used by test peers)
    pub fn unmasked() -> Self {
        Self {
            mask: None,
            max_payload_len: MAX_PAYLOAD_LEN,
        }
    }

    /// Override the per-frame payload limit
    pub fn max_payload_len(mut self, len: usize) -> Self {
        self.max_payload_len = len;
        self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, TransportError> {
        if src.len() < 2 {
            return Ok(None);
        }

        let first = src[0];
        let second = src[1];

        if first & 0x70 != 0 {
            return Err(TransportError::Protocol("reserved bits set".to_string()));
        }

        let fin = first & 0x80 != 0;
        let opcode = OpCode::from_u8(first & 0x0F).ok_or_else(|| {
            TransportError::Protocol(format!("unknown opcode {:#x}", first & 0x0F))
        })?;

        let (payload_len, mut header_len) = match second & 0x7F {
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                (u64::from(u16::from_be_bytes([src[2], src[3]])), 4)
            }
            127 => {
                if src.len() < 10 {
                    return Ok(None);
                }
                let mut len = [0u8; 8];
                len.copy_from_slice(&src[2..10]);
                (u64::from_be_bytes(len), 10)
            }
            len => (u64::from(len), 2),
        };

        if opcode.is_control() {
            if !fin {
                return Err(TransportError::Protocol(
                    "fragmented control frame".to_string(),
                ));
            }
            if payload_len > 125 {
                return Err(TransportError::Protocol(
                    "control frame payload over 125 bytes".to_string(),
                ));
            }
        }

        if payload_len > self.max_payload_len as u64 {
            return Err(TransportError::TooLarge(payload_len));
        }
        let payload_len = payload_len as usize;

        if second & 0x80 != 0 && self.mask.is_some() {
            return Err(TransportError::Protocol(
                "masked frame from server".to_string(),
            ));
        }

        let mask = if second & 0x80 != 0 {
            if src.len() < header_len + 4 {
                return Ok(None);
            }
            let key = [
                src[header_len],
                src[header_len + 1],
                src[header_len + 2],
                src[header_len + 3],
            ];
            header_len += 4;
            Some(key)
        } else {
            None
        };

        if src.len() < header_len + payload_len {
            src.reserve(header_len + payload_len - src.len());
            return Ok(None);
        }

        src.advance(header_len);
        let mut payload = src.split_to(payload_len);
        if let Some(key) = mask {
            apply_mask(&mut payload, key);
        }

        Ok(Some(Frame {
            fin,
            opcode,
            payload: payload.freeze(),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = TransportError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), TransportError> {
        let len = frame.payload.len();
        let mask_bit = if self.mask.is_some() { 0x80 } else { 0x00 };

        dst.reserve(len + 14);
        dst.put_u8(((frame.fin as u8) << 7) | frame.opcode.as_u8());

        if len < 126 {
            dst.put_u8(mask_bit | len as u8);
        } else if len <= u16::MAX as usize {
            dst.put_u8(mask_bit | 126);
            dst.put_u16(len as u16);
        } else {
            dst.put_u8(mask_bit | 127);
            dst.put_u64(len as u64);
        }

        match self.mask {
            Some(key) => {
                dst.put_slice(&key);
                let start = dst.len();
                dst.put_slice(&frame.payload);
                apply_mask(&mut dst[start..], key);
            }
            None => dst.put_slice(&frame.payload),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_mask_is_involution() {
        let mask = [0x37, 0xfa, 0x21, 0x3d];
        let mut data = b"Hello".to_vec();
        apply_mask(&mut data, mask);
        assert_eq!(data, [0x7f, 0x9f, 0x4d, 0x51, 0x58]);
        apply_mask(&mut data, mask);
        assert_eq!(data, b"Hello");
    }

    #[test]
    fn test_decode_unmasked_text() {
        // RFC 6455 section 5.7 single-frame unmasked text
        let mut buf = BytesMut::from(&[0x81, 0x05, 0x48, 0x65, 0x6c, 0x6c, 0x6f][..]);
        let frame = FrameCodec::unmasked().decode(&mut buf).unwrap().unwrap();
        assert!(frame.fin);
        assert_eq!(frame.opcode, OpCode::Text);
        assert_eq!(&frame.payload[..], b"Hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_masked_text() {
        let mut buf = BytesMut::from(
            &[0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58][..],
        );
        let frame = FrameCodec::unmasked().decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame.payload[..], b"Hello");
    }

    #[test]
    fn test_decode_waits_for_full_frame() {
        let mut codec = FrameCodec::unmasked();
        let mut buf = BytesMut::from(&[0x01, 0x03, 0x48, 0x65][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&[0x6c]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert!(!frame.fin);
        assert_eq!(&frame.payload[..], b"Hel");
    }

    #[test]
    fn test_decode_extended_length() {
        let payload = vec![b'a'; 300];
        let mut buf = BytesMut::new();
        buf.put_u8(0x82);
        buf.put_u8(126);
        buf.put_u16(300);
        buf.put_slice(&payload);

        let frame = FrameCodec::unmasked().decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.opcode, OpCode::Binary);
        assert_eq!(frame.payload.len(), 300);
    }

    #[test]
    fn test_decode_rejects_reserved_bits_and_bad_control() {
        let mut codec = FrameCodec::unmasked();

        let mut rsv = BytesMut::from(&[0xC1, 0x00][..]);
        assert!(matches!(codec.decode(&mut rsv), Err(TransportError::Protocol(_))));

        let mut fragmented_ping = BytesMut::from(&[0x09, 0x00][..]);
        assert!(matches!(
            codec.decode(&mut fragmented_ping),
            Err(TransportError::Protocol(_))
        ));

        let mut unknown = BytesMut::from(&[0x83, 0x00][..]);
        assert!(matches!(codec.decode(&mut unknown), Err(TransportError::Protocol(_))));
    }

    #[test]
    fn test_client_rejects_masked_frames() {
        let mut server = FrameCodec::client([9, 9, 9, 9]);
        let mut buf = BytesMut::new();
        server.encode(Frame::text("hi"), &mut buf).unwrap();

        let mut client = FrameCodec::client([1, 2, 3, 4]);
        assert!(matches!(
            client.decode(&mut buf),
            Err(TransportError::Protocol(_))
        ));
    }

    #[test]
    fn test_decode_rejects_oversized_frame() {
        let mut codec = FrameCodec::unmasked().max_payload_len(16);
        let mut buf = BytesMut::from(&[0x82, 0x20][..]);
        assert!(matches!(codec.decode(&mut buf), Err(TransportError::TooLarge(32))));
    }

    #[test]
    fn test_encode_masks_payload() {
        let mask = [1, 2, 3, 4];
        let mut codec = FrameCodec::client(mask);
        let mut buf = BytesMut::new();
        codec.encode(Frame::text("ping"), &mut buf).unwrap();

        assert_eq!(buf[0], 0x81);
        assert_eq!(buf[1], 0x80 | 4);
        assert_eq!(&buf[2..6], &mask);
        assert_ne!(&buf[6..], b"ping");

        // the peer side unmasks it back
        let frame = FrameCodec::unmasked().decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame.payload[..], b"ping");
    }

    #[test]
    fn test_close_frame_payload() {
        let frame = Frame::close(4004, "Authentication failed.");
        let parsed = CloseFrame::parse(&frame.payload).unwrap();
        assert_eq!(parsed, CloseFrame::new(4004, "Authentication failed."));

        assert!(Frame::close(close_code::NO_STATUS, "ignored").payload.is_empty());
        assert_eq!(CloseFrame::parse(&[]).unwrap().code, close_code::NO_STATUS);

        let long = "é".repeat(100);
        assert!(Frame::close(close_code::NORMAL, &long).payload.len() <= 125);
    }
}
