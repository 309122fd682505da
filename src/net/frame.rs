//! Raw WebSocket frame codec.
//!
//! # Responsibilities
//! - Split a byte stream into single WebSocket frames
//! - Unmask frames read from a client, mask frames written to a server
//!
//! # Design Decisions
//! - Works one frame at a time: fragments, pings, pongs and close frames come
//!   out exactly as the peer sent them and nothing is answered on its own
//! - Header parsing and frame layout are tungstenite's; this module only adds
//!   the tokio-util framing and the masking rules for each side
//! - Frames larger than the configured bound fail the stream

use std::io::{self, Cursor};

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_tungstenite::tungstenite::{
    self,
    protocol::{
        frame::{Frame, FrameHeader},
        Role,
    },
};
use tokio_util::codec::{Decoder, Encoder};

/// Largest payload accepted on a relayed frame.
pub const MAX_FRAME_SIZE: usize = 16 << 20;

/// Errors raised while reading or writing frames.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed frame: {0}")]
    Protocol(#[from] tungstenite::Error),

    #[error("frame of {0} bytes exceeds the relay limit")]
    TooLarge(u64),

    #[error("frame masking does not match the peer's role")]
    Masking,
}

/// Frame codec for one leg of a relayed session.
///
/// `role` is the part this process plays on the leg: [`Role::Server`] towards
/// the caller, [`Role::Client`] towards the upstream.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    role: Role,
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        let mut cursor = Cursor::new(&src[..]);
        let Some((mut header, length)) = FrameHeader::parse(&mut cursor)? else {
            return Ok(None);
        };
        let header_len = cursor.position() as usize;

        let payload_len = usize::try_from(length)
            .ok()
            .filter(|len| *len <= self.max_frame_size)
            .ok_or(FrameError::TooLarge(length))?;

        // Clients must mask, servers must not.
        let masked = header.mask.is_some();
        match self.role {
            Role::Server if !masked => return Err(FrameError::Masking),
            Role::Client if masked => return Err(FrameError::Masking),
            _ => {}
        }

        let frame_len = header_len + payload_len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(header_len);
        let mut payload = src.split_to(payload_len);
        if let Some(mask) = header.mask.take() {
            apply_mask(&mut payload, mask);
        }
        Ok(Some(Frame::from_payload(header, payload.freeze())))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, mut frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        frame.header_mut().mask = match self.role {
            Role::Client => Some(rand::random()),
            Role::Server => None,
        };
        dst.reserve(frame.len());
        let mut writer = BufMut::writer(&mut *dst);
        frame.format(&mut writer)?;
        Ok(())
    }
}

fn apply_mask(payload: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::{Control, Data, OpCode};

    fn encoded(role: Role, frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec::new(role).encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn client_frames_are_masked_and_unmasked_by_the_server_side() {
        let frame = Frame::message("héllo", OpCode::Data(Data::Text), true);
        let mut wire = encoded(Role::Client, frame);

        // MASK bit set, payload not in clear text.
        assert_eq!(wire[1] & 0x80, 0x80);
        assert!(!wire.windows(6).any(|w| w == "héllo".as_bytes()));

        let decoded = FrameCodec::new(Role::Server).decode(&mut wire).unwrap().unwrap();
        assert_eq!(decoded.header().opcode, OpCode::Data(Data::Text));
        assert_eq!(decoded.header().mask, None);
        assert_eq!(decoded.payload(), "héllo".as_bytes());
        assert!(wire.is_empty());
    }

    #[test]
    fn control_and_fragment_frames_keep_their_shape() {
        let mut wire = encoded(Role::Server, Frame::ping(&b"beat"[..]));
        wire.extend_from_slice(&encoded(
            Role::Server,
            Frame::message(&b"par"[..], OpCode::Data(Data::Binary), false),
        ));

        let mut codec = FrameCodec::new(Role::Client);
        let ping = codec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(ping.header().opcode, OpCode::Control(Control::Ping));
        assert_eq!(ping.payload(), &b"beat"[..]);

        let fragment = codec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(fragment.header().opcode, OpCode::Data(Data::Binary));
        assert!(!fragment.header().is_final);
        assert_eq!(fragment.payload(), &b"par"[..]);
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let wire = encoded(Role::Server, Frame::message(vec![1u8; 300], OpCode::Data(Data::Binary), true));
        let mut partial = BytesMut::from(&wire[..10]);

        let mut codec = FrameCodec::new(Role::Client);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), 10);

        partial.extend_from_slice(&wire[10..]);
        let frame = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(frame.payload().len(), 300);
    }

    #[test]
    fn masking_must_match_the_peer_role() {
        let mut unmasked = encoded(Role::Server, Frame::pong(&b"x"[..]));
        assert!(matches!(
            FrameCodec::new(Role::Server).decode(&mut unmasked),
            Err(FrameError::Masking)
        ));

        let mut masked = encoded(Role::Client, Frame::pong(&b"x"[..]));
        assert!(matches!(
            FrameCodec::new(Role::Client).decode(&mut masked),
            Err(FrameError::Masking)
        ));
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut wire = encoded(Role::Server, Frame::message(vec![0u8; 64], OpCode::Data(Data::Binary), true));
        let mut codec = FrameCodec::new(Role::Client).with_max_frame_size(16);
        assert!(matches!(codec.decode(&mut wire), Err(FrameError::TooLarge(64))));
    }
}
