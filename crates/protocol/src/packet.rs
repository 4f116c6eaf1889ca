//! Packet framing shared by every AirCatch transport.
//!
//! A packet is a 1-byte kind tag plus an opaque payload. Two framings exist:
//!
//! ```text
//! datagram (UDP, relay binary frames, close-range unreliable):
//!     [kind:1][payload:N]                 one packet per message
//! stream (TCP, close-range reliable):
//!     [kind:1][len:u32 BE][payload:len]   packets back to back on one byte stream
//! ```
//!
//! Receive policy: unknown kinds and truncated datagrams are dropped and the
//! connection keeps going. Only a hostile length prefix tears a stream down.

use bytes::{Buf, BytesMut};

pub const STREAM_HEADER_LEN: usize = 5;

/// Upper bound on a single stream frame payload. A 4K lossless keyframe stays
/// in the low tens of megabytes; anything above this is a corrupt or hostile
/// length prefix.
pub const MAX_STREAM_PAYLOAD: usize = 64 * 1024 * 1024;

/// Every packet kind on the wire, tagged with its 1-byte discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    VideoFrame = 0x01,
    TouchEvent = 0x02,
    HandshakeRequest = 0x03,
    HandshakeAck = 0x04,
    Disconnect = 0x05,
    ScrollEvent = 0x06,
    KeyEvent = 0x07,
    MediaKeyEvent = 0x08,
    Ping = 0x09,
    Pong = 0x0A,
    QualityReport = 0x0B,
    VideoFrameChunk = 0x0C,
    PairingFailed = 0x0D,
    VideoFrameChunkNack = 0x0E,
    AudioPcm = 0x0F,
    QualityAdjust = 0x10,
}

impl PacketKind {
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0x01 => Self::VideoFrame,
            0x02 => Self::TouchEvent,
            0x03 => Self::HandshakeRequest,
            0x04 => Self::HandshakeAck,
            0x05 => Self::Disconnect,
            0x06 => Self::ScrollEvent,
            0x07 => Self::KeyEvent,
            0x08 => Self::MediaKeyEvent,
            0x09 => Self::Ping,
            0x0A => Self::Pong,
            0x0B => Self::QualityReport,
            0x0C => Self::VideoFrameChunk,
            0x0D => Self::PairingFailed,
            0x0E => Self::VideoFrameChunkNack,
            0x0F => Self::AudioPcm,
            0x10 => Self::QualityAdjust,
            _ => return None,
        })
    }

    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Kinds forwarded to the input dispatcher.
    pub fn is_input(self) -> bool {
        matches!(
            self,
            Self::TouchEvent | Self::ScrollEvent | Self::KeyEvent | Self::MediaKeyEvent
        )
    }
}

/// A decoded packet: kind tag plus payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(kind: PacketKind, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }
}

/// Encode one packet as a datagram: `[kind:1][payload]`.
pub fn encode_datagram(kind: PacketKind, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + payload.len());
    buf.push(kind.tag());
    buf.extend_from_slice(payload);
    buf
}

/// Decode a datagram. `None` for empty messages and unknown kinds: the
/// caller drops and continues.
pub fn decode_datagram(data: &[u8]) -> Option<Packet> {
    let (&tag, payload) = data.split_first()?;
    let kind = PacketKind::from_tag(tag)?;
    Some(Packet::new(kind, payload.to_vec()))
}

/// Encode one packet as a stream frame: `[kind:1][len:u32 BE][payload]`.
pub fn encode_stream_frame(kind: PacketKind, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(STREAM_HEADER_LEN + payload.len());
    buf.push(kind.tag());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    /// The frame was well-formed but carried a tag this build doesn't know.
    /// The frame has been consumed; the stream remains decodable.
    #[error("unknown packet kind 0x{0:02x}")]
    UnknownKind(u8),
    /// Length prefix exceeds [`MAX_STREAM_PAYLOAD`]; the stream is corrupt
    /// and the connection must be dropped.
    #[error("stream frame of {len} bytes exceeds the {MAX_STREAM_PAYLOAD} byte limit (kind 0x{kind:02x})")]
    Oversize { kind: u8, len: usize },
}

/// Incremental decoder for the stream framing.
///
/// Feed arbitrary byte slices with [`extend`](Self::extend), then drain
/// complete packets with [`next_frame`](Self::next_frame) until it returns
/// `Ok(None)` (more bytes needed).
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buf: BytesMut,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete frame, if any.
    ///
    /// `Err(UnknownKind)` consumes the offending frame so the caller can
    /// count it and keep reading. `Err(Oversize)` leaves the buffer alone;
    /// the connection is beyond recovery.
    pub fn next_frame(&mut self) -> Result<Option<Packet>, FramingError> {
        if self.buf.len() < STREAM_HEADER_LEN {
            return Ok(None);
        }
        let tag = self.buf[0];
        let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if len > MAX_STREAM_PAYLOAD {
            return Err(FramingError::Oversize { kind: tag, len });
        }
        if self.buf.len() < STREAM_HEADER_LEN + len {
            return Ok(None);
        }
        self.buf.advance(STREAM_HEADER_LEN);
        let payload = self.buf.split_to(len).to_vec();
        match PacketKind::from_tag(tag) {
            Some(kind) => Ok(Some(Packet { kind, payload })),
            None => Err(FramingError::UnknownKind(tag)),
        }
    }
}
