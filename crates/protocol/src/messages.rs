//! JSON control payloads carried inside packets and relay envelopes.
//!
//! Everything here crosses a language boundary (Swift/Kotlin clients), so the
//! wire names are camelCase and additions must stay backwards-deserializable.

use serde::{Deserialize, Serialize};

use crate::profile::VideoCodec;

/// Client → host pairing request, carried encrypted in a
/// `handshake_request` packet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    pub client_name: String,
    pub client_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_model: Option<String>,
    pub screen_width: u32,
    pub screen_height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_codec: Option<VideoCodec>,
    pub prefer_low_latency: bool,
    pub want_lossless_video: bool,
    pub want_video: bool,
    pub want_audio: bool,
    pub pin: String,
}

impl std::fmt::Display for HandshakeRequest {
    // PIN is deliberately omitted so request logging can't leak it.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} v{} ({}x{})",
            self.client_name, self.client_version, self.screen_width, self.screen_height
        )
    }
}

/// Host → client pairing acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeAck {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub host_name: String,
    pub bitrate: u64,
    pub codec: VideoCodec,
    /// True when the host streams a dedicated virtual display rather than
    /// mirroring its main one.
    pub is_virtual_display: bool,
}

/// Client-side playback quality, fed to the adaptive controller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityReport {
    pub dropped_frames: u32,
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub timestamp: f64,
}

/// Selective retransmit request for missing chunks of a cached frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkNack {
    pub frame_id: u32,
    pub missing_chunk_indices: Vec<u16>,
}

/// Ping body. `rtt_ms` is the RTT the client measured on its previous
/// ping/pong exchange; the host folds it into the signal-quality window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingBody {
    pub client_ts: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtt_ms: Option<f64>,
}

/// Pong reply, echoing the client timestamp alongside the host's.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PongBody {
    pub client_ts: f64,
    pub host_ts: f64,
}

/// Host → client notice after the adaptive controller changes the stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityAdjust {
    pub bitrate: u64,
    pub frame_rate: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TouchPhase {
    Began,
    Moved,
    Ended,
    Cancelled,
}

/// A single touch, in coordinates normalized to the client's view.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TouchEvent {
    pub x: f64,
    pub y: f64,
    pub phase: TouchPhase,
    pub screen_width: f64,
    pub screen_height: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrollEvent {
    pub dx: f64,
    pub dy: f64,
    pub x: f64,
    pub y: f64,
}

/// Hardware key press/release. `text` carries composed characters for keys
/// that produce input, letting the host fall back to text insertion when the
/// keycode has no local mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyEvent {
    pub code: u16,
    pub modifiers: u32,
    pub down: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKey {
    PlayPause,
    Next,
    Previous,
    VolumeUp,
    VolumeDown,
    Mute,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaKeyEvent {
    pub key: MediaKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayRole {
    Host,
    Client,
}

/// Logical relay channel: `tcp` is forwarded reliably end to end, `udp` may
/// be dropped by the relay under load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayChannel {
    Tcp,
    Udp,
}

/// Control envelope exchanged with the relay server as WebSocket text
/// frames. Binary WebSocket frames bypass this envelope entirely: they are
/// `[kind:1][encrypted_body]` datagrams on the unreliable channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RelayMessage {
    /// Associate this socket with a session; sent on connect and again on
    /// every PIN rotation.
    Register {
        session_id: String,
        role: RelayRole,
    },
    /// An opaque datagram (`[kind:1][body]`, base64) for the peer.
    Relay {
        session_id: String,
        channel: RelayChannel,
        payload: String,
    },
    /// Best-effort STUN-discovered mapped address publish.
    Candidate {
        session_id: String,
        ip: String,
        port: u16,
    },
    Error {
        message: String,
    },
}
