//! Stream profiles negotiated at handshake and tuned at runtime.

use serde::{Deserialize, Serialize};

use crate::config::VideoConfig;
use crate::messages::HandshakeRequest;

/// Video codec selection. HEVC variants map onto hardware encoder profiles;
/// 4:2:2 10-bit is only reachable on hosts whose encoder advertises it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoCodec {
    #[serde(rename = "h264")]
    H264,
    #[serde(rename = "hevc-main")]
    HevcMain,
    #[serde(rename = "hevc-main10")]
    HevcMain10,
    #[serde(rename = "hevc-422-10")]
    Hevc422_10,
}

impl VideoCodec {
    pub fn is_hevc(self) -> bool {
        !matches!(self, Self::H264)
    }
}

/// The negotiated stream profile: created at handshake, mutated by the
/// adaptive controller, read by the encoder configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamProfile {
    /// Target video bitrate in bits per second.
    pub bitrate: u64,
    pub frame_rate: u32,
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    /// Chunk-level loss recovery requested (local transports only).
    pub lossless: bool,
    /// Fragmented UDP delivery instead of the TCP stream.
    pub low_latency: bool,
    pub audio: bool,
}

impl StreamProfile {
    /// Profile for a client paired over the local UDP/TCP transport:
    /// honour the client's latency and lossless wishes.
    pub fn local(req: &HandshakeRequest, video: &VideoConfig) -> Self {
        Self {
            bitrate: video.bitrate,
            frame_rate: video.framerate,
            codec: req.preferred_codec.unwrap_or(VideoCodec::HevcMain),
            width: req.screen_width,
            height: req.screen_height,
            lossless: req.want_lossless_video,
            low_latency: req.prefer_low_latency,
            audio: req.want_audio,
        }
    }

    /// Profile for a client paired through the internet relay: low-latency
    /// forced on, lossless off, HEVC main pinned (no runtime codec switch
    /// without a client decoder re-init), conservative bitrate, and the
    /// client's own pixel dimensions (no host-native upscaling).
    pub fn relay(req: &HandshakeRequest, video: &VideoConfig) -> Self {
        Self {
            bitrate: video.relay_bitrate,
            frame_rate: video.relay_framerate,
            codec: VideoCodec::HevcMain,
            width: req.screen_width,
            height: req.screen_height,
            lossless: false,
            low_latency: true,
            audio: req.want_audio,
        }
    }

    /// Close-range P2P uses the local policy; the transport layer decides
    /// reliable vs unreliable delivery from `low_latency`.
    pub fn nearby(req: &HandshakeRequest, video: &VideoConfig) -> Self {
        Self::local(req, video)
    }
}
