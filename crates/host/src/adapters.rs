//! Capability traits for the OS-specific collaborators.
//!
//! The engine never touches capture, encoding, injection, mDNS, the
//! close-range radio framework, or STUN sockets directly: platform shells
//! implement these traits and inject them at [`Engine`](crate::engine::Engine)
//! construction. Tests stub them with in-memory fakes.
//!
//! All methods are non-suspending from the engine's point of view;
//! implementations that need real I/O queue internally (the engine calls
//! them from async tasks and must not stall the packet path).

use std::net::IpAddr;
use std::time::Duration;

use aircatch_protocol::messages::MediaKey;
use aircatch_protocol::packet::PacketKind;
use aircatch_protocol::profile::StreamProfile;

/// Control surface of the hardware video/audio encoder.
///
/// Encoded output does not flow through this trait: the adapter pushes
/// PTS-prefixed annex-B access units and PCM buffers into the channels
/// handed over as [`MediaChannels`](crate::engine::MediaChannels). Closing
/// those channels signals an unrecoverable adapter failure.
///
/// Implementations apply `set_bitrate` as the average target and are
/// expected to cap the instantaneous data rate at `2.5 × bitrate / 8`
/// bytes per second.
pub trait EncoderControl: Send + Sync {
    /// Start, or reconfigure a running session for a new profile (a
    /// re-handshake changes dimensions and codec without a stop).
    fn start(&self, profile: &StreamProfile) -> anyhow::Result<()>;
    fn stop(&self);
    fn set_bitrate(&self, bps: u64);
    fn set_frame_rate(&self, fps: u32);
    fn capture_dimensions(&self) -> (u32, u32);
    /// Running total of frames delivered to the output callback.
    fn frames_encoded(&self) -> u64;
    /// Running total of capture frames the encoder had to skip.
    fn frames_skipped(&self) -> u64;
}

/// Pointer contact state derived from the client's touch phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerKind {
    Down,
    Move,
    Up,
    Cancel,
}

/// Injects client input into the host OS.
pub trait InputInjector: Send + Sync {
    /// `norm_x`/`norm_y` are in 0.0..=1.0 of `screen_frame` (the client's
    /// view of the streamed display, width × height).
    fn inject_pointer(
        &self,
        norm_x: f64,
        norm_y: f64,
        kind: PointerKind,
        screen_frame: (f64, f64),
    ) -> anyhow::Result<()>;
    fn inject_scroll(&self, dx: f64, dy: f64, at: (f64, f64)) -> anyhow::Result<()>;
    fn inject_key(&self, code: u16, modifiers: u32, down: bool) -> anyhow::Result<()>;
    fn inject_text(&self, text: &str) -> anyhow::Result<()>;
    fn inject_media_key(&self, key: MediaKey) -> anyhow::Result<()>;
}

/// Host display geometry and optional virtual-display management.
pub trait DisplayProvider: Send + Sync {
    /// Pixel dimensions of the display being mirrored.
    fn main_display_frame(&self) -> (u32, u32);
    fn create_virtual_display(&self, width: u32, height: u32) -> anyhow::Result<()> {
        let _ = (width, height);
        anyhow::bail!("virtual displays not supported on this host")
    }
    fn destroy_virtual_display(&self) {}
}

/// DNS-SD service registration.
pub trait Advertiser: Send + Sync {
    fn start(
        &self,
        service_type: &str,
        name: &str,
        tcp_port: u16,
        udp_port: u16,
        txt: &[(String, String)],
    ) -> anyhow::Result<()>;
    fn stop(&self);
}

/// Delivery mode on the close-range P2P link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    Reliable,
    Unreliable,
}

/// OS close-range P2P framework (peer discovery, invitations, and radio
/// links are its problem; pairing remains PIN-enforced at the handshake
/// layer, so implementations accept all invitations unconditionally).
///
/// Inbound datagrams surface on the channel handed over in
/// [`NearbyChannels`](crate::engine::NearbyChannels).
pub trait NearbyLink: Send + Sync {
    fn start(&self) -> anyhow::Result<()>;
    fn stop(&self);
    fn send(&self, peer: &str, kind: PacketKind, payload: &[u8], mode: SendMode)
    -> anyhow::Result<()>;
    fn broadcast(&self, kind: PacketKind, payload: &[u8], mode: SendMode) -> anyhow::Result<()>;
}

/// Minimal STUN binding client for the best-effort candidate publish.
/// Expected to block no longer than `timeout`; the engine calls it off the
/// async executor.
pub trait StunProbe: Send + Sync {
    fn discover_mapped_address(
        &self,
        stun_host: &str,
        local_port: u16,
        timeout: Duration,
    ) -> Option<(IpAddr, u16)>;
}
