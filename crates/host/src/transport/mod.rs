//! Transports: local UDP/TCP, internet relay, close-range P2P.
//!
//! Listeners parse wire bytes into [`Inbound`] events for the router; the
//! [`Outbound`] handle picks the right transport and channel for replies and
//! media. Transports never call into each other; every cross-transport
//! effect goes through the router.

pub mod local;
pub mod nearby;
pub mod relay;

use std::net::SocketAddr;
use std::sync::Arc;

use aircatch_protocol::messages::RelayChannel;
use aircatch_protocol::packet::{Packet, PacketKind};

use crate::adapters::SendMode;
use self::local::LocalTransport;
use self::nearby::NearbyTransport;
use self::relay::RelayTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Local,
    Relay,
    Nearby,
}

/// Where an inbound packet entered the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketOrigin {
    LocalUdp(SocketAddr),
    LocalTcp(SocketAddr),
    Relay(RelayChannel),
    Nearby { peer: String },
}

impl PacketOrigin {
    pub fn transport(&self) -> TransportKind {
        match self {
            Self::LocalUdp(_) | Self::LocalTcp(_) => TransportKind::Local,
            Self::Relay(_) => TransportKind::Relay,
            Self::Nearby { .. } => TransportKind::Nearby,
        }
    }

    /// Stable client identity for the one-active-client policy. Local
    /// clients are identified by source IP: the handshake usually arrives on
    /// TCP while input and NACKs arrive on UDP, and both must match the same
    /// binding.
    pub fn identity(&self) -> ClientIdentity {
        match self {
            Self::LocalUdp(addr) | Self::LocalTcp(addr) => ClientIdentity::Local {
                host: addr.ip().to_string(),
            },
            Self::Relay(_) => ClientIdentity::Relay,
            Self::Nearby { peer } => ClientIdentity::Nearby { peer: peer.clone() },
        }
    }
}

/// Identity a client binding is keyed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientIdentity {
    Local { host: String },
    Relay,
    Nearby { peer: String },
}

/// Events flowing from listener tasks to the router.
#[derive(Debug)]
pub enum Inbound {
    Packet(PacketOrigin, Packet),
    /// The connection behind `origin` failed or closed. The router tears the
    /// session down when it belonged to the bound client.
    Closed(PacketOrigin),
}

/// Outbound dispatch over whichever transports this engine instance runs.
///
/// Control replies go back on the channel that carried the inbound packet
/// (TCP-like where the transport distinguishes); media is addressed by the
/// active session's transport.
pub struct Outbound {
    pub local: Arc<LocalTransport>,
    pub relay: Option<Arc<RelayTransport>>,
    pub nearby: Option<Arc<NearbyTransport>>,
}

impl Outbound {
    /// Reply to `origin` with a control packet on the same transport and
    /// channel it used.
    pub async fn send_control(&self, origin: &PacketOrigin, kind: PacketKind, payload: &[u8]) {
        match origin {
            PacketOrigin::LocalUdp(addr) => self.local.send_datagram_to(*addr, kind, payload).await,
            PacketOrigin::LocalTcp(addr) => self.local.send_stream_to(*addr, kind, payload).await,
            PacketOrigin::Relay(_) => {
                if let Some(relay) = &self.relay {
                    relay.send_reliable(kind, payload).await;
                }
            }
            PacketOrigin::Nearby { peer } => {
                if let Some(nearby) = &self.nearby {
                    nearby.send_to(peer, kind, payload, SendMode::Reliable);
                }
            }
        }
    }

    /// A whole encrypted frame, sent once on the session's transport.
    /// `reliable_video` is the close-range mode choice: reliable only when
    /// the client preferred reliability over latency.
    pub async fn send_video_frame(
        &self,
        transport: TransportKind,
        payload: &[u8],
        reliable_video: bool,
    ) {
        match transport {
            TransportKind::Local => self.local.broadcast_stream(PacketKind::VideoFrame, payload).await,
            TransportKind::Relay => {
                if let Some(relay) = &self.relay {
                    relay.send_media(PacketKind::VideoFrame, payload).await;
                }
            }
            TransportKind::Nearby => {
                if let Some(nearby) = &self.nearby {
                    let mode = if reliable_video {
                        SendMode::Reliable
                    } else {
                        SendMode::Unreliable
                    };
                    nearby.broadcast(PacketKind::VideoFrame, payload, mode);
                }
            }
        }
    }

    /// One chunk of a fragmented frame, on the lossy path.
    pub async fn send_video_chunk(&self, transport: TransportKind, chunk: &[u8]) {
        match transport {
            TransportKind::Local => {
                self.local
                    .broadcast_datagram(PacketKind::VideoFrameChunk, chunk)
                    .await
            }
            TransportKind::Relay => {
                if let Some(relay) = &self.relay {
                    relay.send_media(PacketKind::VideoFrameChunk, chunk).await;
                }
            }
            TransportKind::Nearby => {
                if let Some(nearby) = &self.nearby {
                    nearby.broadcast(PacketKind::VideoFrameChunk, chunk, SendMode::Unreliable);
                }
            }
        }
    }

    /// A control notice for the paired client on its transport's reliable
    /// channel (quality adjustments, host-initiated disconnects).
    pub async fn send_notice(&self, transport: TransportKind, kind: PacketKind, payload: &[u8]) {
        match transport {
            TransportKind::Local => self.local.broadcast_stream(kind, payload).await,
            TransportKind::Relay => {
                if let Some(relay) = &self.relay {
                    relay.send_reliable(kind, payload).await;
                }
            }
            TransportKind::Nearby => {
                if let Some(nearby) = &self.nearby {
                    nearby.broadcast(kind, payload, SendMode::Reliable);
                }
            }
        }
    }

    /// An encrypted PCM buffer as a single datagram.
    pub async fn send_audio(&self, transport: TransportKind, payload: &[u8]) {
        match transport {
            TransportKind::Local => {
                self.local
                    .broadcast_datagram(PacketKind::AudioPcm, payload)
                    .await
            }
            TransportKind::Relay => {
                if let Some(relay) = &self.relay {
                    relay.send_media(PacketKind::AudioPcm, payload).await;
                }
            }
            TransportKind::Nearby => {
                if let Some(nearby) = &self.nearby {
                    nearby.broadcast(PacketKind::AudioPcm, payload, SendMode::Unreliable);
                }
            }
        }
    }
}
