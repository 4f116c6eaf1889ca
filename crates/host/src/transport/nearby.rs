//! Close-range P2P transport, a thin adapter over the OS framework.
//!
//! The framework owns discovery, invitations (accepted unconditionally;
//! pairing is enforced by PIN at the handshake layer), and the radio links.
//! This layer only maps packets onto the framework's reliable/unreliable
//! send modes and feeds inbound datagrams to the router.

use std::sync::Arc;

use aircatch_protocol::packet::{self, PacketKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{Inbound, PacketOrigin};
use crate::adapters::{NearbyLink, SendMode};

pub struct NearbyTransport {
    link: Arc<dyn NearbyLink>,
}

impl NearbyTransport {
    pub fn new(link: Arc<dyn NearbyLink>) -> Arc<Self> {
        Arc::new(Self { link })
    }

    pub fn start(&self) -> anyhow::Result<()> {
        self.link.start()
    }

    pub fn stop(&self) {
        self.link.stop();
    }

    pub fn send_to(&self, peer: &str, kind: PacketKind, payload: &[u8], mode: SendMode) {
        if let Err(e) = self.link.send(peer, kind, payload, mode) {
            debug!(peer, "close-range send failed: {e:#}");
        }
    }

    pub fn broadcast(&self, kind: PacketKind, payload: &[u8], mode: SendMode) {
        if let Err(e) = self.link.broadcast(kind, payload, mode) {
            debug!("close-range broadcast failed: {e:#}");
        }
    }

    /// Pump framework-delivered datagrams into the router. The channel
    /// closes when the framework stops.
    pub fn spawn_intake(
        mut packets_rx: mpsc::Receiver<(String, Vec<u8>)>,
        inbound_tx: mpsc::Sender<Inbound>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some((peer, data)) = packets_rx.recv().await {
                match packet::decode_datagram(&data) {
                    Some(frame) => {
                        if inbound_tx
                            .send(Inbound::Packet(PacketOrigin::Nearby { peer }, frame))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    None => debug!(peer, len = data.len(), "undecodable close-range datagram"),
                }
            }
            info!("close-range packet stream ended");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingLink {
        sent: Mutex<Vec<(String, PacketKind, usize, SendMode)>>,
    }

    impl NearbyLink for RecordingLink {
        fn start(&self) -> anyhow::Result<()> {
            Ok(())
        }
        fn stop(&self) {}
        fn send(
            &self,
            peer: &str,
            kind: PacketKind,
            payload: &[u8],
            mode: SendMode,
        ) -> anyhow::Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((peer.to_string(), kind, payload.len(), mode));
            Ok(())
        }
        fn broadcast(&self, kind: PacketKind, payload: &[u8], mode: SendMode) -> anyhow::Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push(("*".to_string(), kind, payload.len(), mode));
            Ok(())
        }
    }

    #[tokio::test]
    async fn intake_decodes_datagrams_and_tags_the_peer() {
        let (packets_tx, packets_rx) = mpsc::channel(8);
        let (inbound_tx, mut inbound_rx) = mpsc::channel(8);
        let _intake = NearbyTransport::spawn_intake(packets_rx, inbound_tx);

        packets_tx
            .send((
                "ipad-5C".to_string(),
                packet::encode_datagram(PacketKind::TouchEvent, b"{}"),
            ))
            .await
            .unwrap();

        match inbound_rx.recv().await.unwrap() {
            Inbound::Packet(PacketOrigin::Nearby { peer }, frame) => {
                assert_eq!(peer, "ipad-5C");
                assert_eq!(frame.kind, PacketKind::TouchEvent);
            }
            other => panic!("expected nearby packet, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_modes_pass_through() {
        let link = Arc::new(RecordingLink::default());
        let transport = NearbyTransport::new(link.clone());
        transport.send_to("ipad-5C", PacketKind::HandshakeAck, &[1], SendMode::Reliable);
        transport.broadcast(PacketKind::VideoFrameChunk, &[2, 3], SendMode::Unreliable);

        let sent = link.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].3, SendMode::Reliable);
        assert_eq!(sent[1].0, "*");
        assert_eq!(sent[1].3, SendMode::Unreliable);
    }
}
