//! Internet relay transport: one WebSocket to the rendezvous server.
//!
//! Control and the reliable virtual channel ride JSON text envelopes with
//! base64 datagrams; video and audio ride binary frames (`[kind:1][body]`)
//! to skip the base64 overhead. The socket is not reconnected here: a relay
//! failure is a session disconnect, and the session manager decides what
//! happens next.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use aircatch_protocol::messages::{RelayChannel, RelayMessage, RelayRole};
use aircatch_protocol::packet::{self, PacketKind};
use anyhow::Context;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{Inbound, PacketOrigin};
use crate::adapters::StunProbe;

/// Video sends are dropped while more than this many bytes await the socket.
const PENDING_LIMIT: i64 = 1_000_000;

/// Hard per-message ceiling the relay server enforces.
const MAX_MESSAGE: usize = 500_000;

const OUTBOX_DEPTH: usize = 256;

const STUN_HOST: &str = "stun.l.google.com:19302";
const STUN_TIMEOUT: Duration = Duration::from_secs(2);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct RelayTransport {
    outbox_tx: mpsc::Sender<Message>,
    /// Bytes enqueued but not yet handed to the socket.
    pending_bytes: Arc<AtomicI64>,
    session_id: RwLock<String>,
    media_dropped: AtomicU64,
}

impl RelayTransport {
    /// Connect to the relay, register the session, and kick off a
    /// best-effort STUN candidate publish.
    pub async fn connect(
        url: &str,
        session_id: String,
        udp_port: u16,
        stun: Arc<dyn StunProbe>,
        inbound_tx: mpsc::Sender<Inbound>,
    ) -> anyhow::Result<(Arc<Self>, JoinHandle<()>)> {
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .context("relay WebSocket connection failed")?;
        info!(url, "connected to relay");

        let (outbox_tx, outbox_rx) = mpsc::channel(OUTBOX_DEPTH);
        let transport = Arc::new(Self {
            outbox_tx,
            pending_bytes: Arc::new(AtomicI64::new(0)),
            session_id: RwLock::new(session_id),
            media_dropped: AtomicU64::new(0),
        });
        transport.send_register().await;
        transport.clone().publish_stun_candidate(stun, udp_port);

        let task = tokio::spawn(run_socket(
            ws,
            outbox_rx,
            transport.pending_bytes.clone(),
            inbound_tx,
        ));
        Ok((transport, task))
    }

    /// Re-announce after a PIN rotation: the relay keys sessions by PIN.
    pub async fn register_session(&self, session_id: String) {
        *self.session_id.write().await = session_id;
        self.send_register().await;
    }

    async fn send_register(&self) {
        let message = RelayMessage::Register {
            session_id: self.session_id.read().await.clone(),
            role: RelayRole::Host,
        };
        self.queue_control(&message).await;
    }

    fn publish_stun_candidate(self: Arc<Self>, stun: Arc<dyn StunProbe>, udp_port: u16) {
        tokio::spawn(async move {
            let mapped = tokio::task::spawn_blocking(move || {
                stun.discover_mapped_address(STUN_HOST, udp_port, STUN_TIMEOUT)
            })
            .await
            .ok()
            .flatten();
            match mapped {
                Some((ip, port)) => {
                    let message = RelayMessage::Candidate {
                        session_id: self.session_id.read().await.clone(),
                        ip: ip.to_string(),
                        port,
                    };
                    info!(%ip, port, "publishing STUN candidate");
                    self.queue_control(&message).await;
                }
                None => debug!("STUN probe produced no mapped address"),
            }
        });
    }

    /// Control and reliable-channel traffic: JSON text envelope.
    pub async fn send_reliable(&self, kind: PacketKind, payload: &[u8]) {
        let datagram = packet::encode_datagram(kind, payload);
        if datagram.len() > MAX_MESSAGE {
            info!(len = datagram.len(), "dropping oversize reliable relay message");
            return;
        }
        let message = RelayMessage::Relay {
            session_id: self.session_id.read().await.clone(),
            channel: RelayChannel::Tcp,
            payload: BASE64.encode(&datagram),
        };
        self.queue_control(&message).await;
    }

    /// Media on the unreliable channel: binary frame, dropped under
    /// backpressure rather than queued behind a slow uplink.
    pub async fn send_media(&self, kind: PacketKind, payload: &[u8]) {
        let len = payload.len() + 1;
        if len > MAX_MESSAGE {
            info!(len, "dropping relay media message over the size ceiling");
            self.media_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let is_video = matches!(kind, PacketKind::VideoFrame | PacketKind::VideoFrameChunk);
        if is_video && self.pending_bytes.load(Ordering::SeqCst) > PENDING_LIMIT {
            info!("relay backpressure, dropping video frame");
            self.media_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let message = Message::binary(packet::encode_datagram(kind, payload));
        self.pending_bytes
            .fetch_add(message.len() as i64, Ordering::SeqCst);
        match self.outbox_tx.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(message))
            | Err(mpsc::error::TrySendError::Closed(message)) => {
                self.pending_bytes
                    .fetch_sub(message.len() as i64, Ordering::SeqCst);
                self.media_dropped.fetch_add(1, Ordering::Relaxed);
                debug!("relay outbox unavailable, dropping media message");
            }
        }
    }

    pub fn media_dropped(&self) -> u64 {
        self.media_dropped.load(Ordering::Relaxed)
    }

    async fn queue_control(&self, message: &RelayMessage) {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                warn!("relay envelope serialization failed: {e}");
                return;
            }
        };
        let message = Message::text(text);
        self.pending_bytes
            .fetch_add(message.len() as i64, Ordering::SeqCst);
        if self.outbox_tx.send(message).await.is_err() {
            debug!("relay outbox closed, dropping control message");
        }
    }
}

/// Socket pump: forwards the outbox and parses inbound envelopes. Exits on
/// any socket error or close; the router receives `Closed` and treats it as
/// a disconnect for the owning session.
async fn run_socket(
    ws: WsStream,
    mut outbox_rx: mpsc::Receiver<Message>,
    pending_bytes: Arc<AtomicI64>,
    inbound_tx: mpsc::Sender<Inbound>,
) {
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    handle_text_frame(text.as_str(), &inbound_tx).await;
                }
                Some(Ok(Message::Binary(data))) => {
                    // Binary frames are always the unreliable channel.
                    match packet::decode_datagram(&data) {
                        Some(frame) => {
                            let origin = PacketOrigin::Relay(RelayChannel::Udp);
                            if inbound_tx.send(Inbound::Packet(origin, frame)).await.is_err() {
                                return;
                            }
                        }
                        None => debug!(len = data.len(), "undecodable relay binary frame"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("relay socket error: {e}");
                    break;
                }
            },
            outgoing = outbox_rx.recv() => match outgoing {
                Some(message) => {
                    let len = message.len() as i64;
                    let result = sink.send(message).await;
                    pending_bytes.fetch_sub(len, Ordering::SeqCst);
                    if let Err(e) = result {
                        warn!("relay send failed: {e}");
                        break;
                    }
                }
                None => break,
            },
        }
    }
    info!("relay connection closed");
    let _ = inbound_tx
        .send(Inbound::Closed(PacketOrigin::Relay(RelayChannel::Tcp)))
        .await;
}

async fn handle_text_frame(text: &str, inbound_tx: &mpsc::Sender<Inbound>) {
    match serde_json::from_str::<RelayMessage>(text) {
        Ok(RelayMessage::Relay {
            channel, payload, ..
        }) => {
            let Ok(datagram) = BASE64.decode(&payload) else {
                debug!("relay payload with invalid base64");
                return;
            };
            match packet::decode_datagram(&datagram) {
                Some(frame) => {
                    let _ = inbound_tx
                        .send(Inbound::Packet(PacketOrigin::Relay(channel), frame))
                        .await;
                }
                None => debug!("undecodable relayed datagram"),
            }
        }
        Ok(RelayMessage::Error { message }) => warn!(message, "relay reported an error"),
        Ok(other) => debug!(?other, "ignoring relay control message"),
        Err(e) => debug!("malformed relay envelope: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;
    use tokio::net::TcpListener;

    struct FakeStun {
        mapped: Option<(IpAddr, u16)>,
    }

    impl StunProbe for FakeStun {
        fn discover_mapped_address(
            &self,
            _stun_host: &str,
            _local_port: u16,
            _timeout: Duration,
        ) -> Option<(IpAddr, u16)> {
            self.mapped
        }
    }

    /// Minimal in-process relay: accepts one socket and exchanges frames
    /// over channels with the test body.
    async fn fake_relay() -> (
        String,
        mpsc::Receiver<Message>,
        mpsc::Sender<Message>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (seen_tx, seen_rx) = mpsc::channel(64);
        let (inject_tx, mut inject_rx) = mpsc::channel::<Message>(64);
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            let (mut sink, mut stream) = ws.split();
            loop {
                tokio::select! {
                    Some(frame) = stream.next() => {
                        let Ok(frame) = frame else { break };
                        if seen_tx.send(frame).await.is_err() { break; }
                    }
                    Some(frame) = inject_rx.recv() => {
                        if sink.send(frame).await.is_err() { break; }
                    }
                    else => break,
                }
            }
        });
        (url, seen_rx, inject_tx)
    }

    #[tokio::test]
    async fn registers_then_publishes_stun_candidate() {
        let (url, mut seen_rx, _inject_tx) = fake_relay().await;
        let (inbound_tx, _inbound_rx) = mpsc::channel(16);
        let stun = Arc::new(FakeStun {
            mapped: Some(("203.0.113.9".parse().unwrap(), 40112)),
        });
        let (_relay, _task) = RelayTransport::connect(&url, "ABCDEF".into(), 0, stun, inbound_tx)
            .await
            .unwrap();

        let register = seen_rx.recv().await.unwrap();
        match serde_json::from_str::<RelayMessage>(register.to_text().unwrap()).unwrap() {
            RelayMessage::Register { session_id, role } => {
                assert_eq!(session_id, "ABCDEF");
                assert_eq!(role, RelayRole::Host);
            }
            other => panic!("expected Register first, got {other:?}"),
        }

        let candidate = seen_rx.recv().await.unwrap();
        match serde_json::from_str::<RelayMessage>(candidate.to_text().unwrap()).unwrap() {
            RelayMessage::Candidate { ip, port, .. } => {
                assert_eq!(ip, "203.0.113.9");
                assert_eq!(port, 40112);
            }
            other => panic!("expected Candidate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn relayed_text_envelope_reaches_the_router() {
        let (url, mut seen_rx, inject_tx) = fake_relay().await;
        let (inbound_tx, mut inbound_rx) = mpsc::channel(16);
        let stun = Arc::new(FakeStun { mapped: None });
        let (_relay, _task) = RelayTransport::connect(&url, "ABCDEF".into(), 0, stun, inbound_tx)
            .await
            .unwrap();
        let _register = seen_rx.recv().await.unwrap();

        let datagram = packet::encode_datagram(PacketKind::Disconnect, &[]);
        let envelope = RelayMessage::Relay {
            session_id: "ABCDEF".into(),
            channel: RelayChannel::Tcp,
            payload: BASE64.encode(&datagram),
        };
        inject_tx
            .send(Message::text(serde_json::to_string(&envelope).unwrap()))
            .await
            .unwrap();

        match inbound_rx.recv().await.unwrap() {
            Inbound::Packet(PacketOrigin::Relay(RelayChannel::Tcp), frame) => {
                assert_eq!(frame.kind, PacketKind::Disconnect);
            }
            other => panic!("expected relayed packet, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn media_goes_out_as_binary_frames() {
        let (url, mut seen_rx, _inject_tx) = fake_relay().await;
        let (inbound_tx, _inbound_rx) = mpsc::channel(16);
        let stun = Arc::new(FakeStun { mapped: None });
        let (relay, _task) = RelayTransport::connect(&url, "ABCDEF".into(), 0, stun, inbound_tx)
            .await
            .unwrap();
        let _register = seen_rx.recv().await.unwrap();

        relay.send_media(PacketKind::VideoFrame, &[0xAA; 32]).await;
        let frame = seen_rx.recv().await.unwrap();
        match frame {
            Message::Binary(data) => {
                assert_eq!(data[0], PacketKind::VideoFrame.tag());
                assert_eq!(data.len(), 33);
            }
            other => panic!("expected binary frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversize_media_is_dropped() {
        let (url, mut seen_rx, _inject_tx) = fake_relay().await;
        let (inbound_tx, _inbound_rx) = mpsc::channel(16);
        let stun = Arc::new(FakeStun { mapped: None });
        let (relay, _task) = RelayTransport::connect(&url, "ABCDEF".into(), 0, stun, inbound_tx)
            .await
            .unwrap();
        let _register = seen_rx.recv().await.unwrap();

        relay
            .send_media(PacketKind::VideoFrame, &vec![0u8; MAX_MESSAGE])
            .await;
        assert_eq!(relay.media_dropped(), 1);

        // A sane frame still goes through afterwards
        relay.send_media(PacketKind::VideoFrame, &[1, 2, 3]).await;
        match seen_rx.recv().await.unwrap() {
            Message::Binary(data) => assert_eq!(data.len(), 4),
            other => panic!("expected binary frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pin_rotation_reregisters() {
        let (url, mut seen_rx, _inject_tx) = fake_relay().await;
        let (inbound_tx, _inbound_rx) = mpsc::channel(16);
        let stun = Arc::new(FakeStun { mapped: None });
        let (relay, _task) = RelayTransport::connect(&url, "ABCDEF".into(), 0, stun, inbound_tx)
            .await
            .unwrap();
        let _first = seen_rx.recv().await.unwrap();

        relay.register_session("XYZ234".into()).await;
        let second = seen_rx.recv().await.unwrap();
        match serde_json::from_str::<RelayMessage>(second.to_text().unwrap()).unwrap() {
            RelayMessage::Register { session_id, .. } => assert_eq!(session_id, "XYZ234"),
            other => panic!("expected Register, got {other:?}"),
        }
    }
}
