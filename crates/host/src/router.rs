//! The transport router: every inbound packet, from every transport, lands
//! here exactly once and is dispatched by kind.
//!
//! Control replies (`handshake_ack`, `pairing_failed`, `pong`) go back on
//! the transport and channel that carried the inbound packet. Input and
//! NACKs are gated on the one-active-client policy so a replaced client's
//! packets die here. Anything unexpected is dropped and counted, never
//! answered.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use aircatch_protocol::messages::{ChunkNack, PingBody, PongBody, QualityReport};
use aircatch_protocol::packet::{Packet, PacketKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::adaptive::AdaptiveEvent;
use crate::input::InputDispatcher;
use crate::session::{HandshakeOutcome, SessionManager};
use crate::transport::{Inbound, Outbound, PacketOrigin, TransportKind};
use crate::video::CacheOp;

/// Drop accounting, exposed for logs and diagnostics.
#[derive(Default)]
pub struct RouterCounters {
    pub dropped: AtomicU64,
}

pub struct Router {
    session: Arc<SessionManager>,
    input: Arc<InputDispatcher>,
    outbound: Arc<Outbound>,
    adaptive_tx: mpsc::Sender<AdaptiveEvent>,
    cache_tx: mpsc::UnboundedSender<CacheOp>,
    counters: Arc<RouterCounters>,
}

impl Router {
    pub fn new(
        session: Arc<SessionManager>,
        input: Arc<InputDispatcher>,
        outbound: Arc<Outbound>,
        adaptive_tx: mpsc::Sender<AdaptiveEvent>,
        cache_tx: mpsc::UnboundedSender<CacheOp>,
    ) -> Self {
        Self {
            session,
            input,
            outbound,
            adaptive_tx,
            cache_tx,
            counters: Arc::new(RouterCounters::default()),
        }
    }

    pub fn counters(&self) -> Arc<RouterCounters> {
        self.counters.clone()
    }

    pub fn spawn(self, mut inbound_rx: mpsc::Receiver<Inbound>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = inbound_rx.recv().await {
                match event {
                    Inbound::Packet(origin, packet) => self.dispatch(origin, packet).await,
                    Inbound::Closed(origin) => {
                        if self.session.client_matches(&origin.identity()).await {
                            warn!(?origin, "transport failure for the bound client");
                            self.session.teardown("transport failure").await;
                        }
                    }
                }
            }
            debug!("router inbound channel closed");
        })
    }

    async fn dispatch(&self, origin: PacketOrigin, packet: Packet) {
        match packet.kind {
            PacketKind::HandshakeRequest => {
                match self
                    .session
                    .handle_handshake(&origin, &packet.payload)
                    .await
                {
                    HandshakeOutcome::Accepted(ack) => {
                        self.outbound
                            .send_control(&origin, PacketKind::HandshakeAck, &ack)
                            .await;
                    }
                    HandshakeOutcome::Rejected => {
                        self.outbound
                            .send_control(&origin, PacketKind::PairingFailed, &[])
                            .await;
                    }
                    HandshakeOutcome::Ignored => self.drop_packet(&origin, packet.kind),
                }
            }
            PacketKind::VideoFrameChunkNack => self.handle_nack(&origin, &packet.payload).await,
            kind if kind.is_input() => {
                if self.session.client_matches(&origin.identity()).await {
                    self.input.dispatch(kind, &packet.payload);
                } else {
                    self.drop_packet(&origin, kind);
                }
            }
            PacketKind::Ping => self.handle_ping(&origin, &packet.payload).await,
            PacketKind::QualityReport => {
                match serde_json::from_slice::<QualityReport>(&packet.payload) {
                    Ok(report) => {
                        let _ = self.adaptive_tx.send(AdaptiveEvent::Report(report)).await;
                    }
                    Err(e) => {
                        debug!("malformed quality report: {e}");
                        self.drop_packet(&origin, packet.kind);
                    }
                }
            }
            PacketKind::Disconnect => {
                if self.session.client_matches(&origin.identity()).await {
                    self.session.teardown("client disconnected").await;
                } else {
                    self.drop_packet(&origin, packet.kind);
                }
            }
            // Host-to-client kinds arriving inbound are protocol violations.
            other => self.drop_packet(&origin, other),
        }
    }

    /// NACKs are honoured from the local paths only, and only while a
    /// lossless local session is active.
    async fn handle_nack(&self, origin: &PacketOrigin, payload: &[u8]) {
        let host = match origin {
            PacketOrigin::LocalUdp(addr) | PacketOrigin::LocalTcp(addr) => addr.ip().to_string(),
            _ => {
                self.drop_packet(origin, PacketKind::VideoFrameChunkNack);
                return;
            }
        };
        let Some(snapshot) = self.session.stream_snapshot().await else {
            self.drop_packet(origin, PacketKind::VideoFrameChunkNack);
            return;
        };
        if !snapshot.lossless
            || snapshot.transport == TransportKind::Relay
            || !self.session.client_matches(&origin.identity()).await
        {
            self.drop_packet(origin, PacketKind::VideoFrameChunkNack);
            return;
        }
        match serde_json::from_slice::<ChunkNack>(payload) {
            Ok(nack) => {
                let _ = self.cache_tx.send(CacheOp::Retransmit { nack, host });
            }
            Err(e) => {
                debug!("malformed NACK: {e}");
                self.drop_packet(origin, PacketKind::VideoFrameChunkNack);
            }
        }
    }

    async fn handle_ping(&self, origin: &PacketOrigin, payload: &[u8]) {
        let body: PingBody = match serde_json::from_slice(payload) {
            Ok(body) => body,
            Err(e) => {
                debug!("malformed ping: {e}");
                self.drop_packet(origin, PacketKind::Ping);
                return;
            }
        };
        if let Some(rtt_ms) = body.rtt_ms {
            let _ = self
                .adaptive_tx
                .send(AdaptiveEvent::RttSample(rtt_ms))
                .await;
        }
        let pong = PongBody {
            client_ts: body.client_ts,
            host_ts: epoch_millis(),
        };
        match serde_json::to_vec(&pong) {
            Ok(json) => {
                self.outbound
                    .send_control(origin, PacketKind::Pong, &json)
                    .await;
            }
            Err(e) => warn!("pong serialization failed: {e}"),
        }
    }

    fn drop_packet(&self, origin: &PacketOrigin, kind: PacketKind) {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        debug!(?origin, ?kind, "dropping packet");
    }
}

fn epoch_millis() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
        * 1000.0
}
