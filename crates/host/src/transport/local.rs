//! Local direct transport: a UDP listener/broadcaster for the lossy media
//! path and a length-prefixed TCP listener for the reliable path.
//!
//! Every distinct UDP endpoint that sends us anything is registered in the
//! peer table; broadcast goes to all `ready` peers. A `host → last known
//! endpoint` map targets NACK retransmits at whichever socket the client
//! most recently used.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use aircatch_protocol::packet::{self, FramingError, PacketKind, StreamDecoder};
use anyhow::Context;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Inbound, PacketOrigin};

const UDP_RECV_BUF: usize = 65536;

/// Aggressive keepalive so a vanished client surfaces as a transport
/// failure within seconds instead of minutes.
const KEEPALIVE_IDLE: Duration = Duration::from_secs(2);

/// Outbox depth per TCP connection. Full outbox means the client can't keep
/// up; video frames are dropped rather than queued unboundedly.
const STREAM_OUTBOX: usize = 64;

#[derive(Debug, Clone, Copy)]
struct UdpPeer {
    ready: bool,
}

pub struct LocalTransport {
    udp: UdpSocket,
    udp_port: u16,
    tcp_port: u16,
    peers: RwLock<HashMap<SocketAddr, UdpPeer>>,
    endpoints_by_host: RwLock<HashMap<String, SocketAddr>>,
    streams: RwLock<HashMap<SocketAddr, mpsc::Sender<Vec<u8>>>>,
}

impl LocalTransport {
    /// Bind both listeners. Port 0 picks an ephemeral port; the resolved
    /// ports are what DNS-SD advertises.
    pub async fn bind(udp_port: u16, tcp_port: u16) -> anyhow::Result<(Arc<Self>, TcpListener)> {
        let udp = UdpSocket::bind(("0.0.0.0", udp_port))
            .await
            .context("binding UDP listener")?;
        let udp_port = udp.local_addr().context("UDP local addr")?.port();
        let tcp = TcpListener::bind(("0.0.0.0", tcp_port))
            .await
            .context("binding TCP listener")?;
        let tcp_port = tcp.local_addr().context("TCP local addr")?.port();
        info!(udp_port, tcp_port, "local transport bound");
        let transport = Arc::new(Self {
            udp,
            udp_port,
            tcp_port,
            peers: RwLock::new(HashMap::new()),
            endpoints_by_host: RwLock::new(HashMap::new()),
            streams: RwLock::new(HashMap::new()),
        });
        Ok((transport, tcp))
    }

    pub fn udp_port(&self) -> u16 {
        self.udp_port
    }

    pub fn tcp_port(&self) -> u16 {
        self.tcp_port
    }

    pub fn spawn(
        self: &Arc<Self>,
        tcp: TcpListener,
        inbound_tx: mpsc::Sender<Inbound>,
    ) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.clone().run_udp(inbound_tx.clone())),
            tokio::spawn(self.clone().run_tcp(tcp, inbound_tx)),
        ]
    }

    async fn run_udp(self: Arc<Self>, inbound_tx: mpsc::Sender<Inbound>) {
        let mut buf = vec![0u8; UDP_RECV_BUF];
        loop {
            let (len, addr) = match self.udp.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!("udp recv failed: {e}");
                    continue;
                }
            };
            self.register_endpoint(addr).await;
            match packet::decode_datagram(&buf[..len]) {
                Some(packet) => {
                    if inbound_tx
                        .send(Inbound::Packet(PacketOrigin::LocalUdp(addr), packet))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                None => debug!(%addr, len, "dropping undecodable datagram"),
            }
        }
    }

    async fn register_endpoint(&self, addr: SocketAddr) {
        self.peers
            .write()
            .await
            .insert(addr, UdpPeer { ready: true });
        self.endpoints_by_host
            .write()
            .await
            .insert(addr.ip().to_string(), addr);
    }

    /// Last UDP endpoint seen for a host, the retransmit target.
    pub async fn endpoint_for_host(&self, host: &str) -> Option<SocketAddr> {
        self.endpoints_by_host.read().await.get(host).copied()
    }

    pub async fn send_datagram_to(&self, addr: SocketAddr, kind: PacketKind, payload: &[u8]) {
        let datagram = packet::encode_datagram(kind, payload);
        if let Err(e) = self.udp.send_to(&datagram, addr).await {
            debug!(%addr, "udp send failed: {e}");
        }
    }

    /// Send to every registered `ready` UDP endpoint.
    pub async fn broadcast_datagram(&self, kind: PacketKind, payload: &[u8]) {
        let datagram = packet::encode_datagram(kind, payload);
        let targets: Vec<SocketAddr> = {
            let peers = self.peers.read().await;
            peers
                .iter()
                .filter(|(_, peer)| peer.ready)
                .map(|(addr, _)| *addr)
                .collect()
        };
        for addr in targets {
            if let Err(e) = self.udp.send_to(&datagram, addr).await {
                debug!(%addr, "udp broadcast send failed: {e}");
                if let Some(peer) = self.peers.write().await.get_mut(&addr) {
                    peer.ready = false;
                }
            }
        }
    }

    async fn run_tcp(self: Arc<Self>, listener: TcpListener, inbound_tx: mpsc::Sender<Inbound>) {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("tcp accept failed: {e}");
                    continue;
                }
            };
            if let Err(e) = tune_stream(&stream) {
                warn!(%addr, "tcp socket tuning failed: {e:#}");
            }
            info!(%addr, "tcp client connected");
            let (outbox_tx, outbox_rx) = mpsc::channel(STREAM_OUTBOX);
            self.streams.write().await.insert(addr, outbox_tx);
            tokio::spawn(
                self.clone()
                    .handle_stream(stream, addr, outbox_rx, inbound_tx.clone()),
            );
        }
    }

    async fn handle_stream(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
        mut outbox_rx: mpsc::Receiver<Vec<u8>>,
        inbound_tx: mpsc::Sender<Inbound>,
    ) {
        let (mut reader, mut writer) = stream.into_split();
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = outbox_rx.recv().await {
                if writer.write_all(&frame).await.is_err() {
                    break;
                }
            }
        });

        let origin = PacketOrigin::LocalTcp(addr);
        let mut decoder = StreamDecoder::new();
        let mut buf = vec![0u8; 16384];
        'read: loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!(%addr, "tcp read failed: {e}");
                    break;
                }
            };
            decoder.extend(&buf[..n]);
            loop {
                match decoder.next_frame() {
                    Ok(Some(frame)) => {
                        if inbound_tx
                            .send(Inbound::Packet(origin.clone(), frame))
                            .await
                            .is_err()
                        {
                            break 'read;
                        }
                    }
                    Ok(None) => break,
                    Err(FramingError::UnknownKind(tag)) => {
                        debug!(%addr, tag, "skipping frame with unknown kind");
                    }
                    Err(e @ FramingError::Oversize { .. }) => {
                        warn!(%addr, "dropping tcp connection: {e}");
                        break 'read;
                    }
                }
            }
        }

        self.streams.write().await.remove(&addr);
        writer_task.abort();
        info!(%addr, "tcp client disconnected");
        let _ = inbound_tx.send(Inbound::Closed(origin)).await;
    }

    /// Queue a control frame for one connection, waiting for outbox space.
    pub async fn send_stream_to(&self, addr: SocketAddr, kind: PacketKind, payload: &[u8]) {
        let frame = packet::encode_stream_frame(kind, payload);
        let outbox = self.streams.read().await.get(&addr).cloned();
        match outbox {
            Some(outbox) => {
                if outbox.send(frame).await.is_err() {
                    debug!(%addr, "tcp outbox closed");
                }
            }
            None => debug!(%addr, "no tcp connection for control reply"),
        }
    }

    /// Queue a frame for every connection, dropping per connection when its
    /// outbox is full: a stalled client must not stall the encoder.
    pub async fn broadcast_stream(&self, kind: PacketKind, payload: &[u8]) {
        let frame = packet::encode_stream_frame(kind, payload);
        let outboxes: Vec<(SocketAddr, mpsc::Sender<Vec<u8>>)> = {
            let streams = self.streams.read().await;
            streams
                .iter()
                .map(|(addr, tx)| (*addr, tx.clone()))
                .collect()
        };
        for (addr, outbox) in outboxes {
            if let Err(mpsc::error::TrySendError::Full(_)) = outbox.try_send(frame.clone()) {
                debug!(%addr, "tcp outbox full, dropping frame");
            }
        }
    }
}

fn tune_stream(stream: &TcpStream) -> anyhow::Result<()> {
    stream.set_nodelay(true).context("disabling Nagle")?;
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_IDLE)
        .with_interval(KEEPALIVE_IDLE);
    SockRef::from(stream)
        .set_tcp_keepalive(&keepalive)
        .context("enabling keepalive")?;
    Ok(())
}
