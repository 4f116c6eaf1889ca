//! The video delivery pipeline.
//!
//! Encoded access units arrive from the encoder adapter as PTS-prefixed
//! annex B buffers. Each frame is normalized (parameter-set maintenance),
//! encrypted whole, then routed by the session's transport policy:
//!
//! - relay active: one `video_frame` on the relay (already reliable end to
//!   end; fragmenting would only multiply overhead)
//! - local, latency not preferred: one `video_frame` on the TCP stream
//! - latency preferred: fragmented into `video_frame_chunk` datagrams, with
//!   chunks deposited in the cache when the client asked for lossless video
//!
//! The broadcast worker owns fragmented sending so a slow network path never
//! stalls the encoder callback; the cache worker is the single writer of the
//! chunk cache and services NACK retransmits.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use aircatch_protocol::chunk;
use aircatch_protocol::config::{CacheConfig, VideoConfig};
use aircatch_protocol::messages::ChunkNack;
use aircatch_protocol::packet::PacketKind;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::annexb::ParameterSetCache;
use crate::session::{SessionManager, SharedCrypto};
use crate::transport::local::LocalTransport;
use crate::transport::{Outbound, TransportKind};

/// Operations serialized onto the chunk-cache worker. Inserts come from the
/// broadcast worker (the cache's single writer); retransmits from the
/// router; clears from session teardown.
pub enum CacheOp {
    Insert {
        frame_id: u32,
        chunks: Vec<Vec<u8>>,
        at: Instant,
    },
    Prune {
        now: Instant,
    },
    Retransmit {
        nack: ChunkNack,
        host: String,
    },
    Clear,
}

struct CacheEntry {
    created_at: Instant,
    chunks: Vec<Vec<u8>>,
}

/// TTL+capacity bounded map of recently sent chunked frames.
struct ChunkCache {
    ttl: Duration,
    max_frames: usize,
    entries: HashMap<u32, CacheEntry>,
    insertion_order: VecDeque<u32>,
}

impl ChunkCache {
    fn new(config: &CacheConfig) -> Self {
        Self {
            ttl: Duration::from_millis(config.ttl_ms),
            max_frames: config.max_frames,
            entries: HashMap::new(),
            insertion_order: VecDeque::new(),
        }
    }

    fn insert(&mut self, frame_id: u32, chunks: Vec<Vec<u8>>, at: Instant) {
        if self
            .entries
            .insert(
                frame_id,
                CacheEntry {
                    created_at: at,
                    chunks,
                },
            )
            .is_none()
        {
            self.insertion_order.push_back(frame_id);
        }
        while self.insertion_order.len() > self.max_frames {
            if let Some(oldest) = self.insertion_order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    fn prune(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.duration_since(entry.created_at) <= ttl);
        self.insertion_order
            .retain(|frame_id| self.entries.contains_key(frame_id));
        before - self.entries.len()
    }

    /// A cached chunk packet payload, `None` once the entry has outlived its
    /// TTL even if the prune sweep hasn't caught it yet.
    fn chunk(&self, frame_id: u32, index: u16, now: Instant) -> Option<&[u8]> {
        let entry = self.entries.get(&frame_id)?;
        if now.duration_since(entry.created_at) > self.ttl {
            return None;
        }
        entry.chunks.get(index as usize).map(Vec::as_slice)
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.insertion_order.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Single-writer worker owning the chunk cache.
pub(crate) fn spawn_cache_worker(
    config: CacheConfig,
    local: Arc<LocalTransport>,
    mut ops_rx: mpsc::UnboundedReceiver<CacheOp>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut cache = ChunkCache::new(&config);
        while let Some(op) = ops_rx.recv().await {
            match op {
                CacheOp::Insert {
                    frame_id,
                    chunks,
                    at,
                } => cache.insert(frame_id, chunks, at),
                CacheOp::Prune { now } => {
                    let evicted = cache.prune(now);
                    if evicted > 0 {
                        debug!(evicted, remaining = cache.len(), "chunk cache pruned");
                    }
                }
                CacheOp::Retransmit { nack, host } => {
                    let Some(addr) = local.endpoint_for_host(&host).await else {
                        debug!(host, "NACK from a host with no known UDP endpoint");
                        continue;
                    };
                    let now = Instant::now();
                    for index in nack.missing_chunk_indices {
                        // Evicted and expired entries are silently ignored.
                        if let Some(chunk) = cache.chunk(nack.frame_id, index, now) {
                            local
                                .send_datagram_to(addr, PacketKind::VideoFrameChunk, chunk)
                                .await;
                        }
                    }
                }
                CacheOp::Clear => cache.clear(),
            }
        }
    })
}

struct BroadcastJob {
    frame_id: u32,
    transport: TransportKind,
    chunks: Vec<Vec<u8>>,
    lossless: bool,
}

/// Spawn the intake task and the broadcast worker.
pub(crate) fn spawn_video_pipeline(
    video_rx: mpsc::Receiver<Vec<u8>>,
    session: Arc<SessionManager>,
    crypto: SharedCrypto,
    outbound: Arc<Outbound>,
    cache_tx: mpsc::UnboundedSender<CacheOp>,
    video_config: VideoConfig,
    cache_config: CacheConfig,
) -> Vec<JoinHandle<()>> {
    let (jobs_tx, jobs_rx) = mpsc::channel(4);
    vec![
        tokio::spawn(run_intake(
            video_rx,
            session,
            crypto,
            outbound.clone(),
            jobs_tx,
            video_config.chunk_size,
        )),
        tokio::spawn(run_broadcast(
            jobs_rx,
            outbound,
            cache_tx,
            cache_config.prune_interval,
        )),
    ]
}

async fn run_intake(
    mut video_rx: mpsc::Receiver<Vec<u8>>,
    session: Arc<SessionManager>,
    crypto: SharedCrypto,
    outbound: Arc<Outbound>,
    jobs_tx: mpsc::Sender<BroadcastJob>,
    chunk_size: usize,
) {
    let mut params = ParameterSetCache::new();
    let mut frame_id: u32 = 0;
    let mut unpaired_drops: u64 = 0;
    while let Some(frame) = video_rx.recv().await {
        let Some(snapshot) = session.stream_snapshot().await else {
            unpaired_drops += 1;
            if unpaired_drops == 1 || unpaired_drops.is_multiple_of(300) {
                debug!(unpaired_drops, "dropping encoded frame (no paired client)");
            }
            continue;
        };
        if !snapshot.video {
            continue;
        }
        if frame.len() <= 8 {
            // Encoder emitted a broken buffer; its parameter-set state is no
            // longer trustworthy until the next keyframe re-seeds it.
            warn!(len = frame.len(), "malformed encoder frame, invalidating parameter sets");
            params.invalidate();
            continue;
        }
        let (pts, stream) = frame.split_at(8);
        let Some(stream) = params.prepare(stream, snapshot.codec) else {
            debug!("frame unusable without parameter sets, dropped");
            continue;
        };
        let mut body = Vec::with_capacity(8 + stream.len());
        body.extend_from_slice(pts);
        body.extend_from_slice(&stream);
        let encrypted = {
            let crypto = crypto.read().unwrap_or_else(|e| e.into_inner());
            crypto.encrypt(&body)
        };
        let Some(encrypted) = encrypted else {
            continue;
        };

        if snapshot.transport == TransportKind::Relay {
            outbound
                .send_video_frame(TransportKind::Relay, &encrypted, false)
                .await;
        } else if !snapshot.low_latency {
            outbound
                .send_video_frame(snapshot.transport, &encrypted, true)
                .await;
        } else {
            frame_id = frame_id.wrapping_add(1);
            match chunk::split_frame(frame_id, &encrypted, chunk_size) {
                Some(chunks) => {
                    let job = BroadcastJob {
                        frame_id,
                        transport: snapshot.transport,
                        chunks,
                        lossless: snapshot.lossless,
                    };
                    if jobs_tx.send(job).await.is_err() {
                        break;
                    }
                }
                None => {
                    info!(
                        frame_id,
                        len = encrypted.len(),
                        "frame too large for chunk delivery, dropped"
                    );
                }
            }
        }
    }
    info!("video frame channel closed");
    if session.stream_snapshot().await.is_some() {
        session.teardown("encoder output ended").await;
    }
}

async fn run_broadcast(
    mut jobs_rx: mpsc::Receiver<BroadcastJob>,
    outbound: Arc<Outbound>,
    cache_tx: mpsc::UnboundedSender<CacheOp>,
    prune_interval: u32,
) {
    while let Some(job) = jobs_rx.recv().await {
        for chunk in &job.chunks {
            outbound.send_video_chunk(job.transport, chunk).await;
        }
        if job.lossless {
            let _ = cache_tx.send(CacheOp::Insert {
                frame_id: job.frame_id,
                chunks: job.chunks,
                at: Instant::now(),
            });
        }
        if job.frame_id % prune_interval == 0 {
            let _ = cache_tx.send(CacheOp::Prune { now: Instant::now() });
        }
    }
    info!("broadcast worker drained");
}
