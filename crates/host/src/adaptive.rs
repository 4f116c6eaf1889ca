//! Adaptive stream control.
//!
//! Two independent loops share one controller:
//!
//! - the encoder-throughput loop samples the encoder's frame counters every
//!   2 s while a local or close-range client is paired, stepping bitrate down
//!   when the encoder can't hold framerate and back up while throughput is
//!   healthy, capped by signal quality from recent RTT samples;
//! - the client-report loop reacts to each `quality_report` while the relay
//!   owns the session, with tighter floors and a frame-rate fallback.
//!
//! The codec never changes at runtime: a switch would force a decoder
//! re-init on the client.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use aircatch_protocol::config::VideoConfig;
use aircatch_protocol::messages::{QualityAdjust, QualityReport};
use aircatch_protocol::packet::PacketKind;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapters::EncoderControl;
use crate::session::SessionManager;
use crate::transport::{Outbound, TransportKind};

/// Inputs routed to the controller by the router.
pub enum AdaptiveEvent {
    Report(QualityReport),
    /// Client-measured ping RTT in milliseconds.
    RttSample(f64),
}

const SAMPLE_PERIOD: Duration = Duration::from_secs(2);
const RTT_WINDOW: usize = 10;
/// Cycles before the throughput loop is allowed to reduce bitrate.
const WARMUP_CYCLES: u32 = 3;
const LOW_FPS: f64 = 55.0;
const HIGH_FPS: f64 = 58.0;
const GOOD_STREAK_FOR_RAISE: u32 = 3;
const STEP_DOWN: u64 = 5_000_000;
const STEP_UP: u64 = 2_000_000;
const CAPTURE_SUCCESS_FLOOR: f64 = 0.7;

const RELAY_FLOOR: u64 = 2_000_000;
const RELAY_CEILING: u64 = 10_000_000;
const RELAY_STEP_DOWN: u64 = 1_000_000;
const RELAY_STEP_UP: u64 = 500_000;
const RELAY_LATENCY_LIMIT_MS: f64 = 150.0;
const RELAY_STABLE_RUN: u32 = 5;
const RELAY_REDUCED_FPS: u32 = 15;
const RELAY_FULL_FPS: u32 = 30;

/// Maximum bitrate the current signal quality supports.
fn signal_cap(rtt_window: &VecDeque<f64>) -> u64 {
    if rtt_window.is_empty() {
        return 50_000_000;
    }
    let avg = rtt_window.iter().sum::<f64>() / rtt_window.len() as f64;
    if avg < 10.0 {
        50_000_000 // excellent
    } else if avg < 30.0 {
        35_000_000 // good
    } else if avg < 50.0 {
        20_000_000 // fair
    } else {
        10_000_000 // poor
    }
}

pub struct AdaptiveController {
    session: Arc<SessionManager>,
    encoder: Arc<dyn EncoderControl>,
    outbound: Arc<Outbound>,
    config: VideoConfig,
    cycles: u32,
    good_streak: u32,
    prev_encoded: u64,
    prev_skipped: u64,
    rtt_window: VecDeque<f64>,
    stable_reports: u32,
}

impl AdaptiveController {
    pub fn new(
        session: Arc<SessionManager>,
        encoder: Arc<dyn EncoderControl>,
        outbound: Arc<Outbound>,
        config: VideoConfig,
    ) -> Self {
        Self {
            session,
            encoder,
            outbound,
            config,
            cycles: 0,
            good_streak: 0,
            prev_encoded: 0,
            prev_skipped: 0,
            rtt_window: VecDeque::new(),
            stable_reports: 0,
        }
    }

    pub fn spawn(mut self, mut events_rx: mpsc::Receiver<AdaptiveEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SAMPLE_PERIOD);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.throughput_cycle().await,
                    event = events_rx.recv() => match event {
                        Some(AdaptiveEvent::RttSample(ms)) => self.push_rtt(ms),
                        Some(AdaptiveEvent::Report(report)) => self.handle_report(report).await,
                        None => break,
                    },
                }
            }
            info!("adaptive controller stopped");
        })
    }

    fn push_rtt(&mut self, ms: f64) {
        if !ms.is_finite() || ms < 0.0 {
            return;
        }
        self.rtt_window.push_back(ms);
        while self.rtt_window.len() > RTT_WINDOW {
            self.rtt_window.pop_front();
        }
    }

    /// One 2 s sample of the encoder-throughput loop.
    async fn throughput_cycle(&mut self) {
        let Some(snapshot) = self.session.stream_snapshot().await else {
            self.reset();
            return;
        };
        if snapshot.transport == TransportKind::Relay {
            return;
        }
        let Some(profile) = self.session.profile().await else {
            return;
        };

        let encoded = self.encoder.frames_encoded();
        let skipped = self.encoder.frames_skipped();
        let delta_encoded = encoded.saturating_sub(self.prev_encoded);
        let delta_skipped = skipped.saturating_sub(self.prev_skipped);
        self.prev_encoded = encoded;
        self.prev_skipped = skipped;
        self.cycles += 1;

        let actual_fps = delta_encoded as f64 / SAMPLE_PERIOD.as_secs_f64();
        let attempts = delta_encoded + delta_skipped;
        let capture_success = if attempts == 0 {
            1.0
        } else {
            delta_encoded as f64 / attempts as f64
        };
        let cap = self.config.max_bitrate.min(signal_cap(&self.rtt_window));
        debug!(
            actual_fps = format!("{actual_fps:.1}"),
            capture_success = format!("{capture_success:.2}"),
            cap,
            bitrate = profile.bitrate,
            "throughput sample"
        );

        if actual_fps < LOW_FPS {
            self.good_streak = 0;
            let warmed_up = self.cycles > WARMUP_CYCLES;
            if warmed_up
                && capture_success >= CAPTURE_SUCCESS_FLOOR
                && profile.bitrate > self.config.min_bitrate
            {
                let new_bitrate = profile
                    .bitrate
                    .saturating_sub(STEP_DOWN)
                    .max(self.config.min_bitrate);
                info!(
                    old = profile.bitrate,
                    new = new_bitrate,
                    actual_fps = format!("{actual_fps:.0}"),
                    "encoder behind target, reducing bitrate"
                );
                self.apply(Some(new_bitrate), None).await;
            }
        } else if actual_fps >= HIGH_FPS {
            self.good_streak += 1;
            if self.good_streak >= GOOD_STREAK_FOR_RAISE && profile.bitrate < cap {
                let new_bitrate = (profile.bitrate + STEP_UP).min(cap);
                info!(
                    old = profile.bitrate,
                    new = new_bitrate,
                    cap,
                    "throughput healthy, raising bitrate"
                );
                self.good_streak = 0;
                self.apply(Some(new_bitrate), None).await;
            }
        } else {
            self.good_streak = 0;
        }
    }

    /// One client quality report of the relay loop.
    async fn handle_report(&mut self, report: QualityReport) {
        let Some(snapshot) = self.session.stream_snapshot().await else {
            return;
        };
        // Reported latency doubles as a signal-quality sample.
        self.push_rtt(report.latency_ms);
        if snapshot.transport != TransportKind::Relay {
            return;
        }
        let Some(profile) = self.session.profile().await else {
            return;
        };

        let degraded =
            report.dropped_frames > 0 || report.latency_ms > RELAY_LATENCY_LIMIT_MS;
        if degraded {
            self.stable_reports = 0;
            if profile.bitrate > RELAY_FLOOR {
                let new_bitrate = profile
                    .bitrate
                    .saturating_sub(RELAY_STEP_DOWN)
                    .max(RELAY_FLOOR);
                info!(
                    old = profile.bitrate,
                    new = new_bitrate,
                    dropped = report.dropped_frames,
                    latency_ms = report.latency_ms,
                    "relay quality degraded, reducing bitrate"
                );
                self.apply(Some(new_bitrate), None).await;
            } else if profile.frame_rate != RELAY_REDUCED_FPS {
                info!("at bitrate floor, reducing frame rate");
                self.apply(None, Some(RELAY_REDUCED_FPS)).await;
            }
        } else {
            self.stable_reports += 1;
            if self.stable_reports >= RELAY_STABLE_RUN {
                if profile.frame_rate < RELAY_FULL_FPS {
                    info!("relay stable, restoring frame rate");
                    self.apply(None, Some(RELAY_FULL_FPS)).await;
                } else if profile.bitrate < RELAY_CEILING {
                    let new_bitrate = (profile.bitrate + RELAY_STEP_UP).min(RELAY_CEILING);
                    info!(
                        old = profile.bitrate,
                        new = new_bitrate,
                        "relay stable, raising bitrate"
                    );
                    self.apply(Some(new_bitrate), None).await;
                }
            }
        }
    }

    /// Push a change to the encoder, the shared profile, and the client.
    async fn apply(&self, bitrate: Option<u64>, frame_rate: Option<u32>) {
        if let Some(bitrate) = bitrate {
            self.encoder.set_bitrate(bitrate);
        }
        if let Some(frame_rate) = frame_rate {
            self.encoder.set_frame_rate(frame_rate);
        }
        self.session.apply_adjustment(bitrate, frame_rate).await;
        let Some(profile) = self.session.profile().await else {
            return;
        };
        let notice = QualityAdjust {
            bitrate: profile.bitrate,
            frame_rate: profile.frame_rate,
        };
        match serde_json::to_vec(&notice) {
            Ok(json) => {
                let snapshot = self.session.stream_snapshot().await;
                if let Some(snapshot) = snapshot {
                    self.outbound
                        .send_notice(snapshot.transport, PacketKind::QualityAdjust, &json)
                        .await;
                }
            }
            Err(e) => warn!("quality adjust serialization failed: {e}"),
        }
    }

    /// Forget per-session state once the client is gone; the next pairing
    /// warms up from scratch.
    fn reset(&mut self) {
        self.cycles = 0;
        self.good_streak = 0;
        self.stable_reports = 0;
        self.rtt_window.clear();
        self.prev_encoded = self.encoder.frames_encoded();
        self.prev_skipped = self.encoder.frames_skipped();
    }
}
