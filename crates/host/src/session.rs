//! Session lifecycle: pairing, the one-active-client policy, teardown.
//!
//! The manager owns the session record and the negotiated profile; every
//! other task works from read-only snapshots captured at dispatch time.
//! State transitions are serialized behind one lock so a re-handshake
//! replaces the prior binding atomically.

use std::sync::Arc;

use aircatch_protocol::config::AirCatchConfig;
use aircatch_protocol::messages::{HandshakeAck, HandshakeRequest};
use aircatch_protocol::pin::generate_pin;
use aircatch_protocol::profile::{StreamProfile, VideoCodec};
use tokio::sync::{RwLock, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::adapters::{DisplayProvider, EncoderControl};
use crate::crypto::{SessionCrypto, constant_time_eq};
use crate::transport::{ClientIdentity, PacketOrigin, TransportKind};
use crate::video::CacheOp;

/// Crypto channel shared with the media pipelines. Reads encrypt/decrypt;
/// writes replace the key on PIN rotation and teardown.
pub type SharedCrypto = Arc<std::sync::RwLock<SessionCrypto>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Stopped,
    Listening,
    Paired,
    Teardown,
}

/// Snapshot published to the status observer (UI, logs).
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub phase: SessionPhase,
    pub pin: String,
    pub client_name: Option<String>,
    /// User-visible reason for the last transition, e.g. why a session
    /// ended.
    pub detail: Option<String>,
}

/// The single active client bound to this session.
#[derive(Debug, Clone)]
pub struct ClientBinding {
    pub identity: ClientIdentity,
    pub transport: TransportKind,
    pub name: String,
    pub device_model: Option<String>,
    pub wants_video: bool,
}

/// Read-only view the media pipelines capture per frame.
#[derive(Debug, Clone, Copy)]
pub struct StreamSnapshot {
    pub transport: TransportKind,
    pub codec: VideoCodec,
    pub low_latency: bool,
    pub lossless: bool,
    pub video: bool,
    pub audio: bool,
}

struct SessionState {
    phase: SessionPhase,
    pin: String,
    binding: Option<ClientBinding>,
    profile: Option<StreamProfile>,
}

/// Outcome of a pairing attempt, decided under the session lock.
#[derive(Debug)]
pub enum HandshakeOutcome {
    /// Paired; reply with this encrypted `handshake_ack` payload.
    Accepted(Vec<u8>),
    /// Authentication failed; reply `pairing_failed`. Which part failed
    /// (PIN text vs GCM tag) is never distinguished on the wire.
    Rejected,
    /// Malformed or out-of-phase request; say nothing.
    Ignored,
}

pub struct SessionManager {
    state: RwLock<SessionState>,
    crypto: SharedCrypto,
    status_tx: watch::Sender<SessionStatus>,
    host_name: String,
    config: AirCatchConfig,
    encoder: Arc<dyn EncoderControl>,
    display: Arc<dyn DisplayProvider>,
    cache_tx: mpsc::UnboundedSender<CacheOp>,
}

impl SessionManager {
    pub fn new(
        config: AirCatchConfig,
        host_name: String,
        encoder: Arc<dyn EncoderControl>,
        display: Arc<dyn DisplayProvider>,
        crypto: SharedCrypto,
        cache_tx: mpsc::UnboundedSender<CacheOp>,
    ) -> (Arc<Self>, watch::Receiver<SessionStatus>) {
        let pin = generate_pin();
        let (status_tx, status_rx) = watch::channel(SessionStatus {
            phase: SessionPhase::Stopped,
            pin: pin.clone(),
            client_name: None,
            detail: None,
        });
        let manager = Arc::new(Self {
            state: RwLock::new(SessionState {
                phase: SessionPhase::Stopped,
                pin,
                binding: None,
                profile: None,
            }),
            crypto,
            status_tx,
            host_name,
            config,
            encoder,
            display,
            cache_tx,
        });
        (manager, status_rx)
    }

    /// Enter `listening`: the PIN becomes live and the session key exists
    /// from here until teardown.
    pub async fn start_listening(&self) {
        let mut state = self.state.write().await;
        if state.phase != SessionPhase::Stopped {
            return;
        }
        state.phase = SessionPhase::Listening;
        self.derive_key(&state.pin);
        info!(pin = %state.pin, "session listening");
        self.publish(&state, None);
    }

    pub async fn pin(&self) -> String {
        self.state.read().await.pin.clone()
    }

    /// Replace the PIN: re-derives the key and unbinds any paired client
    /// (its key material is stale). The caller re-registers the relay.
    pub async fn rotate_pin(&self) -> String {
        let mut state = self.state.write().await;
        if state.phase == SessionPhase::Paired {
            self.unbind(&mut state, "PIN changed");
            state.phase = SessionPhase::Listening;
        }
        state.pin = generate_pin();
        if state.phase != SessionPhase::Stopped {
            self.derive_key(&state.pin);
        }
        info!("PIN rotated");
        self.publish(&state, None);
        state.pin.clone()
    }

    /// Process a `handshake_request` payload from any transport.
    pub async fn handle_handshake(
        &self,
        origin: &PacketOrigin,
        payload: &[u8],
    ) -> HandshakeOutcome {
        let plaintext = {
            let crypto = self.crypto.read().unwrap_or_else(|e| e.into_inner());
            crypto.decrypt(payload)
        };
        let Some(plaintext) = plaintext else {
            debug!("handshake payload failed authentication");
            return HandshakeOutcome::Rejected;
        };
        let request: HandshakeRequest = match serde_json::from_slice(&plaintext) {
            Ok(request) => request,
            Err(e) => {
                debug!("malformed handshake request: {e}");
                return HandshakeOutcome::Ignored;
            }
        };

        let mut state = self.state.write().await;
        if !matches!(state.phase, SessionPhase::Listening | SessionPhase::Paired) {
            return HandshakeOutcome::Ignored;
        }
        if !constant_time_eq(request.pin.as_bytes(), state.pin.as_bytes()) {
            debug!(client = %request, "handshake with wrong PIN");
            return HandshakeOutcome::Rejected;
        }

        let mut request = request;
        if request.screen_width == 0 || request.screen_height == 0 {
            let (width, height) = self.display.main_display_frame();
            request.screen_width = width;
            request.screen_height = height;
        }

        let transport = origin.transport();
        let mut profile = match transport {
            TransportKind::Local => StreamProfile::local(&request, &self.config.video),
            TransportKind::Relay => StreamProfile::relay(&request, &self.config.video),
            TransportKind::Nearby => StreamProfile::nearby(&request, &self.config.video),
        };
        if !self.config.audio.enabled {
            profile.audio = false;
        }

        if let Some(prior) = state.binding.replace(ClientBinding {
            identity: origin.identity(),
            transport,
            name: request.client_name.clone(),
            device_model: request.device_model.clone(),
            wants_video: request.want_video,
        }) {
            info!(prior = %prior.name, new = %request.client_name, "replacing bound client");
        }

        if let Err(e) = self.encoder.start(&profile) {
            error!("encoder start failed: {e:#}");
            state.binding = None;
            state.profile = None;
            state.phase = SessionPhase::Listening;
            self.publish(&state, Some(format!("encoder failed: {e}")));
            return HandshakeOutcome::Rejected;
        }

        let ack = HandshakeAck {
            width: profile.width,
            height: profile.height,
            frame_rate: profile.frame_rate,
            host_name: self.host_name.clone(),
            bitrate: profile.bitrate,
            codec: profile.codec,
            is_virtual_display: false,
        };
        state.profile = Some(profile);
        state.phase = SessionPhase::Paired;
        info!(client = %request, transport = ?transport, "client paired");
        self.publish(&state, None);
        drop(state);

        let ack_json = match serde_json::to_vec(&ack) {
            Ok(json) => json,
            Err(e) => {
                warn!("handshake ack serialization failed: {e}");
                return HandshakeOutcome::Ignored;
            }
        };
        let encrypted = {
            let crypto = self.crypto.read().unwrap_or_else(|e| e.into_inner());
            crypto.encrypt(&ack_json)
        };
        match encrypted {
            Some(ciphertext) => HandshakeOutcome::Accepted(ciphertext),
            None => HandshakeOutcome::Ignored,
        }
    }

    /// One-active-client gate: does `identity` belong to the paired client?
    pub async fn client_matches(&self, identity: &ClientIdentity) -> bool {
        let state = self.state.read().await;
        state.phase == SessionPhase::Paired
            && state
                .binding
                .as_ref()
                .is_some_and(|binding| binding.identity == *identity)
    }

    /// Snapshot for the media pipelines; `None` unless paired.
    pub async fn stream_snapshot(&self) -> Option<StreamSnapshot> {
        let state = self.state.read().await;
        if state.phase != SessionPhase::Paired {
            return None;
        }
        let binding = state.binding.as_ref()?;
        let profile = state.profile.as_ref()?;
        Some(StreamSnapshot {
            transport: binding.transport,
            codec: profile.codec,
            low_latency: profile.low_latency,
            lossless: profile.lossless,
            video: binding.wants_video,
            audio: profile.audio,
        })
    }

    pub async fn profile(&self) -> Option<StreamProfile> {
        self.state.read().await.profile.clone()
    }

    /// Adaptive-controller write path for the negotiated profile.
    pub async fn apply_adjustment(&self, bitrate: Option<u64>, frame_rate: Option<u32>) {
        let mut state = self.state.write().await;
        if let Some(profile) = state.profile.as_mut() {
            if let Some(bitrate) = bitrate {
                profile.bitrate = bitrate;
            }
            if let Some(frame_rate) = frame_rate {
                profile.frame_rate = frame_rate;
            }
        }
    }

    /// End the active pairing and return to `listening`.
    pub async fn teardown(&self, reason: &str) {
        let mut state = self.state.write().await;
        if !matches!(state.phase, SessionPhase::Paired | SessionPhase::Listening) {
            return;
        }
        state.phase = SessionPhase::Teardown;
        self.publish(&state, Some(reason.to_string()));
        self.unbind(&mut state, reason);
        // Key material for the current PIN comes back immediately: the PIN
        // is still on screen and the next client must be able to pair.
        self.derive_key(&state.pin);
        state.phase = SessionPhase::Listening;
        self.publish(&state, Some(reason.to_string()));
    }

    /// Host stop: tear everything down and leave `stopped`.
    pub async fn stop(&self, reason: &str) {
        let mut state = self.state.write().await;
        if state.phase == SessionPhase::Stopped {
            return;
        }
        state.phase = SessionPhase::Teardown;
        self.unbind(&mut state, reason);
        state.phase = SessionPhase::Stopped;
        self.publish(&state, Some(reason.to_string()));
        info!(reason, "session stopped");
    }

    /// Drop the binding, stop the encoder, flush the chunk cache, zero the
    /// key. Callers decide which phase follows.
    fn unbind(&self, state: &mut SessionState, reason: &str) {
        if state.binding.take().is_some() {
            info!(reason, "client unbound");
        }
        state.profile = None;
        self.encoder.stop();
        let _ = self.cache_tx.send(CacheOp::Clear);
        let mut crypto = self.crypto.write().unwrap_or_else(|e| e.into_inner());
        crypto.clear_key();
    }

    fn derive_key(&self, pin: &str) {
        let mut crypto = self.crypto.write().unwrap_or_else(|e| e.into_inner());
        crypto.derive_key(pin);
    }

    fn publish(&self, state: &SessionState, detail: Option<String>) {
        let _ = self.status_tx.send(SessionStatus {
            phase: state.phase,
            pin: state.pin.clone(),
            client_name: state.binding.as_ref().map(|b| b.name.clone()),
            detail,
        });
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// In-memory encoder fake shared by session/pipeline/controller tests.
    #[derive(Default)]
    pub(crate) struct FakeEncoder {
        pub starts: AtomicU64,
        pub stops: AtomicU64,
        pub bitrates: Mutex<Vec<u64>>,
        pub frame_rates: Mutex<Vec<u32>>,
        pub encoded: AtomicU64,
        pub skipped: AtomicU64,
    }

    impl EncoderControl for FakeEncoder {
        fn start(&self, _profile: &StreamProfile) -> anyhow::Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
        fn set_bitrate(&self, bps: u64) {
            self.bitrates.lock().unwrap().push(bps);
        }
        fn set_frame_rate(&self, fps: u32) {
            self.frame_rates.lock().unwrap().push(fps);
        }
        fn capture_dimensions(&self) -> (u32, u32) {
            (2388, 1668)
        }
        fn frames_encoded(&self) -> u64 {
            self.encoded.load(Ordering::SeqCst)
        }
        fn frames_skipped(&self) -> u64 {
            self.skipped.load(Ordering::SeqCst)
        }
    }

    pub(crate) struct FakeDisplay;

    impl DisplayProvider for FakeDisplay {
        fn main_display_frame(&self) -> (u32, u32) {
            (3456, 2234)
        }
    }

    pub(crate) struct Harness {
        pub session: Arc<SessionManager>,
        pub status_rx: watch::Receiver<SessionStatus>,
        pub encoder: Arc<FakeEncoder>,
        pub crypto: SharedCrypto,
        pub cache_rx: mpsc::UnboundedReceiver<CacheOp>,
    }

    pub(crate) fn harness() -> Harness {
        let encoder = Arc::new(FakeEncoder::default());
        let crypto: SharedCrypto = Arc::new(std::sync::RwLock::new(SessionCrypto::new()));
        let (cache_tx, cache_rx) = mpsc::unbounded_channel();
        let (session, status_rx) = SessionManager::new(
            AirCatchConfig::default(),
            "Studio".to_string(),
            encoder.clone(),
            Arc::new(FakeDisplay),
            crypto.clone(),
            cache_tx,
        );
        Harness {
            session,
            status_rx,
            encoder,
            crypto,
            cache_rx,
        }
    }

    pub(crate) fn tcp_origin(addr: &str) -> PacketOrigin {
        PacketOrigin::LocalTcp(addr.parse::<SocketAddr>().unwrap())
    }

    /// Encrypt a handshake request the way a client that typed `pin` would.
    pub(crate) fn client_handshake(pin: &str, request: &HandshakeRequest) -> Vec<u8> {
        let mut crypto = SessionCrypto::new();
        crypto.derive_key(pin);
        crypto
            .encrypt(&serde_json::to_vec(request).unwrap())
            .unwrap()
    }

    pub(crate) fn request_with_pin(pin: &str) -> HandshakeRequest {
        HandshakeRequest {
            client_name: "iPad".into(),
            client_version: "2.1.0".into(),
            device_model: Some("iPad14,3".into()),
            screen_width: 2388,
            screen_height: 1668,
            preferred_codec: None,
            prefer_low_latency: true,
            want_lossless_video: false,
            want_video: true,
            want_audio: true,
            pin: pin.into(),
        }
    }

    async fn force_pin(session: &SessionManager, crypto: &SharedCrypto, pin: &str) {
        let mut state = session.state.write().await;
        state.pin = pin.to_string();
        crypto
            .write()
            .unwrap()
            .derive_key(pin);
    }

    #[tokio::test]
    async fn correct_pin_pairs_and_acks_negotiated_profile() {
        let h = harness();
        h.session.start_listening().await;
        force_pin(&h.session, &h.crypto, "ABCDEF").await;

        let payload = client_handshake("ABCDEF", &request_with_pin("ABCDEF"));
        let outcome = h
            .session
            .handle_handshake(&tcp_origin("192.168.1.20:52000"), &payload)
            .await;

        let ack_ct = match outcome {
            HandshakeOutcome::Accepted(ct) => ct,
            other => panic!("expected Accepted, got {other:?}"),
        };
        let mut client = SessionCrypto::new();
        client.derive_key("ABCDEF");
        let ack: HandshakeAck =
            serde_json::from_slice(&client.decrypt(&ack_ct).unwrap()).unwrap();
        assert_eq!(ack.width, 2388);
        assert_eq!(ack.height, 1668);
        assert_eq!(ack.frame_rate, 60);
        assert_eq!(ack.bitrate, 20_000_000);
        assert!(!ack.is_virtual_display);
        assert_eq!(ack.host_name, "Studio");

        assert_eq!(h.encoder.starts.load(Ordering::SeqCst), 1);
        assert_eq!(h.status_rx.borrow().phase, SessionPhase::Paired);
        let snapshot = h.session.stream_snapshot().await.unwrap();
        assert!(snapshot.low_latency);
        assert!(!snapshot.lossless);
        assert!(snapshot.audio);
    }

    #[tokio::test]
    async fn wrong_pin_rejects_without_state_change() {
        let h = harness();
        h.session.start_listening().await;
        force_pin(&h.session, &h.crypto, "ABCDEF").await;

        let payload = client_handshake("ABCDEG", &request_with_pin("ABCDEG"));
        let outcome = h
            .session
            .handle_handshake(&tcp_origin("192.168.1.20:52000"), &payload)
            .await;
        assert!(matches!(outcome, HandshakeOutcome::Rejected));
        assert_eq!(h.status_rx.borrow().phase, SessionPhase::Listening);
        assert_eq!(h.encoder.starts.load(Ordering::SeqCst), 0);
        assert!(h.session.stream_snapshot().await.is_none());
    }

    #[tokio::test]
    async fn matching_pin_text_under_wrong_key_still_rejects() {
        // Client somehow knows the PIN text but encrypted under another key.
        let h = harness();
        h.session.start_listening().await;
        force_pin(&h.session, &h.crypto, "ABCDEF").await;
        let payload = client_handshake("QQQQQQ", &request_with_pin("ABCDEF"));
        let outcome = h
            .session
            .handle_handshake(&tcp_origin("192.168.1.20:52000"), &payload)
            .await;
        assert!(matches!(outcome, HandshakeOutcome::Rejected));
    }

    #[tokio::test]
    async fn rehandshake_replaces_prior_binding() {
        let h = harness();
        h.session.start_listening().await;
        force_pin(&h.session, &h.crypto, "ABCDEF").await;

        let payload = client_handshake("ABCDEF", &request_with_pin("ABCDEF"));
        let first = tcp_origin("192.168.1.20:52000");
        let second = tcp_origin("192.168.1.30:41000");
        assert!(matches!(
            h.session.handle_handshake(&first, &payload).await,
            HandshakeOutcome::Accepted(_)
        ));
        assert!(h.session.client_matches(&first.identity()).await);

        assert!(matches!(
            h.session.handle_handshake(&second, &payload).await,
            HandshakeOutcome::Accepted(_)
        ));
        assert!(h.session.client_matches(&second.identity()).await);
        assert!(!h.session.client_matches(&first.identity()).await);
    }

    #[tokio::test]
    async fn relay_handshake_forces_conservative_profile() {
        let h = harness();
        h.session.start_listening().await;
        force_pin(&h.session, &h.crypto, "ABCDEF").await;

        let mut request = request_with_pin("ABCDEF");
        request.want_lossless_video = true;
        request.prefer_low_latency = false;
        let payload = client_handshake("ABCDEF", &request);
        let origin = PacketOrigin::Relay(aircatch_protocol::messages::RelayChannel::Tcp);
        let outcome = h.session.handle_handshake(&origin, &payload).await;
        assert!(matches!(outcome, HandshakeOutcome::Accepted(_)));

        let profile = h.session.profile().await.unwrap();
        assert_eq!(profile.bitrate, 6_000_000);
        assert_eq!(profile.frame_rate, 30);
        assert_eq!(profile.codec, VideoCodec::HevcMain);
        assert!(!profile.lossless);
        assert!(profile.low_latency);
    }

    #[tokio::test]
    async fn teardown_zeroes_key_flushes_cache_and_relistens() {
        let mut h = harness();
        h.session.start_listening().await;
        force_pin(&h.session, &h.crypto, "ABCDEF").await;
        let payload = client_handshake("ABCDEF", &request_with_pin("ABCDEF"));
        let origin = tcp_origin("192.168.1.20:52000");
        assert!(matches!(
            h.session.handle_handshake(&origin, &payload).await,
            HandshakeOutcome::Accepted(_)
        ));

        h.session.teardown("client disconnect").await;
        assert_eq!(h.status_rx.borrow().phase, SessionPhase::Listening);
        assert_eq!(h.encoder.stops.load(Ordering::SeqCst), 1);
        assert!(matches!(h.cache_rx.try_recv(), Ok(CacheOp::Clear)));
        assert!(!h.session.client_matches(&origin.identity()).await);
        // Key is live again for the unchanged PIN
        assert!(h.crypto.read().unwrap().has_key());
    }

    #[tokio::test]
    async fn stop_leaves_no_key() {
        let h = harness();
        h.session.start_listening().await;
        h.session.stop("host stopped").await;
        assert!(!h.crypto.read().unwrap().has_key());
        assert!(h.session.stream_snapshot().await.is_none());
    }

    #[tokio::test]
    async fn pin_rotation_rederives_key_and_unbinds() {
        let h = harness();
        h.session.start_listening().await;
        force_pin(&h.session, &h.crypto, "ABCDEF").await;
        let payload = client_handshake("ABCDEF", &request_with_pin("ABCDEF"));
        let origin = tcp_origin("192.168.1.20:52000");
        assert!(matches!(
            h.session.handle_handshake(&origin, &payload).await,
            HandshakeOutcome::Accepted(_)
        ));

        let new_pin = h.session.rotate_pin().await;
        assert_ne!(new_pin, "ABCDEF");
        assert!(!h.session.client_matches(&origin.identity()).await);

        // Old-PIN handshakes are now rejected, new-PIN ones accepted.
        assert!(matches!(
            h.session.handle_handshake(&origin, &payload).await,
            HandshakeOutcome::Rejected
        ));
        let fresh = client_handshake(&new_pin, &request_with_pin(&new_pin));
        assert!(matches!(
            h.session.handle_handshake(&origin, &fresh).await,
            HandshakeOutcome::Accepted(_)
        ));
    }
}
