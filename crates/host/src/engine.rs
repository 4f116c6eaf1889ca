//! The process-wide engine: owns the session, the transports, and the
//! adapter handles; wires the task graph and tears it down deterministically.
//!
//! Construction order matters: the listeners bind first so the advertised
//! ports are real and the relay can publish a usable UDP candidate; the
//! router starts last, after every handler it dispatches to exists.

use anyhow::Context;
use std::sync::Arc;

use aircatch_protocol::config::AirCatchConfig;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::adapters::{Advertiser, DisplayProvider, EncoderControl, InputInjector, NearbyLink, StunProbe};
use crate::adaptive::AdaptiveController;
use crate::audio::spawn_audio_pipeline;
use crate::crypto::SessionCrypto;
use crate::input::InputDispatcher;
use crate::router::Router;
use crate::session::{SessionManager, SessionStatus, SharedCrypto};
use crate::transport::local::LocalTransport;
use crate::transport::nearby::NearbyTransport;
use crate::transport::relay::RelayTransport;
use crate::transport::Outbound;
use crate::video::{spawn_cache_worker, spawn_video_pipeline};

/// Media flowing in from the encoder adapter. The adapter's `on_frame` and
/// `on_audio` callbacks push into the paired senders; closing them signals
/// encoder failure.
pub struct MediaChannels {
    pub video_rx: mpsc::Receiver<Vec<u8>>,
    pub audio_rx: mpsc::Receiver<Vec<u8>>,
}

/// The close-range framework handle plus its inbound packet stream.
pub struct NearbyChannels {
    pub link: Arc<dyn NearbyLink>,
    pub packets_rx: mpsc::Receiver<(String, Vec<u8>)>,
}

/// Everything platform-specific, injected at startup.
pub struct Adapters {
    pub encoder: Arc<dyn EncoderControl>,
    pub injector: Arc<dyn InputInjector>,
    pub display: Arc<dyn DisplayProvider>,
    pub advertiser: Arc<dyn Advertiser>,
    pub stun: Arc<dyn StunProbe>,
    pub nearby: Option<NearbyChannels>,
}

pub struct Engine {
    session: Arc<SessionManager>,
    status_rx: watch::Receiver<SessionStatus>,
    local: Arc<LocalTransport>,
    relay: Option<Arc<RelayTransport>>,
    nearby: Option<Arc<NearbyTransport>>,
    advertiser: Arc<dyn Advertiser>,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    pub async fn start(
        config: AirCatchConfig,
        adapters: Adapters,
        media: MediaChannels,
    ) -> anyhow::Result<Self> {
        if let Err(issues) = config.validate() {
            for issue in &issues {
                warn!("{issue}");
            }
            if issues.iter().any(|issue| issue.starts_with("ERROR:")) {
                anyhow::bail!("invalid configuration:\n{}", issues.join("\n"));
            }
        }

        let crypto: SharedCrypto = Arc::new(std::sync::RwLock::new(SessionCrypto::new()));
        let (cache_tx, cache_rx) = mpsc::unbounded_channel();
        let (session, status_rx) = SessionManager::new(
            config.clone(),
            config.network.service_name.clone(),
            adapters.encoder.clone(),
            adapters.display.clone(),
            crypto.clone(),
            cache_tx.clone(),
        );

        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let (local, tcp) =
            LocalTransport::bind(config.network.udp_port, config.network.tcp_port).await?;
        let mut tasks = local.spawn(tcp, inbound_tx.clone());

        session.start_listening().await;

        let relay = if config.relay.enabled {
            match RelayTransport::connect(
                &config.relay.url,
                session.pin().await,
                local.udp_port(),
                adapters.stun.clone(),
                inbound_tx.clone(),
            )
            .await
            {
                Ok((relay, task)) => {
                    tasks.push(task);
                    Some(relay)
                }
                Err(e) => {
                    warn!("relay unavailable, continuing local-only: {e:#}");
                    None
                }
            }
        } else {
            None
        };

        let nearby = match adapters.nearby {
            Some(channels) => {
                let transport = NearbyTransport::new(channels.link);
                transport
                    .start()
                    .context("starting close-range transport")?;
                tasks.push(NearbyTransport::spawn_intake(
                    channels.packets_rx,
                    inbound_tx.clone(),
                ));
                Some(transport)
            }
            None => None,
        };

        let outbound = Arc::new(Outbound {
            local: local.clone(),
            relay: relay.clone(),
            nearby: nearby.clone(),
        });

        let (width, height) = adapters.display.main_display_frame();
        let txt = vec![
            ("version".to_string(), env!("CARGO_PKG_VERSION").to_string()),
            ("platform".to_string(), std::env::consts::OS.to_string()),
            ("width".to_string(), width.to_string()),
            ("height".to_string(), height.to_string()),
        ];
        for service_type in ["_aircatch._udp.", "_aircatch._tcp."] {
            if let Err(e) = adapters.advertiser.start(
                service_type,
                &config.network.service_name,
                local.tcp_port(),
                local.udp_port(),
                &txt,
            ) {
                warn!(service_type, "service advertisement failed: {e:#}");
            }
        }

        tasks.push(spawn_cache_worker(
            config.cache.clone(),
            local.clone(),
            cache_rx,
        ));
        tasks.extend(spawn_video_pipeline(
            media.video_rx,
            session.clone(),
            crypto.clone(),
            outbound.clone(),
            cache_tx.clone(),
            config.video.clone(),
            config.cache.clone(),
        ));
        tasks.push(spawn_audio_pipeline(
            media.audio_rx,
            session.clone(),
            crypto.clone(),
            outbound.clone(),
        ));

        let (adaptive_tx, adaptive_rx) = mpsc::channel(64);
        tasks.push(
            AdaptiveController::new(
                session.clone(),
                adapters.encoder.clone(),
                outbound.clone(),
                config.video.clone(),
            )
            .spawn(adaptive_rx),
        );

        let input = Arc::new(InputDispatcher::new(adapters.injector.clone()));
        let router = Router::new(session.clone(), input, outbound, adaptive_tx, cache_tx);
        tasks.push(router.spawn(inbound_rx));

        info!(
            udp_port = local.udp_port(),
            tcp_port = local.tcp_port(),
            relay = relay.is_some(),
            "engine started"
        );
        Ok(Self {
            session,
            status_rx,
            local,
            relay,
            nearby,
            advertiser: adapters.advertiser,
            tasks,
        })
    }

    /// Status observer: phase, PIN, client, and teardown reasons.
    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status_rx.clone()
    }

    pub async fn pin(&self) -> String {
        self.session.pin().await
    }

    /// (udp, tcp) ports actually bound.
    pub fn local_ports(&self) -> (u16, u16) {
        (self.local.udp_port(), self.local.tcp_port())
    }

    /// Rotate the PIN: new key, new relay registration, prior client gone.
    pub async fn rotate_pin(&self) -> String {
        let pin = self.session.rotate_pin().await;
        if let Some(relay) = &self.relay {
            relay.register_session(pin.clone()).await;
        }
        pin
    }

    /// Deterministic teardown: session first (zeroes the key, stops the
    /// encoder), then the collaborators, then every task.
    pub async fn stop(mut self) {
        self.session.stop("host stopped").await;
        self.advertiser.stop();
        if let Some(nearby) = &self.nearby {
            nearby.stop();
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("engine stopped");
    }
}
