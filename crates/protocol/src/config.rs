use serde::{Deserialize, Serialize};

/// Default relay rendezvous endpoint; overridable per deployment.
pub const DEFAULT_RELAY_URL: &str = "wss://relay.aircatch.app/v1/session";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AirCatchConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub video: VideoConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// UDP media/input port (0 = ephemeral)
    #[serde(default)]
    pub udp_port: u16,
    /// TCP stream port (0 = ephemeral)
    #[serde(default)]
    pub tcp_port: u16,
    /// Instance name advertised over DNS-SD
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Relay rendezvous WebSocket URL
    #[serde(default = "default_relay_url")]
    pub url: String,
    /// Whether internet relay pairing is offered at all
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    /// Chunk payload size in bytes for fragmented UDP delivery
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Initial local-session bitrate in bits per second
    #[serde(default = "default_bitrate")]
    pub bitrate: u64,
    /// Adaptive floor in bits per second
    #[serde(default = "default_min_bitrate")]
    pub min_bitrate: u64,
    /// Adaptive ceiling in bits per second
    #[serde(default = "default_max_bitrate")]
    pub max_bitrate: u64,
    /// Target local framerate
    #[serde(default = "default_framerate")]
    pub framerate: u32,
    /// Initial relay-session bitrate in bits per second
    #[serde(default = "default_relay_bitrate")]
    pub relay_bitrate: u64,
    /// Target relay framerate
    #[serde(default = "default_relay_framerate")]
    pub relay_framerate: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Offer system-audio streaming to clients that ask for it
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Chunk cache entry lifetime in milliseconds
    #[serde(default = "default_cache_ttl_ms")]
    pub ttl_ms: u64,
    /// Prune runs every N frames (`frame_id % N == 0`)
    #[serde(default = "default_prune_interval")]
    pub prune_interval: u32,
    /// Hard cap on cached frames; oldest are evicted beyond it
    #[serde(default = "default_cache_max_frames")]
    pub max_frames: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            udp_port: 0,
            tcp_port: 0,
            service_name: default_service_name(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: default_relay_url(),
            enabled: false,
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            bitrate: default_bitrate(),
            min_bitrate: default_min_bitrate(),
            max_bitrate: default_max_bitrate(),
            framerate: default_framerate(),
            relay_bitrate: default_relay_bitrate(),
            relay_framerate: default_relay_framerate(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_cache_ttl_ms(),
            prune_interval: default_prune_interval(),
            max_frames: default_cache_max_frames(),
        }
    }
}

impl AirCatchConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, the engine should not
    /// start) or "WARNING:" (advisory).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.video.chunk_size == 0 {
            issues.push("ERROR: video.chunk_size must be at least 1".to_string());
        } else if self.video.chunk_size > 1400 {
            issues.push(format!(
                "WARNING: video.chunk_size {} likely exceeds the path MTU; \
                 chunks will fragment at the IP layer",
                self.video.chunk_size
            ));
        }

        if self.video.min_bitrate > self.video.max_bitrate {
            issues.push(format!(
                "ERROR: video.min_bitrate {} exceeds video.max_bitrate {}",
                self.video.min_bitrate, self.video.max_bitrate
            ));
        }
        if !(self.video.min_bitrate..=self.video.max_bitrate).contains(&self.video.bitrate) {
            issues.push(format!(
                "WARNING: video.bitrate {} is outside [{}, {}] and will be clamped \
                 by the adaptive controller",
                self.video.bitrate, self.video.min_bitrate, self.video.max_bitrate
            ));
        }
        if self.video.framerate == 0 || self.video.relay_framerate == 0 {
            issues.push("ERROR: framerates must be nonzero".to_string());
        }

        if self.relay.enabled && self.relay.url.is_empty() {
            issues.push("ERROR: relay.enabled is set but relay.url is empty".to_string());
        }
        if self.relay.enabled
            && !(self.relay.url.starts_with("wss://") || self.relay.url.starts_with("ws://"))
        {
            issues.push(format!(
                "ERROR: relay.url '{}' is not a ws:// or wss:// URL",
                self.relay.url
            ));
        }

        if self.cache.prune_interval == 0 {
            issues.push("ERROR: cache.prune_interval must be nonzero".to_string());
        }
        if self.cache.ttl_ms == 0 {
            issues.push(
                "WARNING: cache.ttl_ms of 0 evicts every entry at the next prune; \
                 NACK recovery will be ineffective"
                    .to_string(),
            );
        }
        if self.cache.max_frames == 0 {
            issues.push("ERROR: cache.max_frames must be nonzero".to_string());
        }

        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }
}

fn default_service_name() -> String {
    "AirCatch Host".to_string()
}

fn default_relay_url() -> String {
    DEFAULT_RELAY_URL.to_string()
}

fn default_chunk_size() -> usize {
    crate::chunk::DEFAULT_CHUNK_SIZE
}

fn default_bitrate() -> u64 {
    20_000_000
}

fn default_min_bitrate() -> u64 {
    5_000_000
}

fn default_max_bitrate() -> u64 {
    50_000_000
}

fn default_framerate() -> u32 {
    60
}

fn default_relay_bitrate() -> u64 {
    6_000_000
}

fn default_relay_framerate() -> u32 {
    30
}

fn default_true() -> bool {
    true
}

fn default_cache_ttl_ms() -> u64 {
    1000
}

fn default_prune_interval() -> u32 {
    60
}

fn default_cache_max_frames() -> usize {
    256
}
