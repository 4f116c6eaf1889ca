//! AirCatch host engine: pairs a touch client against a PIN, streams the
//! encoded screen (and optionally system audio) over local UDP/TCP, a
//! close-range P2P link, or an internet relay, and injects the client's
//! input into the host OS.
//!
//! Platform shells supply the OS-specific collaborators (capture/encoder,
//! input injection, mDNS, close-range radio, STUN) through the traits in
//! [`adapters`] and drive everything through [`engine::Engine`].

pub mod adapters;
pub mod adaptive;
pub mod annexb;
pub mod audio;
pub mod crypto;
pub mod engine;
pub mod input;
pub mod router;
pub mod session;
pub mod transport;
pub mod video;

pub use engine::{Adapters, Engine, MediaChannels, NearbyChannels};
pub use session::{SessionPhase, SessionStatus};
