//! The audio delivery pipeline: encrypt each PCM buffer, send it as one
//! datagram. No fragmentation, no retransmit; late audio is worthless.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::session::{SessionManager, SharedCrypto};
use crate::transport::Outbound;

/// Consume PTS-prefixed f32 PCM buffers from the audio source adapter.
/// Buffers are dropped while no paired client wants audio.
pub(crate) fn spawn_audio_pipeline(
    mut audio_rx: mpsc::Receiver<Vec<u8>>,
    session: Arc<SessionManager>,
    crypto: SharedCrypto,
    outbound: Arc<Outbound>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(buffer) = audio_rx.recv().await {
            let Some(snapshot) = session.stream_snapshot().await else {
                continue;
            };
            if !snapshot.audio {
                continue;
            }
            let encrypted = {
                let crypto = crypto.read().unwrap_or_else(|e| e.into_inner());
                crypto.encrypt(&buffer)
            };
            let Some(encrypted) = encrypted else {
                continue;
            };
            outbound.send_audio(snapshot.transport, &encrypted).await;
        }
        info!("audio buffer channel closed");
    })
}
