//! Local loopback: a synthetic microphone sings into an in-process echo
//! server and plays the returned stream straight back.
//!
//! Exercises the whole path — batching, Opus encode, transport, Opus decode,
//! playback — without a network or an audio device.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Map;
use tracing::info;

use brigade_client::{
    PlayerEvent, PlayerMessage, ServerConnection, ServerInfo, ServerRequest, ServerResponse,
    SessionConfig, SessionContext, SingerClient,
};
use brigade_codec::{AudioChunk, Chunk, ClockReference, CompressedAudioChunk, CODEC_SAMPLE_RATE};

/// Echoes every batch back as the "mix".
struct EchoServer;

#[async_trait]
impl ServerConnection for EchoServer {
    async fn probe(&mut self) -> Option<ServerInfo> {
        Some(ServerInfo {
            server_clock: 0,
            server_sample_rate: CODEC_SAMPLE_RATE,
        })
    }

    async fn exchange(&mut self, request: ServerRequest) -> Option<ServerResponse> {
        let chunk = (!request.data.is_empty()).then(|| {
            CompressedAudioChunk::new(
                ClockReference::server(CODEC_SAMPLE_RATE),
                request.read_clock,
                request.n_samples,
                request.data.clone(),
            )
        });
        Some(ServerResponse {
            metadata: Map::new(),
            chunk,
            epoch: request.epoch,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cfg = SessionConfig {
        username: "loopback".into(),
        userid: "1".into(),
        ..SessionConfig::default()
    };
    let (ctx, mut port) = SessionContext::new(cfg);
    let (mut singer, _events) = SingerClient::new(ctx, EchoServer);
    let shutdown = singer.shutdown_token();

    // Stand-in for the audio worklet: 440 Hz sine in 128-sample frames.
    let worklet = tokio::spawn(async move {
        while let Some(message) = port.recv().await {
            if matches!(message, PlayerMessage::AudioParams { .. }) {
                break;
            }
        }
        let mut clock: i64 = 0;
        let mut phase: f32 = 0.0;
        for _batch in 0..3 {
            for _frame in 0..225 {
                let mut data = Vec::with_capacity(128);
                for _ in 0..128 {
                    phase += 2.0 * std::f32::consts::PI * 440.0 / CODEC_SAMPLE_RATE as f32;
                    data.push(phase.sin() * 0.5);
                }
                clock += 128;
                let chunk = Chunk::Audio(AudioChunk::from_samples(
                    ClockReference::client(CODEC_SAMPLE_RATE),
                    clock,
                    data,
                ));
                if !port.emit(PlayerEvent::SamplesOut { chunk }).await {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            while let Some(message) = port.try_recv() {
                if let PlayerMessage::SamplesIn { chunk } = message {
                    info!(samples = chunk.length(), "mixed audio arrived");
                }
            }
        }
    });

    let sing = tokio::spawn(async move { singer.start_singing().await });
    worklet.await?;
    shutdown.cancel();
    sing.await??;
    info!("loopback finished");
    Ok(())
}
