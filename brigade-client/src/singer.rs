//! The singer client: ties the microphone frame stream through
//! encoder → server → decoder → playback, and owns the session's outer
//! state machine.

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use brigade_codec::{concat_chunks, Chunk, CodecError};

use crate::context::SessionContext;
use crate::error::ClientError;
use crate::events::ClientEvent;
use crate::player::{LoopbackMode, PlayerEvent, PlayerEventKind};
use crate::server::{ServerConnection, ServerRequest};

const EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SingerState {
    Constructed,
    Starting,
    Running,
    LostConnectivity,
    Stopped,
}

pub struct SingerClient<S: ServerConnection> {
    ctx: SessionContext,
    server: S,
    state: SingerState,
    has_connectivity: bool,
    mic_buf: Vec<Chunk>,
    mic_len: i64,
    sent_first: bool,
    events: mpsc::Sender<ClientEvent>,
    shutdown: CancellationToken,
}

impl<S: ServerConnection> SingerClient<S> {
    pub fn new(ctx: SessionContext, server: S) -> (Self, mpsc::Receiver<ClientEvent>) {
        let (events, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let client = Self {
            ctx,
            server,
            state: SingerState::Constructed,
            has_connectivity: false,
            mic_buf: Vec::new(),
            mic_len: 0,
            sent_first: false,
            events,
            shutdown: CancellationToken::new(),
        };
        (client, events_rx)
    }

    pub fn state(&self) -> SingerState {
        self.state
    }

    pub fn has_connectivity(&self) -> bool {
        self.has_connectivity
    }

    /// Cancelling this token ends the singing loop cleanly.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Annotates the next transmission. Events declared before
    /// `start_singing` are discarded at start.
    pub fn declare_event(&mut self, event: Value) {
        self.ctx.declare_event(event);
    }

    /// Opens the server connection and runs the singing loop until the
    /// session is shut down, connectivity is lost, or a fatal error stops
    /// it. Connectivity loss is not an error: the state machine records it
    /// and the session stays addressable for teardown.
    pub async fn start_singing(&mut self) -> Result<(), ClientError> {
        self.state = SingerState::Starting;
        self.ctx.discard_pending_events();

        let Some(info) = self.server.probe().await else {
            self.note_connectivity_lost().await;
            return Ok(());
        };
        debug!(
            server_clock = info.server_clock,
            server_sample_rate = info.server_sample_rate,
            "server probe ok"
        );
        self.has_connectivity = true;

        match self.sing().await {
            Ok(()) => {
                info!("singing stopped");
                self.state = SingerState::Stopped;
                Ok(())
            }
            Err(ClientError::ConnectivityLost) => {
                self.note_connectivity_lost().await;
                Ok(())
            }
            Err(err) => {
                warn!("singing failed: {err}");
                self.state = SingerState::Stopped;
                let _ = self.ctx.stop_player().await;
                let _ = self
                    .events
                    .send(ClientEvent::Fatal {
                        kind: err.to_string(),
                    })
                    .await;
                Err(err)
            }
        }
    }

    async fn sing(&mut self) -> Result<(), ClientError> {
        // Subscribe before the player starts so no mic frame can slip past.
        let mut events = self.ctx.subscribe_all();
        self.ctx.start().await?;
        self.state = SingerState::Running;
        let batch_samples = self.ctx.sample_batch_size() as i64;

        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                event = events.recv() => event,
            };
            let Some(event) = event else {
                return Ok(());
            };
            match event {
                PlayerEvent::SamplesOut { chunk } => {
                    self.mic_len += chunk.length();
                    self.mic_buf.push(chunk);
                    if self.mic_len >= batch_samples {
                        self.exchange_batch().await?;
                    }
                }
                PlayerEvent::Underflow => return Err(ClientError::PlayerUnderflow),
                PlayerEvent::Exception { exception } => {
                    return Err(ClientError::PlayerException { payload: exception })
                }
                other => {
                    return Err(ClientError::UnknownMessage {
                        kind: PlayerEventKind::from(&other).to_string(),
                    })
                }
            }
        }
    }

    /// One encode → transmit → decode → play cycle over the aggregated
    /// microphone buffer.
    async fn exchange_batch(&mut self) -> Result<(), ClientError> {
        let chunks = std::mem::take(&mut self.mic_buf);
        self.mic_len = 0;
        let merged = concat_chunks(chunks)?;
        let encoded = self.ctx.encode(merged).await?;

        let (data, n_samples, write_clock) = match encoded {
            Chunk::Compressed(chunk) => {
                (chunk.data, chunk.interval.length, chunk.interval.end)
            }
            // Muted or not yet started: the interval still travels so the
            // server can advance our slot.
            Chunk::Placeholder(chunk) => (Vec::new(), chunk.interval.length, chunk.interval.end),
            Chunk::Audio(_) => {
                return Err(ClientError::Codec(CodecError::CodecException {
                    payload: "encoder emitted uncompressed audio".into(),
                }))
            }
        };

        let (read_offset, loopback) = {
            let cfg = self.ctx.config();
            (
                (cfg.audio_offset_seconds as f64 * cfg.codec_sample_rate as f64).round() as i64,
                cfg.loopback_mode == LoopbackMode::Server,
            )
        };
        let request = ServerRequest {
            data,
            n_samples,
            write_clock: Some(write_clock),
            read_clock: write_clock - read_offset,
            metadata: self.ctx.take_metadata(),
            loopback,
            reset_user_state: !self.sent_first,
            epoch: self.ctx.epoch(),
        };
        self.sent_first = true;

        let Some(response) = self.server.exchange(request).await else {
            return Err(ClientError::ConnectivityLost);
        };
        if response.epoch != self.ctx.epoch() {
            debug!(
                response_epoch = response.epoch,
                epoch = self.ctx.epoch(),
                "dropping stale server response"
            );
            return Ok(());
        }
        if response.metadata.get("kill_client") == Some(&Value::Bool(true)) {
            let message = response
                .metadata
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("server closed the session")
                .to_string();
            return Err(ClientError::KilledByServer { message });
        }

        // An absent chunk is normal: the server had nothing for us yet.
        if let Some(chunk) = response.chunk {
            let decoded = self.ctx.decode(Chunk::Compressed(chunk)).await?;
            self.ctx.play(decoded).await?;
        }
        Ok(())
    }

    async fn note_connectivity_lost(&mut self) {
        warn!("server connectivity lost");
        self.has_connectivity = false;
        self.state = SingerState::LostConnectivity;
        let _ = self
            .events
            .send(ClientEvent::ConnectivityChange {
                has_connectivity: false,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::Map;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    use brigade_codec::{AudioChunk, ClockReference, CompressedAudioChunk, PlaceholderChunk};

    use super::*;
    use crate::context::testing::mock_context;
    use crate::context::SessionConfig;
    use crate::player::{PlayerMessage, PlayerPort};
    use crate::server::{ServerInfo, ServerResponse};

    const TICK: Duration = Duration::from_secs(2);

    #[derive(Clone, Default)]
    struct MockServer {
        probe_fails: bool,
        responses: Arc<Mutex<VecDeque<Option<ServerResponse>>>>,
        requests: Arc<Mutex<Vec<ServerRequest>>>,
    }

    #[async_trait]
    impl ServerConnection for MockServer {
        async fn probe(&mut self) -> Option<ServerInfo> {
            (!self.probe_fails).then_some(ServerInfo {
                server_clock: 1_000_000,
                server_sample_rate: 48_000,
            })
        }

        async fn exchange(&mut self, request: ServerRequest) -> Option<ServerResponse> {
            let epoch = request.epoch;
            self.requests.lock().unwrap().push(request);
            self.responses.lock().unwrap().pop_front().unwrap_or_else(|| {
                Some(ServerResponse {
                    metadata: Map::new(),
                    chunk: None,
                    epoch,
                })
            })
        }
    }

    struct Harness {
        task: JoinHandle<(SingerClient<MockServer>, Result<(), ClientError>)>,
        port: PlayerPort,
        events: mpsc::Receiver<ClientEvent>,
        server: MockServer,
        shutdown: CancellationToken,
    }

    async fn start_harness(server: MockServer) -> Harness {
        let (ctx, port) = mock_context(SessionConfig {
            username: "alto2".into(),
            userid: "17".into(),
            ..SessionConfig::default()
        });
        let (mut singer, events) = SingerClient::new(ctx, server.clone());
        let shutdown = singer.shutdown_token();
        let task = tokio::spawn(async move {
            let result = singer.start_singing().await;
            (singer, result)
        });
        Harness {
            task,
            port,
            events,
            server,
            shutdown,
        }
    }

    /// Waits for the startup messages the context sends once the loop is
    /// subscribed and running.
    async fn await_startup(port: &mut PlayerPort) {
        assert_eq!(
            timeout(TICK, port.recv()).await.unwrap(),
            Some(PlayerMessage::Stop)
        );
        let message = timeout(TICK, port.recv()).await.unwrap();
        assert!(matches!(
            message,
            Some(PlayerMessage::AudioParams { epoch: 1, .. })
        ));
    }

    fn mic_chunk(index: i64) -> PlayerEvent {
        let end = (index + 1) * 128;
        PlayerEvent::SamplesOut {
            chunk: Chunk::Audio(AudioChunk::from_samples(
                ClockReference::client(48_000),
                end,
                vec![0.0; 128],
            )),
        }
    }

    async fn feed_one_batch(port: &mut PlayerPort) {
        // 600 ms at 48 kHz: 225 worklet frames of 128 samples.
        for index in 0..225 {
            assert!(port.emit(mic_chunk(index)).await);
        }
    }

    #[tokio::test]
    async fn full_cycle_plays_the_mixed_response() {
        let server = MockServer::default();
        server.responses.lock().unwrap().push_back(Some(ServerResponse {
            metadata: Map::new(),
            chunk: Some(CompressedAudioChunk::new(
                ClockReference::server(48_000),
                28_800,
                2880,
                brigade_codec::frame::pack_multi(&[vec![0x11]]),
            )),
            epoch: 1,
        }));
        let mut harness = start_harness(server).await;
        await_startup(&mut harness.port).await;
        feed_one_batch(&mut harness.port).await;

        let message = timeout(TICK, harness.port.recv()).await.unwrap().unwrap();
        let PlayerMessage::SamplesIn { chunk } = message else {
            panic!("expected samples_in, got {message:?}");
        };
        assert_eq!(chunk.length(), 2880);

        let requests = harness.server.requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].n_samples, 28_800);
        assert_eq!(requests[0].write_clock, Some(28_800));
        assert_eq!(requests[0].read_clock, 28_800);
        assert!(requests[0].reset_user_state);
        assert_eq!(requests[0].epoch, 1);
        assert_eq!(requests[0].metadata["username"], "alto2");
        drop(requests);

        // A second batch no longer resets server-side user state.
        for index in 225..450 {
            assert!(harness.port.emit(mic_chunk(index)).await);
        }
        loop {
            if harness.server.requests.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        harness.shutdown.cancel();
        let (singer, result) = harness.task.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(singer.state(), SingerState::Stopped);
        let requests = harness.server.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(!requests[1].reset_user_state);
    }

    #[tokio::test]
    async fn empty_exchange_means_connectivity_lost() {
        // S6: the transport returns None; nothing reaches the player and the
        // state machine records the loss.
        let server = MockServer::default();
        server.responses.lock().unwrap().push_back(None);
        let mut harness = start_harness(server).await;
        await_startup(&mut harness.port).await;
        feed_one_batch(&mut harness.port).await;

        let (singer, result) = harness.task.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(singer.state(), SingerState::LostConnectivity);
        assert!(!singer.has_connectivity());
        assert_eq!(
            harness.events.recv().await,
            Some(ClientEvent::ConnectivityChange {
                has_connectivity: false
            })
        );
        assert!(harness.port.try_recv().is_none());
    }

    #[tokio::test]
    async fn failed_probe_never_starts_the_player() {
        let server = MockServer {
            probe_fails: true,
            ..MockServer::default()
        };
        let mut harness = start_harness(server).await;
        let (singer, result) = harness.task.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(singer.state(), SingerState::LostConnectivity);
        assert!(harness.port.try_recv().is_none());
        assert_eq!(
            harness.events.recv().await,
            Some(ClientEvent::ConnectivityChange {
                has_connectivity: false
            })
        );
    }

    #[tokio::test]
    async fn kill_client_metadata_is_fatal() {
        let server = MockServer::default();
        let mut metadata = Map::new();
        metadata.insert("kill_client".into(), Value::Bool(true));
        metadata.insert("message".into(), "user too stale".into());
        server.responses.lock().unwrap().push_back(Some(ServerResponse {
            metadata,
            chunk: None,
            epoch: 1,
        }));
        let mut harness = start_harness(server).await;
        await_startup(&mut harness.port).await;
        feed_one_batch(&mut harness.port).await;

        let (singer, result) = harness.task.await.unwrap();
        assert!(matches!(
            result,
            Err(ClientError::KilledByServer { message }) if message == "user too stale"
        ));
        assert_eq!(singer.state(), SingerState::Stopped);
        assert!(matches!(
            harness.events.recv().await,
            Some(ClientEvent::Fatal { .. })
        ));
    }

    #[tokio::test]
    async fn stale_epoch_responses_are_dropped() {
        let server = MockServer::default();
        server.responses.lock().unwrap().push_back(Some(ServerResponse {
            metadata: Map::new(),
            chunk: Some(CompressedAudioChunk::new(
                ClockReference::server(48_000),
                28_800,
                2880,
                brigade_codec::frame::pack_multi(&[vec![0x22]]),
            )),
            epoch: 0,
        }));
        let mut harness = start_harness(server).await;
        await_startup(&mut harness.port).await;
        feed_one_batch(&mut harness.port).await;

        // The stale chunk must never reach the player.
        assert!(timeout(Duration::from_millis(200), harness.port.recv())
            .await
            .is_err());
        harness.shutdown.cancel();
        let (_, result) = harness.task.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn underflow_is_fatal() {
        let mut harness = start_harness(MockServer::default()).await;
        await_startup(&mut harness.port).await;
        assert!(harness.port.emit(PlayerEvent::Underflow).await);

        let (singer, result) = harness.task.await.unwrap();
        assert!(matches!(result, Err(ClientError::PlayerUnderflow)));
        assert_eq!(singer.state(), SingerState::Stopped);
        // Fatal errors stop the audio graph and surface a terminal event.
        assert_eq!(
            timeout(TICK, harness.port.recv()).await.unwrap(),
            Some(PlayerMessage::Stop)
        );
        assert!(matches!(
            harness.events.recv().await,
            Some(ClientEvent::Fatal { .. })
        ));
    }

    #[tokio::test]
    async fn player_exception_is_fatal() {
        let mut harness = start_harness(MockServer::default()).await;
        await_startup(&mut harness.port).await;
        assert!(
            harness
                .port
                .emit(PlayerEvent::Exception {
                    exception: "worklet crashed".into(),
                })
                .await
        );
        let (_, result) = harness.task.await.unwrap();
        assert!(matches!(
            result,
            Err(ClientError::PlayerException { payload }) if payload == "worklet crashed"
        ));
    }

    #[tokio::test]
    async fn unexpected_message_kinds_are_fatal() {
        let mut harness = start_harness(MockServer::default()).await;
        await_startup(&mut harness.port).await;
        assert!(harness.port.emit(PlayerEvent::CurClock { clock: 9 }).await);
        let (_, result) = harness.task.await.unwrap();
        assert!(matches!(
            result,
            Err(ClientError::UnknownMessage { kind }) if kind == "CurClock"
        ));
    }

    #[tokio::test]
    async fn events_declared_before_start_are_discarded() {
        let (ctx, mut port) = mock_context(SessionConfig::default());
        let (mut singer, _events) = SingerClient::new(ctx, MockServer::default());
        singer.declare_event(serde_json::json!({ "evid": "too-early" }));
        let server = singer.server.clone();
        let shutdown = singer.shutdown_token();

        let task = tokio::spawn(async move { singer.start_singing().await });
        await_startup(&mut port).await;
        feed_one_batch(&mut port).await;

        loop {
            if !server.requests.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        task.await.unwrap().unwrap();
        let requests = server.requests.lock().unwrap();
        assert!(!requests[0].metadata.contains_key("new_events"));
    }

    #[tokio::test]
    async fn placeholder_batches_travel_without_a_body() {
        // Before the mic unmutes, the worklet sends placeholder frames; the
        // whole batch goes out as an interval with no body.
        let server = MockServer::default();
        let mut harness = start_harness(server).await;
        await_startup(&mut harness.port).await;
        for index in 0..225i64 {
            let end = (index + 1) * 128;
            assert!(
                harness
                    .port
                    .emit(PlayerEvent::SamplesOut {
                        chunk: Chunk::Placeholder(PlaceholderChunk::new(
                            ClockReference::client(48_000),
                            end,
                            128,
                        )),
                    })
                    .await
            );
        }
        loop {
            if !harness.server.requests.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        harness.shutdown.cancel();
        let (_, result) = harness.task.await.unwrap();
        assert!(result.is_ok());

        let requests = harness.server.requests.lock().unwrap();
        assert!(requests[0].data.is_empty());
        // 28800 client samples snap to ten whole Opus frames.
        assert_eq!(requests[0].n_samples, 28_800);
        assert_eq!(requests[0].write_clock, Some(28_800));
    }
}
