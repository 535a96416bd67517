//! Session context: exclusive owner of the audio-graph endpoints and the
//! codec pipelines, and the single site that posts configuration messages to
//! the player node.

use serde_json::{Map, Value};
use tracing::{debug, info};

use brigade_codec::worker::{
    opus_decoder_factory, opus_encoder_factory, DecoderFactory, EncoderFactory,
};
use brigade_codec::{
    Chunk, CodecParams, DecoderPipeline, EncoderPipeline, CODEC_SAMPLE_RATE, OPUS_FRAME_MS,
    OPUS_LATENCY_MS, RESAMPLE_LATENCY_MS,
};

use crate::error::ClientError;
use crate::player::{
    self, Dispatcher, LoopbackMode, PlayerEvent, PlayerEventKind, PlayerHandle, PlayerMessage,
    PlayerPort,
};
use crate::util::TaskGuard;

/// Milliseconds of microphone audio aggregated per encode/send cycle at
/// session start.
pub const INITIAL_MS_PER_BATCH: f64 = 600.0;

/// Upper bound the batch length may be grown to under load.
pub const MAX_MS_PER_BATCH: f64 = 900.0;

/// Samples per frame delivered by the audio worklet.
pub const WORKLET_FRAME_SAMPLES: usize = 128;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// The browser/OS-native rate microphone samples arrive at.
    pub client_sample_rate: u32,
    pub codec_sample_rate: u32,
    pub frame_duration_ms: f64,
    pub channels: u32,
    /// Replace the microphone with a synthesized source (testing aid; forces
    /// reported local latency to zero).
    pub synthetic_source: bool,
    /// Seconds between calibration clicks.
    pub click_interval: f32,
    pub loopback_mode: LoopbackMode,
    pub username: String,
    pub userid: String,
    /// How far behind our own write position we read the mix, in seconds.
    pub audio_offset_seconds: f32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            client_sample_rate: CODEC_SAMPLE_RATE,
            codec_sample_rate: CODEC_SAMPLE_RATE,
            frame_duration_ms: OPUS_FRAME_MS,
            channels: 1,
            synthetic_source: false,
            click_interval: 1.0,
            loopback_mode: LoopbackMode::None,
            username: String::new(),
            userid: String::new(),
            audio_offset_seconds: 0.0,
        }
    }
}

pub struct SessionContext {
    cfg: SessionConfig,
    player: PlayerHandle,
    dispatcher: Dispatcher,
    _dispatch_task: TaskGuard,
    encoder: Option<EncoderPipeline>,
    decoder: Option<DecoderPipeline>,
    encoder_factory: Option<EncoderFactory>,
    decoder_factory: Option<DecoderFactory>,
    epoch: u64,
    ms_per_batch: f64,
    pending_events: Vec<Value>,
}

impl SessionContext {
    /// Builds a context with Opus-backed codec workers, returning the
    /// worklet-side port of the player channel.
    pub fn new(cfg: SessionConfig) -> (Self, PlayerPort) {
        Self::with_codecs(cfg, opus_encoder_factory(), opus_decoder_factory())
    }

    /// Builds a context with caller-supplied codec factories.
    pub fn with_codecs(
        cfg: SessionConfig,
        encoder_factory: EncoderFactory,
        decoder_factory: DecoderFactory,
    ) -> (Self, PlayerPort) {
        let (player, events, port) = player::channel();
        let dispatcher = Dispatcher::default();
        let dispatch_task = tokio::spawn(dispatcher.clone().run(events));
        let context = Self {
            cfg,
            player,
            dispatcher,
            _dispatch_task: TaskGuard::new(dispatch_task),
            encoder: None,
            decoder: None,
            encoder_factory: Some(encoder_factory),
            decoder_factory: Some(decoder_factory),
            epoch: 0,
            ms_per_batch: INITIAL_MS_PER_BATCH,
            pending_events: Vec::new(),
        };
        (context, port)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.cfg
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn subscribe(&self, kinds: &[PlayerEventKind]) -> tokio::sync::mpsc::Receiver<PlayerEvent> {
        self.dispatcher.subscribe(kinds)
    }

    pub fn subscribe_all(&self) -> tokio::sync::mpsc::Receiver<PlayerEvent> {
        self.dispatcher.subscribe_all()
    }

    /// Samples the singer client aggregates before one encode/send cycle:
    /// a whole number of worklet frames closest to the configured batch
    /// length.
    pub fn sample_batch_size(&self) -> usize {
        let samples_per_ms = self.cfg.client_sample_rate as f64 / 1000.0;
        let frames = (samples_per_ms * self.ms_per_batch / WORKLET_FRAME_SAMPLES as f64).round();
        frames as usize * WORKLET_FRAME_SAMPLES
    }

    /// Adjusts the outbound pacing, clamped to the permitted range.
    pub fn set_ms_per_batch(&mut self, ms: f64) {
        self.ms_per_batch = ms.clamp(OPUS_FRAME_MS, MAX_MS_PER_BATCH);
    }

    /// Creates the codec pipelines if needed (the workers are expensive, so
    /// they are reused across resets) and performs the atomic restart.
    pub async fn start(&mut self) -> Result<(), ClientError> {
        self.ensure_pipelines().await?;
        self.reload_settings(true).await
    }

    async fn ensure_pipelines(&mut self) -> Result<(), ClientError> {
        let params = CodecParams {
            sampling_rate: self.cfg.client_sample_rate,
            num_of_channels: self.cfg.channels,
            frame_duration_ms: self.cfg.frame_duration_ms,
        };
        if self.encoder.is_none() {
            let factory = self
                .encoder_factory
                .take()
                .expect("encoder factory already consumed");
            let mut encoder = EncoderPipeline::spawn(factory);
            encoder.setup(params).await?;
            self.encoder = Some(encoder);
        }
        if self.decoder.is_none() {
            let factory = self
                .decoder_factory
                .take()
                .expect("decoder factory already consumed");
            let mut decoder = DecoderPipeline::spawn(factory);
            decoder.setup(params).await?;
            self.decoder = Some(decoder);
        }
        Ok(())
    }

    /// The single atomic restart point: stops the player, resets both
    /// pipelines under a fresh epoch, then reconfigures the player.
    pub async fn reload_settings(&mut self, startup: bool) -> Result<(), ClientError> {
        self.player.send(PlayerMessage::Stop).await?;
        self.epoch += 1;
        if let Some(encoder) = &mut self.encoder {
            encoder.reset().await?;
        }
        if let Some(decoder) = &mut self.decoder {
            decoder.reset().await?;
        }
        self.player
            .send(PlayerMessage::AudioParams {
                synthetic_source: self.cfg.synthetic_source,
                click_interval: self.cfg.click_interval,
                loopback_mode: self.cfg.loopback_mode,
                epoch: self.epoch,
            })
            .await?;
        info!(startup, epoch = self.epoch, "session settings loaded");
        Ok(())
    }

    /// Latency the codec path adds on top of the measured acoustic latency.
    pub fn encoding_latency_ms(&self) -> f32 {
        let mut latency = OPUS_LATENCY_MS;
        if self.encoder.as_ref().is_some_and(|e| e.resampling()) {
            latency += RESAMPLE_LATENCY_MS;
        }
        if self.decoder.as_ref().is_some_and(|d| d.resampling()) {
            latency += RESAMPLE_LATENCY_MS;
        }
        latency
    }

    /// Reports the measured local latency to the player, folding in the
    /// codec path's own latency. A synthetic source has no acoustic path, so
    /// its reported latency is forced to zero.
    pub async fn send_local_latency(&self, measured_ms: f32) -> Result<(), ClientError> {
        let local_latency = if self.cfg.synthetic_source {
            0
        } else {
            (measured_ms + self.encoding_latency_ms()).round() as i32
        };
        self.player
            .send(PlayerMessage::LocalLatency { local_latency })
            .await
    }

    pub async fn set_volume_estimation_mode(&self, enabled: bool) -> Result<(), ClientError> {
        self.player
            .send(PlayerMessage::VolumeEstimationMode { enabled })
            .await
    }

    pub async fn set_latency_estimation_mode(&self, enabled: bool) -> Result<(), ClientError> {
        self.player
            .send(PlayerMessage::LatencyEstimationMode { enabled })
            .await
    }

    pub async fn set_click_volume(&self, value: f32) -> Result<(), ClientError> {
        self.player
            .send(PlayerMessage::ClickVolumeChange { value })
            .await
    }

    pub async fn set_ignore_input(&self, enabled: bool) -> Result<(), ClientError> {
        self.player
            .send(PlayerMessage::IgnoreInput { enabled })
            .await
    }

    pub async fn request_current_clock(&self) -> Result<(), ClientError> {
        self.player.send(PlayerMessage::RequestCurClock).await
    }

    pub async fn set_alarm(&self, time: i64) -> Result<(), ClientError> {
        self.player.send(PlayerMessage::SetAlarm { time }).await
    }

    /// Queues decoded audio for playback.
    pub async fn play(&self, chunk: Chunk) -> Result<(), ClientError> {
        self.player.send(PlayerMessage::SamplesIn { chunk }).await
    }

    pub async fn stop_player(&self) -> Result<(), ClientError> {
        self.player.send(PlayerMessage::Stop).await
    }

    /// Records a user event annotation to ride along with the next
    /// transmission.
    pub fn declare_event(&mut self, event: Value) {
        self.pending_events.push(event);
    }

    pub fn discard_pending_events(&mut self) {
        if !self.pending_events.is_empty() {
            debug!(
                count = self.pending_events.len(),
                "discarding events declared before start"
            );
            self.pending_events.clear();
        }
    }

    /// Drains the metadata to attach to one transmission. Accumulated events
    /// are cleared by this call.
    pub fn take_metadata(&mut self) -> Map<String, Value> {
        let mut metadata = Map::new();
        metadata.insert("username".into(), self.cfg.username.clone().into());
        metadata.insert("userid".into(), self.cfg.userid.clone().into());
        metadata.insert(
            "audio_offset_seconds".into(),
            self.cfg.audio_offset_seconds.into(),
        );
        if !self.pending_events.is_empty() {
            metadata.insert(
                "new_events".into(),
                Value::Array(std::mem::take(&mut self.pending_events)),
            );
        }
        metadata
    }

    pub async fn encode(&mut self, chunk: Chunk) -> Result<Chunk, ClientError> {
        let encoder = self.encoder.as_mut().expect("session not started");
        Ok(encoder.encode_chunk(chunk).await?)
    }

    pub async fn decode(&mut self, chunk: Chunk) -> Result<Chunk, ClientError> {
        let decoder = self.decoder.as_mut().expect("session not started");
        Ok(decoder.decode_chunk(chunk).await?)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use brigade_codec::worker::{DecoderFactory, EncoderFactory};
    use brigade_codec::{EncodedFrames, FrameDecoder, FrameEncoder};

    use super::{SessionConfig, SessionContext};
    use crate::player::PlayerPort;

    /// 1:1 encoder: every call flushes all input as one tagged packet.
    pub(crate) struct PassthroughEncoder {
        pub resampling: bool,
        pub counter: u8,
        pub inputs: Arc<Mutex<Vec<usize>>>,
    }

    impl FrameEncoder for PassthroughEncoder {
        fn resampling(&self) -> bool {
            self.resampling
        }

        fn encode(&mut self, samples: &[f32]) -> anyhow::Result<EncodedFrames> {
            self.inputs.lock().unwrap().push(samples.len());
            self.counter = self.counter.wrapping_add(1);
            Ok(EncodedFrames {
                packets: vec![vec![self.counter]],
                samples_encoded: samples.len() as i32,
                buffered_samples: 0,
            })
        }

        fn reset(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    /// Decoder producing a fixed sample count per packet.
    pub(crate) struct FixedDecoder {
        pub samples_per_packet: usize,
        pub resampling: bool,
    }

    impl FrameDecoder for FixedDecoder {
        fn resampling(&self) -> bool {
            self.resampling
        }

        fn decode(&mut self, packet: &[u8]) -> anyhow::Result<Vec<f32>> {
            let tag = packet.first().copied().unwrap_or(0) as f32;
            Ok(vec![tag; self.samples_per_packet])
        }

        fn reset(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    pub(crate) fn mock_factories(
        enc_resampling: bool,
        dec_resampling: bool,
        samples_per_packet: usize,
    ) -> (EncoderFactory, DecoderFactory, Arc<Mutex<Vec<usize>>>) {
        let inputs: Arc<Mutex<Vec<usize>>> = Arc::default();
        let enc_inputs = inputs.clone();
        let encoder: EncoderFactory = Box::new(move |_params| {
            Ok(Box::new(PassthroughEncoder {
                resampling: enc_resampling,
                counter: 0,
                inputs: enc_inputs.clone(),
            }) as Box<dyn FrameEncoder>)
        });
        let decoder: DecoderFactory = Box::new(move |_params| {
            Ok(Box::new(FixedDecoder {
                samples_per_packet,
                resampling: dec_resampling,
            }) as Box<dyn FrameDecoder>)
        });
        (encoder, decoder, inputs)
    }

    pub(crate) fn mock_context(cfg: SessionConfig) -> (SessionContext, PlayerPort) {
        let (encoder, decoder, _) = mock_factories(false, false, 2880);
        SessionContext::with_codecs(cfg, encoder, decoder)
    }
}
