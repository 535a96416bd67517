//! Black-box frame codec seam and its Opus-backed implementations.
//!
//! The pipelines never touch the codec directly; they talk to a worker
//! (see [`crate::worker`]) that owns one of these. The traits keep the codec
//! swappable, which the tests use to script exact responses.

use std::collections::VecDeque;

use anyhow::{ensure, Context, Result};

use crate::{CODEC_SAMPLE_RATE, OPUS_FRAME_MS, PERMITTED_FRAME_MS};

/// Worst-case decode buffer: one maximum-duration Opus packet at 48 kHz.
const MAX_PACKET_SAMPLES: usize = 5760;

/// Upper bound on one encoded Opus packet.
const MAX_PACKET_BYTES: usize = 4000;

/// Setup parameters for a codec worker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CodecParams {
    /// The local hardware rate samples arrive at (encoder) or leave at
    /// (decoder).
    pub sampling_rate: u32,
    pub num_of_channels: u32,
    pub frame_duration_ms: f64,
}

impl CodecParams {
    pub fn new(sampling_rate: u32) -> Self {
        Self {
            sampling_rate,
            num_of_channels: 1,
            frame_duration_ms: OPUS_FRAME_MS,
        }
    }

    /// Samples per codec frame at the canonical rate.
    pub fn frame_samples(&self) -> usize {
        (self.frame_duration_ms * CODEC_SAMPLE_RATE as f64 / 1000.0).round() as usize
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            self.num_of_channels == 1,
            "only mono is supported, got {} channels",
            self.num_of_channels
        );
        ensure!(
            PERMITTED_FRAME_MS.contains(&self.frame_duration_ms),
            "frame duration {} ms is not a legal Opus frame size",
            self.frame_duration_ms
        );
        ensure!(self.sampling_rate > 0, "sampling rate must be positive");
        Ok(())
    }
}

/// Result of one encode call: zero or more whole compressed frames plus the
/// accounting the pipeline's drift probe needs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncodedFrames {
    pub packets: Vec<Vec<u8>>,
    /// Codec-rate samples drained into `packets` by this call.
    pub samples_encoded: i32,
    /// Codec-rate samples still buffered (sub-frame remainder plus any
    /// samples held inside the resampler).
    pub buffered_samples: i32,
}

pub trait FrameEncoder: Send + 'static {
    /// Whether the implementation resamples between the device and codec
    /// rates.
    fn resampling(&self) -> bool;
    fn encode(&mut self, samples: &[f32]) -> Result<EncodedFrames>;
    fn reset(&mut self) -> Result<()>;
}

pub trait FrameDecoder: Send + 'static {
    fn resampling(&self) -> bool;
    /// Decodes one packet into device-rate PCM.
    fn decode(&mut self, packet: &[u8]) -> Result<Vec<f32>>;
    fn reset(&mut self) -> Result<()>;
}

/// Streaming linear-interpolation resampler with sample-exact source
/// accounting: the fractional read position advances by `from/to` per output
/// sample, so no source time is ever dropped or double-counted.
struct LinearResampler {
    /// Source samples per output sample.
    ratio: f64,
    queue: VecDeque<f32>,
    /// Fractional read position into `queue`.
    src_pos: f64,
}

impl LinearResampler {
    fn new(from_rate: u32, to_rate: u32) -> Self {
        Self {
            ratio: from_rate as f64 / to_rate as f64,
            queue: VecDeque::new(),
            src_pos: 0.0,
        }
    }

    fn push(&mut self, samples: &[f32]) {
        self.queue.extend(samples.iter().copied());
    }

    /// Drains every output sample the buffered source can interpolate,
    /// keeping the final source sample around for the next call.
    fn pop_into(&mut self, out: &mut Vec<f32>) {
        loop {
            let idx0 = self.src_pos.floor() as usize;
            let idx1 = idx0 + 1;
            if idx1 >= self.queue.len() {
                break;
            }
            let frac = (self.src_pos - idx0 as f64) as f32;
            let s0 = self.queue[idx0];
            let s1 = self.queue[idx1];
            out.push(s0 + frac * (s1 - s0));
            self.src_pos += self.ratio;
        }
        let consumed = (self.src_pos.floor() as usize).min(self.queue.len());
        self.queue.drain(..consumed);
        self.src_pos -= consumed as f64;
    }

    /// Source samples fed but not yet represented in the output.
    fn buffered_source(&self) -> f64 {
        self.queue.len() as f64 - self.src_pos
    }

    fn reset(&mut self) {
        self.queue.clear();
        self.src_pos = 0.0;
    }
}

/// Device-rate PCM in, whole 60 ms Opus frames out.
pub struct OpusFrameEncoder {
    encoder: opus::Encoder,
    resampler: Option<LinearResampler>,
    source_rate: u32,
    /// Codec-rate samples awaiting a whole frame.
    fifo: Vec<f32>,
    frame_samples: usize,
}

impl OpusFrameEncoder {
    pub fn new(params: &CodecParams) -> Result<Self> {
        params.validate()?;
        let encoder = opus::Encoder::new(
            CODEC_SAMPLE_RATE,
            opus::Channels::Mono,
            opus::Application::Audio,
        )
        .context("failed to create opus encoder")?;
        let resampler = (params.sampling_rate != CODEC_SAMPLE_RATE)
            .then(|| LinearResampler::new(params.sampling_rate, CODEC_SAMPLE_RATE));
        Ok(Self {
            encoder,
            resampler,
            source_rate: params.sampling_rate,
            fifo: Vec::new(),
            frame_samples: params.frame_samples(),
        })
    }
}

impl FrameEncoder for OpusFrameEncoder {
    fn resampling(&self) -> bool {
        self.resampler.is_some()
    }

    fn encode(&mut self, samples: &[f32]) -> Result<EncodedFrames> {
        match &mut self.resampler {
            Some(resampler) => {
                resampler.push(samples);
                resampler.pop_into(&mut self.fifo);
            }
            None => self.fifo.extend_from_slice(samples),
        }

        let mut packets = Vec::new();
        let mut samples_encoded = 0usize;
        let mut offset = 0usize;
        while self.fifo.len() - offset >= self.frame_samples {
            let frame = &self.fifo[offset..offset + self.frame_samples];
            let mut packet = vec![0u8; MAX_PACKET_BYTES];
            let written = self
                .encoder
                .encode_float(frame, &mut packet)
                .context("opus encode failed")?;
            packet.truncate(written);
            packets.push(packet);
            offset += self.frame_samples;
            samples_encoded += self.frame_samples;
        }
        self.fifo.drain(..offset);

        let resampler_buffered = self
            .resampler
            .as_ref()
            .map(|r| r.buffered_source() * CODEC_SAMPLE_RATE as f64 / self.source_rate as f64)
            .unwrap_or(0.0);
        let buffered_samples = (self.fifo.len() as f64 + resampler_buffered).round() as i32;

        Ok(EncodedFrames {
            packets,
            samples_encoded: samples_encoded as i32,
            buffered_samples,
        })
    }

    fn reset(&mut self) -> Result<()> {
        self.fifo.clear();
        if let Some(resampler) = &mut self.resampler {
            resampler.reset();
        }
        self.encoder
            .reset_state()
            .context("failed to reset opus encoder")
    }
}

/// One Opus packet in, one frame of device-rate PCM out.
pub struct OpusFrameDecoder {
    decoder: opus::Decoder,
    resampler: Option<LinearResampler>,
}

impl OpusFrameDecoder {
    pub fn new(params: &CodecParams) -> Result<Self> {
        params.validate()?;
        let decoder = opus::Decoder::new(CODEC_SAMPLE_RATE, opus::Channels::Mono)
            .context("failed to create opus decoder")?;
        let resampler = (params.sampling_rate != CODEC_SAMPLE_RATE)
            .then(|| LinearResampler::new(CODEC_SAMPLE_RATE, params.sampling_rate));
        Ok(Self { decoder, resampler })
    }
}

impl FrameDecoder for OpusFrameDecoder {
    fn resampling(&self) -> bool {
        self.resampler.is_some()
    }

    fn decode(&mut self, packet: &[u8]) -> Result<Vec<f32>> {
        let mut pcm = vec![0f32; MAX_PACKET_SAMPLES];
        let decoded = self
            .decoder
            .decode_float(packet, &mut pcm, false)
            .context("opus decode failed")?;
        pcm.truncate(decoded);
        match &mut self.resampler {
            Some(resampler) => {
                resampler.push(&pcm);
                let mut out = Vec::with_capacity(pcm.len());
                resampler.pop_into(&mut out);
                Ok(out)
            }
            None => Ok(pcm),
        }
    }

    fn reset(&mut self) -> Result<()> {
        if let Some(resampler) = &mut self.resampler {
            resampler.reset();
        }
        self.decoder
            .reset_state()
            .context("failed to reset opus decoder")
    }
}
