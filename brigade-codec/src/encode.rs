//! Outbound pipeline: contiguous client-referenced chunks in,
//! Opus-frame-aligned server-referenced chunks out.
//!
//! The pipeline owns the outbound clock pair. Both clocks start together on
//! the first real chunk: the client clock from the chunk itself, the server
//! clock rounded across the rate ratio exactly once. From then on both
//! advance by exact integer sums, so the two clocks can never drift apart
//! through accumulated rounding.

use tracing::{trace, warn};

use crate::chunk::{AudioChunk, Chunk, ClockReference, CompressedAudioChunk, PlaceholderChunk};
use crate::codec::CodecParams;
use crate::error::CodecError;
use crate::frame::pack_multi;
use crate::util::convert_rate;
use crate::worker::{CodecRequest, CodecResponse, EncoderFactory, WorkerHandle};
use crate::{CODEC_SAMPLE_RATE, DRIFT_THRESHOLD_SAMPLES};

/// Sub-frame time left over when a placeholder is rounded to a whole Opus
/// frame, kept at the client rate to be absorbed into the next input.
///
/// `length` is signed: positive means client time not yet emitted, negative
/// means time emitted ahead of the data (a placeholder rounded up), to be
/// borrowed back from the next real chunk. At most one remainder is ever
/// queued, and only before the clocks start.
#[derive(Debug, Clone, Copy)]
struct QueuedRemainder {
    end: i64,
    length: i64,
}

#[derive(Debug, Clone, Copy)]
struct Rates {
    client: u32,
    server: u32,
    frame_samples: i64,
}

pub struct EncoderPipeline {
    worker: WorkerHandle,
    rates: Option<Rates>,
    resampling: bool,
    client_clock: Option<i64>,
    server_clock: Option<i64>,
    queued: Option<QueuedRemainder>,
}

impl EncoderPipeline {
    pub fn spawn(factory: EncoderFactory) -> Self {
        Self {
            worker: WorkerHandle::spawn_encoder(factory),
            rates: None,
            resampling: false,
            client_clock: None,
            server_clock: None,
            queued: None,
        }
    }

    pub fn spawn_opus() -> Self {
        Self::spawn(crate::worker::opus_encoder_factory())
    }

    /// Runs worker setup and fixes both clock references. Must be called
    /// exactly once, before any other operation.
    pub async fn setup(&mut self, params: CodecParams) -> Result<(), CodecError> {
        assert!(self.rates.is_none(), "encoder setup may only run once");
        self.resampling = self.worker.setup(params).await?;
        self.rates = Some(Rates {
            client: params.sampling_rate,
            server: CODEC_SAMPLE_RATE,
            frame_samples: params.frame_samples() as i64,
        });
        Ok(())
    }

    /// Whether the worker reported resampling between the clock rates.
    pub fn resampling(&self) -> bool {
        self.resampling
    }

    /// Discards clock state and the queued remainder, and clears the
    /// worker's internal buffering. Idempotent.
    pub async fn reset(&mut self) -> Result<(), CodecError> {
        self.client_clock = None;
        self.server_clock = None;
        self.queued = None;
        self.worker.reset().await
    }

    pub async fn encode_chunk(&mut self, chunk: Chunk) -> Result<Chunk, CodecError> {
        match chunk {
            Chunk::Placeholder(placeholder) => self.encode_placeholder(placeholder),
            Chunk::Audio(audio) => self.encode_audio(audio).await,
            Chunk::Compressed(compressed) => Err(CodecError::ClockReferenceMismatch {
                expected: ClockReference::client(self.rates().client),
                actual: compressed.interval.reference,
            }),
        }
    }

    /// Converts a placeholder to the server clock, snapped to a whole number
    /// of Opus frames. The sub-frame difference is queued (signed) for the
    /// next input. The server clock is not advanced: no samples were
    /// encoded, and the chunk carries its absolute end.
    fn encode_placeholder(&mut self, chunk: PlaceholderChunk) -> Result<Chunk, CodecError> {
        let Rates {
            client,
            server,
            frame_samples,
        } = *self.rates();
        chunk
            .interval
            .check_reference(&ClockReference::client(client))?;
        if self.client_clock.is_some() {
            return Err(CodecError::ClockStartedPlaceholder);
        }

        let mut length = chunk.interval.length;
        if let Some(queued) = self.queued.take() {
            if queued.end != chunk.interval.start() {
                return Err(CodecError::NonContiguous);
            }
            length += queued.length;
        }
        let end = chunk.interval.end;

        let result_length = convert_rate(length, client, server);
        let send_length =
            (result_length as f64 / frame_samples as f64).round() as i64 * frame_samples;
        let leftover = convert_rate(result_length - send_length, server, client);
        if leftover != 0 {
            self.queued = Some(QueuedRemainder {
                end,
                length: leftover,
            });
        }
        let out_end = convert_rate(end - leftover, client, server);
        trace!(
            length,
            send_length,
            leftover,
            "placeholder snapped to frame boundary"
        );
        Ok(Chunk::Placeholder(PlaceholderChunk::new(
            ClockReference::server(server),
            out_end,
            send_length,
        )))
    }

    async fn encode_audio(&mut self, chunk: AudioChunk) -> Result<Chunk, CodecError> {
        let Rates { client, server, .. } = *self.rates();
        chunk
            .interval
            .check_reference(&ClockReference::client(client))?;

        let mut chunk = chunk;
        if let Some(queued) = self.queued.take() {
            // A remainder can only exist before the clocks start.
            if queued.end != chunk.interval.start() {
                return Err(CodecError::NonContiguous);
            }
            chunk = absorb_remainder(chunk, queued)?;
        }

        match self.client_clock {
            None => {
                // The one place a clock value crosses the rate boundary.
                let start = chunk.interval.start();
                self.client_clock = Some(start);
                self.server_clock = Some(convert_rate(start, client, server));
            }
            Some(clock) if chunk.interval.start() != clock => {
                return Err(CodecError::NonContiguous);
            }
            Some(_) => {}
        }
        self.client_clock = Some(chunk.interval.end);
        let client_end = chunk.interval.end;

        let response = self
            .worker
            .call(CodecRequest::Encode {
                samples: chunk.data,
            })
            .await?;
        let CodecResponse::Encode(frames) = response else {
            return Err(CodecError::CodecException {
                payload: format!("unexpected encode response: {response:?}"),
            });
        };

        let server_clock =
            self.server_clock.expect("server clock starts with client") + frames.samples_encoded as i64;
        self.server_clock = Some(server_clock);

        // Monitoring probe for resampler misbehavior: counting back every
        // sample the codec has seen must land on the client clock.
        let adjusted = server_clock + frames.buffered_samples as i64;
        let hypothetical_client = adjusted as f64 * client as f64 / server as f64;
        let drift = (client_end as f64 - hypothetical_client).abs();
        if drift > DRIFT_THRESHOLD_SAMPLES {
            warn!(
                drift,
                client_end, adjusted, "sample accounting drifted across the resampler"
            );
        }

        let data = pack_multi(&frames.packets);
        Ok(Chunk::Compressed(CompressedAudioChunk::new(
            ClockReference::server(server),
            server_clock,
            frames.samples_encoded as i64,
            data,
        )))
    }

    fn rates(&self) -> &Rates {
        self.rates
            .as_ref()
            .expect("encoder pipeline used before setup")
    }
}

/// Folds a queued placeholder remainder into the next real chunk. Positive
/// remainders become leading silence; negative remainders trim the samples
/// whose time was already emitted. The adjusted start seeds the clocks, so
/// the first compressed chunk lines up exactly with the last placeholder.
fn absorb_remainder(chunk: AudioChunk, remainder: QueuedRemainder) -> Result<AudioChunk, CodecError> {
    if remainder.length == 0 {
        return Ok(chunk);
    }
    let reference = chunk.interval.reference;
    let end = chunk.interval.end;
    if remainder.length > 0 {
        let mut data = Vec::with_capacity(remainder.length as usize + chunk.data.len());
        data.resize(remainder.length as usize, 0.0);
        data.extend_from_slice(&chunk.data);
        Ok(AudioChunk::from_samples(reference, end, data))
    } else {
        let trim = (-remainder.length) as usize;
        if trim > chunk.data.len() {
            return Err(CodecError::NonContiguous);
        }
        Ok(AudioChunk::from_samples(
            reference,
            end,
            chunk.data[trim..].to_vec(),
        ))
    }
}
