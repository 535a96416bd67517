//! Inbound pipeline: server-referenced compressed chunks in, client-referenced
//! PCM out. Mirror of [`crate::encode`], without the sub-frame remainder:
//! frame boundaries arrive from the server.

use tracing::warn;

use crate::chunk::{AudioChunk, Chunk, ClockReference, CompressedAudioChunk, PlaceholderChunk};
use crate::codec::CodecParams;
use crate::error::CodecError;
use crate::frame::unpack_multi;
use crate::util::convert_rate;
use crate::worker::{CodecRequest, CodecResponse, DecoderFactory, WorkerHandle};
use crate::{CODEC_SAMPLE_RATE, DRIFT_THRESHOLD_SAMPLES};

#[derive(Debug, Clone, Copy)]
struct Rates {
    client: u32,
    server: u32,
}

pub struct DecoderPipeline {
    worker: WorkerHandle,
    rates: Option<Rates>,
    resampling: bool,
    client_clock: Option<i64>,
    server_clock: Option<i64>,
    /// In strict mode a decoded-length disagreement is fatal; otherwise it
    /// only warns.
    strict: bool,
}

impl DecoderPipeline {
    pub fn spawn(factory: DecoderFactory) -> Self {
        Self {
            worker: WorkerHandle::spawn_decoder(factory),
            rates: None,
            resampling: false,
            client_clock: None,
            server_clock: None,
            strict: true,
        }
    }

    pub fn spawn_opus() -> Self {
        Self::spawn(crate::worker::opus_decoder_factory())
    }

    /// Runs worker setup and fixes both clock references. Must be called
    /// exactly once, before any other operation.
    pub async fn setup(&mut self, params: CodecParams) -> Result<(), CodecError> {
        assert!(self.rates.is_none(), "decoder setup may only run once");
        self.resampling = self.worker.setup(params).await?;
        self.rates = Some(Rates {
            client: params.sampling_rate,
            server: CODEC_SAMPLE_RATE,
        });
        Ok(())
    }

    pub fn resampling(&self) -> bool {
        self.resampling
    }

    pub fn set_strict(&mut self, strict: bool) {
        self.strict = strict;
    }

    /// Discards clock state and clears the worker's buffering. Idempotent.
    pub async fn reset(&mut self) -> Result<(), CodecError> {
        self.client_clock = None;
        self.server_clock = None;
        self.worker.reset().await
    }

    pub async fn decode_chunk(&mut self, chunk: Chunk) -> Result<Chunk, CodecError> {
        match chunk {
            Chunk::Compressed(compressed) => self.decode_compressed(compressed).await,
            Chunk::Placeholder(placeholder) => self.decode_placeholder(placeholder),
            Chunk::Audio(audio) => Err(CodecError::ClockReferenceMismatch {
                expected: ClockReference::server(self.rates().server),
                actual: audio.interval.reference,
            }),
        }
    }

    /// Converts a placeholder interval to the client clock, dimensionally.
    /// No frame snapping and no remainder; the server already frame-aligned
    /// its stream.
    fn decode_placeholder(&mut self, chunk: PlaceholderChunk) -> Result<Chunk, CodecError> {
        let Rates { client, server } = *self.rates();
        chunk
            .interval
            .check_reference(&ClockReference::server(server))?;
        if self.server_clock.is_some() {
            return Err(CodecError::ClockStartedPlaceholder);
        }
        Ok(Chunk::Placeholder(PlaceholderChunk::new(
            ClockReference::client(client),
            convert_rate(chunk.interval.end, server, client),
            convert_rate(chunk.interval.length, server, client),
        )))
    }

    async fn decode_compressed(&mut self, chunk: CompressedAudioChunk) -> Result<Chunk, CodecError> {
        let Rates { client, server } = *self.rates();
        chunk
            .interval
            .check_reference(&ClockReference::server(server))?;

        match self.server_clock {
            None => {
                let start = chunk.interval.start();
                self.server_clock = Some(start);
                self.client_clock = Some(convert_rate(start, server, client));
            }
            Some(clock) if chunk.interval.start() != clock => {
                return Err(CodecError::NonContiguous);
            }
            Some(_) => {}
        }

        // Post every per-packet request before awaiting any response, so one
        // chunk's packets can never interleave with another's.
        let packets = unpack_multi(&chunk.data)?;
        let mut request_ids = Vec::with_capacity(packets.len());
        for packet in packets {
            request_ids
                .push(self.worker.submit(CodecRequest::Decode { data: packet }).await?);
        }

        let mut samples = Vec::new();
        for request_id in request_ids {
            let response = self.worker.response(request_id).await?;
            let CodecResponse::Decode { samples: decoded } = response else {
                return Err(CodecError::CodecException {
                    payload: format!("unexpected decode response: {response:?}"),
                });
            };
            samples.extend_from_slice(&decoded);
        }

        let expected = convert_rate(chunk.interval.length, server, client);
        let actual = samples.len() as i64;
        if ((expected - actual).abs() as f64) >= DRIFT_THRESHOLD_SAMPLES {
            if self.strict {
                return Err(CodecError::DecodeLengthMismatch { expected, actual });
            }
            warn!(expected, actual, "decoded length disagrees with interval");
        }

        self.server_clock = Some(chunk.interval.end);
        let client_clock = self.client_clock.expect("client clock starts with server") + actual;
        self.client_clock = Some(client_clock);

        Ok(Chunk::Audio(AudioChunk::from_samples(
            ClockReference::client(client),
            client_clock,
            samples,
        )))
    }

    fn rates(&self) -> &Rates {
        self.rates
            .as_ref()
            .expect("decoder pipeline used before setup")
    }
}
