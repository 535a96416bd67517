pub mod chunk;
pub mod codec;
pub mod decode;
pub mod encode;
pub mod error;
pub mod frame;
pub mod worker;

mod util;

pub use chunk::{
    concat_chunks, AudioChunk, Chunk, ClockInterval, ClockReference, CompressedAudioChunk,
    PlaceholderChunk,
};
pub use codec::{CodecParams, EncodedFrames, FrameDecoder, FrameEncoder};
pub use decode::DecoderPipeline;
pub use encode::EncoderPipeline;
pub use error::CodecError;

/// Canonical codec/server sample rate on the wire.
pub const CODEC_SAMPLE_RATE: u32 = 48_000;

/// Duration of one Opus frame, the atomic unit of compressed audio.
pub const OPUS_FRAME_MS: f64 = 60.0;

/// Frame durations libopus accepts, in milliseconds.
pub const PERMITTED_FRAME_MS: [f64; 6] = [2.5, 5.0, 10.0, 20.0, 40.0, 60.0];

/// Clock disagreement (in samples) above which the encoder's drift probe warns.
pub const DRIFT_THRESHOLD_SAMPLES: f64 = 5.0;

/// Algorithmic latency added by the Opus codec, in milliseconds.
pub const OPUS_LATENCY_MS: f32 = 6.5;

/// Latency added by one direction of resampling, in milliseconds.
pub const RESAMPLE_LATENCY_MS: f32 = 1.8;
