//! Audio-interval value types shared by both pipelines.
//!
//! Every chunk carries a [`ClockInterval`] locating it on exactly one of the
//! two sample clocks (the local hardware clock or the codec/server clock).
//! Chunks are immutable once constructed; the algebra below is the only way
//! to combine them.

use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// A sample rate tagged with the clock domain it measures.
///
/// Two references are equal only when both the domain and the rate agree,
/// which is what stops samples measured in different time bases from being
/// mixed silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "domain", rename_all = "snake_case")]
pub enum ClockReference {
    /// The local audio hardware clock.
    Client { sample_rate: u32 },
    /// The codec/server canonical clock.
    Server { sample_rate: u32 },
}

impl ClockReference {
    pub fn client(sample_rate: u32) -> Self {
        Self::Client { sample_rate }
    }

    pub fn server(sample_rate: u32) -> Self {
        Self::Server { sample_rate }
    }

    pub fn sample_rate(&self) -> u32 {
        match self {
            Self::Client { sample_rate } | Self::Server { sample_rate } => *sample_rate,
        }
    }
}

impl std::fmt::Display for ClockReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Client { sample_rate } => write!(f, "client@{sample_rate}"),
            Self::Server { sample_rate } => write!(f, "server@{sample_rate}"),
        }
    }
}

/// A half-open interval of samples on one clock, anchored at its `end`.
///
/// `start` is implied as `end - length`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockInterval {
    pub reference: ClockReference,
    pub end: i64,
    pub length: i64,
}

impl ClockInterval {
    /// Panics when `length < 0` or `end < length`; intervals with those shapes
    /// are construction bugs, not runtime conditions.
    pub fn new(reference: ClockReference, end: i64, length: i64) -> Self {
        assert!(length >= 0, "interval length must be non-negative");
        assert!(end >= length, "interval may not start before sample zero");
        Self {
            reference,
            end,
            length,
        }
    }

    pub fn start(&self) -> i64 {
        self.end - self.length
    }

    pub fn check_reference(&self, expected: &ClockReference) -> Result<(), CodecError> {
        if self.reference != *expected {
            return Err(CodecError::ClockReferenceMismatch {
                expected: *expected,
                actual: self.reference,
            });
        }
        Ok(())
    }
}

/// Uncompressed mono PCM over a client-referenced interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioChunk {
    pub interval: ClockInterval,
    pub data: Vec<f32>,
}

impl AudioChunk {
    pub fn new(interval: ClockInterval, data: Vec<f32>) -> Self {
        assert_eq!(
            data.len() as i64,
            interval.length,
            "sample count must match the interval length"
        );
        Self { interval, data }
    }

    /// Builds the interval from the sample count, anchored at `end`.
    pub fn from_samples(reference: ClockReference, end: i64, data: Vec<f32>) -> Self {
        let interval = ClockInterval::new(reference, end, data.len() as i64);
        Self { interval, data }
    }
}

/// Opaque packed Opus packets over a server-referenced interval.
///
/// `data` is a multi-packet blob in the wire layout of [`crate::frame`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressedAudioChunk {
    pub interval: ClockInterval,
    pub data: Vec<u8>,
}

impl CompressedAudioChunk {
    pub fn new(reference: ClockReference, end: i64, length: i64, data: Vec<u8>) -> Self {
        Self {
            interval: ClockInterval::new(reference, end, length),
            data,
        }
    }
}

/// A sampleless chunk standing in for a time interval with no audio content
/// (muted, or not yet started). May be tagged with either reference.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlaceholderChunk {
    pub interval: ClockInterval,
}

impl PlaceholderChunk {
    pub fn new(reference: ClockReference, end: i64, length: i64) -> Self {
        Self {
            interval: ClockInterval::new(reference, end, length),
        }
    }
}

/// The tagged wire form of a chunk. Inbound objects are reconstituted into
/// the right variant from the `type` tag; downstream code matches on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Chunk {
    Audio(AudioChunk),
    Compressed(CompressedAudioChunk),
    Placeholder(PlaceholderChunk),
}

impl Chunk {
    pub fn interval(&self) -> &ClockInterval {
        match self {
            Chunk::Audio(c) => &c.interval,
            Chunk::Compressed(c) => &c.interval,
            Chunk::Placeholder(c) => &c.interval,
        }
    }

    pub fn reference(&self) -> ClockReference {
        self.interval().reference
    }

    pub fn start(&self) -> i64 {
        self.interval().start()
    }

    pub fn end(&self) -> i64 {
        self.interval().end
    }

    pub fn length(&self) -> i64 {
        self.interval().length
    }
}

impl From<AudioChunk> for Chunk {
    fn from(chunk: AudioChunk) -> Self {
        Chunk::Audio(chunk)
    }
}

impl From<CompressedAudioChunk> for Chunk {
    fn from(chunk: CompressedAudioChunk) -> Self {
        Chunk::Compressed(chunk)
    }
}

impl From<PlaceholderChunk> for Chunk {
    fn from(chunk: PlaceholderChunk) -> Self {
        Chunk::Placeholder(chunk)
    }
}

/// Concatenates a run of chunks into one chunk of the same variant.
///
/// All chunks must share one variant and one clock reference, and each pair
/// of neighbours must meet exactly at `end == start`. Placeholder lengths
/// sum; audio sample buffers concatenate. Anything else is `NonContiguous`.
pub fn concat_chunks(chunks: Vec<Chunk>) -> Result<Chunk, CodecError> {
    let mut iter = chunks.into_iter();
    let first = iter.next().ok_or(CodecError::NonContiguous)?;
    let reference = first.reference();

    match first {
        Chunk::Audio(head) => {
            let mut end = head.interval.end;
            let mut data = head.data;
            for chunk in iter {
                let Chunk::Audio(next) = chunk else {
                    return Err(CodecError::NonContiguous);
                };
                next.interval.check_reference(&reference)?;
                if next.interval.start() != end {
                    return Err(CodecError::NonContiguous);
                }
                end = next.interval.end;
                data.extend_from_slice(&next.data);
            }
            Ok(Chunk::Audio(AudioChunk::from_samples(reference, end, data)))
        }
        Chunk::Placeholder(head) => {
            let mut end = head.interval.end;
            let mut length = head.interval.length;
            for chunk in iter {
                let Chunk::Placeholder(next) = chunk else {
                    return Err(CodecError::NonContiguous);
                };
                next.interval.check_reference(&reference)?;
                if next.interval.start() != end {
                    return Err(CodecError::NonContiguous);
                }
                end = next.interval.end;
                length += next.interval.length;
            }
            Ok(Chunk::Placeholder(PlaceholderChunk::new(
                reference, end, length,
            )))
        }
        // Compressed chunks cross the wire one batch at a time and are never
        // merged client-side.
        Chunk::Compressed(_) => Err(CodecError::NonContiguous),
    }
}
