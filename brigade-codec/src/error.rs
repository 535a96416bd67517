use crate::chunk::ClockReference;

/// Errors produced by the chunk algebra, the codec workers and the two
/// pipelines. Everything here is fatal to the session that hits it.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// A chunk measured in one clock domain was fed to a consumer of the other.
    #[error("clock reference mismatch: expected {expected}, got {actual}")]
    ClockReferenceMismatch {
        expected: ClockReference,
        actual: ClockReference,
    },

    /// Consecutive chunks do not meet at `end == start`, or a concat was
    /// attempted over an empty or mixed-variant sequence.
    #[error("chunks are not contiguous")]
    NonContiguous,

    /// A placeholder chunk arrived after the pipeline clocks started. Once
    /// singing has begun, silence must arrive as zero-sample audio chunks.
    #[error("placeholder chunk arrived after the clock started")]
    ClockStartedPlaceholder,

    /// A codec worker answered out of request-send order.
    #[error("codec worker response out of order: expected request {expected}, got {actual}")]
    ResponseOutOfOrder { expected: u32, actual: u32 },

    /// A codec worker reported a nonzero status.
    #[error("codec rpc failed with status {status}")]
    CodecRpcFailed { status: i32 },

    /// An exception escaped a codec worker. The payload is passed through
    /// without interpretation.
    #[error("codec worker exception: {payload}")]
    CodecException { payload: String },

    /// A multi-packet blob did not parse: a length header or payload ran past
    /// the end of the buffer.
    #[error("malformed multi-packet frame at byte {offset}")]
    MalformedFrame { offset: usize },

    /// Decoded PCM length disagreed with the chunk interval beyond the drift
    /// threshold (strict mode only).
    #[error("decoded length {actual} does not match expected {expected}")]
    DecodeLengthMismatch { expected: i64, actual: i64 },

    /// Worker setup returned a nonzero status.
    #[error("codec worker setup failed with status {status}")]
    SetupFailed { status: i32 },
}
