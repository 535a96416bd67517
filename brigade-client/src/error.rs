use brigade_codec::CodecError;

/// Session-level errors. Everything except `ConnectivityLost` is fatal: the
/// session stops the audio graph and surfaces a terminal event carrying the
/// error kind. Connectivity loss is observable and the session remains
/// addressable for teardown.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The player node's playback buffer emptied.
    #[error("playback buffer underflow")]
    PlayerUnderflow,

    /// An exception escaped the player node.
    #[error("player node exception: {payload}")]
    PlayerException { payload: String },

    /// The player node sent a message the current consumer has no business
    /// receiving.
    #[error("unknown player message: {kind}")]
    UnknownMessage { kind: String },

    /// A server exchange came back empty (network failure, as distinct from
    /// an empty-chunk response).
    #[error("server connectivity lost")]
    ConnectivityLost,

    /// The server told us to go away.
    #[error("killed by server: {message}")]
    KilledByServer { message: String },
}
