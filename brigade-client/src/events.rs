/// Observable events emitted by the singer client and the calibrators.
///
/// Delivered over an `mpsc` channel handed out at construction; dropping the
/// receiver silences the stream without affecting the session.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    ConnectivityChange {
        has_connectivity: bool,
    },
    VolumeChange {
        volume: f32,
        /// Perceptual 0..1 mapping of the raw RMS volume.
        human_readable: f32,
    },
    VolumeCalibrated {
        input_gain: f32,
    },
    /// One latency-estimation round trip.
    Beep {
        samples: u32,
        done: bool,
        est_latency: Option<f32>,
        est_25_to_75: Option<f32>,
        jank: Option<f32>,
        success: Option<bool>,
    },
    MicInputChange {
        has_mic_input: bool,
    },
    /// Terminal event: the session hit a fatal error and stopped.
    Fatal {
        kind: String,
    },
}
