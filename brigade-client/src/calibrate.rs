//! Calibration clients: alternate consumers of the player-node event stream.
//!
//! Both register with the session dispatcher for the kinds they handle and
//! toggle their estimation mode on the player through the context, so they
//! compose with the singer client instead of hijacking a global handler.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::context::SessionContext;
use crate::error::ClientError;
use crate::events::ClientEvent;
use crate::player::{PlayerEvent, PlayerEventKind};

/// Latency estimates required before calibration completes.
pub const CALIBRATION_MIN_SAMPLES: u32 = 7;

/// Calibration succeeds when the inter-quartile spread of the estimates is
/// within this window, in milliseconds.
pub const CALIBRATION_WINDOW_MS: f32 = 2.0;

/// ln(1000): normalizes ln(volume * 1000) into 0..1 over a 60 dB range.
const VOLUME_RANGE_LOG: f32 = 6.908;

const EVENT_CAPACITY: usize = 16;

/// Reads back the worklet's RMS volume estimates until it settles on an
/// input gain.
pub struct VolumeCalibrator {
    events: mpsc::Receiver<PlayerEvent>,
    out: mpsc::Sender<ClientEvent>,
    has_mic_input: bool,
    shutdown: CancellationToken,
}

impl VolumeCalibrator {
    pub fn new(ctx: &SessionContext) -> (Self, mpsc::Receiver<ClientEvent>) {
        let events = ctx.subscribe(&[
            PlayerEventKind::CurrentVolume,
            PlayerEventKind::InputGain,
            PlayerEventKind::NoMicInput,
        ]);
        let (out, out_rx) = mpsc::channel(EVENT_CAPACITY);
        (
            Self {
                events,
                out,
                has_mic_input: true,
                shutdown: CancellationToken::new(),
            },
            out_rx,
        )
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs until the worklet reports the calibrated input gain, which is
    /// also returned. `None` when cancelled before completion.
    pub async fn run(mut self, ctx: &SessionContext) -> Result<Option<f32>, ClientError> {
        ctx.set_volume_estimation_mode(true).await?;
        info!("volume calibration started");
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => None,
                event = self.events.recv() => event,
            };
            let Some(event) = event else {
                ctx.set_volume_estimation_mode(false).await?;
                return Ok(None);
            };
            match event {
                PlayerEvent::CurrentVolume { volume } => {
                    let _ = self
                        .out
                        .send(ClientEvent::VolumeChange {
                            volume,
                            human_readable: (volume * 1000.0).ln() / VOLUME_RANGE_LOG,
                        })
                        .await;
                }
                PlayerEvent::InputGain { input_gain } => {
                    ctx.set_volume_estimation_mode(false).await?;
                    info!(input_gain, "volume calibrated");
                    let _ = self
                        .out
                        .send(ClientEvent::VolumeCalibrated { input_gain })
                        .await;
                    return Ok(Some(input_gain));
                }
                PlayerEvent::NoMicInput => {
                    self.has_mic_input = !self.has_mic_input;
                    let _ = self
                        .out
                        .send(ClientEvent::MicInputChange {
                            has_mic_input: self.has_mic_input,
                        })
                        .await;
                }
                other => debug!(kind = %PlayerEventKind::from(&other), "ignoring event"),
            }
        }
    }
}

/// Plays clicks through the speaker and reads back echo-latency estimates
/// until enough samples agree.
pub struct LatencyCalibrator {
    events: mpsc::Receiver<PlayerEvent>,
    out: mpsc::Sender<ClientEvent>,
    has_mic_input: bool,
    click_volume: Option<f32>,
    shutdown: CancellationToken,
}

impl LatencyCalibrator {
    pub fn new(ctx: &SessionContext) -> (Self, mpsc::Receiver<ClientEvent>) {
        let events = ctx.subscribe(&[
            PlayerEventKind::LatencyEstimate,
            PlayerEventKind::NoMicInput,
        ]);
        let (out, out_rx) = mpsc::channel(EVENT_CAPACITY);
        (
            Self {
                events,
                out,
                has_mic_input: true,
                click_volume: None,
                shutdown: CancellationToken::new(),
            },
            out_rx,
        )
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Sets the click volume posted to the player when the run starts.
    pub fn set_click_volume(&mut self, value: f32) {
        self.click_volume = Some(value);
    }

    /// Runs one calibration. On success the measured latency is pushed to
    /// the player and returned; an unstable measurement returns `None`.
    pub async fn run(mut self, ctx: &SessionContext) -> Result<Option<f32>, ClientError> {
        ctx.set_latency_estimation_mode(true).await?;
        if let Some(value) = self.click_volume {
            ctx.set_click_volume(value).await?;
        }
        info!("latency calibration started");
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => None,
                event = self.events.recv() => event,
            };
            let Some(event) = event else {
                ctx.set_latency_estimation_mode(false).await?;
                return Ok(None);
            };
            match event {
                PlayerEvent::LatencyEstimate {
                    samples,
                    p25,
                    p50,
                    p75,
                    jank,
                } => {
                    let done = samples >= CALIBRATION_MIN_SAMPLES;
                    let est_25_to_75 = p25.zip(p75).map(|(lo, hi)| hi - lo);
                    let success = est_25_to_75.map(|spread| spread <= CALIBRATION_WINDOW_MS);
                    let _ = self
                        .out
                        .send(ClientEvent::Beep {
                            samples,
                            done,
                            est_latency: p50,
                            est_25_to_75,
                            jank,
                            success,
                        })
                        .await;
                    if !done {
                        continue;
                    }
                    ctx.set_latency_estimation_mode(false).await?;
                    if success == Some(true) {
                        if let Some(latency) = p50 {
                            info!(latency, "latency calibrated");
                            ctx.send_local_latency(latency).await?;
                            return Ok(Some(latency));
                        }
                    }
                    info!("latency calibration did not converge");
                    return Ok(None);
                }
                PlayerEvent::NoMicInput => {
                    self.has_mic_input = !self.has_mic_input;
                    let _ = self
                        .out
                        .send(ClientEvent::MicInputChange {
                            has_mic_input: self.has_mic_input,
                        })
                        .await;
                }
                other => debug!(kind = %PlayerEventKind::from(&other), "ignoring event"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::mock_context;
    use crate::context::SessionConfig;
    use crate::player::PlayerMessage;

    fn estimate(samples: u32, p25: f32, p50: f32, p75: f32) -> PlayerEvent {
        PlayerEvent::LatencyEstimate {
            samples,
            p25: Some(p25),
            p50: Some(p50),
            p75: Some(p75),
            jank: None,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<ClientEvent>) -> Vec<ClientEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn volume_calibration_reports_then_finishes() {
        let (ctx, mut port) = mock_context(SessionConfig::default());
        let (calibrator, mut events) = VolumeCalibrator::new(&ctx);

        let (result, ()) = tokio::join!(calibrator.run(&ctx), async {
            assert!(port.emit(PlayerEvent::CurrentVolume { volume: 0.1 }).await);
            assert!(port.emit(PlayerEvent::NoMicInput).await);
            assert!(port.emit(PlayerEvent::NoMicInput).await);
            assert!(
                port.emit(PlayerEvent::InputGain { input_gain: 1.5 })
                    .await
            );
            assert_eq!(
                port.recv().await,
                Some(PlayerMessage::VolumeEstimationMode { enabled: true })
            );
            assert_eq!(
                port.recv().await,
                Some(PlayerMessage::VolumeEstimationMode { enabled: false })
            );
        });
        assert_eq!(result.unwrap(), Some(1.5));

        let seen = drain(&mut events);
        let ClientEvent::VolumeChange {
            volume,
            human_readable,
        } = &seen[0]
        else {
            panic!("expected volume change, got {:?}", seen[0]);
        };
        assert_eq!(*volume, 0.1);
        // ln(0.1 * 1000) / ln(1000)
        assert!((human_readable - 0.6667).abs() < 1e-3);
        assert_eq!(
            seen[1],
            ClientEvent::MicInputChange {
                has_mic_input: false
            }
        );
        assert_eq!(
            seen[2],
            ClientEvent::MicInputChange {
                has_mic_input: true
            }
        );
        assert_eq!(seen[3], ClientEvent::VolumeCalibrated { input_gain: 1.5 });
    }

    #[tokio::test]
    async fn latency_calibration_completes_after_enough_samples() {
        let (ctx, mut port) = mock_context(SessionConfig::default());
        let (calibrator, mut events) = LatencyCalibrator::new(&ctx);

        let (result, ()) = tokio::join!(calibrator.run(&ctx), async {
            for samples in 1..=CALIBRATION_MIN_SAMPLES {
                assert!(port.emit(estimate(samples, 94.5, 95.0, 95.5)).await);
            }
            assert_eq!(
                port.recv().await,
                Some(PlayerMessage::LatencyEstimationMode { enabled: true })
            );
            assert_eq!(
                port.recv().await,
                Some(PlayerMessage::LatencyEstimationMode { enabled: false })
            );
            // Measured latency plus the codec path's own latency.
            assert_eq!(
                port.recv().await,
                Some(PlayerMessage::LocalLatency { local_latency: 102 })
            );
        });
        assert_eq!(result.unwrap(), Some(95.0));

        let seen = drain(&mut events);
        let done_beeps: Vec<_> = seen
            .iter()
            .filter(|event| matches!(event, ClientEvent::Beep { done: true, .. }))
            .collect();
        // The done beep fires exactly once, on the seventh sample.
        assert_eq!(seen.len(), CALIBRATION_MIN_SAMPLES as usize);
        assert_eq!(done_beeps.len(), 1);
        assert!(matches!(
            seen.last().unwrap(),
            ClientEvent::Beep {
                samples: 7,
                done: true,
                success: Some(true),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn unstable_latency_measurement_does_not_push_latency() {
        let (ctx, mut port) = mock_context(SessionConfig::default());
        let (calibrator, mut events) = LatencyCalibrator::new(&ctx);

        let (result, ()) = tokio::join!(calibrator.run(&ctx), async {
            for samples in 1..=CALIBRATION_MIN_SAMPLES {
                // Spread of 5 ms: outside the success window.
                assert!(port.emit(estimate(samples, 90.0, 95.0, 95.0)).await);
            }
            assert_eq!(
                port.recv().await,
                Some(PlayerMessage::LatencyEstimationMode { enabled: true })
            );
            assert_eq!(
                port.recv().await,
                Some(PlayerMessage::LatencyEstimationMode { enabled: false })
            );
            // No local latency follows an unsuccessful calibration.
            assert!(port.try_recv().is_none());
        });
        assert_eq!(result.unwrap(), None);

        assert!(matches!(
            drain(&mut events).last().unwrap(),
            ClientEvent::Beep {
                done: true,
                success: Some(false),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn missing_percentiles_leave_success_unknown() {
        let (ctx, mut port) = mock_context(SessionConfig::default());
        let (mut calibrator, mut events) = LatencyCalibrator::new(&ctx);
        calibrator.set_click_volume(0.25);

        let (result, ()) = tokio::join!(calibrator.run(&ctx), async {
            assert_eq!(
                port.recv().await,
                Some(PlayerMessage::LatencyEstimationMode { enabled: true })
            );
            assert_eq!(
                port.recv().await,
                Some(PlayerMessage::ClickVolumeChange { value: 0.25 })
            );
            assert!(
                port.emit(PlayerEvent::LatencyEstimate {
                    samples: CALIBRATION_MIN_SAMPLES,
                    p25: None,
                    p50: None,
                    p75: None,
                    jank: None,
                })
                .await
            );
        });
        assert_eq!(result.unwrap(), None);

        assert!(matches!(
            drain(&mut events).last().unwrap(),
            ClientEvent::Beep {
                done: true,
                success: None,
                ..
            }
        ));
    }
}
