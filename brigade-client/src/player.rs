//! Message protocol to and from the player node (the audio-thread
//! producer/consumer at the hardware boundary), plus the session-side
//! dispatcher that routes inbound events to registered consumers.
//!
//! The player node itself lives in another execution context; this module
//! only defines the channel endpoints. [`PlayerPort`] is the counterparty's
//! half, which tests drive directly.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use strum::EnumDiscriminants;
use tokio::sync::mpsc;

use brigade_codec::Chunk;

use crate::error::ClientError;

const CHANNEL_CAPACITY: usize = 64;

/// Where, if anywhere, audio is looped straight back to the speaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopbackMode {
    #[default]
    None,
    /// The worklet echoes mic input locally.
    Main,
    /// The server echoes our compressed stream back unmixed.
    Server,
}

/// Context → worklet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlayerMessage {
    Stop,
    AudioParams {
        synthetic_source: bool,
        click_interval: f32,
        loopback_mode: LoopbackMode,
        epoch: u64,
    },
    SamplesIn {
        chunk: Chunk,
    },
    LatencyEstimationMode {
        enabled: bool,
    },
    VolumeEstimationMode {
        enabled: bool,
    },
    IgnoreInput {
        enabled: bool,
    },
    ClickVolumeChange {
        value: f32,
    },
    LocalLatency {
        local_latency: i32,
    },
    RequestCurClock,
    SetAlarm {
        time: i64,
    },
}

/// Worklet → context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, EnumDiscriminants)]
#[strum_discriminants(name(PlayerEventKind), derive(Hash, strum::Display))]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlayerEvent {
    SamplesOut {
        chunk: Chunk,
    },
    Underflow,
    NoMicInput,
    CurrentVolume {
        volume: f32,
    },
    InputGain {
        input_gain: f32,
    },
    LatencyEstimate {
        samples: u32,
        p25: Option<f32>,
        p50: Option<f32>,
        p75: Option<f32>,
        jank: Option<f32>,
    },
    CurClock {
        clock: i64,
    },
    Alarm {
        time: i64,
    },
    Exception {
        exception: String,
    },
}

/// Context-side sender. Only the session context holds one.
#[derive(Debug, Clone)]
pub struct PlayerHandle {
    tx: mpsc::Sender<PlayerMessage>,
}

impl PlayerHandle {
    pub async fn send(&self, message: PlayerMessage) -> Result<(), ClientError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| ClientError::PlayerException {
                payload: "player node closed".into(),
            })
    }
}

/// The worklet-side endpoints: receives configuration messages and emits
/// events back toward the session.
pub struct PlayerPort {
    messages: mpsc::Receiver<PlayerMessage>,
    events: mpsc::Sender<PlayerEvent>,
}

impl PlayerPort {
    pub async fn recv(&mut self) -> Option<PlayerMessage> {
        self.messages.recv().await
    }

    pub fn try_recv(&mut self) -> Option<PlayerMessage> {
        self.messages.try_recv().ok()
    }

    /// Returns false once the session side is gone.
    pub async fn emit(&self, event: PlayerEvent) -> bool {
        self.events.send(event).await.is_ok()
    }
}

pub(crate) fn channel() -> (PlayerHandle, mpsc::Receiver<PlayerEvent>, PlayerPort) {
    let (msg_tx, msg_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
    (
        PlayerHandle { tx: msg_tx },
        event_rx,
        PlayerPort {
            messages: msg_rx,
            events: event_tx,
        },
    )
}

struct Subscriber {
    /// `None` subscribes to every kind.
    kinds: Option<Vec<PlayerEventKind>>,
    tx: mpsc::Sender<PlayerEvent>,
}

/// Routes player events by kind to registered consumers, so singing and
/// calibration modes compose without rebinding a global handler.
#[derive(Clone, Default)]
pub(crate) struct Dispatcher {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl Dispatcher {
    pub fn subscribe(&self, kinds: &[PlayerEventKind]) -> mpsc::Receiver<PlayerEvent> {
        self.add(Some(kinds.to_vec()))
    }

    pub fn subscribe_all(&self) -> mpsc::Receiver<PlayerEvent> {
        self.add(None)
    }

    fn add(&self, kinds: Option<Vec<PlayerEventKind>>) -> mpsc::Receiver<PlayerEvent> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.subscribers
            .lock()
            .unwrap()
            .push(Subscriber { kinds, tx });
        rx
    }

    pub async fn run(self, mut events: mpsc::Receiver<PlayerEvent>) {
        while let Some(event) = events.recv().await {
            self.dispatch(event).await;
        }
    }

    async fn dispatch(&self, event: PlayerEvent) {
        let kind = PlayerEventKind::from(&event);
        let targets: Vec<mpsc::Sender<PlayerEvent>> = {
            let subscribers = self.subscribers.lock().unwrap();
            subscribers
                .iter()
                .filter(|s| s.kinds.as_ref().is_none_or(|k| k.contains(&kind)))
                .map(|s| s.tx.clone())
                .collect()
        };
        let mut any_closed = false;
        for tx in targets {
            if tx.send(event.clone()).await.is_err() {
                any_closed = true;
            }
        }
        if any_closed {
            self.subscribers
                .lock()
                .unwrap()
                .retain(|s| !s.tx.is_closed());
        }
    }
}
