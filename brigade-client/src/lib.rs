pub mod calibrate;
pub mod context;
pub mod error;
pub mod events;
pub mod player;
pub mod server;
pub mod singer;

mod util;

pub use calibrate::{LatencyCalibrator, VolumeCalibrator};
pub use context::{SessionConfig, SessionContext};
pub use error::ClientError;
pub use events::ClientEvent;
pub use player::{LoopbackMode, PlayerEvent, PlayerEventKind, PlayerMessage, PlayerPort};
pub use server::{HttpServerConnection, ServerConnection, ServerInfo, ServerRequest, ServerResponse};
pub use singer::{SingerClient, SingerState};
