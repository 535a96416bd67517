//! Server transport: one binary body per exchange, with a JSON metadata
//! side-channel in headers, mirroring the production server's HTTP contract.
//!
//! A `None` result signals network failure, which is distinct from a normal
//! response that happens to carry no audio yet.

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use brigade_codec::{ClockReference, CompressedAudioChunk, CODEC_SAMPLE_RATE, OPUS_FRAME_MS};

pub const AUDIO_METADATA_HEADER: &str = "X-Audio-Metadata";
pub const EVENT_DATA_HEADER: &str = "X-Event-Data";

/// One outbound batch: the packed compressed blob plus its clock position
/// and the metadata side-channel.
#[derive(Debug, Clone, Default)]
pub struct ServerRequest {
    /// Multi-packet blob; empty when the batch was a placeholder.
    pub data: Vec<u8>,
    /// Server-clock samples this batch covers.
    pub n_samples: i64,
    /// Server-clock end of the written interval.
    pub write_clock: Option<i64>,
    /// Server-clock end of the interval we want read back.
    pub read_clock: i64,
    /// Opaque mapping whose keys the server consumes (identity, events).
    pub metadata: Map<String, Value>,
    /// Ask the server to echo our own audio back unmixed.
    pub loopback: bool,
    /// Drop any per-user codec state the server still holds.
    pub reset_user_state: bool,
    /// Session epoch at dispatch; responses from older epochs are dropped.
    pub epoch: u64,
}

#[derive(Debug, Clone)]
pub struct ServerResponse {
    pub metadata: Map<String, Value>,
    /// Mixed audio for our read interval, when the server has any.
    pub chunk: Option<CompressedAudioChunk>,
    pub epoch: u64,
}

/// Result of probing an idle server.
#[derive(Debug, Clone, Copy)]
pub struct ServerInfo {
    pub server_clock: i64,
    pub server_sample_rate: u32,
}

#[async_trait]
pub trait ServerConnection: Send {
    /// Checks the server is reachable and reads its clock.
    async fn probe(&mut self) -> Option<ServerInfo>;

    /// Ships one batch and returns the server's reply, or `None` on network
    /// failure. Responses arrive in request order within one connection.
    async fn exchange(&mut self, request: ServerRequest) -> Option<ServerResponse>;
}

/// HTTP implementation: POST with query-string metadata, binary body, and
/// the JSON `X-Audio-Metadata` response header.
pub struct HttpServerConnection {
    client: reqwest::Client,
    url: String,
    frame_samples: i64,
}

impl HttpServerConnection {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            frame_samples: (OPUS_FRAME_MS * CODEC_SAMPLE_RATE as f64 / 1000.0) as i64,
        }
    }
}

#[async_trait]
impl ServerConnection for HttpServerConnection {
    async fn probe(&mut self) -> Option<ServerInfo> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .inspect_err(|err| warn!("server probe failed: {err}"))
            .ok()?;
        let metadata = parse_metadata(response.headers())?;
        Some(ServerInfo {
            server_clock: metadata.get("server_clock")?.as_i64()?,
            server_sample_rate: metadata.get("server_sample_rate")?.as_u64()? as u32,
        })
    }

    async fn exchange(&mut self, request: ServerRequest) -> Option<ServerResponse> {
        let mut query: Vec<(String, String)> = vec![
            ("n_samples".into(), request.n_samples.to_string()),
            ("read_clock".into(), request.read_clock.to_string()),
            ("epoch".into(), request.epoch.to_string()),
        ];
        if let Some(write_clock) = request.write_clock {
            query.push(("write_clock".into(), write_clock.to_string()));
        }
        if request.loopback {
            query.push(("loopback".into(), "true".into()));
        }
        if request.reset_user_state {
            query.push(("reset_user_state".into(), "true".into()));
        }

        let mut events = None;
        for (key, value) in &request.metadata {
            if key == "new_events" {
                events = Some(value.clone());
                continue;
            }
            query.push((key.clone(), query_value(value)));
        }

        let mut builder = self
            .client
            .post(&self.url)
            .query(&query)
            .body(request.data);
        if let Some(events) = events {
            builder = builder.header(EVENT_DATA_HEADER, events.to_string());
        }

        let response = builder
            .send()
            .await
            .inspect_err(|err| warn!("server exchange failed: {err}"))
            .ok()?;
        let metadata = parse_metadata(response.headers()).unwrap_or_default();

        // Error statuses still carry metadata (e.g. kill_client); hand that
        // up rather than treating it as a network failure.
        if !response.status().is_success() {
            debug!(status = %response.status(), "server returned an error status");
            return Some(ServerResponse {
                metadata,
                chunk: None,
                epoch: request.epoch,
            });
        }

        let body = response.bytes().await.ok()?;
        let chunk = response_chunk(request.read_clock, self.frame_samples, body.to_vec())?;
        Some(ServerResponse {
            metadata,
            chunk,
            epoch: request.epoch,
        })
    }
}

/// Rebuilds a response body as a server-referenced chunk ending at the read
/// clock. The packet count comes off the wire, so it is validated before it
/// can shape an interval: a claimed length reaching back past sample zero is
/// a corrupted or misbehaving response, and the whole exchange is dropped
/// (`None`) rather than trusted.
fn response_chunk(
    read_clock: i64,
    frame_samples: i64,
    body: Vec<u8>,
) -> Option<Option<CompressedAudioChunk>> {
    if body.is_empty() {
        return Some(None);
    }
    let length = body[0] as i64 * frame_samples;
    if length > read_clock {
        warn!(
            length,
            read_clock, "response claims more audio than the read clock allows"
        );
        return None;
    }
    Some(Some(CompressedAudioChunk::new(
        ClockReference::server(CODEC_SAMPLE_RATE),
        read_clock,
        length,
        body,
    )))
}

fn parse_metadata(headers: &HeaderMap) -> Option<Map<String, Value>> {
    let raw = headers.get(AUDIO_METADATA_HEADER)?.to_str().ok()?;
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Some(map),
        _ => {
            warn!("audio metadata header is not a JSON object");
            None
        }
    }
}

fn query_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
