//! Codec workers: isolated encode/decode executors addressed by
//! request-id-tagged messages.
//!
//! Each worker runs on its own thread and owns one codec instance; the
//! pipeline side holds a [`WorkerHandle`]. Requests are serialized per worker
//! by a FIFO queue; a response whose id is not the queue front is a protocol
//! violation and fatal. Every message carries the session epoch so responses
//! to requests issued before the latest reset are dropped instead of
//! resurrecting old clock state.

use std::collections::VecDeque;
use std::thread::JoinHandle;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::codec::{
    CodecParams, EncodedFrames, FrameDecoder, FrameEncoder, OpusFrameDecoder, OpusFrameEncoder,
};
use crate::error::CodecError;
use crate::util::spawn_thread;

const REQUEST_QUEUE: usize = 32;

pub type EncoderFactory =
    Box<dyn FnMut(&CodecParams) -> anyhow::Result<Box<dyn FrameEncoder>> + Send>;
pub type DecoderFactory =
    Box<dyn FnMut(&CodecParams) -> anyhow::Result<Box<dyn FrameDecoder>> + Send>;

pub fn opus_encoder_factory() -> EncoderFactory {
    Box::new(|params| Ok(Box::new(OpusFrameEncoder::new(params)?) as Box<dyn FrameEncoder>))
}

pub fn opus_decoder_factory() -> DecoderFactory {
    Box::new(|params| Ok(Box::new(OpusFrameDecoder::new(params)?) as Box<dyn FrameDecoder>))
}

#[derive(Debug)]
pub enum CodecRequest {
    Setup(CodecParams),
    Encode { samples: Vec<f32> },
    Decode { data: Vec<u8> },
    Reset,
}

#[derive(Debug)]
pub struct WorkerRequest {
    pub request_id: u32,
    pub epoch: u64,
    pub body: CodecRequest,
}

#[derive(Debug, PartialEq)]
pub enum CodecResponse {
    Setup { resampling: bool },
    Encode(EncodedFrames),
    Decode { samples: Vec<f32> },
    Reset,
}

#[derive(Debug)]
pub enum WorkerReply {
    Response {
        request_id: u32,
        epoch: u64,
        status: i32,
        body: CodecResponse,
    },
    Exception {
        epoch: u64,
        payload: String,
    },
}

/// The worker-thread side: one codec behind a request loop.
enum Engine {
    Encoder {
        factory: EncoderFactory,
        codec: Option<Box<dyn FrameEncoder>>,
    },
    Decoder {
        factory: DecoderFactory,
        codec: Option<Box<dyn FrameDecoder>>,
    },
}

impl Engine {
    fn handle(&mut self, body: CodecRequest) -> Result<(i32, CodecResponse), String> {
        match (body, &mut *self) {
            (CodecRequest::Setup(params), Engine::Encoder { factory, codec }) => {
                match factory(&params) {
                    Ok(built) => {
                        let resampling = built.resampling();
                        *codec = Some(built);
                        Ok((0, CodecResponse::Setup { resampling }))
                    }
                    Err(err) => {
                        warn!("encoder setup failed: {err:#}");
                        Ok((-1, CodecResponse::Setup { resampling: false }))
                    }
                }
            }
            (CodecRequest::Setup(params), Engine::Decoder { factory, codec }) => {
                match factory(&params) {
                    Ok(built) => {
                        let resampling = built.resampling();
                        *codec = Some(built);
                        Ok((0, CodecResponse::Setup { resampling }))
                    }
                    Err(err) => {
                        warn!("decoder setup failed: {err:#}");
                        Ok((-1, CodecResponse::Setup { resampling: false }))
                    }
                }
            }
            (CodecRequest::Encode { samples }, Engine::Encoder { codec, .. }) => {
                let codec = codec.as_mut().ok_or("codec not configured")?;
                let frames = codec.encode(&samples).map_err(|err| format!("{err:#}"))?;
                Ok((0, CodecResponse::Encode(frames)))
            }
            (CodecRequest::Decode { data }, Engine::Decoder { codec, .. }) => {
                let codec = codec.as_mut().ok_or("codec not configured")?;
                let samples = codec.decode(&data).map_err(|err| format!("{err:#}"))?;
                Ok((0, CodecResponse::Decode { samples }))
            }
            (CodecRequest::Reset, Engine::Encoder { codec, .. }) => {
                if let Some(codec) = codec.as_mut() {
                    codec.reset().map_err(|err| format!("{err:#}"))?;
                }
                Ok((0, CodecResponse::Reset))
            }
            (CodecRequest::Reset, Engine::Decoder { codec, .. }) => {
                if let Some(codec) = codec.as_mut() {
                    codec.reset().map_err(|err| format!("{err:#}"))?;
                }
                Ok((0, CodecResponse::Reset))
            }
            (other, _) => Err(format!("unsupported request for this worker: {other:?}")),
        }
    }

    fn run(mut self, mut rx: mpsc::Receiver<WorkerRequest>, tx: mpsc::Sender<WorkerReply>) {
        while let Some(request) = rx.blocking_recv() {
            let reply = match self.handle(request.body) {
                Ok((status, body)) => WorkerReply::Response {
                    request_id: request.request_id,
                    epoch: request.epoch,
                    status,
                    body,
                },
                Err(payload) => WorkerReply::Exception {
                    epoch: request.epoch,
                    payload,
                },
            };
            if tx.blocking_send(reply).is_err() {
                break;
            }
        }
        debug!("codec worker stopping: request channel closed");
    }
}

/// Owner-side handle to one codec worker.
pub struct WorkerHandle {
    req_tx: mpsc::Sender<WorkerRequest>,
    reply_rx: mpsc::Receiver<WorkerReply>,
    pending: VecDeque<u32>,
    next_request_id: u32,
    epoch: u64,
    _thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn spawn_encoder(factory: EncoderFactory) -> Self {
        Self::spawn(
            "codec-enc",
            Engine::Encoder {
                factory,
                codec: None,
            },
        )
    }

    pub fn spawn_decoder(factory: DecoderFactory) -> Self {
        Self::spawn(
            "codec-dec",
            Engine::Decoder {
                factory,
                codec: None,
            },
        )
    }

    fn spawn(name: &str, engine: Engine) -> Self {
        let (req_tx, req_rx) = mpsc::channel(REQUEST_QUEUE);
        let (reply_tx, reply_rx) = mpsc::channel(REQUEST_QUEUE);
        let thread = spawn_thread(name, move || engine.run(req_rx, reply_tx));
        Self {
            req_tx,
            reply_rx,
            pending: VecDeque::new(),
            next_request_id: 0,
            epoch: 0,
            _thread: Some(thread),
        }
    }

    /// Builds a handle over raw channels, with no worker thread behind it.
    #[cfg(test)]
    pub(crate) fn from_parts(
        req_tx: mpsc::Sender<WorkerRequest>,
        reply_rx: mpsc::Receiver<WorkerReply>,
    ) -> Self {
        Self {
            req_tx,
            reply_rx,
            pending: VecDeque::new(),
            next_request_id: 0,
            epoch: 0,
            _thread: None,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Sends the setup request. Must be the first request; a nonzero status
    /// is fatal. Returns whether the codec resamples.
    pub async fn setup(&mut self, params: CodecParams) -> Result<bool, CodecError> {
        match self.call(CodecRequest::Setup(params)).await {
            Ok(CodecResponse::Setup { resampling }) => Ok(resampling),
            Ok(other) => Err(CodecError::CodecException {
                payload: format!("unexpected setup response: {other:?}"),
            }),
            Err(CodecError::CodecRpcFailed { status }) => Err(CodecError::SetupFailed { status }),
            Err(err) => Err(err),
        }
    }

    /// Posts a request without awaiting its response; the id joins the FIFO.
    pub async fn submit(&mut self, body: CodecRequest) -> Result<u32, CodecError> {
        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        self.req_tx
            .send(WorkerRequest {
                request_id,
                epoch: self.epoch,
                body,
            })
            .await
            .map_err(|_| worker_terminated())?;
        self.pending.push_back(request_id);
        Ok(request_id)
    }

    /// Receives the response for `request_id`, which must be the front of the
    /// pending queue. Responses from before the current epoch are dropped.
    pub async fn response(&mut self, request_id: u32) -> Result<CodecResponse, CodecError> {
        loop {
            let reply = self.reply_rx.recv().await.ok_or_else(worker_terminated)?;
            match reply {
                WorkerReply::Exception { epoch, payload } => {
                    if epoch != self.epoch {
                        debug!(%payload, "dropping stale worker exception");
                        continue;
                    }
                    return Err(CodecError::CodecException { payload });
                }
                WorkerReply::Response {
                    request_id: got,
                    epoch,
                    status,
                    body,
                } => {
                    if epoch != self.epoch {
                        debug!(request_id = got, "dropping stale worker response");
                        continue;
                    }
                    let front = self.pending.front().copied();
                    if front != Some(got) {
                        return Err(CodecError::ResponseOutOfOrder {
                            expected: front.unwrap_or(request_id),
                            actual: got,
                        });
                    }
                    self.pending.pop_front();
                    debug_assert_eq!(got, request_id, "responses must be awaited in send order");
                    if status != 0 {
                        return Err(CodecError::CodecRpcFailed { status });
                    }
                    return Ok(body);
                }
            }
        }
    }

    pub async fn call(&mut self, body: CodecRequest) -> Result<CodecResponse, CodecError> {
        let request_id = self.submit(body).await?;
        self.response(request_id).await
    }

    /// Discards every in-flight request and clears the codec's internal
    /// buffering. Responses already on the wire are dropped by the epoch
    /// check.
    pub async fn reset(&mut self) -> Result<(), CodecError> {
        self.epoch += 1;
        self.pending.clear();
        match self.call(CodecRequest::Reset).await? {
            CodecResponse::Reset => Ok(()),
            other => Err(CodecError::CodecException {
                payload: format!("unexpected reset response: {other:?}"),
            }),
        }
    }
}

fn worker_terminated() -> CodecError {
    CodecError::CodecException {
        payload: "codec worker terminated".into(),
    }
}
