//! Streaming bridge from worker stdout to an HTTP response body.
//!
//! # Data Flow
//! ```text
//! WorkerOutput ──read──▶ PooledBuffer ──write──▶ ResponseSink ──frames──▶ axum Body
//!      ▲                                              │
//!      └──────────── kill + reap on any failure ◀─────┘ (closed / error)
//! ```
//!
//! # Design Decisions
//! - Headers go out before the first byte; a failure after that can only
//!   truncate the body, never change the status
//! - The read loop also watches the sink, so a silent worker is still
//!   killed when the client leaves
//! - Bytes are coalesced only while the worker keeps producing; once a read
//!   would block, whatever is pending goes to the client
//! - Memory per stream is bounded: one pooled buffer plus a pending frame
//!   and two queued frames, each capped by the flush threshold
//! - A failure after headers ends the body with an error through a separate
//!   slot, so a full data channel cannot swallow it

use std::future::Future;
use std::io;
use std::ops::{Deref, DerefMut};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue};
use axum::response::Response;
use bytes::{Bytes, BytesMut};
use futures_util::FutureExt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::observability::metrics;
use crate::worker::gate::GatePermit;
use crate::worker::media_tool::MediaKind;
use crate::worker::process::{WorkerError, WorkerOutput, WorkerProcess};

/// Frames buffered between the bridge task and the body.
const CHANNEL_FRAMES: usize = 2;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("stream failed after {bytes} bytes: {source}")]
    Stream {
        bytes: u64,
        #[source]
        source: io::Error,
    },

    #[error("worker failed after {bytes} bytes: {source}")]
    Exit {
        bytes: u64,
        #[source]
        source: WorkerError,
    },
}

/// How a stream ended without a server-side error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeOutcome {
    Completed { bytes: u64 },
    ClientGone { bytes: u64 },
    /// The request deadline fired and the worker was killed.
    Cancelled { bytes: u64 },
}

/// True for errors that mean the client went away rather than a server fault.
pub fn is_client_disconnect(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::Interrupted
    ) {
        return true;
    }
    let text = err.to_string().to_ascii_lowercase();
    ["broken pipe", "reset by peer", "canceled", "cancelled"]
        .iter()
        .any(|needle| text.contains(needle))
}

fn disconnected() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "client disconnected: broken pipe")
}

// ---------------------------------------------------------------------------
// Buffer pool
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct PoolInner {
    free: Mutex<Vec<Box<[u8]>>>,
    buffer_size: usize,
    max_idle: usize,
}

/// Reusable fixed-size read buffers shared by all streams.
#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new(buffer_size: usize, max_idle: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::new()),
                buffer_size,
                max_idle,
            }),
        }
    }

    pub fn get(&self) -> PooledBuffer {
        let reused = self
            .inner
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let buf = reused.unwrap_or_else(|| vec![0u8; self.inner.buffer_size].into_boxed_slice());
        PooledBuffer {
            buf: Some(buf),
            pool: self.inner.clone(),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    pub fn idle(&self) -> usize {
        self.inner
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// A buffer on loan from a [`BufferPool`]; returned on drop.
#[derive(Debug)]
pub struct PooledBuffer {
    buf: Option<Box<[u8]>>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or_default()
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            let mut free = self.pool.free.lock().unwrap_or_else(PoisonError::into_inner);
            if free.len() < self.pool.max_idle {
                free.push(buf);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Destination for streamed bytes.
pub trait ResponseSink: Send {
    fn write(&mut self, data: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

    fn flush(&mut self) -> impl Future<Output = io::Result<()>> + Send;

    /// Terminate the body with an error so the client sees a truncated transfer.
    fn abort(&mut self, error: io::Error) -> impl Future<Output = ()> + Send;

    /// Resolves once the receiving side is gone.
    fn closed(&self) -> impl Future<Output = ()> + Send;
}

/// Sink feeding an axum [`Body`] through a bounded channel.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<Bytes>,
    abort: AbortHandle,
    pending: BytesMut,
    frame_size: usize,
}

/// Ends a [`ChannelSink`]'s body with an error. Holds its own slot, so it
/// never waits on the data channel.
#[derive(Debug, Clone)]
struct AbortHandle {
    slot: Arc<Mutex<Option<oneshot::Sender<io::Error>>>>,
}

impl AbortHandle {
    /// Only the first call has an effect.
    fn abort(&self, error: io::Error) {
        let sender = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(error);
        }
    }
}

/// Create a connected sink and response body. Frames are at most `frame_size` bytes.
pub fn channel_body(frame_size: usize) -> (ChannelSink, Body) {
    let (tx, rx) = mpsc::channel::<Bytes>(CHANNEL_FRAMES);
    let (abort_tx, abort_rx) = oneshot::channel::<io::Error>();

    // Queued frames drain first. Once every sender is gone the body ends,
    // with the abort error if one was recorded.
    let stream = futures_util::stream::unfold(Some((rx, abort_rx)), |state| async move {
        let (mut rx, abort_rx) = state?;
        match rx.recv().await {
            Some(frame) => Some((Ok(frame), Some((rx, abort_rx)))),
            None => abort_rx.await.ok().map(|error| (Err(error), None)),
        }
    });

    let sink = ChannelSink {
        tx,
        abort: AbortHandle {
            slot: Arc::new(Mutex::new(Some(abort_tx))),
        },
        pending: BytesMut::new(),
        frame_size: frame_size.max(1),
    };
    (sink, Body::from_stream(stream))
}

impl ChannelSink {
    async fn send_pending(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let frame = self.pending.split().freeze();
        self.tx.send(frame).await.map_err(|_| disconnected())
    }

    /// Handle kept outside the bridge future, used to abort the body if
    /// that future panics.
    fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }
}

impl ResponseSink for ChannelSink {
    async fn write(&mut self, mut data: &[u8]) -> io::Result<()> {
        if self.tx.is_closed() {
            return Err(disconnected());
        }
        while !data.is_empty() {
            let room = self.frame_size - self.pending.len();
            let take = room.min(data.len());
            self.pending.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.pending.len() >= self.frame_size {
                self.send_pending().await?;
            }
        }
        Ok(())
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.send_pending().await
    }

    async fn abort(&mut self, error: io::Error) {
        self.pending.clear();
        self.abort.abort(error);
    }

    async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Most bytes coalesced before they are pushed to the client. A worker that
/// pauses has its pending bytes pushed straight away regardless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    pub threshold: usize,
}

impl FlushPolicy {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
        }
    }

    pub fn should_flush(&self, unflushed: usize) -> bool {
        unflushed >= self.threshold
    }
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self::new(5 * 1024 * 1024)
    }
}

/// Response headers for a download of `kind`.
pub fn download_headers(kind: MediaKind) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(kind.content_type()));
    let disposition = format!("attachment; filename=\"{}\"", kind.filename());
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    headers
}

// ---------------------------------------------------------------------------
// Pipe
// ---------------------------------------------------------------------------

/// Copy `output` into `sink` until EOF, then reap `process`.
///
/// Every path ends with the process reaped. Abnormal paths kill first.
pub async fn pipe<R, S>(
    mut output: R,
    sink: &mut S,
    process: &mut WorkerProcess,
    pool: &BufferPool,
    policy: FlushPolicy,
) -> Result<PipeOutcome, BridgeError>
where
    R: AsyncRead + Unpin + Send,
    S: ResponseSink,
{
    let mut buf = pool.get();
    let mut bytes: u64 = 0;
    let mut unflushed: usize = 0;

    loop {
        // Take what is ready without waiting; flush before blocking.
        let ready = output.read(&mut buf[..]).now_or_never();
        let read = match ready {
            Some(read) => read,
            None => {
                if unflushed > 0 {
                    if let Err(e) = sink.flush().await {
                        return abandon(process, e, bytes).await;
                    }
                    unflushed = 0;
                }
                tokio::select! {
                    read = output.read(&mut buf[..]) => read,
                    _ = sink.closed() => Err(disconnected()),
                }
            }
        };

        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => return abandon(process, e, bytes).await,
        };

        if let Err(e) = sink.write(&buf[..n]).await {
            return abandon(process, e, bytes).await;
        }
        bytes += n as u64;
        unflushed += n;

        if policy.should_flush(unflushed) {
            if let Err(e) = sink.flush().await {
                return abandon(process, e, bytes).await;
            }
            unflushed = 0;
        }
    }

    if let Err(e) = sink.flush().await {
        return abandon(process, e, bytes).await;
    }

    let status = process
        .wait()
        .await
        .map_err(|source| BridgeError::Exit { bytes, source })?;
    if !status.success() && process.is_cancelled() {
        return Ok(PipeOutcome::Cancelled { bytes });
    }
    process
        .check_status(status)
        .map_err(|source| BridgeError::Exit { bytes, source })?;

    Ok(PipeOutcome::Completed { bytes })
}

async fn abandon(
    process: &mut WorkerProcess,
    err: io::Error,
    bytes: u64,
) -> Result<PipeOutcome, BridgeError> {
    if let Err(e) = process.finish().await {
        tracing::warn!(pid = ?process.pid(), error = %e, "Failed to reap worker");
    }

    if process.is_cancelled() {
        Ok(PipeOutcome::Cancelled { bytes })
    } else if is_client_disconnect(&err) {
        Ok(PipeOutcome::ClientGone { bytes })
    } else {
        Err(BridgeError::Stream { bytes, source: err })
    }
}

/// Everything a streaming download owns for its lifetime.
#[derive(Debug)]
pub struct StreamJob {
    pub output: WorkerOutput,
    pub process: WorkerProcess,
    pub permit: GatePermit,
    pub kind: MediaKind,
    /// Cancelled at the request deadline; cancelled again by the task on exit.
    pub cancel: CancellationToken,
}

/// Spawn the bridge task for `job` and return the streaming response.
///
/// The gate permit moves into the task and is released when it ends.
pub fn stream_response(job: StreamJob, pool: BufferPool, policy: FlushPolicy) -> Response {
    let (mut sink, body) = channel_body(policy.threshold.max(pool.buffer_size()));
    let abort = sink.abort_handle();
    let kind = job.kind;

    let task = async move {
        let StreamJob {
            output,
            mut process,
            permit,
            cancel,
            ..
        } = job;
        let _permit = permit;
        let _stop_timer = cancel.drop_guard();

        let started = Instant::now();
        let result = pipe(output, &mut sink, &mut process, &pool, policy).await;
        let pid = process.pid();
        let stream_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(PipeOutcome::Completed { bytes }) => {
                tracing::info!(pid = ?pid, bytes, stream_ms, "Download completed");
                metrics::record_download("completed", bytes);
            }
            Ok(PipeOutcome::ClientGone { bytes }) => {
                tracing::info!(
                    pid = ?pid,
                    bytes,
                    stream_ms,
                    "Client disconnected during download"
                );
                metrics::record_download("client_gone", bytes);
            }
            Ok(PipeOutcome::Cancelled { bytes }) => {
                tracing::info!(
                    pid = ?pid,
                    bytes,
                    stream_ms,
                    "Download stopped at request deadline"
                );
                metrics::record_download("cancelled", bytes);
                sink.abort(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "request deadline reached",
                ))
                .await;
            }
            Err(e) => {
                tracing::error!(pid = ?pid, error = %e, stream_ms, "Download stream failed");
                let bytes = match &e {
                    BridgeError::Stream { bytes, .. } | BridgeError::Exit { bytes, .. } => *bytes,
                };
                metrics::record_download("failed", bytes);
                sink.abort(io::Error::other(e.to_string())).await;
            }
        }
    };

    tokio::spawn(async move {
        if let Err(panic) = AssertUnwindSafe(task).catch_unwind().await {
            tracing::error!(
                "Recovered from panic in download stream: {}",
                panic_message(panic.as_ref())
            );
            abort.abort(io::Error::other("download stream panicked"));
        }
    });

    let mut response = Response::new(body);
    *response.headers_mut() = download_headers(kind);
    response
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
