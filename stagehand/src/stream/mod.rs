//! Unit stdio streaming.
//!
//! A unit's stdio travels over one bidirectional [`Transport`]: raw bytes in,
//! framed stdout/stderr out. [`multiplex`] drives both directions for the
//! lifetime of a unit:
//!
//! ```text
//!   input source ──► [input worker] ──► transport.input ──► (unit stdin)
//!                                                             │
//!   stdout sink ◄─┐                                           ▼
//!                 ├─ [demux worker] ◄── transport.output ◄── (unit stdout/stderr)
//!   stderr sink ◄─┘
//! ```
//!
//! Both workers are wired before the caller's `start` callback runs, so no
//! early output is lost.

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use stagehand_shared::{StagehandError, StagehandResult};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;

/// Destination for one of a unit's output streams.
pub type Sink = Box<dyn AsyncWrite + Send + Unpin>;

/// Data fed to a unit's stdin.
pub type Source = Box<dyn AsyncRead + Send + Unpin>;

/// One chunk of demultiplexed unit output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputFrame {
    Stdout(Bytes),
    Stderr(Bytes),
}

/// Hijacked bidirectional connection to a unit.
pub struct Transport {
    output: BoxStream<'static, StagehandResult<OutputFrame>>,
    input: Pin<Box<dyn AsyncWrite + Send>>,
}

impl Transport {
    pub fn new(
        output: BoxStream<'static, StagehandResult<OutputFrame>>,
        input: Pin<Box<dyn AsyncWrite + Send>>,
    ) -> Self {
        Self { output, input }
    }
}

/// Aborts every tracked worker when dropped, whichever way `multiplex` exits.
#[derive(Default)]
struct Workers(Vec<AbortHandle>);

impl Workers {
    fn track(&mut self, handle: AbortHandle) {
        self.0.push(handle);
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

/// Stream a unit's stdio until its output closes.
///
/// 1. If `input` is given, copy it into the transport, then close the write
///    side to signal end of input.
/// 2. Demultiplex output frames into `stdout` and `stderr`.
/// 3. Only once both workers are running, call `start`.
/// 4. Return when the output is drained and the input fully delivered,
///    with the first I/O fault of either worker, or with
///    `StagehandError::Cancelled` as soon as `cancel` fires.
///
/// The workers never outlive this call.
pub async fn multiplex<F, Fut>(
    transport: Transport,
    input: Option<Source>,
    stdout: Sink,
    stderr: Sink,
    start: F,
    cancel: &CancellationToken,
) -> StagehandResult<()>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = StagehandResult<()>>,
{
    let Transport {
        output,
        input: writer,
    } = transport;
    let mut workers = Workers::default();

    // Without input the write half stays open until the output side is done.
    let (input_worker, _idle_writer) = match input {
        Some(source) => {
            let handle = tokio::spawn(pump_input(source, writer));
            workers.track(handle.abort_handle());
            (Some(handle), None)
        }
        None => (None, Some(writer)),
    };

    let demux_worker = tokio::spawn(demux(output, stdout, stderr));
    workers.track(demux_worker.abort_handle());

    tokio::select! {
        started = start() => started?,
        _ = cancel.cancelled() => return Err(StagehandError::Cancelled),
    }

    tokio::select! {
        drained = drain(demux_worker, input_worker) => drained,
        _ = cancel.cancelled() => Err(StagehandError::Cancelled),
    }
}

/// Output first: a unit that died early surfaces its output fault, not the
/// broken pipe its stdin then hits.
async fn drain(
    demux_worker: JoinHandle<StagehandResult<()>>,
    input_worker: Option<JoinHandle<StagehandResult<()>>>,
) -> StagehandResult<()> {
    join_worker(demux_worker, "output").await?;
    match input_worker {
        Some(handle) => join_worker(handle, "input").await,
        None => Ok(()),
    }
}

async fn join_worker(handle: JoinHandle<StagehandResult<()>>, what: &str) -> StagehandResult<()> {
    handle
        .await
        .map_err(|e| StagehandError::Internal(format!("{} worker failed: {}", what, e)))?
}

async fn pump_input(
    mut source: Source,
    mut writer: Pin<Box<dyn AsyncWrite + Send>>,
) -> StagehandResult<()> {
    let bytes = tokio::io::copy(&mut source, &mut writer)
        .await
        .map_err(|e| StagehandError::Stream(format!("failed to copy input to unit: {}", e)))?;
    tracing::trace!(bytes, "Copied input to unit");
    writer
        .shutdown()
        .await
        .map_err(|e| StagehandError::Stream(format!("failed to close unit input: {}", e)))
}

async fn demux(
    mut output: BoxStream<'static, StagehandResult<OutputFrame>>,
    mut stdout: Sink,
    mut stderr: Sink,
) -> StagehandResult<()> {
    while let Some(frame) = output.next().await {
        match frame? {
            OutputFrame::Stdout(bytes) => stdout.write_all(&bytes).await?,
            OutputFrame::Stderr(bytes) => stderr.write_all(&bytes).await?,
        }
    }
    stdout.flush().await?;
    stderr.flush().await?;
    Ok(())
}

/// Cloneable in-memory sink. Every clone appends to the same buffer.
#[derive(Clone, Default)]
pub struct SharedBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sink(&self) -> Sink {
        Box::new(self.clone())
    }

    pub fn contents(&self) -> Vec<u8> {
        self.inner.lock().clone()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.inner.lock()).into_owned()
    }
}

impl AsyncWrite for SharedBuffer {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.inner.lock().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Factory for the sinks a pipeline writes unit output and progress to.
pub trait OutputSinks: Send + Sync {
    fn stdout(&self) -> Sink;
    fn stderr(&self) -> Sink;
}

/// The invoking process's own stdout/stderr.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessSinks;

impl OutputSinks for ProcessSinks {
    fn stdout(&self) -> Sink {
        Box::new(tokio::io::stdout())
    }

    fn stderr(&self) -> Sink {
        Box::new(tokio::io::stderr())
    }
}

/// Sinks that collect everything in memory.
#[derive(Clone, Default)]
pub struct CapturedSinks {
    pub stdout: SharedBuffer,
    pub stderr: SharedBuffer,
}

impl OutputSinks for CapturedSinks {
    fn stdout(&self) -> Sink {
        self.stdout.sink()
    }

    fn stderr(&self) -> Sink {
        self.stderr.sink()
    }
}
