//! Bidirectional relay between the virtual-side stream and the real connection.
//!
//! A session runs three tasks: two copy workers (virtual → real, real → virtual) and a supervisor
//! that waits for the first of {either worker reports, lifecycle shutdown}. The supervisor then
//! marks the session as closing, stops the remaining worker through a per-session token, reunites
//! the stream halves and closes each stream once. Nothing is drained from the losing direction.

use std::{
    fmt, io,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

use meshgate_netstack::ConnectionId;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{DEFAULT_CLOSE_TIMEOUT, DEFAULT_COPY_BUFFER_BYTES},
    stats::ForwarderStats,
    timeouts::timeout_opt,
    Lifecycle,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    VirtualToReal,
    RealToVirtual,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::VirtualToReal => "virtual->real",
            Self::RealToVirtual => "real->virtual",
        })
    }
}

/// The event that ended a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The direction's reader reached EOF.
    Finished(Direction),
    /// The direction hit an I/O error.
    Failed(Direction),
    /// The lifecycle scope fired.
    Cancelled,
    /// Both workers exited without reporting (they panicked).
    Aborted,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Finished(dir) => write!(f, "{dir} finished"),
            Self::Failed(dir) => write!(f, "{dir} failed"),
            Self::Cancelled => f.write_str("shutdown"),
            Self::Aborted => f.write_str("copy workers aborted"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionReport {
    pub id: ConnectionId,
    pub termination: Termination,
    pub virtual_to_real: u64,
    pub real_to_virtual: u64,
}

const STATE_RUNNING: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// `Running -> Closing -> Closed`. Set to closing before any worker is stopped or any stream is
/// closed, so copy errors caused by our own teardown can be told apart from peer failures.
#[derive(Debug)]
struct SessionState(AtomicU8);

impl SessionState {
    fn new() -> Self {
        Self(AtomicU8::new(STATE_RUNNING))
    }

    /// Returns true for the caller that moved the session out of `Running`.
    fn begin_closing(&self) -> bool {
        self.0
            .compare_exchange(
                STATE_RUNNING,
                STATE_CLOSING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn is_closing(&self) -> bool {
        self.0.load(Ordering::Acquire) != STATE_RUNNING
    }

    fn mark_closed(&self) {
        self.0.store(STATE_CLOSED, Ordering::Release);
    }

    #[cfg(test)]
    fn is_closed(&self) -> bool {
        self.0.load(Ordering::Acquire) == STATE_CLOSED
    }
}

/// One relay session. Owns both streams from construction until teardown.
pub struct Relay<V, R> {
    id: ConnectionId,
    virtual_stream: V,
    real_stream: R,
    buffer_size: usize,
    close_timeout: Option<Duration>,
    stats: Option<ForwarderStats>,
}

impl<V, R> Relay<V, R>
where
    V: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    R: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(id: ConnectionId, virtual_stream: V, real_stream: R) -> Self {
        Self {
            id,
            virtual_stream,
            real_stream,
            buffer_size: DEFAULT_COPY_BUFFER_BYTES,
            close_timeout: Some(DEFAULT_CLOSE_TIMEOUT),
            stats: None,
        }
    }

    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    pub fn close_timeout(mut self, close_timeout: Option<Duration>) -> Self {
        self.close_timeout = close_timeout;
        self
    }

    pub fn stats(mut self, stats: ForwarderStats) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Start the session as an independent task.
    pub fn spawn(self, lifecycle: &Lifecycle) -> RelayHandle {
        let id = self.id;
        let shutdown = lifecycle.child();
        RelayHandle {
            id,
            task: tokio::spawn(self.run(shutdown)),
        }
    }

    /// Relay until the first direction finishes or `shutdown` fires, then close both streams.
    pub async fn run(self, shutdown: CancellationToken) -> SessionReport {
        let Relay {
            id,
            virtual_stream,
            real_stream,
            buffer_size,
            close_timeout,
            stats,
        } = self;

        if let Some(stats) = &stats {
            stats.tcp_session_opened();
        }

        let state = Arc::new(SessionState::new());
        let stop = shutdown.child_token();
        let (done_tx, mut done_rx) = mpsc::channel::<CopyReport>(2);

        let (virtual_rd, virtual_wr) = tokio::io::split(virtual_stream);
        let (real_rd, real_wr) = tokio::io::split(real_stream);

        let upstream = tokio::spawn(copy_worker(CopyWorker {
            id,
            direction: Direction::VirtualToReal,
            reader: virtual_rd,
            writer: real_wr,
            buffer_size,
            state: state.clone(),
            stop: stop.clone(),
            done: done_tx.clone(),
        }));
        let downstream = tokio::spawn(copy_worker(CopyWorker {
            id,
            direction: Direction::RealToVirtual,
            reader: real_rd,
            writer: virtual_wr,
            buffer_size,
            state: state.clone(),
            stop: stop.clone(),
            done: done_tx,
        }));

        let termination = tokio::select! {
            report = done_rx.recv() => match report {
                Some(report) => report.termination(),
                None => Termination::Aborted,
            },
            _ = shutdown.cancelled() => Termination::Cancelled,
        };

        state.begin_closing();
        tracing::trace!(conn = %id, %termination, "tearing down TCP session");
        stop.cancel();

        let (upstream, downstream) = tokio::join!(upstream, downstream);
        let (virtual_rd, real_wr, virtual_to_real) = worker_output(id, upstream);
        let (real_rd, virtual_wr, real_to_virtual) = worker_output(id, downstream);

        tokio::join!(
            close_halves(id, Side::Virtual, virtual_rd, virtual_wr, close_timeout),
            close_halves(id, Side::Real, real_rd, real_wr, close_timeout),
        );
        state.mark_closed();

        if let Some(stats) = &stats {
            stats.bytes_virtual_to_real(virtual_to_real);
            stats.bytes_real_to_virtual(real_to_virtual);
            stats.tcp_session_closed();
        }

        tracing::trace!(
            conn = %id,
            %termination,
            virtual_to_real,
            real_to_virtual,
            "TCP session closed"
        );

        SessionReport {
            id,
            termination,
            virtual_to_real,
            real_to_virtual,
        }
    }
}

/// Handle to a spawned session. Dropping it detaches the session; it still tears down on its own.
pub struct RelayHandle {
    id: ConnectionId,
    task: JoinHandle<SessionReport>,
}

impl RelayHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for teardown to complete. `None` if the supervisor panicked.
    pub async fn join(self) -> Option<SessionReport> {
        match self.task.await {
            Ok(report) => Some(report),
            Err(err) => {
                tracing::warn!(conn = %self.id, "relay supervisor failed: {err}");
                None
            }
        }
    }
}

impl fmt::Debug for RelayHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayHandle")
            .field("id", &self.id)
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
struct CopyReport {
    direction: Direction,
    failed: bool,
}

impl CopyReport {
    fn termination(self) -> Termination {
        if self.failed {
            Termination::Failed(self.direction)
        } else {
            Termination::Finished(self.direction)
        }
    }
}

struct CopyWorker<Rd, Wr> {
    id: ConnectionId,
    direction: Direction,
    reader: Rd,
    writer: Wr,
    buffer_size: usize,
    state: Arc<SessionState>,
    stop: CancellationToken,
    done: mpsc::Sender<CopyReport>,
}

enum CopyOutcome {
    Eof,
    Failed(io::Error),
    Stopped,
}

async fn copy_worker<Rd, Wr>(worker: CopyWorker<Rd, Wr>) -> (Rd, Wr, u64)
where
    Rd: AsyncRead + Unpin,
    Wr: AsyncWrite + Unpin,
{
    let CopyWorker {
        id,
        direction,
        mut reader,
        mut writer,
        buffer_size,
        state,
        stop,
        done,
    } = worker;

    let mut buf = vec![0u8; buffer_size];
    let mut copied = 0u64;

    let outcome = tokio::select! {
        biased;
        _ = stop.cancelled() => CopyOutcome::Stopped,
        res = pump(&mut reader, &mut writer, &mut buf, &mut copied) => match res {
            Ok(()) => CopyOutcome::Eof,
            Err(err) => CopyOutcome::Failed(err),
        },
    };

    let failed = match &outcome {
        CopyOutcome::Stopped => return (reader, writer, copied),
        CopyOutcome::Eof => {
            tracing::trace!(conn = %id, %direction, bytes = copied, "copy reached EOF");
            false
        }
        CopyOutcome::Failed(err) if state.is_closing() => {
            tracing::trace!(
                conn = %id,
                %direction,
                bytes = copied,
                "copy interrupted by session teardown: {err}"
            );
            true
        }
        CopyOutcome::Failed(err) => {
            tracing::debug!(
                conn = %id,
                %direction,
                bytes = copied,
                "copy error after {copied} bytes: {err}"
            );
            true
        }
    };

    let _ = done.try_send(CopyReport { direction, failed });
    (reader, writer, copied)
}

/// Copy until EOF. `copied` is updated per chunk so the count survives cancellation.
async fn pump<Rd, Wr>(
    reader: &mut Rd,
    writer: &mut Wr,
    buf: &mut [u8],
    copied: &mut u64,
) -> io::Result<()>
where
    Rd: AsyncRead + Unpin,
    Wr: AsyncWrite + Unpin,
{
    loop {
        let n = reader.read(buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        *copied += n as u64;
    }
}

type WorkerOutput<Rd, Wr> = Result<(Rd, Wr, u64), tokio::task::JoinError>;

fn worker_output<Rd, Wr>(
    id: ConnectionId,
    output: WorkerOutput<Rd, Wr>,
) -> (Option<Rd>, Option<Wr>, u64) {
    match output {
        Ok((reader, writer, copied)) => (Some(reader), Some(writer), copied),
        Err(err) => {
            // The halves were dropped with the task; dropping the surviving halves releases the
            // stream.
            tracing::warn!(conn = %id, "copy worker failed: {err}");
            (None, None, 0)
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Side {
    Virtual,
    Real,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Virtual => "virtual",
            Self::Real => "real",
        })
    }
}

async fn close_halves<S>(
    id: ConnectionId,
    side: Side,
    reader: Option<ReadHalf<S>>,
    writer: Option<WriteHalf<S>>,
    close_timeout: Option<Duration>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (Some(reader), Some(writer)) = (reader, writer) else {
        return;
    };
    close_stream(id, side, reader.unsplit(writer), close_timeout).await;
}

/// Shut the stream down and release it. Failures are logged and never propagate.
async fn close_stream<S>(
    id: ConnectionId,
    side: Side,
    mut stream: S,
    close_timeout: Option<Duration>,
) where
    S: AsyncWrite + Unpin,
{
    match timeout_opt(close_timeout, stream.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) if err.kind() == io::ErrorKind::NotConnected => {
            tracing::trace!(conn = %id, %side, "stream already disconnected at close");
        }
        Ok(Err(err)) => {
            tracing::warn!(conn = %id, %side, "stream close error: {err}");
        }
        Err(_) => {
            tracing::warn!(conn = %id, %side, "stream close timed out");
        }
    }
    drop(stream);
}
