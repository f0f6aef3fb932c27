//! In-memory adapter implementing the stack contract over `tokio::io::duplex` and channels.
//!
//! Each [`PipeStack::connect`] call plays the role of an inbound SYN: it builds a
//! [`ConnectionRequest`], dispatches it to the registered [`TcpHandler`] and hands the caller the
//! virtual peer's end of the pipe. The caller can then observe how the request was resolved and
//! whether the endpoint was shut down and released.

use std::{
    fmt, io,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, OnceLock,
    },
    task::{Context, Poll},
};

use tokio::{
    io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf},
    sync::{mpsc, oneshot},
};

use crate::{
    ConnectionId, ConnectionRequest, DatagramEndpoint, DatagramRequest, DatagramSource,
    EndpointError, EndpointNotifier, Handshake, RegisterError, Resolution, TcpHandler,
    UdpHandler, VirtualDatagram, VirtualStream,
};

pub const DEFAULT_PIPE_BUFFER: usize = 64 * 1024;

#[derive(Clone)]
pub struct PipeStack {
    inner: Arc<StackInner>,
}

struct StackInner {
    tcp: OnceLock<Arc<dyn TcpHandler>>,
    udp: OnceLock<Arc<dyn UdpHandler>>,
    endpoint_failures: AtomicUsize,
    buffer_size: usize,
}

impl StackInner {
    fn take_endpoint_failure(&self) -> bool {
        self.endpoint_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for PipeStack {
    fn default() -> Self {
        Self::new()
    }
}

impl PipeStack {
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_PIPE_BUFFER)
    }

    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            inner: Arc::new(StackInner {
                tcp: OnceLock::new(),
                udp: OnceLock::new(),
                endpoint_failures: AtomicUsize::new(0),
                buffer_size: buffer_size.max(1),
            }),
        }
    }

    /// Install the TCP handler. Only one handler may be registered per stack.
    pub fn register_tcp_handler(&self, handler: impl TcpHandler) -> Result<(), RegisterError> {
        self.inner
            .tcp
            .set(Arc::new(handler) as Arc<dyn TcpHandler>)
            .map_err(|_| RegisterError::AlreadyRegistered("tcp"))
    }

    pub fn register_udp_handler(&self, handler: impl UdpHandler) -> Result<(), RegisterError> {
        self.inner
            .udp
            .set(Arc::new(handler) as Arc<dyn UdpHandler>)
            .map_err(|_| RegisterError::AlreadyRegistered("udp"))
    }

    /// Make the next `n` endpoint creations fail with [`EndpointError::Exhausted`].
    pub fn fail_next_endpoints(&self, n: usize) {
        self.inner.endpoint_failures.store(n, Ordering::SeqCst);
    }

    /// Surface a new TCP connection request for `id` to the registered handler.
    pub fn connect(&self, id: ConnectionId) -> Result<PipeConnection, RegisterError> {
        let handler = self
            .inner
            .tcp
            .get()
            .cloned()
            .ok_or(RegisterError::NotRegistered("tcp"))?;

        let (endpoint_side, peer_side) = tokio::io::duplex(self.inner.buffer_size);
        let (resolution_tx, resolution_rx) = oneshot::channel();
        let probe = Arc::new(EndpointProbe::default());

        let handshake = PipeHandshake {
            id,
            stack: self.inner.clone(),
            endpoint: Some(endpoint_side),
            notifier: None,
            resolution_tx: Some(resolution_tx),
            probe: probe.clone(),
        };
        handler.handle_tcp(ConnectionRequest::new(Box::new(handshake)));

        Ok(PipeConnection {
            id,
            stream: peer_side,
            resolution_rx: Some(resolution_rx),
            resolution: None,
            probe,
        })
    }

    /// Surface a new UDP flow for `id` to the registered handler.
    pub fn open_datagram(&self, id: ConnectionId) -> Result<PipeDatagramFlow, RegisterError> {
        let handler = self
            .inner
            .udp
            .get()
            .cloned()
            .ok_or(RegisterError::NotRegistered("udp"))?;

        let (to_endpoint_tx, to_endpoint_rx) = mpsc::unbounded_channel();
        let (from_endpoint_tx, from_endpoint_rx) = mpsc::unbounded_channel();

        let source = PipeDatagramSource {
            id,
            stack: self.inner.clone(),
            channels: Some((to_endpoint_rx, from_endpoint_tx)),
        };
        handler.handle_udp(DatagramRequest::new(Box::new(source)));

        Ok(PipeDatagramFlow {
            id,
            to_endpoint: Some(to_endpoint_tx),
            from_endpoint: from_endpoint_rx,
        })
    }
}

impl fmt::Debug for PipeStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeStack")
            .field("tcp_registered", &self.inner.tcp.get().is_some())
            .field("udp_registered", &self.inner.udp.get().is_some())
            .field("buffer_size", &self.inner.buffer_size)
            .finish()
    }
}

#[derive(Default)]
struct EndpointProbe {
    resolves: AtomicUsize,
    shutdowns: AtomicUsize,
    drops: AtomicUsize,
}

struct PipeHandshake {
    id: ConnectionId,
    stack: Arc<StackInner>,
    endpoint: Option<DuplexStream>,
    notifier: Option<EndpointNotifier>,
    resolution_tx: Option<oneshot::Sender<Resolution>>,
    probe: Arc<EndpointProbe>,
}

impl Handshake for PipeHandshake {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn create_endpoint(
        &mut self,
        notifier: &EndpointNotifier,
    ) -> Result<Box<dyn VirtualStream>, EndpointError> {
        if self.stack.take_endpoint_failure() {
            return Err(EndpointError::Exhausted);
        }
        let stream = self.endpoint.take().ok_or(EndpointError::AlreadyCreated)?;
        self.notifier = Some(notifier.clone());
        Ok(Box::new(PipeEndpoint {
            stream,
            probe: self.probe.clone(),
        }))
    }

    fn resolve(mut self: Box<Self>, resolution: Resolution) {
        self.probe.resolves.fetch_add(1, Ordering::SeqCst);
        if resolution == Resolution::Accept {
            if let Some(notifier) = &self.notifier {
                notifier.notify();
            }
        }
        if let Some(tx) = self.resolution_tx.take() {
            let _ = tx.send(resolution);
        }
    }
}

/// Virtual-side stream handed to the consumer; records shutdowns and release.
struct PipeEndpoint {
    stream: DuplexStream,
    probe: Arc<EndpointProbe>,
}

impl AsyncRead for PipeEndpoint {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for PipeEndpoint {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let res = Pin::new(&mut self.stream).poll_shutdown(cx);
        if res.is_ready() {
            self.probe.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
        res
    }
}

impl Drop for PipeEndpoint {
    fn drop(&mut self) {
        self.probe.drops.fetch_add(1, Ordering::SeqCst);
    }
}

/// The virtual peer's view of one connection surfaced by [`PipeStack::connect`].
pub struct PipeConnection {
    id: ConnectionId,
    stream: DuplexStream,
    resolution_rx: Option<oneshot::Receiver<Resolution>>,
    resolution: Option<Resolution>,
    probe: Arc<EndpointProbe>,
}

impl PipeConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The peer's end of the pipe. Reads see EOF once the endpoint side is released.
    pub fn stream(&mut self) -> &mut DuplexStream {
        &mut self.stream
    }

    pub fn into_stream(self) -> DuplexStream {
        self.stream
    }

    /// Wait for the handshake to be resolved. `None` if the request vanished without resolving,
    /// which [`ConnectionRequest`] never allows.
    pub async fn resolution(&mut self) -> Option<Resolution> {
        if let Some(rx) = self.resolution_rx.take() {
            self.resolution = rx.await.ok();
        }
        self.resolution
    }

    pub fn resolve_count(&self) -> usize {
        self.probe.resolves.load(Ordering::SeqCst)
    }

    /// Number of completed `poll_shutdown` calls on the handed-out endpoint.
    pub fn endpoint_shutdowns(&self) -> usize {
        self.probe.shutdowns.load(Ordering::SeqCst)
    }

    /// Number of times the handed-out endpoint was dropped (0 or 1).
    pub fn endpoint_releases(&self) -> usize {
        self.probe.drops.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for PipeConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeConnection")
            .field("id", &self.id)
            .field("resolution", &self.resolution)
            .finish_non_exhaustive()
    }
}

type DatagramChannels = (
    mpsc::UnboundedReceiver<Vec<u8>>,
    mpsc::UnboundedSender<Vec<u8>>,
);

struct PipeDatagramSource {
    id: ConnectionId,
    stack: Arc<StackInner>,
    channels: Option<DatagramChannels>,
}

impl DatagramSource for PipeDatagramSource {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn create_endpoint(
        &mut self,
        _notifier: &EndpointNotifier,
    ) -> Result<DatagramEndpoint, EndpointError> {
        if self.stack.take_endpoint_failure() {
            return Err(EndpointError::Exhausted);
        }
        let (rx, tx) = self.channels.take().ok_or(EndpointError::AlreadyCreated)?;
        Ok(DatagramEndpoint::new(Box::new(PipeDatagram { rx, tx })))
    }
}

struct PipeDatagram {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl VirtualDatagram for PipeDatagram {
    fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<io::Result<Vec<u8>>>> {
        self.rx.poll_recv(cx).map(|datagram| datagram.map(Ok))
    }

    fn poll_send(&mut self, _cx: &mut Context<'_>, datagram: &[u8]) -> Poll<io::Result<()>> {
        Poll::Ready(
            self.tx
                .send(datagram.to_vec())
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "virtual peer closed")),
        )
    }
}

/// The virtual peer's view of one UDP flow surfaced by [`PipeStack::open_datagram`].
pub struct PipeDatagramFlow {
    id: ConnectionId,
    to_endpoint: Option<mpsc::UnboundedSender<Vec<u8>>>,
    from_endpoint: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl PipeDatagramFlow {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn send(&self, datagram: &[u8]) -> io::Result<()> {
        let closed = || io::Error::new(io::ErrorKind::BrokenPipe, "datagram endpoint closed");
        self.to_endpoint
            .as_ref()
            .ok_or_else(closed)?
            .send(datagram.to_vec())
            .map_err(|_| closed())
    }

    /// Next datagram delivered by the endpoint; `None` once the endpoint has been released.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.from_endpoint.recv().await
    }

    /// Close the peer side; the endpoint observes end-of-flow after draining queued datagrams.
    pub fn close(&mut self) {
        self.to_endpoint = None;
    }
}

impl fmt::Debug for PipeDatagramFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeDatagramFlow")
            .field("id", &self.id)
            .field("closed", &self.to_endpoint.is_none())
            .finish_non_exhaustive()
    }
}
