use std::{
    fmt, io,
    task::{Context, Poll},
};

use crate::{ConnectionId, EndpointError, EndpointNotifier};

/// Virtual side of a UDP flow.
pub trait VirtualDatagram: Send + 'static {
    /// Receive the next datagram sent by the virtual peer. `None` once the endpoint is closed.
    fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<io::Result<Vec<u8>>>>;

    /// Deliver one datagram to the virtual peer.
    fn poll_send(&mut self, cx: &mut Context<'_>, datagram: &[u8]) -> Poll<io::Result<()>>;
}

/// Owned handle to a [`VirtualDatagram`] with async helpers.
pub struct DatagramEndpoint {
    inner: Box<dyn VirtualDatagram>,
}

impl DatagramEndpoint {
    pub fn new(inner: Box<dyn VirtualDatagram>) -> Self {
        Self { inner }
    }

    pub async fn recv(&mut self) -> Option<io::Result<Vec<u8>>> {
        std::future::poll_fn(|cx| self.inner.poll_recv(cx)).await
    }

    pub async fn send(&mut self, datagram: &[u8]) -> io::Result<()> {
        std::future::poll_fn(|cx| self.inner.poll_send(cx, datagram)).await
    }
}

impl fmt::Debug for DatagramEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatagramEndpoint").finish_non_exhaustive()
    }
}

/// Stack-side half of a new UDP flow, implemented by the concrete adapter.
pub trait DatagramSource: Send + 'static {
    fn id(&self) -> ConnectionId;

    fn create_endpoint(
        &mut self,
        notifier: &EndpointNotifier,
    ) -> Result<DatagramEndpoint, EndpointError>;
}

/// A new UDP flow surfaced by the stack.
///
/// Datagrams carry no handshake, so there is nothing to resolve: a request whose endpoint is never
/// created simply drops the flow.
pub struct DatagramRequest {
    id: ConnectionId,
    source: Box<dyn DatagramSource>,
    endpoint_requested: bool,
}

impl DatagramRequest {
    pub fn new(source: Box<dyn DatagramSource>) -> Self {
        Self {
            id: source.id(),
            source,
            endpoint_requested: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn create_endpoint(
        &mut self,
        notifier: &EndpointNotifier,
    ) -> Result<DatagramEndpoint, EndpointError> {
        if std::mem::replace(&mut self.endpoint_requested, true) {
            return Err(EndpointError::AlreadyCreated);
        }
        self.source.create_endpoint(notifier)
    }
}

impl fmt::Debug for DatagramRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatagramRequest")
            .field("id", &self.id)
            .field("endpoint_requested", &self.endpoint_requested)
            .finish()
    }
}
