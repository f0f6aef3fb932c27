use std::{fmt, sync::Arc};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::Notify,
};

use crate::{AcceptError, ConnectionId, EndpointError};

/// Duplex byte stream for the virtual side of an accepted connection.
pub trait VirtualStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> VirtualStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Complete the three-way handshake.
    Accept,
    /// Abort the handshake (the peer observes a reset).
    Reject,
}

/// Wait queue handed to the stack when an endpoint is created.
///
/// The stack signals it when the endpoint changes readiness. A signal sent while nobody is waiting
/// is kept for the next waiter. Consumers that poll the endpoint directly never need to wait on it.
#[derive(Clone, Default)]
pub struct EndpointNotifier {
    inner: Arc<Notify>,
}

impl EndpointNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        self.inner.notify_one();
    }

    pub async fn notified(&self) {
        self.inner.notified().await;
    }
}

impl fmt::Debug for EndpointNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointNotifier").finish_non_exhaustive()
    }
}

/// Stack-side half of a pending TCP handshake, implemented by the concrete adapter.
///
/// Consumers never call these methods directly: [`ConnectionRequest`] enforces the ordering and
/// exactly-once rules on top of them.
pub trait Handshake: Send + 'static {
    fn id(&self) -> ConnectionId;

    fn create_endpoint(
        &mut self,
        notifier: &EndpointNotifier,
    ) -> Result<Box<dyn VirtualStream>, EndpointError>;

    fn resolve(self: Box<Self>, resolution: Resolution);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndpointState {
    NotRequested,
    Failed,
    Created,
}

/// An unresolved inbound TCP handshake.
///
/// Resolution consumes the request, so it can happen at most once. A request dropped without
/// being resolved is rejected, so it also happens at least once.
pub struct ConnectionRequest {
    id: ConnectionId,
    handshake: Option<Box<dyn Handshake>>,
    endpoint: EndpointState,
}

impl ConnectionRequest {
    pub fn new(handshake: Box<dyn Handshake>) -> Self {
        Self {
            id: handshake.id(),
            handshake: Some(handshake),
            endpoint: EndpointState::NotRequested,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Materialize the virtual-side stream. Only the first call reaches the stack.
    pub fn create_endpoint(
        &mut self,
        notifier: &EndpointNotifier,
    ) -> Result<Box<dyn VirtualStream>, EndpointError> {
        if self.endpoint != EndpointState::NotRequested {
            return Err(EndpointError::AlreadyCreated);
        }
        let Some(handshake) = self.handshake.as_mut() else {
            return Err(EndpointError::Closed);
        };
        match handshake.create_endpoint(notifier) {
            Ok(stream) => {
                self.endpoint = EndpointState::Created;
                Ok(stream)
            }
            Err(err) => {
                self.endpoint = EndpointState::Failed;
                Err(err)
            }
        }
    }

    /// Complete the handshake. Requires a successfully created endpoint; otherwise the request is
    /// rejected instead.
    pub fn accept(mut self) -> Result<(), AcceptError> {
        if self.endpoint != EndpointState::Created {
            self.finish(Resolution::Reject);
            return Err(AcceptError::NoEndpoint);
        }
        self.finish(Resolution::Accept);
        Ok(())
    }

    pub fn reject(mut self) {
        self.finish(Resolution::Reject);
    }

    fn finish(&mut self, resolution: Resolution) {
        if let Some(handshake) = self.handshake.take() {
            handshake.resolve(resolution);
        }
    }
}

impl fmt::Debug for ConnectionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRequest")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("resolved", &self.handshake.is_none())
            .finish()
    }
}

impl Drop for ConnectionRequest {
    fn drop(&mut self) {
        if let Some(handshake) = self.handshake.take() {
            tracing::warn!(conn = %self.id, "connection request dropped unresolved; rejecting");
            handshake.resolve(Resolution::Reject);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        net::{IpAddr, Ipv4Addr},
        sync::Mutex,
    };

    #[derive(Default)]
    struct Log {
        endpoint_calls: usize,
        resolutions: Vec<Resolution>,
    }

    struct FakeHandshake {
        log: Arc<Mutex<Log>>,
        fail_endpoint: bool,
    }

    impl Handshake for FakeHandshake {
        fn id(&self) -> ConnectionId {
            ConnectionId::new(
                IpAddr::V4(Ipv4Addr::new(100, 64, 0, 2)),
                9000,
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
                443,
            )
        }

        fn create_endpoint(
            &mut self,
            _notifier: &EndpointNotifier,
        ) -> Result<Box<dyn VirtualStream>, EndpointError> {
            self.log.lock().unwrap().endpoint_calls += 1;
            if self.fail_endpoint {
                return Err(EndpointError::Exhausted);
            }
            let (a, _b) = tokio::io::duplex(64);
            Ok(Box::new(a))
        }

        fn resolve(self: Box<Self>, resolution: Resolution) {
            self.log.lock().unwrap().resolutions.push(resolution);
        }
    }

    fn request(fail_endpoint: bool) -> (ConnectionRequest, Arc<Mutex<Log>>) {
        let log = Arc::new(Mutex::new(Log::default()));
        let req = ConnectionRequest::new(Box::new(FakeHandshake {
            log: log.clone(),
            fail_endpoint,
        }));
        (req, log)
    }

    #[test]
    fn drop_without_resolution_rejects_once() {
        let (req, log) = request(false);
        drop(req);
        assert_eq!(log.lock().unwrap().resolutions, vec![Resolution::Reject]);
    }

    #[test]
    fn accept_without_endpoint_degrades_to_reject() {
        let (req, log) = request(false);
        assert_eq!(req.accept(), Err(AcceptError::NoEndpoint));
        assert_eq!(log.lock().unwrap().resolutions, vec![Resolution::Reject]);
    }

    #[tokio::test]
    async fn endpoint_is_created_at_most_once() {
        let (mut req, log) = request(false);
        let notifier = EndpointNotifier::new();
        let _stream = req.create_endpoint(&notifier).unwrap();
        assert!(matches!(
            req.create_endpoint(&notifier),
            Err(EndpointError::AlreadyCreated)
        ));
        req.accept().unwrap();

        let log = log.lock().unwrap();
        assert_eq!(log.endpoint_calls, 1);
        assert_eq!(log.resolutions, vec![Resolution::Accept]);
    }

    #[test]
    fn failed_endpoint_cannot_be_accepted() {
        let (mut req, log) = request(true);
        let notifier = EndpointNotifier::new();
        assert!(matches!(
            req.create_endpoint(&notifier),
            Err(EndpointError::Exhausted)
        ));
        assert!(matches!(
            req.create_endpoint(&notifier),
            Err(EndpointError::AlreadyCreated)
        ));
        assert_eq!(req.accept(), Err(AcceptError::NoEndpoint));

        let log = log.lock().unwrap();
        assert_eq!(log.endpoint_calls, 1);
        assert_eq!(log.resolutions, vec![Resolution::Reject]);
    }
}
