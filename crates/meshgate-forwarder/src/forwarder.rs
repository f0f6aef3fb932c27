use std::{fmt, net::SocketAddr, sync::Arc};

use meshgate_netstack::{ConnectionRequest, EndpointError, EndpointNotifier, TcpHandler};
use tokio::net::TcpStream;

use crate::{
    error::DialError, relay::RelayHandle, stats::ForwarderStats, timeouts::timeout_opt,
    ForwarderConfig, Lifecycle, Relay,
};

/// Bridges connection requests from the virtual stack to real-network connections.
///
/// Cloning is cheap; every clone shares configuration, lifecycle scope and counters. Register one
/// clone as the stack's [`TcpHandler`] (and [`meshgate_netstack::UdpHandler`]).
#[derive(Clone)]
pub struct Forwarder {
    inner: Arc<ForwarderInner>,
}

struct ForwarderInner {
    config: ForwarderConfig,
    lifecycle: Lifecycle,
    stats: ForwarderStats,
}

/// How [`Forwarder::forward_tcp`] disposed of a request.
#[derive(Debug)]
pub enum TcpOutcome {
    /// The dial failed; the handshake was rejected and no socket remains open.
    Rejected(DialError),
    /// The dial succeeded but the virtual endpoint could not be created; the real connection was
    /// closed and the handshake rejected.
    ProvisionFailed(EndpointError),
    /// The handshake was accepted and a relay session is running.
    Relaying(RelayHandle),
}

impl Forwarder {
    pub fn new(config: ForwarderConfig, lifecycle: Lifecycle) -> Self {
        Self {
            inner: Arc::new(ForwarderInner {
                config,
                lifecycle,
                stats: ForwarderStats::new(),
            }),
        }
    }

    pub fn config(&self) -> &ForwarderConfig {
        &self.inner.config
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.inner.lifecycle
    }

    pub fn stats(&self) -> &ForwarderStats {
        &self.inner.stats
    }

    /// Resolve one connection request: dial the destination, then accept and relay, or reject.
    ///
    /// Returns once the handshake is resolved; the relay keeps running on its own task.
    pub async fn forward_tcp(&self, mut request: ConnectionRequest) -> TcpOutcome {
        let id = request.id();
        let stats = &self.inner.stats;
        stats.tcp_request();

        let real = match self.dial_tcp(id.destination()).await {
            Ok(stream) => stream,
            Err(err) => {
                stats.tcp_dial_failed();
                request.reject();
                tracing::trace!(conn = %id, kind = %err.kind(), "dial error: {err}");
                return TcpOutcome::Rejected(err);
            }
        };

        let notifier = EndpointNotifier::new();
        let endpoint = match request.create_endpoint(&notifier) {
            Ok(endpoint) => endpoint,
            Err(err) => {
                stats.tcp_endpoint_failed();
                drop(real);
                request.reject();
                tracing::error!(conn = %id, "failed to create virtual endpoint: {err}");
                return TcpOutcome::ProvisionFailed(err);
            }
        };

        if let Err(err) = request.accept() {
            stats.tcp_endpoint_failed();
            tracing::error!(conn = %id, "failed to complete handshake: {err}");
            return TcpOutcome::ProvisionFailed(EndpointError::Other(err.to_string()));
        }

        tracing::trace!(conn = %id, "established TCP connection");

        let config = &self.inner.config;
        let handle = Relay::new(id, endpoint, real)
            .buffer_size(config.copy_buffer_size)
            .close_timeout(config.close_timeout)
            .stats(stats.clone())
            .spawn(&self.inner.lifecycle);
        TcpOutcome::Relaying(handle)
    }

    async fn dial_tcp(&self, target: SocketAddr) -> Result<TcpStream, DialError> {
        let dial = timeout_opt(self.inner.config.dial_timeout, TcpStream::connect(target));
        tokio::select! {
            biased;
            _ = self.inner.lifecycle.cancelled() => Err(DialError::Cancelled { target }),
            res = dial => match res {
                Ok(Ok(stream)) => Ok(stream),
                Ok(Err(err)) => Err(DialError::io(target, err)),
                Err(_) => Err(DialError::Timeout { target }),
            },
        }
    }
}

impl TcpHandler for Forwarder {
    fn handle_tcp(&self, request: ConnectionRequest) {
        let forwarder = self.clone();
        tokio::spawn(async move {
            forwarder.forward_tcp(request).await;
        });
    }
}

impl fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Forwarder")
            .field("config", &self.inner.config)
            .field("shutting_down", &self.inner.lifecycle.is_shutting_down())
            .finish()
    }
}
