//! Datagram forwarding.
//!
//! Mirrors the TCP path: bind and connect a host UDP socket to the flow's destination, then create
//! the virtual endpoint and relay datagrams both ways. Flows have no EOF, so a flow ends when the
//! virtual endpoint closes, either side errors, the configured idle timeout elapses, or the
//! lifecycle scope fires.

use std::{
    fmt,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    time::Duration,
};

use meshgate_netstack::{
    ConnectionId, DatagramEndpoint, DatagramRequest, EndpointError, EndpointNotifier, UdpHandler,
};
use tokio::{net::UdpSocket, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{error::DialError, stats::ForwarderStats, timeouts::IdleTimer, Forwarder};

const MAX_DATAGRAM_BYTES: usize = 65_535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowTermination {
    VirtualClosed,
    VirtualError,
    RealError,
    IdleTimeout,
    Cancelled,
}

impl fmt::Display for FlowTermination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::VirtualClosed => "virtual endpoint closed",
            Self::VirtualError => "virtual endpoint error",
            Self::RealError => "real socket error",
            Self::IdleTimeout => "idle timeout",
            Self::Cancelled => "shutdown",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowReport {
    pub id: ConnectionId,
    pub termination: FlowTermination,
    pub datagrams_virtual_to_real: u64,
    pub datagrams_real_to_virtual: u64,
}

pub struct FlowHandle {
    id: ConnectionId,
    task: JoinHandle<FlowReport>,
}

impl FlowHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub async fn join(self) -> Option<FlowReport> {
        match self.task.await {
            Ok(report) => Some(report),
            Err(err) => {
                tracing::warn!(conn = %self.id, "datagram relay failed: {err}");
                None
            }
        }
    }
}

impl fmt::Debug for FlowHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowHandle")
            .field("id", &self.id)
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

#[derive(Debug)]
pub enum UdpOutcome {
    /// The host socket could not be bound or connected; the flow was dropped.
    Rejected(DialError),
    ProvisionFailed(EndpointError),
    Relaying(FlowHandle),
}

impl Forwarder {
    pub async fn forward_udp(&self, mut request: DatagramRequest) -> UdpOutcome {
        let id = request.id();
        let stats = self.stats();

        let socket = match self.dial_udp(id.destination()).await {
            Ok(socket) => socket,
            Err(err) => {
                stats.udp_flow_failed();
                tracing::trace!(conn = %id, kind = %err.kind(), "udp dial error: {err}");
                return UdpOutcome::Rejected(err);
            }
        };

        let endpoint = match request.create_endpoint(&EndpointNotifier::new()) {
            Ok(endpoint) => endpoint,
            Err(err) => {
                stats.udp_flow_failed();
                drop(socket);
                tracing::error!(conn = %id, "failed to create virtual datagram endpoint: {err}");
                return UdpOutcome::ProvisionFailed(err);
            }
        };

        tracing::trace!(conn = %id, "established UDP flow");

        let task = tokio::spawn(relay_datagrams(
            id,
            endpoint,
            socket,
            self.config().udp_idle_timeout,
            self.lifecycle().child(),
            stats.clone(),
        ));
        UdpOutcome::Relaying(FlowHandle { id, task })
    }

    async fn dial_udp(&self, target: SocketAddr) -> Result<UdpSocket, DialError> {
        let bind_addr = match target {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };
        let dial = async {
            let socket = UdpSocket::bind(bind_addr).await?;
            socket.connect(target).await?;
            Ok::<_, std::io::Error>(socket)
        };
        tokio::select! {
            biased;
            _ = self.lifecycle().cancelled() => Err(DialError::Cancelled { target }),
            res = dial => res.map_err(|err| DialError::io(target, err)),
        }
    }
}

async fn relay_datagrams(
    id: ConnectionId,
    mut endpoint: DatagramEndpoint,
    socket: UdpSocket,
    idle_timeout: Option<Duration>,
    shutdown: CancellationToken,
    stats: ForwarderStats,
) -> FlowReport {
    stats.udp_flow_opened();

    let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];
    let mut idle = IdleTimer::new(idle_timeout);
    let mut to_real = 0u64;
    let mut to_virtual = 0u64;

    let termination = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break FlowTermination::Cancelled,
            _ = idle.expired() => break FlowTermination::IdleTimeout,
            datagram = endpoint.recv() => match datagram {
                None => break FlowTermination::VirtualClosed,
                Some(Err(err)) => {
                    tracing::debug!(conn = %id, "virtual datagram receive error: {err}");
                    break FlowTermination::VirtualError;
                }
                Some(Ok(datagram)) => {
                    if let Err(err) = socket.send(&datagram).await {
                        tracing::debug!(conn = %id, "udp send error: {err}");
                        break FlowTermination::RealError;
                    }
                    to_real += 1;
                    idle.reset();
                }
            },
            res = socket.recv(&mut buf) => match res {
                Ok(n) => {
                    if let Err(err) = endpoint.send(&buf[..n]).await {
                        tracing::debug!(conn = %id, "virtual datagram send error: {err}");
                        break FlowTermination::VirtualError;
                    }
                    to_virtual += 1;
                    idle.reset();
                }
                Err(err) => {
                    tracing::debug!(conn = %id, "udp receive error: {err}");
                    break FlowTermination::RealError;
                }
            },
        }
    };

    drop(endpoint);
    drop(socket);
    stats.udp_flow_closed();

    tracing::trace!(
        conn = %id,
        %termination,
        datagrams_virtual_to_real = to_real,
        datagrams_real_to_virtual = to_virtual,
        "UDP flow closed"
    );

    FlowReport {
        id,
        termination,
        datagrams_virtual_to_real: to_real,
        datagrams_real_to_virtual: to_virtual,
    }
}

impl UdpHandler for Forwarder {
    fn handle_udp(&self, request: DatagramRequest) {
        let forwarder = self.clone();
        tokio::spawn(async move {
            forwarder.forward_udp(request).await;
        });
    }
}
