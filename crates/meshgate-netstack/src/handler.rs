use crate::{ConnectionRequest, DatagramRequest};

/// Receives every inbound TCP connection request for the lifetime of the stack.
///
/// Invoked synchronously from the stack's dispatch path: implementations must not block and should
/// hand the request off to a task.
pub trait TcpHandler: Send + Sync + 'static {
    fn handle_tcp(&self, request: ConnectionRequest);
}

/// Receives the first datagram of every new UDP flow.
pub trait UdpHandler: Send + Sync + 'static {
    fn handle_udp(&self, request: DatagramRequest);
}

impl<F> TcpHandler for F
where
    F: Fn(ConnectionRequest) + Send + Sync + 'static,
{
    fn handle_tcp(&self, request: ConnectionRequest) {
        self(request)
    }
}

impl<F> UdpHandler for F
where
    F: Fn(DatagramRequest) + Send + Sync + 'static,
{
    fn handle_udp(&self, request: DatagramRequest) {
        self(request)
    }
}
