use std::{
    fmt,
    net::{IpAddr, SocketAddr},
};

/// The 4-tuple of a connection attempt as observed on the virtual interface.
///
/// `dst`/`dst_port` are the *true* destination: only flows already matched by the redirect layer
/// reach a forwarder. The ID is used for diagnostics only; no session table is keyed on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    pub src: IpAddr,
    pub src_port: u16,
    pub dst: IpAddr,
    pub dst_port: u16,
}

impl ConnectionId {
    pub const fn new(src: IpAddr, src_port: u16, dst: IpAddr, dst_port: u16) -> Self {
        Self {
            src,
            src_port,
            dst,
            dst_port,
        }
    }

    pub fn from_addrs(source: SocketAddr, destination: SocketAddr) -> Self {
        Self::new(
            source.ip(),
            source.port(),
            destination.ip(),
            destination.port(),
        )
    }

    pub fn source(&self) -> SocketAddr {
        SocketAddr::new(self.src, self.src_port)
    }

    pub fn destination(&self) -> SocketAddr {
        SocketAddr::new(self.dst, self.dst_port)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source(), self.destination())
    }
}
