#![forbid(unsafe_code)]

//! Capability surface of the user-space TCP/IP stack that terminates traffic on the virtual
//! interface.
//!
//! The stack itself (packet capture, demultiplexing, segment handling) lives outside this crate.
//! What remains here is the contract a forwarder consumes:
//! - [`ConnectionRequest`]: an unresolved inbound TCP handshake that must be resolved exactly once.
//! - [`DatagramRequest`]: the first datagram of a new UDP flow.
//! - [`TcpHandler`] / [`UdpHandler`]: the single handler the stack invokes per request.
//!
//! [`pipe`] provides an in-memory adapter implementing the same contract over
//! `tokio::io::duplex`, for hosts that want to drive a forwarder without a real packet path.

mod datagram;
mod error;
mod handler;
mod id;
pub mod pipe;
mod request;

pub use datagram::{DatagramEndpoint, DatagramRequest, DatagramSource, VirtualDatagram};
pub use error::{AcceptError, EndpointError, RegisterError};
pub use handler::{TcpHandler, UdpHandler};
pub use id::ConnectionId;
pub use request::{ConnectionRequest, EndpointNotifier, Handshake, Resolution, VirtualStream};
