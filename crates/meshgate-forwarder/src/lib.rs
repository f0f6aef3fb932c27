#![forbid(unsafe_code)]

//! Transport-layer forwarding engine for traffic terminated by the virtual network stack.
//!
//! [`Forwarder`] registers as the stack's connection handler. For each request it dials the real
//! destination, resolves the virtual handshake according to the dial outcome, and hands both
//! streams to a [`Relay`] session that copies bytes until the first side finishes or the
//! [`Lifecycle`] scope fires.

mod config;
mod error;
mod forwarder;
mod lifecycle;
mod relay;
mod stats;
mod timeouts;
mod udp;

pub use config::{
    ConfigError, ForwarderConfig, DEFAULT_CLOSE_TIMEOUT, DEFAULT_COPY_BUFFER_BYTES,
    ENV_CLOSE_TIMEOUT_MS, ENV_COPY_BUFFER_BYTES, ENV_DIAL_TIMEOUT_MS, ENV_UDP_IDLE_TIMEOUT_MS,
};
pub use error::{DialError, DialFailureKind};
pub use forwarder::{Forwarder, TcpOutcome};
pub use lifecycle::Lifecycle;
pub use relay::{Direction, Relay, RelayHandle, SessionReport, Termination};
pub use stats::{ForwarderStats, StatsSnapshot};
pub use udp::{FlowHandle, FlowReport, FlowTermination, UdpOutcome};
