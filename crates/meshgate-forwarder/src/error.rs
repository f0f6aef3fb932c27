use std::{fmt, io, net::SocketAddr};

use thiserror::Error;

/// Why a dial to the real destination did not produce a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialFailureKind {
    Refused,
    Unreachable,
    TimedOut,
    /// The lifecycle scope fired while the dial was in flight.
    Cancelled,
    Other,
}

impl DialFailureKind {
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Self::Refused,
            io::ErrorKind::TimedOut => Self::TimedOut,
            io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::AddrNotAvailable => Self::Unreachable,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for DialFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Refused => "refused",
            Self::Unreachable => "unreachable",
            Self::TimedOut => "timed out",
            Self::Cancelled => "cancelled",
            Self::Other => "failed",
        })
    }
}

#[derive(Debug, Error)]
pub enum DialError {
    #[error("dial {target} {kind}: {source}")]
    Io {
        target: SocketAddr,
        kind: DialFailureKind,
        #[source]
        source: io::Error,
    },

    #[error("dial {target} timed out")]
    Timeout { target: SocketAddr },

    #[error("dial {target} cancelled by shutdown")]
    Cancelled { target: SocketAddr },
}

impl DialError {
    pub(crate) fn io(target: SocketAddr, source: io::Error) -> Self {
        Self::Io {
            target,
            kind: DialFailureKind::from_io(&source),
            source,
        }
    }

    pub fn kind(&self) -> DialFailureKind {
        match self {
            Self::Io { kind, .. } => *kind,
            Self::Timeout { .. } => DialFailureKind::TimedOut,
            Self::Cancelled { .. } => DialFailureKind::Cancelled,
        }
    }

    pub fn target(&self) -> SocketAddr {
        match self {
            Self::Io { target, .. } | Self::Timeout { target } | Self::Cancelled { target } => {
                *target
            }
        }
    }
}
