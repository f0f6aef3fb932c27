use thiserror::Error;

/// Failure to materialize the virtual side of a connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EndpointError {
    #[error("endpoint already requested for this connection")]
    AlreadyCreated,

    #[error("virtual stack resources exhausted")]
    Exhausted,

    #[error("connection closed by the virtual stack")]
    Closed,

    #[error("endpoint creation failed: {0}")]
    Other(String),
}

/// Returned by [`crate::ConnectionRequest::accept`] when the handshake could not be completed.
///
/// The request is rejected in this case; it is never left unresolved.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AcceptError {
    #[error("cannot accept a connection without a virtual endpoint")]
    NoEndpoint,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    #[error("a {0} handler is already registered")]
    AlreadyRegistered(&'static str),

    #[error("no {0} handler is registered")]
    NotRegistered(&'static str),
}
