//! Error types for the tunnel gateway.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Target queue (tunnel inbox or reply queue) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Queue existed, then was deleted while a caller was waiting on it.
    #[error("closed: {0}")]
    Closed(String),

    /// Malformed envelope received from a client or external ingress.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Broker or socket-level failure, fatal to the session that observed it.
    #[error("transport fault: {0}")]
    TransportFault(String),

    /// Control handshake rejected on a major-version mismatch.
    #[error("version mismatch: {0}")]
    VersionMismatch(String),
}

impl Error {
    /// `Closed` surfaces to ingress callers as `NotFound` (§7).
    pub fn into_not_found(self) -> Error {
        match self {
            Error::Closed(name) => Error::NotFound(name),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}
