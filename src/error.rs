//! Transport error taxonomy.
//!
//! Errors during a single user call surface to that caller; failures
//! discovered asynchronously by a reader loop surface exactly once as a
//! mailbox event.

use thiserror::Error;

use crate::addr::AddrError;

/// Failure of [`EndPoint::connect`](crate::EndPoint::connect).
///
/// Stored in a failed remote's state cell and observed by every thread that
/// was waiting on the same attempt, hence `Clone`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectError {
    /// The address does not resolve, or the peer answered that the endpoint
    /// id is unknown.
    #[error("remote endpoint not found")]
    NotFound,
    #[error("connect failed: {reason}")]
    Failed { reason: String },
    #[error("insufficient resources: {reason}")]
    InsufficientResources { reason: String },
    #[error("connect timed out")]
    Timeout,
}

impl ConnectError {
    pub(crate) fn from_io(err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::OutOfMemory => ConnectError::InsufficientResources {
                reason: err.to_string(),
            },
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => ConnectError::Timeout,
            _ => ConnectError::Failed {
                reason: err.to_string(),
            },
        }
    }
}

/// Failure of [`Connection::send`](crate::Connection::send).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SendError {
    /// The peer or the physical connection is gone.
    #[error("send failed: {reason}")]
    Failed { reason: String },
    /// The logical connection (or its endpoint) was closed locally.
    #[error("connection closed")]
    Closed,
}

/// Failure of [`TcpTransport::new_endpoint`](crate::TcpTransport::new_endpoint).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum NewEndPointError {
    #[error("transport closed")]
    TransportClosed,
}

/// Transport construction and auxiliary-surface failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid address: {0}")]
    Addr(#[from] AddrError),
    #[error("operation not supported: {0}")]
    NotSupported(&'static str),
}
