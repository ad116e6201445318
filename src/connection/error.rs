//! Connection Errors

use thiserror::Error;

use super::registry::LogicalId;
use super::Endpoint;
use crate::protocol::FrameError;

/// Errors surfaced by the connection manager
#[derive(Debug, Error)]
pub enum ConnError {
    /// The id is unknown, or names a connection that has been disconnected.
    #[error("invalid logical connection handle {0}")]
    InvalidHandle(LogicalId),

    #[error("failed to connect to {endpoint}: {reason}")]
    ConnectFailed { endpoint: Endpoint, reason: String },

    #[error("socket read/write failed: {0}")]
    ReadWriteFailed(#[from] std::io::Error),

    #[error("protocol error {code}: {message}")]
    Protocol { code: u16, message: String },

    #[error("resource exhausted: {0}")]
    ResourceExhaustion(String),

    #[error("connection manager is shutting down")]
    ShuttingDown,
}

impl ConnError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidHandle(_) => "invalid_handle",
            Self::ConnectFailed { .. } => "connect_failed",
            Self::ReadWriteFailed(_) => "read_write_failed",
            Self::Protocol { .. } => "protocol_error",
            Self::ResourceExhaustion(_) => "resource_exhaustion",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

impl From<FrameError> for ConnError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(e) => ConnError::ReadWriteFailed(e),
            FrameError::Protocol { code, message } => ConnError::Protocol { code, message },
        }
    }
}

pub type ConnResult<T> = std::result::Result<T, ConnError>;
