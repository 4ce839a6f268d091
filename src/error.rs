//! Error taxonomy shared by the store, the RPC surface and the scheduler.
//!
//! Client-caused failures (`Validation`, `Authorization`, `Duplicate`) map to
//! `retcode = 2`; anything the caller cannot fix maps to `retcode = 1` with a
//! generic description. `Transport` never leaves the scheduler.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClusterError>;

/// Why an outbound call to a peer failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFailure {
    /// The peer actively refused the TCP connection.
    Refused,
    /// Connect or response exceeded the per-call timeout.
    Timeout,
    /// The peer answered, but not with what the protocol expects.
    Protocol,
    /// Any other network failure.
    Other,
}

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Authorization failed")]
    Authorization,

    #[error("Duplicate id: {0}")]
    Duplicate(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Transport error ({kind:?}): {message}")]
    Transport {
        kind: TransportFailure,
        message: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClusterError {
    pub fn validation(msg: impl Into<String>) -> Self {
        ClusterError::Validation(msg.into())
    }

    pub fn transport(kind: TransportFailure, msg: impl Into<String>) -> Self {
        ClusterError::Transport {
            kind,
            message: msg.into(),
        }
    }

    /// Return code used in the RPC answer block.
    pub fn retcode(&self) -> u8 {
        match self {
            ClusterError::Validation(_)
            | ClusterError::Authorization
            | ClusterError::Duplicate(_) => 2,
            _ => 1,
        }
    }

    /// Text shown to RPC callers. Internal failures stay generic.
    pub fn public_description(&self) -> String {
        match self.retcode() {
            2 => self.to_string(),
            _ => "An unexpected error occurred".to_string(),
        }
    }
}

impl From<std::io::Error> for ClusterError {
    fn from(err: std::io::Error) -> Self {
        ClusterError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        ClusterError::Storage(err.to_string())
    }
}
