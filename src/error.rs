use std::str::Utf8Error;
use std::time::Duration;

use packed_struct::PackingError;
use thiserror::Error;

/// When things go awry
#[derive(Debug, Error)]
pub enum FabricError {
    /// Socket-level failure (refused, reset, unreachable). The affected
    /// endpoint is forced closed.
    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),
    /// An operation ran past its configured timeout
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// Wire data we refuse to decode
    #[error("protocol parse error: {0}")]
    ProtocolParse(String),
    /// A well-formed DNS response carrying a non-NoError rcode
    #[error("server answered {0:?}")]
    ErrorResponse(crate::enums::Rcode),
    /// Operation invoked in the wrong state, the connection is left alone
    #[error("state misuse: {0}")]
    StateMisuse(String),
    /// A user event handler panicked inside a completion path
    #[error("user callback panicked: {0}")]
    UserCallback(String),
    /// The instance lock could not be taken within the deadlock timeout,
    /// which usually means a handler is re-entering the client
    #[error("deadlock timeout exceeded ({0:?})")]
    Deadlock(Duration),
    /// A name that can't go on the wire (label over 63 bytes, name over 255)
    #[error("invalid domain name: {0}")]
    InvalidName(String),
    #[error("utf8 decoding failed: {0}")]
    Utf8Error(#[from] Utf8Error),
}

impl From<PackingError> for FabricError {
    fn from(error: PackingError) -> Self {
        FabricError::ProtocolParse(error.to_string())
    }
}

impl From<FabricError> for std::io::Error {
    fn from(error: FabricError) -> Self {
        match error {
            FabricError::Transport(err) => err,
            FabricError::Timeout(_) => {
                std::io::Error::new(std::io::ErrorKind::TimedOut, error.to_string())
            }
            other => std::io::Error::other(other.to_string()),
        }
    }
}

impl FabricError {
    /// True for the error kinds that count against a resolver retry budget
    /// rather than failing the whole lookup immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FabricError::Timeout(_) | FabricError::Transport(_) | FabricError::ProtocolParse(_)
        )
    }
}
