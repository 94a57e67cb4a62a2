//! TCP fabric: an async client/server pair with a streamed receive path,
//! backpressured writes, and a deadlock-guarded instance lock.

mod client;
mod server;
mod stream;

pub use client::TcpFabricClient;
pub use server::{ServerState, TcpFabricServer};
pub use stream::{FabricStream, WriteMode};

use crate::error::FabricError;

/// Lifecycle of one TCP client. Transitions are exactly-once:
/// created → connecting → connected → closing → closed, with
/// connecting → closing permitted on failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ClientState {
    Created = 0,
    Connecting = 1,
    Connected = 2,
    Closing = 3,
    Closed = 4,
}

impl ClientState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

pub type ConnectedHandler = dyn Fn() + Send + Sync;
pub type DisconnectedHandler = dyn Fn() + Send + Sync;
/// Return `true` to mark the bytes handled; unhandled bytes are appended to
/// the receive FIFO for stream readers.
pub type ReceivedHandler = dyn Fn(&[u8]) -> bool + Send + Sync;
/// Fired after unhandled bytes land in the receive FIFO, with the count.
pub type BufferedHandler = dyn Fn(usize) + Send + Sync;
pub type ErrorHandler = dyn Fn(&FabricError) + Send + Sync;
/// Invoked when a detached send completes, success or not.
pub type SendCallback = Box<dyn FnOnce(Result<usize, FabricError>) + Send>;
pub type ClientAcceptedHandler = dyn Fn(&TcpFabricClient) + Send + Sync;
pub type ClientExceptionHandler = dyn Fn(&TcpFabricClient, &FabricError) + Send + Sync;
pub type AcceptTasksBusyHandler = dyn Fn() + Send + Sync;
