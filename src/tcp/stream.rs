use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{Instant, timeout};
use tracing::{debug, trace, warn};

use crate::error::FabricError;
use crate::fifo::ByteFifo;
use crate::tcp::TcpFabricClient;

/// How a [FabricStream::write] reaches the socket.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriteMode {
    /// Each write calls [TcpFabricClient::send] before returning
    Direct,
    /// Writes land in a send FIFO drained by a single background task, so
    /// program order is preserved without a send per write
    Buffered,
}

/// Readers blocked in [FabricStream::read] wake at least this often to
/// check whether the client has disconnected.
const READ_WAKE_INTERVAL: Duration = Duration::from_secs(1);

struct DrainState {
    send_fifo: ByteFifo,
    active: StdMutex<bool>,
    drained: Notify,
}

/// A byte-stream view over a [TcpFabricClient]: blocking reads against the
/// receive FIFO, ordered writes through a single drain. Seek and set-length
/// have no meaning here.
pub struct FabricStream {
    client: TcpFabricClient,
    mode: WriteMode,
    drain: Arc<DrainState>,
}

impl FabricStream {
    pub(crate) fn new(client: TcpFabricClient, mode: WriteMode) -> Self {
        Self {
            client,
            mode,
            drain: Arc::new(DrainState {
                send_fifo: ByteFifo::new(),
                active: StdMutex::new(false),
                drained: Notify::new(),
            }),
        }
    }

    pub fn client(&self) -> &TcpFabricClient {
        &self.client
    }

    pub fn write_mode(&self) -> WriteMode {
        self.mode
    }

    /// Bytes ready to read without blocking.
    pub fn available(&self) -> usize {
        self.client.recv_fifo().available()
    }

    /// Total bytes consumed through this stream's receive FIFO.
    pub fn position(&self) -> u64 {
        self.client.recv_fifo().position()
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.client.config().receive_timeout
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.client.config().send_timeout
    }

    /// Blocks until at least one byte is available, the receive timeout
    /// elapses ([FabricError::Timeout]), or the client disconnects with the
    /// FIFO empty (returns `Ok(0)` as EOF).
    pub async fn read(&self, dst: &mut [u8]) -> Result<usize, FabricError> {
        if dst.is_empty() {
            return Ok(0);
        }
        let receive_timeout = self.client.config().receive_timeout;
        let deadline = receive_timeout.map(|bound| Instant::now() + bound);
        loop {
            // arm the wakeup before checking, appends in between are kept
            let mut readable = std::pin::pin!(self.client.recv_fifo().readable());
            readable.as_mut().enable();
            let count = self.client.recv_fifo().read(dst);
            if count > 0 {
                return Ok(count);
            }
            if !self.client.is_connected() {
                trace!("stream read observed EOF");
                return Ok(0);
            }
            let mut wait = READ_WAKE_INTERVAL;
            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(FabricError::Timeout(
                        receive_timeout.unwrap_or(READ_WAKE_INTERVAL),
                    ));
                }
                wait = wait.min(remaining);
            }
            let _ = timeout(wait, readable).await;
        }
    }

    /// Reads until `dst` is full or EOF; returns the bytes read.
    pub async fn read_exact_or_eof(&self, dst: &mut [u8]) -> Result<usize, FabricError> {
        let mut filled = 0;
        while filled < dst.len() {
            let count = self.read(&mut dst[filled..]).await?;
            if count == 0 {
                break;
            }
            filled += count;
        }
        Ok(filled)
    }

    /// Writes the buffer. Direct mode sends before returning; buffered mode
    /// appends to the send FIFO and kicks the drain if none is running.
    pub async fn write(&self, buf: &[u8]) -> Result<(), FabricError> {
        if buf.is_empty() {
            return Ok(());
        }
        match self.mode {
            WriteMode::Direct => {
                self.client.send(buf).await?;
                Ok(())
            }
            WriteMode::Buffered => {
                if !self.client.is_connected() {
                    return Err(FabricError::StateMisuse(
                        "write on a disconnected stream".to_string(),
                    ));
                }
                self.drain.send_fifo.append(buf);
                self.kick_drain();
                Ok(())
            }
        }
    }

    /// Ensures exactly one drain task runs at a time; that task chains
    /// itself over whatever is buffered, which is what keeps overlapping
    /// writes from reordering bytes.
    fn kick_drain(&self) {
        {
            let mut active = self.drain.active.lock().unwrap_or_else(|p| p.into_inner());
            if *active {
                return;
            }
            *active = true;
        }
        let client = self.client.clone();
        let drain = self.drain.clone();
        tokio::spawn(drain_loop(client, drain));
    }

    /// Blocks until the send FIFO is empty and no drain is in flight.
    /// Fails if the client disconnects mid-flush.
    pub async fn flush(&self) -> Result<(), FabricError> {
        if self.mode == WriteMode::Direct {
            return Ok(());
        }
        loop {
            let mut drained = std::pin::pin!(self.drain.drained.notified());
            drained.as_mut().enable();
            let active = *self.drain.active.lock().unwrap_or_else(|p| p.into_inner());
            if !active && self.drain.send_fifo.is_empty() {
                return Ok(());
            }
            if !self.client.is_connected() {
                return Err(FabricError::Transport(
                    std::io::ErrorKind::ConnectionReset.into(),
                ));
            }
            let _ = timeout(READ_WAKE_INTERVAL, drained).await;
        }
    }

    /// Flushes outstanding writes, then closes the client.
    pub async fn close(&self) -> Result<(), FabricError> {
        if let Err(err) = self.flush().await {
            debug!("flush during stream close failed: {err}");
        }
        self.client.close().await
    }
}

/// Dequeues everything buffered and pushes it through the client, one
/// chunk at a time. The active flag flips off only after a final empty
/// re-check, so a write racing the shutdown is never stranded.
async fn drain_loop(client: TcpFabricClient, drain: Arc<DrainState>) {
    loop {
        let chunk = drain.send_fifo.drain();
        if chunk.is_empty() {
            let mut active = drain.active.lock().unwrap_or_else(|p| p.into_inner());
            if drain.send_fifo.is_empty() {
                *active = false;
                drop(active);
                drain.drained.notify_waiters();
                return;
            }
            continue;
        }
        if let Err(err) = client.send(&chunk).await {
            warn!("stream drain failed: {err}");
            {
                let mut active = drain.active.lock().unwrap_or_else(|p| p.into_inner());
                *active = false;
            }
            drain.drained.notify_waiters();
            client.emit_error(&err);
            if let Err(close_error) = client.close().await {
                debug!("close after failed drain also failed: {close_error}");
            }
            return;
        }
    }
}
