use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use crate::config::TcpClientConfig;
use crate::error::FabricError;
use crate::events::{Callbacks, guard_callback};
use crate::fifo::ByteFifo;
use crate::tcp::server::ServerShared;
use crate::tcp::stream::{FabricStream, WriteMode};
use crate::tcp::{
    BufferedHandler, ClientState, ConnectedHandler, DisconnectedHandler, ErrorHandler,
    ReceivedHandler, SendCallback,
};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
struct ClientEvents {
    connected: Callbacks<ConnectedHandler>,
    disconnected: Callbacks<DisconnectedHandler>,
    received: Callbacks<ReceivedHandler>,
    buffered: Callbacks<BufferedHandler>,
    error: Callbacks<ErrorHandler>,
}

/// Everything guarded by the instance lock (`sync`). Entry points acquire
/// it through the deadlock guard; the receive loop holds it while firing
/// `received` handlers.
struct ClientCore {
    writer: Option<OwnedWriteHalf>,
    /// An accepted connection's read half, parked until the server starts
    /// the receive pipeline
    pending_reader: Option<OwnedReadHalf>,
    recv_task: Option<JoinHandle<()>>,
    connected_fired: bool,
    disconnected_fired: bool,
}

pub(crate) struct ClientShared {
    id: u64,
    config: TcpClientConfig,
    sync: Mutex<ClientCore>,
    /// Mirror of the state machine for lock-free reads; transitions only
    /// happen while `sync` is held
    state: AtomicU8,
    endpoints: StdMutex<(Option<SocketAddr>, Option<SocketAddr>)>,
    recv_fifo: ByteFifo,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    pending_async_sends: AtomicUsize,
    events: ClientEvents,
    server: StdMutex<Option<Weak<ServerShared>>>,
}

impl ClientShared {
    fn set_state(&self, state: ClientState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn state(&self) -> ClientState {
        ClientState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn emit_error(&self, error: &FabricError) {
        for callback in self.events.error.snapshot() {
            if guard_callback(|| callback(error)).is_err() {
                warn!("error handler panicked, dropping the panic");
            }
        }
    }

    fn emit_disconnected(&self) {
        for callback in self.events.disconnected.snapshot() {
            if let Err(panic) = guard_callback(|| callback()) {
                self.emit_error(&panic);
            }
        }
    }
}

/// An asynchronous TCP client. Cheap to clone; clones share the connection.
///
/// One receive completion is outstanding at any time, so `received`
/// handlers are never re-entered for the same client. Writes issued through
/// [TcpFabricClient::send] are serialized under the instance lock and
/// arrive contiguously.
#[derive(Clone)]
pub struct TcpFabricClient {
    inner: Arc<ClientShared>,
}

impl Default for TcpFabricClient {
    fn default() -> Self {
        Self::new(TcpClientConfig::default())
    }
}

impl TcpFabricClient {
    pub fn new(config: TcpClientConfig) -> Self {
        Self::build(config, ClientState::Created, None, None, None)
    }

    fn build(
        config: TcpClientConfig,
        state: ClientState,
        writer: Option<OwnedWriteHalf>,
        pending_reader: Option<OwnedReadHalf>,
        server: Option<Weak<ServerShared>>,
    ) -> Self {
        Self {
            inner: Arc::new(ClientShared {
                id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
                config,
                sync: Mutex::new(ClientCore {
                    writer,
                    pending_reader,
                    recv_task: None,
                    connected_fired: false,
                    disconnected_fired: false,
                }),
                state: AtomicU8::new(state as u8),
                endpoints: StdMutex::new((None, None)),
                recv_fifo: ByteFifo::new(),
                bytes_sent: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
                pending_async_sends: AtomicUsize::new(0),
                events: ClientEvents::default(),
                server: StdMutex::new(server),
            }),
        }
    }

    /// Wraps a connection handed over by a server's acceptor. The receive
    /// pipeline stays parked until [TcpFabricClient::start_receive].
    pub(crate) fn from_accepted(
        stream: TcpStream,
        config: TcpClientConfig,
        server: Weak<ServerShared>,
    ) -> Result<Self, FabricError> {
        apply_socket_options(&config, &stream)?;
        let local = stream.local_addr().ok();
        let remote = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        let client = Self::build(
            config,
            ClientState::Connected,
            Some(writer),
            Some(reader),
            Some(server),
        );
        *client.inner.endpoints.lock().unwrap_or_else(|p| p.into_inner()) = (local, remote);
        Ok(client)
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn config(&self) -> &TcpClientConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ClientState {
        self.inner.state()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state() == ClientState::Connected
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.endpoints.lock().unwrap_or_else(|p| p.into_inner()).0
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.endpoints.lock().unwrap_or_else(|p| p.into_inner()).1
    }

    /// Monotone count of payload bytes successfully handed to the OS.
    pub fn bytes_sent(&self) -> u64 {
        self.inner.bytes_sent.load(Ordering::Relaxed)
    }

    /// Monotone count of payload bytes surfaced by receive completions.
    pub fn bytes_received(&self) -> u64 {
        self.inner.bytes_received.load(Ordering::Relaxed)
    }

    /// Detached sends currently in flight.
    pub fn pending_async_sends(&self) -> usize {
        self.inner.pending_async_sends.load(Ordering::SeqCst)
    }

    /// True while the client sits in a server's client set.
    pub fn is_server_client(&self) -> bool {
        self.inner
            .server
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }

    /// Severs the back-reference to the owning server, so this client
    /// outlives the server's close.
    pub fn detach(&self) {
        let server = self
            .inner
            .server
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(server) = server.and_then(|weak| weak.upgrade()) {
            server.remove_client(self.inner.id);
        }
    }

    pub fn on_connected(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.inner.events.connected.subscribe(Arc::new(handler));
    }

    pub fn on_disconnected(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.inner.events.disconnected.subscribe(Arc::new(handler));
    }

    /// Subscribe to raw receive completions. Returning `true` marks the
    /// bytes handled; otherwise they land in the receive FIFO for stream
    /// readers.
    pub fn on_received(&self, handler: impl Fn(&[u8]) -> bool + Send + Sync + 'static) {
        self.inner.events.received.subscribe(Arc::new(handler));
    }

    pub fn on_buffered(&self, handler: impl Fn(usize) + Send + Sync + 'static) {
        self.inner.events.buffered.subscribe(Arc::new(handler));
    }

    pub fn on_error(&self, handler: impl Fn(&FabricError) + Send + Sync + 'static) {
        self.inner.events.error.subscribe(Arc::new(handler));
    }

    /// Connects to an endpoint within the configured connect timeout. A
    /// failed connect leaves the client closed and safe to discard.
    pub async fn connect(&self, remote: SocketAddr) -> Result<(), FabricError> {
        self.connect_inner(&[remote]).await
    }

    /// Resolves `host` through the platform resolver and tries every
    /// returned address in order.
    pub async fn connect_host(&self, host: &str, port: u16) -> Result<(), FabricError> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
        if addrs.is_empty() {
            return Err(FabricError::Transport(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no addresses for {host}"),
            )));
        }
        self.connect_inner(&addrs).await
    }

    /// Fire-and-forget connect; the outcome arrives via `connected` or
    /// `error`.
    pub fn spawn_connect(&self, remote: SocketAddr) {
        let client = self.clone();
        tokio::spawn(async move {
            if let Err(err) = client.connect(remote).await {
                error!("background connect to {remote} failed: {err}");
                client.inner.emit_error(&err);
            }
        });
    }

    async fn connect_inner(&self, addrs: &[SocketAddr]) -> Result<(), FabricError> {
        let connect_timeout = self.inner.config.connect_timeout;
        let mut core = self.lock_guarded().await?;
        if self.inner.state() != ClientState::Created {
            return Err(FabricError::StateMisuse(format!(
                "connect called in state {}",
                self.inner.state()
            )));
        }
        self.inner.set_state(ClientState::Connecting);

        let mut last_error: Option<FabricError> = None;
        for addr in addrs {
            trace!("connecting to {addr}");
            match timeout(connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    if let Err(err) = self.finish_connect(&mut core, stream) {
                        self.inner.set_state(ClientState::Closing);
                        self.inner.set_state(ClientState::Closed);
                        return Err(err);
                    }
                    core.connected_fired = true;
                    drop(core);
                    info!("connected to {addr}");
                    for callback in self.inner.events.connected.snapshot() {
                        if let Err(panic) = guard_callback(|| callback()) {
                            self.inner.emit_error(&panic);
                        }
                    }
                    return Ok(());
                }
                Ok(Err(err)) => {
                    debug!("connect to {addr} failed: {err:?}");
                    last_error = Some(FabricError::Transport(err));
                }
                Err(_) => {
                    debug!("connect to {addr} timed out");
                    last_error = Some(FabricError::Timeout(connect_timeout));
                }
            }
        }
        self.inner.set_state(ClientState::Closing);
        self.inner.set_state(ClientState::Closed);
        Err(last_error.unwrap_or_else(|| FabricError::Timeout(connect_timeout)))
    }

    fn finish_connect(
        &self,
        core: &mut ClientCore,
        stream: TcpStream,
    ) -> Result<(), FabricError> {
        apply_socket_options(&self.inner.config, &stream)?;
        let local = stream.local_addr().ok();
        let remote = stream.peer_addr().ok();
        *self.inner.endpoints.lock().unwrap_or_else(|p| p.into_inner()) = (local, remote);
        let (reader, writer) = stream.into_split();
        core.writer = Some(writer);
        self.inner.set_state(ClientState::Connected);
        core.recv_task = Some(tokio::spawn(receive_loop(self.inner.clone(), reader)));
        Ok(())
    }

    /// Starts the receive pipeline of an accepted client and fires
    /// `connected`. Calling it twice is a [FabricError::StateMisuse].
    pub(crate) async fn start_receive(&self) -> Result<(), FabricError> {
        let mut core = self.lock_guarded().await?;
        if self.inner.state() != ClientState::Connected {
            return Err(FabricError::StateMisuse(format!(
                "receive pipeline started on a {} client",
                self.inner.state()
            )));
        }
        let reader = core.pending_reader.take().ok_or_else(|| {
            FabricError::StateMisuse("receive pipeline already started".to_string())
        })?;
        core.recv_task = Some(tokio::spawn(receive_loop(self.inner.clone(), reader)));
        core.connected_fired = true;
        drop(core);
        for callback in self.inner.events.connected.snapshot() {
            if let Err(panic) = guard_callback(|| callback()) {
                self.inner.emit_error(&panic);
            }
        }
        Ok(())
    }

    /// Sends the whole buffer, serialized under the instance lock so the
    /// bytes arrive contiguously. Zero-length sends are a no-op.
    pub async fn send(&self, bytes: &[u8]) -> Result<usize, FabricError> {
        if bytes.is_empty() {
            return Ok(0);
        }
        let result = self.send_locked(bytes).await;
        if let Err(FabricError::Transport(_)) = &result {
            // transport failures force the client closed
            if let Err(close_error) = self.close().await {
                warn!("close after failed send also failed: {close_error}");
            }
        }
        result
    }

    async fn send_locked(&self, bytes: &[u8]) -> Result<usize, FabricError> {
        let mut core = self.lock_guarded().await?;
        if self.inner.state() != ClientState::Connected {
            return Err(FabricError::StateMisuse(format!(
                "send called in state {}",
                self.inner.state()
            )));
        }
        let writer = core.writer.as_mut().ok_or_else(|| {
            FabricError::StateMisuse("send called with no writer attached".to_string())
        })?;
        match self.inner.config.send_timeout {
            Some(bound) => match timeout(bound, writer.write_all(bytes)).await {
                Ok(result) => result?,
                Err(_) => return Err(FabricError::Timeout(bound)),
            },
            None => writer.write_all(bytes).await?,
        }
        self.inner
            .bytes_sent
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        trace!("{} bytes sent", bytes.len());
        Ok(bytes.len())
    }

    /// Fire-and-forget send. The pending counter is bumped before the task
    /// is spawned; the callback runs on completion regardless of success,
    /// and failures are also surfaced through `error`.
    pub fn send_detached(&self, bytes: Vec<u8>, callback: Option<SendCallback>) {
        self.inner.pending_async_sends.fetch_add(1, Ordering::SeqCst);
        let client = self.clone();
        tokio::spawn(async move {
            let result = client.send(&bytes).await;
            client
                .inner
                .pending_async_sends
                .fetch_sub(1, Ordering::SeqCst);
            if let Err(err) = &result {
                client.inner.emit_error(err);
            }
            if let Some(callback) = callback {
                if guard_callback(move || callback(result)).is_err() {
                    warn!("send completion callback panicked");
                }
            }
        });
    }

    /// The stream view over this client, buffered writes by default.
    pub fn stream(&self) -> FabricStream {
        FabricStream::new(self.clone(), WriteMode::Buffered)
    }

    pub fn stream_with_mode(&self, mode: WriteMode) -> FabricStream {
        FabricStream::new(self.clone(), mode)
    }

    /// Idempotent close: shuts down both directions, releases the socket,
    /// fires `disconnected` exactly once and only if `connected` fired.
    ///
    /// Fails with [FabricError::Deadlock] when the instance lock can't be
    /// taken, which is what happens when a `received` handler blocks
    /// forever.
    pub async fn close(&self) -> Result<(), FabricError> {
        let mut core = self.lock_guarded().await?;
        match self.inner.state() {
            ClientState::Closed | ClientState::Closing => return Ok(()),
            ClientState::Created => {
                self.inner.set_state(ClientState::Closed);
                return Ok(());
            }
            ClientState::Connecting | ClientState::Connected => {}
        }
        self.inner.set_state(ClientState::Closing);
        if let Some(mut writer) = core.writer.take() {
            if let Err(err) = writer.shutdown().await {
                debug!("socket shutdown during close failed: {err:?}");
            }
        }
        core.pending_reader = None;
        if let Some(task) = core.recv_task.take() {
            task.abort();
        }
        self.inner.set_state(ClientState::Closed);
        let fire = core.connected_fired && !core.disconnected_fired;
        if fire {
            core.disconnected_fired = true;
        }
        drop(core);

        // blocked stream readers wake up and observe EOF
        self.inner.recv_fifo.wake_waiters();
        if fire {
            self.inner.emit_disconnected();
        }
        Ok(())
    }

    pub(crate) fn recv_fifo(&self) -> &ByteFifo {
        &self.inner.recv_fifo
    }

    pub(crate) fn emit_error(&self, error: &FabricError) {
        self.inner.emit_error(error);
    }

    async fn lock_guarded(&self) -> Result<tokio::sync::MutexGuard<'_, ClientCore>, FabricError> {
        let bound = self.inner.config.deadlock_timeout;
        timeout(bound, self.inner.sync.lock())
            .await
            .map_err(|_| FabricError::Deadlock(bound))
    }
}

impl std::fmt::Debug for TcpFabricClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpFabricClient")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state())
            .field("local", &self.local_addr())
            .field("remote", &self.remote_addr())
            .finish()
    }
}

/// The receive pipeline: one outstanding read on one reusable buffer.
/// Synchronously completing reads just go around the loop again, the stack
/// never deepens. The instance lock is held while `received` handlers run
/// and released before the FIFO is touched, FIFO waiters are woken under
/// the FIFO's own lock only.
async fn receive_loop(shared: Arc<ClientShared>, mut reader: OwnedReadHalf) {
    let mut buf = vec![0u8; shared.config.buffer_size.max(1)];
    loop {
        let read_result = reader.read(&mut buf).await;
        let mut core = shared.sync.lock().await;
        if shared.state() != ClientState::Connected {
            debug!("receive loop exiting, client is {}", shared.state());
            break;
        }
        match read_result {
            Ok(0) => {
                // orderly shutdown from the peer
                let fire = finish_disconnect(&shared, &mut core).await;
                drop(core);
                emit_disconnect_events(&shared, fire, None);
                break;
            }
            Ok(len) => {
                shared
                    .bytes_received
                    .fetch_add(len as u64, Ordering::Relaxed);
                let mut handled = false;
                let mut panics: Vec<FabricError> = vec![];
                for callback in shared.events.received.snapshot() {
                    match guard_callback(|| callback(&buf[..len])) {
                        Ok(true) => handled = true,
                        Ok(false) => {}
                        Err(panic) => panics.push(panic),
                    }
                }
                drop(core);
                for panic in &panics {
                    shared.emit_error(panic);
                }
                if !handled {
                    shared.recv_fifo.append(&buf[..len]);
                    for callback in shared.events.buffered.snapshot() {
                        if let Err(panic) = guard_callback(|| callback(len)) {
                            shared.emit_error(&panic);
                        }
                    }
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted
                ) =>
            {
                // a reset during close is the graceful path
                let fire = finish_disconnect(&shared, &mut core).await;
                drop(core);
                emit_disconnect_events(&shared, fire, None);
                break;
            }
            Err(err) => {
                error!("receive completion failed: {err:?}");
                let fire = finish_disconnect(&shared, &mut core).await;
                drop(core);
                emit_disconnect_events(&shared, fire, Some(FabricError::Transport(err)));
                break;
            }
        }
    }
}

/// Transition to closed from inside the receive loop. Returns whether
/// `disconnected` still needs firing; the caller emits events once the
/// instance lock is gone.
async fn finish_disconnect(shared: &Arc<ClientShared>, core: &mut ClientCore) -> bool {
    shared.set_state(ClientState::Closing);
    if let Some(mut writer) = core.writer.take() {
        if let Err(err) = writer.shutdown().await {
            trace!("socket shutdown during disconnect failed: {err:?}");
        }
    }
    core.recv_task = None;
    shared.set_state(ClientState::Closed);
    let fire = core.connected_fired && !core.disconnected_fired;
    if fire {
        core.disconnected_fired = true;
    }
    fire
}

fn emit_disconnect_events(shared: &Arc<ClientShared>, fire: bool, error: Option<FabricError>) {
    shared.recv_fifo.wake_waiters();
    if let Some(error) = &error {
        shared.emit_error(error);
    }
    if fire {
        shared.emit_disconnected();
    }
}

/// Pushes the cached option set onto a socket, used at connect time and on
/// accepted connections before the stream is split. Linger is always set
/// explicitly; `None` disables SO_LINGER rather than leaving whatever the
/// platform default happens to be.
fn apply_socket_options(config: &TcpClientConfig, stream: &TcpStream) -> Result<(), FabricError> {
    if let Some(ttl) = config.ttl {
        stream.set_ttl(ttl)?;
    }
    stream.set_nodelay(config.nodelay)?;
    socket2::SockRef::from(stream).set_linger(config.linger)?;
    Ok(())
}
