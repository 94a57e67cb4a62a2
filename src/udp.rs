//! UDP fabric: an async datagram client and a packet server that tracks a
//! session per remote endpoint and sweeps the idle ones.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use socket2::{Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::UDP_BUFFER_SIZE;
use crate::config::{PacketServerConfig, UdpConfig};
use crate::error::FabricError;
use crate::events::{Callbacks, guard_callback};

pub type EndpointHandler = dyn Fn(SocketAddr) + Send + Sync;
pub type DatagramHandler = dyn Fn(SocketAddr, &[u8]) + Send + Sync;
pub type ErrorHandler = dyn Fn(Option<SocketAddr>, &FabricError) + Send + Sync;
pub type PacketHandler = dyn Fn(&Packet) + Send + Sync;
/// Invoked when a detached send completes, success or not
pub type SendCallback = Box<dyn FnOnce(Result<usize, FabricError>) + Send>;

/// Cadence of the idle-session sweeper
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Creates and binds a datagram socket. IPv6 sockets are always dual-stack
/// so one socket services both families.
fn bind_udp_socket(addr: SocketAddr) -> Result<UdpSocket, FabricError> {
    let sockaddr = socket2::SockAddr::from(addr);
    let socket = Socket::new(sockaddr.domain(), Type::DGRAM, Some(Protocol::UDP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&sockaddr)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

#[derive(Default)]
struct UdpClientEvents {
    connected: Callbacks<EndpointHandler>,
    disconnected: Callbacks<EndpointHandler>,
    received: Callbacks<DatagramHandler>,
    error: Callbacks<ErrorHandler>,
}

struct UdpCore {
    socket: Option<Arc<UdpSocket>>,
    local: Option<SocketAddr>,
    recv_task: Option<JoinHandle<()>>,
    disconnected_fired: bool,
}

struct UdpShared {
    config: UdpConfig,
    core: Mutex<UdpCore>,
    events: UdpClientEvents,
    shutdown: CancellationToken,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl UdpShared {
    fn lock_core(&self) -> MutexGuard<'_, UdpCore> {
        self.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit_error(&self, remote: Option<SocketAddr>, error: &FabricError) {
        for callback in self.events.error.snapshot() {
            if guard_callback(|| callback(remote, error)).is_err() {
                warn!("error handler panicked, dropping the panic");
            }
        }
    }
}

/// An asynchronous UDP endpoint. Stateless with respect to peers: one
/// socket, one outstanding receive, datagrams surfaced through `received`.
#[derive(Clone)]
pub struct UdpFabricClient {
    inner: Arc<UdpShared>,
}

impl Default for UdpFabricClient {
    fn default() -> Self {
        Self::new(UdpConfig::default())
    }
}

impl UdpFabricClient {
    pub fn new(config: UdpConfig) -> Self {
        Self {
            inner: Arc::new(UdpShared {
                config,
                core: Mutex::new(UdpCore {
                    socket: None,
                    local: None,
                    recv_task: None,
                    disconnected_fired: false,
                }),
                events: UdpClientEvents::default(),
                shutdown: CancellationToken::new(),
                bytes_sent: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
            }),
        }
    }

    pub fn on_connected(&self, handler: impl Fn(SocketAddr) + Send + Sync + 'static) {
        self.inner.events.connected.subscribe(Arc::new(handler));
    }

    pub fn on_disconnected(&self, handler: impl Fn(SocketAddr) + Send + Sync + 'static) {
        self.inner.events.disconnected.subscribe(Arc::new(handler));
    }

    pub fn on_received(&self, handler: impl Fn(SocketAddr, &[u8]) + Send + Sync + 'static) {
        self.inner.events.received.subscribe(Arc::new(handler));
    }

    pub fn on_error(&self, handler: impl Fn(Option<SocketAddr>, &FabricError) + Send + Sync + 'static) {
        self.inner.events.error.subscribe(Arc::new(handler));
    }

    /// Binds the socket and starts the receive loop.
    pub fn bind(&self, addr: SocketAddr) -> Result<SocketAddr, FabricError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(FabricError::StateMisuse(
                "client has been closed".to_string(),
            ));
        }
        let socket = Arc::new(bind_udp_socket(addr)?);
        let local = socket.local_addr()?;
        {
            let mut core = self.inner.lock_core();
            if core.socket.is_some() {
                return Err(FabricError::StateMisuse(
                    "client is already bound".to_string(),
                ));
            }
            core.socket = Some(socket.clone());
            core.local = Some(local);
            core.recv_task = Some(tokio::spawn(udp_receive_loop(self.inner.clone(), socket)));
        }
        info!("UDP client bound on {local}");
        for callback in self.inner.events.connected.snapshot() {
            if let Err(panic) = guard_callback(|| callback(local)) {
                self.inner.emit_error(None, &panic);
            }
        }
        Ok(local)
    }

    /// Binds a port without an explicit address family: probes for
    /// dual-stack IPv6 by creating the socket, and falls back to IPv4 when
    /// the OS refuses.
    pub fn bind_port(&self, port: u16, use_ipv6: Option<bool>) -> Result<SocketAddr, FabricError> {
        let v6: SocketAddr = SocketAddr::new(std::net::Ipv6Addr::UNSPECIFIED.into(), port);
        let v4: SocketAddr = SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), port);
        match use_ipv6 {
            Some(true) => self.bind(v6),
            Some(false) => self.bind(v4),
            None => match self.bind(v6) {
                Ok(local) => Ok(local),
                Err(FabricError::Transport(error)) => {
                    debug!("dual-stack bind failed ({error}), falling back to IPv4");
                    self.bind(v4)
                }
                Err(error) => Err(error),
            },
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.lock_core().local
    }

    pub fn is_bound(&self) -> bool {
        self.inner.lock_core().socket.is_some()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.inner.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.inner.bytes_received.load(Ordering::Relaxed)
    }

    /// Sends one datagram. Zero-length payloads are a no-op.
    pub async fn send_to(&self, remote: SocketAddr, bytes: &[u8]) -> Result<usize, FabricError> {
        if bytes.is_empty() {
            return Ok(0);
        }
        let socket = self
            .inner
            .lock_core()
            .socket
            .clone()
            .ok_or_else(|| FabricError::StateMisuse("client is not bound".to_string()))?;
        let sent = match self.inner.config.send_timeout {
            Some(bound) => match timeout(bound, socket.send_to(bytes, remote)).await {
                Ok(result) => result?,
                Err(_) => return Err(FabricError::Timeout(bound)),
            },
            None => socket.send_to(bytes, remote).await?,
        };
        self.inner.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
        trace!("{sent} bytes sent to {remote}");
        Ok(sent)
    }

    /// Fire-and-forget send; the callback runs on completion regardless of
    /// success, and failures also go through the `error` event.
    pub fn send_to_detached(
        &self,
        remote: SocketAddr,
        bytes: Vec<u8>,
        callback: Option<SendCallback>,
    ) {
        let client = self.clone();
        tokio::spawn(async move {
            let result = client.send_to(remote, &bytes).await;
            if let Err(err) = &result {
                client.inner.emit_error(Some(remote), err);
            }
            if let Some(callback) = callback {
                if guard_callback(move || callback(result)).is_err() {
                    warn!("send completion callback panicked");
                }
            }
        });
    }

    /// Idempotent: stops the receive loop, releases the socket, fires
    /// `disconnected` exactly once.
    pub fn close(&self) {
        let (local, fire) = {
            let mut core = self.inner.lock_core();
            let fire = core.socket.is_some() && !core.disconnected_fired;
            if fire {
                core.disconnected_fired = true;
            }
            core.socket = None;
            if let Some(task) = core.recv_task.take() {
                task.abort();
            }
            (core.local, fire)
        };
        self.inner.shutdown.cancel();
        if fire {
            if let Some(local) = local {
                for callback in self.inner.events.disconnected.snapshot() {
                    if let Err(panic) = guard_callback(|| callback(local)) {
                        self.inner.emit_error(None, &panic);
                    }
                }
            }
        }
    }
}

/// The single outstanding receive: one fixed buffer, re-armed by looping,
/// never by recursion.
async fn udp_receive_loop(shared: Arc<UdpShared>, socket: Arc<UdpSocket>) {
    let mut buf = [0u8; UDP_BUFFER_SIZE];
    loop {
        let (len, remote) = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok(value) => value,
                Err(err) => {
                    if shared.shutdown.is_cancelled() {
                        break;
                    }
                    error!("Error receiving via UDP: {err:?}");
                    shared.emit_error(None, &err.into());
                    continue;
                }
            },
        };
        trace!("{len} bytes received from {remote}");
        shared
            .bytes_received
            .fetch_add(len as u64, Ordering::Relaxed);
        for callback in shared.events.received.snapshot() {
            if let Err(panic) = guard_callback(|| callback(remote, &buf[..len])) {
                shared.emit_error(Some(remote), &panic);
            }
        }
    }
    debug!("UDP receive loop finished");
}

/// One datagram as seen by the packet server, with the socket it arrived on
/// so handlers can respond over the session's shared sending socket.
pub struct Packet {
    pub remote: SocketAddr,
    pub data: Vec<u8>,
    socket: Arc<UdpSocket>,
}

impl Packet {
    /// Replies to the sender from inside a packet handler. Fire-and-forget
    /// since handlers are synchronous; failures are logged.
    pub fn respond_detached(&self, bytes: Vec<u8>) {
        let socket = self.socket.clone();
        let remote = self.remote;
        tokio::spawn(async move {
            if let Err(err) = socket.send_to(&bytes, remote).await {
                warn!("reply to {remote} failed: {err:?}");
            }
        });
    }
}

struct SessionEntry {
    last_activity: Instant,
    socket: Arc<UdpSocket>,
}

#[derive(Default)]
struct PacketServerEvents {
    connected: Callbacks<EndpointHandler>,
    packet_received: Callbacks<PacketHandler>,
    timeout: Callbacks<EndpointHandler>,
    error: Callbacks<ErrorHandler>,
}

struct PacketServerShared {
    config: PacketServerConfig,
    sessions: Mutex<HashMap<SocketAddr, SessionEntry>>,
    events: PacketServerEvents,
    shutdown: CancellationToken,
}

impl PacketServerShared {
    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<SocketAddr, SessionEntry>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit_error(&self, remote: Option<SocketAddr>, error: &FabricError) {
        for callback in self.events.error.snapshot() {
            if guard_callback(|| callback(remote, error)).is_err() {
                warn!("error handler panicked, dropping the panic");
            }
        }
    }
}

/// Binds one or more datagram sockets and tracks a session per remote
/// endpoint: created on first sight, refreshed on every packet, swept once
/// idle for longer than the configured timeout.
#[derive(Clone)]
pub struct UdpPacketServer {
    inner: Arc<PacketServerShared>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    sweeper: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl UdpPacketServer {
    pub fn new(config: PacketServerConfig) -> Self {
        Self {
            inner: Arc::new(PacketServerShared {
                config,
                sessions: Mutex::new(HashMap::new()),
                events: PacketServerEvents::default(),
                shutdown: CancellationToken::new(),
            }),
            tasks: Arc::new(Mutex::new(Vec::new())),
            sweeper: Arc::new(Mutex::new(None)),
        }
    }

    pub fn on_connected(&self, handler: impl Fn(SocketAddr) + Send + Sync + 'static) {
        self.inner.events.connected.subscribe(Arc::new(handler));
    }

    pub fn on_packet_received(&self, handler: impl Fn(&Packet) + Send + Sync + 'static) {
        self.inner.events.packet_received.subscribe(Arc::new(handler));
    }

    pub fn on_timeout(&self, handler: impl Fn(SocketAddr) + Send + Sync + 'static) {
        self.inner.events.timeout.subscribe(Arc::new(handler));
    }

    pub fn on_error(&self, handler: impl Fn(Option<SocketAddr>, &FabricError) + Send + Sync + 'static) {
        self.inner.events.error.subscribe(Arc::new(handler));
    }

    /// Binds a listening socket; can be called more than once to service
    /// several endpoints with one session table.
    pub fn bind(&self, addr: SocketAddr) -> Result<SocketAddr, FabricError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(FabricError::StateMisuse(
                "server has been closed".to_string(),
            ));
        }
        let socket = Arc::new(bind_udp_socket(addr)?);
        let local = socket.local_addr()?;
        info!("Started UDP packet listener on {local}");
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        tasks.push(tokio::spawn(packet_loop(self.inner.clone(), socket)));

        let mut sweeper = self.sweeper.lock().unwrap_or_else(|p| p.into_inner());
        if sweeper.is_none() {
            *sweeper = Some(tokio::spawn(sweep_loop(self.inner.clone())));
        }
        Ok(local)
    }

    /// The remotes with a live session right now.
    pub fn sessions(&self) -> Vec<SocketAddr> {
        self.inner.lock_sessions().keys().copied().collect()
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock_sessions().len()
    }

    /// Sends through the session's socket, so replies leave from the
    /// address the remote was talking to.
    pub async fn send_to(&self, remote: SocketAddr, bytes: &[u8]) -> Result<usize, FabricError> {
        let socket = self
            .inner
            .lock_sessions()
            .get(&remote)
            .map(|session| session.socket.clone())
            .ok_or_else(|| {
                FabricError::StateMisuse(format!("no session for {remote}"))
            })?;
        Ok(socket.send_to(bytes, remote).await?)
    }

    /// Idempotent: cancels the listeners and the sweeper, drops all
    /// sessions.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
        if let Some(task) = self.sweeper.lock().unwrap_or_else(|p| p.into_inner()).take() {
            task.abort();
        }
        self.inner.lock_sessions().clear();
    }
}

async fn packet_loop(shared: Arc<PacketServerShared>, socket: Arc<UdpSocket>) {
    let mut buf = [0u8; UDP_BUFFER_SIZE];
    loop {
        let (len, remote) = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok(value) => value,
                Err(err) => {
                    if shared.shutdown.is_cancelled() {
                        break;
                    }
                    error!("Error accepting connection via UDP: {err:?}");
                    shared.emit_error(None, &err.into());
                    continue;
                }
            },
        };
        debug!("{len} bytes received from {remote}");

        let is_new = {
            let mut sessions = shared.lock_sessions();
            match sessions.entry(remote) {
                std::collections::hash_map::Entry::Occupied(mut entry) => {
                    entry.get_mut().last_activity = Instant::now();
                    false
                }
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert(SessionEntry {
                        last_activity: Instant::now(),
                        socket: socket.clone(),
                    });
                    true
                }
            }
        };
        if is_new {
            trace!("new session for {remote}");
            for callback in shared.events.connected.snapshot() {
                if let Err(panic) = guard_callback(|| callback(remote)) {
                    shared.emit_error(Some(remote), &panic);
                }
            }
        }

        let packet = Packet {
            remote,
            data: buf[..len].to_vec(),
            socket: socket.clone(),
        };
        for callback in shared.events.packet_received.snapshot() {
            if let Err(panic) = guard_callback(|| callback(&packet)) {
                shared.emit_error(Some(remote), &panic);
            }
        }
    }
    debug!("packet loop finished");
}

/// Removes sessions whose last activity is older than the configured
/// timeout, closing them and firing `timeout` per remote.
async fn sweep_loop(shared: Arc<PacketServerShared>) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let idle_for = shared.config.timeout;
        let expired: Vec<SocketAddr> = {
            let mut sessions = shared.lock_sessions();
            let expired: Vec<SocketAddr> = sessions
                .iter()
                .filter(|(_, session)| session.last_activity.elapsed() > idle_for)
                .map(|(remote, _)| *remote)
                .collect();
            for remote in &expired {
                sessions.remove(remote);
            }
            expired
        };
        for remote in expired {
            info!("session for {remote} timed out");
            for callback in shared.events.timeout.snapshot() {
                if let Err(panic) = guard_callback(|| callback(remote)) {
                    shared.emit_error(Some(remote), &panic);
                }
            }
        }
    }
}
