use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use socket2::{Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{TcpClientConfig, TcpServerConfig};
use crate::error::FabricError;
use crate::events::{Callbacks, guard_callback};
use crate::tcp::{
    AcceptTasksBusyHandler, ClientAcceptedHandler, ClientExceptionHandler, TcpFabricClient,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ServerState {
    Idle = 0,
    Listening = 1,
    Closed = 2,
}

impl ServerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Listening,
            _ => Self::Closed,
        }
    }
}

#[derive(Default)]
struct ServerEvents {
    client_accepted: Callbacks<ClientAcceptedHandler>,
    client_exception: Callbacks<ClientExceptionHandler>,
    accept_tasks_busy: Callbacks<AcceptTasksBusyHandler>,
}

pub(crate) struct ServerShared {
    config: TcpServerConfig,
    state: AtomicU8,
    clients: StdMutex<HashMap<u64, TcpFabricClient>>,
    waiting_acceptors: AtomicUsize,
    events: ServerEvents,
    shutdown: CancellationToken,
}

impl ServerShared {
    pub(crate) fn remove_client(&self, id: u64) {
        self.clients
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&id);
    }
}

/// Builds the listening socket: dual-stack for IPv6, address reuse off when
/// exclusive use is requested, backlog from the config.
fn bind_listener(addr: SocketAddr, config: &TcpServerConfig) -> Result<TcpListener, FabricError> {
    let sockaddr = socket2::SockAddr::from(addr);
    let socket = Socket::new(sockaddr.domain(), Type::STREAM, Some(Protocol::TCP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.set_reuse_address(!config.exclusive_address_use)?;
    socket.set_nonblocking(true)?;
    socket.bind(&sockaddr)?;
    socket.listen(config.accept_backlog as i32)?;
    Ok(TcpListener::from_std(socket.into())?)
}

/// An asynchronous TCP server: keeps `accept_threads` accepts outstanding
/// against one listener, owns the clients it accepts until they disconnect,
/// are detached, or the server closes.
#[derive(Clone)]
pub struct TcpFabricServer {
    inner: Arc<ServerShared>,
    listener: Arc<StdMutex<Option<Arc<TcpListener>>>>,
    acceptors: Arc<StdMutex<Vec<JoinHandle<()>>>>,
}

impl Default for TcpFabricServer {
    fn default() -> Self {
        Self::new(TcpServerConfig::default())
    }
}

impl TcpFabricServer {
    pub fn new(config: TcpServerConfig) -> Self {
        Self {
            inner: Arc::new(ServerShared {
                config,
                state: AtomicU8::new(ServerState::Idle as u8),
                clients: StdMutex::new(HashMap::new()),
                waiting_acceptors: AtomicUsize::new(0),
                events: ServerEvents::default(),
                shutdown: CancellationToken::new(),
            }),
            listener: Arc::new(StdMutex::new(None)),
            acceptors: Arc::new(StdMutex::new(Vec::new())),
        }
    }

    pub fn config(&self) -> &TcpServerConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
    }

    /// The clients currently owned by this server.
    pub fn clients(&self) -> Vec<TcpFabricClient> {
        self.inner
            .clients
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn client_count(&self) -> usize {
        self.inner
            .clients
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    /// Fired for every accepted client, before its receive pipeline starts,
    /// so handlers can subscribe to the client's events without racing its
    /// first bytes.
    pub fn on_client_accepted(&self, handler: impl Fn(&TcpFabricClient) + Send + Sync + 'static) {
        self.inner.events.client_accepted.subscribe(Arc::new(handler));
    }

    /// Fired when a `client_accepted` handler panics; the client is closed
    /// right after.
    pub fn on_client_exception(
        &self,
        handler: impl Fn(&TcpFabricClient, &FabricError) + Send + Sync + 'static,
    ) {
        self.inner
            .events
            .client_exception
            .subscribe(Arc::new(handler));
    }

    /// Fired when the number of free accept slots drops to zero.
    pub fn on_accept_tasks_busy(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.inner
            .events
            .accept_tasks_busy
            .subscribe(Arc::new(handler));
    }

    /// Binds, listens and spawns the acceptor tasks. One-shot: a closed
    /// server does not come back.
    pub fn listen(&self, addr: SocketAddr) -> Result<SocketAddr, FabricError> {
        if self.state() != ServerState::Idle {
            return Err(FabricError::StateMisuse(format!(
                "listen called in state {:?}",
                self.state()
            )));
        }
        let listener = Arc::new(bind_listener(addr, &self.inner.config)?);
        let local = listener.local_addr()?;
        *self.listener.lock().unwrap_or_else(|p| p.into_inner()) = Some(listener.clone());
        self.inner
            .state
            .store(ServerState::Listening as u8, Ordering::SeqCst);
        info!("Started TCP listener on {local}");

        let mut acceptors = self.acceptors.lock().unwrap_or_else(|p| p.into_inner());
        for index in 0..self.inner.config.accept_threads.max(1) {
            acceptors.push(tokio::spawn(accept_loop(
                self.inner.clone(),
                listener.clone(),
                index,
            )));
        }
        Ok(local)
    }

    /// Listens on a port without an explicit address family, preferring a
    /// dual-stack IPv6 socket and falling back to IPv4.
    pub fn listen_port(&self, port: u16, use_ipv6: Option<bool>) -> Result<SocketAddr, FabricError> {
        let v6 = SocketAddr::new(std::net::Ipv6Addr::UNSPECIFIED.into(), port);
        let v4 = SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), port);
        match use_ipv6 {
            Some(true) => self.listen(v6),
            Some(false) => self.listen(v4),
            None => match self.listen(v6) {
                Ok(local) => Ok(local),
                Err(FabricError::Transport(err)) => {
                    debug!("dual-stack listen failed ({err}), falling back to IPv4");
                    self.listen(v4)
                }
                Err(err) => Err(err),
            },
        }
    }

    /// Cancels all accepts, closes the listening socket and every tracked
    /// client. Idempotent.
    pub async fn close(&self) {
        self.inner
            .state
            .store(ServerState::Closed as u8, Ordering::SeqCst);
        self.inner.shutdown.cancel();
        {
            let mut acceptors = self.acceptors.lock().unwrap_or_else(|p| p.into_inner());
            for task in acceptors.drain(..) {
                task.abort();
            }
        }
        *self.listener.lock().unwrap_or_else(|p| p.into_inner()) = None;

        let clients: Vec<TcpFabricClient> = {
            let mut clients = self.inner.clients.lock().unwrap_or_else(|p| p.into_inner());
            clients.drain().map(|(_, client)| client).collect()
        };
        for client in clients {
            if let Err(err) = client.close().await {
                warn!("closing client {} during server close failed: {err}", client.id());
            }
        }
    }
}

/// One accept slot. Accepts in a loop (synchronous completions iterate, the
/// stack never deepens) and hands connections to [handle_accept].
async fn accept_loop(shared: Arc<ServerShared>, listener: Arc<TcpListener>, index: usize) {
    loop {
        shared.waiting_acceptors.fetch_add(1, Ordering::SeqCst);
        let accepted = tokio::select! {
            _ = shared.shutdown.cancelled() => {
                shared.waiting_acceptors.fetch_sub(1, Ordering::SeqCst);
                break;
            }
            result = listener.accept() => result,
        };
        if shared.waiting_acceptors.fetch_sub(1, Ordering::SeqCst) == 1 {
            // the last free accept slot just went busy
            for callback in shared.events.accept_tasks_busy.snapshot() {
                if guard_callback(|| callback()).is_err() {
                    warn!("accept_tasks_busy handler panicked");
                }
            }
        }
        match accepted {
            Ok((stream, remote)) => {
                debug!("TCP connection from {remote:?} on acceptor {index}");
                if let Err(err) = handle_accept(&shared, stream).await {
                    error!("accept handling failed: {err}");
                }
            }
            Err(err) => {
                error!("Couldn't accept TCP connection: {err:?}");
                continue;
            }
        }
    }
    debug!("acceptor {index} finished");
}

async fn handle_accept(shared: &Arc<ServerShared>, stream: TcpStream) -> Result<(), FabricError> {
    let client_config = TcpClientConfig {
        buffer_size: shared.config.buffer_size,
        receive_timeout: shared.config.receive_timeout,
        send_timeout: shared.config.send_timeout,
        ..TcpClientConfig::default()
    };
    let client = TcpFabricClient::from_accepted(stream, client_config, Arc::downgrade(shared))?;

    // drop the client from the set once it disconnects
    let id = client.id();
    let server = Arc::downgrade(shared);
    client.on_disconnected(move || {
        if let Some(server) = server.upgrade() {
            server.remove_client(id);
        }
    });
    shared
        .clients
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .insert(id, client.clone());

    let mut exception: Option<FabricError> = None;
    for callback in shared.events.client_accepted.snapshot() {
        if let Err(panic) = guard_callback(|| callback(&client)) {
            exception = Some(panic);
            break;
        }
    }
    if let Some(err) = exception {
        warn!("client_accepted handler failed: {err}");
        for callback in shared.events.client_exception.snapshot() {
            if guard_callback(|| callback(&client, &err)).is_err() {
                warn!("client_exception handler panicked");
            }
        }
        if let Err(close_error) = client.close().await {
            warn!("closing client after handler failure also failed: {close_error}");
        }
        return Ok(());
    }

    client.start_receive().await?;
    Ok(())
}
