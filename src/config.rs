use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The default port for DNS
pub const DNS_PORT: u16 = 53;

fn default_accept_threads() -> usize {
    std::thread::available_parallelism()
        .map(|cores| cores.get() * 2)
        .unwrap_or(4)
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
/// Per-client knobs for the TCP fabric. Socket options are cached here and
/// pushed onto the socket when the client connects.
pub struct TcpClientConfig {
    /// Receive buffer per completion, also the stream chunk size
    pub buffer_size: usize,
    /// How long a connect may take before it fails
    pub connect_timeout: Duration,
    /// Bound on taking the instance lock. Tripping it means a handler is
    /// re-entering the client.
    pub deadlock_timeout: Duration,
    /// How long a stream read waits for data, `None` waits forever
    pub receive_timeout: Option<Duration>,
    /// How long a send may take, `None` waits forever
    pub send_timeout: Option<Duration>,
    /// IP TTL for outgoing packets, `None` keeps the OS default
    pub ttl: Option<u32>,
    /// Disable Nagle's algorithm
    pub nodelay: bool,
    /// SO_LINGER, installed on every connect or accept; `None` explicitly
    /// disables lingering
    pub linger: Option<Duration>,
}

impl Default for TcpClientConfig {
    fn default() -> Self {
        Self {
            buffer_size: 64 * 1024,
            connect_timeout: Duration::from_secs(5),
            deadlock_timeout: Duration::from_secs(1),
            receive_timeout: None,
            send_timeout: None,
            ttl: None,
            nodelay: false,
            linger: None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
/// Per-server knobs for the TCP fabric, immutable once listening.
pub struct TcpServerConfig {
    /// Backlog handed to listen()
    pub accept_backlog: u32,
    /// Number of concurrently outstanding accepts, defaults to twice the
    /// CPU count
    #[serde(default = "default_accept_threads")]
    pub accept_threads: usize,
    /// Buffer size installed on every accepted client
    pub buffer_size: usize,
    /// Refuse to share the listening address with other sockets
    pub exclusive_address_use: bool,
    /// Receive timeout installed on every accepted client
    pub receive_timeout: Option<Duration>,
    /// Send timeout installed on every accepted client
    pub send_timeout: Option<Duration>,
}

impl Default for TcpServerConfig {
    fn default() -> Self {
        Self {
            accept_backlog: 128,
            accept_threads: default_accept_threads(),
            buffer_size: 64 * 1024,
            exclusive_address_use: false,
            receive_timeout: None,
            send_timeout: None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq, Eq)]
/// Per-client knobs for the UDP fabric.
pub struct UdpConfig {
    /// How long a receive may wait, `None` waits forever
    pub receive_timeout: Option<Duration>,
    /// How long a send may wait, `None` waits forever
    pub send_timeout: Option<Duration>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
/// Knobs for the UDP packet server.
pub struct PacketServerConfig {
    /// Sessions idle for longer than this are swept and closed
    pub timeout: Duration,
}

impl Default for PacketServerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
/// Knobs for the stub resolver.
pub struct ResolverConfig {
    /// Upstream servers, tried in order by [crate::resolver::Resolver::resolve]
    pub servers: Vec<SocketAddr>,
    /// Ask over UDP first
    pub use_udp: bool,
    /// Ask over TCP, either directly or as the truncation fallback
    pub use_tcp: bool,
    /// Per-attempt timeout
    pub query_timeout: Duration,
    /// Extra attempts per server after the first, each with a fresh
    /// transaction id
    pub retries: u32,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            servers: vec![],
            use_udp: true,
            use_tcp: true,
            query_timeout: Duration::from_secs(5),
            retries: 2,
        }
    }
}

impl ResolverConfig {
    /// Configuration for a set of upstream addresses on the standard port.
    pub fn with_servers(addresses: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            servers: addresses
                .into_iter()
                .map(|ip| SocketAddr::new(ip, DNS_PORT))
                .collect(),
            ..Self::default()
        }
    }
}
