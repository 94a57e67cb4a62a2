//! Stub resolver: builds queries, pushes them at the configured upstreams
//! over UDP and TCP, and retries with fresh transaction ids until something
//! well-formed comes back.
//!
//! TCP framing per [RFC7766](https://www.rfc-editor.org/rfc/rfc7766): a
//! big-endian 16 bit length prefixes every message.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{Instant, timeout};
use tracing::{debug, instrument, trace, warn};

use crate::config::ResolverConfig;
use crate::enums::{Rcode, RecordClass, RecordType};
use crate::error::FabricError;
use crate::message::Message;
use crate::name::{DomainName, reverse_name};
use crate::resourcerecord::RecordData;
use crate::utils::{get_query_id, hexdump};
use crate::{DNS_UDP_PAYLOAD, Header, Question};

/// The resolver-level view of a host: its canonical name, any aliases seen
/// along the way, and its addresses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostEntry {
    pub hostname: DomainName,
    pub aliases: Vec<DomainName>,
    pub addresses: Vec<IpAddr>,
}

pub struct Resolver {
    config: ResolverConfig,
    /// Transaction ids currently on the wire; ids are unique within one
    /// resolver instance so a parallel fan-out can't cross its answers.
    inflight: Mutex<HashSet<u16>>,
}

impl Resolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self {
            config,
            inflight: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Returns the first successful response: servers are tried in
    /// configuration order, each with the full retry budget, and the first
    /// well-formed non-error answer wins. With no winner the last error is
    /// surfaced.
    #[instrument(level = "debug", skip(self))]
    pub async fn resolve(&self, name: &str, qtype: RecordType) -> Result<Message, FabricError> {
        self.ensure_servers()?;
        let question = build_question(name, qtype);
        let mut last_error: Option<FabricError> = None;

        for server in &self.config.servers {
            match self.query_server(*server, &question).await {
                Ok(reply) if reply.rcode() == Rcode::NoError => return Ok(reply),
                Ok(reply) => {
                    debug!("server {server} answered {:?}", reply.rcode());
                    last_error = Some(FabricError::ErrorResponse(reply.rcode()));
                }
                Err(error) => {
                    warn!("server {server} failed: {error}");
                    last_error = Some(error);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            FabricError::StateMisuse("resolver has no servers configured".to_string())
        }))
    }

    /// Queries every configured server in parallel and returns the
    /// well-formed non-error responses in arrival order, the same success
    /// bar [Resolver::resolve] applies per server. No such response from
    /// any server is a failure surfacing the last error.
    #[instrument(level = "debug", skip(self))]
    pub async fn resolve_all(
        &self,
        name: &str,
        qtype: RecordType,
    ) -> Result<Vec<Message>, FabricError> {
        self.ensure_servers()?;
        let question = build_question(name, qtype);

        let mut in_flight: FuturesUnordered<_> = self
            .config
            .servers
            .iter()
            .map(|server| self.query_server(*server, &question))
            .collect();

        let mut responses = Vec::new();
        let mut last_error: Option<FabricError> = None;
        while let Some(result) = in_flight.next().await {
            match result {
                Ok(reply) if reply.rcode() == Rcode::NoError => responses.push(reply),
                Ok(reply) => {
                    debug!("resolve_all server answered {:?}", reply.rcode());
                    last_error = Some(FabricError::ErrorResponse(reply.rcode()));
                }
                Err(error) => {
                    warn!("resolve_all server failure: {error}");
                    last_error = Some(error);
                }
            }
        }
        if responses.is_empty() {
            return Err(last_error.unwrap_or_else(|| {
                FabricError::StateMisuse("resolver has no servers configured".to_string())
            }));
        }
        Ok(responses)
    }

    /// Every address the upstreams know for `name`, A then AAAA. One record
    /// family failing is fine as long as the other answers.
    pub async fn get_host_addresses(&self, name: &str) -> Result<Vec<IpAddr>, FabricError> {
        let v4 = self.resolve(name, RecordType::A).await;
        let v6 = self.resolve(name, RecordType::AAAA).await;

        let mut addresses = Vec::new();
        match (v4, v6) {
            (Err(error), Err(_)) => return Err(error),
            (v4, v6) => {
                if let Ok(reply) = v4 {
                    addresses.extend(reply.addresses());
                }
                if let Ok(reply) = v6 {
                    addresses.extend(reply.addresses());
                }
            }
        }
        Ok(addresses)
    }

    /// Resolves a name or a literal address into a [HostEntry]. Address
    /// input does a PTR lookup on the reverse name.
    pub async fn get_host_entry(&self, host: &str) -> Result<HostEntry, FabricError> {
        if let Ok(address) = host.parse::<IpAddr>() {
            let reply = self
                .resolve(reverse_name(address).as_str(), RecordType::PTR)
                .await?;
            let hostname = reply
                .answers
                .iter()
                .find_map(|record| match &record.data {
                    RecordData::PTR(target) => Some(target.clone()),
                    _ => None,
                })
                .ok_or_else(|| {
                    FabricError::ProtocolParse("PTR response with no PTR answer".to_string())
                })?;
            return Ok(HostEntry {
                hostname,
                aliases: vec![],
                addresses: vec![address],
            });
        }

        let reply = self.resolve(host, RecordType::A).await?;
        let aliases = reply.canonical_names();
        let mut addresses = reply.addresses();
        if let Ok(reply_v6) = self.resolve(host, RecordType::AAAA).await {
            addresses.extend(reply_v6.addresses());
        }
        // the canonical name is the tail of the alias chain
        let hostname = aliases
            .last()
            .cloned()
            .unwrap_or_else(|| DomainName::from(host));
        Ok(HostEntry {
            hostname,
            aliases,
            addresses,
        })
    }

    /// One server, full retry budget. Every attempt gets a fresh
    /// transaction id so a late reply to an abandoned attempt can't be
    /// mistaken for the current one.
    async fn query_server(
        &self,
        server: SocketAddr,
        question: &Question,
    ) -> Result<Message, FabricError> {
        let mut last_error: Option<FabricError> = None;
        for attempt in 0..=self.config.retries {
            let id = self.allocate_id();
            let query = build_query(id, question);
            let result = self.exchange(server, &query).await;
            self.release_id(id);
            match result {
                Ok(reply) => return Ok(reply),
                Err(error) if error.is_retryable() => {
                    debug!("attempt {attempt} against {server} failed: {error}");
                    last_error = Some(error);
                }
                Err(error) => return Err(error),
            }
        }
        Err(last_error
            .unwrap_or_else(|| FabricError::Timeout(self.config.query_timeout)))
    }

    fn allocate_id(&self) -> u16 {
        let mut inflight = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            let id = rand::random::<u16>();
            if inflight.insert(id) {
                return id;
            }
        }
    }

    fn release_id(&self, id: u16) {
        self.inflight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&id);
    }

    async fn exchange(&self, server: SocketAddr, query: &Message) -> Result<Message, FabricError> {
        if self.config.use_udp {
            return match self.exchange_udp(server, query).await {
                Ok(reply) if reply.is_truncated() && self.config.use_tcp => {
                    debug!("truncated response from {server}, retrying over TCP");
                    self.exchange_tcp(server, query).await
                }
                Ok(reply) => Ok(reply),
                Err(error) if self.config.use_tcp => {
                    debug!("UDP exchange with {server} failed ({error}), trying TCP");
                    self.exchange_tcp(server, query).await
                }
                Err(error) => Err(error),
            };
        }
        if self.config.use_tcp {
            return self.exchange_tcp(server, query).await;
        }
        Err(FabricError::StateMisuse(
            "resolver has neither UDP nor TCP enabled".to_string(),
        ))
    }

    async fn exchange_udp(
        &self,
        server: SocketAddr,
        query: &Message,
    ) -> Result<Message, FabricError> {
        let bind_addr: SocketAddr = if server.is_ipv6() {
            "[::]:0".parse().map_err(|_| {
                FabricError::StateMisuse("failed to parse wildcard bind address".to_string())
            })?
        } else {
            "0.0.0.0:0".parse().map_err(|_| {
                FabricError::StateMisuse("failed to parse wildcard bind address".to_string())
            })?
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(server).await?;
        let query_bytes = query.to_bytes()?;
        socket.send(&query_bytes).await?;

        let deadline = Instant::now() + self.config.query_timeout;
        let mut buf = [0u8; DNS_UDP_PAYLOAD];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(FabricError::Timeout(self.config.query_timeout));
            }
            let len = match timeout(remaining, socket.recv(&mut buf)).await {
                Ok(Ok(len)) => len,
                Ok(Err(error)) => return Err(error.into()),
                Err(_) => return Err(FabricError::Timeout(self.config.query_timeout)),
            };
            trace!("{len} bytes received from {server}");

            // cheap transaction-id peek first, late replies to an abandoned
            // attempt are skipped without a full parse
            let reply_id = get_query_id(&buf[..len])?;
            if reply_id != query.header.id {
                trace!("discarding reply with transaction id {reply_id} (wanted {})", query.header.id);
                continue;
            }
            // a malformed reply is discarded and charged to the retry budget
            let reply = Message::from_bytes(&buf[..len])?;
            match (reply.first_question(), query.first_question()) {
                (Some(theirs), Some(ours)) if ours.matches(theirs) => {}
                _ => {
                    trace!("discarding reply whose question does not match");
                    continue;
                }
            }
            return Ok(reply);
        }
    }

    async fn exchange_tcp(
        &self,
        server: SocketAddr,
        query: &Message,
    ) -> Result<Message, FabricError> {
        let per_attempt = self.config.query_timeout;
        let mut stream = match timeout(per_attempt, TcpStream::connect(server)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(error)) => return Err(error.into()),
            Err(_) => return Err(FabricError::Timeout(per_attempt)),
        };

        let query_bytes = query.to_bytes()?;
        let mut framed = Vec::with_capacity(query_bytes.len() + 2);
        framed.extend((query_bytes.len() as u16).to_be_bytes());
        framed.extend(&query_bytes);

        let reply_bytes = match timeout(per_attempt, async {
            stream.write_all(&framed).await?;
            let reply_len: usize = stream.read_u16().await?.into();
            trace!("reply_len={reply_len}");
            let mut reply = vec![0u8; reply_len];
            stream.read_exact(&mut reply).await?;
            Ok::<Vec<u8>, std::io::Error>(reply)
        })
        .await
        {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(error)) => return Err(error.into()),
            Err(_) => return Err(FabricError::Timeout(per_attempt)),
        };
        trace!("TCP reply from {server}:\n{}", hexdump(&reply_bytes));

        let reply = Message::from_bytes(&reply_bytes)?;
        if reply.header.id != query.header.id {
            return Err(FabricError::ProtocolParse(format!(
                "TCP reply carries transaction id {}, wanted {}",
                reply.header.id, query.header.id
            )));
        }
        Ok(reply)
    }

    fn ensure_servers(&self) -> Result<(), FabricError> {
        if self.config.servers.is_empty() {
            return Err(FabricError::StateMisuse(
                "resolver has no servers configured".to_string(),
            ));
        }
        Ok(())
    }
}

fn build_question(name: &str, qtype: RecordType) -> Question {
    Question {
        qname: DomainName::from(name),
        qtype,
        qclass: RecordClass::Internet,
    }
}

fn build_query(id: u16, question: &Question) -> Message {
    Message {
        header: Header {
            id,
            recursion_desired: true,
            qdcount: 1,
            ..Header::default()
        },
        questions: vec![question.clone()],
        answers: vec![],
        authorities: vec![],
        additionals: vec![],
    }
}
