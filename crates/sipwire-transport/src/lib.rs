// sipwire - a SIP signaling core in Rust
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! SIP transport layer: channels, outbound routing, and reliable sends.
//!
//! A [`Transport`] owns a set of [`Channel`]s (UDP, TCP, TLS, WebSocket),
//! routes outbound messages to a channel by URI scheme and destination, and
//! runs the retransmit scheduler behind [`Transport::send_reliable`]. Inbound
//! messages from every channel arrive on a single [`InboundMessage`] queue
//! that the transaction layer drains.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use dashmap::DashMap;
use sipwire_core::{Request, Response, UriScheme, ViaHeader, ViaTransport};
use sipwire_dns::{LookupService, QueryKind, TargetTransport};
use sipwire_parse::{serialize_request, serialize_response};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod conn;
pub mod retransmit;
pub mod tcp;
pub mod tls;
pub mod udp;
pub mod ws;

pub use retransmit::{RetransmitEvent, RetransmitHandle};
pub use tcp::TcpChannel;
pub use tls::{TlsChannel, TlsClientContext};
pub use udp::UdpChannel;
pub use ws::WsChannel;

/// Capacity of the shared inbound message queue.
const INBOUND_QUEUE_DEPTH: usize = 256;

/// Transport protocol of a channel or endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Udp,
    Tcp,
    Tls,
    Ws,
    Wss,
}

impl TransportKind {
    /// Lowercase label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Udp => "udp",
            TransportKind::Tcp => "tcp",
            TransportKind::Tls => "tls",
            TransportKind::Ws => "ws",
            TransportKind::Wss => "wss",
        }
    }

    /// Via header transport token.
    pub fn via_transport(&self) -> &'static str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
            TransportKind::Tls => "TLS",
            TransportKind::Ws => "WS",
            TransportKind::Wss => "WSS",
        }
    }

    /// Parses a transport token from a Via header or URI parameter.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "udp" => Some(TransportKind::Udp),
            "tcp" => Some(TransportKind::Tcp),
            "tls" => Some(TransportKind::Tls),
            "ws" => Some(TransportKind::Ws),
            "wss" => Some(TransportKind::Wss),
            _ => None,
        }
    }

    /// True for connection-oriented transports.
    pub fn is_stream_based(&self) -> bool {
        !matches!(self, TransportKind::Udp)
    }

    /// True when the transport is encrypted.
    pub fn is_secure(&self) -> bool {
        matches!(self, TransportKind::Tls | TransportKind::Wss)
    }

    /// True when delivery is reliable and retransmit timers collapse to zero.
    pub fn is_reliable(&self) -> bool {
        self.is_stream_based()
    }
}

impl From<ViaTransport> for TransportKind {
    fn from(value: ViaTransport) -> Self {
        match value {
            ViaTransport::Udp => TransportKind::Udp,
            ViaTransport::Tcp => TransportKind::Tcp,
            ViaTransport::Tls => TransportKind::Tls,
            ViaTransport::Ws => TransportKind::Ws,
            ViaTransport::Wss => TransportKind::Wss,
        }
    }
}

impl From<TargetTransport> for TransportKind {
    fn from(value: TargetTransport) -> Self {
        match value {
            TargetTransport::Udp => TransportKind::Udp,
            TargetTransport::Tcp => TransportKind::Tcp,
            TargetTransport::Tls => TransportKind::Tls,
            TargetTransport::Ws => TransportKind::Ws,
            TargetTransport::Wss => TransportKind::Wss,
        }
    }
}

/// A network endpoint as the transport layer sees it.
///
/// `connection_id` disambiguates multiple established streams to the same
/// peer; it is `None` for datagram traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub transport: TransportKind,
    pub addr: SocketAddr,
    pub connection_id: Option<u64>,
}

impl Endpoint {
    pub fn new(transport: TransportKind, addr: SocketAddr) -> Self {
        Self {
            transport,
            addr,
            connection_id: None,
        }
    }

    pub fn with_connection(mut self, id: u64) -> Self {
        self.connection_id = Some(id);
        self
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.transport.as_str(), self.addr)?;
        if let Some(id) = self.connection_id {
            write!(f, "#{}", id)?;
        }
        Ok(())
    }
}

/// One complete SIP message delivered by a channel.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub local: Endpoint,
    pub remote: Endpoint,
    pub payload: Bytes,
    /// Writer for replying on the same stream connection, when one exists.
    pub writer: Option<mpsc::Sender<Bytes>>,
}

/// Lifecycle state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Listening,
    Faulted,
    Closed,
}

/// Contract shared by the four channel variants.
#[async_trait::async_trait]
pub trait Channel: Send + Sync {
    /// Stable identifier for the channel's lifetime.
    fn id(&self) -> u64;

    /// Transport protocol this channel speaks.
    fn kind(&self) -> TransportKind;

    /// Local endpoint the channel is bound to.
    fn local_addr(&self) -> SocketAddr;

    /// Current lifecycle state.
    fn state(&self) -> ChannelState;

    /// Sends one message to the remote endpoint. For stream channels a
    /// `connection_hint` targets an existing connection; without one the
    /// connection table is consulted and an outbound connection opened
    /// lazily.
    async fn send(
        &self,
        remote: SocketAddr,
        payload: Bytes,
        connection_hint: Option<u64>,
    ) -> Result<()>;

    /// Closes the channel and all of its connections.
    fn close(&self);
}

/// Typed transport failures that callers branch on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No registered channel matches the required protocol.
    NoSuitableChannel(TransportKind),
    /// Refusing to open a stream to one of our own listening endpoints.
    LocalLoopback(SocketAddr),
    /// The channel is closed or faulted.
    ChannelUnavailable,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::NoSuitableChannel(kind) => {
                write!(f, "no suitable {} channel", kind.as_str())
            }
            TransportError::LocalLoopback(addr) => {
                write!(f, "destination {} is a local listening endpoint", addr)
            }
            TransportError::ChannelUnavailable => write!(f, "channel unavailable"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Tunables for the transport layer (spec defaults in `Default`).
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub t1: Duration,
    pub t2: Duration,
    pub t4: Duration,
    pub t6: Duration,
    pub max_message_size: usize,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub disable_local_loopback_check: bool,
    /// Requests are steered through this endpoint when set; the Request-URI
    /// is left untouched.
    pub outbound_proxy: Option<Endpoint>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
            t6: Duration::from_secs(32),
            max_message_size: 65_535,
            idle_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            disable_local_loopback_check: false,
            outbound_proxy: None,
        }
    }
}

/// Per-direction wire observers; every method has an empty default.
pub trait TraceHooks: Send + Sync {
    fn request_sent(&self, _remote: &Endpoint, _payload: &[u8]) {}
    fn request_received(&self, _remote: &Endpoint, _payload: &[u8]) {}
    fn response_sent(&self, _remote: &Endpoint, _payload: &[u8]) {}
    fn response_received(&self, _remote: &Endpoint, _payload: &[u8]) {}
    fn retransmit(&self, _remote: &Endpoint, _payload: &[u8]) {}
}

struct NoopHooks;
impl TraceHooks for NoopHooks {}

/// Guard against opening outbound streams to our own listeners.
#[derive(Default)]
pub struct SelfGuard {
    endpoints: DashMap<SocketAddr, ()>,
    disabled: AtomicBool,
}

impl SelfGuard {
    fn register(&self, addr: SocketAddr) {
        self.endpoints.insert(addr, ());
    }

    /// True when `addr` is one of our listening endpoints and the check is
    /// enabled.
    pub fn is_self(&self, addr: SocketAddr) -> bool {
        !self.disabled.load(Ordering::Relaxed) && self.endpoints.contains_key(&addr)
    }

    fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::Relaxed);
    }
}

struct TransportInner {
    config: TransportConfig,
    channels: RwLock<Vec<Arc<dyn Channel>>>,
    self_guard: Arc<SelfGuard>,
    dns: LookupService,
    retransmit: retransmit::RetransmitQueue,
    hooks: RwLock<Arc<dyn TraceHooks>>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    cancel: CancellationToken,
}

/// Channel registry, outbound router, and retransmit scheduler.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl Transport {
    /// Creates a transport and the inbound queue its channels feed.
    pub fn new(config: TransportConfig, dns: LookupService) -> (Self, mpsc::Receiver<InboundMessage>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        let cancel = CancellationToken::new();
        let self_guard = Arc::new(SelfGuard::default());
        self_guard.set_disabled(config.disable_local_loopback_check);

        let retransmit = retransmit::RetransmitQueue::new(config.t1, cancel.clone());
        let transport = Self {
            inner: Arc::new(TransportInner {
                config,
                channels: RwLock::new(Vec::new()),
                self_guard,
                dns,
                retransmit,
                hooks: RwLock::new(Arc::new(NoopHooks)),
                inbound_tx,
                cancel,
            }),
        };
        transport.inner.retransmit.start(transport.clone());
        (transport, inbound_rx)
    }

    /// Returns the configuration this transport runs with.
    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// Returns the DNS lookup service.
    pub fn dns(&self) -> &LookupService {
        &self.inner.dns
    }

    /// Installs wire trace hooks.
    pub fn set_trace_hooks(&self, hooks: Arc<dyn TraceHooks>) {
        *self.inner.hooks.write().expect("hooks lock") = hooks;
    }

    fn hooks(&self) -> Arc<dyn TraceHooks> {
        self.inner.hooks.read().expect("hooks lock").clone()
    }

    /// Binds a UDP channel and registers it.
    pub async fn add_udp(&self, addr: SocketAddr) -> Result<Arc<UdpChannel>> {
        let channel = UdpChannel::bind(
            addr,
            self.inner.inbound_tx.clone(),
            self.inner.config.max_message_size,
            self.inner.cancel.child_token(),
        )
        .await?;
        self.register(channel.clone());
        Ok(channel)
    }

    /// Binds a TCP listener channel and registers it.
    pub async fn add_tcp(&self, addr: SocketAddr) -> Result<Arc<TcpChannel>> {
        let channel = TcpChannel::bind(
            addr,
            self.inner.inbound_tx.clone(),
            &self.inner.config,
            self.inner.self_guard.clone(),
            self.inner.cancel.child_token(),
        )
        .await?;
        self.register(channel.clone());
        Ok(channel)
    }

    /// Binds a TLS listener channel; `client` enables outbound connects.
    pub async fn add_tls(
        &self,
        addr: SocketAddr,
        server: Arc<tokio_rustls::rustls::ServerConfig>,
        client: Option<TlsClientContext>,
    ) -> Result<Arc<TlsChannel>> {
        let channel = TlsChannel::bind(
            addr,
            server,
            client,
            self.inner.inbound_tx.clone(),
            &self.inner.config,
            self.inner.self_guard.clone(),
            self.inner.cancel.child_token(),
        )
        .await?;
        self.register(channel.clone());
        Ok(channel)
    }

    /// Binds a WebSocket channel; a server config upgrades it to WSS.
    pub async fn add_ws(
        &self,
        addr: SocketAddr,
        tls: Option<Arc<tokio_rustls::rustls::ServerConfig>>,
    ) -> Result<Arc<WsChannel>> {
        let channel = WsChannel::bind(
            addr,
            tls,
            self.inner.inbound_tx.clone(),
            &self.inner.config,
            self.inner.self_guard.clone(),
            self.inner.cancel.child_token(),
        )
        .await?;
        self.register(channel.clone());
        Ok(channel)
    }

    fn register(&self, channel: Arc<dyn Channel>) {
        self.inner.self_guard.register(channel.local_addr());
        self.inner
            .channels
            .write()
            .expect("channel registry lock")
            .push(channel);
    }

    /// Selects a registered channel matching the protocol.
    ///
    /// Secured traffic accepts either TLS or WSS channels.
    pub fn select_channel(&self, kind: TransportKind) -> Result<Arc<dyn Channel>> {
        let channels = self.inner.channels.read().expect("channel registry lock");
        let found = channels.iter().find(|c| {
            if c.state() != ChannelState::Listening {
                return false;
            }
            match kind {
                // sips traffic rides TLS or WSS, whichever is registered.
                TransportKind::Tls => {
                    matches!(c.kind(), TransportKind::Tls | TransportKind::Wss)
                }
                other => c.kind() == other,
            }
        });
        found
            .cloned()
            .ok_or_else(|| TransportError::NoSuitableChannel(kind).into())
    }

    /// Maps a destination URI to the protocol its scheme and parameters ask
    /// for: `sips` → TLS (or WSS), `transport=tcp` → TCP, `transport=ws` →
    /// WS, `wss` scheme → WSS, everything else UDP.
    pub fn required_transport(uri: &sipwire_core::SipUri) -> TransportKind {
        match uri.scheme {
            UriScheme::Ws => TransportKind::Ws,
            UriScheme::Wss => TransportKind::Wss,
            UriScheme::Sips => TransportKind::Tls,
            UriScheme::Sip => match uri.transport_param().map(|t| t.to_ascii_lowercase()) {
                Some(t) if t == "tcp" => TransportKind::Tcp,
                Some(t) if t == "tls" => TransportKind::Tls,
                Some(t) if t == "ws" => TransportKind::Ws,
                Some(t) if t == "wss" => TransportKind::Wss,
                _ => TransportKind::Udp,
            },
        }
    }

    /// Serializes and sends a request toward the destination URI, resolving
    /// it first. Returns the endpoint the bytes went to.
    pub async fn send_request(
        &self,
        request: &Request,
        destination: &sipwire_core::SipUri,
    ) -> Result<Endpoint> {
        let payload = serialize_request(request);
        let endpoint = self.route_destination(destination).await?;
        self.transmit(endpoint.transport, endpoint.addr, payload.clone(), None)
            .await?;
        self.hooks().request_sent(&endpoint, &payload);
        Ok(endpoint)
    }

    /// Resolves the destination endpoint for a request URI, honoring the
    /// outbound proxy override.
    pub async fn route_destination(&self, destination: &sipwire_core::SipUri) -> Result<Endpoint> {
        if let Some(proxy) = self.inner.config.outbound_proxy {
            debug!(%proxy, uri = destination.as_str(), "routing via outbound proxy");
            return Ok(proxy);
        }
        let addrs = sipwire_dns::resolve_addrs(&self.inner.dns, destination).await?;
        let (addr, transport) = addrs
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("resolution produced no targets"))?;
        Ok(Endpoint::new(transport.into(), addr))
    }

    /// Serializes and sends a response along the top Via, applying the
    /// `received`/`rport` rewrite and falling back to sent-by.
    pub async fn send_response(&self, response: &Response) -> Result<Endpoint> {
        let via_value = response
            .headers
            .get("Via")
            .ok_or_else(|| anyhow!("response missing Via header"))?;
        let via = ViaHeader::parse(via_value).map_err(|e| anyhow!("bad top Via: {}", e))?;
        let endpoint = self.response_destination(&via).await?;

        let payload = serialize_response(response);
        self.transmit(endpoint.transport, endpoint.addr, payload.clone(), None)
            .await?;
        self.hooks().response_sent(&endpoint, &payload);
        Ok(endpoint)
    }

    /// Computes where a response must go for the given top Via.
    pub async fn response_destination(&self, via: &ViaHeader) -> Result<Endpoint> {
        let kind: TransportKind = via.transport.into();

        let host: String = match via.received() {
            Some(received) => received.to_string(),
            None => via.host.to_string(),
        };
        let port = via
            .rport()
            .or(via.port)
            .unwrap_or(if kind.is_secure() { 5061 } else { 5060 });

        let ip = match host.parse() {
            Ok(ip) => ip,
            Err(_) => {
                let answer = match self.inner.dns.lookup(&host, QueryKind::A).await {
                    Some(answer) => Some(answer),
                    None => self.inner.dns.lookup(&host, QueryKind::Aaaa).await,
                };
                answer
                    .and_then(|answer| answer.ips().next())
                    .ok_or_else(|| anyhow!("cannot resolve Via host {}", host))?
            }
        };
        Ok(Endpoint::new(kind, SocketAddr::new(ip, port)))
    }

    /// Sends raw bytes over a channel of the given kind.
    pub async fn transmit(
        &self,
        kind: TransportKind,
        remote: SocketAddr,
        payload: Bytes,
        connection_hint: Option<u64>,
    ) -> Result<()> {
        let channel = self.select_channel(kind)?;
        channel.send(remote, payload, connection_hint).await
    }

    /// Stores bytes for periodic retransmission until released.
    ///
    /// The scheduler scans at T1 resolution, doubling the interval up to
    /// `cap` and invoking `observer` after each retransmission so the owning
    /// transaction applies its own timer semantics.
    pub fn send_reliable(
        &self,
        endpoint: Endpoint,
        payload: Bytes,
        initial_interval: Duration,
        cap: Duration,
        observer: Option<Box<dyn Fn(RetransmitEvent) + Send + Sync>>,
    ) -> RetransmitHandle {
        self.inner
            .retransmit
            .enqueue(endpoint, payload, initial_interval, cap, observer)
    }

    /// Trace hook passthrough for the dispatch layer.
    pub fn trace_request_received(&self, remote: &Endpoint, payload: &[u8]) {
        self.hooks().request_received(remote, payload);
    }

    /// Trace hook passthrough for the dispatch layer.
    pub fn trace_response_received(&self, remote: &Endpoint, payload: &[u8]) {
        self.hooks().response_received(remote, payload);
    }

    pub(crate) fn trace_retransmit(&self, remote: &Endpoint, payload: &[u8]) {
        self.hooks().retransmit(remote, payload);
    }

    /// Lists the currently registered channels.
    pub fn channels(&self) -> Vec<Arc<dyn Channel>> {
        self.inner
            .channels
            .read()
            .expect("channel registry lock")
            .clone()
    }

    /// Stops every channel, the retransmit scanner, and in-flight lookups.
    pub fn shutdown(&self) {
        info!("transport shutting down");
        self.inner.cancel.cancel();
        for channel in self.channels() {
            channel.close();
        }
        self.inner.dns.shutdown();
    }
}

impl Drop for TransportInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Binds a std TCP listener with reuse-address set and linger left at the OS
/// default so a restarted process can rebind immediately.
pub(crate) fn bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;

    let std_listener: std::net::TcpListener = socket.into();
    Ok(tokio::net::TcpListener::from_std(std_listener)?)
}

/// Shared connect-with-timeout for outbound streams, including the
/// local-self check.
pub(crate) async fn connect_stream(
    remote: SocketAddr,
    config_connect_timeout: Duration,
    self_guard: &SelfGuard,
) -> Result<tokio::net::TcpStream> {
    if self_guard.is_self(remote) {
        warn!(%remote, "refusing outbound stream to our own listener");
        return Err(TransportError::LocalLoopback(remote).into());
    }
    let stream = tokio::time::timeout(
        config_connect_timeout,
        tokio::net::TcpStream::connect(remote),
    )
    .await
    .map_err(|_| anyhow!("connect timeout after {:?} to {}", config_connect_timeout, remote))??;
    Ok(stream)
}
