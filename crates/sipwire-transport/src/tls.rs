// sipwire - a SIP signaling core in Rust
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! TLS channel: TCP wrapped in rustls. The handshake completes before any
//! SIP bytes flow; certificate policy is supplied by the caller through the
//! rustls configs.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use tokio::sync::{mpsc, Semaphore};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{rustls, TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::conn::{next_id, spawn_stream_session, ConnectionTable};
use crate::tcp::{MAX_CONCURRENT_SESSIONS, WRITER_QUEUE_DEPTH};
use crate::udp::StateCell;
use crate::{
    bind_listener, connect_stream, Channel, ChannelState, InboundMessage, SelfGuard,
    TransportConfig, TransportKind,
};

/// Client-side TLS material for outbound sips connections.
#[derive(Clone)]
pub struct TlsClientContext {
    pub config: Arc<rustls::ClientConfig>,
    /// SNI override; the peer IP is used when absent.
    pub server_name: Option<String>,
}

pub struct TlsChannel {
    id: u64,
    local: SocketAddr,
    inbound: mpsc::Sender<InboundMessage>,
    table: Arc<ConnectionTable>,
    state: StateCell,
    self_guard: Arc<SelfGuard>,
    client: Option<TlsClientContext>,
    max_message_size: usize,
    idle_timeout: Duration,
    connect_timeout: Duration,
    handshake_timeout: Duration,
    cancel: CancellationToken,
}

impl TlsChannel {
    /// Binds the listener and starts accepting TLS sessions.
    #[allow(clippy::too_many_arguments)]
    pub async fn bind(
        addr: SocketAddr,
        server: Arc<rustls::ServerConfig>,
        client: Option<TlsClientContext>,
        inbound: mpsc::Sender<InboundMessage>,
        config: &TransportConfig,
        self_guard: Arc<SelfGuard>,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        let listener = bind_listener(addr)?;
        let local = listener.local_addr()?;
        info!(%local, "listening (tls)");

        let channel = Arc::new(Self {
            id: next_id(),
            local,
            inbound,
            table: Arc::new(ConnectionTable::new()),
            state: StateCell::listening(),
            self_guard,
            client,
            max_message_size: config.max_message_size,
            idle_timeout: config.idle_timeout,
            connect_timeout: config.connect_timeout,
            handshake_timeout: config.handshake_timeout,
            cancel,
        });

        let acceptor = TlsAcceptor::from(server);
        let accept_channel = channel.clone();
        tokio::spawn(async move {
            let limiter = Arc::new(Semaphore::new(MAX_CONCURRENT_SESSIONS));
            loop {
                let accepted = tokio::select! {
                    accepted = listener.accept() => accepted,
                    _ = accept_channel.cancel.cancelled() => break,
                };
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(%e, "tls accept error");
                        continue;
                    }
                };
                let Ok(permit) = limiter.clone().try_acquire_owned() else {
                    warn!(%peer, "tls session limit reached; dropping connection");
                    continue;
                };

                let acceptor = acceptor.clone();
                let channel = accept_channel.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let handshake =
                        tokio::time::timeout(channel.handshake_timeout, acceptor.accept(stream))
                            .await;
                    match handshake {
                        Ok(Ok(tls_stream)) => {
                            channel.adopt(tls_stream, peer);
                        }
                        Ok(Err(e)) => warn!(%peer, %e, "tls handshake failed"),
                        Err(_) => warn!(%peer, "tls handshake timed out"),
                    }
                });
            }
        });

        Ok(channel)
    }

    fn adopt<S>(&self, stream: S, peer: SocketAddr) -> crate::conn::ConnEntry
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (writer_tx, writer_rx) = mpsc::channel(WRITER_QUEUE_DEPTH);
        let entry = self
            .table
            .insert(peer, writer_tx, self.cancel.child_token());
        spawn_stream_session(
            stream,
            TransportKind::Tls,
            self.local,
            peer,
            entry.clone(),
            writer_rx,
            self.inbound.clone(),
            self.table.clone(),
            self.max_message_size,
            self.idle_timeout,
        );
        entry
    }

    /// Opens an outbound TLS connection: TCP connect, then handshake, both
    /// bounded by their timeouts.
    async fn connect(&self, remote: SocketAddr) -> Result<crate::conn::ConnEntry> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| anyhow!("tls channel has no client configuration"))?;

        let tcp = connect_stream(remote, self.connect_timeout, &self.self_guard).await?;

        let name = client
            .server_name
            .clone()
            .unwrap_or_else(|| remote.ip().to_string());
        let server_name =
            ServerName::try_from(name).map_err(|_| anyhow!("invalid TLS server name"))?;
        let connector = TlsConnector::from(client.config.clone());
        let tls_stream = tokio::time::timeout(
            self.handshake_timeout,
            connector.connect(server_name, tcp),
        )
        .await
        .map_err(|_| anyhow!("tls handshake timeout to {}", remote))??;

        Ok(self.adopt(tls_stream, remote))
    }

    /// Number of live TLS connections.
    pub fn connection_count(&self) -> usize {
        self.table.len()
    }
}

#[async_trait::async_trait]
impl Channel for TlsChannel {
    fn id(&self) -> u64 {
        self.id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Tls
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn state(&self) -> ChannelState {
        self.state.get()
    }

    async fn send(
        &self,
        remote: SocketAddr,
        payload: Bytes,
        connection_hint: Option<u64>,
    ) -> Result<()> {
        if self.state.get() != ChannelState::Listening {
            return Err(crate::TransportError::ChannelUnavailable.into());
        }

        if let Some(hint) = connection_hint {
            if let Some(entry) = self.table.by_id(hint) {
                entry.touch();
                return entry
                    .writer
                    .send(payload)
                    .await
                    .map_err(|_| anyhow!("connection {} writer closed", hint));
            }
        }

        if let Some(entry) = self.table.by_peer(remote) {
            entry.touch();
            if entry.writer.send(payload.clone()).await.is_ok() {
                return Ok(());
            }
            self.table.remove(remote, entry.id);
        }

        let entry = self.connect(remote).await?;
        entry
            .writer
            .send(payload)
            .await
            .map_err(|_| anyhow!("fresh tls connection writer closed"))
    }

    fn close(&self) {
        self.state.set(ChannelState::Closed);
        self.cancel.cancel();
        self.table.close_all();
    }
}

/// Loads a rustls server config from PEM certificate and key files.
///
/// SNI is ignored deliberately: SIP peers routinely present IP addresses as
/// the server name, which SNI-aware setups would reject.
pub fn load_server_config(
    cert_path: &str,
    key_path: &str,
) -> Result<Arc<rustls::ServerConfig>> {
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer};
    use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
    use std::fs::File;
    use std::io::BufReader;

    let mut cert_reader = BufReader::new(File::open(cert_path)?);
    let certs = certs(&mut cert_reader)
        .collect::<Result<Vec<CertificateDer<'static>>, _>>()
        .map_err(|e| anyhow!("invalid certificate: {e}"))?;
    if certs.is_empty() {
        return Err(anyhow!("no certificates found in {}", cert_path));
    }

    let mut key_reader = BufReader::new(File::open(key_path)?);
    let mut keys = pkcs8_private_keys(&mut key_reader)
        .collect::<Result<Vec<PrivatePkcs8KeyDer<'static>>, _>>()
        .map_err(|e| anyhow!("invalid private key: {e}"))?
        .into_iter()
        .map(PrivateKeyDer::from)
        .collect::<Vec<_>>();
    if keys.is_empty() {
        let mut key_reader = BufReader::new(File::open(key_path)?);
        keys = rsa_private_keys(&mut key_reader)
            .collect::<Result<Vec<PrivatePkcs1KeyDer<'static>>, _>>()
            .map_err(|e| anyhow!("invalid private key: {e}"))?
            .into_iter()
            .map(PrivateKeyDer::from)
            .collect();
    }
    let key = keys
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no private keys found in {}", key_path))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow!("failed to build TLS config: {e}"))?;
    Ok(Arc::new(config))
}
