// sipwire - a SIP signaling core in Rust
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! WebSocket channel (RFC 7118). One binary frame carries one SIP message;
//! frame reassembly happens below the SIP layer inside tungstenite. The
//! upgrade must negotiate the `sip` subprotocol.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Semaphore};
use tokio_rustls::{rustls, TlsAcceptor};
use tokio_tungstenite::{
    accept_hdr_async, connect_async,
    tungstenite::{
        self,
        client::IntoClientRequest,
        handshake::server::{ErrorResponse, Request, Response},
        http::{header::HeaderValue, StatusCode},
    },
    WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::conn::{next_id, ConnEntry, ConnectionTable};
use crate::tcp::{MAX_CONCURRENT_SESSIONS, WRITER_QUEUE_DEPTH};
use crate::udp::StateCell;
use crate::{
    bind_listener, Channel, ChannelState, Endpoint, InboundMessage, SelfGuard, TransportConfig,
    TransportKind,
};

pub struct WsChannel {
    id: u64,
    kind: TransportKind,
    local: SocketAddr,
    inbound: mpsc::Sender<InboundMessage>,
    table: Arc<ConnectionTable>,
    state: StateCell,
    self_guard: Arc<SelfGuard>,
    idle_timeout: Duration,
    connect_timeout: Duration,
    cancel: CancellationToken,
}

impl WsChannel {
    /// Binds the listener; providing a TLS server config makes this a WSS
    /// channel with the handshake performed before the HTTP upgrade.
    pub async fn bind(
        addr: SocketAddr,
        tls: Option<Arc<rustls::ServerConfig>>,
        inbound: mpsc::Sender<InboundMessage>,
        config: &TransportConfig,
        self_guard: Arc<SelfGuard>,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        let listener = bind_listener(addr)?;
        let local = listener.local_addr()?;
        let kind = if tls.is_some() {
            TransportKind::Wss
        } else {
            TransportKind::Ws
        };
        info!(%local, "listening ({})", kind.as_str());

        let channel = Arc::new(Self {
            id: next_id(),
            kind,
            local,
            inbound,
            table: Arc::new(ConnectionTable::new()),
            state: StateCell::listening(),
            self_guard,
            idle_timeout: config.idle_timeout,
            connect_timeout: config.connect_timeout,
            cancel,
        });

        let acceptor = tls.map(TlsAcceptor::from);
        let handshake_timeout = config.handshake_timeout;
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
                        warn!(%e, "ws accept error");
                        continue;
                    }
                };
                let Ok(permit) = limiter.clone().try_acquire_owned() else {
                    warn!(%peer, "ws session limit reached; dropping connection");
                    continue;
                };

                let acceptor = acceptor.clone();
                let channel = accept_channel.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    match acceptor {
                        Some(acceptor) => {
                            let handshake = tokio::time::timeout(
                                handshake_timeout,
                                acceptor.accept(stream),
                            )
                            .await;
                            match handshake {
                                Ok(Ok(tls_stream)) => channel.upgrade(tls_stream, peer).await,
                                Ok(Err(e)) => warn!(%peer, %e, "wss tls handshake failed"),
                                Err(_) => warn!(%peer, "wss tls handshake timed out"),
                            }
                        }
                        None => channel.upgrade(stream, peer).await,
                    }
                });
            }
        });

        Ok(channel)
    }

    /// Performs the HTTP upgrade, requiring the `sip` subprotocol.
    async fn upgrade<S>(&self, stream: S, peer: SocketAddr)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let mut selected_sip = false;
        let ws = accept_hdr_async(stream, |req: &Request, mut resp: Response| {
            if let Some(value) = req.headers().get("Sec-WebSocket-Protocol") {
                if let Ok(protocols) = value.to_str() {
                    if protocols
                        .split(',')
                        .any(|p| p.trim().eq_ignore_ascii_case("sip"))
                    {
                        if let Ok(header_value) = "sip".parse() {
                            resp.headers_mut()
                                .append("Sec-WebSocket-Protocol", header_value);
                            selected_sip = true;
                        }
                    }
                }
            }
            if !selected_sip {
                return Err(subprotocol_error());
            }
            Ok(resp)
        })
        .await;

        match ws {
            Ok(ws) => self.adopt(ws, peer),
            Err(e) => warn!(%peer, %e, "ws upgrade failed"),
        }
    }

    fn adopt<S>(&self, ws: WebSocketStream<S>, peer: SocketAddr)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (writer_tx, writer_rx) = mpsc::channel(WRITER_QUEUE_DEPTH);
        let entry = self
            .table
            .insert(peer, writer_tx, self.cancel.child_token());
        spawn_ws_session(
            ws,
            self.kind,
            self.local,
            peer,
            entry,
            writer_rx,
            self.inbound.clone(),
            self.table.clone(),
            self.idle_timeout,
        );
    }

    /// Opens an outbound plaintext WebSocket connection, negotiating `sip`.
    async fn connect(&self, remote: SocketAddr) -> Result<ConnEntry> {
        if self.kind == TransportKind::Wss {
            // Outbound WSS rides existing inbound connections; registrations
            // from the edge establish them (RFC 7118 §5.4 direction).
            return Err(anyhow!("no established wss connection to {}", remote));
        }
        if self.self_guard.is_self(remote) {
            return Err(crate::TransportError::LocalLoopback(remote).into());
        }

        let mut request = format!("ws://{}/", remote).into_client_request()?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("sip"));
        let connect = tokio::time::timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| anyhow!("ws connect timeout to {}", remote))?;
        let (ws, response) = connect?;
        ensure_sip_subprotocol(&response)?;

        let (writer_tx, writer_rx) = mpsc::channel(WRITER_QUEUE_DEPTH);
        let entry = self
            .table
            .insert(remote, writer_tx, self.cancel.child_token());
        spawn_ws_session(
            ws,
            self.kind,
            self.local,
            remote,
            entry.clone(),
            writer_rx,
            self.inbound.clone(),
            self.table.clone(),
            self.idle_timeout,
        );
        Ok(entry)
    }

    /// Number of live WebSocket connections.
    pub fn connection_count(&self) -> usize {
        self.table.len()
    }
}

#[async_trait::async_trait]
impl Channel for WsChannel {
    fn id(&self) -> u64 {
        self.id
    }

    fn kind(&self) -> TransportKind {
        self.kind
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
            .map_err(|_| anyhow!("fresh ws connection writer closed"))
    }

    fn close(&self) {
        self.state.set(ChannelState::Closed);
        self.cancel.cancel();
        self.table.close_all();
    }
}

/// Pumps one WebSocket connection: outbound bytes become binary frames,
/// inbound binary (or text) frames become SIP messages, pings are answered.
#[allow(clippy::too_many_arguments)]
fn spawn_ws_session<S>(
    ws: WebSocketStream<S>,
    kind: TransportKind,
    local: SocketAddr,
    peer: SocketAddr,
    entry: ConnEntry,
    mut writer_rx: mpsc::Receiver<Bytes>,
    inbound: mpsc::Sender<InboundMessage>,
    table: Arc<ConnectionTable>,
    idle_timeout: Duration,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let (mut sink, mut stream) = ws.split();
        let conn_id = entry.id;
        let writer_tx = entry.writer.clone();
        let cancel = entry.cancel.clone();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                outbound = writer_rx.recv() => {
                    let Some(data) = outbound else { break };
                    if let Err(e) = sink
                        .send(tungstenite::Message::Binary(data.to_vec()))
                        .await
                    {
                        warn!(%peer, %e, "ws send error");
                        break;
                    }
                    entry.touch();
                }
                frame = tokio::time::timeout(idle_timeout, stream.next()) => {
                    let frame = match frame {
                        Ok(frame) => frame,
                        Err(_) => {
                            if entry.idle_for() >= idle_timeout {
                                debug!(%peer, "closing idle ws connection");
                                break;
                            }
                            continue;
                        }
                    };
                    match frame {
                        Some(Ok(tungstenite::Message::Binary(data))) => {
                            entry.touch();
                            let message = InboundMessage {
                                local: Endpoint::new(kind, local),
                                remote: Endpoint::new(kind, peer).with_connection(conn_id),
                                payload: Bytes::from(data),
                                writer: Some(writer_tx.clone()),
                            };
                            if inbound.send(message).await.is_err() {
                                warn!(%peer, "inbound queue dropped; closing ws");
                                break;
                            }
                        }
                        Some(Ok(tungstenite::Message::Text(text))) => {
                            entry.touch();
                            let message = InboundMessage {
                                local: Endpoint::new(kind, local),
                                remote: Endpoint::new(kind, peer).with_connection(conn_id),
                                payload: Bytes::from(text.into_bytes()),
                                writer: Some(writer_tx.clone()),
                            };
                            if inbound.send(message).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(tungstenite::Message::Ping(payload))) => {
                            if sink.send(tungstenite::Message::Pong(payload)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(tungstenite::Message::Pong(_))) => {}
                        Some(Ok(tungstenite::Message::Close(_))) => break,
                        Some(Ok(tungstenite::Message::Frame(_))) => {}
                        Some(Err(e)) => {
                            warn!(%peer, %e, "ws read error");
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        let _ = sink.close().await;
        table.remove(peer, conn_id);
        cancel.cancel();
    });
}

fn subprotocol_error() -> ErrorResponse {
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .body(Some("Missing Sec-WebSocket-Protocol: sip".to_string()))
        .unwrap_or_else(|_| {
            Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(None)
                .expect("static response")
        })
}

fn ensure_sip_subprotocol(
    response: &tungstenite::handshake::client::Response,
) -> Result<()> {
    match response.headers().get("Sec-WebSocket-Protocol") {
        Some(value) => {
            let proto = value
                .to_str()
                .map_err(|_| anyhow!("invalid Sec-WebSocket-Protocol header"))?;
            if proto.eq_ignore_ascii_case("sip") {
                Ok(())
            } else {
                Err(anyhow!("server selected subprotocol {:?}, wanted sip", proto))
            }
        }
        None => Err(anyhow!("server did not negotiate Sec-WebSocket-Protocol: sip")),
    }
}
