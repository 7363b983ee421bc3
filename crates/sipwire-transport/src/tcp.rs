// sipwire - a SIP signaling core in Rust
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! TCP channel: a listener plus a table of accepted and outbound
//! connections, with lazy connects on send.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::conn::{next_id, spawn_stream_session, ConnectionTable};
use crate::udp::StateCell;
use crate::{
    bind_listener, connect_stream, Channel, ChannelState, InboundMessage, SelfGuard,
    TransportConfig, TransportKind,
};

/// Cap on concurrent inbound sessions per listener.
pub(crate) const MAX_CONCURRENT_SESSIONS: usize = 1024;

/// Depth of each connection's writer queue.
pub(crate) const WRITER_QUEUE_DEPTH: usize = 32;

pub struct TcpChannel {
    id: u64,
    local: SocketAddr,
    inbound: mpsc::Sender<InboundMessage>,
    table: Arc<ConnectionTable>,
    state: StateCell,
    self_guard: Arc<SelfGuard>,
    max_message_size: usize,
    idle_timeout: Duration,
    connect_timeout: Duration,
    cancel: CancellationToken,
}

impl TcpChannel {
    /// Binds the listener and starts accepting connections.
    pub async fn bind(
        addr: SocketAddr,
        inbound: mpsc::Sender<InboundMessage>,
        config: &TransportConfig,
        self_guard: Arc<SelfGuard>,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        let listener = bind_listener(addr)?;
        let local = listener.local_addr()?;
        info!(%local, "listening (tcp)");

        let channel = Arc::new(Self {
            id: next_id(),
            local,
            inbound,
            table: Arc::new(ConnectionTable::new()),
            state: StateCell::listening(),
            self_guard,
            max_message_size: config.max_message_size,
            idle_timeout: config.idle_timeout,
            connect_timeout: config.connect_timeout,
            cancel,
        });

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
                        warn!(%e, "tcp accept error");
                        continue;
                    }
                };
                let Ok(permit) = limiter.clone().try_acquire_owned() else {
                    warn!(%peer, "tcp session limit reached; dropping connection");
                    continue;
                };
                accept_channel.adopt(stream, peer, Some(permit));
            }
        });

        Ok(channel)
    }

    /// Registers a stream (accepted or connected) and spawns its session.
    fn adopt(
        &self,
        stream: tokio::net::TcpStream,
        peer: SocketAddr,
        permit: Option<tokio::sync::OwnedSemaphorePermit>,
    ) -> crate::conn::ConnEntry {
        let (writer_tx, writer_rx) = mpsc::channel(WRITER_QUEUE_DEPTH);
        let entry = self
            .table
            .insert(peer, writer_tx, self.cancel.child_token());
        let hold = permit;
        let session_cancel = entry.cancel.clone();
        if hold.is_some() {
            // Tie the accept permit to the session lifetime.
            tokio::spawn(async move {
                let _hold = hold;
                session_cancel.cancelled().await;
            });
        }
        spawn_stream_session(
            stream,
            TransportKind::Tcp,
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

    /// Number of live connections (accepted plus outbound).
    pub fn connection_count(&self) -> usize {
        self.table.len()
    }
}

#[async_trait::async_trait]
impl Channel for TcpChannel {
    fn id(&self) -> u64 {
        self.id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
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

        // Lazy outbound connect.
        let stream = connect_stream(remote, self.connect_timeout, &self.self_guard).await?;
        let entry = self.adopt(stream, remote, None);
        entry
            .writer
            .send(payload)
            .await
            .map_err(|_| anyhow!("fresh connection writer closed"))
    }

    fn close(&self) {
        self.state.set(ChannelState::Closed);
        self.cancel.cancel();
        self.table.close_all();
    }
}
